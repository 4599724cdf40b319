//! # candletrie
//!
//! Persistent, pattern-indexed memory of observed candlestick sequences.
//!
//! Every completed OHLCV period submitted to the [`PatternEngine`] is either
//! recognized as a previously seen node (reinforcing its frequency) or
//! recorded as a new node in an append-only binary store. Nodes form chains:
//! a root node starts an observed sequence, its children record "what
//! happened next". Recognition is fuzzy: a blended similarity score over
//! price shape and behavioral fields decides whether an incoming candle *is*
//! a stored node.
//!
//! ## Quick Start
//!
//! ```no_run
//! use candletrie::prelude::*;
//!
//! fn main() -> candletrie::Result<()> {
//!     let store = NodeStore::open("MSFT.idx", "MSFT.bin")?;
//!     let mut engine = PatternEngine::new(store);
//!
//!     let advance = engine.submit(Candle::new(
//!         "MSFT", 1_752_672_600, 140.0, 142.0, 139.0, 141.2, 500_000.0,
//!     ))?;
//!     println!("{advance:?}");
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod feed;
pub mod similarity;
pub mod store;

pub mod prelude {
    pub use crate::{
        // Engine
        engine::{Advance, EngineConfig, PathState, PatternEngine},
        // Feed helpers
        feed::{FeedMessage, PeriodCloser},
        // Parallel replay
        replay_parallel,
        // Scoring
        similarity::{MatchScore, Scorer},
        // Store
        store::{IndexEntry, NodeKey, NodeRecord, NodeStore},
        // Types
        Candle,
        CandleData,
        // Errors
        Error,
        ReplayFailure,
        ReplayPlan,
        ReplaySummary,
        Result,
    };
}

// ============================================================
// ERRORS
// ============================================================

pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while parsing, scoring, or persisting candles.
///
/// None of these are fatal to a running engine: parse failures drop the
/// offending record, I/O failures abort the single operation and leave the
/// engine ready for the next submit.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("offset {offset} out of range (data file is {len} bytes)")]
    OffsetOutOfRange { offset: u64, len: u64 },

    #[error("corrupt store: {0}")]
    CorruptStore(String),
}

// ============================================================
// CANDLE DATA TRAIT
// ============================================================

/// Accessor trait for the nine numeric fields the similarity scorer compares.
///
/// Implemented by the transient [`Candle`] and by the persisted
/// [`store::NodeRecord`], so a live update can be scored directly against a
/// stored node.
pub trait CandleData {
    fn open(&self) -> f64;
    fn high(&self) -> f64;
    fn low(&self) -> f64;
    fn close(&self) -> f64;
    fn volume(&self) -> f64;

    /// High minus the top of the body.
    #[inline]
    fn top_wick(&self) -> f64 {
        self.high() - self.open().max(self.close())
    }

    /// Bottom of the body minus the low.
    #[inline]
    fn bottom_wick(&self) -> f64 {
        self.open().min(self.close()) - self.low()
    }

    /// Close minus previous close. `None` until a prior record exists.
    #[inline]
    fn delta(&self) -> Option<f64> {
        None
    }

    /// Close / (previous close − 1). `None` until a prior record exists.
    #[inline]
    fn percent_change(&self) -> Option<f64> {
        None
    }

    /// True when every field (including present derived fields) is finite.
    fn is_fully_numeric(&self) -> bool {
        let raw = [
            self.open(),
            self.high(),
            self.low(),
            self.close(),
            self.volume(),
            self.top_wick(),
            self.bottom_wick(),
        ];
        raw.iter().all(|v| v.is_finite())
            && self.delta().map_or(true, f64::is_finite)
            && self.percent_change().map_or(true, f64::is_finite)
    }
}

// ============================================================
// CANDLE
// ============================================================

/// A single completed period's candlestick, as delivered by a feed.
///
/// `delta` and `percent_change` are filled in by the engine from its recent
/// history; a candle fresh from the feed carries `None` for both.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Candle {
    pub symbol: String,
    /// Unix seconds for the period start.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub delta: Option<f64>,
    pub percent_change: Option<f64>,
}

impl Candle {
    pub fn new(
        symbol: impl Into<String>,
        timestamp: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            delta: None,
            percent_change: None,
        }
    }

    /// Builds a candle from textual field values, as they arrive on the wire.
    pub fn from_text(
        symbol: impl Into<String>,
        timestamp: i64,
        open: &str,
        high: &str,
        low: &str,
        close: &str,
        volume: &str,
    ) -> Result<Self> {
        Ok(Self::new(
            symbol,
            timestamp,
            parse_field("open", open)?,
            parse_field("high", high)?,
            parse_field("low", low)?,
            parse_field("close", close)?,
            parse_field("volume", volume)?,
        ))
    }

    /// Rejects candles with any non-finite field.
    ///
    /// Every field must be numeric before the candle may be compared against
    /// stored nodes or persisted as one.
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
            ("volume", self.volume),
        ];
        for (name, value) in fields {
            if !value.is_finite() {
                return Err(Error::Parse(format!("{name} is not a finite number")));
            }
        }
        for (name, value) in [("delta", self.delta), ("percent_change", self.percent_change)] {
            if let Some(v) = value {
                if !v.is_finite() {
                    return Err(Error::Parse(format!("{name} is not a finite number")));
                }
            }
        }
        Ok(())
    }
}

impl CandleData for Candle {
    fn open(&self) -> f64 {
        self.open
    }

    fn high(&self) -> f64 {
        self.high
    }

    fn low(&self) -> f64 {
        self.low
    }

    fn close(&self) -> f64 {
        self.close
    }

    fn volume(&self) -> f64 {
        self.volume
    }

    fn delta(&self) -> Option<f64> {
        self.delta
    }

    fn percent_change(&self) -> Option<f64> {
        self.percent_change
    }
}

fn parse_field(name: &str, raw: &str) -> Result<f64> {
    raw.trim()
        .parse::<f64>()
        .map_err(|_| Error::Parse(format!("non-numeric {name} value '{raw}'")))
}

// ============================================================
// PARALLEL REPLAY
// ============================================================

use rayon::prelude::*;
use std::path::PathBuf;

use crate::engine::PatternEngine;
use crate::store::NodeStore;

/// One symbol's worth of updates to replay into its own store.
#[derive(Debug, Clone)]
pub struct ReplayPlan {
    pub symbol: String,
    pub updates: Vec<Candle>,
    pub index_path: PathBuf,
    pub data_path: PathBuf,
}

/// Outcome of replaying a single plan.
#[derive(Debug)]
pub struct ReplaySummary {
    pub symbol: String,
    pub accepted: usize,
    pub dropped: usize,
    pub nodes: u64,
}

/// A plan whose store could not be opened.
#[derive(Debug)]
pub struct ReplayFailure {
    pub symbol: String,
    pub error: Error,
}

/// Replays several symbol feeds concurrently, one engine and store pair per
/// symbol.
///
/// Each store stays single-writer; parallelism is across stores, never within
/// one. Individual bad records are dropped and counted, matching the engine's
/// own availability semantics.
pub fn replay_parallel(plans: Vec<ReplayPlan>) -> (Vec<ReplaySummary>, Vec<ReplayFailure>) {
    let results: Vec<_> = plans
        .into_par_iter()
        .map(|plan| {
            let store = match NodeStore::open(&plan.index_path, &plan.data_path) {
                Ok(store) => store,
                Err(error) => {
                    return Err(ReplayFailure {
                        symbol: plan.symbol,
                        error,
                    })
                }
            };
            let mut engine = PatternEngine::new(store);

            let mut accepted = 0;
            let mut dropped = 0;
            for update in plan.updates {
                match engine.submit(update) {
                    Ok(_) => accepted += 1,
                    Err(_) => dropped += 1,
                }
            }

            Ok(ReplaySummary {
                symbol: plan.symbol,
                accepted,
                dropped,
                nodes: engine.store().len(),
            })
        })
        .collect();

    let mut summaries = Vec::new();
    let mut failures = Vec::new();
    for result in results {
        match result {
            Ok(s) => summaries.push(s),
            Err(f) => failures.push(f),
        }
    }

    (summaries, failures)
}

// ============================================================
// TESTS
// ============================================================
