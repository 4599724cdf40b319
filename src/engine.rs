//! Traversal state machine recording incoming candles into the node store.
//!
//! Each submitted candle either reinforces a previously seen node (first
//! candidate in append order to clear the match threshold wins) or becomes a
//! new node. While no path is active, candidates are the root nodes; once a
//! node has been entered, candidates are that node's children, so matched
//! sequences extend into chains.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::similarity::Scorer;
use crate::store::{NodeKey, NodeStore};
use crate::{Candle, Error, Result};

pub const DEFAULT_HISTORY_CAP: usize = 50;
pub const DEFAULT_MAX_PATH_LEN: usize = 32;

// ============================================================
// CONFIG / STATE
// ============================================================

/// Engine tuning knobs.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct EngineConfig {
    /// Bound on the in-memory recent history used to derive momentum fields.
    pub history_cap: usize,
    /// Path length at which the engine abandons the current chain and
    /// resumes a root search with the next candle.
    pub max_path_len: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_cap: DEFAULT_HISTORY_CAP,
            max_path_len: DEFAULT_MAX_PATH_LEN,
        }
    }
}

/// Where the engine currently sits in the pattern tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    /// No active path; the next candle is matched against root nodes.
    Searching,
    /// Inside a chain; the next candle is matched against this node's
    /// children. `depth` counts nodes along the current path.
    AtNode {
        key: NodeKey,
        offset: u64,
        depth: usize,
    },
}

/// What a successful submit did to the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Advance {
    MatchedRoot {
        key: NodeKey,
        offset: u64,
        frequency: u32,
        percentage: f64,
    },
    NewRoot {
        key: NodeKey,
        offset: u64,
    },
    MatchedChild {
        key: NodeKey,
        offset: u64,
        frequency: u32,
        percentage: f64,
    },
    NewChild {
        key: NodeKey,
        offset: u64,
        parent: NodeKey,
    },
}

// ============================================================
// ENGINE
// ============================================================

/// Pattern engine: bounded history + path state + store orchestration.
///
/// Synchronous and single-writer; a concurrent host must serialize calls.
/// Failures drop the offending record but never poison the engine: the
/// state and history stay consistent for the next submit.
pub struct PatternEngine {
    store: NodeStore,
    scorer: Scorer,
    config: EngineConfig,
    history: VecDeque<Candle>,
    state: PathState,
}

impl PatternEngine {
    pub fn new(store: NodeStore) -> Self {
        Self {
            store,
            scorer: Scorer::default(),
            config: EngineConfig::default(),
            history: VecDeque::with_capacity(DEFAULT_HISTORY_CAP),
            state: PathState::Searching,
        }
    }

    pub fn with_parts(store: NodeStore, scorer: Scorer, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            scorer,
            config,
            history: VecDeque::with_capacity(config.history_cap),
            state: PathState::Searching,
        })
    }

    /// Processes one completed period.
    ///
    /// Derives momentum fields from the most recent history entry, then
    /// either advances along a matching stored node (bumping its frequency)
    /// or appends a new node at the current position. Parse and I/O failures
    /// are logged and returned; the record is dropped from matching and not
    /// retried.
    pub fn submit(&mut self, mut update: Candle) -> Result<Advance> {
        if let Err(err) = update.validate() {
            warn!(symbol = %update.symbol, error = %err, "rejected candle");
            return Err(err);
        }

        if let Some(prev) = self.history.back() {
            update.delta = Some(update.close - prev.close);
            // Close / (previous close − 1), as historically computed.
            update.percent_change = Some(update.close / (prev.close - 1.0));
        }

        // Momentum distances stay at their forced default until two prior
        // records exist, so score against a momentum-stripped view.
        let scoring = if self.history.len() < 2 {
            let mut cold = update.clone();
            cold.delta = None;
            cold.percent_change = None;
            cold
        } else {
            update.clone()
        };

        // A derived field can still blow up (previous close of exactly 1
        // makes percent_change infinite). The candle stays in history so
        // later deltas have an anchor, but it is dropped from matching.
        let derived_ok = update.validate();
        self.push_history(update.clone());
        if let Err(err) = derived_ok {
            warn!(symbol = %update.symbol, error = %err, "derived fields not numeric, record dropped");
            return Err(err);
        }

        if let PathState::AtNode { depth, .. } = self.state {
            if depth >= self.config.max_path_len {
                debug!(depth, "path reached max length, resuming root search");
                self.state = PathState::Searching;
            }
        }

        let result = match self.state {
            PathState::Searching => self.step_root(&scoring, &update),
            PathState::AtNode { key, depth, .. } => self.step_child(key, depth, &scoring, &update),
        };
        if let Err(err) = &result {
            warn!(symbol = %update.symbol, error = %err, "submit failed, record dropped");
        }
        result
    }

    fn step_root(&mut self, scoring: &Candle, update: &Candle) -> Result<Advance> {
        for offset in self.store.root_offsets() {
            let node = self.store.read_node_at(offset)?;
            let score = self.scorer.score(scoring, &node);
            if score.is_match {
                let frequency = self.store.bump_frequency(offset)?;
                self.state = PathState::AtNode {
                    key: node.key,
                    offset,
                    depth: 1,
                };
                debug!(key = %node.key, percentage = score.percentage, "matched root");
                return Ok(Advance::MatchedRoot {
                    key: node.key,
                    offset,
                    frequency,
                    percentage: score.percentage,
                });
            }
        }

        let (key, offset) = self.store.append_node(update, None)?;
        self.state = PathState::AtNode {
            key,
            offset,
            depth: 1,
        };
        Ok(Advance::NewRoot { key, offset })
    }

    fn step_child(
        &mut self,
        parent: NodeKey,
        depth: usize,
        scoring: &Candle,
        update: &Candle,
    ) -> Result<Advance> {
        for offset in self.store.child_offsets(parent) {
            let node = self.store.read_node_at(offset)?;
            let score = self.scorer.score(scoring, &node);
            if score.is_match {
                let frequency = self.store.bump_frequency(offset)?;
                self.state = PathState::AtNode {
                    key: node.key,
                    offset,
                    depth: depth + 1,
                };
                debug!(key = %node.key, percentage = score.percentage, "matched child");
                return Ok(Advance::MatchedChild {
                    key: node.key,
                    offset,
                    frequency,
                    percentage: score.percentage,
                });
            }
        }

        let (key, offset) = self.store.append_node(update, Some(parent))?;
        self.state = PathState::AtNode {
            key,
            offset,
            depth: depth + 1,
        };
        Ok(Advance::NewChild {
            key,
            offset,
            parent,
        })
    }

    fn push_history(&mut self, candle: Candle) {
        if self.history.len() == self.config.history_cap {
            self.history.pop_front();
        }
        self.history.push_back(candle);
    }

    pub fn state(&self) -> PathState {
        self.state
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    /// Flushes and releases the underlying store.
    pub fn close(self) -> Result<()> {
        self.store.close()
    }
}

// Guard against engines constructed with a zero cap.
impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.history_cap == 0 {
            return Err(Error::InvalidConfig("history_cap must be > 0".into()));
        }
        if self.max_path_len == 0 {
            return Err(Error::InvalidConfig("max_path_len must be > 0".into()));
        }
        Ok(())
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64, volume: f64) -> Candle {
        Candle::new("TEST", 0, close - 0.2, close + 0.3, close - 0.5, close, volume)
    }

    fn engine_in(dir: &tempfile::TempDir) -> PatternEngine {
        let store =
            NodeStore::open(dir.path().join("eng.idx"), dir.path().join("eng.bin")).unwrap();
        PatternEngine::new(store)
    }

    #[test]
    fn test_first_record_creates_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(&dir);

        let advance = engine.submit(candle(100.0, 1000.0)).unwrap();
        assert!(matches!(advance, Advance::NewRoot { .. }));
        assert_eq!(engine.store().len(), 1);
        assert!(matches!(engine.state(), PathState::AtNode { depth: 1, .. }));
    }

    #[test]
    fn test_identical_record_matches_then_branches() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(&dir);

        let root = engine.submit(candle(100.0, 1000.0)).unwrap();
        let Advance::NewRoot { offset: root_offset, .. } = root else {
            panic!("expected new root, got {root:?}");
        };

        // Second identical candle: the engine is already at the root, so
        // candidates are the root's (empty) children and the record
        // branches instead of re-matching the root.
        let advance = engine.submit(candle(100.0, 1000.0)).unwrap();
        assert!(matches!(advance, Advance::NewChild { .. }));
        assert_eq!(engine.store().len(), 2);

        // The root keeps frequency 1; nothing matched it after creation.
        assert_eq!(engine.store().read_node_at(root_offset).unwrap().frequency, 1);
    }

    #[test]
    fn test_matching_root_bumps_frequency() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            NodeStore::open(dir.path().join("pre.idx"), dir.path().join("pre.bin")).unwrap();
        let mut engine = PatternEngine::with_parts(
            store,
            Scorer::default(),
            EngineConfig {
                max_path_len: 1,
                ..EngineConfig::default()
            },
        )
        .unwrap();

        engine.submit(candle(100.0, 1000.0)).unwrap();
        // Path is at max length, so this identical candle re-runs the root
        // search and reinforces the existing root.
        let advance = engine.submit(candle(100.0, 1000.0)).unwrap();
        match advance {
            Advance::MatchedRoot { frequency, percentage, .. } => {
                assert_eq!(frequency, 2);
                assert!(percentage >= 85.0);
            }
            other => panic!("expected matched root, got {other:?}"),
        }
        assert_eq!(engine.store().len(), 1);
    }

    #[test]
    fn test_path_reset_creates_sibling_roots() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            NodeStore::open(dir.path().join("rst.idx"), dir.path().join("rst.bin")).unwrap();
        let mut engine = PatternEngine::with_parts(
            store,
            Scorer::default(),
            EngineConfig {
                max_path_len: 1,
                ..EngineConfig::default()
            },
        )
        .unwrap();

        // Wildly different candles so nothing ever matches.
        engine.submit(candle(100.0, 1_000.0)).unwrap();
        engine.submit(candle(500.0, 900_000.0)).unwrap();
        engine.submit(candle(3.0, 42.0)).unwrap();

        assert_eq!(engine.store().root_offsets().len(), 3);
        assert_eq!(engine.store().len(), 3);
    }

    #[test]
    fn test_rejected_record_leaves_engine_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_in(&dir);

        engine.submit(candle(100.0, 1000.0)).unwrap();
        let state = engine.state();

        let err = engine
            .submit(Candle::new("TEST", 0, 100.0, f64::NAN, 99.0, 100.0, 1000.0))
            .unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
        assert_eq!(engine.store().len(), 1);
        assert_eq!(engine.state(), state);
        assert_eq!(engine.history_len(), 1);
    }

    #[test]
    fn test_history_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            NodeStore::open(dir.path().join("cap.idx"), dir.path().join("cap.bin")).unwrap();
        let mut engine = PatternEngine::with_parts(
            store,
            Scorer::default(),
            EngineConfig {
                history_cap: 5,
                ..EngineConfig::default()
            },
        )
        .unwrap();

        for i in 0..20 {
            engine.submit(candle(100.0 + i as f64 * 0.01, 1000.0)).unwrap();
        }
        assert_eq!(engine.history_len(), 5);
    }

    #[test]
    fn test_momentum_fields_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store =
            NodeStore::open(dir.path().join("mom.idx"), dir.path().join("mom.bin")).unwrap();
        // Force every candle through a fresh root search so each becomes a
        // node we can read back.
        let mut engine = PatternEngine::with_parts(
            store,
            Scorer::default(),
            EngineConfig {
                max_path_len: 1,
                ..EngineConfig::default()
            },
        )
        .unwrap();

        engine.submit(candle(100.0, 1_000.0)).unwrap();
        let advance = engine.submit(candle(500.0, 900_000.0)).unwrap();
        let Advance::NewRoot { offset, .. } = advance else {
            panic!("expected new root, got {advance:?}");
        };

        let node = engine.store().read_node_at(offset).unwrap();
        assert_eq!(node.delta, 400.0);
        assert_eq!(node.percent_change, 500.0 / 99.0);
    }

    #[test]
    fn test_config_validation() {
        assert!(EngineConfig::default().validate().is_ok());
        assert!(EngineConfig {
            history_cap: 0,
            ..EngineConfig::default()
        }
        .validate()
        .is_err());
    }
}
