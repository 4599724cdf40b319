//! Fuzzy similarity scoring between candlestick records.
//!
//! Two composite scores are blended: *price shape* (open/high/low/close, with
//! close weighted double) and *psychology* (volume, momentum, and wick
//! behavior). A sufficiently strong psychology score declares a match on its
//! own, overriding any divergence in raw price levels between the records.

use crate::CandleData;

// ============================================================
// THRESHOLDS
// ============================================================

/// Psychology score at or above this declares a match regardless of price.
pub const PSYCHOLOGY_OVERRIDE: f64 = 0.85;
/// Blended score at or above this declares a match.
pub const BLENDED_THRESHOLD: f64 = 0.89;
/// Weight of the price-shape composite in the blend.
pub const PRICE_WEIGHT: f64 = 0.6;
/// Weight of the psychology composite in the blend.
pub const PSYCHOLOGY_WEIGHT: f64 = 0.4;
/// Distance substituted for delta/percent-change while history is too short
/// for those fields to be meaningful.
pub const COLD_START_DISTANCE: f64 = 0.3;

// ============================================================
// SCORER
// ============================================================

/// Similarity scorer with tunable thresholds.
///
/// `Default` yields the production thresholds above.
#[derive(Debug, Clone, Copy)]
pub struct Scorer {
    pub psychology_override: f64,
    pub blended_threshold: f64,
    pub cold_start_distance: f64,
}

impl Default for Scorer {
    fn default() -> Self {
        Self {
            psychology_override: PSYCHOLOGY_OVERRIDE,
            blended_threshold: BLENDED_THRESHOLD,
            cold_start_distance: COLD_START_DISTANCE,
        }
    }
}

/// Result of scoring an incoming candle against a stored candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchScore {
    pub is_match: bool,
    /// Reported match percentage, 0..=100.
    pub percentage: f64,
    /// Composite over open/high/low/close (close weighted double).
    pub price_shape: f64,
    /// Composite over volume, delta, percent change, and both wicks.
    pub psychology: f64,
}

impl MatchScore {
    fn no_match() -> Self {
        Self {
            is_match: false,
            percentage: 0.0,
            price_shape: 0.0,
            psychology: 0.0,
        }
    }
}

impl Scorer {
    /// Scores `incoming` against `candidate`.
    ///
    /// Returns a no-match at 0 when either record carries a non-numeric
    /// field. Delta/percent-change distances fall back to
    /// [`cold_start_distance`](Self::cold_start_distance) when either side
    /// has not seen enough history to carry them.
    pub fn score<A: CandleData, B: CandleData>(&self, incoming: &A, candidate: &B) -> MatchScore {
        if !incoming.is_fully_numeric() || !candidate.is_fully_numeric() {
            return MatchScore::no_match();
        }

        let s_open = similarity(relative_distance(incoming.open(), candidate.open()));
        let s_high = similarity(relative_distance(incoming.high(), candidate.high()));
        let s_low = similarity(relative_distance(incoming.low(), candidate.low()));
        let s_close = similarity(relative_distance(incoming.close(), candidate.close()));
        let s_top = similarity(relative_distance(incoming.top_wick(), candidate.top_wick()));
        let s_bottom = similarity(relative_distance(
            incoming.bottom_wick(),
            candidate.bottom_wick(),
        ));
        let s_volume = similarity(volume_distance(incoming.volume(), candidate.volume()));

        let (d_delta, d_percent) = match (
            incoming.delta(),
            candidate.delta(),
            incoming.percent_change(),
            candidate.percent_change(),
        ) {
            (Some(a), Some(b), Some(p), Some(q)) => ((a - b).abs(), (p - q).abs()),
            _ => (self.cold_start_distance, self.cold_start_distance),
        };
        let s_delta = similarity(d_delta);
        let s_percent = similarity(d_percent);

        let price_shape = (s_open + s_high + s_low + 2.0 * s_close) / 5.0;
        let psychology = (s_volume + s_delta + s_percent + s_top + s_bottom) / 5.0;
        let total = PRICE_WEIGHT * price_shape + PSYCHOLOGY_WEIGHT * psychology;

        if psychology >= self.psychology_override {
            MatchScore {
                is_match: true,
                percentage: psychology * 100.0,
                price_shape,
                psychology,
            }
        } else {
            MatchScore {
                is_match: total >= self.blended_threshold,
                percentage: total * 100.0,
                price_shape,
                psychology,
            }
        }
    }
}

// ============================================================
// DISTANCE PRIMITIVES
// ============================================================

/// Symmetric relative difference: `|x − y| / ((x + y) / 2)`.
#[inline]
fn relative_distance(x: f64, y: f64) -> f64 {
    if x == y {
        return 0.0;
    }
    (x - y).abs() / ((x + y) / 2.0)
}

/// Scale-normalized volume difference: `|x − y| / max(x, y)`.
#[inline]
fn volume_distance(x: f64, y: f64) -> f64 {
    if x == y {
        return 0.0;
    }
    (x - y).abs() / x.max(y)
}

/// Converts a distance to a similarity, clamped at zero.
#[inline]
fn similarity(distance: f64) -> f64 {
    (1.0 - distance).max(0.0)
}

// ============================================================
// TESTS
// ============================================================
