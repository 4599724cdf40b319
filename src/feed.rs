//! Collaborator-side helpers for turning raw feed traffic into candles.
//!
//! The upstream chart feed delivers socket.io-style text chunks: each chunk
//! holds one or more `~m~<len>~m~<payload>` frames, where a payload is either
//! a `~h~<n>` heartbeat (which the client must echo back verbatim) or a JSON
//! message. Candle data arrives in `"m":"du"` (data update) messages under
//! `p[1].sds_1.s[0].v` as `[timestamp, open, high, low, close, volume]`.
//!
//! Nothing here touches the network; these are pure functions a feed client
//! composes with its socket loop. [`PeriodCloser`] handles the final piece of
//! the engine's input contract: only the last update seen for a period is
//! forwarded, once the period has closed.

use serde_json::Value;
use tracing::warn;

use crate::{Candle, Error, Result};

// ============================================================
// FRAMES
// ============================================================

/// Classification of a single feed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage<'a> {
    /// A heartbeat frame; send the full frame back as-is.
    Heartbeat(&'a str),
    /// A data update carrying one candle for our series.
    DataUpdate(Candle),
    /// Anything else: session acks, quote noise, updates for other series,
    /// or payloads we could not parse (logged).
    Other,
}

/// Splits a raw transport chunk into payload frames, dropping the `~m~<len>~m~`
/// length markers.
pub fn split_frames(raw: &str) -> Vec<&str> {
    raw.split("~m~")
        .filter(|seg| !seg.is_empty() && !seg.bytes().all(|b| b.is_ascii_digit()))
        .collect()
}

/// Classifies one payload frame.
///
/// `symbol` is stamped onto extracted candles; the data-update payload itself
/// does not carry it.
pub fn classify<'a>(frame: &'a str, symbol: &str) -> FeedMessage<'a> {
    if frame.starts_with("~h~") {
        return FeedMessage::Heartbeat(frame);
    }
    if !frame.trim_start().starts_with('{') {
        return FeedMessage::Other;
    }
    match parse_data_update(frame, symbol) {
        Ok(Some(candle)) => FeedMessage::DataUpdate(candle),
        Ok(None) => FeedMessage::Other,
        Err(err) => {
            warn!(error = %err, "unparseable data update frame");
            FeedMessage::Other
        }
    }
}

/// Extracts a candle from a `"m":"du"` JSON payload.
///
/// Returns `Ok(None)` for JSON that is not a data update for our series.
/// Fails only when a frame claims to carry series data but its bar values
/// are malformed.
pub fn parse_data_update(frame: &str, symbol: &str) -> Result<Option<Candle>> {
    let json: Value = serde_json::from_str(frame)
        .map_err(|e| Error::Parse(format!("invalid json in frame: {e}")))?;

    if json.get("m").and_then(Value::as_str) != Some("du") {
        return Ok(None);
    }
    let Some(series) = json.pointer("/p/1/sds_1") else {
        return Ok(None);
    };
    let Some(bar) = series.pointer("/s/0/v").and_then(Value::as_array) else {
        return Ok(None);
    };
    if bar.len() < 6 {
        return Err(Error::Parse(format!(
            "bar value array has {} fields, expected 6",
            bar.len()
        )));
    }

    let field = |i: usize, name: &str| -> Result<f64> {
        as_number(&bar[i]).ok_or_else(|| Error::Parse(format!("non-numeric {name} value")))
    };

    // Timestamps sometimes arrive fractional ("1752672600.0"); truncate.
    let timestamp = field(0, "timestamp")?.trunc() as i64;
    Ok(Some(Candle::new(
        symbol,
        timestamp,
        field(1, "open")?,
        field(2, "high")?,
        field(3, "low")?,
        field(4, "close")?,
        field(5, "volume")?,
    )))
}

/// Accepts JSON numbers and numeric strings.
fn as_number(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

// ============================================================
// PERIOD CLOSE-OUT
// ============================================================

/// Collapses intra-period updates down to one candle per completed period.
///
/// The feed re-sends the current period's candle on every tick; only the last
/// update for a timestamp is the period's final state. `push` holds the
/// newest update and emits the previous period's candle when the timestamp
/// advances.
#[derive(Debug, Default)]
pub struct PeriodCloser {
    pending: Option<Candle>,
}

impl PeriodCloser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one raw update; returns the completed candle of the previous
    /// period, if this update opened a new one.
    pub fn push(&mut self, update: Candle) -> Option<Candle> {
        match &self.pending {
            Some(current) if current.timestamp == update.timestamp => {
                self.pending = Some(update);
                None
            }
            _ => self.pending.replace(update),
        }
    }

    /// Takes the in-flight period, e.g. at end of session.
    pub fn flush(&mut self) -> Option<Candle> {
        self.pending.take()
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    const DU_FRAME: &str = r#"{"m":"du","p":["cs_a2UkqE70LfhA",{"sds_1":{"s":[{"v":[1752672600.0,140.0,142.0,139.0,141.2,500000.0]}]}}]}"#;

    #[test]
    fn test_split_frames_drops_length_markers() {
        let raw = "~m~4~m~~h~1~m~52~m~{\"m\":\"du\"}";
        let frames = split_frames(raw);
        assert_eq!(frames, vec!["~h~1", "{\"m\":\"du\"}"]);
    }

    #[test]
    fn test_heartbeat_is_classified_for_echo() {
        let msg = classify("~h~17", "MSFT");
        assert_eq!(msg, FeedMessage::Heartbeat("~h~17"));
    }

    #[test]
    fn test_data_update_extraction() {
        let msg = classify(DU_FRAME, "MSFT");
        let FeedMessage::DataUpdate(candle) = msg else {
            panic!("expected data update, got {msg:?}");
        };
        assert_eq!(candle.symbol, "MSFT");
        assert_eq!(candle.timestamp, 1_752_672_600);
        assert_eq!(candle.open, 140.0);
        assert_eq!(candle.high, 142.0);
        assert_eq!(candle.low, 139.0);
        assert_eq!(candle.close, 141.2);
        assert_eq!(candle.volume, 500_000.0);
        assert_eq!(candle.delta, None);
    }

    #[test]
    fn test_string_numbers_are_tolerated() {
        let frame = r#"{"m":"du","p":["cs_x",{"sds_1":{"s":[{"v":["1752672600","140","142","139","141.2","500000"]}]}}]}"#;
        let candle = parse_data_update(frame, "MSFT").unwrap().unwrap();
        assert_eq!(candle.timestamp, 1_752_672_600);
        assert_eq!(candle.close, 141.2);
    }

    #[test]
    fn test_non_du_messages_are_other() {
        assert_eq!(
            classify(r#"{"m":"series_loading","p":["cs_x"]}"#, "MSFT"),
            FeedMessage::Other
        );
        // A du for a different series is not ours.
        assert_eq!(
            classify(r#"{"m":"du","p":["cs_x",{"st1":{}}]}"#, "MSFT"),
            FeedMessage::Other
        );
        assert_eq!(classify("not json at all", "MSFT"), FeedMessage::Other);
    }

    #[test]
    fn test_short_bar_array_is_a_parse_error() {
        let frame = r#"{"m":"du","p":["cs_x",{"sds_1":{"s":[{"v":[1752672600.0,140.0]}]}}]}"#;
        let err = parse_data_update(frame, "MSFT").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_period_closer_emits_on_timestamp_advance() {
        let mut closer = PeriodCloser::new();

        let tick = |ts: i64, close: f64| Candle::new("MSFT", ts, 100.0, 101.0, 99.0, close, 10.0);

        assert_eq!(closer.push(tick(60, 100.1)), None);
        assert_eq!(closer.push(tick(60, 100.4)), None);

        // New period: the last update of period 60 comes out.
        let completed = closer.push(tick(120, 100.5)).unwrap();
        assert_eq!(completed.timestamp, 60);
        assert_eq!(completed.close, 100.4);

        let completed = closer.flush().unwrap();
        assert_eq!(completed.timestamp, 120);
        assert!(closer.flush().is_none());
    }
}
