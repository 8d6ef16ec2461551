//! OHLCV candle: the immutable record at the center of the data model
//! Arithmetic is done in `rust_decimal::Decimal` rather than `f64` so the
//! OHLCV invariants (`low ≤ open,close ≤ high`, non-negative, finite) can
//! be checked exactly.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A single OHLCV bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    #[serde(
        serialize_with = "serialize_time",
        deserialize_with = "deserialize_time"
    )]
    pub time: DateTime<Utc>,

    #[serde(with = "rust_decimal::serde::float")]
    pub open: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub high: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub low: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub close: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub volume: Decimal,

    #[serde(
        rename = "quoteVolume",
        default,
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub quote_volume: Option<Decimal>,
}

/// Why a candidate `Candle` fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CandleValidationError {
    #[error("field {0} is not finite or is negative")]
    NotFiniteNonNegative(&'static str),
    #[error("low ({low}) must be <= open ({open}), close ({close}), and high ({high})")]
    LowOutOfRange {
        low: Decimal,
        open: Decimal,
        close: Decimal,
        high: Decimal,
    },
    #[error("high ({high}) must be >= open ({open}), close ({close}), and low ({low})")]
    HighOutOfRange {
        high: Decimal,
        open: Decimal,
        close: Decimal,
        low: Decimal,
    },
}

impl Candle {
    /// Build a candle, checking its OHLCV invariants. Rejects negative,
    /// non-finite (`NaN`-equivalent for `Decimal` is simply impossible,
    /// but scale overflow can still produce unusable values), or
    /// order-violating OHLC combinations.
    pub fn new(
        time: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
        quote_volume: Option<Decimal>,
    ) -> Result<Self, CandleValidationError> {
        for (name, value) in [
            ("open", open),
            ("high", high),
            ("low", low),
            ("close", close),
            ("volume", volume),
        ] {
            if value.is_sign_negative() && !value.is_zero() {
                return Err(CandleValidationError::NotFiniteNonNegative(name));
            }
        }
        if let Some(qv) = quote_volume
            && qv.is_sign_negative()
            && !qv.is_zero()
        {
            return Err(CandleValidationError::NotFiniteNonNegative("quoteVolume"));
        }
        if low > open || low > close || low > high {
            return Err(CandleValidationError::LowOutOfRange {
                low,
                open,
                close,
                high,
            });
        }
        if high < open || high < close {
            return Err(CandleValidationError::HighOutOfRange {
                high,
                open,
                close,
                low,
            });
        }

        Ok(Self {
            time,
            open,
            high,
            low,
            close,
            volume,
            quote_volume,
        })
    }
}

impl fmt::Display for Candle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Candle(time={}, o={}, h={}, l={}, c={}, v={})",
            self.time.to_rfc3339(),
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume
        )
    }
}

fn serialize_time<S: Serializer>(time: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
}

/// Accept either an RFC3339 string or an integer epoch-millisecond
/// timestamp on ingest.
fn deserialize_time<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TimeWire {
        Text(String),
        EpochMillis(i64),
    }

    match TimeWire::deserialize(d)? {
        TimeWire::Text(text) => DateTime::parse_from_rfc3339(&text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom),
        TimeWire::EpochMillis(ms) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| serde::de::Error::custom("epoch-ms timestamp out of range")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn accepts_well_formed_candle() {
        let candle = Candle::new(t(0), dec!(1), dec!(2), dec!(1), dec!(2), dec!(1), None);
        assert!(candle.is_ok());
    }

    #[test]
    fn rejects_low_above_open() {
        let err = Candle::new(t(0), dec!(1), dec!(2), dec!(1.5), dec!(2), dec!(1), None)
            .unwrap_err();
        assert!(matches!(err, CandleValidationError::LowOutOfRange { .. }));
    }

    #[test]
    fn rejects_high_below_close() {
        let err = Candle::new(t(0), dec!(1), dec!(1.2), dec!(1), dec!(2), dec!(1), None)
            .unwrap_err();
        assert!(matches!(err, CandleValidationError::HighOutOfRange { .. }));
    }

    #[test]
    fn rejects_negative_volume() {
        let err = Candle::new(t(0), dec!(1), dec!(2), dec!(1), dec!(2), dec!(-1), None)
            .unwrap_err();
        assert!(matches!(
            err,
            CandleValidationError::NotFiniteNonNegative("volume")
        ));
    }

    #[test]
    fn json_round_trips_through_rfc3339() {
        let candle =
            Candle::new(t(0), dec!(1), dec!(2), dec!(1), dec!(2), dec!(1), Some(dec!(3)))
                .unwrap();
        let json = serde_json::to_string(&candle).unwrap();
        let back: Candle = serde_json::from_str(&json).unwrap();
        assert_eq!(candle, back);
    }

    #[test]
    fn deserializes_epoch_millis_time() {
        let json = r#"{"time":60000,"open":1,"high":2,"low":1,"close":2,"volume":1}"#;
        let candle: Candle = serde_json::from_str(json).unwrap();
        assert_eq!(candle.time, Utc.timestamp_millis_opt(60_000).unwrap());
    }

    #[test]
    fn quote_volume_key_is_camel_case_when_present() {
        let candle =
            Candle::new(t(0), dec!(1), dec!(2), dec!(1), dec!(2), dec!(1), Some(dec!(3)))
                .unwrap();
        let json = serde_json::to_string(&candle).unwrap();
        assert!(json.contains(r#""quoteVolume":3"#));
        assert!(!json.contains("quote_volume"));
    }

    #[test]
    fn quote_volume_omitted_when_absent() {
        let candle = Candle::new(t(0), dec!(1), dec!(2), dec!(1), dec!(2), dec!(1), None).unwrap();
        let json = serde_json::to_string(&candle).unwrap();
        assert!(!json.contains("quoteVolume"));
        assert!(!json.contains("quote_volume"));
    }

    #[test]
    fn deserializes_camel_case_quote_volume_from_upstream_payload() {
        let json = r#"{"time":0,"open":1,"high":2,"low":1,"close":2,"volume":1,"quoteVolume":5}"#;
        let candle: Candle = serde_json::from_str(json).unwrap();
        assert_eq!(candle.quote_volume, Some(dec!(5)));
    }
}
