//! Instrument identifier
//!
//! Every component refers to a trading pair through the canonical `BASE/QUOTE`
//! form. Venue spellings (`BTCUSDT`, `BTC-USDT`, `BTC/USDT:USDT`,
//! `BTCUSDT_UMCBL`) are normalized once, at ingestion.

use crate::domain::errors::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Quote currencies recognised when a symbol has no separator
const KNOWN_QUOTES: &[&str] = &["USDT", "USDC", "USD"];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Instrument {
    base: String,
    quote: String,
}

impl Instrument {
    /// Parse any supported spelling into the canonical instrument
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let cleaned = raw.trim().to_uppercase();
        if cleaned.is_empty() {
            return Err(ValidationError::InvalidSymbol("empty instrument".to_string()));
        }

        // Settlement suffixes: "BTC/USDT:USDT", "BTCUSDT_UMCBL"
        let cleaned = cleaned.split(':').next().unwrap_or_default();
        let cleaned = cleaned.split('_').next().unwrap_or_default();

        let (base, quote) = if let Some((base, quote)) = cleaned.split_once('/') {
            (base.to_string(), quote.to_string())
        } else if let Some((base, quote)) = cleaned.split_once('-') {
            (base.to_string(), quote.to_string())
        } else {
            let quote = KNOWN_QUOTES
                .iter()
                .find(|q| cleaned.len() > q.len() && cleaned.ends_with(*q))
                .ok_or_else(|| ValidationError::InvalidSymbol(raw.to_string()))?;
            let base = &cleaned[..cleaned.len() - quote.len()];
            (base.to_string(), quote.to_string())
        };

        let valid = |part: &str| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric());
        if !valid(&base) || !valid(&quote) {
            return Err(ValidationError::InvalidSymbol(raw.to_string()));
        }

        Ok(Self { base, quote })
    }

    /// Build from already-known parts, e.g. constants
    pub fn new(base: &str, quote: &str) -> Self {
        Self {
            base: base.trim().to_uppercase(),
            quote: quote.trim().to_uppercase(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }

    /// Symbol as the venue expects it in REST parameters (`BTCUSDT`)
    pub fn venue_symbol(&self) -> String {
        format!("{}{}", self.base, self.quote)
    }

    /// Path-safe spelling used by the control API (`BTC-USDT`)
    pub fn slug(&self) -> String {
        format!("{}-{}", self.base, self.quote)
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl FromStr for Instrument {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Instrument::parse(s)
    }
}

impl TryFrom<String> for Instrument {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Instrument::parse(&value)
    }
}

impl From<Instrument> for String {
    fn from(instrument: Instrument) -> Self {
        instrument.to_string()
    }
}
