//! Core data model (spec.md §3): exchange/symbol identifiers, funding-rate
//! records, arbitrage opportunities, positions and trades. All monetary and
//! rate quantities use `rust_decimal::Decimal`; floats never represent money.

mod funding;
mod opportunity;
mod position;
mod trade;

pub use funding::{BestArbitragePair, ExchangeRateData, FundingRatePair, FundingRateRecord, RateSource};
pub use opportunity::{ArbitrageOpportunity, OpportunityEndHistory, OpportunityStatus};
pub use position::{
    CloseReason, ConditionalOrderState, ConditionalOrderStatus, ExitSuggestedReason, Position,
    PositionSide, PositionStatus, StopOrTakeConfig,
};
pub use trade::{Trade, TradeStatus};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Supported perpetual-futures venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Okx,
    Gateio,
    Mexc,
    Bingx,
}

impl Exchange {
    pub const ALL: [Exchange; 5] = [
        Exchange::Binance,
        Exchange::Okx,
        Exchange::Gateio,
        Exchange::Mexc,
        Exchange::Bingx,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Okx => "okx",
            Exchange::Gateio => "gateio",
            Exchange::Mexc => "mexc",
            Exchange::Bingx => "bingx",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Exchange {
    type Err = crate::error::EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binance" => Ok(Exchange::Binance),
            "okx" => Ok(Exchange::Okx),
            "gateio" | "gate.io" | "gate" => Ok(Exchange::Gateio),
            "mexc" => Ok(Exchange::Mexc),
            "bingx" => Ok(Exchange::Bingx),
            other => Err(crate::error::EngineError::Validation(format!(
                "unknown exchange: {other}"
            ))),
        }
    }
}

/// Canonical symbol form, `BASE+QUOTE`, e.g. `BTCUSDT`. Per-venue forms are
/// reached via `crate::exchange::symbol` conversion functions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalSymbol(pub String);

impl CanonicalSymbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CanonicalSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical funding-settlement intervals used for APY normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CanonicalInterval {
    OneHour,
    FourHours,
    EightHours,
    TwentyFourHours,
}

impl CanonicalInterval {
    pub const ALL: [CanonicalInterval; 4] = [
        CanonicalInterval::OneHour,
        CanonicalInterval::FourHours,
        CanonicalInterval::EightHours,
        CanonicalInterval::TwentyFourHours,
    ];

    pub fn hours(&self) -> u32 {
        match self {
            CanonicalInterval::OneHour => 1,
            CanonicalInterval::FourHours => 4,
            CanonicalInterval::EightHours => 8,
            CanonicalInterval::TwentyFourHours => 24,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CanonicalInterval::OneHour => "1h",
            CanonicalInterval::FourHours => "4h",
            CanonicalInterval::EightHours => "8h",
            CanonicalInterval::TwentyFourHours => "24h",
        }
    }

    /// Number of settlements per year at this cadence.
    pub fn settlements_per_year(&self) -> rust_decimal::Decimal {
        use rust_decimal::Decimal;
        let hours_per_year = Decimal::from(24 * 365);
        hours_per_year / Decimal::from(self.hours())
    }
}
