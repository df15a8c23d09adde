//! Canonical ⇄ per-venue symbol conversion (spec.md §3, §4.1). The mapping
//! is total and bidirectional for every canonical `BASE+QUOTE` pair this
//! process tracks; removal of the `-SWAP` suffix on OKX is case-sensitive.

use crate::domain::{CanonicalSymbol, Exchange};
use crate::error::EngineError;

/// Splits a canonical symbol `BTCUSDT` into `(BTC, USDT)` by matching the
/// longest known quote-asset suffix.
const KNOWN_QUOTES: [&str; 4] = ["USDT", "USDC", "USD", "BUSD"];

fn split_canonical(symbol: &CanonicalSymbol) -> Result<(String, String), EngineError> {
    let raw = symbol.as_str();
    for quote in KNOWN_QUOTES {
        if let Some(base) = raw.strip_suffix(quote) {
            if !base.is_empty() {
                return Ok((base.to_string(), quote.to_string()));
            }
        }
    }
    Err(EngineError::InvalidSymbol(raw.to_string()))
}

/// Converts a canonical symbol to the wire form the given venue expects.
pub fn to_venue(symbol: &CanonicalSymbol, exchange: Exchange) -> Result<String, EngineError> {
    let (base, quote) = split_canonical(symbol)?;
    Ok(match exchange {
        Exchange::Binance => format!("{base}{quote}"),
        Exchange::Okx => format!("{base}-{quote}-SWAP"),
        Exchange::Gateio => format!("{base}_{quote}"),
        Exchange::Mexc => format!("{base}/{quote}:{quote}"),
        Exchange::Bingx => format!("{base}-{quote}"),
    })
}

/// Converts a venue-native symbol back to canonical form.
pub fn from_venue(venue_symbol: &str, exchange: Exchange) -> Result<CanonicalSymbol, EngineError> {
    let canonical = match exchange {
        Exchange::Binance => venue_symbol.to_string(),
        Exchange::Okx => {
            // `-SWAP` removal is case-sensitive: only the exact uppercase
            // suffix is recognized, matching how OKX always emits it.
            let without_swap = venue_symbol
                .strip_suffix("-SWAP")
                .unwrap_or(venue_symbol);
            without_swap.replace('-', "")
        }
        Exchange::Gateio => venue_symbol.replace('_', ""),
        Exchange::Mexc => {
            let without_settlement = venue_symbol.split(':').next().unwrap_or(venue_symbol);
            without_settlement.replace('/', "")
        }
        Exchange::Bingx => venue_symbol.replace('-', ""),
    };

    if canonical.is_empty() {
        return Err(EngineError::InvalidSymbol(venue_symbol.to_string()));
    }
    Ok(CanonicalSymbol::new(canonical))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_for_every_supported_venue() {
        let symbol = CanonicalSymbol::new("BTCUSDT");
        for exchange in Exchange::ALL {
            let venue_form = to_venue(&symbol, exchange).expect("conversion succeeds");
            let back = from_venue(&venue_form, exchange).expect("reverse conversion succeeds");
            assert_eq!(back, symbol, "round trip failed for {exchange}");
        }
    }

    #[test]
    fn okx_uses_dash_swap_suffix() {
        let symbol = CanonicalSymbol::new("ETHUSDT");
        assert_eq!(to_venue(&symbol, Exchange::Okx).unwrap(), "ETH-USDT-SWAP");
    }

    #[test]
    fn mexc_uses_slash_colon_settlement_form() {
        let symbol = CanonicalSymbol::new("ETHUSDT");
        assert_eq!(
            to_venue(&symbol, Exchange::Mexc).unwrap(),
            "ETH/USDT:USDT"
        );
    }

    #[test]
    fn okx_swap_suffix_removal_is_case_sensitive() {
        // lowercase "-swap" is not recognized as the suffix and is left in
        // place, matching the documented case-sensitivity.
        let result = from_venue("BTC-USDT-swap", Exchange::Okx).unwrap();
        assert_eq!(result.as_str(), "BTCUSDTswap");
    }

    #[test]
    fn invalid_symbol_with_unknown_quote_is_rejected() {
        let symbol = CanonicalSymbol::new("BTCXYZ");
        assert!(to_venue(&symbol, Exchange::Binance).is_err());
    }
}
