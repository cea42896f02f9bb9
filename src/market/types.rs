//! Market data types consumed by the analyzers.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hour (UTC) at which a contract is considered expired on its expiry date.
pub const EXPIRY_CLOSE_UTC_HOUR: u32 = 21;

/// Call or put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    /// Single-letter code used in OCC symbols.
    pub fn code(&self) -> char {
        match self {
            OptionType::Call => 'C',
            OptionType::Put => 'P',
        }
    }
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionType::Call => write!(f, "CALL"),
            OptionType::Put => write!(f, "PUT"),
        }
    }
}

/// Option contract descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionContract {
    /// Underlying symbol (e.g. "SPY")
    pub underlying: String,
    pub strike: Decimal,
    pub expiry: NaiveDate,
    pub option_type: OptionType,
}

impl OptionContract {
    pub fn new(underlying: &str, strike: Decimal, expiry: NaiveDate, option_type: OptionType) -> Self {
        Self {
            underlying: underlying.to_uppercase(),
            strike,
            expiry,
            option_type,
        }
    }

    /// The instant after which the contract is treated as expired.
    pub fn expiry_datetime(&self) -> DateTime<Utc> {
        self.expiry
            .and_hms_opt(EXPIRY_CLOSE_UTC_HOUR, 0, 0)
            .map(|close| Utc.from_utc_datetime(&close))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whole calendar days until expiry (0 on expiry day, negative once past).
    pub fn days_to_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.expiry - now.date_naive()).num_days()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry_datetime()
    }

    /// OCC-style identifier: root padded to 6, YYMMDD, C/P, strike x1000 padded to 8.
    pub fn occ_symbol(&self) -> String {
        let strike_thousandths = (self.strike * dec!(1000)).trunc();
        format!(
            "{:<6}{}{}{:0>8}",
            self.underlying,
            self.expiry.format("%y%m%d"),
            self.option_type.code(),
            strike_thousandths.to_string()
        )
    }

    /// Intrinsic value per share given an underlying price.
    pub fn intrinsic_value(&self, underlying_price: Decimal) -> Decimal {
        let raw = match self.option_type {
            OptionType::Call => underlying_price - self.strike,
            OptionType::Put => self.strike - underlying_price,
        };
        raw.max(Decimal::ZERO)
    }
}

impl fmt::Display for OptionContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.underlying,
            self.expiry.format("%Y-%m-%d"),
            self.strike,
            self.option_type
        )
    }
}

/// OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Top-of-book quote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    /// Mid price, or last when the book is one-sided.
    pub fn mid(&self) -> Decimal {
        if self.bid > Decimal::ZERO && self.ask > Decimal::ZERO {
            (self.bid + self.ask) / dec!(2)
        } else {
            self.last
        }
    }
}

/// Greeks as reported upstream. Any field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawGreeks {
    pub delta: Option<f64>,
    pub gamma: Option<f64>,
    pub theta: Option<f64>,
    pub vega: Option<f64>,
    pub rho: Option<f64>,
    pub implied_volatility: Option<f64>,
}

/// Options chain snapshot for one contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionSnapshot {
    pub contract: OptionContract,
    pub option_price: Decimal,
    pub underlying_price: Decimal,
    pub greeks: RawGreeks,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spy_call() -> OptionContract {
        OptionContract::new(
            "spy",
            dec!(450),
            NaiveDate::from_ymd_opt(2024, 12, 20).unwrap(),
            OptionType::Call,
        )
    }

    #[test]
    fn test_occ_symbol() {
        assert_eq!(spy_call().occ_symbol(), "SPY   241220C00450000");

        let put = OptionContract::new(
            "AAPL",
            dec!(182.5),
            NaiveDate::from_ymd_opt(2025, 1, 17).unwrap(),
            OptionType::Put,
        );
        assert_eq!(put.occ_symbol(), "AAPL  250117P00182500");
    }

    #[test]
    fn test_expiry_and_dte() {
        let contract = spy_call();
        let morning = Utc.with_ymd_and_hms(2024, 12, 20, 14, 0, 0).unwrap();
        let after_close = Utc.with_ymd_and_hms(2024, 12, 20, 21, 0, 0).unwrap();

        assert_eq!(contract.days_to_expiry(morning), 0);
        assert!(!contract.is_expired(morning));
        assert!(contract.is_expired(after_close));
        assert_eq!(
            contract.days_to_expiry(Utc.with_ymd_and_hms(2024, 12, 13, 14, 0, 0).unwrap()),
            7
        );
    }

    #[test]
    fn test_intrinsic_value() {
        let call = spy_call();
        assert_eq!(call.intrinsic_value(dec!(455.5)), dec!(5.5));
        assert_eq!(call.intrinsic_value(dec!(440)), Decimal::ZERO);

        let put = OptionContract {
            option_type: OptionType::Put,
            ..spy_call()
        };
        assert_eq!(put.intrinsic_value(dec!(440)), dec!(10));
    }
}
