//! Greeks validation and safe bounding.
//!
//! Upstream chains regularly report missing or absurd Greeks (zero gamma on
//! illiquid strikes, IV of 0 or 40.0). Nothing downstream should see those
//! values: they are clamped or replaced with type-appropriate fallbacks and
//! the result is flagged as estimated.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, warn};

use crate::market::{OptionType, RawGreeks};

pub const DELTA_BOUNDS: (f64, f64) = (-1.0, 1.0);
pub const GAMMA_BOUNDS: (f64, f64) = (0.0, 2.0);
pub const THETA_BOUNDS: (f64, f64) = (-5.0, 5.0);
pub const VEGA_BOUNDS: (f64, f64) = (-1.0, 1.0);
pub const RHO_BOUNDS: (f64, f64) = (-1.0, 1.0);
pub const IV_BOUNDS: (f64, f64) = (0.01, 5.0);

/// Substituted when gamma is missing, zero or negative.
pub const FALLBACK_GAMMA: f64 = 0.01;
const FALLBACK_THETA: f64 = -0.05;
const FALLBACK_VEGA: f64 = 0.10;
const FALLBACK_RHO: f64 = 0.01;
const FALLBACK_IV: f64 = 0.30;

/// Result of checking raw Greeks against realistic bounds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GreeksValidation {
    pub is_valid: bool,
    pub is_estimated: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Bounded Greeks for one trade at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GreeksSnapshot {
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub rho: f64,
    pub implied_volatility: f64,
    pub underlying_price: f64,
    pub option_price: f64,
    pub days_to_expiry: i64,
    pub is_estimated: bool,
    pub as_of: DateTime<Utc>,
}

/// Output of [`GreeksValidator::create_safe_greeks`].
#[derive(Debug, Clone)]
pub struct SafeGreeks {
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub rho: f64,
    pub implied_volatility: f64,
    pub is_estimated: bool,
    pub validation: GreeksValidation,
}

impl SafeGreeks {
    /// Attach pricing context to produce a snapshot.
    pub fn into_snapshot(
        self,
        underlying_price: f64,
        option_price: f64,
        days_to_expiry: i64,
        as_of: DateTime<Utc>,
    ) -> GreeksSnapshot {
        GreeksSnapshot {
            delta: self.delta,
            gamma: self.gamma,
            theta: self.theta,
            vega: self.vega,
            rho: self.rho,
            implied_volatility: self.implied_volatility,
            underlying_price,
            option_price,
            days_to_expiry,
            is_estimated: self.is_estimated,
            as_of,
        }
    }
}

/// Data-quality counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ValidationStats {
    pub total: u64,
    pub estimated: u64,
    pub invalid: u64,
}

/// Validates and bounds raw Greeks.
#[derive(Debug, Default)]
pub struct GreeksValidator {
    total: AtomicU64,
    estimated: AtomicU64,
    invalid: AtomicU64,
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

fn check_bounds(
    name: &str,
    value: Option<f64>,
    (lo, hi): (f64, f64),
    validation: &mut GreeksValidation,
) {
    match value {
        None => validation.warnings.push(format!("{} missing", name)),
        Some(v) if !v.is_finite() => validation.errors.push(format!("{} is not finite", name)),
        Some(v) if v < lo || v > hi => validation
            .errors
            .push(format!("{} {:.4} outside [{}, {}]", name, v, lo, hi)),
        Some(_) => {}
    }
}

impl GreeksValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check each Greek against its bounds without modifying anything.
    pub fn validate(&self, raw: &RawGreeks) -> GreeksValidation {
        let mut validation = GreeksValidation::default();

        check_bounds("delta", raw.delta, DELTA_BOUNDS, &mut validation);
        check_bounds("gamma", raw.gamma, GAMMA_BOUNDS, &mut validation);
        check_bounds("theta", raw.theta, THETA_BOUNDS, &mut validation);
        check_bounds("vega", raw.vega, VEGA_BOUNDS, &mut validation);
        check_bounds("rho", raw.rho, RHO_BOUNDS, &mut validation);
        check_bounds("implied_volatility", raw.implied_volatility, IV_BOUNDS, &mut validation);

        if raw.gamma == Some(0.0) {
            validation
                .errors
                .push("gamma is exactly zero (missing upstream data)".to_string());
        }

        validation.is_valid = validation.errors.is_empty();
        validation.is_estimated = !validation.is_valid || !validation.warnings.is_empty();
        validation
    }

    /// Clamp out-of-range values and substitute fallbacks for missing ones.
    ///
    /// The returned gamma is never zero.
    pub fn create_safe_greeks(&self, raw: &RawGreeks, option_type: OptionType) -> SafeGreeks {
        let validation = self.validate(raw);
        let mut estimated = false;

        let mut bound = |name: &str, value: Option<f64>, (lo, hi): (f64, f64), fallback: f64| {
            match finite(value) {
                Some(v) if v >= lo && v <= hi => v,
                Some(v) => {
                    estimated = true;
                    debug!(greek = name, raw = v, "Clamping out-of-range greek");
                    v.clamp(lo, hi)
                }
                None => {
                    estimated = true;
                    fallback
                }
            }
        };

        let (default_delta, default_rho) = match option_type {
            OptionType::Call => (0.5, FALLBACK_RHO),
            OptionType::Put => (-0.5, -FALLBACK_RHO),
        };

        let delta = bound("delta", raw.delta, DELTA_BOUNDS, default_delta);
        let theta = bound("theta", raw.theta, THETA_BOUNDS, FALLBACK_THETA);
        let vega = bound("vega", raw.vega, VEGA_BOUNDS, FALLBACK_VEGA);
        let rho = bound("rho", raw.rho, RHO_BOUNDS, default_rho);
        let implied_volatility = bound("implied_volatility", raw.implied_volatility, IV_BOUNDS, FALLBACK_IV);

        let gamma = match finite(raw.gamma) {
            Some(g) if g > 0.0 => {
                if g > GAMMA_BOUNDS.1 {
                    estimated = true;
                }
                g.min(GAMMA_BOUNDS.1)
            }
            other => {
                error!(
                    raw_gamma = ?other,
                    fallback = FALLBACK_GAMMA,
                    "Gamma missing or non-positive, substituting fallback"
                );
                estimated = true;
                FALLBACK_GAMMA
            }
        };

        self.total.fetch_add(1, Ordering::Relaxed);
        if estimated {
            self.estimated.fetch_add(1, Ordering::Relaxed);
        }
        if !validation.is_valid {
            self.invalid.fetch_add(1, Ordering::Relaxed);
            warn!(errors = ?validation.errors, "Greeks failed validation");
        }

        SafeGreeks {
            delta,
            gamma,
            theta,
            vega,
            rho,
            implied_volatility,
            is_estimated: estimated,
            validation,
        }
    }

    pub fn stats(&self) -> ValidationStats {
        ValidationStats {
            total: self.total.load(Ordering::Relaxed),
            estimated: self.estimated.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean() -> RawGreeks {
        RawGreeks {
            delta: Some(0.45),
            gamma: Some(0.03),
            theta: Some(-0.08),
            vega: Some(0.12),
            rho: Some(0.02),
            implied_volatility: Some(0.22),
        }
    }

    #[test]
    fn test_clean_greeks_pass_through() {
        let validator = GreeksValidator::new();
        let validation = validator.validate(&clean());
        assert!(validation.is_valid);
        assert!(!validation.is_estimated);

        let safe = validator.create_safe_greeks(&clean(), OptionType::Call);
        assert!(!safe.is_estimated);
        assert_eq!(safe.delta, 0.45);
        assert_eq!(safe.gamma, 0.03);
    }

    #[test]
    fn test_zero_gamma_is_replaced_and_flagged() {
        let validator = GreeksValidator::new();
        let raw = RawGreeks {
            gamma: Some(0.0),
            ..clean()
        };

        let validation = validator.validate(&raw);
        assert!(!validation.is_valid);

        let safe = validator.create_safe_greeks(&raw, OptionType::Call);
        assert_ne!(safe.gamma, 0.0);
        assert_eq!(safe.gamma, FALLBACK_GAMMA);
        assert!(safe.is_estimated);
    }

    #[test]
    fn test_gamma_never_zero_for_any_input() {
        let validator = GreeksValidator::new();
        for gamma in [None, Some(0.0), Some(-0.2), Some(f64::NAN), Some(7.0), Some(1e-9)] {
            for option_type in [OptionType::Call, OptionType::Put] {
                let raw = RawGreeks { gamma, ..RawGreeks::default() };
                let safe = validator.create_safe_greeks(&raw, option_type);
                assert!(safe.gamma != 0.0, "gamma {:?} produced zero", gamma);
                if gamma.is_none() || gamma == Some(0.0) {
                    assert!(safe.is_estimated);
                }
            }
        }
    }

    #[test]
    fn test_missing_delta_defaults_by_type() {
        let validator = GreeksValidator::new();
        let raw = RawGreeks {
            delta: None,
            ..clean()
        };

        assert_eq!(validator.create_safe_greeks(&raw, OptionType::Call).delta, 0.5);
        assert_eq!(validator.create_safe_greeks(&raw, OptionType::Put).delta, -0.5);
        assert!(validator.create_safe_greeks(&raw, OptionType::Put).is_estimated);
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let validator = GreeksValidator::new();
        let raw = RawGreeks {
            delta: Some(1.7),
            theta: Some(-12.0),
            implied_volatility: Some(40.0),
            ..clean()
        };

        let validation = validator.validate(&raw);
        assert_eq!(validation.errors.len(), 3);

        let safe = validator.create_safe_greeks(&raw, OptionType::Call);
        assert_eq!(safe.delta, 1.0);
        assert_eq!(safe.theta, -5.0);
        assert_eq!(safe.implied_volatility, 5.0);
        assert!(safe.is_estimated);
    }

    #[test]
    fn test_stats_count_quality() {
        let validator = GreeksValidator::new();
        validator.create_safe_greeks(&clean(), OptionType::Call);
        validator.create_safe_greeks(&RawGreeks::default(), OptionType::Call);

        let stats = validator.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.estimated, 1);
        assert_eq!(stats.invalid, 0);
    }
}
