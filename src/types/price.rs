use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Price(i64);  // Fixed-point with 8 decimal places

impl Price {
    pub const DECIMALS: u32 = 8;
    const MULTIPLIER: i64 = 100_000_000;  // 10^8

    /// Rounds to the nearest representable value.
    pub fn from_f64(value: f64) -> Self {
        Price((value * Self::MULTIPLIER as f64).round() as i64)
    }

    pub fn to_f64(&self) -> f64 {
        self.0 as f64 / Self::MULTIPLIER as f64
    }

    /// Rescale a raw fixed-point integer with `decimals` places into the
    /// canonical 8-decimal representation.
    ///
    /// Extra precision is rounded half away from zero. Returns `None` when
    /// the value does not fit.
    pub fn from_scaled(raw: i128, decimals: u32) -> Option<Self> {
        let scaled = if decimals <= Self::DECIMALS {
            let factor = 10i128.checked_pow(Self::DECIMALS - decimals)?;
            raw.checked_mul(factor)?
        } else {
            let divisor = 10i128.checked_pow(decimals - Self::DECIMALS)?;
            let quotient = raw / divisor;
            let remainder = raw % divisor;
            if remainder.abs() * 2 >= divisor {
                quotient + raw.signum()
            } else {
                quotient
            }
        };
        i64::try_from(scaled).ok().map(Price)
    }

    pub fn raw_value(&self) -> i64 {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// Absolute deviation from `reference` in percent. `None` for a
    /// non-positive reference.
    pub fn deviation_pct(&self, reference: Price) -> Option<f64> {
        if !reference.is_positive() {
            return None;
        }
        let diff = (self.0 as i128 - reference.0 as i128).abs() as f64;
        Some(diff * 100.0 / reference.0 as f64)
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}
