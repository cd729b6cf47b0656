//! Minor/major unit conversion.
//!
//! Prices are stored and compared as integer minor units. The settlement
//! rail takes decimal major-unit strings, so conversion happens right before
//! a transfer and when rendering earnings.

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_CURRENCY, DEFAULT_MINOR_DECIMALS};

/// Settlement currency: a code and the number of decimal places between its
/// minor and major units (2 means 100 minor units per major unit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Currency {
    pub code: String,
    pub minor_decimals: u32,
}

impl Default for Currency {
    fn default() -> Self {
        Self {
            code: DEFAULT_CURRENCY.to_string(),
            minor_decimals: DEFAULT_MINOR_DECIMALS,
        }
    }
}

impl Currency {
    pub fn new(code: impl Into<String>, minor_decimals: u32) -> Self {
        Self {
            code: code.into(),
            minor_decimals,
        }
    }

    /// Render minor units as a decimal major-unit string, trimming trailing
    /// zeros. e.g. 150 -> "1.5", 100 -> "1", 7 -> "0.07" with 2 decimals.
    pub fn minor_to_major(&self, minor: i64) -> String {
        let sign = if minor < 0 { "-" } else { "" };
        let units = minor.unsigned_abs() as u128;
        if self.minor_decimals == 0 {
            return format!("{sign}{units}");
        }
        let multiplier = 10u128.pow(self.minor_decimals);
        let whole = units / multiplier;
        let fraction = units % multiplier;
        let raw = format!(
            "{}.{:0width$}",
            whole,
            fraction,
            width = self.minor_decimals as usize
        );
        let trimmed = raw.trim_end_matches('0').trim_end_matches('.');
        format!("{sign}{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minor_to_major() {
        let cur = Currency::default();
        assert_eq!(cur.minor_to_major(0), "0");
        assert_eq!(cur.minor_to_major(7), "0.07");
        assert_eq!(cur.minor_to_major(100), "1");
        assert_eq!(cur.minor_to_major(150), "1.5");
        assert_eq!(cur.minor_to_major(12345), "123.45");
    }

    #[test]
    fn test_minor_to_major_other_precisions() {
        assert_eq!(Currency::new("SAT", 0).minor_to_major(42), "42");
        assert_eq!(Currency::new("MNEE", 5).minor_to_major(1), "0.00001");
        assert_eq!(Currency::new("MNEE", 5).minor_to_major(250000), "2.5");
    }
}
