//! Exact `num/den` ratios for time bases, frame rates and aspect ratios.

use serde::{Deserialize, Serialize};

/// An exact ratio. Media metadata carries these instead of floats so that
/// time bases survive serialization and comparison without drift.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    /// Numerator.
    pub num: i32,
    /// Denominator.
    pub den: i32,
}

impl Rational {
    /// A new ratio. A zero denominator is representable (some containers
    /// report unknown rates as `0/1` or `0/0`); callers decide what it means.
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Approximate value as a float; zero when the denominator is zero.
    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            f64::from(self.num) / f64::from(self.den)
        }
    }

    /// The `num/den` form used inside engine filter argument strings.
    pub fn as_arg(&self) -> String {
        format!("{}/{}", self.num, self.den)
    }
}

impl std::fmt::Display for Rational {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_f64_handles_zero_denominator() {
        assert_eq!(Rational::new(1, 0).as_f64(), 0.0);
        assert_eq!(Rational::new(1, 2).as_f64(), 0.5);
    }

    #[test]
    fn arg_form_matches_engine_expectations() {
        assert_eq!(Rational::new(1, 48000).as_arg(), "1/48000");
    }
}
