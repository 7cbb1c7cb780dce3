use std::{fmt, iter::Sum, ops::Add};

use rust_decimal::{prelude::ToPrimitive, Decimal, RoundingStrategy};
use serde::{Serialize, Serializer};

pub const SCALE: u32 = 6;
const UNITS_PER_TOKEN: i64 = 1_000_000;

/// Token amount stored as a whole number of micro-units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_units(units: i64) -> Self {
        Self(units)
    }

    pub fn units(self) -> i64 {
        self.0
    }

    /// Rounds half-to-even to the smallest unit. Saturates outside the i64 range.
    pub fn from_decimal(value: Decimal) -> Self {
        let rounded = value.round_dp_with_strategy(SCALE, RoundingStrategy::MidpointNearestEven);
        let saturated = if rounded.is_sign_negative() {
            i64::MIN
        } else {
            i64::MAX
        };
        let units = rounded
            .checked_mul(Decimal::from(UNITS_PER_TOKEN))
            .and_then(|scaled| scaled.to_i64())
            .unwrap_or(saturated);
        Self(units)
    }

    pub fn to_decimal(self) -> Decimal {
        Decimal::new(self.0, SCALE)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Add for Amount {
    type Output = Amount;

    fn add(self, rhs: Amount) -> Amount {
        Amount(self.0.saturating_add(rhs.0))
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, Add::add)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_decimal())
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::Amount;

    #[test]
    fn rounds_half_to_even_at_micro_units() {
        assert_eq!(Amount::from_decimal(Decimal::new(15, 7)).units(), 2);
        assert_eq!(Amount::from_decimal(Decimal::new(25, 7)).units(), 2);
        assert_eq!(Amount::from_decimal(Decimal::new(12, 4)).units(), 1_200);
    }

    #[test]
    fn saturates_instead_of_overflowing() {
        assert_eq!(Amount::from_decimal(Decimal::MAX).units(), i64::MAX);
        assert_eq!(Amount::from_decimal(Decimal::MIN).units(), i64::MIN);
        let huge = Decimal::from_i128_with_scale(80_000_000_000_000_000_000_000, 0);
        assert_eq!(Amount::from_decimal(huge).units(), i64::MAX);
    }

    #[test]
    fn displays_fixed_scale() {
        assert_eq!(Amount::from_units(1_500).to_string(), "0.001500");
        assert_eq!(Amount::from_units(10_000_000).to_string(), "10.000000");
    }

    #[test]
    fn sums_without_float_drift() {
        let tenth = Amount::from_decimal(Decimal::new(1, 1));
        let total: Amount = std::iter::repeat(tenth).take(10).sum();
        assert_eq!(total.to_decimal(), Decimal::ONE);
    }
}
