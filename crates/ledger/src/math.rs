//! Margin and liquidation closed forms.

use perp_core::Direction;
use rust_decimal::Decimal;

/// Liquidation price for an isolated position.
///
/// Longs: `entry * (1 - 1/leverage + maintenance_rate)`
/// Shorts: `entry * (1 + 1/leverage - maintenance_rate)`
#[must_use]
pub fn liquidation_price(
    entry: Decimal,
    leverage: u32,
    maintenance_rate: Decimal,
    direction: Direction,
) -> Decimal {
    let inverse_leverage = Decimal::ONE / Decimal::from(leverage.max(1));
    match direction {
        Direction::Long => entry * (Decimal::ONE - inverse_leverage + maintenance_rate),
        Direction::Short => entry * (Decimal::ONE + inverse_leverage - maintenance_rate),
    }
}

/// Margin for a notional at a leverage: `notional / leverage`.
#[must_use]
pub fn margin_for(notional: Decimal, leverage: u32) -> Decimal {
    notional / Decimal::from(leverage.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn liquidation_long_closed_form() {
        // 50_000 * (1 - 0.1 + 0.005) = 45_250
        let liq = liquidation_price(dec!(50000), 10, dec!(0.005), Direction::Long);
        assert_eq!(liq, dec!(45250));
    }

    #[test]
    fn liquidation_short_closed_form() {
        // 50_000 * (1 + 0.1 - 0.005) = 54_750
        let liq = liquidation_price(dec!(50000), 10, dec!(0.005), Direction::Short);
        assert_eq!(liq, dec!(54750));
    }

    #[test]
    fn liquidation_monotonic_in_leverage() {
        // Higher leverage moves the long liquidation price closer to entry.
        let mut prev = liquidation_price(dec!(50000), 2, dec!(0.005), Direction::Long);
        for leverage in [3u32, 5, 10, 20, 50] {
            let liq = liquidation_price(dec!(50000), leverage, dec!(0.005), Direction::Long);
            assert!(liq > prev, "long liq must rise with leverage");
            prev = liq;
        }

        let mut prev = liquidation_price(dec!(50000), 2, dec!(0.005), Direction::Short);
        for leverage in [3u32, 5, 10, 20, 50] {
            let liq = liquidation_price(dec!(50000), leverage, dec!(0.005), Direction::Short);
            assert!(liq < prev, "short liq must fall with leverage");
            prev = liq;
        }
    }

    #[test]
    fn margin_is_notional_over_leverage() {
        assert_eq!(margin_for(dec!(100000), 10), dec!(10000));
        assert_eq!(margin_for(dec!(100000), 1), dec!(100000));
    }
}
