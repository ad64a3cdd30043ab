//! USD price arithmetic.
//!
//! All USD values are scaled by 1e18 (`$1 = 1e18`). Token prices are expressed per 1e18 of
//! the token's smallest denomination, so `amount × price / 1e18` is a USD value regardless of
//! the token's decimals.

use crate::{
    constants::{FEE_BOOSTING_OVERHEAD_GAS, ONE_E18, PPB},
    error::ExecutionError,
    types::TimestampedPrice,
};
use alloy::primitives::{Address, U256, map::HashMap};
use std::time::Duration;

/// Converts a USD price per whole token into a USD price per 1e18 base units.
///
/// 1 USDC (6 decimals) at $1 gives `1e18 × 1e18 / 1e6 = 1e30`.
pub fn usd_per_1e18_token_amount(price: U256, decimals: u8) -> U256 {
    price.saturating_mul(U256::from(ONE_E18)) / U256::from(10).pow(U256::from(decimals))
}

/// Converts a gas price in native wei into USD using the native token's USD price.
pub fn denote_in_usd(gas_price: U256, native_price_usd: U256) -> U256 {
    gas_price.saturating_mul(native_price_usd) / U256::from(ONE_E18)
}

/// USD value of `amount` of a token priced at `price_usd`.
pub fn token_value_usd(amount: U256, price_usd: U256) -> U256 {
    amount.saturating_mul(price_usd) / U256::from(ONE_E18)
}

/// Boosts a fee linearly with the time its message has been waiting, so that underpriced
/// messages eventually become executable as their wait grows.
pub fn wait_boosted_fee(wait: Duration, fee: U256, relative_boost_per_wait_hour: f64) -> U256 {
    let boost = wait.as_secs_f64() / 3600.0 * relative_boost_per_wait_hour;
    if !boost.is_finite() || boost <= 0.0 {
        return fee;
    }
    let boost_ppb = U256::from((boost * PPB as f64) as u128);
    fee.saturating_add(fee.saturating_mul(boost_ppb) / U256::from(PPB))
}

/// USD cost of executing a message with `gas_limit` on the destination chain.
pub fn exec_cost_usd(gas_limit: U256, gas_price: U256, dest_native_price_usd: U256) -> U256 {
    gas_limit
        .saturating_add(U256::from(FEE_BOOSTING_OVERHEAD_GAS))
        .saturating_mul(gas_price)
        .saturating_mul(dest_native_price_usd)
        / U256::from(ONE_E18)
}

/// Checks prices returned for `tokens` by a price registry and maps them by token.
///
/// There must be exactly one price per requested token, no price may be zero, and a token
/// requested twice must be priced consistently.
pub fn validate_token_prices(
    tokens: &[Address],
    prices: &[TimestampedPrice],
) -> Result<HashMap<Address, U256>, ExecutionError> {
    if tokens.len() != prices.len() {
        return Err(ExecutionError::TokenPricesLength { expected: tokens.len(), got: prices.len() });
    }

    let mut validated = HashMap::with_capacity_and_hasher(tokens.len(), Default::default());
    for (token, price) in tokens.iter().zip(prices) {
        if price.value.is_zero() {
            return Err(ExecutionError::ZeroTokenPrice(*token));
        }
        if let Some(existing) = validated.insert(*token, price.value)
            && existing != price.value
        {
            return Err(ExecutionError::InconsistentTokenPrice {
                token: *token,
                first: existing,
                second: price.value,
            });
        }
    }
    Ok(validated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::address;
    use chrono::Utc;
    use rstest::rstest;

    fn e18(n: u64) -> U256 {
        U256::from(n) * U256::from(ONE_E18)
    }

    #[rstest]
    #[case(e18(1), 6, U256::from(10).pow(U256::from(30)))]
    #[case(e18(2), 18, e18(2))]
    #[case(e18(5), 0, e18(5) * U256::from(ONE_E18))]
    fn test_usd_per_1e18_token_amount(#[case] price: U256, #[case] decimals: u8, #[case] expected: U256) {
        assert_eq!(usd_per_1e18_token_amount(price, decimals), expected);
    }

    #[test]
    fn test_denote_in_usd() {
        // 20 gwei at $2000 per native token
        let gas_price = U256::from(20_000_000_000u64);
        assert_eq!(denote_in_usd(gas_price, e18(2000)), U256::from(40_000_000_000_000u64));
    }

    #[test]
    fn test_wait_boosted_fee() {
        let fee = U256::from(1_000_000u64);
        assert_eq!(wait_boosted_fee(Duration::ZERO, fee, 0.7), fee);
        assert_eq!(wait_boosted_fee(Duration::from_secs(3600), fee, 0.5), U256::from(1_500_000u64));
        assert_eq!(wait_boosted_fee(Duration::from_secs(7200), fee, 0.5), U256::from(2_000_000u64));
        assert_eq!(wait_boosted_fee(Duration::from_secs(7200), fee, 0.0), fee);
    }

    #[test]
    fn test_wait_boost_is_monotonic() {
        let fee = e18(3);
        let mut last = U256::ZERO;
        for minutes in (0..600).step_by(7) {
            let boosted = wait_boosted_fee(Duration::from_secs(minutes * 60), fee, 0.07);
            assert!(boosted >= last);
            last = boosted;
        }
    }

    #[test]
    fn test_exec_cost() {
        let cost = exec_cost_usd(U256::from(100_000), U256::from(10), e18(2));
        assert_eq!(cost, U256::from((100_000 + FEE_BOOSTING_OVERHEAD_GAS) * 10 * 2));
    }

    #[test]
    fn test_validate_token_prices() {
        let a = address!("000000000000000000000000000000000000000a");
        let b = address!("000000000000000000000000000000000000000b");
        let now = Utc::now();
        let price = |v: u64| TimestampedPrice { value: U256::from(v), timestamp: now };

        let prices = validate_token_prices(&[a, b, a], &[price(1), price(2), price(1)]).unwrap();
        assert_eq!(prices.len(), 2);
        assert_eq!(prices[&b], U256::from(2));

        assert!(matches!(
            validate_token_prices(&[a], &[]),
            Err(ExecutionError::TokenPricesLength { expected: 1, got: 0 })
        ));
        assert!(matches!(
            validate_token_prices(&[a], &[price(0)]),
            Err(ExecutionError::ZeroTokenPrice(token)) if token == a
        ));
        assert!(matches!(
            validate_token_prices(&[a, a], &[price(1), price(2)]),
            Err(ExecutionError::InconsistentTokenPrice { .. })
        ));
    }
}
