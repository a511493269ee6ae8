//! Decimal and on-chain integer conversions for vault amounts.

use anyhow::{anyhow, Context, Result};
use ethers::types::U256;
use ethers::utils::{format_units, parse_units, ParseUnits};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::str::FromStr;

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Share of `amount` in `total` as a float weight. Zero when total is zero.
pub fn weight_of(amount: Decimal, total: Decimal) -> f64 {
    safe_div(amount, total).to_f64().unwrap_or(0.0)
}

/// Scale a total by a float weight, rounded to `decimals` places.
pub fn scale_by_weight(total: Decimal, weight: f64, decimals: u32) -> Result<Decimal> {
    let weight = Decimal::from_f64(weight).ok_or_else(|| anyhow!("weight {weight} is not representable"))?;
    Ok((total * weight).round_dp(decimals))
}

/// Convert basis points to a fraction (500 bps = 0.05).
pub fn bps_to_fraction(bps: u64) -> f64 {
    bps as f64 / 10_000.0
}

/// Convert a raw token amount to a decimal in whole asset units.
pub fn u256_to_decimal(value: U256, decimals: u32) -> Result<Decimal> {
    let formatted = format_units(value, decimals as usize)
        .map_err(|e| anyhow!("failed to format amount {value}: {e}"))?;
    Decimal::from_str(&formatted).with_context(|| format!("amount {formatted} out of decimal range"))
}

/// Convert a decimal amount in asset units to the raw on-chain integer.
///
/// Fractions finer than the token's precision are truncated.
pub fn decimal_to_u256(value: Decimal, decimals: u32) -> Result<U256> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(anyhow!("negative amount {value}"));
    }
    let truncated = value.trunc_with_scale(decimals).normalize();
    match parse_units(truncated.to_string(), decimals as usize)
        .map_err(|e| anyhow!("failed to parse amount {truncated}: {e}"))?
    {
        ParseUnits::U256(raw) => Ok(raw),
        ParseUnits::I256(_) => Err(anyhow!("negative amount {value}")),
    }
}
