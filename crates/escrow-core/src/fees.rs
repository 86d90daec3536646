use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::models::ArbiterFee;

/// Fee owed to the arbiter on the refund-buyer branch, never more than `amount`.
pub fn arbiter_fee(amount: u64, fee: &ArbiterFee) -> u64 {
    match fee {
        ArbiterFee::None => 0,
        ArbiterFee::Percentage(pct) => {
            let raw = (Decimal::from(amount) * *pct / Decimal::ONE_HUNDRED).floor();
            raw.to_u64().unwrap_or(amount).min(amount)
        }
        ArbiterFee::Flat(flat) => (*flat).min(amount),
    }
}
