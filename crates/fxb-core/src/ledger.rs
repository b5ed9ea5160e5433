//! Append-only ledger of monetary effects.

use crate::account::AccountId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Kind of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LedgerEntryKind {
    Deposit,
    Withdrawal,
    RealizedPl,
    Commission,
    Swap,
    Bonus,
    Adjustment,
}

/// One monetary effect on an account.
///
/// Invariant: the account balance always equals the `balance_after` of its
/// most recent entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub account: AccountId,
    pub kind: LedgerEntryKind,
    /// Signed amount in account currency.
    pub amount: Decimal,
    /// Balance snapshot after applying `amount`.
    pub balance_after: Decimal,
    pub timestamp_ms: i64,
    /// Free-form reference (position id, admin note).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl LedgerEntry {
    pub fn new(
        account: AccountId,
        kind: LedgerEntryKind,
        amount: Decimal,
        balance_after: Decimal,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            account,
            kind,
            amount,
            balance_after,
            timestamp_ms,
            reference: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn entry_reference() {
        let e = LedgerEntry::new(
            AccountId::new(1001),
            LedgerEntryKind::RealizedPl,
            dec!(-16.00),
            dec!(9984.00),
            1_705_778_200_000,
        )
        .with_reference("position:42");
        assert_eq!(e.reference.as_deref(), Some("position:42"));
        assert_eq!(
            serde_json::to_value(&e).unwrap()["kind"],
            "realized-pl"
        );
    }
}
