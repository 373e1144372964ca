use std::sync::Arc;
use std::sync::Mutex;

use rust_decimal::Decimal;

#[derive(Debug, thiserror::Error)]
pub enum BalanceError {
    #[error("group {0} balance store unavailable")]
    Unavailable(String),
}

/// Balance source for one billing tenant.
///
/// Amounts are `Decimal` throughout so boundary comparisons are exact.
/// `check_balance` is the pre-request admission read; `consume` is the
/// post-facto debit issued by the async recorder. The debit may drive the
/// balance negative; admission is the only gate.
pub trait BalanceConsumer: Send + Sync {
    fn balance(&self) -> Decimal;
    fn check_balance(&self, amount: Decimal) -> bool;
    fn consume(&self, amount: Decimal) -> Result<(), BalanceError>;
}

/// A billing tenant: the availability sets it may draw channels from plus
/// its balance source. Held for the request lifetime.
#[derive(Clone)]
pub struct Group {
    pub name: String,
    pub available_sets: Vec<String>,
    pub consumer: Arc<dyn BalanceConsumer>,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.name)
            .field("available_sets", &self.available_sets)
            .field("balance", &self.consumer.balance())
            .finish()
    }
}

impl Group {
    pub fn new(
        name: impl Into<String>,
        available_sets: Vec<String>,
        consumer: Arc<dyn BalanceConsumer>,
    ) -> Self {
        Self {
            name: name.into(),
            available_sets,
            consumer,
        }
    }
}

/// In-process balance store seeded at boot.
#[derive(Debug)]
pub struct MemoryBalance {
    remaining: Mutex<Decimal>,
}

impl MemoryBalance {
    pub fn new(initial: Decimal) -> Self {
        Self {
            remaining: Mutex::new(initial),
        }
    }
}

impl BalanceConsumer for MemoryBalance {
    fn balance(&self) -> Decimal {
        *self.remaining.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_balance(&self, amount: Decimal) -> bool {
        self.balance() >= amount
    }

    fn consume(&self, amount: Decimal) -> Result<(), BalanceError> {
        let mut remaining = self.remaining.lock().unwrap_or_else(|e| e.into_inner());
        *remaining -= amount;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn memory_balance_admits_then_debits_exactly() {
        let balance = MemoryBalance::new(dec!(1.0));
        assert!(balance.check_balance(dec!(0.5)));
        assert!(!balance.check_balance(dec!(1.5)));

        balance.consume(dec!(0.7)).unwrap();
        assert_eq!(balance.balance(), dec!(0.3));

        // Post-facto debit may overdraw.
        balance.consume(dec!(0.7)).unwrap();
        assert_eq!(balance.balance(), dec!(-0.4));
    }
}
