//! Credit-based admission control for commit pipelines.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, warn};

use commitpulse_core::AccountId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("insufficient credits: {required} required, {available} available")]
    InsufficientCredits {
        required: u64,
        available: u64,
        billing_url: String,
    },
    #[error("credit ledger unavailable: {0}")]
    Ledger(String),
}

/// External billing ledger.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Remaining credits of an account. Unknown accounts have zero.
    async fn balance(&self, account_id: AccountId) -> Result<u64, AdmissionError>;
}

/// In-memory ledger for tests and dev mode.
#[derive(Debug, Default)]
pub struct InMemoryCreditLedger {
    balances: RwLock<HashMap<AccountId, u64>>,
    /// Balance reported for accounts never set
    default_balance: u64,
}

impl InMemoryCreditLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger that reports `balance` for every unknown account.
    pub fn with_default_balance(balance: u64) -> Self {
        Self {
            balances: RwLock::new(HashMap::new()),
            default_balance: balance,
        }
    }

    pub fn set_balance(&self, account_id: AccountId, balance: u64) {
        if let Ok(mut balances) = self.balances.write() {
            balances.insert(account_id, balance);
        }
    }
}

#[async_trait]
impl CreditLedger for InMemoryCreditLedger {
    async fn balance(&self, account_id: AccountId) -> Result<u64, AdmissionError> {
        let balances = self
            .balances
            .read()
            .map_err(|_| AdmissionError::Ledger("ledger lock poisoned".to_string()))?;
        Ok(balances.get(&account_id).copied().unwrap_or(self.default_balance))
    }
}

/// Refuses pipelines for accounts below the required balance.
#[derive(Clone)]
pub struct AdmissionGate {
    ledger: Arc<dyn CreditLedger>,
    required: u64,
    billing_url: String,
}

impl AdmissionGate {
    pub fn new(ledger: Arc<dyn CreditLedger>, required: u64, billing_url: impl Into<String>) -> Self {
        Self {
            ledger,
            required,
            billing_url: billing_url.into(),
        }
    }

    pub fn required(&self) -> u64 {
        self.required
    }

    /// Returns the available balance when the account may proceed.
    pub async fn check(&self, account_id: AccountId) -> Result<u64, AdmissionError> {
        let available = self.ledger.balance(account_id).await?;
        if available < self.required {
            warn!(
                account_id = %account_id,
                required = self.required,
                available,
                "admission refused: insufficient credits"
            );
            return Err(AdmissionError::InsufficientCredits {
                required: self.required,
                available,
                billing_url: self.billing_url.clone(),
            });
        }

        debug!(account_id = %account_id, available, "admission granted");
        Ok(available)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn account_with_enough_credits_is_admitted() {
        let ledger = Arc::new(InMemoryCreditLedger::new());
        let account = AccountId::new();
        ledger.set_balance(account, 5);
        let gate = AdmissionGate::new(ledger, 1, "/billing");

        assert_eq!(gate.check(account).await, Ok(5));
    }

    #[tokio::test]
    async fn short_account_is_sent_to_billing() {
        let ledger = Arc::new(InMemoryCreditLedger::new());
        let gate = AdmissionGate::new(ledger, 2, "/billing?plan=pro");

        let err = gate.check(AccountId::new()).await.unwrap_err();
        assert_eq!(
            err,
            AdmissionError::InsufficientCredits {
                required: 2,
                available: 0,
                billing_url: "/billing?plan=pro".into()
            }
        );
    }
}
