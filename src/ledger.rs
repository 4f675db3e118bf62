use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One user's spendable credits. Free credits are promotional and consumed
/// first; paid credits are purchased, consumed second, and the only bucket
/// refunds land in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    #[serde(rename = "freeRemaining")]
    pub free_remaining: i64,
    #[serde(rename = "paidBalance")]
    pub paid_balance: i64,
}

impl Balance {
    pub fn total(&self) -> i64 {
        self.free_remaining + self.paid_balance
    }
}

/// Append-only audit entry. The balance row stays authoritative: a failed
/// append is logged and swallowed, never propagated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub user_id: String,
    pub amount: i64,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient credits: {available} available, {requested} requested")]
    Insufficient { available: i64, requested: i64 },
    #[error("credit amount must be positive, got {0}")]
    InvalidAmount(i64),
    #[error("balance persistence failed: {0}")]
    Persistence(String),
}

/// Persistence seam for the balance row. `compare_and_swap` must only apply
/// the update when the stored pair still equals `expected`, reporting whether
/// a row was matched; that is what makes a charge atomic relative to its own
/// precondition.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    async fn fetch(&self, user_id: &str) -> anyhow::Result<Option<Balance>>;
    async fn compare_and_swap(
        &self,
        user_id: &str,
        expected: Balance,
        next: Balance,
    ) -> anyhow::Result<bool>;
    /// Returns false when a row for the user already exists.
    async fn insert(&self, user_id: &str, initial: Balance) -> anyhow::Result<bool>;
    async fn append_transaction(&self, entry: &CreditTransaction) -> anyhow::Result<()>;
}

/// How a charge of `amount` splits across the two buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeSplit {
    pub from_free: i64,
    pub from_paid: i64,
}

/// Free-first deduction. Returns None when the combined balance cannot cover
/// the amount.
pub fn plan_charge(balance: Balance, amount: i64) -> Option<ChargeSplit> {
    if balance.total() < amount {
        return None;
    }
    let from_free = balance.free_remaining.min(amount);
    Some(ChargeSplit {
        from_free,
        from_paid: amount - from_free,
    })
}

const MAX_SWAP_ATTEMPTS: u32 = 5;

#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn BalanceStore>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn BalanceStore>) -> Self {
        Self { store }
    }

    /// Side-effect-free read; a missing row reads as a zeroed balance.
    pub async fn get_balance(&self, user_id: &str) -> Result<Balance, LedgerError> {
        let balance = self
            .store
            .fetch(user_id)
            .await
            .map_err(|error| LedgerError::Persistence(error.to_string()))?;
        Ok(balance.unwrap_or_default())
    }

    /// Deducts `amount` free-first. The balance is re-read and re-evaluated on
    /// every swap conflict, so two concurrent charges can never both commit
    /// against the same starting balance.
    pub async fn charge(
        &self,
        user_id: &str,
        amount: i64,
        description: &str,
    ) -> Result<Balance, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        for _ in 0..MAX_SWAP_ATTEMPTS {
            let current = self.get_balance(user_id).await?;
            let split = plan_charge(current, amount).ok_or(LedgerError::Insufficient {
                available: current.total(),
                requested: amount,
            })?;
            let next = Balance {
                free_remaining: current.free_remaining - split.from_free,
                paid_balance: current.paid_balance - split.from_paid,
            };

            let applied = self
                .store
                .compare_and_swap(user_id, current, next)
                .await
                .map_err(|error| LedgerError::Persistence(error.to_string()))?;
            if applied {
                self.record_transaction(user_id, -amount, description).await;
                return Ok(next);
            }
        }

        Err(LedgerError::Persistence(format!(
            "balance for {user_id} kept changing underneath the charge"
        )))
    }

    /// Credits `amount` to the paid bucket. Refunds never restore free
    /// credits: those are promotional and not owed back.
    pub async fn refund(
        &self,
        user_id: &str,
        amount: i64,
        description: &str,
    ) -> Result<Balance, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        for _ in 0..MAX_SWAP_ATTEMPTS {
            let current = self
                .store
                .fetch(user_id)
                .await
                .map_err(|error| LedgerError::Persistence(error.to_string()))?;

            match current {
                Some(current) => {
                    let next = Balance {
                        free_remaining: current.free_remaining,
                        paid_balance: current.paid_balance + amount,
                    };
                    let applied = self
                        .store
                        .compare_and_swap(user_id, current, next)
                        .await
                        .map_err(|error| LedgerError::Persistence(error.to_string()))?;
                    if applied {
                        self.record_transaction(user_id, amount, description).await;
                        return Ok(next);
                    }
                }
                None => {
                    let initial = Balance {
                        free_remaining: 0,
                        paid_balance: amount,
                    };
                    let created = self
                        .store
                        .insert(user_id, initial)
                        .await
                        .map_err(|error| LedgerError::Persistence(error.to_string()))?;
                    if created {
                        self.record_transaction(user_id, amount, description).await;
                        return Ok(initial);
                    }
                    // Row appeared between the fetch and the insert; retry as
                    // a plain swap.
                }
            }
        }

        Err(LedgerError::Persistence(format!(
            "balance for {user_id} kept changing underneath the refund"
        )))
    }

    async fn record_transaction(&self, user_id: &str, amount: i64, description: &str) {
        let entry = CreditTransaction {
            user_id: user_id.to_string(),
            amount,
            description: description.to_string(),
            created_at: Utc::now(),
        };
        if let Err(error) = self.store.append_transaction(&entry).await {
            tracing::warn!(
                user_id,
                amount,
                error = %error,
                "failed to append credit transaction; balance already committed"
            );
        }
    }
}
