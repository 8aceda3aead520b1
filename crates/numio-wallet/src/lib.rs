//! Wallet gateway: reserve / commit / rollback / refund of user funds.
//!
//! The core only depends on the `WalletGateway` trait; `LedgerWallet` is the
//! bundled sled-backed implementation. Every operation is idempotent on its
//! optional key — retried calls return the original entry instead of moving
//! money twice.

pub mod ledger;

pub use ledger::LedgerWallet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use numio_core::{LedgerEntryId, Money, NumioError, Timestamp, UserId};

/// What a ledger entry did to the user's funds.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum EntryKind {
    /// Funds moved from available to held.
    Reserve,
    /// Held funds captured; the charge is final.
    Commit,
    /// Held funds returned; the reservation never charged.
    Rollback,
    /// Committed funds returned after the fact.
    Refund,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub user_id: UserId,
    pub kind: EntryKind,
    pub amount: Money,
    pub reason: String,
    pub memo: String,
    pub idempotency_key: Option<String>,
    /// For commit/rollback: the reserve entry being settled.
    /// For refund: the commit entry being reversed.
    pub parent: Option<LedgerEntryId>,
    pub at: Timestamp,
}

#[async_trait]
pub trait WalletGateway: Send + Sync {
    /// Funds the user can spend right now (balance minus holds).
    async fn available_balance(&self, user: &UserId) -> Result<Money, NumioError>;

    /// Hold `amount` of the user's funds. Fails with `InsufficientBalance`.
    async fn reserve(
        &self,
        user: &UserId,
        amount: Money,
        reason: &str,
        memo: &str,
        idempotency_key: Option<&str>,
    ) -> Result<LedgerEntry, NumioError>;

    /// Capture a prior reservation; the charge becomes final.
    async fn commit(
        &self,
        reserve_entry: LedgerEntryId,
        idempotency_key: Option<&str>,
    ) -> Result<LedgerEntry, NumioError>;

    /// Release a prior reservation without charging.
    async fn rollback(
        &self,
        reserve_entry: LedgerEntryId,
        idempotency_key: Option<&str>,
    ) -> Result<LedgerEntry, NumioError>;

    /// Return committed funds to the user.
    async fn refund(
        &self,
        commit_entry: LedgerEntryId,
        reason: &str,
        idempotency_key: Option<&str>,
    ) -> Result<LedgerEntry, NumioError>;

    async fn get_entry(&self, id: LedgerEntryId) -> Result<Option<LedgerEntry>, NumioError>;

    /// All entries for a user, oldest first (test and audit surface).
    async fn entries_for_user(&self, user: &UserId) -> Result<Vec<LedgerEntry>, NumioError>;
}
