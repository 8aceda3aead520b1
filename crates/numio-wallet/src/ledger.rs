use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use numio_core::{LedgerEntryId, Money, NumioError, Timestamp, UserId};

use crate::{EntryKind, LedgerEntry, WalletGateway};

/// sled-backed wallet ledger.
///
/// Trees:
///   balances — user utf8 → bincode((Money, Money))   (balance, held)
///   entries  — LedgerEntryId BE → bincode(LedgerEntry)
///   idem     — key utf8 → LedgerEntryId BE
///
/// A single process-wide mutex serializes balance mutations; contention is a
/// handful of saga and reaper calls per second.
pub struct LedgerWallet {
    db: sled::Db,
    balances: sled::Tree,
    entries: sled::Tree,
    idem: sled::Tree,
    write_lock: Mutex<()>,
    clock: Box<dyn Fn() -> Timestamp + Send + Sync>,
}

fn storage(e: sled::Error) -> NumioError {
    NumioError::Storage(e.to_string())
}

fn ser<T: serde::Serialize>(v: &T) -> Result<Vec<u8>, NumioError> {
    bincode::serialize(v).map_err(|e| NumioError::Serialization(e.to_string()))
}

fn de<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, NumioError> {
    bincode::deserialize(bytes).map_err(|e| NumioError::Serialization(e.to_string()))
}

impl LedgerWallet {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, NumioError> {
        Self::open_with_clock(path, Box::new(|| chrono::Utc::now().timestamp()))
    }

    /// Test constructor with an injectable clock.
    pub fn open_with_clock<P: AsRef<Path>>(
        path: P,
        clock: Box<dyn Fn() -> Timestamp + Send + Sync>,
    ) -> Result<Self, NumioError> {
        let db = sled::open(path).map_err(storage)?;
        let balances = db.open_tree("balances").map_err(storage)?;
        let entries = db.open_tree("entries").map_err(storage)?;
        let idem = db.open_tree("idem").map_err(storage)?;
        Ok(Self { db, balances, entries, idem, write_lock: Mutex::new(()), clock })
    }

    /// Credit a user's balance directly (top-up / test seeding).
    pub fn deposit(&self, user: &UserId, amount: Money) -> Result<(), NumioError> {
        let _guard = self.write_lock.lock().expect("wallet lock poisoned");
        let (balance, held) = self.load_balance(user)?;
        let balance = balance
            .checked_add(amount)
            .ok_or_else(|| NumioError::Wallet("balance overflow".into()))?;
        self.store_balance(user, balance, held)
    }

    fn load_balance(&self, user: &UserId) -> Result<(Money, Money), NumioError> {
        match self.balances.get(user.as_str().as_bytes()).map_err(storage)? {
            Some(bytes) => de(&bytes),
            None => Ok((Money::ZERO, Money::ZERO)),
        }
    }

    fn store_balance(&self, user: &UserId, balance: Money, held: Money) -> Result<(), NumioError> {
        self.balances
            .insert(user.as_str().as_bytes(), ser(&(balance, held))?)
            .map_err(storage)?;
        Ok(())
    }

    fn lookup_idem(&self, key: Option<&str>) -> Result<Option<LedgerEntry>, NumioError> {
        let Some(key) = key else { return Ok(None) };
        match self.idem.get(key.as_bytes()).map_err(storage)? {
            Some(cur) => {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&cur);
                self.load_entry(LedgerEntryId::from_be_bytes(arr))
            }
            None => Ok(None),
        }
    }

    fn load_entry(&self, id: LedgerEntryId) -> Result<Option<LedgerEntry>, NumioError> {
        match self.entries.get(id.to_be_bytes()).map_err(storage)? {
            Some(bytes) => Ok(Some(de(&bytes)?)),
            None => Ok(None),
        }
    }

    fn append_entry(
        &self,
        user: &UserId,
        kind: EntryKind,
        amount: Money,
        reason: &str,
        memo: &str,
        idempotency_key: Option<&str>,
        parent: Option<LedgerEntryId>,
    ) -> Result<LedgerEntry, NumioError> {
        let id = LedgerEntryId(self.db.generate_id().map_err(storage)?);
        let entry = LedgerEntry {
            id,
            user_id: user.clone(),
            kind,
            amount,
            reason: reason.to_string(),
            memo: memo.to_string(),
            idempotency_key: idempotency_key.map(str::to_string),
            parent,
            at: (self.clock)(),
        };
        self.entries
            .insert(id.to_be_bytes(), ser(&entry)?)
            .map_err(storage)?;
        if let Some(key) = idempotency_key {
            self.idem
                .insert(key.as_bytes(), &id.to_be_bytes()[..])
                .map_err(storage)?;
        }
        debug!(user = %user, ?kind, amount = %amount, "ledger entry");
        Ok(entry)
    }

    fn require_entry(&self, id: LedgerEntryId, kind: EntryKind) -> Result<LedgerEntry, NumioError> {
        let entry = self
            .load_entry(id)?
            .ok_or_else(|| NumioError::Wallet(format!("ledger entry {id} not found")))?;
        if entry.kind != kind {
            return Err(NumioError::Wallet(format!(
                "ledger entry {id} is {:?}, expected {:?}",
                entry.kind, kind
            )));
        }
        Ok(entry)
    }

    /// True when `parent_id` already has a settling child of `kind`.
    fn has_child(&self, parent_id: LedgerEntryId, kind: EntryKind) -> Result<bool, NumioError> {
        for item in self.entries.iter() {
            let (_, bytes) = item.map_err(storage)?;
            let e: LedgerEntry = de(&bytes)?;
            if e.parent == Some(parent_id) && e.kind == kind {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl WalletGateway for LedgerWallet {
    async fn available_balance(&self, user: &UserId) -> Result<Money, NumioError> {
        let (balance, held) = self.load_balance(user)?;
        balance
            .checked_sub(held)
            .ok_or_else(|| NumioError::Wallet("held exceeds balance".into()))
    }

    async fn reserve(
        &self,
        user: &UserId,
        amount: Money,
        reason: &str,
        memo: &str,
        idempotency_key: Option<&str>,
    ) -> Result<LedgerEntry, NumioError> {
        let _guard = self.write_lock.lock().expect("wallet lock poisoned");
        if let Some(prior) = self.lookup_idem(idempotency_key)? {
            return Ok(prior);
        }
        if amount.is_negative() || amount == Money::ZERO {
            return Err(NumioError::Wallet("reserve amount must be positive".into()));
        }
        let (balance, held) = self.load_balance(user)?;
        let available = balance
            .checked_sub(held)
            .ok_or_else(|| NumioError::Wallet("held exceeds balance".into()))?;
        if available < amount {
            return Err(NumioError::InsufficientBalance { need: amount, have: available });
        }
        let held = held
            .checked_add(amount)
            .ok_or_else(|| NumioError::Wallet("hold overflow".into()))?;
        self.store_balance(user, balance, held)?;
        self.append_entry(user, EntryKind::Reserve, amount, reason, memo, idempotency_key, None)
    }

    async fn commit(
        &self,
        reserve_entry: LedgerEntryId,
        idempotency_key: Option<&str>,
    ) -> Result<LedgerEntry, NumioError> {
        let _guard = self.write_lock.lock().expect("wallet lock poisoned");
        if let Some(prior) = self.lookup_idem(idempotency_key)? {
            return Ok(prior);
        }
        let reserve = self.require_entry(reserve_entry, EntryKind::Reserve)?;
        if self.has_child(reserve_entry, EntryKind::Commit)? {
            return Err(NumioError::Wallet(format!(
                "reservation {reserve_entry} already committed"
            )));
        }
        if self.has_child(reserve_entry, EntryKind::Rollback)? {
            return Err(NumioError::Wallet(format!(
                "reservation {reserve_entry} already rolled back"
            )));
        }
        let (balance, held) = self.load_balance(&reserve.user_id)?;
        let balance = balance
            .checked_sub(reserve.amount)
            .ok_or_else(|| NumioError::Wallet("balance underflow on commit".into()))?;
        let held = held
            .checked_sub(reserve.amount)
            .ok_or_else(|| NumioError::Wallet("held underflow on commit".into()))?;
        self.store_balance(&reserve.user_id, balance, held)?;
        self.append_entry(
            &reserve.user_id,
            EntryKind::Commit,
            reserve.amount,
            &reserve.reason,
            &reserve.memo,
            idempotency_key,
            Some(reserve_entry),
        )
    }

    async fn rollback(
        &self,
        reserve_entry: LedgerEntryId,
        idempotency_key: Option<&str>,
    ) -> Result<LedgerEntry, NumioError> {
        let _guard = self.write_lock.lock().expect("wallet lock poisoned");
        if let Some(prior) = self.lookup_idem(idempotency_key)? {
            return Ok(prior);
        }
        let reserve = self.require_entry(reserve_entry, EntryKind::Reserve)?;
        if self.has_child(reserve_entry, EntryKind::Rollback)? {
            // Re-delivered rollback: the hold is already released.
            return self
                .entries_lookup_child(reserve_entry, EntryKind::Rollback)
                .map(|e| e.expect("rollback child exists"));
        }
        if self.has_child(reserve_entry, EntryKind::Commit)? {
            return Err(NumioError::Wallet(format!(
                "reservation {reserve_entry} already committed"
            )));
        }
        let (balance, held) = self.load_balance(&reserve.user_id)?;
        let held = held
            .checked_sub(reserve.amount)
            .ok_or_else(|| NumioError::Wallet("held underflow on rollback".into()))?;
        self.store_balance(&reserve.user_id, balance, held)?;
        self.append_entry(
            &reserve.user_id,
            EntryKind::Rollback,
            reserve.amount,
            &reserve.reason,
            &reserve.memo,
            idempotency_key,
            Some(reserve_entry),
        )
    }

    async fn refund(
        &self,
        commit_entry: LedgerEntryId,
        reason: &str,
        idempotency_key: Option<&str>,
    ) -> Result<LedgerEntry, NumioError> {
        let _guard = self.write_lock.lock().expect("wallet lock poisoned");
        if let Some(prior) = self.lookup_idem(idempotency_key)? {
            return Ok(prior);
        }
        let commit = self.require_entry(commit_entry, EntryKind::Commit)?;
        if self.has_child(commit_entry, EntryKind::Refund)? {
            return self
                .entries_lookup_child(commit_entry, EntryKind::Refund)
                .map(|e| e.expect("refund child exists"));
        }
        let (balance, held) = self.load_balance(&commit.user_id)?;
        let balance = balance
            .checked_add(commit.amount)
            .ok_or_else(|| NumioError::Wallet("balance overflow on refund".into()))?;
        self.store_balance(&commit.user_id, balance, held)?;
        self.append_entry(
            &commit.user_id,
            EntryKind::Refund,
            commit.amount,
            reason,
            &commit.memo,
            idempotency_key,
            Some(commit_entry),
        )
    }

    async fn get_entry(&self, id: LedgerEntryId) -> Result<Option<LedgerEntry>, NumioError> {
        self.load_entry(id)
    }

    async fn entries_for_user(&self, user: &UserId) -> Result<Vec<LedgerEntry>, NumioError> {
        let mut result = Vec::new();
        for item in self.entries.iter() {
            let (_, bytes) = item.map_err(storage)?;
            let e: LedgerEntry = de(&bytes)?;
            if e.user_id == *user {
                result.push(e);
            }
        }
        result.sort_by_key(|e| e.id);
        Ok(result)
    }
}

impl LedgerWallet {
    fn entries_lookup_child(
        &self,
        parent_id: LedgerEntryId,
        kind: EntryKind,
    ) -> Result<Option<LedgerEntry>, NumioError> {
        for item in self.entries.iter() {
            let (_, bytes) = item.map_err(storage)?;
            let e: LedgerEntry = de(&bytes)?;
            if e.parent == Some(parent_id) && e.kind == kind {
                return Ok(Some(e));
            }
        }
        Ok(None)
    }
}
