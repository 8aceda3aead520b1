//! The cache keyspace: due-index, TTL locks, breaker counters.
//!
//! Backed by dedicated sled trees with the same contracts a shared cache
//! would offer — a sorted set with range-by-score for the due-index, and a
//! guarded insert-if-absent with expiry for locks — so the coordination
//! surface stays swappable without touching its consumers.

use numio_core::{ActivationId, EpochMs, NumioError, PollCursor, Timestamp};

fn storage(e: sled::Error) -> NumioError {
    NumioError::Storage(e.to_string())
}

/// Sorted due-index plus distributed locks and poll cursors.
///
/// Trees:
///   due_index    — score BE(u64) ‖ ActivationId BE → []   (range-by-score)
///   due_by_id    — ActivationId BE → score BE(u64)        (O(1) removal)
///   locks        — key utf8 → expiry Timestamp BE         (SET NX EX)
///   poll_state   — ActivationId BE → bincode(PollCursor)
pub struct CacheStore {
    due_index: sled::Tree,
    due_by_id: sled::Tree,
    locks: sled::Tree,
    poll_state: sled::Tree,
}

impl CacheStore {
    pub fn open(store: &crate::Store) -> Result<Self, NumioError> {
        let db = store.inner();
        Ok(Self {
            due_index: db.open_tree("due_index").map_err(storage)?,
            due_by_id: db.open_tree("due_by_id").map_err(storage)?,
            locks: db.open_tree("locks").map_err(storage)?,
            poll_state: db.open_tree("poll_state").map_err(storage)?,
        })
    }

    fn score_key(score: EpochMs, id: ActivationId) -> [u8; 16] {
        let mut key = [0u8; 16];
        // Scores are non-negative epoch-ms; the u64 cast preserves order.
        key[..8].copy_from_slice(&(score as u64).to_be_bytes());
        key[8..].copy_from_slice(&id.to_be_bytes());
        key
    }

    // ── Due-index ────────────────────────────────────────────────────────────

    /// Upsert `id` with the given due score, replacing any previous score.
    pub fn due_add(&self, id: ActivationId, score: EpochMs) -> Result<(), NumioError> {
        self.due_remove(id)?;
        self.due_index
            .insert(Self::score_key(score, id), &[][..])
            .map_err(storage)?;
        self.due_by_id
            .insert(id.to_be_bytes(), &(score as u64).to_be_bytes()[..])
            .map_err(storage)?;
        Ok(())
    }

    pub fn due_remove(&self, id: ActivationId) -> Result<(), NumioError> {
        if let Some(score_bytes) = self.due_by_id.remove(id.to_be_bytes()).map_err(storage)? {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(&score_bytes);
            let score = u64::from_be_bytes(arr) as EpochMs;
            self.due_index
                .remove(Self::score_key(score, id))
                .map_err(storage)?;
        }
        Ok(())
    }

    /// Ids with score ≤ `now_ms`, ascending by due time.
    pub fn due_fetch(&self, now_ms: EpochMs) -> Result<Vec<ActivationId>, NumioError> {
        let upper = Self::score_key(now_ms, ActivationId(u64::MAX));
        let mut result = Vec::new();
        for item in self.due_index.range(..=&upper[..]) {
            let (key, _) = item.map_err(storage)?;
            let mut arr = [0u8; 8];
            arr.copy_from_slice(&key[8..16]);
            result.push(ActivationId::from_be_bytes(arr));
        }
        Ok(result)
    }

    pub fn due_score(&self, id: ActivationId) -> Result<Option<EpochMs>, NumioError> {
        match self.due_by_id.get(id.to_be_bytes()).map_err(storage)? {
            Some(bytes) => {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&bytes);
                Ok(Some(u64::from_be_bytes(arr) as EpochMs))
            }
            None => Ok(None),
        }
    }

    pub fn due_len(&self) -> usize {
        self.due_by_id.len()
    }

    // ── Poll cursors ─────────────────────────────────────────────────────────

    pub fn cursor(&self, id: ActivationId) -> Result<PollCursor, NumioError> {
        match self.poll_state.get(id.to_be_bytes()).map_err(storage)? {
            Some(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| NumioError::Serialization(e.to_string())),
            None => Ok(PollCursor::default()),
        }
    }

    pub fn put_cursor(&self, id: ActivationId, cursor: &PollCursor) -> Result<(), NumioError> {
        let bytes = bincode::serialize(cursor)
            .map_err(|e| NumioError::Serialization(e.to_string()))?;
        self.poll_state.insert(id.to_be_bytes(), bytes).map_err(storage)?;
        Ok(())
    }

    pub fn remove_cursor(&self, id: ActivationId) -> Result<(), NumioError> {
        self.poll_state.remove(id.to_be_bytes()).map_err(storage)?;
        Ok(())
    }

    // ── Locks ────────────────────────────────────────────────────────────────

    /// Acquire a named lock until `now + ttl_secs`. Single winner per window;
    /// an expired holder is displaced. Returns a guard on success.
    pub fn try_lock(
        &self,
        key: &str,
        now: Timestamp,
        ttl_secs: i64,
    ) -> Result<Option<CycleLockGuard<'_>>, NumioError> {
        let expiry = (now + ttl_secs).to_be_bytes();
        let res = self
            .locks
            .compare_and_swap(key.as_bytes(), None as Option<&[u8]>, Some(&expiry[..]))
            .map_err(storage)?;
        match res {
            Ok(()) => Ok(Some(CycleLockGuard { cache: self, key: key.to_string() })),
            Err(cas) => {
                let cur = cas.current.expect("CAS conflict carries current value");
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&cur);
                let held_until = Timestamp::from_be_bytes(arr);
                if held_until <= now {
                    // Stale holder: displace it, conditional on the stale value.
                    let res2 = self
                        .locks
                        .compare_and_swap(key.as_bytes(), Some(&cur[..]), Some(&expiry[..]))
                        .map_err(storage)?;
                    if res2.is_ok() {
                        return Ok(Some(CycleLockGuard {
                            cache: self,
                            key: key.to_string(),
                        }));
                    }
                }
                Ok(None)
            }
        }
    }

    fn unlock(&self, key: &str) {
        let _ = self.locks.remove(key.as_bytes());
    }
}

/// Releases the lock on drop. The TTL still bounds the hold if the process
/// dies before drop runs.
pub struct CycleLockGuard<'a> {
    cache: &'a CacheStore,
    key: String,
}

impl Drop for CycleLockGuard<'_> {
    fn drop(&mut self) {
        self.cache.unlock(&self.key);
    }
}
