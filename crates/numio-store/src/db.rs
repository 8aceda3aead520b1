use std::path::Path;

use numio_core::{
    Activation, ActivationId, NumberId, NumioError, Number, NumberStatus, OfferReservation,
    OutboxEvent, OutboxId, OutboxStatus, ReservationId, SmsMessage, StateHistoryRecord,
    Timestamp, UserId,
};

/// Persistent store backed by sled (pure-Rust, no C dependencies).
///
/// Named trees:
///   activations       — ActivationId BE      → bincode(Activation)
///   idem_keys         — key utf8             → ActivationId BE   (unique index)
///   history           — ActivationId BE ‖ seq BE → json(StateHistoryRecord)
///   numbers           — NumberId BE          → bincode(Number)
///   numbers_upstream  — upstream_id utf8     → NumberId BE       (lookup index)
///   sms               — NumberId BE ‖ code   → bincode(SmsMessage)  (unique)
///   reservations      — ReservationId BE     → bincode(OfferReservation)
///   outbox            — OutboxId BE          → json(OutboxEvent)
pub struct Store {
    db: sled::Db,
    activations: sled::Tree,
    idem_keys: sled::Tree,
    history: sled::Tree,
    numbers: sled::Tree,
    numbers_upstream: sled::Tree,
    sms: sled::Tree,
    reservations: sled::Tree,
    outbox: sled::Tree,
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

// History and outbox rows carry open-ended JSON (metadata, payload), which
// bincode cannot round-trip; those trees use serde_json. serde_json maps are
// key-sorted, so re-serialization is byte-stable and safe to CAS on.
fn ser_json<T: serde::Serialize>(v: &T) -> Result<Vec<u8>, NumioError> {
    serde_json::to_vec(v).map_err(|e| NumioError::Serialization(e.to_string()))
}

fn de_json<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, NumioError> {
    serde_json::from_slice(bytes).map_err(|e| NumioError::Serialization(e.to_string()))
}

impl Store {
    /// Open or create the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, NumioError> {
        let db = sled::open(path).map_err(storage)?;
        let activations      = db.open_tree("activations").map_err(storage)?;
        let idem_keys        = db.open_tree("idem_keys").map_err(storage)?;
        let history          = db.open_tree("history").map_err(storage)?;
        let numbers          = db.open_tree("numbers").map_err(storage)?;
        let numbers_upstream = db.open_tree("numbers_upstream").map_err(storage)?;
        let sms              = db.open_tree("sms").map_err(storage)?;
        let reservations     = db.open_tree("reservations").map_err(storage)?;
        let outbox           = db.open_tree("outbox").map_err(storage)?;
        Ok(Self {
            db, activations, idem_keys, history, numbers, numbers_upstream,
            sms, reservations, outbox,
        })
    }

    /// Allocate a fresh monotonic row id.
    pub fn next_id(&self) -> Result<u64, NumioError> {
        self.db.generate_id().map_err(storage)
    }

    /// Raw handle for the cache keyspace (due-index, locks).
    pub(crate) fn inner(&self) -> &sled::Db {
        &self.db
    }

    // ── Activations ──────────────────────────────────────────────────────────

    pub fn get_activation(&self, id: ActivationId) -> Result<Option<Activation>, NumioError> {
        match self.activations.get(id.to_be_bytes()).map_err(storage)? {
            Some(bytes) => Ok(Some(de(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_activation(&self, act: &Activation) -> Result<(), NumioError> {
        self.activations
            .insert(act.id.to_be_bytes(), ser(act)?)
            .map_err(storage)?;
        Ok(())
    }

    /// Claim an idempotency key for `id`. Returns the already-registered
    /// activation id when the key is taken (first writer wins).
    pub fn claim_idempotency_key(
        &self,
        key: &str,
        id: ActivationId,
    ) -> Result<Result<(), ActivationId>, NumioError> {
        let res = self
            .idem_keys
            .compare_and_swap(
                key.as_bytes(),
                None as Option<&[u8]>,
                Some(&id.to_be_bytes()[..]),
            )
            .map_err(storage)?;
        match res {
            Ok(()) => Ok(Ok(())),
            Err(cas) => {
                let cur = cas.current.expect("CAS conflict carries current value");
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&cur);
                Ok(Err(ActivationId::from_be_bytes(arr)))
            }
        }
    }

    /// Release an idempotency key once its activation is terminal, so a later
    /// purchase may reuse it.
    pub fn release_idempotency_key(&self, key: &str) -> Result<(), NumioError> {
        self.idem_keys.remove(key.as_bytes()).map_err(storage)?;
        Ok(())
    }

    pub fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Activation>, NumioError> {
        match self.idem_keys.get(key.as_bytes()).map_err(storage)? {
            Some(cur) => {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&cur);
                self.get_activation(ActivationId::from_be_bytes(arr))
            }
            None => Ok(None),
        }
    }

    /// Paginated listing of a user's activations, newest id first.
    pub fn iter_user_activations(
        &self,
        user_id: &UserId,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Activation>, NumioError> {
        let mut result = Vec::new();
        for item in self.activations.iter().rev() {
            let (_, bytes) = item.map_err(storage)?;
            let act: Activation = de(&bytes)?;
            if act.user_id == *user_id {
                result.push(act);
            }
        }
        Ok(result.into_iter().skip(offset).take(limit).collect())
    }

    /// All activations currently in RESERVED created before `cutoff`
    /// (zombie-fund sweep input).
    pub fn iter_stale_reserved(
        &self,
        cutoff: Timestamp,
        limit: usize,
    ) -> Result<Vec<Activation>, NumioError> {
        let mut result = Vec::new();
        for item in self.activations.iter() {
            let (_, bytes) = item.map_err(storage)?;
            let act: Activation = de(&bytes)?;
            if act.state == numio_core::ActivationState::Reserved && act.created_at < cutoff {
                result.push(act);
                if result.len() >= limit {
                    break;
                }
            }
        }
        Ok(result)
    }

    // ── History ──────────────────────────────────────────────────────────────

    pub fn append_history(&self, rec: &StateHistoryRecord) -> Result<(), NumioError> {
        let mut key = Vec::with_capacity(16);
        key.extend_from_slice(&rec.activation_id.to_be_bytes());
        key.extend_from_slice(&rec.seq.to_be_bytes());
        self.history.insert(key, ser_json(rec)?).map_err(storage)?;
        Ok(())
    }

    /// History rows for one activation, ordered by sequence.
    pub fn history_for(
        &self,
        id: ActivationId,
    ) -> Result<Vec<StateHistoryRecord>, NumioError> {
        let mut result = Vec::new();
        for item in self.history.scan_prefix(id.to_be_bytes()) {
            let (_, bytes) = item.map_err(storage)?;
            result.push(de_json(&bytes)?);
        }
        Ok(result)
    }

    pub fn history_len(&self, id: ActivationId) -> Result<u64, NumioError> {
        Ok(self.history_for(id)?.len() as u64)
    }

    // ── Numbers ──────────────────────────────────────────────────────────────

    pub fn get_number(&self, id: NumberId) -> Result<Option<Number>, NumioError> {
        match self.numbers.get(id.to_be_bytes()).map_err(storage)? {
            Some(bytes) => Ok(Some(de(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_number(&self, num: &Number) -> Result<(), NumioError> {
        self.numbers
            .insert(num.id.to_be_bytes(), ser(num)?)
            .map_err(storage)?;
        self.numbers_upstream
            .insert(num.upstream_id.as_bytes(), &num.id.to_be_bytes()[..])
            .map_err(storage)?;
        Ok(())
    }

    pub fn find_number_by_upstream(
        &self,
        upstream_id: &str,
    ) -> Result<Option<Number>, NumioError> {
        match self
            .numbers_upstream
            .get(upstream_id.as_bytes())
            .map_err(storage)?
        {
            Some(cur) => {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&cur);
                self.get_number(NumberId::from_be_bytes(arr))
            }
            None => Ok(None),
        }
    }

    /// Live numbers (`active`/`received`) whose window has closed.
    pub fn iter_expired_live_numbers(
        &self,
        now: Timestamp,
        limit: usize,
    ) -> Result<Vec<Number>, NumioError> {
        let mut result = Vec::new();
        for item in self.numbers.iter() {
            let (_, bytes) = item.map_err(storage)?;
            let num: Number = de(&bytes)?;
            if num.status.is_live() && num.expires_at < now {
                result.push(num);
                if result.len() >= limit {
                    break;
                }
            }
        }
        Ok(result)
    }

    // ── SMS ──────────────────────────────────────────────────────────────────

    fn sms_key(number_id: NumberId, code: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(8 + code.len());
        key.extend_from_slice(&number_id.to_be_bytes());
        key.extend_from_slice(code.as_bytes());
        key
    }

    /// Insert a message iff `(number_id, code)` is new. Returns true when the
    /// row was inserted, false when it already existed. Never overwrites.
    pub fn insert_sms_if_absent(&self, msg: &SmsMessage) -> Result<bool, NumioError> {
        let key = Self::sms_key(msg.number_id, &msg.code);
        let res = self
            .sms
            .compare_and_swap(key, None as Option<&[u8]>, Some(ser(msg)?))
            .map_err(storage)?;
        Ok(res.is_ok())
    }

    pub fn sms_for_number(&self, number_id: NumberId) -> Result<Vec<SmsMessage>, NumioError> {
        let mut result = Vec::new();
        for item in self.sms.scan_prefix(number_id.to_be_bytes()) {
            let (_, bytes) = item.map_err(storage)?;
            result.push(de(&bytes)?);
        }
        result.sort_by_key(|m: &SmsMessage| m.received_at);
        Ok(result)
    }

    pub fn sms_count(&self, number_id: NumberId) -> Result<u64, NumioError> {
        Ok(self.sms.scan_prefix(number_id.to_be_bytes()).count() as u64)
    }

    // ── Reservations ─────────────────────────────────────────────────────────

    pub fn get_reservation(
        &self,
        id: ReservationId,
    ) -> Result<Option<OfferReservation>, NumioError> {
        match self.reservations.get(id.to_be_bytes()).map_err(storage)? {
            Some(bytes) => Ok(Some(de(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_reservation(&self, resv: &OfferReservation) -> Result<(), NumioError> {
        self.reservations
            .insert(resv.id.to_be_bytes(), ser(resv)?)
            .map_err(storage)?;
        Ok(())
    }

    pub fn remove_reservation(&self, id: ReservationId) -> Result<(), NumioError> {
        self.reservations.remove(id.to_be_bytes()).map_err(storage)?;
        Ok(())
    }

    /// PENDING reservations whose hold has lapsed.
    pub fn iter_expired_pending_reservations(
        &self,
        now: Timestamp,
        limit: usize,
    ) -> Result<Vec<OfferReservation>, NumioError> {
        let mut result = Vec::new();
        for item in self.reservations.iter() {
            let (_, bytes) = item.map_err(storage)?;
            let resv: OfferReservation = de(&bytes)?;
            if resv.status == numio_core::ReservationStatus::Pending && resv.expires_at < now {
                result.push(resv);
                if result.len() >= limit {
                    break;
                }
            }
        }
        Ok(result)
    }

    /// Dead reservations older than `cutoff` (housekeeping purge input).
    pub fn iter_dead_reservations(
        &self,
        cutoff: Timestamp,
        limit: usize,
    ) -> Result<Vec<OfferReservation>, NumioError> {
        let mut result = Vec::new();
        for item in self.reservations.iter() {
            let (_, bytes) = item.map_err(storage)?;
            let resv: OfferReservation = de(&bytes)?;
            if resv.status.is_dead() && resv.created_at < cutoff {
                result.push(resv);
                if result.len() >= limit {
                    break;
                }
            }
        }
        Ok(result)
    }

    // ── Outbox ───────────────────────────────────────────────────────────────

    pub fn get_outbox(&self, id: OutboxId) -> Result<Option<OutboxEvent>, NumioError> {
        match self.outbox.get(id.to_be_bytes()).map_err(storage)? {
            Some(bytes) => Ok(Some(de_json(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_outbox(&self, ev: &OutboxEvent) -> Result<(), NumioError> {
        self.outbox
            .insert(ev.id.to_be_bytes(), ser_json(ev)?)
            .map_err(storage)?;
        Ok(())
    }

    pub fn remove_outbox(&self, id: OutboxId) -> Result<(), NumioError> {
        self.outbox.remove(id.to_be_bytes()).map_err(storage)?;
        Ok(())
    }

    /// Conditionally replace an outbox row: succeeds only when the stored row
    /// still equals `expected`. Losing the race means another worker claimed it.
    pub fn cas_outbox(
        &self,
        expected: &OutboxEvent,
        next: &OutboxEvent,
    ) -> Result<bool, NumioError> {
        let res = self
            .outbox
            .compare_and_swap(
                expected.id.to_be_bytes(),
                Some(ser_json(expected)?),
                Some(ser_json(next)?),
            )
            .map_err(storage)?;
        Ok(res.is_ok())
    }

    /// Dispatchable rows in creation order: PENDING under the retry budget and
    /// due, plus PUBLISHED claims whose lease has lapsed without completion.
    pub fn iter_dispatchable_outbox(
        &self,
        now: Timestamp,
        lease_secs: i64,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, NumioError> {
        let mut result = Vec::new();
        for item in self.outbox.iter() {
            let (_, bytes) = item.map_err(storage)?;
            let ev: OutboxEvent = de_json(&bytes)?;
            let due = match ev.status {
                OutboxStatus::Pending => {
                    ev.retry_count < max_retries && ev.next_attempt_at <= now
                }
                // A claim without completion past its lease: the worker died
                // mid-dispatch and the row is reclaimable.
                OutboxStatus::Published => {
                    ev.published_at.is_none()
                        && ev.retry_count < max_retries
                        && ev.updated_at + lease_secs <= now
                }
                OutboxStatus::Failed => false,
            };
            if due {
                result.push(ev);
                if result.len() >= limit {
                    break;
                }
            }
        }
        Ok(result)
    }

    /// Settled rows older than `cutoff` (housekeeping purge input).
    pub fn iter_settled_outbox(
        &self,
        cutoff: Timestamp,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, NumioError> {
        let mut result = Vec::new();
        for item in self.outbox.iter() {
            let (_, bytes) = item.map_err(storage)?;
            let ev: OutboxEvent = de_json(&bytes)?;
            if ev.is_settled() && ev.created_at < cutoff {
                result.push(ev);
                if result.len() >= limit {
                    break;
                }
            }
        }
        Ok(result)
    }

    /// Every outbox row (test and operator tooling).
    pub fn iter_all_outbox(&self) -> Result<Vec<OutboxEvent>, NumioError> {
        let mut result = Vec::new();
        for item in self.outbox.iter() {
            let (_, bytes) = item.map_err(storage)?;
            result.push(de_json(&bytes)?);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use numio_core::{ActivationState, Money, ProviderId, TraceId};

    fn temp_store(name: &str) -> Store {
        let dir = std::env::temp_dir().join(format!("numio_store_test_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        Store::open(&dir).expect("open temp store")
    }

    fn seed_activation(store: &Store, state: ActivationState, created_at: Timestamp) -> Activation {
        let act = Activation {
            id: ActivationId(store.next_id().unwrap()),
            user_id: UserId::new("u1"),
            provider_id: ProviderId::new("mock"),
            price: Money::from_cents(1000),
            state,
            service_code: "tg".into(),
            country_code: "US".into(),
            service_name: None,
            country_name: None,
            operator: None,
            upstream_id: None,
            phone: None,
            created_at,
            expires_at: None,
            idempotency_key: None,
            reservation_id: None,
            reserve_entry: None,
            capture_entry: None,
            refund_entry: None,
            number_id: None,
            trace_id: TraceId::new("t"),
        };
        store.put_activation(&act).unwrap();
        act
    }

    #[test]
    fn activation_roundtrip() {
        let store = temp_store("act_rt");
        let act = seed_activation(&store, ActivationState::Reserved, 100);
        let loaded = store.get_activation(act.id).unwrap().unwrap();
        assert_eq!(loaded.state, ActivationState::Reserved);
        assert_eq!(loaded.price, Money::from_cents(1000));
    }

    #[test]
    fn idempotency_key_first_writer_wins() {
        let store = temp_store("idem");
        let a = seed_activation(&store, ActivationState::Reserved, 100);
        let b = seed_activation(&store, ActivationState::Reserved, 101);
        assert!(store.claim_idempotency_key("k1", a.id).unwrap().is_ok());
        assert_eq!(store.claim_idempotency_key("k1", b.id).unwrap(), Err(a.id));
        let found = store.find_by_idempotency_key("k1").unwrap().unwrap();
        assert_eq!(found.id, a.id);
    }

    #[test]
    fn sms_uniqueness_on_number_and_code() {
        let store = temp_store("sms");
        let msg = SmsMessage {
            number_id: NumberId(7),
            code: "123456".into(),
            content: "your code is 123456".into(),
            sender: Some("TG".into()),
            received_at: 50,
        };
        assert!(store.insert_sms_if_absent(&msg).unwrap());
        assert!(!store.insert_sms_if_absent(&msg).unwrap());
        assert_eq!(store.sms_count(NumberId(7)).unwrap(), 1);
        // Same code on a different number is a distinct row.
        let other = SmsMessage { number_id: NumberId(8), ..msg.clone() };
        assert!(store.insert_sms_if_absent(&other).unwrap());
    }

    #[test]
    fn history_ordered_by_seq() {
        let store = temp_store("hist");
        let act = seed_activation(&store, ActivationState::Reserved, 100);
        for (seq, (from, to)) in [
            (ActivationState::Init, ActivationState::Reserved),
            (ActivationState::Reserved, ActivationState::Active),
            (ActivationState::Active, ActivationState::Received),
        ]
        .into_iter()
        .enumerate()
        {
            store
                .append_history(&StateHistoryRecord {
                    activation_id: act.id,
                    seq: seq as u64,
                    from_state: from,
                    to_state: to,
                    reason: "test".into(),
                    metadata: serde_json::Value::Null,
                    trace_id: TraceId::new("t"),
                    at: 100 + seq as i64,
                })
                .unwrap();
        }
        let rows = store.history_for(act.id).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].to_state, ActivationState::Reserved);
        assert_eq!(rows[2].to_state, ActivationState::Received);
    }

    #[test]
    fn stale_reserved_scan_respects_cutoff() {
        let store = temp_store("stale");
        seed_activation(&store, ActivationState::Reserved, 100);
        seed_activation(&store, ActivationState::Reserved, 900);
        seed_activation(&store, ActivationState::Active, 100);
        let stale = store.iter_stale_reserved(500, 10).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].created_at, 100);
    }

    #[test]
    fn outbox_cas_claim_single_winner() {
        let store = temp_store("obx_cas");
        let ev = OutboxEvent {
            id: OutboxId(store.next_id().unwrap()),
            aggregate_type: "activation".into(),
            aggregate_id: "act:1".into(),
            event_type: numio_core::EventType::Refund,
            payload: serde_json::json!({}),
            status: OutboxStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: 10,
            updated_at: 10,
            next_attempt_at: 10,
            published_at: None,
        };
        store.put_outbox(&ev).unwrap();

        let mut claimed = ev.clone();
        claimed.status = OutboxStatus::Published;
        claimed.retry_count = 1;
        claimed.updated_at = 11;
        assert!(store.cas_outbox(&ev, &claimed).unwrap());
        // Second claimant raced on the stale snapshot and must lose.
        assert!(!store.cas_outbox(&ev, &claimed).unwrap());
    }
}
