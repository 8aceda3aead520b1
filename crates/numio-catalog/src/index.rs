//! The search-index seam.
//!
//! The production deployment points this at an external search engine with a
//! task model (long operations return task ids to await). `MemoryIndex`
//! implements the same contract in-process and completes tasks immediately.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use numio_core::{NumioError, Offer, ProviderId};

/// Handle for a long-running index operation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TaskId(pub u64);

#[derive(Clone, Debug, Default)]
pub struct OfferFilter {
    pub provider: Option<ProviderId>,
    pub country_code: Option<String>,
    pub service_code: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortBy {
    #[default]
    PriceAsc,
    PriceDesc,
    UpdatedDesc,
}

#[derive(Clone, Debug, Default)]
pub struct OfferQuery {
    /// Free-text match against service and country names.
    pub text: Option<String>,
    pub provider: Option<ProviderId>,
    pub country_code: Option<String>,
    pub service_code: Option<String>,
    pub service_name: Option<String>,
    pub country_name: Option<String>,
    pub operator: Option<String>,
    pub in_stock_only: bool,
    pub sort: SortBy,
    pub limit: usize,
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Upsert one document per offer, keyed by `doc_id`.
    async fn upsert(&self, docs: Vec<Offer>) -> Result<TaskId, NumioError>;

    async fn delete_by_filter(&self, filter: OfferFilter) -> Result<TaskId, NumioError>;

    /// Block until `task` has been applied.
    async fn wait(&self, task: TaskId) -> Result<(), NumioError>;

    async fn search(&self, query: OfferQuery) -> Result<Vec<Offer>, NumioError>;

    async fn get(&self, doc_id: &str) -> Result<Option<Offer>, NumioError>;
}

// ── MemoryIndex ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryIndex {
    docs: Mutex<HashMap<String, Offer>>,
    task_counter: AtomicU64,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_task(&self) -> TaskId {
        TaskId(self.task_counter.fetch_add(1, Ordering::Relaxed))
    }

    pub fn len(&self) -> usize {
        self.docs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn matches(offer: &Offer, q: &OfferQuery) -> bool {
    if let Some(p) = &q.provider {
        if offer.provider_id != *p {
            return false;
        }
    }
    if let Some(cc) = &q.country_code {
        if !offer.country_code.eq_ignore_ascii_case(cc) {
            return false;
        }
    }
    if let Some(sc) = &q.service_code {
        if !offer.service_code.eq_ignore_ascii_case(sc) {
            return false;
        }
    }
    if let Some(sn) = &q.service_name {
        if !offer.service_name.eq_ignore_ascii_case(sn) {
            return false;
        }
    }
    if let Some(cn) = &q.country_name {
        if !offer.country_name.eq_ignore_ascii_case(cn) {
            return false;
        }
    }
    if let Some(op) = &q.operator {
        match &offer.operator {
            Some(o) if o.eq_ignore_ascii_case(op) => {}
            // An any-operator offer satisfies an operator-constrained query.
            None => {}
            _ => return false,
        }
    }
    if let Some(text) = &q.text {
        let needle = text.to_lowercase();
        let haystack = format!(
            "{} {} {} {}",
            offer.service_name.to_lowercase(),
            offer.country_name.to_lowercase(),
            offer.service_code.to_lowercase(),
            offer.country_code.to_lowercase(),
        );
        if !haystack.contains(&needle) {
            return false;
        }
    }
    if q.in_stock_only && !offer.in_stock() {
        return false;
    }
    true
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn upsert(&self, docs: Vec<Offer>) -> Result<TaskId, NumioError> {
        let mut map = self.docs.lock().unwrap();
        for doc in docs {
            map.insert(doc.doc_id.clone(), doc);
        }
        Ok(self.next_task())
    }

    async fn delete_by_filter(&self, filter: OfferFilter) -> Result<TaskId, NumioError> {
        let mut map = self.docs.lock().unwrap();
        map.retain(|_, offer| {
            let hit = filter.provider.as_ref().is_none_or(|p| offer.provider_id == *p)
                && filter
                    .country_code
                    .as_ref()
                    .is_none_or(|cc| offer.country_code.eq_ignore_ascii_case(cc))
                && filter
                    .service_code
                    .as_ref()
                    .is_none_or(|sc| offer.service_code.eq_ignore_ascii_case(sc));
            !hit
        });
        Ok(self.next_task())
    }

    async fn wait(&self, _task: TaskId) -> Result<(), NumioError> {
        Ok(()) // in-memory operations apply synchronously
    }

    async fn search(&self, query: OfferQuery) -> Result<Vec<Offer>, NumioError> {
        let map = self.docs.lock().unwrap();
        let mut hits: Vec<Offer> = map.values().filter(|o| matches(o, &query)).cloned().collect();
        match query.sort {
            SortBy::PriceAsc => hits.sort_by_key(|o| (o.price, o.doc_id.clone())),
            SortBy::PriceDesc => {
                hits.sort_by_key(|o| (std::cmp::Reverse(o.price), o.doc_id.clone()))
            }
            SortBy::UpdatedDesc => {
                hits.sort_by_key(|o| (std::cmp::Reverse(o.updated_at), o.doc_id.clone()))
            }
        }
        if query.limit > 0 {
            hits.truncate(query.limit);
        }
        Ok(hits)
    }

    async fn get(&self, doc_id: &str) -> Result<Option<Offer>, NumioError> {
        Ok(self.docs.lock().unwrap().get(doc_id).cloned())
    }
}

#[cfg(test)]
pub(crate) fn offer(
    provider: &str,
    country_code: &str,
    service_code: &str,
    service_name: &str,
    country_name: &str,
    cents: i64,
    stock: u32,
) -> Offer {
    use numio_core::Money;
    let provider_id = ProviderId::new(provider);
    Offer {
        doc_id: Offer::doc_id(&provider_id, country_code, service_code, None),
        provider_id,
        country_code: country_code.into(),
        service_code: service_code.into(),
        operator: None,
        price: Money::from_cents(cents),
        stock,
        service_name: service_name.into(),
        country_name: country_name.into(),
        active: true,
        updated_at: 1_000,
    }
}
