//! Provider offer sync: pulls an upstream's priced catalog and queues
//! `offer.created` / `offer.updated` through the outbox. The index itself is
//! only ever written by the outbox dispatcher — sync just detects drift.

use std::sync::Arc;

use tracing::info;

use numio_adapter::ProviderAdapter;
use numio_core::{EventType, NumioError, Offer, Timestamp};
use numio_kernel::{Kernel, PendingEvent};

use crate::index::SearchIndex;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: u32,
    pub updated: u32,
    pub unchanged: u32,
}

pub struct OfferSync {
    kernel: Arc<Kernel>,
}

impl OfferSync {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    /// Diff one provider's catalog against the index and queue projection
    /// events for every new or drifted offer.
    pub async fn sync_provider(
        &self,
        adapter: &dyn ProviderAdapter,
        index: &dyn SearchIndex,
        now: Timestamp,
    ) -> Result<SyncReport, NumioError> {
        if !adapter.supports_offers() {
            return Err(NumioError::NotSupported(adapter.provider_id()));
        }
        let provider_id = adapter.provider_id();
        let raw = adapter.offers().await?;

        let mut report = SyncReport::default();
        for line in raw {
            let doc_id = Offer::doc_id(
                &provider_id,
                &line.country_code,
                &line.service_code,
                line.operator.as_deref(),
            );
            let next = Offer {
                doc_id: doc_id.clone(),
                provider_id: provider_id.clone(),
                country_code: line.country_code,
                service_code: line.service_code,
                operator: line.operator,
                price: line.price,
                stock: line.stock,
                service_name: line.service_name,
                country_name: line.country_name,
                active: line.stock > 0,
                updated_at: now,
            };

            let event_type = match index.get(&doc_id).await? {
                None => {
                    report.created += 1;
                    EventType::OfferCreated
                }
                Some(current)
                    if current.price != next.price
                        || current.stock != next.stock
                        || current.active != next.active =>
                {
                    report.updated += 1;
                    EventType::OfferUpdated
                }
                Some(_) => {
                    report.unchanged += 1;
                    continue;
                }
            };

            self.kernel.dispatch_event(PendingEvent {
                aggregate_type: "offer".into(),
                aggregate_id: doc_id,
                event_type,
                payload: serde_json::to_value(&next)
                    .map_err(|e| NumioError::Serialization(e.to_string()))?,
                delay_secs: 0,
            })?;
        }

        info!(
            provider = %provider_id,
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            "offer sync"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;
    use numio_adapter::{MockAdapter, RawOffer};
    use numio_core::Money;
    use numio_kernel::EventBus;
    use numio_store::Store;

    fn temp_kernel(name: &str) -> (Arc<Store>, Arc<Kernel>) {
        let dir = std::env::temp_dir().join(format!("numio_sync_test_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        let store = Arc::new(Store::open(&dir).expect("open temp store"));
        let kernel = Arc::new(Kernel::with_clock(
            Arc::clone(&store),
            EventBus::new(16),
            Box::new(|| 1_000),
        ));
        (store, kernel)
    }

    fn raw(service: &str, name: &str, cents: i64, stock: u32) -> RawOffer {
        RawOffer {
            country_code: "0".into(),
            country_name: "United States".into(),
            service_code: service.into(),
            service_name: name.into(),
            operator: None,
            price: Money::from_cents(cents),
            stock,
        }
    }

    #[tokio::test]
    async fn fresh_catalog_queues_created_events() {
        let (store, kernel) = temp_kernel("fresh");
        let sync = OfferSync::new(kernel);
        let adapter = MockAdapter::new("smshub");
        adapter.set_offers(vec![raw("tg", "Telegram", 100, 5), raw("wa", "WhatsApp", 150, 2)]);
        let index = MemoryIndex::new();

        let report = sync.sync_provider(&adapter, &index, 1_000).await.unwrap();
        assert_eq!(report, SyncReport { created: 2, updated: 0, unchanged: 0 });

        let rows = store.iter_all_outbox().unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.event_type == EventType::OfferCreated));
    }

    #[tokio::test]
    async fn drifted_price_queues_updated_event_once() {
        let (store, kernel) = temp_kernel("drift");
        let sync = OfferSync::new(kernel);
        let adapter = MockAdapter::new("smshub");
        adapter.set_offers(vec![raw("tg", "Telegram", 100, 5)]);
        let index = MemoryIndex::new();

        // Simulate the dispatcher having applied the first sync.
        index
            .upsert(vec![crate::index::offer(
                "smshub", "0", "tg", "Telegram", "United States", 100, 5,
            )])
            .await
            .unwrap();

        let report = sync.sync_provider(&adapter, &index, 2_000).await.unwrap();
        assert_eq!(report, SyncReport { created: 0, updated: 0, unchanged: 1 });

        adapter.set_offers(vec![raw("tg", "Telegram", 130, 5)]);
        let report = sync.sync_provider(&adapter, &index, 3_000).await.unwrap();
        assert_eq!(report.updated, 1);
        let rows = store.iter_all_outbox().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_type, EventType::OfferUpdated);
    }
}
