//! The search-backed offer catalog: pricing index, purchase-time offer
//! resolution, soft stock reservations, and the admin aggregation
//! projections.

pub mod aggregate;
pub mod index;
pub mod resolve;
pub mod sync;

pub use aggregate::{CountryOverview, ProviderBreakdown, ServiceOverview};
pub use index::{MemoryIndex, OfferFilter, OfferQuery, SearchIndex, SortBy, TaskId};
pub use sync::OfferSync;

use std::sync::Arc;

use tracing::info;

use numio_core::{
    NumioError, Offer, OfferReservation, ReservationId, ReservationStatus, Timestamp,
};
use numio_store::Store;

/// Read/reserve surface over the offer index.
pub struct Catalog {
    index: Arc<dyn SearchIndex>,
    store: Arc<Store>,
    clock: Box<dyn Fn() -> Timestamp + Send + Sync>,
}

impl Catalog {
    pub fn new(index: Arc<dyn SearchIndex>, store: Arc<Store>) -> Self {
        Self::with_clock(index, store, Box::new(|| chrono::Utc::now().timestamp()))
    }

    pub fn with_clock(
        index: Arc<dyn SearchIndex>,
        store: Arc<Store>,
        clock: Box<dyn Fn() -> Timestamp + Send + Sync>,
    ) -> Self {
        Self { index, store, clock }
    }

    pub fn index(&self) -> &Arc<dyn SearchIndex> {
        &self.index
    }

    /// Resolve a purchase request to the cheapest in-stock offer.
    pub async fn resolve_purchase(
        &self,
        service_input: &str,
        country_input: &str,
        operator: Option<&str>,
        provider: Option<&numio_core::ProviderId>,
    ) -> Result<Offer, NumioError> {
        resolve::resolve_offer(self.index.as_ref(), service_input, country_input, operator, provider)
            .await
    }

    // ── Reservations ─────────────────────────────────────────────────────────

    /// Hold `quantity` units of an offer for `ttl_secs`. Decrements the
    /// projected stock; the decrement is undone exactly once, on expiry or
    /// cancellation.
    pub async fn reserve(
        &self,
        offer_doc_id: &str,
        quantity: u32,
        ttl_secs: i64,
    ) -> Result<OfferReservation, NumioError> {
        let mut offer = self
            .index
            .get(offer_doc_id)
            .await?
            .ok_or(NumioError::NoMatchingOffer)?;
        if !offer.active || offer.stock < quantity {
            return Err(NumioError::OutOfStock);
        }
        let now = (self.clock)();
        offer.stock -= quantity;
        offer.updated_at = now;
        let task = self.index.upsert(vec![offer]).await?;
        self.index.wait(task).await?;

        let resv = OfferReservation {
            id: ReservationId(self.store.next_id()?),
            offer_doc_id: offer_doc_id.to_string(),
            quantity,
            status: ReservationStatus::Pending,
            expires_at: now + ttl_secs,
            created_at: now,
        };
        self.store.put_reservation(&resv)?;
        info!(reservation = %resv.id, offer = offer_doc_id, quantity, "stock reserved");
        Ok(resv)
    }

    /// Keep the stock decrement; the sale went through.
    pub async fn confirm(&self, id: ReservationId) -> Result<(), NumioError> {
        self.settle(id, ReservationStatus::Confirmed, false).await
    }

    /// Undo the hold and restore stock.
    pub async fn cancel(&self, id: ReservationId) -> Result<(), NumioError> {
        self.settle(id, ReservationStatus::Cancelled, true).await
    }

    /// Reaper path: expire a lapsed PENDING hold and restore stock.
    pub async fn expire(&self, id: ReservationId) -> Result<(), NumioError> {
        self.settle(id, ReservationStatus::Expired, true).await
    }

    async fn settle(
        &self,
        id: ReservationId,
        to: ReservationStatus,
        restore_stock: bool,
    ) -> Result<(), NumioError> {
        let mut resv = self
            .store
            .get_reservation(id)?
            .ok_or(NumioError::ReservationNotFound(id))?;
        if resv.status != ReservationStatus::Pending {
            return Ok(()); // settled by a concurrent sweep or retry
        }
        resv.status = to;
        self.store.put_reservation(&resv)?;

        if restore_stock {
            if let Some(mut offer) = self.index.get(&resv.offer_doc_id).await? {
                offer.stock += resv.quantity;
                offer.updated_at = (self.clock)();
                let task = self.index.upsert(vec![offer]).await?;
                self.index.wait(task).await?;
            }
        }
        info!(reservation = %id, status = ?to, "reservation settled");
        Ok(())
    }
}
