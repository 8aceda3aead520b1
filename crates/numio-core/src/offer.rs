use serde::{Deserialize, Serialize};

use crate::types::{Money, ProviderId, ReservationId, Timestamp};

// ── Offer (projection) ───────────────────────────────────────────────────────

/// A flattened `(provider, country, service, operator)` pricing tuple in the
/// search-backed catalog. Owned by the provider-sync pipeline and the outbox
/// dispatcher; the resolver and admin aggregations only read it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    /// Document id: `{provider}:{country_code}:{service_code}:{operator|any}`.
    pub doc_id: String,
    pub provider_id: ProviderId,
    pub country_code: String,
    pub service_code: String,
    /// Provider-native operator string; `None` means any operator.
    pub operator: Option<String>,
    pub price: Money,
    pub stock: u32,
    /// Normalized identity used to aggregate provider-specific naming.
    pub service_name: String,
    pub country_name: String,
    pub active: bool,
    pub updated_at: Timestamp,
}

impl Offer {
    pub fn doc_id(
        provider: &ProviderId,
        country_code: &str,
        service_code: &str,
        operator: Option<&str>,
    ) -> String {
        format!(
            "{}:{}:{}:{}",
            provider.as_str(),
            country_code,
            service_code,
            operator.unwrap_or("any")
        )
    }

    pub fn in_stock(&self) -> bool {
        self.active && self.stock > 0
    }
}

// ── OfferReservation ─────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Expired,
    Cancelled,
}

impl ReservationStatus {
    /// Dead reservations are eligible for housekeeping purge.
    pub fn is_dead(self) -> bool {
        matches!(self, ReservationStatus::Expired | ReservationStatus::Cancelled)
    }
}

/// Soft stock hold against a catalog offer. Stock is restored exactly once,
/// on expiry or cancellation; confirmation keeps the decrement.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OfferReservation {
    pub id: ReservationId,
    pub offer_doc_id: String,
    pub quantity: u32,
    pub status: ReservationStatus,
    pub expires_at: Timestamp,
    pub created_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_id_format() {
        let p = ProviderId::new("smshub");
        assert_eq!(Offer::doc_id(&p, "US", "tg", None), "smshub:US:tg:any");
        assert_eq!(
            Offer::doc_id(&p, "GB", "wa", Some("vodafone")),
            "smshub:GB:wa:vodafone"
        );
    }
}
