//! Provider adapters: a uniform capability surface over heterogeneous
//! upstream SMS vendors.
//!
//! Adapters are pure translators — they hold no durable state. Optional
//! capabilities (batched status, balance, resend) are feature-flagged per
//! adapter and probed at call time; callers must not guess support.

pub mod http;
pub mod mock;
pub mod registry;

pub use http::{HttpAdapter, HttpAdapterCaps};
pub use mock::MockAdapter;
pub use registry::AdapterRegistry;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use numio_core::{Money, NumioError, ProviderId, Timestamp};

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Country {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub icon_url: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct AcquireOptions {
    pub max_price: Option<Money>,
    /// Provider-native operator string.
    pub operator: Option<String>,
}

/// A number bought at the upstream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcquiredNumber {
    pub upstream_id: String,
    pub phone: String,
    pub expires_at: Timestamp,
    pub price: Money,
}

/// One priced line of an upstream's catalog, as the vendor reports it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawOffer {
    pub country_code: String,
    pub country_name: String,
    pub service_code: String,
    pub service_name: String,
    /// Provider-native operator string; `None` means any operator.
    pub operator: Option<String>,
    pub price: Money,
    pub stock: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum UpstreamStatus {
    Pending,
    Received,
    Cancelled,
    Expired,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpstreamMessage {
    pub id: String,
    pub sender: Option<String>,
    pub content: String,
    /// Verification code extracted by the upstream, when it does extraction.
    pub code: Option<String>,
    pub received_at: Timestamp,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusResult {
    pub status: UpstreamStatus,
    pub messages: Vec<UpstreamMessage>,
}

// ── Capability trait ─────────────────────────────────────────────────────────

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_id(&self) -> ProviderId;

    async fn list_countries(&self) -> Result<Vec<Country>, NumioError>;

    async fn list_services(&self, country: Option<&str>) -> Result<Vec<Service>, NumioError>;

    /// Buy a number. May fail with `NoNumbers`, `NoBalance`, `BadService` or
    /// a transport error.
    async fn acquire(
        &self,
        country: &str,
        service: &str,
        opts: AcquireOptions,
    ) -> Result<AcquiredNumber, NumioError>;

    async fn status(&self, upstream_id: &str) -> Result<StatusResult, NumioError>;

    /// Best-effort release of the number at the upstream.
    async fn cancel(&self, upstream_id: &str) -> Result<(), NumioError>;

    // ── Optional capabilities ────────────────────────────────────────────────

    fn supports_balance(&self) -> bool {
        false
    }

    async fn balance(&self) -> Result<Money, NumioError> {
        Err(NumioError::NotSupported(self.provider_id()))
    }

    /// Whether `status_batch` is a native upstream call. Without it the
    /// default implementation degrades to sequential individual calls.
    fn supports_status_batch(&self) -> bool {
        false
    }

    async fn status_batch(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, Result<StatusResult, NumioError>>, NumioError> {
        let mut out = HashMap::with_capacity(ids.len());
        for id in ids {
            out.insert(id.clone(), self.status(id).await);
        }
        Ok(out)
    }

    /// Whether the upstream can be asked for another SMS on a live number.
    fn supports_resend(&self) -> bool {
        false
    }

    async fn request_resend(&self, _upstream_id: &str) -> Result<(), NumioError> {
        Err(NumioError::NotSupported(self.provider_id()))
    }

    /// Whether the upstream publishes a priced catalog (drives offer sync).
    fn supports_offers(&self) -> bool {
        false
    }

    async fn offers(&self) -> Result<Vec<RawOffer>, NumioError> {
        Err(NumioError::NotSupported(self.provider_id()))
    }
}
