use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

// ── Request / response DTOs ──────────────────────────────────────────────────

#[derive(Clone, Debug, Deserialize)]
pub struct RpcPurchaseRequest {
    pub user_id: String,
    pub service: String,
    pub country: String,
    /// Highest accepted price in minor units.
    pub max_price_cents: i64,
    pub provider: Option<String>,
    pub operator: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RpcPurchaseResponse {
    pub ok: bool,
    pub order_id: Option<u64>,
    pub phone: Option<String>,
    pub upstream_id: Option<String>,
    pub err: Option<String>,
    pub err_code: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RpcAck {
    pub ok: bool,
    pub err: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RpcOffer {
    pub provider: String,
    pub country_code: String,
    pub country_name: String,
    pub service_code: String,
    pub service_name: String,
    pub operator: Option<String>,
    pub price_cents: i64,
    pub stock: u32,
}

impl From<numio_core::Offer> for RpcOffer {
    fn from(o: numio_core::Offer) -> Self {
        Self {
            provider: o.provider_id.as_str().to_string(),
            country_code: o.country_code,
            country_name: o.country_name,
            service_code: o.service_code,
            service_name: o.service_name,
            operator: o.operator,
            price_cents: o.price.cents(),
            stock: o.stock,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RpcOrderSummary {
    pub order_id: u64,
    pub state: String,
    pub phone: Option<String>,
    pub service: String,
    pub country: String,
    pub price_cents: i64,
    pub created_at: i64,
}

// ── Worker health ────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize)]
pub struct WorkerHealth {
    pub running: bool,
    pub last_cycle_at: Option<i64>,
    pub last_error: Option<String>,
}

/// Shared board the node's workers report into and healthz reads from.
#[derive(Default)]
pub struct HealthBoard {
    workers: Mutex<BTreeMap<String, WorkerHealth>>,
}

impl HealthBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, worker: &str, health: WorkerHealth) {
        self.workers
            .lock()
            .expect("health board poisoned")
            .insert(worker.to_string(), health);
    }

    pub fn snapshot(&self) -> BTreeMap<String, WorkerHealth> {
        self.workers.lock().expect("health board poisoned").clone()
    }

    /// Healthy iff every registered worker is running without a sticky error.
    pub fn all_healthy(&self) -> bool {
        self.workers
            .lock()
            .expect("health board poisoned")
            .values()
            .all(|w| w.running && w.last_error.is_none())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RpcHealth {
    pub healthy: bool,
    pub workers: BTreeMap<String, WorkerHealth>,
}
