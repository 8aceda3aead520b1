use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use jsonrpsee::core::{async_trait, RpcResult};
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObject;
use tracing::info;

use numio_adapter::ProviderAdapter;
use numio_catalog::{
    aggregate, Catalog, CountryOverview, OfferQuery, SearchIndex, ServiceOverview, SortBy,
};
use numio_core::{ActivationId, Money, NumioError, ProviderId, TraceId, UserId};
use numio_poll::{CycleReport, PollManager};
use numio_saga::{status, OrderStatus, Orchestrator, PurchaseOutcome, PurchaseRequest};
use numio_store::Store;

use crate::api::NumioApiServer;
use crate::types::{
    HealthBoard, RpcAck, RpcHealth, RpcOffer, RpcOrderSummary, RpcPurchaseRequest,
    RpcPurchaseResponse,
};

const MAX_PAGE: u32 = 200;

fn rpc_err(code: i32, msg: impl Into<String>) -> ErrorObject<'static> {
    ErrorObject::owned(code, msg.into(), None::<()>)
}

fn internal(e: NumioError) -> ErrorObject<'static> {
    rpc_err(-32603, e.to_string())
}

/// Shared state passed to the RPC server.
pub struct RpcServerState {
    pub store: Arc<Store>,
    pub orchestrator: Arc<Orchestrator>,
    pub poll: Arc<PollManager>,
    pub catalog: Arc<Catalog>,
    pub adapters: numio_adapter::AdapterRegistry,
    pub health: Arc<HealthBoard>,
}

/// The RPC server implementation.
pub struct RpcServer {
    state: Arc<RpcServerState>,
}

impl RpcServer {
    pub fn new(state: Arc<RpcServerState>) -> Self {
        Self { state }
    }

    /// Start the JSON-RPC server on `addr`. Returns a handle to stop it.
    pub async fn start(self, addr: SocketAddr) -> anyhow::Result<ServerHandle> {
        let server = Server::builder().build(addr).await?;
        let module = self.into_rpc();
        let handle = server.start(module);
        info!(%addr, "RPC server started");
        Ok(handle)
    }
}

/// Fresh trace id for one RPC entry, tagged with the nanosecond clock tick.
fn new_trace() -> TraceId {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    TraceId::new(format!("rpc-{nanos:x}"))
}

// ── RPC implementation ───────────────────────────────────────────────────────

#[async_trait]
impl NumioApiServer for RpcServer {
    async fn purchase(&self, req: RpcPurchaseRequest) -> RpcResult<RpcPurchaseResponse> {
        let outcome = self
            .state
            .orchestrator
            .purchase(PurchaseRequest {
                user_id: UserId::new(req.user_id),
                provider_id: req.provider.map(ProviderId::new),
                service: req.service,
                country: req.country,
                max_price: Money::from_cents(req.max_price_cents),
                operator: req.operator,
                idempotency_key: req.idempotency_key,
                trace_id: new_trace(),
            })
            .await;

        Ok(match outcome {
            PurchaseOutcome::Success { activation_id, phone, upstream_id } => {
                RpcPurchaseResponse {
                    ok: true,
                    order_id: Some(activation_id.as_u64()),
                    phone: Some(phone),
                    upstream_id: Some(upstream_id),
                    err: None,
                    err_code: None,
                }
            }
            PurchaseOutcome::Existing { activation_id, phone, upstream_id, .. } => {
                RpcPurchaseResponse {
                    ok: true,
                    order_id: Some(activation_id.as_u64()),
                    phone,
                    upstream_id,
                    err: None,
                    err_code: None,
                }
            }
            PurchaseOutcome::Failure { code, message, activation_id } => RpcPurchaseResponse {
                ok: false,
                order_id: activation_id.map(|id| id.as_u64()),
                phone: None,
                upstream_id: None,
                err: Some(message),
                err_code: Some(code.label().to_string()),
            },
        })
    }

    async fn get_order_status(&self, order_id: u64, user_id: String) -> RpcResult<OrderStatus> {
        let user = UserId::new(user_id);
        let id = ActivationId(order_id);
        let activation = self
            .state
            .store
            .get_activation(id)
            .map_err(internal)?
            .ok_or_else(|| rpc_err(-32602, format!("order {order_id} not found")))?;
        let resend_supported = self
            .state
            .adapters
            .get(&activation.provider_id)
            .map(|a| a.supports_resend())
            .unwrap_or(false);
        status::order_status(&self.state.store, id, &user, resend_supported)
            .map_err(|e| rpc_err(-32602, e.to_string()))
    }

    async fn cancel_order(&self, order_id: u64, user_id: String) -> RpcResult<RpcAck> {
        let result = self
            .state
            .orchestrator
            .cancel(ActivationId(order_id), &UserId::new(user_id))
            .await;
        Ok(match result {
            Ok(()) => RpcAck { ok: true, err: None },
            Err(e) => RpcAck { ok: false, err: Some(e.to_string()) },
        })
    }

    async fn request_resend(&self, order_id: u64, user_id: String) -> RpcResult<RpcAck> {
        let result = self
            .state
            .orchestrator
            .request_resend(ActivationId(order_id), &UserId::new(user_id))
            .await;
        Ok(match result {
            Ok(()) => RpcAck { ok: true, err: None },
            Err(e) => RpcAck { ok: false, err: Some(e.to_string()) },
        })
    }

    async fn run_poll_cycle(&self) -> RpcResult<CycleReport> {
        self.state.poll.run_cycle().await.map_err(internal)
    }

    async fn get_user_orders(
        &self,
        user_id: String,
        offset: u32,
        limit: u32,
    ) -> RpcResult<Vec<RpcOrderSummary>> {
        let limit = limit.min(MAX_PAGE) as usize;
        let orders = self
            .state
            .store
            .iter_user_activations(&UserId::new(user_id), offset as usize, limit)
            .map_err(internal)?;
        Ok(orders
            .into_iter()
            .map(|a| RpcOrderSummary {
                order_id: a.id.as_u64(),
                state: a.state.label().to_string(),
                phone: a.phone,
                service: a.service_name.unwrap_or(a.service_code),
                country: a.country_name.unwrap_or(a.country_code),
                price_cents: a.price.cents(),
                created_at: a.created_at,
            })
            .collect())
    }

    async fn get_offers(
        &self,
        service: Option<String>,
        country: Option<String>,
        provider: Option<String>,
        limit: u32,
    ) -> RpcResult<Vec<RpcOffer>> {
        let offers = self
            .state
            .catalog
            .index()
            .search(OfferQuery {
                text: service,
                country_name: country,
                provider: provider.map(ProviderId::new),
                in_stock_only: true,
                sort: SortBy::PriceAsc,
                limit: limit.min(MAX_PAGE) as usize,
                ..Default::default()
            })
            .await
            .map_err(internal)?;
        Ok(offers.into_iter().map(RpcOffer::from).collect())
    }

    async fn get_countries_overview(&self) -> RpcResult<Vec<CountryOverview>> {
        aggregate::countries_overview(self.state.catalog.index().as_ref())
            .await
            .map_err(internal)
    }

    async fn get_services_overview(&self) -> RpcResult<Vec<ServiceOverview>> {
        aggregate::services_overview(self.state.catalog.index().as_ref())
            .await
            .map_err(internal)
    }

    async fn healthz(&self) -> RpcResult<RpcHealth> {
        Ok(RpcHealth {
            healthy: self.state.health.all_healthy(),
            workers: self.state.health.snapshot(),
        })
    }

    async fn get_metrics(&self) -> RpcResult<BTreeMap<String, u64>> {
        Ok(numio_kernel::metrics::snapshot())
    }
}
