use std::collections::BTreeMap;

use jsonrpsee::core::RpcResult;
use jsonrpsee::proc_macros::rpc;

use numio_catalog::{CountryOverview, ServiceOverview};
use numio_poll::CycleReport;
use numio_saga::OrderStatus;

use crate::types::{
    RpcAck, RpcHealth, RpcOffer, RpcOrderSummary, RpcPurchaseRequest, RpcPurchaseResponse,
};

/// Numio JSON-RPC 2.0 API definition.
///
/// All method names are prefixed with "numio_" via `namespace = "numio"`.
#[rpc(server, namespace = "numio")]
pub trait NumioApi {
    /// Buy a number. Expected failures come back as `err_code`, never as an
    /// RPC error.
    #[method(name = "purchase")]
    async fn purchase(&self, req: RpcPurchaseRequest) -> RpcResult<RpcPurchaseResponse>;

    /// Owner-scoped order status with received messages.
    #[method(name = "getOrderStatus")]
    async fn get_order_status(&self, order_id: u64, user_id: String) -> RpcResult<OrderStatus>;

    /// Cancel a RESERVED or ACTIVE order and process its refund.
    #[method(name = "cancelOrder")]
    async fn cancel_order(&self, order_id: u64, user_id: String) -> RpcResult<RpcAck>;

    /// Ask the upstream for another SMS. Fails with NOT_SUPPORTED when the
    /// provider lacks the capability.
    #[method(name = "requestResend")]
    async fn request_resend(&self, order_id: u64, user_id: String) -> RpcResult<RpcAck>;

    /// Run one poll cycle inline and return its report.
    #[method(name = "runPollCycle")]
    async fn run_poll_cycle(&self) -> RpcResult<CycleReport>;

    /// Paginated listing of a user's orders, newest first (max 200).
    #[method(name = "getUserOrders")]
    async fn get_user_orders(
        &self,
        user_id: String,
        offset: u32,
        limit: u32,
    ) -> RpcResult<Vec<RpcOrderSummary>>;

    // ── Catalog ──────────────────────────────────────────────────────────────

    /// Browse in-stock offers, cheapest first (max 200).
    #[method(name = "getOffers")]
    async fn get_offers(
        &self,
        service: Option<String>,
        country: Option<String>,
        provider: Option<String>,
        limit: u32,
    ) -> RpcResult<Vec<RpcOffer>>;

    /// Offers grouped by canonical country, with per-provider breakdown.
    #[method(name = "getCountriesOverview")]
    async fn get_countries_overview(&self) -> RpcResult<Vec<CountryOverview>>;

    /// Offers grouped by canonical service, with per-provider breakdown.
    #[method(name = "getServicesOverview")]
    async fn get_services_overview(&self) -> RpcResult<Vec<ServiceOverview>>;

    // ── Operations ───────────────────────────────────────────────────────────

    /// Aggregate worker health.
    #[method(name = "healthz")]
    async fn healthz(&self) -> RpcResult<RpcHealth>;

    /// Process-local counters (transitions, poll cycles, outbox passes).
    #[method(name = "getMetrics")]
    async fn get_metrics(&self) -> RpcResult<BTreeMap<String, u64>>;
}
