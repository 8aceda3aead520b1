//! HTTP provider adapter speaking a JSON protocol.
//!
//! Covers upstreams exposing the common activation-API shape:
//!
//!   GET  {base}/countries                          → [{id, name}]
//!   GET  {base}/services?country=XX                → [{id, name, icon_url?}]
//!   POST {base}/activations                        → {id, phone, expires_at, price_cents}
//!   GET  {base}/activations/{id}                   → {status, messages: [...]}
//!   GET  {base}/activations/status?ids=a,b,c       → {results: {id: {...}}}
//!   POST {base}/activations/{id}/cancel            → {}
//!   POST {base}/activations/{id}/resend            → {}
//!   GET  {base}/balance                            → {cents}
//!
//! Vendor quirks beyond this shape get their own adapter; this one is the
//! workhorse for the majority of upstreams.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use numio_core::{Money, NumioError, ProviderId, ADAPTER_CALL_TIMEOUT_SECS};

use crate::{
    AcquireOptions, AcquiredNumber, Country, ProviderAdapter, Service, StatusResult,
    UpstreamMessage, UpstreamStatus,
};

/// Capability switches for one configured upstream.
#[derive(Clone, Debug, Default)]
pub struct HttpAdapterCaps {
    pub status_batch: bool,
    pub balance: bool,
    pub resend: bool,
}

pub struct HttpAdapter {
    provider_id: ProviderId,
    base_url: String,
    api_key: String,
    caps: HttpAdapterCaps,
    client: reqwest::Client,
}

impl HttpAdapter {
    pub fn new(
        provider_id: ProviderId,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        caps: HttpAdapterCaps,
    ) -> Result<Self, NumioError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(ADAPTER_CALL_TIMEOUT_SECS))
            .build()
            .map_err(|e| NumioError::Transport(e.to_string()))?;
        Ok(Self {
            provider_id,
            base_url: base_url.into(),
            api_key: api_key.into(),
            caps,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, NumioError> {
        let resp = self
            .client
            .get(self.url(path))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(map_transport)?;
        decode_response(resp).await
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, NumioError> {
        let resp = self
            .client
            .post(self.url(path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(map_transport)?;
        decode_response(resp).await
    }
}

fn map_transport(e: reqwest::Error) -> NumioError {
    if e.is_timeout() {
        NumioError::UpstreamTimeout { timeout_secs: ADAPTER_CALL_TIMEOUT_SECS }
    } else {
        NumioError::Transport(e.to_string())
    }
}

/// Error body the protocol uses for refusals (as opposed to transport faults).
#[derive(Deserialize)]
struct WireError {
    code: String,
    #[serde(default)]
    message: String,
}

async fn decode_response<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, NumioError> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json::<T>()
            .await
            .map_err(|e| NumioError::Transport(format!("decoding upstream body: {e}")));
    }
    let err = resp.json::<WireError>().await.unwrap_or(WireError {
        code: format!("http_{}", status.as_u16()),
        message: String::new(),
    });
    Err(match err.code.as_str() {
        "no_numbers" => NumioError::NoNumbers,
        "no_balance" => NumioError::NoBalance,
        "bad_service" => NumioError::BadService(err.message),
        _ => NumioError::Transport(format!("upstream {status}: {} {}", err.code, err.message)),
    })
}

// ── Wire DTOs ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct WireAcquired {
    id: String,
    phone: String,
    expires_at: i64,
    price_cents: i64,
}

#[derive(Deserialize)]
struct WireMessage {
    id: String,
    sender: Option<String>,
    content: String,
    code: Option<String>,
    received_at: i64,
}

#[derive(Deserialize)]
struct WireStatus {
    status: String,
    #[serde(default)]
    messages: Vec<WireMessage>,
}

#[derive(Deserialize)]
struct WireBatch {
    results: HashMap<String, WireStatus>,
}

#[derive(Deserialize)]
struct WireBalance {
    cents: i64,
}

impl From<WireStatus> for StatusResult {
    fn from(w: WireStatus) -> Self {
        let status = match w.status.as_str() {
            "pending" => UpstreamStatus::Pending,
            "received" => UpstreamStatus::Received,
            "cancelled" => UpstreamStatus::Cancelled,
            "expired" => UpstreamStatus::Expired,
            "error" => UpstreamStatus::Error,
            other => {
                warn!(status = other, "unknown upstream status");
                UpstreamStatus::Error
            }
        };
        StatusResult {
            status,
            messages: w
                .messages
                .into_iter()
                .map(|m| UpstreamMessage {
                    id: m.id,
                    sender: m.sender,
                    content: m.content,
                    code: m.code,
                    received_at: m.received_at,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for HttpAdapter {
    fn provider_id(&self) -> ProviderId {
        self.provider_id.clone()
    }

    async fn list_countries(&self) -> Result<Vec<Country>, NumioError> {
        self.get_json("/countries").await
    }

    async fn list_services(&self, country: Option<&str>) -> Result<Vec<Service>, NumioError> {
        let path = match country {
            Some(c) => format!("/services?country={c}"),
            None => "/services".to_string(),
        };
        self.get_json(&path).await
    }

    async fn acquire(
        &self,
        country: &str,
        service: &str,
        opts: AcquireOptions,
    ) -> Result<AcquiredNumber, NumioError> {
        let body = serde_json::json!({
            "country": country,
            "service": service,
            "max_price_cents": opts.max_price.map(|p| p.cents()),
            "operator": opts.operator,
        });
        let w: WireAcquired = self.post_json("/activations", &body).await?;
        Ok(AcquiredNumber {
            upstream_id: w.id,
            phone: w.phone,
            expires_at: w.expires_at,
            price: Money::from_cents(w.price_cents),
        })
    }

    async fn status(&self, upstream_id: &str) -> Result<StatusResult, NumioError> {
        let w: WireStatus = self.get_json(&format!("/activations/{upstream_id}")).await?;
        Ok(w.into())
    }

    async fn cancel(&self, upstream_id: &str) -> Result<(), NumioError> {
        let _: serde_json::Value = self
            .post_json(
                &format!("/activations/{upstream_id}/cancel"),
                &serde_json::json!({}),
            )
            .await?;
        Ok(())
    }

    fn supports_balance(&self) -> bool {
        self.caps.balance
    }

    async fn balance(&self) -> Result<Money, NumioError> {
        if !self.caps.balance {
            return Err(NumioError::NotSupported(self.provider_id()));
        }
        let w: WireBalance = self.get_json("/balance").await?;
        Ok(Money::from_cents(w.cents))
    }

    fn supports_status_batch(&self) -> bool {
        self.caps.status_batch
    }

    async fn status_batch(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, Result<StatusResult, NumioError>>, NumioError> {
        if !self.caps.status_batch {
            // Probe-then-call discipline upheld by callers; degrade anyway.
            let mut out = HashMap::with_capacity(ids.len());
            for id in ids {
                out.insert(id.clone(), self.status(id).await);
            }
            return Ok(out);
        }
        let w: WireBatch = self
            .get_json(&format!("/activations/status?ids={}", ids.join(",")))
            .await?;
        let mut out: HashMap<String, Result<StatusResult, NumioError>> = w
            .results
            .into_iter()
            .map(|(id, st)| (id, Ok(st.into())))
            .collect();
        // Ids the upstream dropped from the response still need an answer.
        for id in ids {
            out.entry(id.clone()).or_insert_with(|| {
                Err(NumioError::Transport("missing from batch response".into()))
            });
        }
        Ok(out)
    }

    fn supports_resend(&self) -> bool {
        self.caps.resend
    }

    async fn request_resend(&self, upstream_id: &str) -> Result<(), NumioError> {
        if !self.caps.resend {
            return Err(NumioError::NotSupported(self.provider_id()));
        }
        let _: serde_json::Value = self
            .post_json(
                &format!("/activations/{upstream_id}/resend"),
                &serde_json::json!({}),
            )
            .await?;
        Ok(())
    }
}
