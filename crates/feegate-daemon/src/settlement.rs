//! Settlement client for the vault signer sidecar.
//!
//! The sidecar holds payer keys and speaks JSON over plain HTTP/1 on a local
//! address:
//!
//! | Endpoint            | Request                                  | Response           |
//! |---------------------|------------------------------------------|--------------------|
//! | `POST /v1/address`  | `{scope_id, payer, target}`              | `{address}`        |
//! | `POST /v1/transfers`| `{from, to, asset, amount}`              | `{encoded}`        |
//! | `POST /v1/broadcast`| `{scope_id, payer, target, transfer}`    | `{tx_reference}`   |
//!
//! Connection failures, timeouts, `429` and `5xx` are retryable. Any other
//! non-success status is permanent.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use feegate_core::collaborators::{
    SettlementClient, SettlementError, SettlementErrorKind, UnsignedTransfer,
};
use feegate_core::{FeeAmount, Scope, ScopeId, TxReference};
use http::{Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default bound on one sidecar request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Serialize, Deserialize)]
struct AddressRequest {
    scope_id: ScopeId,
    payer: String,
    target: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AddressResponse {
    address: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct TransferRequest {
    from: String,
    to: String,
    asset: String,
    amount: FeeAmount,
}

#[derive(Debug, Serialize, Deserialize)]
struct TransferResponse {
    encoded: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct BroadcastRequest {
    scope_id: ScopeId,
    payer: String,
    target: String,
    transfer: UnsignedTransfer,
}

#[derive(Debug, Serialize, Deserialize)]
struct BroadcastResponse {
    tx_reference: String,
}

/// [`SettlementClient`] speaking JSON to the signer sidecar.
pub struct HttpSettlementClient {
    base_url: String,
    request_timeout: Duration,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpSettlementClient {
    /// Creates a client for the sidecar at `base_url` (e.g.
    /// `http://127.0.0.1:8645`).
    #[must_use]
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_timeout,
            client,
        }
    }

    /// Sidecar base URL without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<Req, Resp>(
        &self,
        kind: SettlementErrorKind,
        path: &str,
        body: &Req,
    ) -> Result<Resp, SettlementError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        let body_bytes = serde_json::to_vec(body)
            .map_err(|e| SettlementError::permanent(kind, format!("encode request: {e}")))?;

        let request = Request::builder()
            .method("POST")
            .uri(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("User-Agent", concat!("feegate-daemon/", env!("CARGO_PKG_VERSION")))
            .body(Full::new(Bytes::from(body_bytes)))
            .map_err(|e| SettlementError::permanent(kind, format!("build request: {e}")))?;

        debug!(url = %url, "calling signer sidecar");

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| SettlementError::transient(kind, format!("{url}: {e}")))?;
            let status = response.status();
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|e| SettlementError::transient(kind, format!("read response: {e}")))?
                .to_bytes();
            Ok::<_, SettlementError>((status, bytes))
        };

        let (status, bytes) = tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| SettlementError::transient(kind, format!("{url} timed out")))??;

        if !status.is_success() {
            let detail = String::from_utf8(bytes.to_vec())
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| format!("HTTP {status}"));
            let message = format!("{url} returned {}: {detail}", status.as_u16());
            return Err(if is_retryable_status(status) {
                SettlementError::transient(kind, message)
            } else {
                SettlementError::permanent(kind, message)
            });
        }

        // The request was accepted; an unreadable body must not be mistaken
        // for a rejection.
        serde_json::from_slice(&bytes)
            .map_err(|e| SettlementError::transient(kind, format!("decode response: {e}")))
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

#[async_trait]
impl SettlementClient for HttpSettlementClient {
    async fn resolve_address(&self, scope: &Scope) -> Result<String, SettlementError> {
        let kind = SettlementErrorKind::AddressResolution;
        let response: AddressResponse = self
            .post(
                kind,
                "/v1/address",
                &AddressRequest {
                    scope_id: scope.scope_id,
                    payer: scope.payer.clone(),
                    target: scope.target.clone(),
                },
            )
            .await?;
        if response.address.trim().is_empty() {
            return Err(SettlementError::permanent(kind, "sidecar returned an empty address"));
        }
        Ok(response.address)
    }

    async fn build_transfer(
        &self,
        from: &str,
        to: &str,
        asset: &str,
        amount: FeeAmount,
    ) -> Result<UnsignedTransfer, SettlementError> {
        let response: TransferResponse = self
            .post(
                SettlementErrorKind::Build,
                "/v1/transfers",
                &TransferRequest {
                    from: from.to_string(),
                    to: to.to_string(),
                    asset: asset.to_string(),
                    amount,
                },
            )
            .await?;
        Ok(UnsignedTransfer {
            from: from.to_string(),
            to: to.to_string(),
            asset: asset.to_string(),
            amount,
            encoded: response.encoded,
        })
    }

    async fn sign_and_broadcast(
        &self,
        scope: &Scope,
        transfer: &UnsignedTransfer,
    ) -> Result<TxReference, SettlementError> {
        let kind = SettlementErrorKind::Broadcast;
        let response: BroadcastResponse = self
            .post(
                kind,
                "/v1/broadcast",
                &BroadcastRequest {
                    scope_id: scope.scope_id,
                    payer: scope.payer.clone(),
                    target: scope.target.clone(),
                    transfer: transfer.clone(),
                },
            )
            .await?;
        // Accepted by the sidecar, so a transfer may be in flight.
        TxReference::new(response.tx_reference)
            .map_err(|e| SettlementError::transient(kind, format!("sidecar response: {e}")))
    }
}
