//! Chain-node client used by the state refresher.
//!
//! Only the two calls needed to sample live chain data are exposed: the
//! latest block with full transaction bodies and the receipts of a block.

mod error;
mod types;

pub use crate::error::ChainError;
pub use crate::types::{format_quantity, parse_quantity, Block, Log, Receipt, Transaction};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::types::{BlockView, ReceiptView};

/// Source of live chain data.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Fetch the current head block including transaction bodies.
    async fn latest_block(&self) -> Result<Block, ChainError>;

    /// Fetch all receipts of `block`.
    async fn block_receipts(&self, block: &Block) -> Result<Vec<Receipt>, ChainError>;
}

/// JSON-RPC over HTTP implementation of [`ChainClient`].
#[derive(Debug)]
pub struct HttpChainClient {
    endpoint: Url,
    http: Client,
    next_id: AtomicU64,
}

impl HttpChainClient {
    /// Create a new client for `endpoint` (e.g. `http://127.0.0.1:8545`).
    pub fn new(endpoint: impl AsRef<str>) -> Result<Self, ChainError> {
        Self::with_http_client(
            endpoint,
            Client::builder().timeout(Duration::from_secs(10)).build()?,
        )
    }

    /// Use an existing reqwest client (useful for custom TLS or proxies).
    pub fn with_http_client(endpoint: impl AsRef<str>, http: Client) -> Result<Self, ChainError> {
        let endpoint = Url::parse(endpoint.as_ref())
            .map_err(|_| ChainError::InvalidEndpoint(endpoint.as_ref().to_string()))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(ChainError::InvalidEndpoint(endpoint.to_string()));
        }
        Ok(Self {
            endpoint,
            http,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn call<P, T>(&self, method: &'static str, params: P) -> Result<T, ChainError>
    where
        P: Serialize,
        T: DeserializeOwned,
    {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        debug!(method, id = request.id, "chain rpc call");
        let response = self
            .http
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await?;
        let envelope: RpcResponse = Self::map_response(response).await?;
        if let Some(error) = envelope.error {
            return Err(ChainError::Rpc {
                method,
                code: error.code,
                message: error.message,
            });
        }
        match envelope.result {
            None | Some(Value::Null) => Err(ChainError::MissingResult(method)),
            Some(value) => serde_json::from_value(value).map_err(|err| {
                ChainError::parse_error(format!("malformed `{method}` result: {err}"))
            }),
        }
    }

    async fn map_response(response: Response) -> Result<RpcResponse, ChainError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChainError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<RpcResponse>().await?)
    }
}

#[async_trait]
impl ChainClient for HttpChainClient {
    async fn latest_block(&self) -> Result<Block, ChainError> {
        let view: BlockView = self
            .call("eth_getBlockByNumber", ("latest", true))
            .await?;
        view.try_into()
    }

    async fn block_receipts(&self, block: &Block) -> Result<Vec<Receipt>, ChainError> {
        let views: Vec<ReceiptView> = self
            .call("eth_getBlockReceipts", [format_quantity(block.number)])
            .await?;
        Ok(views.into_iter().map(Receipt::from).collect())
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest<P> {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: P,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}
