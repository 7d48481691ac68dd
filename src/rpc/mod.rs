use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::chain::{ChainBlock, FeePercentiles};

/// Current chain tip as reported by the node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TipInfo {
    pub height: u64,
    pub hash: String,
}

/// Raw mempool summary from the node, before anomaly flagging.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MempoolInfo {
    pub fees: FeePercentiles,
    pub tx_count: u64,
    pub total_vsize: u64,
}

/// The node query surface the monitor depends on. Implemented by the JSON-RPC
/// client below and by scripted fakes in tests.
pub trait NodeClient {
    fn tip(&self) -> impl Future<Output = Result<TipInfo, RpcError>> + Send;
    fn block_by_hash(&self, hash: &str) -> impl Future<Output = Result<ChainBlock, RpcError>> + Send;
    fn mempool(&self) -> impl Future<Output = Result<MempoolInfo, RpcError>> + Send;
}

/// Simple JSON-RPC client for the chain node.
pub struct NodeRpc {
    url: String,
    client: Client,
    auth: Option<String>, // base64 encoded user:pass
}

impl NodeRpc {
    pub fn new(
        url: &str,
        user: Option<&str>,
        pass: Option<&str>,
        timeout_secs: u64,
    ) -> Result<Self, reqwest::Error> {
        use base64::{Engine, engine::general_purpose::STANDARD};
        let auth = match (user, pass) {
            (Some(u), Some(p)) => Some(STANDARD.encode(format!("{u}:{p}"))),
            _ => None,
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            url: url.to_string(),
            client,
            auth,
        })
    }

    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let mut req = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(ref auth) = self.auth {
            req = req.header("Authorization", format!("Basic {auth}"));
        }

        let resp = req.send().await.map_err(RpcError::Http)?;
        let json: Value = resp.json().await.map_err(RpcError::Http)?;

        if let Some(err) = json.get("error").and_then(|e| {
            if e.is_null() { None } else { Some(e.clone()) }
        }) {
            return Err(RpcError::Rpc(err));
        }

        Ok(json["result"].clone())
    }
}

impl NodeClient for NodeRpc {
    async fn tip(&self) -> Result<TipInfo, RpcError> {
        let result = self.call("getchaintip", vec![]).await?;
        serde_json::from_value(result).map_err(RpcError::Decode)
    }

    async fn block_by_hash(&self, hash: &str) -> Result<ChainBlock, RpcError> {
        let result = self.call("getblock", vec![json!(hash)]).await?;
        serde_json::from_value(result).map_err(RpcError::Decode)
    }

    async fn mempool(&self) -> Result<MempoolInfo, RpcError> {
        let result = self.call("getmempoolsummary", vec![]).await?;
        serde_json::from_value(result).map_err(RpcError::Decode)
    }
}

#[derive(Debug)]
pub enum RpcError {
    Http(reqwest::Error),
    Rpc(Value),
    Decode(serde_json::Error),
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::Http(e) => write!(f, "HTTP error: {e}"),
            RpcError::Rpc(e) => write!(f, "RPC error: {e}"),
            RpcError::Decode(e) => write!(f, "decode error: {e}"),
        }
    }
}

impl std::error::Error for RpcError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_builds_with_timeout_and_auth() {
        let rpc = NodeRpc::new("http://127.0.0.1:18443", Some("user"), Some("pass"), 10);
        assert!(rpc.is_ok());
        assert!(rpc.unwrap().auth.is_some());
    }
}
