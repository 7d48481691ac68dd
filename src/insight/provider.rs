use std::fmt;
use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::ProviderEndpointConfig;
use crate::processors::SignalType;
use crate::store::EvidenceRef;

/// Everything a provider gets to work with: the signal plus the evidence
/// refs the worker already assembled.
#[derive(Debug, Clone, Serialize)]
pub struct InsightRequest {
    pub signal_type: SignalType,
    pub source_height: u64,
    pub confidence: f64,
    pub metadata: serde_json::Value,
    pub evidence: Vec<EvidenceRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProviderUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// What a provider hands back. Evidence may be omitted, in which case the
/// worker falls back to the request's own refs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InsightDraft {
    pub headline: String,
    pub summary: String,
    #[serde(default)]
    pub evidence: Vec<EvidenceRef>,
    #[serde(default)]
    pub usage: Option<ProviderUsage>,
}

#[derive(Debug)]
pub enum ProviderError {
    Http(reqwest::Error),
    Status { provider: String, code: u16 },
    Timeout,
    NoProvider,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Http(e) => write!(f, "provider http error: {e}"),
            ProviderError::Status { provider, code } => {
                write!(f, "provider {provider} returned status {code}")
            }
            ProviderError::Timeout => write!(f, "provider request timed out"),
            ProviderError::NoProvider => write!(f, "no inference provider configured"),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Http(e)
    }
}

/// A pluggable inference backend. Implementations must be deterministic
/// about shape (headline + summary), not content.
pub trait InferenceProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(
        &self,
        request: &InsightRequest,
    ) -> impl Future<Output = Result<InsightDraft, ProviderError>> + Send;
}

/// JSON-over-HTTP provider endpoint. Posts the request, expects a draft
/// back; bearer auth when the endpoint has a key.
pub struct HttpProvider {
    name: String,
    url: String,
    api_key: Option<String>,
    model: Option<String>,
    client: Client,
}

impl HttpProvider {
    pub fn new(cfg: &ProviderEndpointConfig, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            name: cfg.name.clone(),
            url: cfg.url.clone(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            client,
        })
    }
}

impl InferenceProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &InsightRequest) -> Result<InsightDraft, ProviderError> {
        let body = json!({
            "model": self.model,
            "signal": request,
        });
        let mut req = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout
            } else {
                ProviderError::Http(e)
            }
        })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ProviderError::Status {
                provider: self.name.clone(),
                code: status.as_u16(),
            });
        }
        let mut draft: InsightDraft = resp.json().await?;
        if draft.evidence.is_empty() {
            draft.evidence = request.evidence.clone();
        }
        debug!(provider = %self.name, "draft received");
        Ok(draft)
    }
}

/// Ordered failover across configured providers: first success wins, each
/// failure is logged and the next endpoint is tried.
pub struct ProviderChain<P> {
    providers: Vec<P>,
}

impl<P: InferenceProvider> ProviderChain<P> {
    pub fn new(providers: Vec<P>) -> Self {
        Self { providers }
    }

    pub fn single(provider: P) -> Self {
        Self {
            providers: vec![provider],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub async fn generate(&self, request: &InsightRequest) -> Result<InsightDraft, ProviderError> {
        let mut last = ProviderError::NoProvider;
        for provider in &self.providers {
            match provider.generate(request).await {
                Ok(draft) => return Ok(draft),
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "provider failed, trying next");
                    last = e;
                }
            }
        }
        Err(last)
    }
}

impl ProviderChain<HttpProvider> {
    pub fn from_endpoints(
        endpoints: &[ProviderEndpointConfig],
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let providers = endpoints
            .iter()
            .map(|e| HttpProvider::new(e, timeout))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(providers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyProvider {
        name: &'static str,
        failures_left: AtomicU32,
    }

    impl InferenceProvider for FlakyProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn generate(&self, req: &InsightRequest) -> Result<InsightDraft, ProviderError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(ProviderError::Status {
                    provider: self.name.to_string(),
                    code: 503,
                });
            }
            Ok(InsightDraft {
                headline: format!("from {}", self.name),
                summary: "ok".into(),
                evidence: req.evidence.clone(),
                usage: None,
            })
        }
    }

    fn request() -> InsightRequest {
        InsightRequest {
            signal_type: SignalType::WhaleAccumulation,
            source_height: 840_000,
            confidence: 0.9,
            metadata: json!({"total_moved": 600_0000_0000i64}),
            evidence: vec![EvidenceRef::Block(840_000)],
        }
    }

    #[tokio::test]
    async fn chain_fails_over_to_next_provider() {
        let chain = ProviderChain::new(vec![
            FlakyProvider {
                name: "primary",
                failures_left: AtomicU32::new(u32::MAX),
            },
            FlakyProvider {
                name: "fallback",
                failures_left: AtomicU32::new(0),
            },
        ]);
        let draft = chain.generate(&request()).await.unwrap();
        assert_eq!(draft.headline, "from fallback");
    }

    #[tokio::test]
    async fn chain_reports_last_error_when_all_fail() {
        let chain = ProviderChain::new(vec![FlakyProvider {
            name: "only",
            failures_left: AtomicU32::new(u32::MAX),
        }]);
        let err = chain.generate(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Status { code: 503, .. }));
    }

    #[tokio::test]
    async fn empty_chain_is_an_error() {
        let chain: ProviderChain<FlakyProvider> = ProviderChain::new(vec![]);
        let err = chain.generate(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::NoProvider));
    }

    #[test]
    fn draft_decode_defaults_optional_fields() {
        let draft: InsightDraft =
            serde_json::from_str(r#"{"headline":"h","summary":"s"}"#).unwrap();
        assert!(draft.evidence.is_empty());
        assert!(draft.usage.is_none());
    }
}
