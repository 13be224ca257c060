//! Run-scoped capability grants.
//!
//! An agent declares demands (an LLM endpoint, an MCP server, an OAuth
//! redirect) and the client answers each one independently. A failing demand
//! fails only its own capability.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};

use crate::error::FulfillmentError;

const LLM_PROXY_IDENTIFIER: &str = "llm_proxy";
const PLATFORM_URL_PLACEHOLDER: &str = "{platform_url}";
const DEFAULT_MODEL_ID: &str = "dummy";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Llm,
    Mcp,
    OAuth,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Llm => "llm",
            Self::Mcp => "mcp",
            Self::OAuth => "oauth",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmDemand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmDemands {
    pub llm_demands: BTreeMap<String, LlmDemand>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmFulfillment {
    pub identifier: String,
    pub api_base: String,
    pub api_key: String,
    pub api_model: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmFulfillments {
    pub llm_fulfillments: BTreeMap<String, LlmFulfillment>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpDemand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpDemands {
    pub mcp_demands: BTreeMap<String, McpDemand>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum McpTransport {
    StreamableHttp { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpFulfillment {
    pub transport: McpTransport,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpFulfillments {
    pub mcp_fulfillments: BTreeMap<String, McpFulfillment>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthDemand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthDemands {
    pub oauth_demands: BTreeMap<String, OAuthDemand>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthFulfillment {
    pub redirect_uri: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthFulfillments {
    pub oauth_fulfillments: BTreeMap<String, OAuthFulfillment>,
}

/// Answers an agent's capability demands for one run.
pub trait Fulfillments: fmt::Debug + Send + Sync + 'static {
    fn llm(&self, demands: &LlmDemands) -> BoxFuture<'static, Result<LlmFulfillments, FulfillmentError>>;

    fn mcp(&self, demands: &McpDemands) -> BoxFuture<'static, Result<McpFulfillments, FulfillmentError>>;

    fn oauth(
        &self,
        demands: &OAuthDemands,
    ) -> BoxFuture<'static, Result<OAuthFulfillments, FulfillmentError>>;
}

/// Produces the fulfillment set for a run.
pub trait FulfillmentResolver: Send + Sync + 'static {
    fn resolve(&self) -> BoxFuture<'_, Result<Arc<dyn Fulfillments>, FulfillmentError>>;
}

/// Resolver that hands out one shared fulfillment set.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    fulfillments: Arc<dyn Fulfillments>,
}

impl StaticResolver {
    pub fn new(fulfillments: impl Fulfillments) -> Self {
        Self {
            fulfillments: Arc::new(fulfillments),
        }
    }
}

impl FulfillmentResolver for StaticResolver {
    fn resolve(&self) -> BoxFuture<'_, Result<Arc<dyn Fulfillments>, FulfillmentError>> {
        future::ready(Ok(Arc::clone(&self.fulfillments))).boxed()
    }
}

/// Fulfillments backed by the agent platform: the platform LLM proxy, a
/// configured MCP endpoint, and a configured OAuth redirect.
#[derive(Clone, Default)]
pub struct PlatformFulfillments {
    platform_url: Option<String>,
    platform_token: String,
    model_id: Option<String>,
    mcp_url: Option<String>,
    redirect_uri: Option<String>,
}

impl fmt::Debug for PlatformFulfillments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformFulfillments")
            .field("platform_url", &self.platform_url)
            .field("platform_token", &"<redacted>")
            .field("model_id", &self.model_id)
            .field("mcp_url", &self.mcp_url)
            .field("redirect_uri", &self.redirect_uri)
            .finish()
    }
}

impl PlatformFulfillments {
    pub fn new(platform_token: impl Into<String>) -> Self {
        Self {
            platform_token: platform_token.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_platform_url(mut self, platform_url: impl Into<String>) -> Self {
        self.platform_url = Some(platform_url.into());
        self
    }

    #[must_use]
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    #[must_use]
    pub fn with_mcp_url(mut self, mcp_url: impl Into<String>) -> Self {
        self.mcp_url = Some(mcp_url.into());
        self
    }

    #[must_use]
    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = Some(redirect_uri.into());
        self
    }

    fn llm_api_base(&self) -> String {
        let base = self
            .platform_url
            .as_deref()
            .map_or(PLATFORM_URL_PLACEHOLDER, |url| url.trim_end_matches('/'));
        format!("{base}/api/v1/llm/")
    }

    fn answer_llm(&self, demands: &LlmDemands) -> Result<LlmFulfillments, FulfillmentError> {
        if demands.llm_demands.len() != 1 {
            return Err(FulfillmentError::UnsupportedDemandCount {
                capability: Capability::Llm,
                found: demands.llm_demands.len(),
            });
        }

        let llm_fulfillments = demands
            .llm_demands
            .keys()
            .map(|key| {
                let fulfillment = LlmFulfillment {
                    identifier: LLM_PROXY_IDENTIFIER.to_string(),
                    api_base: self.llm_api_base(),
                    api_key: self.platform_token.clone(),
                    api_model: self
                        .model_id
                        .clone()
                        .unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
                };
                (key.clone(), fulfillment)
            })
            .collect();

        Ok(LlmFulfillments { llm_fulfillments })
    }

    fn answer_mcp(&self, demands: &McpDemands) -> Result<McpFulfillments, FulfillmentError> {
        let url = self
            .mcp_url
            .clone()
            .ok_or_else(|| FulfillmentError::Unavailable {
                capability: Capability::Mcp,
                reason: "no MCP endpoint configured".to_string(),
            })?;

        let mcp_fulfillments = demands
            .mcp_demands
            .keys()
            .map(|key| {
                let fulfillment = McpFulfillment {
                    transport: McpTransport::StreamableHttp { url: url.clone() },
                };
                (key.clone(), fulfillment)
            })
            .collect();

        Ok(McpFulfillments { mcp_fulfillments })
    }

    fn answer_oauth(&self, demands: &OAuthDemands) -> Result<OAuthFulfillments, FulfillmentError> {
        let redirect_uri =
            self.redirect_uri
                .clone()
                .ok_or_else(|| FulfillmentError::Unavailable {
                    capability: Capability::OAuth,
                    reason: "no OAuth redirect URI configured".to_string(),
                })?;

        let oauth_fulfillments = demands
            .oauth_demands
            .keys()
            .map(|key| {
                let fulfillment = OAuthFulfillment {
                    redirect_uri: redirect_uri.clone(),
                };
                (key.clone(), fulfillment)
            })
            .collect();

        Ok(OAuthFulfillments { oauth_fulfillments })
    }
}

impl Fulfillments for PlatformFulfillments {
    fn llm(&self, demands: &LlmDemands) -> BoxFuture<'static, Result<LlmFulfillments, FulfillmentError>> {
        future::ready(self.answer_llm(demands)).boxed()
    }

    fn mcp(&self, demands: &McpDemands) -> BoxFuture<'static, Result<McpFulfillments, FulfillmentError>> {
        future::ready(self.answer_mcp(demands)).boxed()
    }

    fn oauth(
        &self,
        demands: &OAuthDemands,
    ) -> BoxFuture<'static, Result<OAuthFulfillments, FulfillmentError>> {
        future::ready(self.answer_oauth(demands)).boxed()
    }
}
