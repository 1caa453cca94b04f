//! Verb routing and invocation
//!
//! The executor resolves a sink verb's module to the runner endpoint of the
//! module's active deployment, then invokes the verb over HTTP. Runner
//! supervision and scaling live elsewhere; from here a runner is just an
//! endpoint that accepts verb invocations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::SqlitePool;
use thiserror::Error;

use crate::core::constants::ROUTE_CACHE_TTL_MS;
use crate::data::error::DataError;
use crate::data::sqlite::repositories::deployments;
use crate::model::context::TraceContext;
use crate::model::schema::VerbRef;
use crate::utils::time::now_ms;

#[derive(Error, Debug)]
pub enum InvokeError {
    #[error("no route for module {0}")]
    NoRoute(String),

    #[error("runner unreachable: {0}")]
    Unreachable(String),

    #[error("verb invocation timed out")]
    Timeout,

    #[error("verb failed: {0}")]
    Failed(String),
}

/// One verb invocation as handed to a runner
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub verb: VerbRef,
    pub endpoint: String,
    pub payload: Vec<u8>,
    pub request_key: Option<String>,
    pub trace: Option<TraceContext>,
    pub timeout: Duration,
}

/// Invokes verbs on runners. Object-safe so tests can script outcomes.
#[async_trait]
pub trait VerbInvoker: Send + Sync {
    async fn invoke(&self, request: InvokeRequest) -> Result<Vec<u8>, InvokeError>;
}

/// Production invoker: POSTs the payload to the runner's verb endpoint,
/// restoring the originating request key and trace context as headers.
pub struct HttpVerbInvoker {
    client: reqwest::Client,
}

impl HttpVerbInvoker {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn url(endpoint: &str, verb: &VerbRef) -> String {
        format!(
            "{}/verbs/{}/{}",
            endpoint.trim_end_matches('/'),
            verb.module,
            verb.name
        )
    }
}

impl Default for HttpVerbInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VerbInvoker for HttpVerbInvoker {
    async fn invoke(&self, request: InvokeRequest) -> Result<Vec<u8>, InvokeError> {
        let url = Self::url(&request.endpoint, &request.verb);

        let mut builder = self
            .client
            .post(&url)
            .timeout(request.timeout)
            .header("content-type", "application/octet-stream")
            .body(request.payload);
        if let Some(request_key) = &request.request_key {
            builder = builder.header("x-request-key", request_key);
        }
        if let Some(trace) = &request.trace {
            builder = builder.header("traceparent", &trace.traceparent);
            if let Some(state) = &trace.tracestate {
                builder = builder.header("tracestate", state);
            }
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                InvokeError::Timeout
            } else {
                InvokeError::Unreachable(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| InvokeError::Unreachable(e.to_string()))?;
        if status.is_success() {
            Ok(body.to_vec())
        } else {
            Err(InvokeError::Failed(format!(
                "{}: {}",
                status,
                String::from_utf8_lossy(&body)
            )))
        }
    }
}

/// Module → runner endpoint lookups with a short-TTL cache.
///
/// Routes change only on deployment activation, so a brief staleness window
/// is acceptable; a stale route fails the invocation and the call retries.
pub struct RouteTable {
    pool: SqlitePool,
    cache: DashMap<String, (String, i64)>,
}

impl RouteTable {
    pub fn new(pool: SqlitePool) -> Arc<Self> {
        Arc::new(Self {
            pool,
            cache: DashMap::new(),
        })
    }

    pub async fn resolve(&self, module: &str) -> Result<Option<String>, DataError> {
        if let Some(entry) = self.cache.get(module)
            && entry.1 > now_ms()
        {
            return Ok(Some(entry.0.clone()));
        }

        let endpoint = deployments::endpoint_for_module(&self.pool, module).await?;
        match &endpoint {
            Some(endpoint) => {
                self.cache.insert(
                    module.to_string(),
                    (endpoint.clone(), now_ms() + ROUTE_CACHE_TTL_MS),
                );
            }
            None => {
                self.cache.remove(module);
            }
        }
        Ok(endpoint)
    }

    /// Drop cached routes for a module (deployment changed)
    pub fn invalidate(&self, module: &str) {
        self.cache.remove(module);
    }
}
