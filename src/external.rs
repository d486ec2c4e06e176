use std::sync::Arc;

use async_trait::async_trait;
use rhai::{Dynamic, Engine, Scope};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::flow::engine::ExternalCall;
use crate::flow::model::HttpMethod;
use crate::state::{StateValue, VariableContext};

#[derive(Debug, Error)]
pub enum ExternalError {
    #[error("no resolver for {0} calls")]
    Unsupported(&'static str),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote answered with status {0}")]
    Status(u16),
    #[error("script error: {0}")]
    Script(String),
}

/// Performs the outside work a suspended flow waits for.
#[async_trait]
pub trait ExternalResolver: Send + Sync {
    /// False means someone else answers through the router callback.
    fn handles(&self, call: &ExternalCall) -> bool;
    async fn resolve(&self, call: &ExternalCall) -> Result<Value, ExternalError>;
}

#[derive(Clone, Default)]
pub struct HttpResolver {
    client: reqwest::Client,
}

impl HttpResolver {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ExternalResolver for HttpResolver {
    fn handles(&self, call: &ExternalCall) -> bool {
        matches!(call, ExternalCall::Http { .. })
    }

    async fn resolve(&self, call: &ExternalCall) -> Result<Value, ExternalError> {
        let ExternalCall::Http { method, url, headers, body } = call else {
            return Err(ExternalError::Unsupported("non-http"));
        };
        let method = match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };
        let mut request = self.client.request(method, url);
        for (k, v) in headers {
            request = request.header(k, v);
        }
        if let Some(b) = body {
            request = request.body(b.clone());
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExternalError::Status(status.as_u16()));
        }
        let text = response.text().await?;
        debug!(%url, status = status.as_u16(), bytes = text.len(), "url_request answered");
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

/// Runs `script` nodes with rhai. Conversation variables are in scope,
/// with `.` and `-` in their names replaced by `_`.
pub struct ScriptResolver {
    engine: Engine,
}

impl Default for ScriptResolver {
    fn default() -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(100_000);
        engine.set_max_expr_depths(64, 32);
        Self { engine }
    }
}

impl ScriptResolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn scope(vars: &VariableContext) -> Scope<'static> {
        let mut scope = Scope::new();
        for (name, value) in vars.iter() {
            let ident = name.replace(['.', '-'], "_");
            let value = match value {
                StateValue::String(s) => Dynamic::from(s.clone()),
                StateValue::Number(n) => Dynamic::from(*n),
                StateValue::Boolean(b) => Dynamic::from(*b),
            };
            scope.push_dynamic(ident, value);
        }
        scope
    }

    pub fn run(&self, source: &str, vars: &VariableContext) -> Result<Value, ExternalError> {
        let mut scope = Self::scope(vars);
        let result = self
            .engine
            .eval_with_scope::<Dynamic>(&mut scope, source)
            .map_err(|e| ExternalError::Script(e.to_string()))?;
        rhai::serde::from_dynamic::<Value>(&result).map_err(|e| ExternalError::Script(e.to_string()))
    }
}

#[async_trait]
impl ExternalResolver for ScriptResolver {
    fn handles(&self, call: &ExternalCall) -> bool {
        matches!(call, ExternalCall::Script { .. })
    }

    async fn resolve(&self, call: &ExternalCall) -> Result<Value, ExternalError> {
        match call {
            ExternalCall::Script { source, variables } => self.run(source, variables),
            _ => Err(ExternalError::Unsupported("non-script")),
        }
    }
}

/// Dispatches to the first resolver that handles the call.
#[derive(Clone, Default)]
pub struct Resolvers {
    resolvers: Vec<Arc<dyn ExternalResolver>>,
}

impl Resolvers {
    pub fn new() -> Self {
        Self::default()
    }

    /// HTTP and script resolvers; NLP stays with outside collaborators.
    pub fn builtin() -> Self {
        Self::new()
            .with(Arc::new(HttpResolver::default()))
            .with(Arc::new(ScriptResolver::new()))
    }

    pub fn with(mut self, resolver: Arc<dyn ExternalResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }
}

#[async_trait]
impl ExternalResolver for Resolvers {
    fn handles(&self, call: &ExternalCall) -> bool {
        self.resolvers.iter().any(|r| r.handles(call))
    }

    async fn resolve(&self, call: &ExternalCall) -> Result<Value, ExternalError> {
        match self.resolvers.iter().find(|r| r.handles(call)) {
            Some(r) => r.resolve(call).await,
            None => Err(ExternalError::Unsupported(match call {
                ExternalCall::Http { .. } => "http",
                ExternalCall::Script { .. } => "script",
                ExternalCall::Nlp { .. } => "nlp",
            })),
        }
    }
}
