//! Code generator seam
//!
//! The generator is a black box: given a prompt and a context block (runtime
//! contract, package usage notes, earlier failures) it returns candidate
//! source plus the declared output kind. [`HttpGenerator`] speaks a plain
//! JSON-over-HTTP contract to any service that implements it.

use crate::error::GeneratorError;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt::Debug;
use std::time::Duration;
use toolsmith_artifact::GeneratedCode;

/// Produces candidate tool code
#[async_trait]
pub trait CodeGenerator: Send + Sync + Debug {
    /// Generate code for a prompt
    async fn generate(&self, prompt: &str, context: &str) -> Result<GeneratedCode, GeneratorError>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    context: &'a str,
}

/// JSON-over-HTTP generator client
///
/// POSTs `{prompt, context}` and expects a camelCase [`GeneratedCode`] body.
#[derive(Debug, Clone)]
pub struct HttpGenerator {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpGenerator {
    /// Create client for an endpoint
    ///
    /// # Errors
    /// Returns `Transport` if the HTTP client cannot be built
    pub fn new(
        endpoint: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GeneratorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GeneratorError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    /// Configured endpoint
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CodeGenerator for HttpGenerator {
    async fn generate(&self, prompt: &str, context: &str) -> Result<GeneratedCode, GeneratorError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&GenerateRequest { prompt, context });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GeneratorError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GeneratorError::Status {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            });
        }

        let mut code: GeneratedCode = response
            .json()
            .await
            .map_err(|e| GeneratorError::InvalidResponse(e.to_string()))?;

        code.source = strip_code_fences(&code.source);
        if code.source.trim().is_empty() {
            return Err(GeneratorError::EmptySource);
        }
        tracing::debug!(bytes = code.source.len(), kind = %code.output_kind, "generator returned code");
        Ok(code)
    }
}

/// Generator used when no endpoint is configured
///
/// Cache hits still work; any build fails with `NotConfigured`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredGenerator;

#[async_trait]
impl CodeGenerator for UnconfiguredGenerator {
    async fn generate(&self, _prompt: &str, _context: &str) -> Result<GeneratedCode, GeneratorError> {
        Err(GeneratorError::NotConfigured(
            "set generator.endpoint or TOOLSMITH_GENERATOR_URL".to_string(),
        ))
    }
}

/// Remove a surrounding Markdown code fence
#[must_use]
pub fn strip_code_fences(source: &str) -> String {
    let trimmed = source.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return source.to_string();
    };
    // drop the info string (```ts, ```javascript)
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    let body = body.trim_end();
    body.strip_suffix("```").unwrap_or(body).trim_end().to_string() + "\n"
}
