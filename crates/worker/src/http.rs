//! HTTP check operation for remote GIS services.
//!
//! Used for the server health check and the portal backup trigger that run
//! after connections are restored.

use std::time::Instant;

use async_trait::async_trait;
use gdbmaint_core::error::StepExecutionError;
use gdbmaint_core::step::{MaintenanceOperation, StepContext, StepOutput};
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};

/// Calls one endpoint and classifies the response status.
pub struct HttpCheckOperation {
    client: reqwest::Client,
    url: String,
    method: Method,
    /// Environment variable holding a bearer token.
    token_env: Option<String>,
}

impl HttpCheckOperation {
    /// `method` is one of the validated config methods; anything else falls
    /// back to GET.
    pub fn new(
        client: reqwest::Client,
        url: impl Into<String>,
        method: &str,
        token_env: Option<String>,
    ) -> Self {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes()).unwrap_or(Method::GET);
        Self {
            client,
            url: url.into(),
            method,
            token_env,
        }
    }
}

/// 2xx/3xx pass; 401/403 are authorization failures; 5xx, 408 and 429 are
/// transient; every other status is permanent.
pub fn classify_status(status: StatusCode) -> Result<(), StepExecutionError> {
    let message = || format!("HTTP {status}");
    if status.is_success() || status.is_redirection() {
        Ok(())
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Err(StepExecutionError::Unauthorized(message()))
    } else if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Err(StepExecutionError::Transient(message()))
    } else {
        Err(StepExecutionError::Failed(message()))
    }
}

/// ArcGIS services report failures as `200 OK` with an `{"error": {...}}`
/// body. Token errors (498/499) and 401/403 are authorization failures, 5xx
/// codes are transient, anything else is permanent.
pub fn classify_error_body(body: &Value) -> Result<(), StepExecutionError> {
    let Some(error) = body.get("error").filter(|e| !e.is_null()) else {
        return Ok(());
    };
    let code = error.get("code").and_then(Value::as_i64);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("no message");
    let text = match code {
        Some(code) => format!("service error {code}: {message}"),
        None => format!("service error: {message}"),
    };
    Err(match code {
        Some(401 | 403 | 498 | 499) => StepExecutionError::Unauthorized(text),
        Some(500..=599) => StepExecutionError::Transient(text),
        _ => StepExecutionError::Failed(text),
    })
}

/// Timeouts and connection failures are retryable; request construction and
/// decoding problems are not.
fn classify_request_error(err: &reqwest::Error, elapsed_ms: u64) -> StepExecutionError {
    if err.is_timeout() {
        StepExecutionError::Timeout { elapsed_ms }
    } else if err.is_connect() || err.is_request() {
        StepExecutionError::Transient(err.to_string())
    } else {
        StepExecutionError::Failed(err.to_string())
    }
}

#[async_trait]
impl MaintenanceOperation for HttpCheckOperation {
    async fn run(&self, ctx: &StepContext) -> Result<StepOutput, StepExecutionError> {
        let mut request = self
            .client
            .request(self.method.clone(), &self.url)
            .timeout(ctx.timeout);

        if let Some(var) = &self.token_env {
            let token = std::env::var(var)
                .ok()
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| {
                    StepExecutionError::Unauthorized(format!("bearer token variable {var} is not set"))
                })?;
            request = request.bearer_auth(token);
        }

        let start = Instant::now();
        let response = request
            .send()
            .await
            .map_err(|e| classify_request_error(&e, start.elapsed().as_millis() as u64))?;
        let status = response.status();
        tracing::debug!(step = %ctx.step, url = %self.url, status = status.as_u16(), "HTTP check responded");
        classify_status(status)?;

        let body = response.text().await.unwrap_or_default();
        let mut detail = json!({
            "url": self.url,
            "status": status.as_u16(),
            "duration_ms": start.elapsed().as_millis() as u64,
        });
        if let Ok(parsed) = serde_json::from_str::<Value>(&body) {
            classify_error_body(&parsed)?;
            detail["response"] = parsed;
        }
        Ok(StepOutput {
            detail,
            output: Some(body),
        })
    }
}
