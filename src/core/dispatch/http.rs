//! HTTP transport for function-compute style worker hosts.
//!
//! `POST {endpoint}/services/{service}/functions/{function}/invocations`
//! with the async invocation type and the run id as the stateful async
//! invocation id. The host deduplicates on that id and answers 409 for a
//! token it has already accepted.

use reqwest::blocking::Client;
use reqwest::StatusCode;
use std::time::Duration;

use super::{generate_request_id, InvocationReceipt, InvocationRequest, InvocationTransport};
use crate::defaults::DispatchConfig;
use crate::error::{Error, ErrorCode, Result};

pub const INVOCATION_TYPE_HEADER: &str = "X-Fc-Invocation-Type";
pub const IDEMPOTENCY_HEADER: &str = "X-Fc-Stateful-Async-Invocation-Id";
const REQUEST_ID_HEADER: &str = "x-fc-request-id";

pub struct HttpTransport {
    client: Client,
    endpoint: String,
    bearer_token: Option<String>,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, bearer_token: Option<String>, timeout: Duration) -> Result<Self> {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            return Err(Error::config_invalid_value(
                "defaults.dispatch.endpoint",
                None,
                "HTTP transport needs an endpoint",
            ));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::internal_unexpected(format!("build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            bearer_token,
        })
    }

    pub fn from_config(config: &DispatchConfig) -> Result<Self> {
        let endpoint = config.endpoint.clone().unwrap_or_default();
        let token = config
            .access_token_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|t| !t.is_empty());
        Self::new(endpoint, token, Duration::from_secs(config.timeout_secs))
    }

    pub fn invocation_url(&self, request: &InvocationRequest) -> String {
        format!(
            "{}/services/{}/functions/{}/invocations",
            self.endpoint, request.service_id, request.function_id
        )
    }
}

/// Map a non-success status onto the dispatch failure taxonomy.
pub fn classify_status(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorCode::DispatchAuthFailed,
        StatusCode::TOO_MANY_REQUESTS => ErrorCode::DispatchQuotaExceeded,
        _ => ErrorCode::DispatchRejected,
    }
}

impl InvocationTransport for HttpTransport {
    fn invoke(&self, request: &InvocationRequest) -> Result<InvocationReceipt> {
        let token = &request.headers.idempotency_token;
        let mut builder = self
            .client
            .post(self.invocation_url(request))
            .header(INVOCATION_TYPE_HEADER, request.headers.invocation_type.as_str())
            .header(IDEMPOTENCY_HEADER, token.as_str())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(request.body.clone());

        if let Some(bearer) = &self.bearer_token {
            builder = builder.bearer_auth(bearer);
        }

        let response = builder.send().map_err(|e| {
            Error::dispatch_failed(ErrorCode::DispatchRejected, token.clone(), None, e.to_string())
                .with_retryable(true)
        })?;

        let status = response.status();
        let request_id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(generate_request_id);

        if status.is_success() {
            return Ok(InvocationReceipt {
                request_id,
                deduplicated: false,
            });
        }

        if status == StatusCode::CONFLICT {
            return Ok(InvocationReceipt {
                request_id,
                deduplicated: true,
            });
        }

        let body = response.text().unwrap_or_default();
        Err(Error::dispatch_failed(
            classify_status(status),
            token.clone(),
            Some(status.as_u16()),
            body,
        ))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{InvocationHeaders, InvocationType};

    #[test]
    fn invocation_url_joins_service_and_function() {
        let transport =
            HttpTransport::new("https://fc.example.com/2016-08-15/", None, Duration::from_secs(5)).unwrap();
        let request = InvocationRequest {
            service_id: "cd".to_string(),
            function_id: "worker".to_string(),
            body: "{}".to_string(),
            headers: InvocationHeaders {
                invocation_type: InvocationType::Async,
                idempotency_token: "r1".to_string(),
            },
        };
        assert_eq!(
            transport.invocation_url(&request),
            "https://fc.example.com/2016-08-15/services/cd/functions/worker/invocations"
        );
    }

    #[test]
    fn empty_endpoint_is_config_error() {
        let err = HttpTransport::new("", None, Duration::from_secs(5)).err().unwrap();
        assert_eq!(err.code, ErrorCode::ConfigInvalidValue);
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::FORBIDDEN), ErrorCode::DispatchAuthFailed);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), ErrorCode::DispatchAuthFailed);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            ErrorCode::DispatchQuotaExceeded
        );
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            ErrorCode::DispatchRejected
        );
    }
}
