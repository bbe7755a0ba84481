//! HTTP remote endpoint.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use outbox_common::{Error, ResourceKey, Result};

use crate::conflict::ConflictInfo;
use crate::reachability::ReachabilityProbe;
use crate::remote::{RemoteEndpoint, RemoteResponse, SubmitRequest, TransportError};

/// Header carrying the operation id.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Serialize)]
struct SubmitBody<'a> {
    resource_key: &'a ResourceKey,
    payload: &'a Value,
}

#[derive(Debug, Default, Deserialize)]
struct AppliedBody {
    #[serde(default)]
    snapshot: Option<Value>,
}

/// Body fields that may carry a rejection reason, in order of preference.
const REASON_FIELDS: [&str; 3] = ["reason", "error", "message"];

fn rejection_reason(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    REASON_FIELDS
        .iter()
        .find_map(|field| value.get(field).and_then(Value::as_str))
        .map(str::to_string)
}

/// Remote endpoint speaking JSON over HTTP.
///
/// Each operation is sent as `POST {base}/operations/{kind}` with the
/// operation id in the `Idempotency-Key` header and
/// `{"resource_key": .., "payload": ..}` as body.
pub struct HttpEndpoint {
    http: Client,
    base: Url,
}

impl HttpEndpoint {
    /// Create a new endpoint rooted at `base`.
    ///
    /// # Errors
    /// - `InvalidInput` if `base` cannot carry a path
    /// - `Network` if the HTTP client cannot be built
    pub fn new(base: Url) -> Result<Self> {
        Self::with_timeout(base, None)
    }

    /// Like [`HttpEndpoint::new`] with a client-level request timeout.
    pub fn with_timeout(base: Url, timeout: Option<Duration>) -> Result<Self> {
        if base.cannot_be_a_base() {
            return Err(Error::InvalidInput(format!("Not a base URL: {}", base)));
        }

        let mut builder = Client::builder().user_agent(concat!("outbox/", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { http, base })
    }

    /// The base URL.
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// URL an operation of `kind` is posted to.
    pub fn operation_url(&self, kind: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("operations").push(kind);
        }
        url
    }
}

fn transport_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_decode() {
        TransportError::Decode(err.to_string())
    } else {
        TransportError::Unreachable(err.to_string())
    }
}

/// Interpret a status and body received from the remote.
pub fn decode_response(
    status: StatusCode,
    body: &str,
) -> std::result::Result<RemoteResponse, TransportError> {
    if status.is_success() {
        if status == StatusCode::NO_CONTENT || body.trim().is_empty() {
            return Ok(RemoteResponse::Applied { snapshot: None });
        }
        let applied: AppliedBody =
            serde_json::from_str(body).map_err(|e| TransportError::Decode(e.to_string()))?;
        return Ok(RemoteResponse::Applied {
            snapshot: applied.snapshot,
        });
    }

    match status {
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            let info = serde_json::from_str::<ConflictInfo>(body).unwrap_or_else(|_| {
                ConflictInfo::new(if body.is_empty() {
                    status.to_string()
                } else {
                    body.to_string()
                })
            });
            Ok(RemoteResponse::Conflict(info))
        }
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            let reason = rejection_reason(body).unwrap_or_else(|| {
                    if body.is_empty() {
                        status.to_string()
                    } else {
                        body.to_string()
                    }
                });
            Ok(RemoteResponse::Rejected { reason })
        }
        _ => Err(TransportError::Status {
            code: status.as_u16(),
            body: body.to_string(),
        }),
    }
}

#[async_trait]
impl RemoteEndpoint for HttpEndpoint {
    fn name(&self) -> &str {
        "http"
    }

    async fn submit(&self, request: &SubmitRequest) -> std::result::Result<RemoteResponse, TransportError> {
        let url = self.operation_url(&request.kind);
        debug!("POST {} ({})", url, request.idempotency_key);

        let response = self
            .http
            .post(url)
            .header(IDEMPOTENCY_KEY_HEADER, request.idempotency_key.to_string())
            .json(&SubmitBody {
                resource_key: &request.resource_key,
                payload: &request.payload,
            })
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        decode_response(status, &body)
    }
}

#[async_trait]
impl ReachabilityProbe for HttpEndpoint {
    async fn is_reachable(&self) -> bool {
        // Any response at all means the server can be reached.
        self.http.head(self.base.clone()).send().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outbox_common::ErrorClass;
    use serde_json::json;

    #[test]
    fn test_operation_url() {
        let endpoint = HttpEndpoint::new(Url::parse("https://api.example.com/v1/").unwrap()).unwrap();
        assert_eq!(
            endpoint.operation_url("log_set").as_str(),
            "https://api.example.com/v1/operations/log_set"
        );

        let endpoint = HttpEndpoint::new(Url::parse("https://api.example.com/v1").unwrap()).unwrap();
        assert_eq!(
            endpoint.operation_url("a b").as_str(),
            "https://api.example.com/v1/operations/a%20b"
        );
    }

    #[test]
    fn test_rejects_non_base_url() {
        let result = HttpEndpoint::new(Url::parse("mailto:ops@example.com").unwrap());
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_decode_applied() {
        assert_eq!(
            decode_response(StatusCode::OK, r#"{"snapshot": {"reps": 5}}"#).unwrap(),
            RemoteResponse::Applied {
                snapshot: Some(json!({"reps": 5}))
            }
        );
        assert_eq!(
            decode_response(StatusCode::NO_CONTENT, "").unwrap(),
            RemoteResponse::Applied { snapshot: None }
        );
        assert_eq!(
            decode_response(StatusCode::CREATED, "{}").unwrap(),
            RemoteResponse::Applied { snapshot: None }
        );
    }

    #[test]
    fn test_decode_garbage_is_terminal() {
        let err = decode_response(StatusCode::OK, "<html>").unwrap_err();
        assert!(matches!(err, TransportError::Decode(_)));
        assert_eq!(err.class(), ErrorClass::Terminal);
    }

    #[test]
    fn test_decode_conflict() {
        let response = decode_response(
            StatusCode::CONFLICT,
            r#"{"server_version": 3, "server_snapshot": {"reps": 1}, "message": "stale"}"#,
        )
        .unwrap();
        let RemoteResponse::Conflict(info) = response else {
            panic!("expected conflict");
        };
        assert_eq!(info.server_version, Some(3));
        assert_eq!(info.message, "stale");

        let response = decode_response(StatusCode::PRECONDITION_FAILED, "etag mismatch").unwrap();
        let RemoteResponse::Conflict(info) = response else {
            panic!("expected conflict");
        };
        assert_eq!(info.message, "etag mismatch");
        assert!(info.server_version.is_none());
    }

    #[test]
    fn test_decode_rejected() {
        assert_eq!(
            decode_response(StatusCode::UNPROCESSABLE_ENTITY, r#"{"error": "reps < 0"}"#).unwrap(),
            RemoteResponse::Rejected {
                reason: "reps < 0".to_string()
            }
        );
        assert_eq!(
            decode_response(
                StatusCode::BAD_REQUEST,
                r#"{"error": "validation_failed", "message": "reps must be positive"}"#
            )
            .unwrap(),
            RemoteResponse::Rejected {
                reason: "validation_failed".to_string()
            }
        );
        assert_eq!(
            decode_response(
                StatusCode::BAD_REQUEST,
                r#"{"code": 7, "message": "reps must be positive"}"#
            )
            .unwrap(),
            RemoteResponse::Rejected {
                reason: "reps must be positive".to_string()
            }
        );
        assert_eq!(
            decode_response(StatusCode::BAD_REQUEST, "bad").unwrap(),
            RemoteResponse::Rejected {
                reason: "bad".to_string()
            }
        );
    }

    #[test]
    fn test_decode_other_status() {
        let err = decode_response(StatusCode::SERVICE_UNAVAILABLE, "busy").unwrap_err();
        assert_eq!(err.class(), ErrorClass::Retryable);

        let err = decode_response(StatusCode::FORBIDDEN, "").unwrap_err();
        assert_eq!(err.class(), ErrorClass::Terminal);
    }
}
