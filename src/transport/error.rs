//! Normalized error shape for every transport failure.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Failure classes callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  /// The request never got a response (connection failure, timeout)
  Network,
  /// 401 / 403
  Auth,
  /// Any other 4xx
  Client,
  /// 5xx
  Server,
  /// A response arrived but its body didn't match the expected shape
  Decode,
}

/// Error returned by every transport operation.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{message} ({code})")]
pub struct ApiError {
  pub kind: ErrorKind,
  pub code: String,
  pub message: String,
  pub details: Option<Value>,
  /// Whether retrying the same request may succeed
  pub retry: bool,
  pub timestamp: DateTime<Utc>,
  pub path: String,
  pub status_code: Option<u16>,
}

impl ApiError {
  /// Build an error from a non-success response.
  ///
  /// `code`, `message` and `details` are taken from the body when the server
  /// sent them.
  pub fn from_status(status: u16, path: &str, body: &Value) -> Self {
    let kind = match status {
      401 | 403 => ErrorKind::Auth,
      400..=499 => ErrorKind::Client,
      _ => ErrorKind::Server,
    };

    let code = body
      .get("code")
      .and_then(Value::as_str)
      .map(String::from)
      .unwrap_or_else(|| format!("HTTP_{}", status));

    let message = body
      .get("message")
      .or_else(|| body.get("error"))
      .and_then(Value::as_str)
      .map(String::from)
      .unwrap_or_else(|| {
        reqwest::StatusCode::from_u16(status)
          .ok()
          .and_then(|s| s.canonical_reason())
          .unwrap_or("Request failed")
          .to_string()
      });

    let details = match body.get("details") {
      Some(details) => Some(details.clone()),
      None if body.is_null() => None,
      None => Some(body.clone()),
    };

    Self {
      kind,
      code,
      message,
      details,
      retry: kind == ErrorKind::Server,
      timestamp: Utc::now(),
      path: path.to_string(),
      status_code: Some(status),
    }
  }

  /// Build an error for a request that never produced a response.
  pub fn network(path: &str, err: &reqwest::Error) -> Self {
    let (code, message) = if err.is_timeout() {
      ("TIMEOUT", "Request timed out".to_string())
    } else {
      ("NETWORK_ERROR", format!("Network error: {}", err))
    };

    Self::without_response(ErrorKind::Network, code, message, path)
  }

  /// Build an error for a body that couldn't be decoded.
  pub fn decode(path: &str, err: &serde_json::Error) -> Self {
    Self::without_response(
      ErrorKind::Decode,
      "DECODE_ERROR",
      format!("Unexpected response shape: {}", err),
      path,
    )
  }

  /// Build an error for a request that couldn't be constructed.
  pub fn invalid_request(path: &str, message: impl Into<String>) -> Self {
    Self::without_response(ErrorKind::Client, "INVALID_REQUEST", message.into(), path)
  }

  /// Build a network error without an underlying transport error, e.g. when
  /// the host already knows it is offline.
  pub fn network_unavailable(path: &str, message: impl Into<String>) -> Self {
    Self::without_response(ErrorKind::Network, "NETWORK_ERROR", message.into(), path)
  }

  /// A request abandoned before it could settle.
  pub fn cancelled(path: &str) -> Self {
    let mut err = Self::without_response(
      ErrorKind::Network,
      "CANCELLED",
      "Request was cancelled".to_string(),
      path,
    );
    err.retry = false;
    err
  }

  fn without_response(kind: ErrorKind, code: &str, message: String, path: &str) -> Self {
    Self {
      kind,
      code: code.to_string(),
      message,
      details: None,
      retry: kind == ErrorKind::Network,
      timestamp: Utc::now(),
      path: path.to_string(),
      status_code: None,
    }
  }

  pub fn is_network(&self) -> bool {
    self.kind == ErrorKind::Network
  }

  pub fn is_auth(&self) -> bool {
    self.kind == ErrorKind::Auth
  }

  /// Whether the server answered at all.
  pub fn has_response(&self) -> bool {
    self.status_code.is_some()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_status_classification() {
    assert_eq!(ApiError::from_status(401, "/a", &Value::Null).kind, ErrorKind::Auth);
    assert_eq!(ApiError::from_status(403, "/a", &Value::Null).kind, ErrorKind::Auth);
    assert_eq!(ApiError::from_status(422, "/a", &Value::Null).kind, ErrorKind::Client);
    assert_eq!(ApiError::from_status(503, "/a", &Value::Null).kind, ErrorKind::Server);
  }

  #[test]
  fn test_body_fields_are_used() {
    let body = json!({
      "code": "MUSEUM_NOT_FOUND",
      "message": "Museum not found",
      "details": { "id": "abc123" }
    });
    let err = ApiError::from_status(404, "/museums/abc123", &body);

    assert_eq!(err.code, "MUSEUM_NOT_FOUND");
    assert_eq!(err.message, "Museum not found");
    assert_eq!(err.details, Some(json!({ "id": "abc123" })));
    assert_eq!(err.status_code, Some(404));
    assert!(!err.retry);
    assert_eq!(err.to_string(), "Museum not found (MUSEUM_NOT_FOUND)");
  }

  #[test]
  fn test_fallback_message_from_status() {
    let err = ApiError::from_status(502, "/x", &Value::Null);
    assert_eq!(err.code, "HTTP_502");
    assert_eq!(err.message, "Bad Gateway");
    assert!(err.retry);
    assert!(err.details.is_none());
  }
}
