use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use super::error::ApiError;
use crate::config::ApiConfig;

/// Chunk size used when streaming upload bodies.
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// A boxed future that resolves once recovery has finished
pub type RecoveryFuture = Pin<Box<dyn Future<Output = Result<(), ApiError>> + Send>>;

/// Recovery function invoked with the normalized error of a failed response.
///
/// Resolving `Ok(())` retries the original request once.
pub type RecoveryHandler = Arc<dyn Fn(ApiError) -> RecoveryFuture + Send + Sync>;

/// Callback receiving upload progress
pub type ProgressFn = Arc<dyn Fn(UploadProgress) + Send + Sync>;

/// Bearer token attached to outgoing requests
#[derive(Debug, Clone)]
pub struct AuthToken {
  pub value: String,
  pub attached_at: DateTime<Utc>,
}

/// Progress of a streaming upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
  pub loaded: u64,
  pub total: u64,
  pub percentage: u32,
}

impl UploadProgress {
  fn new(loaded: u64, total: u64) -> Self {
    let percentage = if total == 0 {
      100
    } else {
      ((loaded as f64 / total as f64) * 100.0).round() as u32
    };
    Self {
      loaded,
      total,
      percentage,
    }
  }
}

/// Options for [`ApiClient::request`]
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
  /// Query string parameters
  pub params: Vec<(String, String)>,
  /// JSON body
  pub body: Option<Value>,
  /// Extra headers
  pub headers: Vec<(String, String)>,
}

/// HTTP client for the portal API
#[derive(Clone)]
pub struct ApiClient {
  inner: Arc<ClientInner>,
}

struct ClientInner {
  http: reqwest::Client,
  base_url: String,
  dev_logging: bool,
  auth: RwLock<Option<AuthToken>>,
  error_handler: RwLock<Option<RecoveryHandler>>,
}

impl ApiClient {
  /// Build a client. Fails when the base URL is missing or invalid.
  pub fn new(config: &ApiConfig) -> Result<Self> {
    let base_url = config
      .base_url
      .as_deref()
      .map(str::trim)
      .filter(|u| !u.is_empty())
      .ok_or_else(|| eyre!("API base URL is not configured"))?;

    Url::parse(base_url).map_err(|e| eyre!("Invalid API base URL {}: {}", base_url, e))?;

    let http = reqwest::Client::builder()
      .timeout(Duration::from_millis(config.timeout_ms))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      inner: Arc::new(ClientInner {
        http,
        base_url: base_url.trim_end_matches('/').to_string(),
        dev_logging: config.dev_logging,
        auth: RwLock::new(None),
        error_handler: RwLock::new(None),
      }),
    })
  }

  pub fn base_url(&self) -> &str {
    &self.inner.base_url
  }

  /// Use `token` for every request sent from now on.
  pub fn set_auth(&self, token: impl Into<String>) {
    let token = AuthToken {
      value: token.into(),
      attached_at: Utc::now(),
    };
    *self.inner.auth.write().unwrap_or_else(|e| e.into_inner()) = Some(token);
  }

  pub fn clear_auth(&self) {
    *self.inner.auth.write().unwrap_or_else(|e| e.into_inner()) = None;
  }

  pub fn auth_token(&self) -> Option<AuthToken> {
    self
      .inner
      .auth
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .clone()
  }

  /// Install the recovery handler run on failed responses.
  pub fn set_error_handler<F, Fut>(&self, handler: F)
  where
    F: Fn(ApiError) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ApiError>> + Send + 'static,
  {
    let handler: RecoveryHandler = Arc::new(move |err| Box::pin(handler(err)));
    *self
      .inner
      .error_handler
      .write()
      .unwrap_or_else(|e| e.into_inner()) = Some(handler);
  }

  pub fn clear_error_handler(&self) {
    *self
      .inner
      .error_handler
      .write()
      .unwrap_or_else(|e| e.into_inner()) = None;
  }

  pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
    self
      .request(Method::GET, path, RequestOptions::default())
      .await
  }

  /// GET with query string parameters.
  pub async fn get_with<T, P>(&self, path: &str, params: &P) -> Result<T, ApiError>
  where
    T: DeserializeOwned,
    P: Serialize + ?Sized,
  {
    let params = to_params(path, params)?;
    self
      .request(
        Method::GET,
        path,
        RequestOptions {
          params,
          ..Default::default()
        },
      )
      .await
  }

  pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
  where
    T: DeserializeOwned,
    B: Serialize + ?Sized,
  {
    self.send_json(Method::POST, path, body).await
  }

  pub async fn put<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
  where
    T: DeserializeOwned,
    B: Serialize + ?Sized,
  {
    self.send_json(Method::PUT, path, body).await
  }

  pub async fn patch<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
  where
    T: DeserializeOwned,
    B: Serialize + ?Sized,
  {
    self.send_json(Method::PATCH, path, body).await
  }

  pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
    self
      .request(Method::DELETE, path, RequestOptions::default())
      .await
  }

  /// Upload `data` as a multipart `file` field, reporting progress per chunk.
  pub async fn upload<T: DeserializeOwned>(
    &self,
    path: &str,
    file_name: &str,
    data: Vec<u8>,
    on_progress: Option<ProgressFn>,
  ) -> Result<T, ApiError> {
    let data = Arc::new(data);
    let file_name = file_name.to_string();

    // The form is rebuilt per attempt since a streamed body can only be sent once
    let attach = move |req: RequestBuilder| {
      let part = Part::stream_with_length(
        progress_body(Arc::clone(&data), on_progress.clone()),
        data.len() as u64,
      )
      .file_name(file_name.clone());
      req.multipart(Form::new().part("file", part))
    };

    let value = self.execute(Method::POST, path, None, &attach).await?;
    decode(path, value)
  }

  /// Send a request with full control over params, body and headers.
  pub async fn request<T: DeserializeOwned>(
    &self,
    method: Method,
    path: &str,
    options: RequestOptions,
  ) -> Result<T, ApiError> {
    let RequestOptions {
      params,
      body,
      headers,
    } = options;

    let attach = |mut req: RequestBuilder| {
      if !params.is_empty() {
        req = req.query(&params);
      }
      for (name, value) in &headers {
        req = req.header(name.as_str(), value.as_str());
      }
      if let Some(body) = &body {
        req = req.json(body);
      }
      req
    };

    let value = self.execute(method, path, body.as_ref(), &attach).await?;
    decode(path, value)
  }

  async fn send_json<T, B>(&self, method: Method, path: &str, body: &B) -> Result<T, ApiError>
  where
    T: DeserializeOwned,
    B: Serialize + ?Sized,
  {
    let body = serde_json::to_value(body)
      .map_err(|e| ApiError::invalid_request(path, format!("Failed to serialize body: {}", e)))?;
    self
      .request(
        method,
        path,
        RequestOptions {
          body: Some(body),
          ..Default::default()
        },
      )
      .await
  }

  /// Send once; on a failed response give the recovery handler one chance,
  /// then retry exactly once if it succeeded.
  async fn execute(
    &self,
    method: Method,
    path: &str,
    logged_body: Option<&Value>,
    attach: &(dyn Fn(RequestBuilder) -> RequestBuilder + Send + Sync),
  ) -> Result<Value, ApiError> {
    let err = match self.send_once(&method, path, logged_body, attach).await {
      Ok(value) => return Ok(value),
      Err(err) => err,
    };

    if !err.has_response() {
      return Err(err);
    }

    let handler = self
      .inner
      .error_handler
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .clone();

    let Some(handler) = handler else {
      return Err(err);
    };

    match handler(err.clone()).await {
      Ok(()) => {
        debug!(%method, path, "recovery succeeded, retrying request");
        self.send_once(&method, path, logged_body, attach).await
      }
      Err(recovery_err) => {
        debug!(%method, path, error = %recovery_err, "recovery failed");
        Err(err)
      }
    }
  }

  async fn send_once(
    &self,
    method: &Method,
    path: &str,
    logged_body: Option<&Value>,
    attach: &(dyn Fn(RequestBuilder) -> RequestBuilder + Send + Sync),
  ) -> Result<Value, ApiError> {
    let url = self.url(path)?;
    let request_id = Uuid::new_v4().to_string();

    let mut req = self
      .inner
      .http
      .request(method.clone(), url)
      .header("X-Request-ID", &request_id)
      .header("X-Request-Timestamp", Utc::now().to_rfc3339());

    // Read the token per attempt so a refreshed token is used on retry
    if let Some(token) = self.auth_token() {
      req = req.bearer_auth(token.value);
    }
    let req = attach(req);

    if self.inner.dev_logging {
      debug!(%method, path, %request_id, body = ?logged_body, "sending request");
    }

    let response = req.send().await.map_err(|e| {
      warn!(%method, path, %request_id, error = %e, "request failed without response");
      ApiError::network(path, &e)
    })?;

    let status = response.status();
    let bytes = response
      .bytes()
      .await
      .map_err(|e| ApiError::network(path, &e))?;

    let body: Value = if bytes.is_empty() {
      Value::Null
    } else {
      serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };

    if self.inner.dev_logging {
      debug!(%method, path, %request_id, status = status.as_u16(), body = %body, "received response");
    }

    if status.is_success() {
      Ok(body)
    } else {
      Err(ApiError::from_status(status.as_u16(), path, &body))
    }
  }

  fn url(&self, path: &str) -> Result<Url, ApiError> {
    let joined = format!("{}/{}", self.inner.base_url, path.trim_start_matches('/'));
    Url::parse(&joined).map_err(|e| ApiError::invalid_request(path, format!("Invalid URL: {}", e)))
  }
}

fn decode<T: DeserializeOwned>(path: &str, value: Value) -> Result<T, ApiError> {
  serde_json::from_value(value).map_err(|e| ApiError::decode(path, &e))
}

/// Flatten a serializable params object into query pairs.
fn to_params<P: Serialize + ?Sized>(path: &str, params: &P) -> Result<Vec<(String, String)>, ApiError> {
  let value = serde_json::to_value(params)
    .map_err(|e| ApiError::invalid_request(path, format!("Failed to serialize params: {}", e)))?;

  let Value::Object(map) = value else {
    return Err(ApiError::invalid_request(path, "Query params must be an object"));
  };

  Ok(
    map
      .into_iter()
      .filter(|(_, v)| !v.is_null())
      .map(|(k, v)| {
        let v = match v {
          Value::String(s) => s,
          other => other.to_string(),
        };
        (k, v)
      })
      .collect(),
  )
}

/// Streamed request body that reports progress as each chunk is handed to the connection.
fn progress_body(data: Arc<Vec<u8>>, on_progress: Option<ProgressFn>) -> reqwest::Body {
  let total = data.len() as u64;
  let chunks: Vec<Vec<u8>> = data.chunks(UPLOAD_CHUNK_SIZE).map(<[u8]>::to_vec).collect();
  let mut loaded = 0u64;

  let stream = futures::stream::iter(chunks.into_iter().map(move |chunk| {
    loaded += chunk.len() as u64;
    if let Some(on_progress) = &on_progress {
      on_progress(UploadProgress::new(loaded, total));
    }
    Ok::<_, std::io::Error>(chunk)
  }));

  reqwest::Body::wrap_stream(stream)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::transport::ErrorKind;
  use axum::extract::State;
  use axum::http::{HeaderMap, StatusCode};
  use axum::routing::{get, post};
  use axum::{Json, Router};
  use serde_json::json;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  #[derive(Clone, Default)]
  struct Hits {
    protected: Arc<AtomicUsize>,
    seen_headers: Arc<Mutex<Vec<HeaderMap>>>,
  }

  async fn museum() -> Json<Value> {
    Json(json!({ "id": "abc123", "name": "Museum of Light" }))
  }

  async fn missing() -> (StatusCode, Json<Value>) {
    (
      StatusCode::NOT_FOUND,
      Json(json!({ "code": "MUSEUM_NOT_FOUND", "message": "Museum not found" })),
    )
  }

  async fn protected(State(hits): State<Hits>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
    hits.protected.fetch_add(1, Ordering::SeqCst);
    let authorized = headers
      .get("authorization")
      .and_then(|v| v.to_str().ok())
      == Some("Bearer fresh");
    if authorized {
      (StatusCode::OK, Json(json!({ "secret": 42 })))
    } else {
      (StatusCode::UNAUTHORIZED, Json(json!({ "message": "Token expired" })))
    }
  }

  async fn echo(State(hits): State<Hits>, headers: HeaderMap) -> Json<Value> {
    hits.seen_headers.lock().unwrap().push(headers);
    Json(Value::Null)
  }

  async fn slow() -> Json<Value> {
    tokio::time::sleep(Duration::from_secs(2)).await;
    Json(Value::Null)
  }

  async fn upload(body: axum::body::Bytes) -> Json<Value> {
    Json(json!({ "received": body.len() }))
  }

  async fn serve(hits: Hits) -> String {
    let app = Router::new()
      .route("/museums/abc123", get(museum))
      .route("/museums/missing", get(missing))
      .route("/protected", get(protected))
      .route("/echo", get(echo))
      .route("/slow", get(slow))
      .route("/upload", post(upload))
      .with_state(hits);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
  }

  fn client(base_url: &str) -> ApiClient {
    ApiClient::new(&ApiConfig {
      base_url: Some(base_url.to_string()),
      timeout_ms: 500,
      dev_logging: true,
    })
    .unwrap()
  }

  #[test]
  fn test_missing_base_url_refuses_to_construct() {
    assert!(ApiClient::new(&ApiConfig::default()).is_err());
    assert!(ApiClient::new(&ApiConfig {
      base_url: Some("not a url".to_string()),
      ..Default::default()
    })
    .is_err());
  }

  #[tokio::test]
  async fn test_get_returns_unwrapped_body() {
    let base = serve(Hits::default()).await;
    let api = client(&base);

    let museum: Value = api.get("/museums/abc123").await.unwrap();
    assert_eq!(museum["name"], "Museum of Light");
  }

  #[tokio::test]
  async fn test_error_response_is_normalized() {
    let base = serve(Hits::default()).await;
    let api = client(&base);

    let err = api.get::<Value>("museums/missing").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Client);
    assert_eq!(err.code, "MUSEUM_NOT_FOUND");
    assert_eq!(err.status_code, Some(404));
    assert_eq!(err.path, "museums/missing");
  }

  #[tokio::test]
  async fn test_requests_are_stamped_and_use_latest_token() {
    let hits = Hits::default();
    let base = serve(hits.clone()).await;
    let api = client(&base);

    let _: Value = api.get("/echo").await.unwrap();
    api.set_auth("token-1");
    let _: Value = api.get("/echo").await.unwrap();
    api.clear_auth();
    let _: Value = api.get("/echo").await.unwrap();

    let seen = hits.seen_headers.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|h| h.contains_key("x-request-id")));
    assert!(seen.iter().all(|h| h.contains_key("x-request-timestamp")));
    assert_ne!(seen[0]["x-request-id"], seen[1]["x-request-id"]);
    assert!(seen[0].get("authorization").is_none());
    assert_eq!(seen[1]["authorization"], "Bearer token-1");
    assert!(seen[2].get("authorization").is_none());
  }

  #[tokio::test]
  async fn test_recovery_retries_exactly_once() {
    let hits = Hits::default();
    let base = serve(hits.clone()).await;
    let api = client(&base);
    api.set_auth("stale");

    let recoveries = Arc::new(AtomicUsize::new(0));
    let refresher = api.clone();
    let counter = Arc::clone(&recoveries);
    api.set_error_handler(move |err: ApiError| {
      let refresher = refresher.clone();
      let counter = Arc::clone(&counter);
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
        if err.is_auth() {
          refresher.set_auth("fresh");
          Ok(())
        } else {
          Err(err)
        }
      }
    });

    let body: Value = api.get("/protected").await.unwrap();
    assert_eq!(body["secret"], 42);
    assert_eq!(hits.protected.load(Ordering::SeqCst), 2);
    assert_eq!(recoveries.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_recovery_that_does_not_help_still_retries_once() {
    let hits = Hits::default();
    let base = serve(hits.clone()).await;
    let api = client(&base);
    api.set_auth("stale");

    let recoveries = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&recoveries);
    api.set_error_handler(move |_err: ApiError| {
      let counter = Arc::clone(&counter);
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
      }
    });

    let err = api.get::<Value>("/protected").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Auth);
    assert_eq!(hits.protected.load(Ordering::SeqCst), 2);
    assert_eq!(recoveries.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_rejected_recovery_propagates_original_error() {
    let hits = Hits::default();
    let base = serve(hits.clone()).await;
    let api = client(&base);

    api.set_error_handler(|_err: ApiError| async move {
      Err::<(), _>(ApiError::invalid_request("/auth/refresh", "refresh token expired"))
    });

    let err = api.get::<Value>("/protected").await.unwrap_err();
    assert_eq!(err.message, "Token expired");
    assert_eq!(hits.protected.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_timeout_is_network_error() {
    let base = serve(Hits::default()).await;
    let api = client(&base);

    let err = api.get::<Value>("/slow").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Network);
    assert_eq!(err.code, "TIMEOUT");
    assert!(err.retry);
  }

  #[tokio::test]
  async fn test_unreachable_host_is_network_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let api = client(&format!("http://{}", addr));
    let err = api.get::<Value>("/anything").await.unwrap_err();
    assert!(err.is_network());
    assert!(!err.has_response());
  }

  #[tokio::test]
  async fn test_upload_reports_progress() {
    let base = serve(Hits::default()).await;
    let api = client(&base);

    let ticks = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&ticks);
    let on_progress: ProgressFn = Arc::new(move |p| sink.lock().unwrap().push(p));

    let data = vec![7u8; UPLOAD_CHUNK_SIZE * 2 + 10];
    let body: Value = api
      .upload("/upload", "tour.jpg", data.clone(), Some(on_progress))
      .await
      .unwrap();
    assert!(body["received"].as_u64().unwrap() > data.len() as u64);

    let ticks = ticks.lock().unwrap();
    assert_eq!(ticks.len(), 3);
    assert_eq!(ticks[0].loaded, UPLOAD_CHUNK_SIZE as u64);
    let last = ticks.last().unwrap();
    assert_eq!(last.loaded, data.len() as u64);
    assert_eq!(last.total, data.len() as u64);
    assert_eq!(last.percentage, 100);
  }

  #[test]
  fn test_params_flatten() {
    #[derive(Serialize)]
    struct Filter {
      city: &'static str,
      page: u32,
      category: Option<&'static str>,
    }

    let params = to_params(
      "/museums",
      &Filter {
        city: "Lyon",
        page: 2,
        category: None,
      },
    )
    .unwrap();

    assert_eq!(
      params,
      vec![
        ("city".to_string(), "Lyon".to_string()),
        ("page".to_string(), "2".to_string())
      ]
    );
  }
}
