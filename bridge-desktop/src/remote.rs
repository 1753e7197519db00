//! HTTP Remote Store Implementation using Reqwest
//!
//! Wire contract, relative to the configured endpoint:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | upsert | `PUT {endpoint}/{family}/{id}` with `{"payload": .., "updated_at": ms}` |
//! | delete | `DELETE {endpoint}/{family}/{id}?updated_at=ms` |
//! | changes | `GET {endpoint}/{family}?since=ms` returning `{"records": [..]}` |
//!
//! Writes answer `{"remote_updated_at": ms}`. Every write carries an
//! `Idempotency-Key` derived from family, id, operation and `updated_at`, so a
//! write replayed after a lost acknowledgment is recognised by the server.

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    remote::{RemoteAck, RemoteRecord, RemoteStore},
};
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{debug, warn};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Serialize)]
struct UpsertBody<'a> {
    payload: &'a Value,
    updated_at: i64,
}

#[derive(Debug, Deserialize)]
struct AckBody {
    remote_updated_at: i64,
}

#[derive(Debug, Deserialize)]
struct ChangesBody {
    #[serde(default)]
    records: Vec<WireRecord>,
}

#[derive(Debug, Deserialize)]
struct WireRecord {
    id: String,
    #[serde(default)]
    payload: Option<Value>,
    updated_at: i64,
    remote_updated_at: i64,
}

impl WireRecord {
    fn into_remote(self) -> Result<RemoteRecord> {
        Ok(RemoteRecord {
            id: self.id,
            payload: self.payload.filter(|p| !p.is_null()),
            updated_at: millis_to_datetime(self.updated_at)?,
            remote_updated_at: millis_to_datetime(self.remote_updated_at)?,
        })
    }
}

/// Reqwest-based remote store client.
///
/// Retries are not attempted here: a failed call is reported to the outbox,
/// which owns retry and backoff.
pub struct HttpRemoteStore {
    client: Client,
    endpoint: Url,
    timeout: Duration,
}

impl HttpRemoteStore {
    /// Create a client for `endpoint` with a per-request timeout.
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .pool_max_idle_per_host(4)
            .user_agent(concat!("farmsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BridgeError::OperationFailed(format!("Failed to build HTTP client: {}", e)))?;

        Self::with_client(client, endpoint, timeout)
    }

    /// Create a client around a preconfigured reqwest [`Client`].
    pub fn with_client(client: Client, endpoint: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| BridgeError::OperationFailed(format!("Invalid remote endpoint {}: {}", endpoint, e)))?;

        if endpoint.cannot_be_a_base() || !matches!(endpoint.scheme(), "http" | "https") {
            return Err(BridgeError::OperationFailed(format!(
                "Remote endpoint must be an http(s) URL: {}",
                endpoint
            )));
        }

        Ok(Self {
            client,
            endpoint,
            timeout,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// `{endpoint}/{segments..}` with each segment percent-encoded.
    fn url_for(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| BridgeError::OperationFailed(format!("Invalid remote endpoint: {}", self.endpoint)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request.send().await.map_err(|e| self.map_transport_error(e))?;
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(map_status(status, &body))
    }

    async fn write(
        &self,
        method: Method,
        family: &str,
        id: &str,
        payload: Option<&Value>,
        updated_at: DateTime<Utc>,
    ) -> Result<RemoteAck> {
        let mut url = self.url_for(&[family, id])?;
        let updated_ms = updated_at.timestamp_millis();
        let key = idempotency_key(method.as_str(), family, id, updated_ms);
        if payload.is_none() {
            url.query_pairs_mut()
                .append_pair("updated_at", &updated_ms.to_string());
        }

        debug!(method = %method, family, id, url = %url, "Remote write");

        let mut request = self
            .client
            .request(method.clone(), url)
            .header(IDEMPOTENCY_HEADER, key);

        if let Some(payload) = payload {
            request = request.json(&UpsertBody {
                payload,
                updated_at: updated_ms,
            });
        }

        match self.send(request).await {
            Ok(response) => {
                let ack: AckBody = response
                    .json()
                    .await
                    .map_err(|e| BridgeError::OperationFailed(format!("Malformed acknowledgment: {}", e)))?;
                Ok(RemoteAck {
                    remote_updated_at: millis_to_datetime(ack.remote_updated_at)?,
                })
            }
            // Deleting a record the server never saw has the desired end state
            Err(BridgeError::Rejected(message)) if method == Method::DELETE && message.starts_with("HTTP 404") => {
                debug!(family, id, "Delete of unknown remote record treated as acknowledged");
                Ok(RemoteAck {
                    remote_updated_at: updated_at,
                })
            }
            Err(e) => Err(e),
        }
    }

    fn map_transport_error(&self, error: reqwest::Error) -> BridgeError {
        if error.is_timeout() {
            BridgeError::Timeout(u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX))
        } else if error.is_connect() {
            BridgeError::Network(format!("Connection failed: {}", error))
        } else {
            warn!(error = %error, "Remote store request failed");
            BridgeError::Network(error.to_string())
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn upsert(
        &self,
        family: &str,
        id: &str,
        payload: &Value,
        updated_at: DateTime<Utc>,
    ) -> Result<RemoteAck> {
        self.write(Method::PUT, family, id, Some(payload), updated_at)
            .await
    }

    async fn delete(&self, family: &str, id: &str, updated_at: DateTime<Utc>) -> Result<RemoteAck> {
        self.write(Method::DELETE, family, id, None, updated_at).await
    }

    async fn query_changed_since(
        &self,
        family: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteRecord>> {
        let mut url = self.url_for(&[family])?;
        if let Some(since) = since {
            url.query_pairs_mut()
                .append_pair("since", &since.timestamp_millis().to_string());
        }

        debug!(family, url = %url, "Querying remote changes");

        let response = self.send(self.client.get(url)).await?;
        let body: ChangesBody = response
            .json()
            .await
            .map_err(|e| BridgeError::OperationFailed(format!("Malformed change list: {}", e)))?;

        body.records.into_iter().map(WireRecord::into_remote).collect()
    }
}

/// Classify a non-success HTTP status.
///
/// Request timeouts, throttling and server errors are worth retrying; any
/// other client error means the server refused the request as sent.
fn map_status(status: StatusCode, body: &str) -> BridgeError {
    let message = if body.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {}", status.as_u16(), body.trim())
    };

    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        BridgeError::OperationFailed(message)
    } else {
        BridgeError::Rejected(message)
    }
}

/// Hex SHA-256 of the write's identity.
fn idempotency_key(method: &str, family: &str, id: &str, updated_at_ms: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\n");
    hasher.update(family.as_bytes());
    hasher.update(b"\n");
    hasher.update(id.as_bytes());
    hasher.update(b"\n");
    hasher.update(updated_at_ms.to_string().as_bytes());

    hasher.finalize().iter().fold(String::with_capacity(64), |mut out, byte| {
        let _ = write!(out, "{:02x}", byte);
        out
    })
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| BridgeError::OperationFailed(format!("Timestamp out of range: {}", millis)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Accept one connection, capture the request head and answer with a
    /// canned response.
    async fn one_shot_server(status: u16, body: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 16 * 1024];
            let n = socket.read(&mut buf).await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&buf[..n]).to_string());

            let response = format!(
                "HTTP/1.1 {} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });

        (format!("http://{}/v1", addr), rx)
    }

    #[test]
    fn test_rejects_non_http_endpoint() {
        assert!(HttpRemoteStore::new("ftp://example.com", Duration::from_secs(5)).is_err());
        assert!(HttpRemoteStore::new("not a url", Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_url_segments_are_encoded() {
        let store = HttpRemoteStore::new("https://sync.example.com/v1/", Duration::from_secs(5)).unwrap();
        let url = store.url_for(&["task", "a b/c"]).unwrap();
        assert_eq!(url.as_str(), "https://sync.example.com/v1/task/a%20b%2Fc");
    }

    #[test]
    fn test_status_classification() {
        assert!(map_status(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(map_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(map_status(StatusCode::REQUEST_TIMEOUT, "").is_transient());

        let rejected = map_status(StatusCode::UNPROCESSABLE_ENTITY, "title required");
        assert!(!rejected.is_transient());
        assert!(rejected.to_string().contains("HTTP 422: title required"));
    }

    #[test]
    fn test_idempotency_key_is_stable_per_write() {
        let a = idempotency_key("PUT", "task", "t-1", 1_000);
        assert_eq!(a, idempotency_key("PUT", "task", "t-1", 1_000));
        assert_eq!(a.len(), 64);
        assert_ne!(a, idempotency_key("PUT", "task", "t-1", 1_001));
        assert_ne!(a, idempotency_key("DELETE", "task", "t-1", 1_000));
    }

    #[test]
    fn test_wire_record_null_payload_is_tombstone() {
        let body: ChangesBody = serde_json::from_value(json!({
            "records": [
                { "id": "t-1", "payload": { "title": "x" }, "updated_at": 10, "remote_updated_at": 20 },
                { "id": "t-2", "payload": null, "updated_at": 11, "remote_updated_at": 21 },
                { "id": "t-3", "updated_at": 12, "remote_updated_at": 22 }
            ]
        }))
        .unwrap();

        let records: Vec<RemoteRecord> = body
            .records
            .into_iter()
            .map(WireRecord::into_remote)
            .collect::<Result<_>>()
            .unwrap();

        assert!(!records[0].is_tombstone());
        assert!(records[1].is_tombstone());
        assert!(records[2].is_tombstone());
        assert_eq!(records[0].remote_updated_at.timestamp_millis(), 20);
    }

    #[tokio::test]
    async fn test_upsert_sends_idempotency_key_and_parses_ack() {
        let (endpoint, request) = one_shot_server(200, r#"{"remote_updated_at": 5000}"#).await;
        let store = HttpRemoteStore::new(&endpoint, Duration::from_secs(5)).unwrap();
        let updated_at = DateTime::<Utc>::from_timestamp_millis(4_000).unwrap();

        let ack = store
            .upsert("task", "t-1", &json!({ "title": "Fence" }), updated_at)
            .await
            .unwrap();
        assert_eq!(ack.remote_updated_at.timestamp_millis(), 5_000);

        let head = request.await.unwrap().to_lowercase();
        assert!(head.starts_with("put /v1/task/t-1 "));
        let key = idempotency_key("PUT", "task", "t-1", 4_000);
        assert!(head.contains(&format!("idempotency-key: {}", key)));
    }

    #[tokio::test]
    async fn test_client_error_is_rejection() {
        let (endpoint, _request) = one_shot_server(422, r#"{"error":"invalid"}"#).await;
        let store = HttpRemoteStore::new(&endpoint, Duration::from_secs(5)).unwrap();

        let err = store
            .upsert("task", "t-1", &json!({}), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_missing_record_delete_is_acknowledged() {
        let (endpoint, request) = one_shot_server(404, "").await;
        let store = HttpRemoteStore::new(&endpoint, Duration::from_secs(5)).unwrap();
        let updated_at = DateTime::<Utc>::from_timestamp_millis(7_000).unwrap();

        let ack = store.delete("task", "gone", updated_at).await.unwrap();
        assert_eq!(ack.remote_updated_at, updated_at);

        let head = request.await.unwrap().to_lowercase();
        assert!(head.starts_with("delete /v1/task/gone?updated_at=7000 "));
    }

    #[tokio::test]
    async fn test_change_query_uses_cursor() {
        let (endpoint, request) = one_shot_server(
            200,
            r#"{"records":[{"id":"t-1","payload":{"title":"a"},"updated_at":1,"remote_updated_at":2}]}"#,
        )
        .await;
        let store = HttpRemoteStore::new(&endpoint, Duration::from_secs(5)).unwrap();
        let since = DateTime::<Utc>::from_timestamp_millis(1_500).unwrap();

        let records = store.query_changed_since("task", Some(since)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "t-1");

        let head = request.await.unwrap().to_lowercase();
        assert!(head.starts_with("get /v1/task?since=1500 "));
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let (endpoint, _request) = one_shot_server(503, "").await;
        let store = HttpRemoteStore::new(&endpoint, Duration::from_secs(5)).unwrap();

        let err = store.query_changed_since("task", None).await.unwrap_err();
        assert!(err.is_transient());
    }
}
