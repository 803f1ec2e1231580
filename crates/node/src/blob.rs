//! # Blob Client — Content-Addressed Document Store
//!
//! Job documents come down from a CID, result documents go up and return
//! one. Downloads are memoized per CID: content-addressed entries are
//! immutable, so cache entries never expire.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use nosana_common::{cid, NodeError, Result};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::debug;

/// Gateway to the pinning service. One call, one attempt.
#[async_trait]
pub trait BlobGateway: Send + Sync {
    /// Pin a JSON document; returns its CID.
    async fn put_json(&self, value: &Value) -> Result<String>;

    /// Fetch a JSON document by CID.
    async fn get_json(&self, cid: &str) -> Result<Value>;
}

// ─── HTTP gateway ────────────────────────────────────────────────────────────

/// Pinning-service gateway over HTTP.
///
/// `put_json` POSTs the document to the pin endpoint with a bearer
/// credential and reads the CID from the response; `get_json` fetches
/// `<gateway>/<cid>` from the public gateway.
pub struct HttpBlobGateway {
    http: reqwest::Client,
    pin_url: String,
    gateway_url: String,
    credential: Option<String>,
}

impl HttpBlobGateway {
    pub fn new(
        pin_url: impl Into<String>,
        gateway_url: impl Into<String>,
        credential: Option<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            pin_url: pin_url.into(),
            gateway_url: gateway_url.into(),
            credential,
        }
    }
}

#[async_trait]
impl BlobGateway for HttpBlobGateway {
    async fn put_json(&self, value: &Value) -> Result<String> {
        let Some(credential) = &self.credential else {
            return Err(NodeError::BlobAuth);
        };
        let resp = self
            .http
            .post(&self.pin_url)
            .bearer_auth(credential)
            .json(value)
            .send()
            .await
            .map_err(|e| NodeError::BlobTransient(format!("pin request: {e}")))?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(NodeError::BlobAuth);
        }
        if !status.is_success() {
            return Err(NodeError::BlobTransient(format!("pin request returned {status}")));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| NodeError::Decode(format!("pin response: {e}")))?;
        body.get("IpfsHash")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| NodeError::Decode("pin response carries no IpfsHash".into()))
    }

    async fn get_json(&self, cid: &str) -> Result<Value> {
        let url = format!("{}/{cid}", self.gateway_url.trim_end_matches('/'));
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| NodeError::BlobTransient(format!("gateway request: {e}")))?;
        if !resp.status().is_success() {
            return Err(NodeError::BlobTransient(format!(
                "gateway returned {} for {cid}",
                resp.status()
            )));
        }
        resp.json().await.map_err(|e| NodeError::Decode(format!("document {cid}: {e}")))
    }
}

// ─── Mock gateway ────────────────────────────────────────────────────────────

/// In-memory gateway computing real CIDs, for tests and `mock` mode.
pub struct MockBlobGateway {
    objects: Mutex<HashMap<String, Value>>,
    authorized: Mutex<bool>,
}

impl MockBlobGateway {
    pub fn new() -> Self {
        Self { objects: Mutex::new(HashMap::new()), authorized: Mutex::new(true) }
    }

    /// Simulate a missing/revoked credential.
    pub fn set_authorized(&self, authorized: bool) {
        *self.authorized.lock() = authorized;
    }

    /// Seed a document and return its CID (test setup path, no auth check).
    pub fn seed(&self, value: &Value) -> String {
        let digest = cid::sha256_digest(value.to_string().as_bytes());
        let cid = cid::digest_to_cid(&digest);
        self.objects.lock().insert(cid.clone(), value.clone());
        cid
    }

    pub fn contains(&self, cid: &str) -> bool {
        self.objects.lock().contains_key(cid)
    }
}

impl Default for MockBlobGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobGateway for MockBlobGateway {
    async fn put_json(&self, value: &Value) -> Result<String> {
        if !*self.authorized.lock() {
            return Err(NodeError::BlobAuth);
        }
        Ok(self.seed(value))
    }

    async fn get_json(&self, cid: &str) -> Result<Value> {
        self.objects
            .lock()
            .get(cid)
            .cloned()
            .ok_or_else(|| NodeError::BlobTransient(format!("document not found: {cid}")))
    }
}

// ─── Memoizing client ────────────────────────────────────────────────────────

/// Blob client with an immortal per-CID download cache.
#[derive(Clone)]
pub struct BlobClient {
    gateway: Arc<dyn BlobGateway>,
    cache: Arc<RwLock<HashMap<String, Value>>>,
}

impl BlobClient {
    pub fn new(gateway: Arc<dyn BlobGateway>) -> Self {
        Self { gateway, cache: Arc::new(RwLock::new(HashMap::new())) }
    }

    pub async fn put_json(&self, value: &Value) -> Result<String> {
        let cid = self.gateway.put_json(value).await?;
        // what we uploaded is what the CID resolves to
        self.cache.write().insert(cid.clone(), value.clone());
        Ok(cid)
    }

    pub async fn get_json(&self, cid: &str) -> Result<Value> {
        if let Some(hit) = self.cache.read().get(cid) {
            return Ok(hit.clone());
        }
        debug!(cid = %cid, "fetching document");
        let value = self.gateway.get_json(cid).await?;
        self.cache.write().insert(cid.to_string(), value.clone());
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_then_get_roundtrip() {
        let gateway = Arc::new(MockBlobGateway::new());
        let client = BlobClient::new(gateway.clone());

        let doc = json!({"nos-id": "abc", "results": {}});
        let cid = client.put_json(&doc).await.expect("put");
        assert!(gateway.contains(&cid));

        let back = client.get_json(&cid).await.expect("get");
        assert_eq!(back, doc);
    }

    #[tokio::test]
    async fn get_is_memoized() {
        let gateway = Arc::new(MockBlobGateway::new());
        let cid = gateway.seed(&json!({"k": 1}));
        let client = BlobClient::new(gateway.clone());

        let first = client.get_json(&cid).await.expect("get");
        // even if the gateway loses the object, the cache answers
        gateway.objects.lock().clear();
        let second = client.get_json(&cid).await.expect("cached get");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn missing_credential_is_auth_error() {
        let gateway = Arc::new(MockBlobGateway::new());
        gateway.set_authorized(false);
        let client = BlobClient::new(gateway);

        let err = client.put_json(&json!({})).await.expect_err("auth");
        assert!(matches!(err, NodeError::BlobAuth));
    }

    #[tokio::test]
    async fn missing_document_is_transient() {
        let client = BlobClient::new(Arc::new(MockBlobGateway::new()));
        let err = client.get_json("QmMissing").await.expect_err("missing");
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn cid_matches_content() {
        let gateway = MockBlobGateway::new();
        let doc = json!({"a": 1});
        let cid = gateway.seed(&doc);
        let digest = cid::sha256_digest(doc.to_string().as_bytes());
        assert_eq!(cid, cid::digest_to_cid(&digest));
    }
}
