use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use reqwest::Method;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::config::{self, ClientConfig};
use crate::error::Error;
use crate::store::{self, TokenStore};
use crate::types::SessionToken;

/// One outbound call, fully resolved: what will go over the wire.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<serde_json::Value>,
}

impl RequestDescriptor {
    /// Whether an `Authorization` header will be sent.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.headers.contains_key(AUTHORIZATION)
    }
}

/// A change to the cached token, waiting to be written to the store.
///
/// Generations increase with every change, so a write that lost a race
/// with a newer one is skipped instead of resurrecting an old token.
#[must_use]
#[derive(Debug)]
pub(crate) struct TokenChange {
    generation: u64,
    token: Option<SessionToken>,
}

struct TokenSlot {
    token: Option<SessionToken>,
    generation: u64,
}

/// JSON request client for the Washline API.
///
/// Holds the base URL and the cached bearer token. The token is written
/// only through [`set_token`](ApiClient::set_token), which also persists it.
pub struct ApiClient {
    config: ClientConfig,
    base_url: Url,
    http: reqwest::Client,
    store: Arc<dyn TokenStore>,
    token: RwLock<TokenSlot>,
    persisted: Mutex<u64>,
}

impl ApiClient {
    /// Create a client backed by the persistent store `config` points at.
    ///
    /// A token left by a previous process is loaded immediately.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let store = store::default_store(&config);
        Self::from_parts(config, store)
    }

    /// Create a client over an explicit token store.
    #[must_use]
    pub fn with_store(config: ClientConfig, store: impl TokenStore) -> Self {
        Self::from_parts(config, Arc::new(store))
    }

    fn from_parts(config: ClientConfig, store: Arc<dyn TokenStore>) -> Self {
        let token = match store.load() {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read persisted token");
                None
            }
        };

        Self {
            base_url: config.base_url.clone(),
            config,
            http: reqwest::Client::new(),
            store,
            token: RwLock::new(TokenSlot {
                token,
                generation: 0,
            }),
            persisted: Mutex::new(0),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Set the prefix of every subsequent call. `None` restores the
    /// configured default.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `base_url` is not an absolute http(s) URL.
    pub fn configure(&mut self, base_url: Option<&str>) -> Result<(), Error> {
        self.base_url = match base_url {
            Some(raw) => config::parse_base_url(raw).map_err(Error::Config)?,
            None => self.config.base_url.clone(),
        };
        tracing::debug!(base_url = %self.base_url, "API base URL configured");
        Ok(())
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Replace the bearer token and persist the change.
    ///
    /// Storage failures are logged and swallowed: the in-memory token stays
    /// authoritative for the life of the process.
    pub fn set_token(&self, token: Option<SessionToken>) {
        let change = self.cache_token(token);
        self.persist(change);
    }

    #[must_use]
    pub fn token(&self) -> Option<SessionToken> {
        self.token.read().token.clone()
    }

    /// Swap the in-memory token only. Pair with [`persist`](Self::persist)
    /// once no caller lock is held, since stores may touch the disk.
    pub(crate) fn cache_token(&self, token: Option<SessionToken>) -> TokenChange {
        let mut slot = self.token.write();
        slot.generation += 1;
        slot.token = token.clone();
        TokenChange {
            generation: slot.generation,
            token,
        }
    }

    pub(crate) fn persist(&self, change: TokenChange) {
        let mut last = self.persisted.lock();
        if change.generation <= *last {
            tracing::debug!(generation = change.generation, "Skipping outdated token write");
            return;
        }
        *last = change.generation;

        let persisted = match &change.token {
            Some(t) => self.store.save(t),
            None => self.store.clear(),
        };
        if let Err(e) = persisted {
            tracing::warn!(error = %e, "Failed to persist token change");
        }
    }

    /// Build the descriptor for a call without sending it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the endpoint does not form a valid URL or
    /// the token is not a valid header value, and [`Error::Decode`] if the
    /// body cannot be serialized.
    pub fn describe<B: Serialize + ?Sized>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&B>,
    ) -> Result<RequestDescriptor, Error> {
        let url = self.endpoint_url(endpoint)?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = self.token.read().token.as_ref() {
            let mut value = HeaderValue::from_str(&token.bearer())
                .map_err(|_| Error::Config("token is not a valid header value".into()))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let body = body
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| Error::Decode(format!("request body: {e}")))?;

        Ok(RequestDescriptor {
            method,
            url,
            headers,
            body,
        })
    }

    /// Send one JSON request and decode the 2xx response body as `T`.
    ///
    /// An empty success body decodes as JSON `null`, so `()` and `Option<_>`
    /// work for `204 No Content`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if no response arrives,
    /// [`Error::Request`] on a non-2xx status and [`Error::Decode`] if the
    /// body does not match `T`.
    pub async fn request<T, B>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&B>,
    ) -> Result<T, Error>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request_with_status(method, endpoint, body)
            .await
            .map(|(_, value)| value)
    }

    /// Like [`request`](Self::request), also returning the response status.
    pub(crate) async fn request_with_status<T, B>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&B>,
    ) -> Result<(u16, T), Error>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let descriptor = self.describe(method, endpoint, body)?;
        let (status, text) = self.execute(descriptor).await?;

        let text = if text.trim().is_empty() { "null" } else { text.as_str() };
        let value = serde_json::from_str(text).map_err(|e| {
            tracing::error!(error = %e, status, "Failed to decode response body");
            Error::Decode(e.to_string())
        })?;
        Ok((status, value))
    }

    /// Send an already described request whose response body is irrelevant.
    ///
    /// Headers were fixed by [`describe`](Self::describe), so the call goes
    /// out with the token current at that time even if it has since changed.
    pub(crate) async fn send_discarding_body(
        &self,
        descriptor: RequestDescriptor,
    ) -> Result<u16, Error> {
        self.execute(descriptor).await.map(|(status, _)| status)
    }

    pub async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, Error> {
        self.request::<T, ()>(Method::GET, endpoint, None).await
    }

    pub async fn post<T, B>(&self, endpoint: &str, body: Option<&B>) -> Result<T, Error>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request(Method::POST, endpoint, body).await
    }

    pub async fn put<T, B>(&self, endpoint: &str, body: Option<&B>) -> Result<T, Error>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request(Method::PUT, endpoint, body).await
    }

    pub async fn patch<T, B>(&self, endpoint: &str, body: Option<&B>) -> Result<T, Error>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request(Method::PATCH, endpoint, body).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, Error> {
        self.request::<T, ()>(Method::DELETE, endpoint, None).await
    }

    pub(crate) fn endpoint_url(&self, endpoint: &str) -> Result<Url, Error> {
        let endpoint = endpoint.trim_start_matches('/');
        if endpoint.is_empty() {
            return Ok(self.base_url.clone());
        }
        let base = self.base_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}/{endpoint}"))
            .map_err(|e| Error::Config(format!("invalid endpoint `{endpoint}`: {e}")))
    }

    async fn execute(&self, descriptor: RequestDescriptor) -> Result<(u16, String), Error> {
        let RequestDescriptor {
            method,
            url,
            headers,
            body,
        } = descriptor;

        let mut builder = self.http.request(method.clone(), url.clone()).headers(headers);
        if let Some(body) = &body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            tracing::error!(error = %e, %method, %url, "Request failed to reach server");
            Error::Transport(e)
        })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            tracing::error!(error = %e, %method, %url, "Failed to read response body");
            Error::Transport(e)
        })?;

        if status.is_success() {
            return Ok((status.as_u16(), text));
        }

        let message = error_message(status.as_u16(), &text);
        tracing::error!(status = status.as_u16(), %method, %url, message = %message, "Request rejected");
        Err(Error::Request {
            status: status.as_u16(),
            message,
        })
    }
}

/// Human-readable reason for a non-2xx response: the JSON `message` or
/// `error` field, else the raw body, else a generic status line.
pub(crate) fn error_message(status: u16, body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        let field = ["message", "error"]
            .iter()
            .find_map(|k| json.get(k).and_then(|v| v.as_str()))
            .filter(|m| !m.is_empty());
        if let Some(message) = field {
            return message.to_owned();
        }
    }

    let raw = body.trim();
    if raw.is_empty() {
        format!("HTTP error! status: {status}")
    } else {
        raw.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::error::StoreError;
    use crate::store::MemoryTokenStore;

    fn client_for(server: &MockServer, store: MemoryTokenStore) -> ApiClient {
        let base = format!("{}/api", server.uri()).parse().unwrap();
        ApiClient::with_store(ClientConfig::new(base), store)
    }

    struct BrokenStore;

    impl TokenStore for BrokenStore {
        fn load(&self) -> Result<Option<SessionToken>, StoreError> {
            Err(std::io::Error::other("storage disabled").into())
        }

        fn save(&self, _: &SessionToken) -> Result<(), StoreError> {
            Err(std::io::Error::other("quota exceeded").into())
        }

        fn clear(&self) -> Result<(), StoreError> {
            Err(std::io::Error::other("storage disabled").into())
        }
    }

    #[test]
    fn error_message_fallback_chain() {
        assert_eq!(error_message(404, r#"{"error":"not found"}"#), "not found");
        assert_eq!(
            error_message(422, r#"{"message":"Email taken","error":"Unprocessable"}"#),
            "Email taken"
        );
        assert_eq!(error_message(400, r#"{"detail":"x"}"#), r#"{"detail":"x"}"#);
        assert_eq!(error_message(502, "Bad gateway\n"), "Bad gateway");
        assert_eq!(error_message(500, ""), "HTTP error! status: 500");
        assert_eq!(error_message(503, "   "), "HTTP error! status: 503");
    }

    #[test]
    fn describe_joins_base_and_endpoint() {
        let client = ApiClient::with_store(ClientConfig::default(), MemoryTokenStore::new());
        let d = client.describe::<()>(Method::GET, "/services", None).unwrap();
        assert_eq!(d.url.as_str(), "http://localhost:5000/api/services");
        let d = client.describe::<()>(Method::GET, "bookings?page=2", None).unwrap();
        assert_eq!(d.url.as_str(), "http://localhost:5000/api/bookings?page=2");
        assert_eq!(d.headers[CONTENT_TYPE], "application/json");
    }

    #[test]
    fn authorization_header_tracks_token() {
        let client = ApiClient::with_store(ClientConfig::default(), MemoryTokenStore::new());
        let d = client.describe::<()>(Method::GET, "/me", None).unwrap();
        assert!(!d.is_authenticated());

        client.set_token(Some("abc".into()));
        let d = client.describe::<()>(Method::GET, "/me", None).unwrap();
        assert_eq!(d.headers[AUTHORIZATION], "Bearer abc");

        client.set_token(None);
        let d = client.describe::<()>(Method::GET, "/me", None).unwrap();
        assert!(!d.is_authenticated());
    }

    #[test]
    fn token_survives_restart() {
        let store = MemoryTokenStore::new();
        let first = ApiClient::with_store(ClientConfig::default(), store.clone());
        first.set_token(Some("abc".into()));

        let restarted = ApiClient::with_store(ClientConfig::default(), store.clone());
        let d = restarted.describe::<()>(Method::GET, "/me", None).unwrap();
        assert_eq!(d.headers[AUTHORIZATION], "Bearer abc");

        restarted.set_token(None);
        let again = ApiClient::with_store(ClientConfig::default(), store);
        assert!(again.token().is_none());
    }

    #[test]
    fn storage_failures_are_swallowed() {
        let client = ApiClient::with_store(ClientConfig::default(), BrokenStore);
        assert!(client.token().is_none());

        client.set_token(Some("in-memory".into()));
        assert_eq!(client.token(), Some(SessionToken::new("in-memory")));

        client.set_token(None);
        assert!(client.token().is_none());
    }

    #[test]
    fn outdated_token_write_is_skipped() {
        let store = MemoryTokenStore::new();
        let client = ApiClient::with_store(ClientConfig::default(), store.clone());

        let older = client.cache_token(Some("first".into()));
        let newer = client.cache_token(Some("second".into()));
        client.persist(newer);
        client.persist(older);

        assert_eq!(store.load().unwrap(), Some(SessionToken::new("second")));
        assert_eq!(client.token(), Some(SessionToken::new("second")));
    }

    #[test]
    fn configure_validates_and_resets() {
        let mut client = ApiClient::with_store(ClientConfig::default(), MemoryTokenStore::new());
        client.configure(Some("https://api.washline.app/v2/")).unwrap();
        let d = client.describe::<()>(Method::GET, "/services", None).unwrap();
        assert_eq!(d.url.as_str(), "https://api.washline.app/v2/services");

        assert!(matches!(client.configure(Some("not a url")), Err(Error::Config(_))));
        assert_eq!(client.base_url().as_str(), "https://api.washline.app/v2/");

        client.configure(None).unwrap();
        assert_eq!(client.base_url().as_str(), config::DEFAULT_BASE_URL);
    }

    #[tokio::test]
    async fn get_sends_bearer_and_decodes_json() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/services"))
            .and(header("authorization", "Bearer abc"))
            .and(header("content-type", "application/json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!([{ "id": "s1", "name": "Full wash" }])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, MemoryTokenStore::with_token("abc"));
        let services: Vec<serde_json::Value> = client.get("/services").await.unwrap();
        assert_eq!(services[0]["name"], "Full wash");
    }

    #[tokio::test]
    async fn cleared_token_sends_no_authorization() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/services"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let client = client_for(&server, MemoryTokenStore::new());
        client.set_token(Some("abc".into()));
        client.set_token(None);
        let _: Vec<serde_json::Value> = client.get("/services").await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn post_put_patch_send_json_bodies() {
        let server = MockServer::start().await;
        let payload = serde_json::json!({ "service_id": "s1", "slot": "09:00" });
        for verb in ["POST", "PUT", "PATCH"] {
            Mock::given(method(verb))
                .and(path("/api/bookings"))
                .and(body_json(&payload))
                .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({ "ok": verb })))
                .expect(1)
                .mount(&server)
                .await;
        }

        let client = client_for(&server, MemoryTokenStore::new());
        let r: serde_json::Value = client.post("/bookings", Some(&payload)).await.unwrap();
        assert_eq!(r["ok"], "POST");
        let r: serde_json::Value = client.put("/bookings", Some(&payload)).await.unwrap();
        assert_eq!(r["ok"], "PUT");
        let r: serde_json::Value = client.patch("/bookings", Some(&payload)).await.unwrap();
        assert_eq!(r["ok"], "PATCH");
    }

    #[tokio::test]
    async fn delete_with_empty_body_decodes_unit() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/bookings/b1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = client_for(&server, MemoryTokenStore::new());
        client.delete::<()>("/bookings/b1").await.unwrap();
    }

    #[tokio::test]
    async fn not_found_uses_error_field() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({ "error": "not found" })))
            .mount(&server)
            .await;

        let client = client_for(&server, MemoryTokenStore::new());
        let err = client.get::<serde_json::Value>("/missing").await.unwrap_err();
        assert!(matches!(&err, Error::Request { status: 404, message } if message == "not found"));
    }

    #[tokio::test]
    async fn empty_server_error_uses_generic_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = client_for(&server, MemoryTokenStore::new());
        let err = client.get::<serde_json::Value>("/boom").await.unwrap_err();
        assert_eq!(err.to_string(), "HTTP error! status: 500");
        assert_eq!(err.status(), Some(500));
    }

    #[tokio::test]
    async fn malformed_success_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let client = client_for(&server, MemoryTokenStore::new());
        let err = client.get::<serde_json::Value>("/page").await.unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
    }

    #[tokio::test]
    async fn unreachable_server_is_transport_error() {
        let config = ClientConfig::new("http://127.0.0.1:1/api".parse().unwrap());
        let client = ApiClient::with_store(config, MemoryTokenStore::new());
        let err = client.get::<serde_json::Value>("/services").await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
