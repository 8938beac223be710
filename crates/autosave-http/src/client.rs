use async_trait::async_trait;
use autosave_core::{Record, RemoteStore, SaveFailure, SaveReceipt, SaveRequest};
use reqwest::header::{HeaderMap, ETAG, IF_MATCH};
use reqwest::{Client as HttpClient, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

/// Optional JSON body of a successful save.
#[derive(Debug, Deserialize)]
struct SaveResponse {
    version: Option<String>,
}

/// Remote store speaking plain HTTP with entity-tag versioning.
pub struct HttpRemoteStore {
    http_client: HttpClient,
    base_url: String,
    api_token: Option<String>,
}

impl HttpRemoteStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(HttpClient::new(), base_url)
    }

    /// Use a preconfigured client (timeouts, proxies, TLS).
    pub fn with_client(http_client: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token: None,
        }
    }

    /// Send `Authorization: Bearer {token}` with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    fn record_url(&self, key: &str) -> String {
        format!("{}/records/{}", self.base_url, urlencoding::encode(key))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Fetch the stored record and its version. `None` if the key is unknown.
    #[instrument(skip(self), level = "debug")]
    pub async fn fetch(&self, key: &str) -> Result<Option<(Record, Option<String>)>, SaveFailure> {
        let response = self
            .authorized(self.http_client.get(self.record_url(key)))
            .send()
            .await
            .map_err(|e| SaveFailure::Transient(format!("GET request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("Remote record not found: {}", key);
            return Ok(None);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify(status, format!("GET failed with status {}: {}", status, text)));
        }

        let version = version_from_headers(response.headers());
        let record = response
            .json::<Record>()
            .await
            .map_err(|e| SaveFailure::Transient(format!("Failed to read record: {}", e)))?;

        debug!("GET {} (version {:?})", key, version);
        Ok(Some((record, version)))
    }

    /// Build the conflict answer from a 409/412 response body, or from a fresh
    /// GET when the body does not carry the record.
    async fn conflict_from(&self, key: &str, headers: &HeaderMap, body: &str) -> SaveFailure {
        if let Ok(remote) = serde_json::from_str::<Record>(body) {
            return SaveFailure::Conflict {
                remote,
                remote_version: version_from_headers(headers),
            };
        }

        match self.fetch(key).await {
            Ok(Some((remote, remote_version))) => SaveFailure::Conflict {
                remote,
                remote_version,
            },
            Ok(None) => SaveFailure::Conflict {
                remote: Record::Null,
                remote_version: None,
            },
            // Try again later rather than report a conflict without a remote copy
            Err(e) => e,
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    #[instrument(skip(self, request), level = "debug", fields(key = %request.key))]
    async fn save(&self, request: SaveRequest) -> Result<SaveReceipt, SaveFailure> {
        let mut builder = self
            .authorized(self.http_client.put(self.record_url(&request.key)))
            .json(&request.data);
        if let Some(version) = &request.expected_version {
            builder = builder.header(IF_MATCH, quote_etag(version));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| SaveFailure::Transient(format!("PUT request failed: {}", e)))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();

        if status.is_success() {
            let version = version_from_headers(&headers).or_else(|| {
                serde_json::from_str::<SaveResponse>(&body)
                    .ok()
                    .and_then(|r| r.version)
            });
            debug!("PUT {} -> {} (version {:?})", request.key, status, version);
            return Ok(SaveReceipt::new(version));
        }

        if status == StatusCode::CONFLICT || status == StatusCode::PRECONDITION_FAILED {
            warn!("PUT {} rejected as stale ({})", request.key, status);
            return Err(self.conflict_from(&request.key, &headers, &body).await);
        }

        Err(classify(
            status,
            format!("PUT failed with status {}: {}", status, body),
        ))
    }
}

/// Map a non-success, non-conflict status to a failure class.
fn classify(status: StatusCode, message: String) -> SaveFailure {
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            SaveFailure::Transient(message)
        }
        s if s.is_server_error() => SaveFailure::Transient(message),
        s if s.is_client_error() => SaveFailure::Validation(message),
        _ => SaveFailure::Transient(message),
    }
}

fn version_from_headers(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(ETAG)?.to_str().ok()?;
    let tag = raw.trim().trim_start_matches("W/").trim_matches('"');
    (!tag.is_empty()).then(|| tag.to_string())
}

fn quote_etag(version: &str) -> String {
    if version.starts_with('"') || version.starts_with("W/") {
        version.to_string()
    } else {
        format!("\"{}\"", version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_classify_statuses() {
        let msg = || "boom".to_string();
        assert!(matches!(
            classify(StatusCode::SERVICE_UNAVAILABLE, msg()),
            SaveFailure::Transient(_)
        ));
        assert!(matches!(
            classify(StatusCode::TOO_MANY_REQUESTS, msg()),
            SaveFailure::Transient(_)
        ));
        assert!(matches!(
            classify(StatusCode::REQUEST_TIMEOUT, msg()),
            SaveFailure::Transient(_)
        ));
        assert!(matches!(
            classify(StatusCode::UNPROCESSABLE_ENTITY, msg()),
            SaveFailure::Validation(_)
        ));
        assert!(matches!(
            classify(StatusCode::NOT_FOUND, msg()),
            SaveFailure::Validation(_)
        ));
    }

    #[test]
    fn test_etag_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(version_from_headers(&headers), None);

        headers.insert(ETAG, HeaderValue::from_static("\"abc\""));
        assert_eq!(version_from_headers(&headers).as_deref(), Some("abc"));

        headers.insert(ETAG, HeaderValue::from_static("W/\"weak-1\""));
        assert_eq!(version_from_headers(&headers).as_deref(), Some("weak-1"));
    }

    #[test]
    fn test_quote_etag() {
        assert_eq!(quote_etag("v1"), "\"v1\"");
        assert_eq!(quote_etag("\"v1\""), "\"v1\"");
        assert_eq!(quote_etag("W/\"v1\""), "W/\"v1\"");
    }

    #[test]
    fn test_record_url_encodes_key() {
        let store = HttpRemoteStore::new("http://localhost:8080/");
        assert_eq!(
            store.record_url("notes/a b"),
            "http://localhost:8080/records/notes%2Fa%20b"
        );
    }
}
