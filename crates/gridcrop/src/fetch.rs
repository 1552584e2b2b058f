//! Byte fetching for locator-based images.
//!
//! `http://` and `https://` locators go through reqwest. `file://` locators and
//! bare paths are read from disk.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request to {locator} failed: {source}")]
    Http {
        locator: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{locator} returned status {status}")]
    Status { locator: String, status: u16 },
    #[error("failed to read {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Resolves an image locator to raw bytes.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, FetchError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to build HTTP client, using defaults");
                reqwest::Client::new()
            });
        Self { client }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, FetchError> {
        if locator.starts_with("http://") || locator.starts_with("https://") {
            tracing::debug!(%locator, "Fetching image over HTTP");
            let http_err = |source| FetchError::Http {
                locator: locator.to_string(),
                source,
            };
            let response = self.client.get(locator).send().await.map_err(http_err)?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status {
                    locator: locator.to_string(),
                    status: status.as_u16(),
                });
            }
            let bytes = response.bytes().await.map_err(http_err)?;
            return Ok(bytes.to_vec());
        }

        let path = PathBuf::from(locator.strip_prefix("file://").unwrap_or(locator));
        tracing::debug!(path = %path.display(), "Reading image from disk");
        tokio::fs::read(&path)
            .await
            .map_err(|source| FetchError::File { path, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetches_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sheet.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::default();
        let bytes = fetcher
            .fetch(&format!("{}/sheet.png", server.uri()))
            .await
            .unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn http_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = HttpFetcher::default()
            .fetch(&format!("{}/missing.png", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
    }

    #[tokio::test]
    async fn reads_file_locators() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"pixels").unwrap();
        let plain = file.path().to_str().unwrap().to_string();

        let fetcher = HttpFetcher::default();
        assert_eq!(fetcher.fetch(&plain).await.unwrap(), b"pixels");
        assert_eq!(
            fetcher.fetch(&format!("file://{plain}")).await.unwrap(),
            b"pixels"
        );
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let err = HttpFetcher::default()
            .fetch("/definitely/not/here.png")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::File { .. }));
    }
}
