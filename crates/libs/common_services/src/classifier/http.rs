use super::ClassificationClient;
use async_trait::async_trait;
use common_types::{ClassificationResult, ClassifierError};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Error, Debug)]
pub enum HttpClassifierError {
    #[error("Invalid classifier URL: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("Failed to build HTTP client: {0}")]
    ClientError(#[from] reqwest::Error),
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    storage_ref: &'a str,
}

/// Calls `POST {base_url}/classify`.
#[derive(Clone)]
pub struct HttpClassifier {
    http_client: Client,
    endpoint: Url,
}

impl HttpClassifier {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, HttpClassifierError> {
        let mut endpoint: Url = base_url.parse()?;
        endpoint.set_path("/classify");
        let http_client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            endpoint,
        })
    }
}

fn transport_error(err: &reqwest::Error) -> ClassifierError {
    if err.is_timeout() {
        ClassifierError::Timeout
    } else {
        ClassifierError::Unavailable(err.to_string())
    }
}

#[async_trait]
impl ClassificationClient for HttpClassifier {
    async fn classify(&self, storage_ref: &str) -> Result<ClassificationResult, ClassifierError> {
        debug!("Classifying {storage_ref} via {}", self.endpoint);
        let response = self
            .http_client
            .post(self.endpoint.clone())
            .json(&ClassifyRequest { storage_ref })
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Unavailable(format!(
                "{} returned {status}: {error_text}",
                self.endpoint
            )));
        }

        response
            .json::<ClassificationResult>()
            .await
            .map_err(|e| transport_error(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_replaces_path() -> color_eyre::Result<()> {
        let client = HttpClassifier::new("http://vision.local:9000/ignored", Duration::from_secs(1))?;
        assert_eq!(client.endpoint.as_str(), "http://vision.local:9000/classify");
        Ok(())
    }

    #[test]
    fn rejects_malformed_base_url() {
        let result = HttpClassifier::new("not a url", Duration::from_secs(1));
        assert!(matches!(result, Err(HttpClassifierError::UrlParseError(_))));
    }

    #[tokio::test]
    async fn unreachable_service_is_unavailable() -> color_eyre::Result<()> {
        // Port 9 (discard) on localhost is closed in test environments.
        let client = HttpClassifier::new("http://127.0.0.1:9", Duration::from_secs(2))?;
        let result = client.classify("originals/p1.jpg").await;
        assert!(matches!(
            result,
            Err(ClassifierError::Unavailable(_) | ClassifierError::Timeout)
        ));
        Ok(())
    }
}
