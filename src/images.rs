use crate::http::build_client;
use async_trait::async_trait;
use image::DynamicImage;
use reqwest::Client;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http error: {0}")]
    Http(String),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("decode failed: {0}")]
    Decode(String),
}

#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Plain unauthenticated GET.
pub struct HttpImageFetcher {
    http: Client,
}

impl HttpImageFetcher {
    pub fn new() -> Self {
        Self {
            http: build_client(),
        }
    }
}

impl Default for HttpImageFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::Http(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| FetchError::Http(err.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Decodes any supported format and converts it to 8-bit RGB.
pub fn decode_normalized(bytes: &[u8]) -> Result<DynamicImage, FetchError> {
    let decoded =
        image::load_from_memory(bytes).map_err(|err| FetchError::Decode(err.to_string()))?;
    Ok(DynamicImage::ImageRgb8(decoded.to_rgb8()))
}
