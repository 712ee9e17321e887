//! Shared-folder image discovery.
//!
//! A folder reference is resolved by fetching the public folder page and
//! collecting every embedded file link. No authentication is used.

use crate::http::build_client;
use crate::models::ImageRef;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info};

const DRIVE_ROOT: &str = "https://drive.google.com";

static FILE_LINK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"https://drive\.google\.com/file/d/([a-zA-Z0-9_-]+)").expect("file link pattern")
});

#[derive(Debug, Error)]
pub enum LocatorError {
    #[error("invalid folder reference: {0}")]
    InvalidReference(String),
    #[error("http error: {0}")]
    Http(String),
}

#[async_trait]
pub trait ImageLocator: Send + Sync {
    async fn locate(&self, folder_reference: &str) -> Result<Vec<ImageRef>, LocatorError>;
}

pub struct DriveFolderLocator {
    http: Client,
    base_url: String,
}

impl DriveFolderLocator {
    pub fn new() -> Self {
        Self::with_base_url(DRIVE_ROOT)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            http: build_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl Default for DriveFolderLocator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageLocator for DriveFolderLocator {
    async fn locate(&self, folder_reference: &str) -> Result<Vec<ImageRef>, LocatorError> {
        let folder_id = folder_id_from_reference(folder_reference)
            .ok_or_else(|| LocatorError::InvalidReference(folder_reference.to_string()))?;
        let url = format!("{}/drive/folders/{}", self.base_url, folder_id);
        debug!(target = "appraisal.locator", %url, "fetching_folder_listing");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| LocatorError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(LocatorError::Http(format!("HTTP {}", response.status())));
        }
        let html = response
            .text()
            .await
            .map_err(|err| LocatorError::Http(err.to_string()))?;

        let images: Vec<ImageRef> = extract_file_ids(&html)
            .iter()
            .map(|id| image_ref_for(id))
            .collect();
        info!(
            target = "appraisal.locator",
            folder_id = %folder_id,
            count = images.len(),
            "folder_listing_resolved"
        );
        Ok(images)
    }
}

/// Trailing path segment of the reference, ignoring any query or fragment.
pub fn folder_id_from_reference(reference: &str) -> Option<String> {
    let path = reference.trim().split(['?', '#']).next()?;
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
}

/// File ids in first-seen order, duplicates dropped.
pub fn extract_file_ids(html: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    FILE_LINK
        .captures_iter(html)
        .map(|cap| cap[1].to_string())
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

pub fn image_ref_for(id: &str) -> ImageRef {
    ImageRef {
        id: id.to_string(),
        fetch_url: format!("{DRIVE_ROOT}/uc?id={id}"),
        display_name: format!("image_{id}.jpg"),
    }
}
