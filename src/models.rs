use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Ceiling applied to users without a quota row.
pub const DEFAULT_MAX_IMAGES: i64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRef {
    pub id: String,
    pub fetch_url: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualMatch {
    pub source_marketplace: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    pub listing_url: String,
}

/// One report row. The image path points at a scratch file owned by the
/// running batch and is gone once the batch returns.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub display_name: String,
    pub local_image_path: PathBuf,
    pub analysis_text: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// Images only, no visual search or summary.
    Basic,
    #[default]
    Full,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    TabularDocument,
    Spreadsheet,
}

impl ArtifactKind {
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::TabularDocument => "pdf",
            ArtifactKind::Spreadsheet => "xlsx",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ArtifactKind::TabularDocument => "application/pdf",
            ArtifactKind::Spreadsheet => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(ArtifactKind::TabularDocument),
            "xlsx" => Some(ArtifactKind::Spreadsheet),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportArtifact {
    pub kind: ArtifactKind,
    pub file_path: PathBuf,
    pub owner: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct QuotaState {
    pub processed_count: i64,
    pub max_allowed: i64,
}

impl Default for QuotaState {
    fn default() -> Self {
        Self {
            processed_count: 0,
            max_allowed: DEFAULT_MAX_IMAGES,
        }
    }
}

impl QuotaState {
    pub fn projected(&self, requested: usize) -> i64 {
        self.processed_count.saturating_add(requested as i64)
    }

    /// Whole-batch admission: either every requested image fits or none does.
    pub fn admits(&self, requested: usize) -> bool {
        self.projected(requested) <= self.max_allowed
    }

    pub fn remaining(&self) -> i64 {
        (self.max_allowed - self.processed_count).max(0)
    }
}

/// Request-scoped inputs for one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub user: String,
    pub mode: BatchMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportRequest {
    pub folder_url: String,
    #[serde(default)]
    pub mode: BatchMode,
}

#[derive(Debug, Serialize, Clone)]
pub struct BatchOutcome {
    pub batch_id: String,
    pub user: String,
    pub mode: BatchMode,
    pub located: usize,
    pub admitted: usize,
    pub records: usize,
    pub temp_files_created: usize,
    pub quota_charged: usize,
    pub quota_recorded: bool,
    pub artifacts: Vec<ReportArtifact>,
    pub warnings: Vec<String>,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
