//! Groups a user's stored report files by the batch timestamp in their name.

use crate::models::ArtifactKind;
use crate::store::StoredReport;
use chrono::NaiveDateTime;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReportFile {
    pub file_name: String,
    pub kind: ArtifactKind,
    #[serde(skip)]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReportGroup {
    pub key: String,
    pub generated_at: NaiveDateTime,
    pub files: Vec<ReportFile>,
}

/// Paths recorded outside `reports_dir` resolve to the same file name
/// inside it.
pub fn resolve_path(stored: &Path, reports_dir: &Path) -> PathBuf {
    if stored.starts_with(reports_dir) {
        return stored.to_path_buf();
    }
    match stored.file_name() {
        Some(name) => reports_dir.join(name),
        None => stored.to_path_buf(),
    }
}

/// `report_20240309_070501_1.pdf` -> (`20240309_070501_1`, 2024-03-09 07:05:01).
pub fn timestamp_key(path: &Path) -> Option<(String, NaiveDateTime)> {
    let stem = path.file_stem()?.to_str()?;
    let key = stem.strip_prefix("report_")?;
    let stamp = key.get(..15)?;
    let generated_at = NaiveDateTime::parse_from_str(stamp, "%Y%m%d_%H%M%S").ok()?;
    Some((key.to_string(), generated_at))
}

/// Newest group first. Files with unknown extensions or names without a
/// timestamp are skipped.
pub fn group_reports(reports: &[StoredReport], reports_dir: &Path) -> Vec<ReportGroup> {
    let mut groups: Vec<ReportGroup> = Vec::new();
    for report in reports {
        let path = resolve_path(&report.path, reports_dir);
        let Some(kind) = ArtifactKind::from_path(&path) else {
            continue;
        };
        let Some((key, generated_at)) = timestamp_key(&path) else {
            warn!(
                target = "appraisal.report",
                path = %path.display(),
                "report_name_unparsed"
            );
            continue;
        };
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file = ReportFile {
            file_name,
            kind,
            path,
        };

        match groups.iter_mut().find(|group| group.key == key) {
            Some(group) => {
                if !group.files.iter().any(|existing| existing.path == file.path) {
                    group.files.push(file);
                }
            }
            None => groups.push(ReportGroup {
                key,
                generated_at,
                files: vec![file],
            }),
        }
    }
    for group in &mut groups {
        group.files.sort_by_key(|file| file.kind != ArtifactKind::TabularDocument);
    }
    groups.sort_by(|a, b| {
        b.generated_at
            .cmp(&a.generated_at)
            .then_with(|| b.key.cmp(&a.key))
    });
    groups
}

/// Finds one of the user's files by name.
pub fn find_file<'a>(groups: &'a [ReportGroup], file_name: &str) -> Option<&'a ReportFile> {
    groups
        .iter()
        .flat_map(|group| group.files.iter())
        .find(|file| file.file_name == file_name)
}
