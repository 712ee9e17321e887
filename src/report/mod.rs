pub mod archive;
pub mod layout;
pub mod pdf;
pub mod xlsx;

use crate::models::{ArtifactKind, ResultRecord};
use chrono::{DateTime, TimeZone};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

pub use layout::ReportBranding;
pub use pdf::PdfRenderer;
pub use xlsx::XlsxRenderer;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("pdf error: {0}")]
    Pdf(String),
    #[error("spreadsheet error: {0}")]
    Spreadsheet(#[from] rust_xlsxwriter::XlsxError),
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct RenderSummary {
    pub rows: usize,
    pub images_embedded: usize,
    pub pages: usize,
}

/// Writes one report file from a batch's records.
pub trait ReportRenderer: Send + Sync {
    fn kind(&self) -> ArtifactKind;
    fn render(&self, records: &[ResultRecord], output: &Path) -> Result<RenderSummary, ReportError>;
}

pub fn default_renderers(branding: ReportBranding) -> Vec<Arc<dyn ReportRenderer>> {
    vec![
        Arc::new(PdfRenderer::new(branding.clone())),
        Arc::new(XlsxRenderer::new(branding)),
    ]
}

/// `report_YYYYMMDD_HHMMSS` in the given clock's local time.
pub fn batch_stem<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!("report_{}", at.format("%Y%m%d_%H%M%S"))
}

/// One output path per kind, created empty so no other batch can claim the
/// same name. If any of them already exists the whole set moves to
/// `<stem>_<n>` so the pair keeps a shared name.
pub fn reserve_output_paths(
    dir: &Path,
    stem: &str,
    kinds: &[ArtifactKind],
) -> std::io::Result<Vec<(ArtifactKind, PathBuf)>> {
    let mut name = stem.to_string();
    let mut n = 0;
    loop {
        let mut claimed: Vec<(ArtifactKind, PathBuf)> = Vec::with_capacity(kinds.len());
        let mut collided = false;
        for kind in kinds {
            let path = dir.join(format!("{name}.{}", kind.extension()));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => claimed.push((*kind, path)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    collided = true;
                    break;
                }
                Err(err) => {
                    release(&claimed);
                    return Err(err);
                }
            }
        }
        if !collided {
            return Ok(claimed);
        }
        release(&claimed);
        n += 1;
        name = format!("{stem}_{n}");
    }
}

fn release(claimed: &[(ArtifactKind, PathBuf)]) {
    for (_, path) in claimed {
        if let Err(err) = std::fs::remove_file(path) {
            warn!(
                target = "appraisal.report",
                path = %path.display(),
                error = %err,
                "reservation_release_failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    #[test]
    fn stem_uses_second_resolution() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(7, 5, 1)
            .unwrap()
            .and_utc();
        assert_eq!(batch_stem(&at), "report_20240309_070501");
        assert!(batch_stem(&Utc::now()).starts_with("report_"));
    }

    #[test]
    fn collisions_move_the_whole_pair() {
        let dir = tempfile::tempdir().unwrap();
        let kinds = [ArtifactKind::TabularDocument, ArtifactKind::Spreadsheet];
        let first = reserve_output_paths(dir.path(), "report_20240101_000000", &kinds).unwrap();
        assert_eq!(
            first[0].1.file_name().unwrap(),
            "report_20240101_000000.pdf"
        );
        assert!(first.iter().all(|(_, path)| path.exists()));

        let second = reserve_output_paths(dir.path(), "report_20240101_000000", &kinds).unwrap();
        assert_eq!(
            second[0].1.file_name().unwrap(),
            "report_20240101_000000_1.pdf"
        );
        assert_eq!(
            second[1].1.file_name().unwrap(),
            "report_20240101_000000_1.xlsx"
        );
    }

    #[test]
    fn half_taken_pair_is_released_before_moving_on() {
        let dir = tempfile::tempdir().unwrap();
        let kinds = [ArtifactKind::TabularDocument, ArtifactKind::Spreadsheet];
        std::fs::write(dir.path().join("report_20240101_000000.xlsx"), b"x").unwrap();

        let claimed = reserve_output_paths(dir.path(), "report_20240101_000000", &kinds).unwrap();
        assert_eq!(
            claimed[0].1.file_name().unwrap(),
            "report_20240101_000000_1.pdf"
        );
        assert!(!dir.path().join("report_20240101_000000.pdf").exists());
    }

    #[test]
    fn racing_reservations_never_share_a_name() {
        let dir = tempfile::tempdir().unwrap();
        let kinds = [ArtifactKind::TabularDocument, ArtifactKind::Spreadsheet];
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dir = dir.path().to_path_buf();
                std::thread::spawn(move || {
                    reserve_output_paths(&dir, "report_20240101_000000", &kinds).unwrap()
                })
            })
            .collect();
        let mut names: Vec<PathBuf> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .map(|(_, path)| path)
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 16);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = reserve_output_paths(
            &dir.path().join("absent"),
            "report_20240101_000000",
            &[ArtifactKind::TabularDocument],
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
