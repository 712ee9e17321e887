use crate::config::AppConfig;
use crate::images::{HttpImageFetcher, ImageFetcher, decode_normalized};
use crate::lens::{LensClient, LensConfig, VisualMatcher};
use crate::llm::{LlmClient, LlmConfig};
use crate::locator::{DriveFolderLocator, ImageLocator};
use crate::models::{
    BatchMode, BatchOutcome, ImageRef, QuotaState, ReportArtifact, RequestContext, ResultRecord,
    StageReport,
};
use crate::progress::{self, ProgressEvent, ProgressSink};
use crate::report::{self, ReportBranding, ReportRenderer};
use crate::scratch::ScratchSpace;
use crate::store::{QuotaLedger, ReportStore, SqliteStore};
use crate::summary::{LlmSummarizer, MarketSummarizer};
use serde_json::{Value, json};
use std::{
    future::Future,
    path::PathBuf,
    sync::Arc,
    time::Instant,
};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Largest number of images one batch processes; extra located images are
/// dropped with a warning.
pub const MAX_BATCH_IMAGES: usize = 25;

#[derive(Clone)]
pub struct Pipeline {
    pub config: Arc<PipelineConfig>,
    parts: Arc<PipelineParts>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub reports_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub max_batch_images: usize,
}

impl PipelineConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            reports_dir: config.reports_dir.clone(),
            scratch_dir: config.scratch_dir.clone(),
            max_batch_images: MAX_BATCH_IMAGES,
        }
    }
}

/// The collaborators a batch talks to.
pub struct PipelineParts {
    pub locator: Arc<dyn ImageLocator>,
    pub fetcher: Arc<dyn ImageFetcher>,
    pub matcher: Arc<dyn VisualMatcher>,
    pub summarizer: Arc<dyn MarketSummarizer>,
    pub ledger: Arc<dyn QuotaLedger>,
    pub reports: Arc<dyn ReportStore>,
    pub renderers: Vec<Arc<dyn ReportRenderer>>,
}

impl PipelineParts {
    /// Network adapters configured from the environment, backed by `store`.
    pub fn live(store: SqliteStore) -> Self {
        let store = Arc::new(store);
        Self {
            locator: Arc::new(DriveFolderLocator::new()),
            fetcher: Arc::new(HttpImageFetcher::new()),
            matcher: Arc::new(LensClient::new(LensConfig::from_env())),
            summarizer: Arc::new(LlmSummarizer::new(LlmClient::new(LlmConfig::from_env()))),
            ledger: store.clone(),
            reports: store,
            renderers: report::default_renderers(ReportBranding::from_env()),
        }
    }
}

impl Pipeline {
    pub fn new(config: PipelineConfig, parts: PipelineParts) -> Self {
        Self {
            config: Arc::new(config),
            parts: Arc::new(parts),
        }
    }

    /// Runs one batch for `ctx.user` over the images in `folder_ref`.
    ///
    /// The quota is checked once before any image is fetched and charged
    /// once, after the reports are written, with the admitted batch size.
    pub async fn run_batch(
        &self,
        ctx: &RequestContext,
        folder_ref: &str,
        progress: &dyn ProgressSink,
    ) -> Result<BatchOutcome, PipelineError> {
        let batch_id = Uuid::new_v4().to_string();
        let mut stages = Vec::new();
        let mut warnings = Vec::new();

        if folder_ref.trim().is_empty() {
            return Err(PipelineError::invalid_input(
                "locate_images",
                "folder_reference_missing",
            ));
        }

        let located = self
            .capture_stage(
                "locate_images",
                &mut stages,
                stages::locate_images(self.parts.locator.as_ref(), folder_ref),
            )
            .await?;
        let located_count = located.len();

        let (admitted, cap_warning) = self
            .capture_stage(
                "cap_batch",
                &mut stages,
                stages::cap_batch(located, self.config.max_batch_images),
            )
            .await?;
        warnings.extend(cap_warning);

        self.capture_stage(
            "check_quota",
            &mut stages,
            stages::check_quota(self.parts.ledger.as_ref(), &ctx.user, admitted.len()),
        )
        .await?;

        info!(
            target = "appraisal.pipeline",
            batch_id = %batch_id,
            user = %ctx.user,
            mode = ?ctx.mode,
            located = located_count,
            admitted = admitted.len(),
            "batch_admitted"
        );

        let mut scratch = ScratchSpace::new(self.config.scratch_dir.join(&batch_id));
        let records = self
            .capture_stage(
                "process_images",
                &mut stages,
                stages::process_images(&self.parts, ctx, &admitted, &mut scratch, progress),
            )
            .await?;

        if records.is_empty() {
            scratch.cleanup();
            return Err(PipelineError::nothing_to_report(
                "process_images",
                "no image produced a report row",
            ));
        }

        progress.on_event(ProgressEvent::Rendering {
            records: records.len(),
        });
        let rendered = self
            .capture_stage(
                "render_reports",
                &mut stages,
                stages::render_reports(
                    &self.parts.renderers,
                    records.clone(),
                    &self.config.reports_dir,
                    &ctx.user,
                ),
            )
            .await;

        let failed_removals = scratch.cleanup();
        if failed_removals > 0 {
            warnings.push(format!(
                "{failed_removals} temporary files could not be removed"
            ));
        }
        let (artifacts, render_warnings) = rendered?;
        warnings.extend(render_warnings);

        let persisted = self
            .capture_stage(
                "persist_reports",
                &mut stages,
                stages::persist_reports(
                    self.parts.ledger.as_ref(),
                    self.parts.reports.as_ref(),
                    &ctx.user,
                    &artifacts,
                    admitted.len(),
                ),
            )
            .await?;
        warnings.extend(persisted.warnings);

        info!(
            target = "appraisal.pipeline",
            batch_id = %batch_id,
            user = %ctx.user,
            records = records.len(),
            artifacts = artifacts.len(),
            charged = admitted.len(),
            "batch_completed"
        );

        Ok(BatchOutcome {
            batch_id,
            user: ctx.user.clone(),
            mode: ctx.mode,
            located: located_count,
            admitted: admitted.len(),
            records: records.len(),
            temp_files_created: scratch.created(),
            quota_charged: admitted.len(),
            quota_recorded: persisted.quota_recorded,
            artifacts,
            warnings,
            stages,
        })
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        stages.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    QuotaExceeded,
    NothingToReport,
    Upstream,
    NotFound,
    Internal,
}

impl PipelineError {
    fn with_kind(stage: &'static str, message: impl Into<String>, kind: PipelineErrorKind) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::InvalidInput)
    }

    pub fn quota_exceeded(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::QuotaExceeded)
    }

    pub fn nothing_to_report(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::NothingToReport)
    }

    pub fn upstream(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Upstream)
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::NotFound)
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Internal)
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

pub struct PersistOutcome {
    pub quota_recorded: bool,
    pub warnings: Vec<String>,
}

pub mod stages {
    use super::*;
    use std::path::Path;

    pub async fn locate_images(
        locator: &dyn ImageLocator,
        folder_ref: &str,
    ) -> Result<StageOutcome<Vec<ImageRef>>, PipelineError> {
        let images = locator.locate(folder_ref).await.map_err(|err| {
            warn!(target = "appraisal.pipeline", error = %err, "locate_failed");
            PipelineError::upstream("locate_images", err.to_string())
        })?;
        if images.is_empty() {
            return Err(PipelineError::invalid_input(
                "locate_images",
                "no_images_found",
            ));
        }
        let preview: Vec<&str> = images.iter().take(4).map(|img| img.id.as_str()).collect();
        Ok(StageOutcome::new(
            images.clone(),
            json!({ "count": images.len(), "preview": preview }),
        ))
    }

    pub async fn cap_batch(
        mut images: Vec<ImageRef>,
        max: usize,
    ) -> Result<StageOutcome<(Vec<ImageRef>, Option<String>)>, PipelineError> {
        let located = images.len();
        let warning = if located > max {
            images.truncate(max);
            Some(format!("Processing first {max} images of the folder"))
        } else {
            None
        };
        Ok(StageOutcome::new(
            (images, warning),
            json!({ "located": located, "admitted": located.min(max) }),
        ))
    }

    pub async fn check_quota(
        ledger: &dyn QuotaLedger,
        user: &str,
        requested: usize,
    ) -> Result<StageOutcome<QuotaState>, PipelineError> {
        let limits = ledger
            .get_limits(user)
            .await
            .map_err(|err| PipelineError::internal("check_quota", err.to_string()))?;
        if !limits.admits(requested) {
            warn!(
                target = "appraisal.pipeline",
                user = %user,
                processed = limits.processed_count,
                requested,
                max = limits.max_allowed,
                "quota_exceeded"
            );
            return Err(PipelineError::quota_exceeded(
                "check_quota",
                format!(
                    "image limit exceeded: {} processed + {} requested > {} allowed",
                    limits.processed_count, requested, limits.max_allowed
                ),
            ));
        }
        Ok(StageOutcome::new(
            limits,
            json!({
                "processed": limits.processed_count,
                "requested": requested,
                "max_allowed": limits.max_allowed,
            }),
        ))
    }

    /// Images are handled one at a time. Any per-image failure skips that
    /// image only.
    pub async fn process_images(
        parts: &PipelineParts,
        ctx: &RequestContext,
        images: &[ImageRef],
        scratch: &mut ScratchSpace,
        progress: &dyn ProgressSink,
    ) -> Result<StageOutcome<Vec<ResultRecord>>, PipelineError> {
        let total = images.len();
        let started = Instant::now();
        let mut records = Vec::new();
        let mut skipped = 0usize;
        let mut unmatched = 0usize;
        progress.on_event(ProgressEvent::BatchStarted {
            total,
            mode: ctx.mode,
        });

        for (offset, image) in images.iter().enumerate() {
            let index = offset + 1;
            progress.on_event(ProgressEvent::ImageStarted {
                index,
                total,
                snapshot: progress::snapshot(index, total, started.elapsed()),
            });

            let local_path = match download(parts.fetcher.as_ref(), image, scratch).await {
                Ok(path) => path,
                Err(reason) => {
                    warn!(
                        target = "appraisal.pipeline",
                        user = %ctx.user,
                        image = %image.display_name,
                        reason = %reason,
                        "image_skipped"
                    );
                    crate::metrics::image_outcome("skipped");
                    skipped += 1;
                    progress.on_event(ProgressEvent::ImageSkipped {
                        index,
                        name: image.display_name.clone(),
                        reason,
                    });
                    continue;
                }
            };

            let analysis = match ctx.mode {
                BatchMode::Basic => Some(String::new()),
                BatchMode::Full => {
                    let matches = parts.matcher.find_matches(&image.fetch_url).await;
                    if matches.is_empty() {
                        None
                    } else {
                        Some(parts.summarizer.summarize(&matches).await)
                    }
                }
            };

            let recorded = analysis.is_some();
            if let Some(analysis_text) = analysis {
                crate::metrics::image_outcome("recorded");
                records.push(ResultRecord {
                    display_name: image.display_name.clone(),
                    local_image_path: local_path,
                    analysis_text,
                });
            } else {
                crate::metrics::image_outcome("unmatched");
                unmatched += 1;
            }
            progress.on_event(ProgressEvent::ImageCompleted {
                index,
                name: image.display_name.clone(),
                recorded,
            });
        }

        Ok(StageOutcome::new(
            records.clone(),
            json!({
                "records": records.len(),
                "skipped": skipped,
                "unmatched": unmatched,
                "temp_files": scratch.created(),
            }),
        ))
    }

    async fn download(
        fetcher: &dyn ImageFetcher,
        image: &ImageRef,
        scratch: &mut ScratchSpace,
    ) -> Result<PathBuf, String> {
        let bytes = fetcher
            .fetch(&image.fetch_url)
            .await
            .map_err(|err| err.to_string())?;
        let decoded = decode_normalized(&bytes).map_err(|err| err.to_string())?;
        scratch
            .persist_image(&decoded, &image.id)
            .map_err(|err| err.to_string())
    }

    /// Runs every renderer. A failing renderer loses only its own file; the
    /// stage fails only when no report could be written.
    pub async fn render_reports(
        renderers: &[Arc<dyn ReportRenderer>],
        records: Vec<ResultRecord>,
        reports_dir: &Path,
        owner: &str,
    ) -> Result<StageOutcome<(Vec<ReportArtifact>, Vec<String>)>, PipelineError> {
        tokio::fs::create_dir_all(reports_dir)
            .await
            .map_err(|err| PipelineError::internal("render_reports", err.to_string()))?;

        let stem = report::batch_stem(&chrono::Local::now());
        let kinds: Vec<_> = renderers.iter().map(|renderer| renderer.kind()).collect();
        let targets = report::reserve_output_paths(reports_dir, &stem, &kinds)
            .map_err(|err| PipelineError::internal("render_reports", err.to_string()))?;
        let records = Arc::new(records);

        let mut artifacts = Vec::new();
        let mut warnings = Vec::new();
        let mut summaries = Vec::new();
        for (renderer, (kind, path)) in renderers.iter().zip(targets) {
            let job_renderer = Arc::clone(renderer);
            let job_records = Arc::clone(&records);
            let job_path = path.clone();
            let result = tokio::task::spawn_blocking(move || {
                job_renderer.render(&job_records, &job_path)
            })
            .await
            .map_err(|err| err.to_string())
            .and_then(|res| res.map_err(|err| err.to_string()));

            match result {
                Ok(summary) => {
                    summaries.push(json!({
                        "kind": kind,
                        "file": path.file_name().map(|n| n.to_string_lossy().into_owned()),
                        "summary": summary,
                    }));
                    artifacts.push(ReportArtifact {
                        kind,
                        file_path: path,
                        owner: owner.to_string(),
                        created_at: chrono::Utc::now(),
                    });
                }
                Err(message) => {
                    warn!(
                        target = "appraisal.report",
                        kind = ?kind,
                        path = %path.display(),
                        error = %message,
                        "render_failed"
                    );
                    discard_partial(&path);
                    warnings.push(format!("{} report failed: {message}", kind.extension()));
                }
            }
        }

        if artifacts.is_empty() {
            return Err(PipelineError::internal(
                "render_reports",
                warnings.join("; "),
            ));
        }
        Ok(StageOutcome::new(
            (artifacts, warnings),
            json!({ "stem": stem, "rendered": summaries }),
        ))
    }

    pub(super) fn discard_partial(path: &Path) {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                target = "appraisal.report",
                path = %path.display(),
                error = %err,
                "partial_report_remove_failed"
            ),
        }
    }

    /// Records each artifact for the owner, then charges the quota.
    pub async fn persist_reports(
        ledger: &dyn QuotaLedger,
        reports: &dyn ReportStore,
        owner: &str,
        artifacts: &[ReportArtifact],
        charge: usize,
    ) -> Result<StageOutcome<PersistOutcome>, PipelineError> {
        let mut warnings = Vec::new();
        let mut saved = 0usize;
        for artifact in artifacts {
            match reports.save_report(owner, &artifact.file_path).await {
                Ok(()) => saved += 1,
                Err(err) => {
                    warn!(
                        target = "appraisal.store",
                        user = %owner,
                        path = %artifact.file_path.display(),
                        error = %err,
                        "save_report_failed"
                    );
                    warnings.push(format!(
                        "report {} was written but not recorded",
                        artifact.file_path.display()
                    ));
                }
            }
        }

        let quota_recorded = match ledger.increment(owner, charge).await {
            Ok(true) => true,
            Ok(false) => {
                warnings.push(format!("no quota record for {owner}; usage not counted"));
                false
            }
            Err(err) => {
                warn!(
                    target = "appraisal.store",
                    user = %owner,
                    error = %err,
                    "quota_increment_failed"
                );
                warnings.push("usage could not be counted".to_string());
                false
            }
        };

        Ok(StageOutcome::new(
            PersistOutcome {
                quota_recorded,
                warnings,
            },
            json!({ "saved": saved, "charged": charge, "quota_recorded": quota_recorded }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::FetchError;
    use crate::images::tests::png_bytes;
    use crate::locator::{LocatorError, image_ref_for};
    use crate::models::{ArtifactKind, VisualMatch};
    use crate::report::{RenderSummary, ReportError};
    use crate::store::StoreError;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const FOLDER: &str = "https://drive.google.com/drive/folders/test-folder";

    struct FakeLocator {
        result: Result<Vec<ImageRef>, String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ImageLocator for FakeLocator {
        async fn locate(&self, _folder: &str) -> Result<Vec<ImageRef>, LocatorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone().map_err(LocatorError::Http)
        }
    }

    #[derive(Default)]
    struct FakeFetcher {
        missing: HashSet<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ImageFetcher for FakeFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.missing.iter().any(|id| url.ends_with(id.as_str())) {
                return Err(FetchError::Status(404));
            }
            Ok(png_bytes())
        }
    }

    #[derive(Default)]
    struct FakeMatcher {
        unmatched: HashSet<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl VisualMatcher for FakeMatcher {
        async fn find_matches(&self, image_url: &str) -> Vec<VisualMatch> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.unmatched.iter().any(|id| image_url.ends_with(id.as_str())) {
                return Vec::new();
            }
            vec![VisualMatch {
                source_marketplace: "eBay".into(),
                title: format!("match for {image_url}"),
                price: Some("$10.00".into()),
                listing_url: "https://www.ebay.com/itm/1".into(),
            }]
        }
    }

    #[derive(Default)]
    struct FakeSummarizer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MarketSummarizer for FakeSummarizer {
        async fn summarize(&self, matches: &[VisualMatch]) -> String {
            self.calls.fetch_add(1, Ordering::SeqCst);
            format!("- item: {}", matches[0].title)
        }
    }

    struct FakeLedger {
        state: Mutex<QuotaState>,
        known: bool,
        reads: AtomicUsize,
        charges: Mutex<Vec<usize>>,
    }

    impl FakeLedger {
        fn with(processed: i64, max: i64) -> Self {
            Self {
                state: Mutex::new(QuotaState {
                    processed_count: processed,
                    max_allowed: max,
                }),
                known: true,
                reads: AtomicUsize::new(0),
                charges: Mutex::new(Vec::new()),
            }
        }

        fn current(&self) -> QuotaState {
            *self.state.lock().unwrap()
        }
    }

    #[async_trait]
    impl QuotaLedger for FakeLedger {
        async fn get_limits(&self, _user: &str) -> Result<QuotaState, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.current())
        }

        async fn increment(&self, _user: &str, amount: usize) -> Result<bool, StoreError> {
            if !self.known {
                return Ok(false);
            }
            self.charges.lock().unwrap().push(amount);
            self.state.lock().unwrap().processed_count += amount as i64;
            Ok(true)
        }
    }

    struct FakeRenderer {
        kind: ArtifactKind,
        fail: bool,
        calls: AtomicUsize,
        seen: Mutex<Vec<ResultRecord>>,
        images_present: AtomicUsize,
    }

    impl FakeRenderer {
        fn new(kind: ArtifactKind, fail: bool) -> Self {
            Self {
                kind,
                fail,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
                images_present: AtomicUsize::new(0),
            }
        }
    }

    impl ReportRenderer for FakeRenderer {
        fn kind(&self) -> ArtifactKind {
            self.kind
        }

        fn render(&self, records: &[ResultRecord], output: &Path) -> Result<RenderSummary, ReportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let present = records.iter().filter(|r| r.local_image_path.exists()).count();
            self.images_present.fetch_add(present, Ordering::SeqCst);
            self.seen.lock().unwrap().extend(records.iter().cloned());
            std::fs::write(output, format!("{} rows", records.len()))?;
            if self.fail {
                return Err(ReportError::Pdf("renderer exploded".into()));
            }
            Ok(RenderSummary {
                rows: records.len(),
                images_embedded: present,
                pages: 1,
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<ProgressEvent>>,
    }

    impl ProgressSink for RecordingSink {
        fn on_event(&self, event: ProgressEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    struct Harness {
        pipeline: Pipeline,
        locator: Arc<FakeLocator>,
        fetcher: Arc<FakeFetcher>,
        matcher: Arc<FakeMatcher>,
        summarizer: Arc<FakeSummarizer>,
        ledger: Arc<FakeLedger>,
        store: SqliteStore,
        renderers: Vec<Arc<FakeRenderer>>,
        root: TempDir,
    }

    impl Harness {
        fn reports_dir(&self) -> PathBuf {
            self.root.path().join("reports")
        }

        fn scratch_dir(&self) -> PathBuf {
            self.root.path().join("scratch")
        }

        fn scratch_files(&self) -> usize {
            walk_files(&self.scratch_dir())
        }

        async fn run(&self, mode: BatchMode) -> Result<BatchOutcome, PipelineError> {
            self.run_with(mode, &RecordingSink::default()).await
        }

        async fn run_with(
            &self,
            mode: BatchMode,
            sink: &RecordingSink,
        ) -> Result<BatchOutcome, PipelineError> {
            let ctx = RequestContext {
                user: "alice".into(),
                mode,
            };
            self.pipeline.run_batch(&ctx, FOLDER, sink).await
        }
    }

    fn walk_files(dir: &Path) -> usize {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return 0;
        };
        entries
            .flatten()
            .map(|entry| {
                let path = entry.path();
                if path.is_dir() { walk_files(&path) } else { 1 }
            })
            .sum()
    }

    fn refs(count: usize) -> Vec<ImageRef> {
        (0..count).map(|i| image_ref_for(&format!("img{i:02}"))).collect()
    }

    struct Setup {
        located: Result<Vec<ImageRef>, String>,
        missing: &'static [&'static str],
        unmatched: &'static [&'static str],
        ledger: FakeLedger,
        failing: Option<ArtifactKind>,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                located: Ok(refs(3)),
                missing: &[],
                unmatched: &[],
                ledger: FakeLedger::with(0, 100),
                failing: None,
            }
        }
    }

    fn harness(setup: Setup) -> Harness {
        let root = tempfile::tempdir().unwrap();
        let locator = Arc::new(FakeLocator {
            result: setup.located,
            calls: AtomicUsize::new(0),
        });
        let fetcher = Arc::new(FakeFetcher {
            missing: setup.missing.iter().map(|s| s.to_string()).collect(),
            calls: AtomicUsize::new(0),
        });
        let matcher = Arc::new(FakeMatcher {
            unmatched: setup.unmatched.iter().map(|s| s.to_string()).collect(),
            calls: AtomicUsize::new(0),
        });
        let summarizer = Arc::new(FakeSummarizer::default());
        let ledger = Arc::new(setup.ledger);
        let store = SqliteStore::open_in_memory().unwrap();
        let renderers: Vec<Arc<FakeRenderer>> = [ArtifactKind::TabularDocument, ArtifactKind::Spreadsheet]
            .into_iter()
            .map(|kind| Arc::new(FakeRenderer::new(kind, setup.failing == Some(kind))))
            .collect();

        let parts = PipelineParts {
            locator: locator.clone(),
            fetcher: fetcher.clone(),
            matcher: matcher.clone(),
            summarizer: summarizer.clone(),
            ledger: ledger.clone(),
            reports: Arc::new(store.clone()),
            renderers: renderers
                .iter()
                .map(|r| r.clone() as Arc<dyn ReportRenderer>)
                .collect(),
        };
        let config = PipelineConfig {
            reports_dir: root.path().join("reports"),
            scratch_dir: root.path().join("scratch"),
            max_batch_images: MAX_BATCH_IMAGES,
        };
        Harness {
            pipeline: Pipeline::new(config, parts),
            locator,
            fetcher,
            matcher,
            summarizer,
            ledger,
            store,
            renderers,
            root,
        }
    }

    #[tokio::test]
    async fn full_batch_renders_matched_images_and_cleans_scratch() {
        let h = harness(Setup {
            unmatched: &["img01"],
            ..Setup::default()
        });
        let outcome = h.run(BatchMode::Full).await.expect("batch");

        assert_eq!(outcome.records, 2);
        assert_eq!(outcome.temp_files_created, 3);
        assert_eq!(h.scratch_files(), 0);
        assert_eq!(std::fs::read_dir(h.scratch_dir()).unwrap().count(), 0);
        assert_eq!(h.summarizer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.matcher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.artifacts.len(), 2);
        for renderer in &h.renderers {
            assert_eq!(renderer.images_present.load(Ordering::SeqCst), 2);
        }
        let names: Vec<&str> = outcome.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "locate_images",
                "cap_batch",
                "check_quota",
                "process_images",
                "render_reports",
                "persist_reports",
            ]
        );

        let stored = h.store.get_user_reports("alice").await.unwrap();
        assert_eq!(stored.len(), 2);
        let pdf = &outcome.artifacts[0];
        assert_eq!(pdf.kind, ArtifactKind::TabularDocument);
        assert!(pdf.file_path.starts_with(h.reports_dir()));
        let stem = pdf.file_path.file_stem().unwrap().to_string_lossy().into_owned();
        assert!(stem.starts_with("report_"));
        assert_eq!(
            outcome.artifacts[1].file_path.file_stem().unwrap().to_string_lossy(),
            stem
        );
    }

    #[tokio::test]
    async fn quota_overage_aborts_before_any_fetch() {
        let h = harness(Setup {
            located: Ok(refs(5)),
            ledger: FakeLedger::with(98, 100),
            ..Setup::default()
        });
        let err = h.run(BatchMode::Full).await.expect_err("over quota");

        assert_eq!(err.kind(), PipelineErrorKind::QuotaExceeded);
        assert!(err.detail().contains("98"));
        assert!(err.detail().contains("100"));
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 0);
        for renderer in &h.renderers {
            assert_eq!(renderer.calls.load(Ordering::SeqCst), 0);
        }
        assert_eq!(h.ledger.current().processed_count, 98);
        assert!(h.store.get_user_reports("alice").await.unwrap().is_empty());
        assert!(!h.reports_dir().exists());
    }

    #[tokio::test]
    async fn empty_folder_aborts_before_quota_read() {
        let h = harness(Setup {
            located: Ok(Vec::new()),
            ..Setup::default()
        });
        let err = h.run(BatchMode::Full).await.expect_err("no images");

        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
        assert_eq!(err.stage(), "locate_images");
        assert_eq!(h.ledger.reads.load(Ordering::SeqCst), 0);
        assert!(!h.scratch_dir().exists());
        assert!(!h.reports_dir().exists());
    }

    #[tokio::test]
    async fn blank_reference_never_reaches_locator() {
        let h = harness(Setup::default());
        let ctx = RequestContext {
            user: "alice".into(),
            mode: BatchMode::Full,
        };
        let err = h
            .pipeline
            .run_batch(&ctx, "   ", &RecordingSink::default())
            .await
            .expect_err("blank");
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
        assert_eq!(h.locator.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn locator_failure_is_distinct_from_empty_folder() {
        let h = harness(Setup {
            located: Err("HTTP 500".into()),
            ..Setup::default()
        });
        let err = h.run(BatchMode::Full).await.expect_err("upstream");
        assert_eq!(err.kind(), PipelineErrorKind::Upstream);
        assert_eq!(h.ledger.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn oversized_folder_is_capped_and_charged_by_admitted_size() {
        let h = harness(Setup {
            located: Ok(refs(30)),
            ..Setup::default()
        });
        let outcome = h.run(BatchMode::Full).await.expect("batch");

        assert_eq!(outcome.located, 30);
        assert_eq!(outcome.admitted, 25);
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 25);
        assert!(
            outcome
                .warnings
                .iter()
                .any(|w| w == "Processing first 25 images of the folder")
        );
        assert_eq!(outcome.quota_charged, 25);
        assert_eq!(*h.ledger.charges.lock().unwrap(), vec![25]);
    }

    // The charge counts admitted images, including ones that were skipped.
    // This mirrors long-standing billing behaviour and may not be intended.
    #[tokio::test]
    async fn basic_mode_charges_admitted_size_even_when_an_image_fails() {
        let h = harness(Setup {
            located: Ok(refs(2)),
            missing: &["img01"],
            ..Setup::default()
        });
        let outcome = h.run(BatchMode::Basic).await.expect("batch");

        assert_eq!(outcome.records, 1);
        assert_eq!(h.matcher.calls.load(Ordering::SeqCst), 0);
        let seen = h.renderers[0].seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].analysis_text, "");
        assert_eq!(seen[0].display_name, "image_img00.jpg");
        assert_eq!(outcome.quota_charged, 2);
        assert_eq!(h.ledger.current().processed_count, 2);
    }

    #[tokio::test]
    async fn no_records_means_no_reports_and_no_charge() {
        let h = harness(Setup {
            unmatched: &["img00", "img01", "img02"],
            ..Setup::default()
        });
        let err = h.run(BatchMode::Full).await.expect_err("nothing");

        assert_eq!(err.kind(), PipelineErrorKind::NothingToReport);
        assert_eq!(h.scratch_files(), 0);
        assert!(h.ledger.charges.lock().unwrap().is_empty());
        for renderer in &h.renderers {
            assert_eq!(renderer.calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn one_failing_renderer_keeps_the_other_report() {
        let h = harness(Setup {
            failing: Some(ArtifactKind::Spreadsheet),
            ..Setup::default()
        });
        let outcome = h.run(BatchMode::Full).await.expect("partial");

        assert_eq!(outcome.artifacts.len(), 1);
        assert_eq!(outcome.artifacts[0].kind, ArtifactKind::TabularDocument);
        assert!(outcome.warnings.iter().any(|w| w.starts_with("xlsx report failed")));
        assert_eq!(walk_files(&h.reports_dir()), 1);
        assert_eq!(h.store.get_user_reports("alice").await.unwrap().len(), 1);
        assert_eq!(h.ledger.current().processed_count, 3);
    }

    #[tokio::test]
    async fn missing_quota_row_is_reported_not_fatal() {
        let mut ledger = FakeLedger::with(0, 100);
        ledger.known = false;
        let h = harness(Setup {
            ledger,
            ..Setup::default()
        });
        let outcome = h.run(BatchMode::Basic).await.expect("batch");
        assert!(!outcome.quota_recorded);
        assert!(outcome.warnings.iter().any(|w| w.contains("no quota record")));
    }

    #[tokio::test]
    async fn progress_estimate_starts_with_second_image() {
        let h = harness(Setup::default());
        let sink = RecordingSink::default();
        h.run_with(BatchMode::Full, &sink).await.expect("batch");

        let events = sink.events.lock().unwrap();
        let snapshots: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                ProgressEvent::ImageStarted { snapshot, .. } => Some(snapshot.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[0].remaining, "Calculating...");
        assert!(snapshots[1].remaining_secs.is_some());
        assert!(matches!(events.first(), Some(ProgressEvent::BatchStarted { total: 3, .. })));
        assert!(matches!(events.last(), Some(ProgressEvent::Rendering { records: 3 })));
    }

    /// Writes its row count after a pause so two batches overlap on disk.
    struct SlowRenderer {
        kind: ArtifactKind,
    }

    impl ReportRenderer for SlowRenderer {
        fn kind(&self) -> ArtifactKind {
            self.kind
        }

        fn render(&self, records: &[ResultRecord], output: &Path) -> Result<RenderSummary, ReportError> {
            std::thread::sleep(std::time::Duration::from_millis(200));
            std::fs::write(output, format!("rows={}", records.len()))?;
            Ok(RenderSummary {
                rows: records.len(),
                images_embedded: 0,
                pages: 1,
            })
        }
    }

    fn slow_pipeline(root: &Path, images: usize, store: &SqliteStore) -> Pipeline {
        let parts = PipelineParts {
            locator: Arc::new(FakeLocator {
                result: Ok(refs(images)),
                calls: AtomicUsize::new(0),
            }),
            fetcher: Arc::new(FakeFetcher::default()),
            matcher: Arc::new(FakeMatcher::default()),
            summarizer: Arc::new(FakeSummarizer::default()),
            ledger: Arc::new(FakeLedger::with(0, 100)),
            reports: Arc::new(store.clone()),
            renderers: [ArtifactKind::TabularDocument, ArtifactKind::Spreadsheet]
                .into_iter()
                .map(|kind| Arc::new(SlowRenderer { kind }) as Arc<dyn ReportRenderer>)
                .collect(),
        };
        Pipeline::new(
            PipelineConfig {
                reports_dir: root.join("reports"),
                scratch_dir: root.join("scratch"),
                max_batch_images: MAX_BATCH_IMAGES,
            },
            parts,
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_batches_never_share_report_files() {
        let root = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_in_memory().unwrap();
        let alice_pipeline = slow_pipeline(root.path(), 1, &store);
        let bob_pipeline = slow_pipeline(root.path(), 2, &store);
        let alice = RequestContext {
            user: "alice".into(),
            mode: BatchMode::Full,
        };
        let bob = RequestContext {
            user: "bob".into(),
            mode: BatchMode::Full,
        };
        let alice_sink = RecordingSink::default();
        let bob_sink = RecordingSink::default();

        let (alice_out, bob_out) = tokio::join!(
            alice_pipeline.run_batch(&alice, FOLDER, &alice_sink),
            bob_pipeline.run_batch(&bob, FOLDER, &bob_sink),
        );
        let alice_out = alice_out.expect("alice batch");
        let bob_out = bob_out.expect("bob batch");

        for (a, b) in alice_out.artifacts.iter().zip(&bob_out.artifacts) {
            assert_ne!(a.file_path, b.file_path);
            assert_eq!(std::fs::read_to_string(&a.file_path).unwrap(), "rows=1");
            assert_eq!(std::fs::read_to_string(&b.file_path).unwrap(), "rows=2");
        }
        assert_eq!(walk_files(&root.path().join("reports")), 4);

        let alice_paths: Vec<PathBuf> = store
            .get_user_reports("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.path)
            .collect();
        for report in store.get_user_reports("bob").await.unwrap() {
            assert!(!alice_paths.contains(&report.path));
        }
    }

    #[test]
    fn discarding_partial_output_tolerates_missing_files() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("report_20240101_000000.xlsx");
        std::fs::write(&path, b"half").unwrap();
        stages::discard_partial(&path);
        assert!(!path.exists());
        stages::discard_partial(&path);
    }

    #[tokio::test]
    async fn real_renderers_write_both_files() {
        let root = tempfile::tempdir().unwrap();
        let store = SqliteStore::open_in_memory().unwrap();
        store.register_user("alice", 100).await.unwrap();
        let parts = PipelineParts {
            locator: Arc::new(FakeLocator {
                result: Ok(refs(2)),
                calls: AtomicUsize::new(0),
            }),
            fetcher: Arc::new(FakeFetcher::default()),
            matcher: Arc::new(FakeMatcher::default()),
            summarizer: Arc::new(FakeSummarizer::default()),
            ledger: Arc::new(store.clone()),
            reports: Arc::new(store.clone()),
            renderers: report::default_renderers(ReportBranding::default()),
        };
        let pipeline = Pipeline::new(
            PipelineConfig {
                reports_dir: root.path().join("reports"),
                scratch_dir: root.path().join("scratch"),
                max_batch_images: MAX_BATCH_IMAGES,
            },
            parts,
        );
        let ctx = RequestContext {
            user: "alice".into(),
            mode: BatchMode::Full,
        };
        let outcome = pipeline
            .run_batch(&ctx, FOLDER, &RecordingSink::default())
            .await
            .expect("batch");

        assert_eq!(outcome.artifacts.len(), 2);
        for artifact in &outcome.artifacts {
            assert!(artifact.file_path.exists());
            assert_eq!(
                artifact.file_path.extension().unwrap(),
                artifact.kind.extension()
            );
        }
        assert!(outcome.quota_recorded);
        assert_eq!(store.get_limits("alice").await.unwrap().processed_count, 2);
        assert_eq!(walk_files(&root.path().join("scratch")), 0);
    }
}
