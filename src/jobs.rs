use crate::{
    models::{ApiError, BatchOutcome, RequestContext},
    pipeline::Pipeline,
    progress::{ProgressEvent, ProgressSink, ProgressSnapshot},
};
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Instant,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::warn;
use uuid::Uuid;

type Statuses = Arc<Mutex<HashMap<Uuid, JobEntry>>>;

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Statuses,
}

struct Job {
    id: Uuid,
    folder_url: String,
    context: RequestContext,
}

struct JobEntry {
    owner: String,
    state: JobState,
    finished_at: Option<Instant>,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running {
        processed: usize,
        total: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<ProgressSnapshot>,
    },
    Rendering {
        records: usize,
    },
    Completed {
        result: BatchOutcome,
    },
    Failed {
        error: String,
        stage: Option<String>,
    },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

/// Mirrors pipeline progress into the job table.
struct JobProgress {
    id: Uuid,
    statuses: Statuses,
}

impl JobProgress {
    fn update(&self, apply: impl FnOnce(&mut JobState)) {
        match self.statuses.lock() {
            Ok(mut guard) => {
                if let Some(entry) = guard.get_mut(&self.id) {
                    apply(&mut entry.state);
                }
            }
            Err(_) => warn!(target = "appraisal.api", job_id = %self.id, "job_table_poisoned"),
        }
    }
}

impl ProgressSink for JobProgress {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::BatchStarted { total, .. } => self.update(|state| {
                *state = JobState::Running {
                    processed: 0,
                    total,
                    progress: None,
                }
            }),
            ProgressEvent::ImageStarted {
                index,
                total,
                snapshot,
            } => self.update(|state| {
                *state = JobState::Running {
                    processed: index.saturating_sub(1),
                    total,
                    progress: Some(snapshot),
                }
            }),
            ProgressEvent::ImageSkipped { index, .. } | ProgressEvent::ImageCompleted { index, .. } => {
                self.update(|state| {
                    if let JobState::Running { processed, .. } = state {
                        *processed = index;
                    }
                })
            }
            ProgressEvent::Rendering { records } => {
                self.update(|state| *state = JobState::Rendering { records })
            }
        }
    }
}

impl JobQueue {
    pub fn spawn(pipeline: Pipeline) -> (Self, JoinHandle<()>) {
        Self::spawn_with(pipeline, queue_capacity_from_env(), retention_from_env())
    }

    /// `retain` bounds how many finished jobs stay queryable; the oldest
    /// finished entries are dropped first.
    pub fn spawn_with(pipeline: Pipeline, capacity: usize, retain: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity);
        let statuses: Statuses = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let sink = JobProgress {
                    id: job.id,
                    statuses: statuses_bg.clone(),
                };
                sink.update(|state| {
                    *state = JobState::Running {
                        processed: 0,
                        total: 0,
                        progress: None,
                    }
                });

                let result = pipeline
                    .run_batch(&job.context, &job.folder_url, &sink)
                    .await;
                let finished = match result {
                    Ok(outcome) => JobState::Completed { result: outcome },
                    Err(err) => JobState::Failed {
                        error: err.detail().to_string(),
                        stage: Some(err.stage().to_string()),
                    },
                };
                finish(&statuses_bg, job.id, finished, retain);
            }
        });

        (Self { tx, statuses }, handle)
    }

    pub async fn enqueue_batch(
        &self,
        folder_url: String,
        context: RequestContext,
    ) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        self.with_statuses(|statuses| {
            statuses.insert(
                id,
                JobEntry {
                    owner: context.user.clone(),
                    state: JobState::Queued,
                    finished_at: None,
                },
            );
        })?;
        let job = Job {
            id,
            folder_url,
            context,
        };
        if self.tx.send(job).await.is_err() {
            let _ = self.with_statuses(|statuses| statuses.remove(&id));
            return Err(ApiError {
                error: "queue_send_failed".into(),
                detail: Some("worker not available".into()),
            });
        }
        Ok(id)
    }

    /// Jobs are only visible to the user who queued them.
    pub fn get(&self, id: Uuid, owner: &str) -> Option<JobInfo> {
        self.with_statuses(|statuses| {
            statuses
                .get(&id)
                .filter(|entry| entry.owner == owner)
                .map(|entry| JobInfo {
                    id: id.to_string(),
                    state: entry.state.clone(),
                })
        })
        .ok()
        .flatten()
    }

    fn with_statuses<T>(
        &self,
        f: impl FnOnce(&mut HashMap<Uuid, JobEntry>) -> T,
    ) -> Result<T, ApiError> {
        let mut guard = self.statuses.lock().map_err(|_| ApiError {
            error: "job_table_unavailable".into(),
            detail: None,
        })?;
        Ok(f(&mut guard))
    }
}

fn finish(statuses: &Statuses, id: Uuid, state: JobState, retain: usize) {
    let Ok(mut guard) = statuses.lock() else {
        warn!(target = "appraisal.api", job_id = %id, "job_table_poisoned");
        return;
    };
    if let Some(entry) = guard.get_mut(&id) {
        entry.state = state;
        entry.finished_at = Some(Instant::now());
    }

    let mut done: Vec<(Instant, Uuid)> = guard
        .iter()
        .filter_map(|(id, entry)| entry.finished_at.map(|at| (at, *id)))
        .collect();
    if done.len() > retain {
        done.sort();
        let excess = done.len() - retain;
        for (_, old) in done.into_iter().take(excess) {
            guard.remove(&old);
        }
    }
}

fn retention_from_env() -> usize {
    std::env::var("JOB_RETENTION")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(1000)
}

fn queue_capacity_from_env() -> usize {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64)
}
