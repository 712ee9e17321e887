use tracing::trace;

// Trace-based counters; the Prometheus recorder only serves what is exported.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "appraisal.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target = "appraisal.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

pub fn image_outcome(outcome: &'static str) {
    trace!(
        target = "appraisal.metrics",
        outcome = outcome,
        "images_total_inc"
    );
}
