use metrics::{
    log_counter,
    log_counter_with_labels,
    log_distribution,
    log_gauge,
    register_backfill_counter,
    register_backfill_gauge,
    register_backfill_histogram,
    Timer,
};

register_backfill_counter!(BACKFILL_ROWS_ADDED_TOTAL, "Rows written by backfill workers");
pub fn log_rows_added(added: u64) {
    log_counter(&BACKFILL_ROWS_ADDED_TOTAL, added);
}

register_backfill_counter!(
    BACKFILL_TASKS_FINISHED_TOTAL,
    "Backfill range tasks finished, by status",
    &["status"]
);
pub fn log_task_finished(success: bool) {
    let status = if success { "ok" } else { "err" };
    log_counter_with_labels(&BACKFILL_TASKS_FINISHED_TOTAL, 1, &[status]);
}

register_backfill_gauge!(BACKFILL_WORKER_TOTAL, "Current number of backfill workers");
pub fn log_worker_count(count: usize) {
    log_gauge(&BACKFILL_WORKER_TOTAL, count as i64);
}

register_backfill_histogram!(
    BACKFILL_BATCH_ROWS,
    "Rows scanned by one transactional batch"
);
pub fn log_batch_rows(scanned: u64) {
    log_distribution(&BACKFILL_BATCH_ROWS, scanned as f64);
}

register_backfill_histogram!(
    BACKFILL_BATCH_SECONDS,
    "Time to process one transactional batch"
);
pub fn batch_timer() -> Timer {
    Timer::new(&BACKFILL_BATCH_SECONDS)
}

register_backfill_histogram!(BACKFILL_TASK_SECONDS, "Time to backfill one range task");
pub fn task_timer() -> Timer {
    Timer::new(&BACKFILL_TASK_SECONDS)
}

register_backfill_histogram!(
    BACKFILL_TABLE_SECONDS,
    "Time to backfill one physical table"
);
pub fn backfill_timer() -> Timer {
    Timer::new(&BACKFILL_TABLE_SECONDS)
}
