use std::time::Duration;

/// A worker whose entire job is to sleep for `duration` then return. Used
/// wherever an otherwise-blocking sleep must stay interruptible: the owner
/// spawns this as a child and, to interrupt it, aborts the task rather
/// than waiting it out. It never answers parent verbs of its own; its
/// channel pair exists only so it is bookkept like any other child in the
/// broker (so `list_processes`/liveness polling see it uniformly).
pub async fn run(duration: Duration) {
    tokio::time::sleep(duration).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn sleeps_for_roughly_the_requested_duration() {
        let start = Instant::now();
        run(Duration::from_millis(20)).await;
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn aborting_the_task_ends_the_sleep_early() {
        let handle = tokio::spawn(run(Duration::from_secs(30)));
        handle.abort();
        let result = handle.await;
        assert!(result.unwrap_err().is_cancelled());
    }
}
