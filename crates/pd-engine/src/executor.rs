use std::future::Future;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Run `tasks` in parallel with at most `limit` running at once.
///
/// A fixed-size pool pulls tasks from the queue: one slot is refilled
/// per completion, so no more than `limit` tasks ever run together.
/// The first task failure wins: scheduling stops, `cancel` is cancelled
/// so in-flight tasks can observe it at their next suspension point,
/// and errors after the first are discarded. Returns once every started
/// task has settled. Side effects of tasks that completed before the
/// failure are left in place.
///
/// Tasks must be independent and not share mutable state.
pub async fn run_all<F, E>(tasks: Vec<F>, limit: usize, cancel: &CancellationToken) -> Result<(), E>
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Send + 'static,
{
    let limit = limit.max(1);
    let mut queue = tasks.into_iter();
    let mut set: JoinSet<Result<(), E>> = JoinSet::new();
    let mut first_error: Option<E> = None;

    loop {
        while first_error.is_none() && set.len() < limit {
            match queue.next() {
                Some(task) => {
                    set.spawn(task);
                }
                None => break,
            }
        }

        match set.join_next().await {
            Some(joined) => {
                let result = joined.expect("reconcile task panicked");

                if first_error.is_none()
                    && let Err(e) = result
                {
                    cancel.cancel();
                    first_error = Some(e);
                }
            }
            // Pool drained and nothing left to schedule.
            None => break,
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    type BoxedTask = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

    #[tokio::test]
    async fn never_exceeds_the_concurrency_limit() {
        let limit = 3;
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), String>(())
                }
            })
            .collect();

        let cancel = CancellationToken::new();
        run_all(tasks, limit, &cancel).await.unwrap();

        assert!(peak.load(Ordering::SeqCst) <= limit);
    }

    #[tokio::test]
    async fn first_error_wins_and_cancels_in_flight_tasks() {
        let cancel = CancellationToken::new();
        let late_work_done = Arc::new(AtomicBool::new(false));

        let watcher: BoxedTask = {
            let cancel = cancel.clone();
            let late_work_done = Arc::clone(&late_work_done);
            Box::pin(async move {
                tokio::select! {
                    _ = cancel.cancelled() => Ok(()),
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {
                        late_work_done.store(true, Ordering::SeqCst);
                        Err("watcher timed out".to_string())
                    }
                }
            })
        };

        let failing: BoxedTask = Box::pin(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Err("boom".to_string())
        });

        let err = run_all(vec![watcher, failing], 2, &cancel)
            .await
            .unwrap_err();

        assert_eq!(err, "boom");
        assert!(!late_work_done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn completed_side_effects_survive_a_later_failure() {
        let cancel = CancellationToken::new();
        let first_done = Arc::new(AtomicBool::new(false));

        let succeeding: BoxedTask = {
            let first_done = Arc::clone(&first_done);
            Box::pin(async move {
                first_done.store(true, Ordering::SeqCst);
                Ok(())
            })
        };

        let failing: BoxedTask = {
            let first_done = Arc::clone(&first_done);
            Box::pin(async move {
                // Fail only after the sibling's side effect landed.
                while !first_done.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Err("boom".to_string())
            })
        };

        let err = run_all(vec![succeeding, failing], 2, &cancel)
            .await
            .unwrap_err();

        assert_eq!(err, "boom");
        assert!(first_done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn queued_tasks_are_not_scheduled_after_a_failure() {
        let cancel = CancellationToken::new();
        let started = Arc::new(AtomicUsize::new(0));

        let mut tasks: Vec<BoxedTask> = vec![Box::pin(async { Err("boom".to_string()) })];
        for _ in 0..10 {
            let started = Arc::clone(&started);
            tasks.push(Box::pin(async move {
                started.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }

        let err = run_all(tasks, 1, &cancel).await.unwrap_err();

        assert_eq!(err, "boom");
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_task_list_is_a_noop() {
        let cancel = CancellationToken::new();
        let result: Result<(), String> = run_all(Vec::<BoxedTask>::new(), 3, &cancel).await;
        assert!(result.is_ok());
    }
}
