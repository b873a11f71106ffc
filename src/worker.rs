use crate::error::{PipelineError, Result};
use crate::family::FamilyFailure;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Aggregated outcome of a fan-out stage after the barrier: every unit
/// either produced an output or a recorded failure.
#[derive(Debug)]
pub struct PoolOutcome<O> {
    pub ok: Vec<O>,
    pub failures: Vec<FamilyFailure>,
}

/// Fan units of work out to a bounded pool and wait at the barrier.
///
/// Each unit runs as its own task gated by a semaphore sized to the
/// configured worker count. Failures are isolated per unit; in strict mode
/// the first failure trips the cancellation token so queued units bail out
/// before invoking anything, and the stage fails after the barrier.
pub async fn run_pool<I, O, F, Fut>(
    units: Vec<(String, I)>,
    workers: usize,
    strict: bool,
    cancel: CancellationToken,
    work: F,
) -> Result<PoolOutcome<O>>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = std::result::Result<O, FamilyFailure>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks = Vec::with_capacity(units.len());

    for (unit_id, input) in units {
        let semaphore = semaphore.clone();
        let cancel = cancel.clone();
        let work = work.clone();
        tasks.push(tokio::spawn(async move {
            // The semaphore is never closed while tasks are live.
            let _permit = semaphore.acquire().await.expect("pool semaphore closed");
            if cancel.is_cancelled() {
                return Err(FamilyFailure {
                    unit: unit_id,
                    tool: String::new(),
                    message: "cancelled before start".to_string(),
                    transient: false,
                });
            }
            let result = work(input).await;
            if let Err(failure) = &result {
                if strict {
                    cancel.cancel();
                }
                warn!(
                    "{}: {} ({})",
                    failure.unit,
                    failure.message,
                    if failure.transient { "transient" } else { "fatal" }
                );
            }
            result
        }));
    }

    let mut outcome = PoolOutcome {
        ok: Vec::new(),
        failures: Vec::new(),
    };
    for task in futures::future::join_all(tasks).await {
        match task {
            Ok(Ok(output)) => outcome.ok.push(output),
            Ok(Err(failure)) => outcome.failures.push(failure),
            Err(join_err) => {
                error!("worker panicked: {join_err}");
                outcome.failures.push(FamilyFailure {
                    unit: "<unknown>".to_string(),
                    tool: String::new(),
                    message: format!("worker panicked: {join_err}"),
                    transient: false,
                });
            }
        }
    }

    if strict {
        if let Some(first) = outcome
            .failures
            .iter()
            .find(|f| f.message != "cancelled before start")
        {
            return Err(PipelineError::FamilyProcessing {
                family: first.unit.clone(),
                tool: first.tool.clone(),
                message: first.message.clone(),
                transient: first.transient,
            });
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn failure(unit: &str) -> FamilyFailure {
        FamilyFailure {
            unit: unit.to_string(),
            tool: "mock".to_string(),
            message: "boom".to_string(),
            transient: false,
        }
    }

    #[tokio::test]
    async fn test_all_units_complete() {
        let units: Vec<(String, usize)> =
            (0..20).map(|i| (format!("FAM{i:06}"), i)).collect();
        let outcome = run_pool(
            units,
            4,
            false,
            CancellationToken::new(),
            |i| async move { Ok::<_, FamilyFailure>(i * 2) },
        )
        .await
        .unwrap();

        assert_eq!(outcome.ok.len(), 20);
        assert!(outcome.failures.is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let units: Vec<(String, usize)> =
            (0..10).map(|i| (format!("FAM{i:06}"), i)).collect();
        let outcome = run_pool(
            units,
            2,
            false,
            CancellationToken::new(),
            |i| async move {
                if i % 2 == 0 {
                    Ok(i)
                } else {
                    Err(failure(&format!("FAM{i:06}")))
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.ok.len(), 5);
        assert_eq!(outcome.failures.len(), 5);
    }

    #[tokio::test]
    async fn test_strict_mode_aborts_stage() {
        let units: Vec<(String, usize)> =
            (0..50).map(|i| (format!("FAM{i:06}"), i)).collect();
        let err = run_pool(
            units,
            1,
            true,
            CancellationToken::new(),
            |i| async move {
                if i == 0 {
                    Err(failure("FAM000000"))
                } else {
                    Ok(i)
                }
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::FamilyProcessing { family, .. } if family == "FAM000000"
        ));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        static RUNNING: AtomicUsize = AtomicUsize::new(0);
        static PEAK: AtomicUsize = AtomicUsize::new(0);

        let units: Vec<(String, usize)> =
            (0..30).map(|i| (format!("FAM{i:06}"), i)).collect();
        run_pool(units, 3, false, CancellationToken::new(), |_| async {
            let now = RUNNING.fetch_add(1, Ordering::SeqCst) + 1;
            PEAK.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            RUNNING.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, FamilyFailure>(())
        })
        .await
        .unwrap();

        assert!(PEAK.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_cancelled_units_do_not_run() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let units: Vec<(String, usize)> = (0..5).map(|i| (format!("U{i}"), i)).collect();
        let outcome = run_pool(units, 2, false, cancel, |i| async move {
            Ok::<_, FamilyFailure>(i)
        })
        .await
        .unwrap();

        assert!(outcome.ok.is_empty());
        assert_eq!(outcome.failures.len(), 5);
    }
}
