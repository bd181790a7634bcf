//! Box acquisition scope
//!
//! Grounded on the teacher's `IsolateBox::new`/`cleanup` pair (see
//! `sandbox::isolate_box::IsolateBox`), which does cleanup-then-init-then-run-
//! then-cleanup but without any cross-request mutual exclusion or init retry.
//! This module adds exactly those two things: a per-box `tokio::sync::Mutex`
//! lease (via [`crate::registry::BoxRegistry`]) and a single init retry, and
//! restates the "always cleanup" part as an explicit scope function rather
//! than a plain destructor, since Rust has no async `Drop`.

use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tracing::warn;

use crate::config::get_config;
use crate::error::IsolateError;
use crate::process::{IsolateProcessDriver, ProcessDriver};
use crate::registry::BoxRegistry;
use crate::BoxId;

/// Default bound on how long a caller waits to acquire a box before giving
/// up with [`IsolateError::BoxBusy`].
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// A held lease on one box. Owns the locked per-box mutex guard; dropping it
/// without calling [`BoxLease::close`] still releases the mutex (guard Drop
/// is synchronous and infallible) and schedules a best-effort detached
/// cleanup of the box — `close()` remains the documented, expected way to
/// end a lease (it cleans up *before* returning and lets the caller observe
/// a cleanup failure if they care to), but a cancelled task must not leave
/// the box dirty forever with nothing even attempting to tidy it up.
pub struct BoxLease {
    box_id: BoxId,
    guard: Option<OwnedMutexGuard<()>>,
    box_path: std::path::PathBuf,
    closed: bool,
}

impl BoxLease {
    /// The box this lease owns.
    pub fn box_id(&self) -> BoxId {
        self.box_id
    }

    /// Working directory for this box's files (`<box_root>/<id>/box`),
    /// computed from configuration — never consulted from the isolator,
    /// since explicit-mode acquisition already knows its own box id.
    pub fn work_dir(&self) -> &std::path::Path {
        &self.box_path
    }

    /// Ends the lease: runs terminal cleanup (logged and swallowed on
    /// failure — it must never mask the caller's real outcome) and releases
    /// the mutex. Safe to call at most once; a second call is a no-op.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(e) = cleanup_box(&IsolateProcessDriver, self.box_id).await {
            warn!("terminal cleanup of box {} failed: {e}", self.box_id);
        }
        // Dropping the guard releases the mutex. Taking it out of the
        // Option makes that explicit and lets Drop observe it's gone.
        self.guard.take();
    }
}

impl Drop for BoxLease {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let Some(guard) = self.guard.take() else {
            return;
        };

        let box_id = self.box_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    "BoxLease for box {box_id} dropped without close(); scheduling detached cleanup"
                );
                // Hold the guard until the detached cleanup finishes, so a
                // new acquisition of this box can't race the fallback
                // cleanup the way it would if we released the lock up front.
                handle.spawn(async move {
                    if let Err(e) = cleanup_box(&IsolateProcessDriver, box_id).await {
                        warn!("detached cleanup of box {box_id} failed: {e}");
                    }
                    drop(guard);
                });
            }
            Err(_) => {
                // No runtime left to spawn onto (e.g. process shutdown) —
                // nothing we can do but say so. The guard drops here instead,
                // releasing the lock immediately without the cleanup call.
                warn!(
                    "BoxLease for box {box_id} dropped without close() and no runtime is \
                     available to schedule cleanup on; box may be left dirty"
                );
            }
        }
    }
}

async fn cleanup_box(driver: &dyn ProcessDriver, box_id: BoxId) -> Result<(), IsolateError> {
    let output = driver
        .communicate(
            &[
                "--box-id".to_string(),
                box_id.to_string(),
                "--cg".to_string(),
                "--cleanup".to_string(),
            ],
            b"",
        )
        .await?;

    if output.exit_code != 0 {
        return Err(IsolateError::CleanupFailure {
            box_id,
            reason: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

async fn init_box(driver: &dyn ProcessDriver, box_id: BoxId) -> Result<(), IsolateError> {
    let output = driver
        .communicate(
            &[
                "--box-id".to_string(),
                box_id.to_string(),
                "--cg".to_string(),
                "--init".to_string(),
            ],
            b"",
        )
        .await?;

    if output.exit_code != 0 {
        return Err(IsolateError::BoxUnavailable {
            box_id,
            reason: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

/// Acquires exclusive access to `box_id`, bounded by `timeout`.
///
/// Steps (§4.4): lock the per-box mutex (timeout -> [`IsolateError::BoxBusy`],
/// no lock held on that path); best-effort pre-cleanup; init with one retry
/// on failure (exhausted -> [`IsolateError::BoxUnavailable`], but the lock is
/// still released via terminal cleanup before returning). On success, returns
/// a [`BoxLease`] the caller must eventually [`BoxLease::close`].
pub async fn acquire_box(box_id: BoxId, timeout: Duration) -> Result<BoxLease, IsolateError> {
    acquire_box_with_driver(&IsolateProcessDriver, box_id, timeout).await
}

/// Same as [`acquire_box`], but against a caller-supplied [`ProcessDriver`]
/// instead of the real `isolate` binary — the seam that lets the init-retry
/// path (lines below) be covered by a unit test without root/cgroups.
async fn acquire_box_with_driver(
    driver: &dyn ProcessDriver,
    box_id: BoxId,
    timeout: Duration,
) -> Result<BoxLease, IsolateError> {
    let mutex = BoxRegistry::global().get_lock(box_id);

    let guard = match tokio::time::timeout(timeout, mutex.lock_owned()).await {
        Ok(guard) => guard,
        Err(_) => return Err(IsolateError::BoxBusy { box_id }),
    };

    // Pre-cleanup: the box may not exist yet (first-ever acquisition) or may
    // be dirty from a process that died mid-request. Either way, ignore the
    // result.
    let _ = cleanup_box(driver, box_id).await;

    if let Err(first_err) = init_box(driver, box_id).await {
        warn!("init of box {box_id} failed ({first_err}), retrying once");
        let _ = cleanup_box(driver, box_id).await;
        if let Err(second_err) = init_box(driver, box_id).await {
            // Terminal cleanup still runs and the lock still releases, even
            // though we're failing — errors must never leak a lock.
            let _ = cleanup_box(driver, box_id).await;
            drop(guard);
            return Err(IsolateError::BoxUnavailable {
                box_id,
                reason: format!("init failed twice: {second_err}"),
            });
        }
    }

    let box_path = get_config().work_dir(box_id);

    Ok(BoxLease {
        box_id,
        guard: Some(guard),
        box_path,
        closed: false,
    })
}

/// Convenience wrapper around [`acquire_box`] that always runs [`BoxLease::close`]
/// for the caller, on every exit path of `body` (including an early `?`).
///
/// This is the primary entry point a request handler should use; `BoxLease`
/// itself is exposed for callers (and tests) that need finer control over
/// when the lease ends.
pub async fn with_box<T, F, Fut>(
    box_id: BoxId,
    timeout: Duration,
    body: F,
) -> Result<T, IsolateError>
where
    F: FnOnce(BoxId) -> Fut,
    Fut: std::future::Future<Output = Result<T, IsolateError>>,
{
    let mut lease = acquire_box(box_id, timeout).await?;
    let result = body(lease.box_id()).await;
    lease.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// `BoxBusy` must not release a lock it never acquired: a holder that
    /// grabs the mutex directly (bypassing `acquire_box`'s isolate calls,
    /// since no real `isolate` binary is present in the unit-test sandbox)
    /// keeps exclusive access while a concurrent low-timeout acquisition
    /// times out, and releasing afterwards still succeeds exactly once.
    #[tokio::test]
    async fn busy_timeout_does_not_release_the_holders_lock() {
        let registry = BoxRegistry::global();
        let box_id = BoxId(9001);
        let mutex = registry.get_lock(box_id);
        let holder_guard = mutex.clone().lock_owned().await;

        let attempts = Arc::new(AtomicUsize::new(0));
        let contender_mutex = mutex.clone();
        let attempts_clone = attempts.clone();
        let contender = tokio::spawn(async move {
            let res = tokio::time::timeout(
                Duration::from_millis(50),
                contender_mutex.lock_owned(),
            )
            .await;
            attempts_clone.fetch_add(1, Ordering::SeqCst);
            res.is_err()
        });

        let timed_out = contender.await.unwrap();
        assert!(timed_out, "contender should have seen the box as busy");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        // Holder's own release still succeeds exactly once.
        drop(holder_guard);
        let reacquired =
            tokio::time::timeout(Duration::from_millis(50), mutex.lock_owned()).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn independent_boxes_do_not_contend() {
        let registry = BoxRegistry::global();
        let a = registry.get_lock(BoxId(9101));
        let b = registry.get_lock(BoxId(9102));

        let start = tokio::time::Instant::now();
        let (ra, rb) = tokio::join!(
            async {
                let _g = a.lock_owned().await;
                tokio::time::sleep(Duration::from_millis(120)).await;
            },
            async {
                let _g = b.lock_owned().await;
                tokio::time::sleep(Duration::from_millis(120)).await;
            }
        );
        let _ = (ra, rb);
        assert!(start.elapsed() < Duration::from_millis(220));
    }

    /// Fakes the isolator binary for the init-retry path (§4.4 step 4):
    /// `--cleanup` always "succeeds"; the first `fail_first_n` `--init`
    /// calls fail, every one after that succeeds. Lets S6/S7 be asserted
    /// deterministically against `acquire_box_with_driver` without a real
    /// `isolate` install.
    struct FakeIsolateDriver {
        fail_first_n: usize,
        init_calls: AtomicUsize,
        cleanup_calls: AtomicUsize,
    }

    impl FakeIsolateDriver {
        fn new(fail_first_n: usize) -> Self {
            Self {
                fail_first_n,
                init_calls: AtomicUsize::new(0),
                cleanup_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl crate::process::ProcessDriver for FakeIsolateDriver {
        async fn communicate(
            &self,
            argv: &[String],
            _stdin_bytes: &[u8],
        ) -> Result<crate::process::ProcessOutput, IsolateError> {
            if argv.iter().any(|a| a == "--cleanup") {
                self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
                return Ok(crate::process::ProcessOutput {
                    exit_code: 0,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                });
            }

            if argv.iter().any(|a| a == "--init") {
                let call = self.init_calls.fetch_add(1, Ordering::SeqCst);
                if call < self.fail_first_n {
                    return Ok(crate::process::ProcessOutput {
                        exit_code: 1,
                        stdout: Vec::new(),
                        stderr: b"init failed".to_vec(),
                    });
                }
                return Ok(crate::process::ProcessOutput {
                    exit_code: 0,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                });
            }

            unreachable!("FakeIsolateDriver only expects --cleanup/--init calls, got {argv:?}");
        }
    }

    /// S6: the first `--init` fails, the retry succeeds — acquisition
    /// succeeds overall and both init attempts are observed.
    #[tokio::test]
    async fn init_retry_recovers_from_a_single_failure() {
        let driver = FakeIsolateDriver::new(1);
        let box_id = BoxId(9201);

        let lease = acquire_box_with_driver(&driver, box_id, Duration::from_secs(1))
            .await
            .expect("acquisition should succeed after one init retry");

        assert_eq!(lease.box_id(), box_id);
        assert_eq!(driver.init_calls.load(Ordering::SeqCst), 2);
        // Pre-cleanup, then one more cleanup before the retry.
        assert_eq!(driver.cleanup_calls.load(Ordering::SeqCst), 2);
    }

    /// S7: both the initial `--init` and the retry fail — acquisition fails
    /// with `BoxUnavailable`, and the lock is released (a fresh acquisition
    /// against the same box id can proceed immediately afterward).
    #[tokio::test]
    async fn init_retry_exhaustion_releases_the_lock() {
        let driver = FakeIsolateDriver::new(2);
        let box_id = BoxId(9202);

        let result = acquire_box_with_driver(&driver, box_id, Duration::from_secs(1)).await;
        assert_matches::assert_matches!(result, Err(IsolateError::BoxUnavailable { .. }));
        assert_eq!(driver.init_calls.load(Ordering::SeqCst), 2);
        // Pre-cleanup, one before the retry, and one terminal cleanup on failure.
        assert_eq!(driver.cleanup_calls.load(Ordering::SeqCst), 3);

        // Lock safety: the failed acquisition must not have left the mutex
        // held, so a fresh attempt (even with a working driver) proceeds.
        let recovering_driver = FakeIsolateDriver::new(0);
        let retried = acquire_box_with_driver(&recovering_driver, box_id, Duration::from_millis(200))
            .await;
        assert!(retried.is_ok(), "the lock must have been released on failure");
    }
}
