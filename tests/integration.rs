#![cfg(feature = "integration")]

//! End-to-end scenarios (§8 S1-S7) against the real `isolate` binary.
//!
//! Gated behind the `integration` feature, mirroring `terror-isolate`'s own
//! feature gate in this same retrieval pack: these need root and cgroups,
//! which a normal `cargo test` run doesn't have, so they're opt-in.

use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use isolate_core::acquisition::{acquire_box, with_box};
use isolate_core::meta::MetaStatus;
use isolate_core::session::{IsolatorSession, OptionSet};
use isolate_core::BoxId;

/// S1: acquire box 0, run `echo 42`, expect a clean OK with the expected
/// stdout and an empty box directory once the lease closes.
#[tokio::test]
async fn s1_hello_explicit() {
    let result = with_box(BoxId(0), Duration::from_secs(5), |box_id| async move {
        let mut session = IsolatorSession::for_box(box_id, OptionSet::new());
        session.enter().await?;
        let outcome = session
            .run(&["/bin/echo".to_string(), "42".to_string()], b"", &[], false)
            .await?;
        session.exit().await?;
        Ok(outcome)
    })
    .await
    .expect("hello world run should succeed");

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, b"42\n");
    assert_eq!(result.meta.status, MetaStatus::Ok);
}

/// S2: two acquisitions race for the same box within 100ms; the first holds
/// it for 3s, the second gives up after a 1s timeout and sees `BoxBusy`.
#[tokio::test]
async fn s2_concurrent_same_box_one_is_busy() {
    let box_id = BoxId(0);

    let first = tokio::spawn(async move {
        with_box(box_id, Duration::from_secs(5), |box_id| async move {
            let mut session = IsolatorSession::for_box(box_id, OptionSet::new());
            session.enter().await?;
            let outcome = session
                .run(
                    &[
                        "/bin/sh".to_string(),
                        "-c".to_string(),
                        "sleep 3; echo A".to_string(),
                    ],
                    b"",
                    &[],
                    false,
                )
                .await?;
            session.exit().await?;
            Ok(outcome)
        })
        .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    // Second acquisition should observe BoxBusy while the first holds the box.
    let second = acquire_box(box_id, Duration::from_secs(1)).await;
    assert_matches!(second, Err(isolate_core::IsolateError::BoxBusy { .. }));

    let first_result = first.await.unwrap().expect("first run should succeed");
    assert_eq!(first_result.stdout, b"A\n");
}

/// S3: acquisitions on distinct boxes proceed fully in parallel — two 2s
/// sleeps should finish in well under 4s total.
#[tokio::test]
async fn s3_concurrent_distinct_boxes_run_in_parallel() {
    let start = Instant::now();

    let run = |box_id: BoxId| async move {
        with_box(box_id, Duration::from_secs(5), |box_id| async move {
            let mut session = IsolatorSession::for_box(box_id, OptionSet::new());
            session.enter().await?;
            let outcome = session
                .run(
                    &["/bin/sleep".to_string(), "2".to_string()],
                    b"",
                    &[],
                    false,
                )
                .await?;
            session.exit().await?;
            Ok::<_, isolate_core::IsolateError>(outcome)
        })
        .await
    };

    let (a, b) = tokio::join!(run(BoxId(0)), run(BoxId(1)));
    a.expect("box 0 run should succeed");
    b.expect("box 1 run should succeed");

    assert!(
        start.elapsed() < Duration::from_secs(3),
        "independent boxes should not serialize"
    );
}

/// S4: a program that allocates well beyond a 16 MiB cgroup memory limit
/// should be killed by the cgroup OOM killer.
#[tokio::test]
async fn s4_out_of_memory() {
    let result = with_box(BoxId(0), Duration::from_secs(5), |box_id| async move {
        let options = OptionSet::new().mem(16 * 1024).time(5.0).wall_time(10.0);
        let mut session = IsolatorSession::for_box(box_id, options);
        session.enter().await?;
        let outcome = session
            .run(
                &[
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    "python3 -c \"a = bytearray(256 * 1024 * 1024)\"".to_string(),
                ],
                b"",
                &[],
                false,
            )
            .await?;
        session.exit().await?;
        Ok(outcome)
    })
    .await
    .expect("oom run should complete (not error) with a meta status");

    assert_eq!(result.meta.status, MetaStatus::OutOfMemory);
    assert!(result.meta.cg_oom_killed);
}

/// S5: `sleep 10` under `time=0.5, wall_time=1` should time out.
#[tokio::test]
async fn s5_timeout() {
    let result = with_box(BoxId(0), Duration::from_secs(5), |box_id| async move {
        let options = OptionSet::new().time(0.5).wall_time(1.0);
        let mut session = IsolatorSession::for_box(box_id, options);
        session.enter().await?;
        let outcome = session
            .run(&["/bin/sleep".to_string(), "10".to_string()], b"", &[], false)
            .await?;
        session.exit().await?;
        Ok(outcome)
    })
    .await
    .expect("timeout run should complete (not error) with a meta status");

    assert_eq!(result.meta.status, MetaStatus::TimedOut);
}

/// S6/S7: init-retry behavior is exercised by
/// `acquisition::tests::init_retry_recovers_from_a_single_failure` and
/// `acquisition::tests::init_retry_exhaustion_releases_the_lock` instead of
/// here. Both drive `acquire_box_with_driver` against a `FakeIsolateDriver`
/// that fails a chosen number of `--init` calls before succeeding, so the
/// retry-then-give-up branch (acquisition.rs) is actually covered rather
/// than just reviewed by eye — injecting a real `isolate --init` failure
/// deterministically would require root access to corrupt cgroup state
/// mid-test, which this feature-gated suite intentionally avoids needing.
