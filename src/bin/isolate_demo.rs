//! Reference binary: compiles and runs one C program through an acquired
//! box, end to end. Not part of the library's public surface — exists so
//! `language::CLanguage` and the acquisition/session seams have a concrete
//! caller, the way `judge`'s `main.rs` wires its own worker loop around the
//! same collaborators this crate reimplements. Requires the real `isolate`
//! binary and root/cgroups to do anything useful; run it manually, it is
//! not part of the test suite.

use std::time::Duration;

use anyhow::{Context, Result};
use isolate_core::acquisition::with_box;
use isolate_core::language::{CLanguage, LanguageSpec};
use isolate_core::session::{IsolatorSession, OptionSet};
use isolate_core::BoxId;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    dotenvy::dotenv().ok();

    let box_id: BoxId = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .map(BoxId)
        .unwrap_or(BoxId(0));

    let lang = CLanguage::default();
    let options = OptionSet::new().time(2.0).wall_time(5.0).mem(131_072);

    let outcome = with_box(box_id, Duration::from_secs(5), |box_id| {
        let lang = &lang;
        let options = options.clone();
        async move {
            if let Some(compile_cmd) = lang.compile_command() {
                let mut compile_session =
                    IsolatorSession::for_box(box_id, options.clone());
                compile_session.enter().await?;
                let compiled = compile_session
                    .run(compile_cmd, b"", &[], false)
                    .await?;
                compile_session.exit().await?;
                info!(
                    "compile: exit={} status={:?}",
                    compiled.exit_code, compiled.meta.status
                );
            }

            let mut run_session = IsolatorSession::for_box(box_id, options);
            run_session.enter().await?;
            let result = run_session
                .run(lang.execute_command(), b"", &[], false)
                .await?;
            run_session.exit().await?;
            Ok(result)
        }
    })
    .await
    .context("running demo program in box")?;

    info!(
        "run: exit={} status={:?} stdout={:?}",
        outcome.exit_code,
        outcome.meta.status,
        String::from_utf8_lossy(&outcome.stdout)
    );

    Ok(())
}
