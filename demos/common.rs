#![allow(dead_code)]

use palisade::PivotRoot;
use std::path::Path;

/// Host directories a typical dynamically-linked program needs to start.
const SYSTEM_DIRS: &[&str] = &["/usr", "/bin", "/sbin", "/lib", "/lib32", "/lib64", "/etc"];

pub fn configure_logging() {
    // Show the child's setup messages, which are forwarded at debug level.
    let default_verbosity = tracing_subscriber::filter::LevelFilter::DEBUG;
    let env_filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_verbosity.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_timer(tracing_subscriber::fmt::time::Uptime::default())
        .with_span_events(
            tracing_subscriber::fmt::format::FmtSpan::CLOSE
                | tracing_subscriber::fmt::format::FmtSpan::NEW,
        )
        .with_target(false)
        .init();
}

/// Bind the host's system directories into the new root, skipping any that don't exist.
pub fn with_system_dirs(mut pivot: PivotRoot) -> eyre::Result<PivotRoot> {
    for dir in SYSTEM_DIRS {
        if Path::new(dir).exists() {
            pivot = pivot.mount(dir, dir)?;
        }
    }
    Ok(pivot)
}
