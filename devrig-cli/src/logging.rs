//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! The `DEVRIG_LOG` environment variable (an `EnvFilter` directive string)
//! wins when set; otherwise `-v` selects debug over the info default.
//! Headless commands log to stderr; TUI sessions log to a file because
//! stderr writes would tear the alternate screen.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, EnvFilter};

pub fn init_stderr(verbose: bool) {
    fmt()
        .with_env_filter(filter(verbose))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

pub fn init_file(verbose: bool, path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("cannot open log file {}", path.display()))?;
    fmt()
        .with_env_filter(filter(verbose))
        .with_target(true)
        .with_ansi(false)
        .with_writer(Arc::new(file))
        .init();
    Ok(())
}

fn filter(verbose: bool) -> EnvFilter {
    let fallback = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_env("DEVRIG_LOG").unwrap_or_else(|_| EnvFilter::new(fallback))
}
