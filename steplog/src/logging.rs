//! Stderr diagnostics for the `steplog` binary.
//!
//! Nothing emitted here is evidence of what an execution did. The hash-chained
//! log under `wal_dir` is the only record recovery and replay trust, and it is
//! written regardless of the filter below. Diagnostics exist to explain a
//! decision after the fact:
//!
//! - `warn`: anything recovery or the executor refused or ignored, such as a
//!   torn final line, an integrity failure, a replay miss, or a workflow that
//!   does not match the committed steps.
//! - `info`: execution lifecycle, i.e. log opened, resumed, finalized or
//!   aborted, and the recovery decision for each execution.
//! - `debug`: per-step and per-request detail, including lock traffic, retry
//!   timing, and canonical request hashes.
//!
//! Each module logs under its own target, so one layer can be isolated, e.g.
//! `RUST_LOG=steplog::io::recovery=debug` for decisions only.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "warn";

/// Install the stderr subscriber for the CLI.
///
/// Filter comes from `RUST_LOG` and falls back to `warn`, which keeps
/// `steplog inspect` and `steplog diff` output clean on stdout while still
/// surfacing refusals.
///
/// ```bash
/// RUST_LOG=steplog::runtime=debug,steplog::io::wal_writer=info steplog recover e1
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
