//! Tracing initialization.
//!
//! Logs go to the systemd journal when netdata hands us a journal path, and
//! to stderr otherwise. `RUST_LOG` overrides the default filter.

use crate::netdata_env::NetdataEnv;
use tracing_subscriber::{EnvFilter, prelude::*};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogOutput {
    Journal,
    Stderr,
}

impl LogOutput {
    fn detect(env: &NetdataEnv) -> Self {
        if env.systemd_journal_path.is_some() {
            LogOutput::Journal
        } else {
            LogOutput::Stderr
        }
    }

    fn description(&self) -> &'static str {
        match self {
            LogOutput::Journal => "systemd journal",
            LogOutput::Stderr => "stderr",
        }
    }
}

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

fn stderr_layer<S>() -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_ansi(false)
}

pub fn init_tracing(default_filter: &str) {
    let mut output = LogOutput::detect(&NetdataEnv::from_environment());
    let registry = tracing_subscriber::registry().with(env_filter(default_filter));

    let mut journald_error = None;
    match output {
        LogOutput::Journal => match tracing_journald::layer() {
            Ok(journald_layer) => registry.with(journald_layer).init(),
            Err(err) => {
                journald_error = Some(err);
                output = LogOutput::Stderr;
                registry.with(stderr_layer()).init();
            }
        },
        LogOutput::Stderr => registry.with(stderr_layer()).init(),
    }

    if let Some(err) = journald_error {
        tracing::warn!("failed to connect to journald, falling back to stderr: {}", err);
    }
    tracing::info!(
        output = ?output,
        "tracing initialized, logging to {} with filter '{}'",
        output.description(),
        default_filter,
    );
}
