//! Log setup for the `secpipe` binary.
//!
//! Pipeline events go to stderr; stdout is reserved for command output such
//! as `secpipe plan` and `secpipe config`. `SECPIPE_LOG` (or `RUST_LOG`)
//! takes filter directives. Without either, the CLI level applies and the
//! HTTP stack used by the Slack notifier is held at `warn`.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding secpipe's log filter directives.
pub const LOG_ENV: &str = "SECPIPE_LOG";

const QUIET_DEPENDENCIES: &[&str] = &["hyper=warn", "hyper_util=warn", "reqwest=warn", "rustls=warn"];

/// Filter directives for `level`, unless `configured` already names some.
fn filter_directives(configured: Option<String>, level: Level) -> String {
    match configured.filter(|d| !d.trim().is_empty()) {
        Some(directives) => directives,
        None => std::iter::once(level.as_str().to_ascii_lowercase())
            .chain(QUIET_DEPENDENCIES.iter().map(|d| d.to_string()))
            .collect::<Vec<_>>()
            .join(","),
    }
}

/// Install the global subscriber. `json` switches to newline-delimited JSON
/// lines. Only the first call in a process takes effect.
pub fn init_tracing(json: bool, level: Level) {
    let configured = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV))
        .ok();
    let directives = filter_directives(configured, level);
    let filter = EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        eprintln!("secpipe: ignoring log filter '{directives}': {e}");
        EnvFilter::new(level.as_str())
    });

    let (plain, json) = if json {
        let layer = fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .json();
        (None, Some(layer))
    } else {
        let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
        (Some(layer), None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .try_init()
        .ok();
}
