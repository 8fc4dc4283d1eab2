//! A set of utilities to enable logging configuration using tracing_subscriber.

use std::{error::Error, io::IsTerminal, sync::Once};

use tracing_subscriber::{EnvFilter, filter::LevelFilter};

static OBT_LOG_ENV_VAR: &str = "OBT_LOG";

/// Initializes a tracing subscriber for logging.
///
/// Every line carries a timestamp. Workspace crates log at the level in `OBT_LOG` (default
/// `info`) unless `RUST_LOG` names them explicitly; everything else logs errors only.
pub fn init() {
    // Since we also use this function to enable logging in tests, wrap it in `Once` to prevent
    // multiple initializations.
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let (env_filter, obt_log_level) = env_filter_and_log_level();

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_ansi(std::io::stderr().is_terminal())
            .init();

        tracing::info!("log level: {}", obt_log_level);
    });
}

/// Renders the chain of `source()` errors below `err`, outermost first.
///
/// Returns an empty string when the error has no source. Meant for the `error_source` log field
/// next to `error = %err`, which only shows the top-level message.
pub fn error_source(err: &(dyn Error + 'static)) -> String {
    let mut chain = Vec::new();
    let mut current = err.source();
    while let Some(source) = current {
        chain.push(source.to_string());
        current = source.source();
    }
    chain.join(" -> ")
}

/// List of crates in the workspace.
const OBT_CRATES: &[&str] = &["monitoring", "obt_builder"];

fn env_filter_and_log_level() -> (EnvFilter, String) {
    let directive_string = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();
    let log_level = std::env::var(OBT_LOG_ENV_VAR).unwrap_or_else(|_| "info".to_string());

    // Unparseable directives are dropped rather than aborting start-up.
    let mut env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::ERROR.into())
        .parse_lossy(&directive_string);

    for crate_name in OBT_CRATES {
        // Add directives for each crate in OBT_CRATES, if not overriden by RUST_LOG
        if directive_string.contains(&format!("{crate_name}=")) {
            continue;
        }
        match format!("{crate_name}={log_level}").parse() {
            Ok(directive) => env_filter = env_filter.add_directive(directive),
            Err(err) => eprintln!("ignoring invalid {OBT_LOG_ENV_VAR} value '{log_level}': {err}"),
        }
    }

    (env_filter, log_level)
}
