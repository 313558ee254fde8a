use std::env;
use std::io;

use tracing::{info, subscriber::set_global_default};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};

/// Initialize structured JSON logging to stderr.
///
/// The level comes from the `LOG_LEVEL` environment variable
/// (`trace|debug|info|warn|error`); anything unset or unrecognized falls
/// back to `debug`. Idempotent in practice: subsequent calls fail inside
/// `set_global_default` and are ignored.
pub fn init() {
  let filter = EnvFilter::new(level_from_env());

  let json_layer = fmt::layer()
    .with_timer(ChronoUtc::rfc_3339())
    .json()
    .with_level(true)
    .with_target(false)
    .with_thread_ids(false)
    .with_thread_names(false)
    .with_writer(io::stderr);

  let subscriber = Registry::default().with(filter).with(json_layer);

  // Ignore error if already set
  let _ = set_global_default(subscriber);

  info!(event = "logging_initialized", level = level_from_env(), "logging initialized");
}

fn level_from_env() -> &'static str {
  parse_level(env::var("LOG_LEVEL").ok().as_deref())
}

fn parse_level(value: Option<&str>) -> &'static str {
  match value {
    Some("trace") => "trace",
    Some("debug") => "debug",
    Some("info") => "info",
    Some("warn") => "warn",
    Some("error") => "error",
    _ => "debug",
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn known_levels_pass_through() {
    for lvl in ["trace", "debug", "info", "warn", "error"] {
      assert_eq!(parse_level(Some(lvl)), lvl);
    }
  }

  #[test]
  fn unknown_level_falls_back_to_debug() {
    assert_eq!(parse_level(None), "debug");
    assert_eq!(parse_level(Some("verbose")), "debug");
    assert_eq!(parse_level(Some("INFO")), "debug");
  }
}
