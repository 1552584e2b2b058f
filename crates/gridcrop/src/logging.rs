//! Tracing setup for the worker binary and embedding applications.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Level used for the `gridcrop` target when `RUST_LOG` is unset.
fn base_level(value: Option<&str>) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn filter_directive(level: &str) -> String {
    format!("gridcrop={level},gridcrop::bridge::codec=off")
}

/// Install a global subscriber writing to stderr.
///
/// `RUST_LOG` wins when set. Otherwise `GRIDCROP_LOG` picks the level.
/// `LOG_FORMAT=json` switches to JSON lines. Stdout is never used: in
/// subprocess mode it carries the response frames.
///
/// Does nothing if a subscriber is already installed.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = base_level(std::env::var("GRIDCROP_LOG").ok().as_deref());
        EnvFilter::new(filter_directive(level))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names() {
        assert_eq!(base_level(Some("debug")), "debug");
        assert_eq!(base_level(Some("warning")), "warn");
        assert_eq!(base_level(Some("loud")), "info");
        assert_eq!(base_level(None), "info");
    }

    #[test]
    fn directive_parses() {
        let directive = filter_directive("debug");
        assert_eq!(directive, "gridcrop=debug,gridcrop::bridge::codec=off");
        EnvFilter::try_new(directive).unwrap();
    }

    #[test]
    fn init_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
