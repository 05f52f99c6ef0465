//! Logging bootstrap.
//!
//! The subscriber is a process-lifetime service constructed once at startup.
//! Behavior is selected through the environment:
//!
//! - `BROKER_DEBUG_VERBOSE`: truthy values raise the default level to debug.
//! - `BROKER_DEBUG_LEVEL`: explicit level (trace/debug/info/warn/error),
//!   wins over the verbose switch.
//! - `BROKER_DEBUG_COMPONENT_FILTER`: comma-separated tracing targets; when
//!   present, only those components log at the selected level and everything
//!   else is limited to warnings.

use std::env;
use tracing_subscriber::EnvFilter;

const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Install the global tracing subscriber. Safe to call more than once; later
/// calls are no-ops.
pub fn init() {
    let level = selected_level();
    let filter = match env::var("BROKER_DEBUG_COMPONENT_FILTER") {
        Ok(components) if !components.trim().is_empty() => {
            let mut filter = EnvFilter::new("warn");
            for component in components.split(',').map(str::trim).filter(|c| !c.is_empty()) {
                if let Ok(directive) = format!("{component}={level}").parse() {
                    filter = filter.add_directive(directive);
                }
            }
            filter
        },
        _ => EnvFilter::new(&level),
    };
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init();
}

fn selected_level() -> String {
    if let Ok(level) = env::var("BROKER_DEBUG_LEVEL") {
        let level = level.to_ascii_lowercase();
        if LEVELS.contains(&level.as_str()) {
            return level;
        }
    }
    match env::var("BROKER_DEBUG_VERBOSE") {
        Ok(value) if is_truthy(&value) => "debug".to_string(),
        _ => "info".to_string(),
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthy_values() {
        assert!(is_truthy("1"));
        assert!(is_truthy("TRUE"));
        assert!(is_truthy("on"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy(""));
    }
}
