use serdeconv;
use sloggers::{Config, LoggerConfig};
use std::path::Path;

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds the default root logger: terminal output on stderr at debug level.
pub fn init() -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_str(DEFAULT_CONFIG).expect("Error parsing default logging configuration");

    config.build_logger().expect("Error building default logger")
}

/// Builds the root logger from a logging configuration file.
pub fn init_from_file<P: AsRef<Path>>(path: P) -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_file(path).expect("Error loading logging configuration file");

    config.build_logger().expect("Error building logger")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_default() {
        let _ = init();
    }
}
