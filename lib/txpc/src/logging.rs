pub use slog::*;

use sloggers::{Config, LoggerConfig};

/// Build a terminal logger with the default settings. Useful for binaries
/// that have no logging section in their configuration.
pub fn init() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Error parsing built-in logger config");

    config.build_logger().expect("Error building logger")
}

/// Build a logger from a deserialized `sloggers` configuration section.
pub fn from_config(config: &LoggerConfig) -> sloggers::Result<Logger> {
    config.build_logger()
}
