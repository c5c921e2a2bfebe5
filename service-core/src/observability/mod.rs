pub mod logging;

pub use logging::{LogFileConfig, LogFormat, LogHandle, LoggingOptions, init_tracing};
