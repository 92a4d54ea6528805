pub mod circuit_breaker;
pub mod config;
pub mod errors;
pub mod logging;

pub use circuit_breaker::*;
pub use config::*;
pub use errors::*;
pub use logging::{init_logging, LogLevel};
