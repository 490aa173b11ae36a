pub use app_error::{AppError, AppResult};
pub use self::config::{
    NetlogConfig, NetloggerConfig, NetworkConfig, ReactorConfig, DEFAULT_BUFFER_SIZE,
    DEFAULT_CONCURRENCY, DEFAULT_PRECISION_MS, MIN_PRECISION_MS,
};
pub use netlog::{Netlog, NetlogChannel, NetlogPeer, TRACEBACK};
pub use netlogger::{open_output, LogEntryWriter, LogSink, Netlogger};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod config;
mod netlog;
mod netlogger;
mod shutdown;
mod tracing_config;
