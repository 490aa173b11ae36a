pub mod call;
pub mod network;
pub mod reactor;
pub mod service;
pub mod utils;

pub use call::{CallId, Calls, Completion};
pub use reactor::{Dispatcher, ExitVote, Listener, Loginfo, Loop, Ready, Reschedule, TimerId};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, NetloggerConfig, Shutdown,
};
