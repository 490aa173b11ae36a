use tracing::{debug, error, info, warn};

use crate::AppError;

/// The loop's logger sink. Every component reports through it instead of
/// writing to the console, so an application can reroute all diagnostics at once.
pub trait Loginfo {
    /// An uncategorized message.
    fn out(&mut self, message: &str);
    /// A message filed under a category such as `DEBUG` or `ERROR`.
    fn err(&mut self, category: &str, message: &str);
    /// An error caught at the loop boundary.
    fn traceback(&mut self, error: &AppError);
}

/// Default sink, forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLog;

impl Loginfo for TracingLog {
    fn out(&mut self, message: &str) {
        info!("{}", message);
    }

    fn err(&mut self, category: &str, message: &str) {
        match category {
            "DEBUG" => debug!(category, "{}", message),
            "INFO" => info!(category, "{}", message),
            "ERROR" => error!(category, "{}", message),
            _ => warn!(category, "{}", message),
        }
    }

    fn traceback(&mut self, error: &AppError) {
        error!("{:?}", error);
    }
}
