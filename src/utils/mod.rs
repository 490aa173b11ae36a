pub use timeouts::{TimeoutCallback, Timeouts};

mod timeouts;
