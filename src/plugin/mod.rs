mod duration_manager;

pub use duration_manager::{CheckMode, DurationConnection, DurationError, DurationManager};
