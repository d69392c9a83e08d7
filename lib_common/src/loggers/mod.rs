/// Console and rolling-file `tracing` setup shared by every binary.
pub mod loggerlocal;

pub use loggerlocal::{setup_logging, LoggerLocalOptions};
