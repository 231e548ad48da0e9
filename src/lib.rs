pub mod actors;
pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod log;
pub mod orchestration;
pub mod report;
pub mod util;

pub use error::{Error, ErrorKind, Result};
pub use report::{BatchReport, ProgressCounts, TaskReport};
