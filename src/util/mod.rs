//! Helpers shared by the backup and monitor jobs.

pub mod duration;
pub mod log_file;
pub mod process;
pub mod retention;

#[cfg(all(test, unix))]
pub(crate) mod testing;
