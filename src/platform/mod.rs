/// Filesystem helpers shared by the stores and config loading
pub mod common;
