//! CLI command modules.

pub mod files;
pub mod watch;
