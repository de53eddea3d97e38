//! CLI command implementations.
//!
//! Each submodule implements one burrow subcommand, keeping formatting and
//! planning logic in pure functions separate from the IO.

pub mod attach;
pub mod init;
pub mod sandboxes;
pub mod setup;
pub mod up;
