//! Command implementations for the Kiln CLI.

pub mod deploy;
pub mod history;
pub mod status;
pub mod train;
