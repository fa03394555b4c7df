//! Library half of the `telco` binary: argument parsing, command dispatch and
//! the result envelope printed for every command.

pub mod cli;
pub mod commands;
pub mod error;
pub mod logging;
pub mod output;
