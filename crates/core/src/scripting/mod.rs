//! External-program operations.
//!
//! Process management is free of database access so it can be tested with
//! throwaway scripts.

pub mod command;
pub mod subprocess;
