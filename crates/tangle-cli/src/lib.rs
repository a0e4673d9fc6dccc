//! Tangle CLI library: command implementations shared by the `tangle`
//! binary and its integration tests.

pub mod commands;
