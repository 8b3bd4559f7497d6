//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod debug;
pub(crate) mod load;
pub(crate) mod ports;
