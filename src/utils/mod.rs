//! Helpers shared by the dripline binaries.

pub mod bootstrap;
