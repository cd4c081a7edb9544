//! Ambient services shared by hosts and tests

pub mod tracing_setup;
