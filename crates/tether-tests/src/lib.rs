//! tether test and validation infrastructure
//!
//! A scripted remote host for driving the session layer without a network,
//! plus scenario and property-based tests that span both tether crates.

pub mod harness;
pub mod proptest_session;

pub use harness::{
    auth_error, network_error, not_found, password_config, refused_error, timeout_error,
    ScriptedRemote,
};
