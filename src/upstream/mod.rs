//! Upstream Module
//!
//! Mirrors an accepted command on the real repository host.

pub mod client;

pub use client::SshUpstream;
