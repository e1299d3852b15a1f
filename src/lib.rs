//! # winux-connect
//!
//! Headless Winux Connect daemon: configuration loading, tracing setup,
//! dependency wiring and the run loop. Protocol logic lives in the `wc-*`
//! member crates.

pub mod adapters;
pub mod bootstrap;
