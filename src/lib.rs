//! Receipt synchronization and printing.
//!
//! Polls a remote point-of-sale API for pending receipts, prints each one at
//! most once per distinct content, and keeps a local copy of what was printed
//! so later cycles can tell new, unchanged and edited receipts apart.

pub mod catalog;
pub mod config;
pub mod cycle;
pub mod dedup;
pub mod events;
pub mod markup;
pub mod model;
pub mod printer;
pub mod store;
pub mod sweeper;
pub mod transport;
