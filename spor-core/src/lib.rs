// vim: tw=80
//! Crash-consistency verification for block storage services
//!
//! Writes distinguishable patterns to a storage service's volumes, kills the
//! service without a clean shutdown, brings it back up, and checks that every
//! acknowledged write survived byte for byte.

pub mod blockio;
pub mod gateway;
pub mod injector;
pub mod pattern;
pub mod process;
pub mod recorder;
pub mod registry;
pub mod scenario;
pub mod sim;
pub mod types;
pub mod verifier;
pub mod waiter;
pub mod writer;

pub use crate::types::*;
