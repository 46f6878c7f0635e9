//! Utilities for testing code that uses the reliable transport. They are used for testing the
//!  crate itself, but they are also exported for application testing, which is why they are
//!  part of the crate's regular (non-#[cfg(test)]) code.

pub mod fault_injector;
pub mod arq_pair;
pub mod lossy_link;
pub mod tracking_transport;
