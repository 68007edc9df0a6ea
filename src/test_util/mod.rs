//! Utilities for testing code based on multicast groups. They are used for testing the protocol
//!  itself, but they are also exported for application testing.
//!
//! [group::TestGroup] runs several protocol instances against each other in-process, without a
//!  transport or a runtime, with full control over time, frame loss and member failures.

pub mod group;
pub mod message;
pub mod node;
pub mod transport;
