//! Shared test scaffolding: a scriptable in-memory device and fixtures.

mod fake_device;
mod fixtures;

pub use fake_device::*;
pub use fixtures::*;
