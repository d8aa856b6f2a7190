#![forbid(unsafe_code)]

pub mod audit;
pub mod common;
pub mod progression;
pub mod project;
pub mod test_slot;

pub use common::{ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate};
