#![forbid(unsafe_code)]

pub mod program;
pub mod snapshot;
