#![forbid(unsafe_code)]

pub mod audit;
pub mod program_store;
pub mod repo;
