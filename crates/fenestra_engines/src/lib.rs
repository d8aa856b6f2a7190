#![forbid(unsafe_code)]

pub mod cyclic_pressure;
pub mod progression;
pub mod slot_reconcile;
pub mod static_pressure;
