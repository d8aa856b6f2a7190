#![forbid(unsafe_code)]

use fenestra_kernel_contracts::test_slot::{CyclicTestParams, PressureDirection, TestKind};
use fenestra_kernel_contracts::ContractViolation;

#[derive(Debug, Clone, Copy, PartialEq)]
struct CycleFactors {
    high: f64,
    low: f64,
}

const fn factors(high: f64, low: f64) -> CycleFactors {
    CycleFactors { high, low }
}

// Indexed by position within the direction.
const INWARD_FACTORS: [CycleFactors; 4] = [
    factors(0.5, 0.2),
    factors(0.6, 0.0),
    factors(0.8, 0.5),
    factors(1.0, 0.3),
];
const OUTWARD_FACTORS: [CycleFactors; 4] = [
    factors(1.0, 0.3),
    factors(0.8, 0.5),
    factors(0.6, 0.0),
    factors(0.5, 0.2),
];

/// Cycle counts by kind-wide slot index (not folded by direction).
pub const CYCLE_COUNTS: [u32; 8] = [3500, 300, 600, 100, 50, 1050, 50, 3050];

/// Pure `(design pressure, slot index) -> (high pressure, low pressure, cycles)`.
pub fn cyclic_pressure(
    design_pressure: f64,
    index: u8,
) -> Result<(f64, f64, u32), ContractViolation> {
    let position = TestKind::Cyclic.locate(index)?;
    let row = match position.direction {
        PressureDirection::Inward => INWARD_FACTORS[position.position],
        PressureDirection::Outward => OUTWARD_FACTORS[position.position],
    };
    Ok((
        design_pressure * row.high,
        design_pressure * row.low,
        CYCLE_COUNTS[usize::from(index)],
    ))
}

#[derive(Debug, Clone, Default)]
pub struct CyclicPressureRuntime;

impl CyclicPressureRuntime {
    pub fn new() -> Self {
        Self
    }

    pub fn derive(
        &self,
        design_pressure: f64,
        index: u8,
    ) -> Result<CyclicTestParams, ContractViolation> {
        let (high, low, cycles) = cyclic_pressure(design_pressure, index)?;
        CyclicTestParams::v1(high, low, cycles)
    }
}
