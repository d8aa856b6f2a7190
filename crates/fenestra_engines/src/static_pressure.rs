#![forbid(unsafe_code)]

use fenestra_kernel_contracts::test_slot::{
    PressureDirection, StaticTestParams, TestKind, STRUCTURAL_PRESSURE_LABEL,
};
use fenestra_kernel_contracts::ContractViolation;

/// Hold time for every static structural test, in seconds.
pub const STATIC_TEST_DURATION_SECS: u32 = 30;

// Indexed by position within the direction. Inward climbs from 75% to 150% of the design
// load; outward starts at 150% and steps down.
const INWARD_PRESSURE_FACTORS: [f64; 3] = [0.75, 1.0, 1.5];
const OUTWARD_PRESSURE_FACTORS: [f64; 3] = [1.5, 1.0, 0.75];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticDerivationConfig {
    pub pressure_factor_label: &'static str,
}

impl StaticDerivationConfig {
    pub fn mvp_v1() -> Self {
        Self {
            pressure_factor_label: STRUCTURAL_PRESSURE_LABEL,
        }
    }
}

/// Pure `(design pressure, slot index) -> (pressure, duration)`.
pub fn static_pressure(design_pressure: f64, index: u8) -> Result<(f64, u32), ContractViolation> {
    let position = TestKind::Static.locate(index)?;
    let factors = match position.direction {
        PressureDirection::Inward => &INWARD_PRESSURE_FACTORS,
        PressureDirection::Outward => &OUTWARD_PRESSURE_FACTORS,
    };
    Ok((
        design_pressure * factors[position.position],
        STATIC_TEST_DURATION_SECS,
    ))
}

#[derive(Debug, Clone)]
pub struct StaticPressureRuntime {
    config: StaticDerivationConfig,
}

impl StaticPressureRuntime {
    pub fn new(config: StaticDerivationConfig) -> Self {
        Self { config }
    }

    pub fn derive(
        &self,
        design_pressure: f64,
        index: u8,
    ) -> Result<StaticTestParams, ContractViolation> {
        let (pressure, duration) = static_pressure(design_pressure, index)?;
        StaticTestParams::v1(
            pressure,
            duration,
            self.config.pressure_factor_label.to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn at_static_01_inward_slots_climb_from_three_quarters_to_one_and_a_half() {
        assert_eq!(static_pressure(100.0, 0).unwrap(), (75.0, 30));
        assert_eq!(static_pressure(100.0, 1).unwrap(), (100.0, 30));
        assert_eq!(static_pressure(100.0, 2).unwrap(), (150.0, 30));
    }

    #[test]
    fn at_static_02_outward_slots_mirror_the_inward_sequence() {
        assert_eq!(static_pressure(100.0, 3).unwrap(), (150.0, 30));
        assert_eq!(static_pressure(100.0, 4).unwrap(), (100.0, 30));
        assert_eq!(static_pressure(100.0, 5).unwrap(), (75.0, 30));
    }

    #[test]
    fn at_static_03_index_outside_range_is_invalid_index() {
        assert!(matches!(
            static_pressure(100.0, 6),
            Err(ContractViolation::InvalidIndex {
                field: "static_test.index",
                index: 6,
                max: 5
            })
        ));
    }

    #[test]
    fn at_static_04_runtime_labels_params_with_configured_factor() {
        let rt = StaticPressureRuntime::new(StaticDerivationConfig::mvp_v1());
        let params = rt.derive(200.0, 3).unwrap();
        assert_eq!(params.pressure, 300.0);
        assert_eq!(params.duration, STATIC_TEST_DURATION_SECS);
        assert_eq!(params.pressure_factor, "Structural Pressure");
    }

    #[test]
    fn at_static_05_runtime_rejects_non_positive_design_pressure() {
        let rt = StaticPressureRuntime::new(StaticDerivationConfig::mvp_v1());
        assert!(rt.derive(0.0, 0).is_err());
    }

    proptest! {
        #[test]
        fn prop_static_duration_is_always_thirty(p in 0.1f64..10_000.0, index in 0u8..6) {
            let (_, duration) = static_pressure(p, index).unwrap();
            prop_assert_eq!(duration, 30);
        }

        #[test]
        fn prop_static_pressure_scales_linearly(p in 0.1f64..10_000.0, index in 0u8..6) {
            let (one, _) = static_pressure(1.0, index).unwrap();
            let (scaled, _) = static_pressure(p, index).unwrap();
            prop_assert!((scaled - one * p).abs() <= 1e-9 * p.max(1.0));
        }
    }
}
