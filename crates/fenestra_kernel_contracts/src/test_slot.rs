#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::common::{validate_label, validate_non_negative_finite, validate_positive_finite};
use crate::project::ProjectId;
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const TEST_SLOT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const STATIC_TEST_SLOT_COUNT: u8 = 6;
pub const CYCLIC_TEST_SLOT_COUNT: u8 = 8;

pub const STRUCTURAL_PRESSURE_LABEL: &str = "Structural Pressure";

const MAX_PRESSURE_FACTOR_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    Static,
    Cyclic,
}

impl TestKind {
    pub const ALL: [TestKind; 2] = [TestKind::Static, TestKind::Cyclic];

    pub const fn slot_count(self) -> u8 {
        match self {
            TestKind::Static => STATIC_TEST_SLOT_COUNT,
            TestKind::Cyclic => CYCLIC_TEST_SLOT_COUNT,
        }
    }

    /// Slots per direction; the first half of the range is inward, the second outward.
    pub const fn slots_per_direction(self) -> u8 {
        self.slot_count() / 2
    }

    pub fn indices(self) -> Range<u8> {
        0..self.slot_count()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TestKind::Static => "static",
            TestKind::Cyclic => "cyclic",
        }
    }

    pub fn check_index(self, index: u8) -> Result<(), ContractViolation> {
        if index >= self.slot_count() {
            return Err(ContractViolation::InvalidIndex {
                field: match self {
                    TestKind::Static => "static_test.index",
                    TestKind::Cyclic => "cyclic_test.index",
                },
                index,
                max: self.slot_count() - 1,
            });
        }
        Ok(())
    }

    /// Splits a kind-wide index into its direction and the position inside that direction.
    pub fn locate(self, index: u8) -> Result<SlotPosition, ContractViolation> {
        self.check_index(index)?;
        let half = self.slots_per_direction();
        let (direction, position) = if index < half {
            (PressureDirection::Inward, index)
        } else {
            (PressureDirection::Outward, index - half)
        };
        Ok(SlotPosition {
            direction,
            position: usize::from(position),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureDirection {
    Inward,
    Outward,
}

impl PressureDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            PressureDirection::Inward => "inward",
            PressureDirection::Outward => "outward",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPosition {
    pub direction: PressureDirection,
    pub position: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TestSlotId(pub u64);

impl Validate for TestSlotId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "test_slot_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticTestParams {
    pub pressure: f64,
    pub duration: u32,
    pub pressure_factor: String,
}

impl StaticTestParams {
    pub fn v1(
        pressure: f64,
        duration: u32,
        pressure_factor: String,
    ) -> Result<Self, ContractViolation> {
        let p = Self {
            pressure,
            duration,
            pressure_factor,
        };
        p.validate()?;
        Ok(p)
    }
}

impl Validate for StaticTestParams {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_positive_finite("static_test_params.pressure", self.pressure)?;
        if self.duration == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "static_test_params.duration",
                reason: "must be > 0",
            });
        }
        validate_label(
            "static_test_params.pressure_factor",
            &self.pressure_factor,
            MAX_PRESSURE_FACTOR_LEN,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CyclicTestParams {
    pub high_pressure: f64,
    pub low_pressure: f64,
    pub cycles: u32,
}

impl CyclicTestParams {
    pub fn v1(
        high_pressure: f64,
        low_pressure: f64,
        cycles: u32,
    ) -> Result<Self, ContractViolation> {
        let p = Self {
            high_pressure,
            low_pressure,
            cycles,
        };
        p.validate()?;
        Ok(p)
    }
}

impl Validate for CyclicTestParams {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_positive_finite("cyclic_test_params.high_pressure", self.high_pressure)?;
        // The low end of a cycle may legitimately be zero.
        validate_non_negative_finite("cyclic_test_params.low_pressure", self.low_pressure)?;
        if self.low_pressure > self.high_pressure {
            return Err(ContractViolation::InvalidValue {
                field: "cyclic_test_params.low_pressure",
                reason: "must be <= high_pressure",
            });
        }
        if self.cycles == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "cyclic_test_params.cycles",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SlotParams {
    Static(StaticTestParams),
    Cyclic(CyclicTestParams),
}

impl SlotParams {
    pub fn kind(&self) -> TestKind {
        match self {
            SlotParams::Static(_) => TestKind::Static,
            SlotParams::Cyclic(_) => TestKind::Cyclic,
        }
    }

    pub fn as_static(&self) -> Option<&StaticTestParams> {
        match self {
            SlotParams::Static(p) => Some(p),
            SlotParams::Cyclic(_) => None,
        }
    }

    pub fn as_cyclic(&self) -> Option<&CyclicTestParams> {
        match self {
            SlotParams::Cyclic(p) => Some(p),
            SlotParams::Static(_) => None,
        }
    }
}

impl Validate for SlotParams {
    fn validate(&self) -> Result<(), ContractViolation> {
        match self {
            SlotParams::Static(p) => p.validate(),
            SlotParams::Cyclic(p) => p.validate(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotLifecycleState {
    Draft,
    Finished,
}

/// One scheduled test instance at a fixed index within a project and kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSlotRecord {
    pub schema_version: SchemaVersion,
    pub slot_id: TestSlotId,
    pub project_id: ProjectId,
    pub kind: TestKind,
    pub index: u8,
    pub direction: PressureDirection,
    pub finished: bool,
    pub finished_at: Option<MonotonicTimeNs>,
    pub params: SlotParams,
}

impl TestSlotRecord {
    /// Builds a fresh Draft slot; direction is derived from `kind` and `index`.
    pub fn draft_v1(
        slot_id: TestSlotId,
        project_id: ProjectId,
        kind: TestKind,
        index: u8,
        params: SlotParams,
    ) -> Result<Self, ContractViolation> {
        let position = kind.locate(index)?;
        let r = Self {
            schema_version: TEST_SLOT_CONTRACT_VERSION,
            slot_id,
            project_id,
            kind,
            index,
            direction: position.direction,
            finished: false,
            finished_at: None,
            params,
        };
        r.validate()?;
        Ok(r)
    }

    pub fn state(&self) -> SlotLifecycleState {
        if self.finished {
            SlotLifecycleState::Finished
        } else {
            SlotLifecycleState::Draft
        }
    }

    /// Draft -> Finished. There is no transition out of Finished.
    pub fn finish_v1(&self, finished_at: MonotonicTimeNs) -> Result<Self, ContractViolation> {
        if self.finished {
            return Err(ContractViolation::InvalidValue {
                field: "test_slot_record.finished",
                reason: "slot is already finished",
            });
        }
        let r = Self {
            finished: true,
            finished_at: Some(finished_at),
            ..self.clone()
        };
        r.validate()?;
        Ok(r)
    }

    /// Replaces derived fields; refused once the slot is finished.
    pub fn with_params_v1(&self, params: SlotParams) -> Result<Self, ContractViolation> {
        if self.finished {
            return Err(ContractViolation::InvalidValue {
                field: "test_slot_record.params",
                reason: "derived fields are frozen once finished",
            });
        }
        let r = Self {
            params,
            ..self.clone()
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for TestSlotRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != TEST_SLOT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "test_slot_record.schema_version",
                reason: "must match TEST_SLOT_CONTRACT_VERSION",
            });
        }
        self.slot_id.validate()?;
        self.project_id.validate()?;
        let position = self.kind.locate(self.index)?;
        if position.direction != self.direction {
            return Err(ContractViolation::InvalidValue {
                field: "test_slot_record.direction",
                reason: "must match the direction implied by index",
            });
        }
        if self.params.kind() != self.kind {
            return Err(ContractViolation::InvalidValue {
                field: "test_slot_record.params",
                reason: "params kind must match slot kind",
            });
        }
        self.params.validate()?;
        match (self.finished, self.finished_at) {
            (true, Some(t)) if t.0 > 0 => Ok(()),
            (true, _) => Err(ContractViolation::InvalidValue {
                field: "test_slot_record.finished_at",
                reason: "required (> 0) when finished",
            }),
            (false, None) => Ok(()),
            (false, Some(_)) => Err(ContractViolation::InvalidValue {
                field: "test_slot_record.finished_at",
                reason: "must be None while draft",
            }),
        }
    }
}

/// Storage instruction produced by reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum UpsertOp {
    Create {
        index: u8,
        direction: PressureDirection,
        params: SlotParams,
    },
    UpdateDerivedFields {
        slot_id: TestSlotId,
        index: u8,
        params: SlotParams,
    },
}

impl UpsertOp {
    pub fn index(&self) -> u8 {
        match self {
            UpsertOp::Create { index, .. } | UpsertOp::UpdateDerivedFields { index, .. } => *index,
        }
    }

    pub fn params(&self) -> &SlotParams {
        match self {
            UpsertOp::Create { params, .. } | UpsertOp::UpdateDerivedFields { params, .. } => {
                params
            }
        }
    }
}

/// All upserts for one (project, kind), applied atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertBatch {
    pub schema_version: SchemaVersion,
    pub project_id: ProjectId,
    pub kind: TestKind,
    pub ops: Vec<UpsertOp>,
}

impl UpsertBatch {
    pub fn v1(
        project_id: ProjectId,
        kind: TestKind,
        ops: Vec<UpsertOp>,
    ) -> Result<Self, ContractViolation> {
        let b = Self {
            schema_version: TEST_SLOT_CONTRACT_VERSION,
            project_id,
            kind,
            ops,
        };
        b.validate()?;
        Ok(b)
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl Validate for UpsertBatch {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != TEST_SLOT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "upsert_batch.schema_version",
                reason: "must match TEST_SLOT_CONTRACT_VERSION",
            });
        }
        self.project_id.validate()?;
        let mut seen = BTreeSet::new();
        for op in &self.ops {
            let position = self.kind.locate(op.index())?;
            if !seen.insert(op.index()) {
                return Err(ContractViolation::InvalidValue {
                    field: "upsert_batch.ops",
                    reason: "at most one op per index",
                });
            }
            if op.params().kind() != self.kind {
                return Err(ContractViolation::InvalidValue {
                    field: "upsert_batch.ops.params",
                    reason: "params kind must match batch kind",
                });
            }
            op.params().validate()?;
            match op {
                UpsertOp::Create { direction, .. } => {
                    if *direction != position.direction {
                        return Err(ContractViolation::InvalidValue {
                            field: "upsert_batch.ops.direction",
                            reason: "must match the direction implied by index",
                        });
                    }
                }
                UpsertOp::UpdateDerivedFields { slot_id, .. } => slot_id.validate()?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_params(pressure: f64) -> SlotParams {
        SlotParams::Static(
            StaticTestParams::v1(pressure, 30, STRUCTURAL_PRESSURE_LABEL.to_string()).unwrap(),
        )
    }

    #[test]
    fn at_slot_contract_01_locate_splits_range_by_direction() {
        let first_outward = TestKind::Static.locate(3).unwrap();
        assert_eq!(first_outward.direction, PressureDirection::Outward);
        assert_eq!(first_outward.position, 0);

        let last_inward = TestKind::Cyclic.locate(3).unwrap();
        assert_eq!(last_inward.direction, PressureDirection::Inward);
        assert_eq!(last_inward.position, 3);

        assert!(matches!(
            TestKind::Static.locate(6),
            Err(ContractViolation::InvalidIndex { index: 6, max: 5, .. })
        ));
        assert!(matches!(
            TestKind::Cyclic.locate(8),
            Err(ContractViolation::InvalidIndex { index: 8, max: 7, .. })
        ));
    }

    #[test]
    fn at_slot_contract_02_params_kind_must_match_slot_kind() {
        let cyclic = SlotParams::Cyclic(CyclicTestParams::v1(10.0, 3.0, 50).unwrap());
        let out = TestSlotRecord::draft_v1(TestSlotId(1), ProjectId(1), TestKind::Static, 0, cyclic);
        assert!(matches!(
            out,
            Err(ContractViolation::InvalidValue {
                field: "test_slot_record.params",
                ..
            })
        ));
    }

    #[test]
    fn at_slot_contract_03_finished_slot_is_frozen() {
        let slot = TestSlotRecord::draft_v1(
            TestSlotId(1),
            ProjectId(1),
            TestKind::Static,
            0,
            static_params(75.0),
        )
        .unwrap();
        assert_eq!(slot.state(), SlotLifecycleState::Draft);

        let finished = slot.finish_v1(MonotonicTimeNs(5)).unwrap();
        assert_eq!(finished.state(), SlotLifecycleState::Finished);
        assert!(finished.finish_v1(MonotonicTimeNs(6)).is_err());
        assert!(finished.with_params_v1(static_params(90.0)).is_err());
    }

    #[test]
    fn at_slot_contract_04_cyclic_low_pressure_may_be_zero_but_not_above_high() {
        assert!(CyclicTestParams::v1(120.0, 0.0, 600).is_ok());
        assert!(CyclicTestParams::v1(120.0, 130.0, 600).is_err());
        assert!(CyclicTestParams::v1(120.0, 10.0, 0).is_err());
    }

    #[test]
    fn at_slot_contract_05_batch_rejects_duplicate_indices_and_wrong_direction() {
        let dup = UpsertBatch::v1(
            ProjectId(1),
            TestKind::Static,
            vec![
                UpsertOp::Create {
                    index: 0,
                    direction: PressureDirection::Inward,
                    params: static_params(75.0),
                },
                UpsertOp::UpdateDerivedFields {
                    slot_id: TestSlotId(4),
                    index: 0,
                    params: static_params(75.0),
                },
            ],
        );
        assert!(matches!(
            dup,
            Err(ContractViolation::InvalidValue {
                field: "upsert_batch.ops",
                ..
            })
        ));

        let wrong_direction = UpsertBatch::v1(
            ProjectId(1),
            TestKind::Static,
            vec![UpsertOp::Create {
                index: 4,
                direction: PressureDirection::Inward,
                params: static_params(100.0),
            }],
        );
        assert!(wrong_direction.is_err());
    }
}
