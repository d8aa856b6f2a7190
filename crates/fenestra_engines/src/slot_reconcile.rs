#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use fenestra_kernel_contracts::project::{DesignPressures, ProjectId};
use fenestra_kernel_contracts::test_slot::{
    SlotParams, TestKind, TestSlotRecord, UpsertBatch, UpsertOp,
};
use fenestra_kernel_contracts::{ContractViolation, Validate};

use crate::cyclic_pressure::CyclicPressureRuntime;
use crate::static_pressure::{StaticDerivationConfig, StaticPressureRuntime};

pub mod reason_codes {
    use fenestra_kernel_contracts::ReasonCodeId;

    // Slot reconciliation reason-code namespace.
    pub const RECONCILE_OK_SLOT_CREATED: ReasonCodeId = ReasonCodeId(0x5253_0001);
    pub const RECONCILE_OK_SLOT_RECOMPUTED: ReasonCodeId = ReasonCodeId(0x5253_0002);
    pub const RECONCILE_OK_SLOT_OVERRIDDEN: ReasonCodeId = ReasonCodeId(0x5253_0003);
    pub const RECONCILE_OK_PROJECT_CREATED: ReasonCodeId = ReasonCodeId(0x5253_0004);
    pub const RECONCILE_OK_PROJECT_UPDATED: ReasonCodeId = ReasonCodeId(0x5253_0005);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub static_derivation: StaticDerivationConfig,
}

impl ReconcilerConfig {
    pub fn mvp_v1() -> Self {
        Self {
            static_derivation: StaticDerivationConfig::mvp_v1(),
        }
    }
}

/// Computes the upserts that bring a project's slots of one kind in line with its current
/// design pressures. Finished slots never receive an op.
#[derive(Debug, Clone)]
pub struct TestSlotReconciler {
    static_runtime: StaticPressureRuntime,
    cyclic_runtime: CyclicPressureRuntime,
}

impl TestSlotReconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            static_runtime: StaticPressureRuntime::new(config.static_derivation),
            cyclic_runtime: CyclicPressureRuntime::new(),
        }
    }

    /// Derived fields for one slot under the given design pressures.
    pub fn derive(
        &self,
        pressures: &DesignPressures,
        kind: TestKind,
        index: u8,
    ) -> Result<SlotParams, ContractViolation> {
        let position = kind.locate(index)?;
        let design_pressure = pressures.for_direction(position.direction);
        match kind {
            TestKind::Static => self
                .static_runtime
                .derive(design_pressure, index)
                .map(SlotParams::Static),
            TestKind::Cyclic => self
                .cyclic_runtime
                .derive(design_pressure, index)
                .map(SlotParams::Cyclic),
        }
    }

    /// `existing` maps slot index to the stored slot; an empty map yields one Create per index.
    pub fn reconcile(
        &self,
        project_id: ProjectId,
        pressures: &DesignPressures,
        kind: TestKind,
        existing: &BTreeMap<u8, TestSlotRecord>,
    ) -> Result<UpsertBatch, ContractViolation> {
        project_id.validate()?;
        pressures.validate()?;
        for (index, slot) in existing {
            if slot.index != *index || slot.kind != kind || slot.project_id != project_id {
                return Err(ContractViolation::InvalidValue {
                    field: "test_slot_reconciler.existing",
                    reason: "slot does not belong to this project, kind and index",
                });
            }
        }

        let mut ops = Vec::with_capacity(usize::from(kind.slot_count()));
        for index in kind.indices() {
            let params = self.derive(pressures, kind, index)?;
            match existing.get(&index) {
                None => ops.push(UpsertOp::Create {
                    index,
                    direction: kind.locate(index)?.direction,
                    params,
                }),
                Some(slot) if !slot.finished => ops.push(UpsertOp::UpdateDerivedFields {
                    slot_id: slot.slot_id,
                    index,
                    params,
                }),
                Some(_) => {}
            }
        }
        UpsertBatch::v1(project_id, kind, ops)
    }
}
