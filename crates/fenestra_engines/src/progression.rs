#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use fenestra_kernel_contracts::progression::{FinishDecision, FinishRequest};
use fenestra_kernel_contracts::project::ProjectId;
use fenestra_kernel_contracts::test_slot::{TestKind, TestSlotRecord};
use fenestra_kernel_contracts::{ContractViolation, ReasonCodeId, Validate};

pub mod reason_codes {
    use fenestra_kernel_contracts::ReasonCodeId;

    // Progression reason-code namespace.
    pub const PROGRESSION_OK_FINISH_ALLOWED: ReasonCodeId = ReasonCodeId(0x5047_0001);
    pub const PROGRESSION_ALREADY_FINISHED: ReasonCodeId = ReasonCodeId(0x5047_0002);
    pub const PROGRESSION_OUT_OF_ORDER_FINISH: ReasonCodeId = ReasonCodeId(0x5047_00F1);
}

pub fn reason_code_for(decision: FinishDecision) -> ReasonCodeId {
    match decision {
        FinishDecision::Allowed => reason_codes::PROGRESSION_OK_FINISH_ALLOWED,
        FinishDecision::AlreadyFinished => reason_codes::PROGRESSION_ALREADY_FINISHED,
        FinishDecision::OutOfOrder { .. } => reason_codes::PROGRESSION_OUT_OF_ORDER_FINISH,
    }
}

/// Enforces finish order within one (project, kind): slot `i` may finish only after every
/// slot below `i` has. Ordering spans both directions; static and cyclic tracks are independent.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressionGuard;

impl ProgressionGuard {
    pub fn new() -> Self {
        Self
    }

    /// Slots of other projects or kinds in `slots` are ignored. An earlier index with no slot
    /// at all blocks, same as an unfinished one.
    pub fn evaluate(
        &self,
        req: &FinishRequest,
        slots: &[TestSlotRecord],
    ) -> Result<FinishDecision, ContractViolation> {
        req.validate()?;

        let mut by_index: BTreeMap<u8, &TestSlotRecord> = BTreeMap::new();
        for slot in slots
            .iter()
            .filter(|s| s.project_id == req.project_id && s.kind == req.kind)
        {
            if by_index.insert(slot.index, slot).is_some() {
                return Err(ContractViolation::InvalidValue {
                    field: "progression_guard.slots",
                    reason: "unique (project, kind, index) violated",
                });
            }
        }

        if by_index
            .get(&req.target_index)
            .is_some_and(|target| target.finished)
        {
            return Ok(FinishDecision::AlreadyFinished);
        }

        for index in 0..req.target_index {
            match by_index.get(&index) {
                Some(slot) if slot.finished => {}
                _ => {
                    return Ok(FinishDecision::OutOfOrder {
                        blocking_index: index,
                    })
                }
            }
        }
        Ok(FinishDecision::Allowed)
    }

    pub fn can_finish(
        &self,
        kind: TestKind,
        project_id: ProjectId,
        target_index: u8,
        slots: &[TestSlotRecord],
    ) -> Result<bool, ContractViolation> {
        let req = FinishRequest::v1(project_id, kind, target_index)?;
        Ok(self.evaluate(&req, slots)?.is_allowed())
    }
}
