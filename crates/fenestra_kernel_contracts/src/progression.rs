#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::project::ProjectId;
use crate::test_slot::TestKind;
use crate::{ContractViolation, Validate};

/// Request to move one slot from Draft to Finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishRequest {
    pub project_id: ProjectId,
    pub kind: TestKind,
    pub target_index: u8,
}

impl FinishRequest {
    pub fn v1(
        project_id: ProjectId,
        kind: TestKind,
        target_index: u8,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            project_id,
            kind,
            target_index,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for FinishRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.project_id.validate()?;
        self.kind.check_index(self.target_index)
    }
}

/// Outcome of the progression check for one target slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum FinishDecision {
    Allowed,
    /// Target is already finished; re-finishing is a no-op.
    AlreadyFinished,
    /// The lowest earlier index that is not finished (or was never materialized).
    OutOfOrder { blocking_index: u8 },
}

impl FinishDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, FinishDecision::Allowed)
    }
}
