#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::project::ProjectId;
use crate::test_slot::TestKind;
use crate::{ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate};

pub const PROGRAM_AUDIT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProgramAuditEventId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProgramAuditEventType {
    ProjectCreated,
    ProjectUpdated,
    SlotCreated,
    SlotRecomputed,
    SlotOverridden,
    SlotFinished,
    FinishRejected,
}

impl ProgramAuditEventType {
    fn is_slot_scoped(self) -> bool {
        !matches!(
            self,
            ProgramAuditEventType::ProjectCreated | ProgramAuditEventType::ProjectUpdated
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramAuditEventInput {
    pub schema_version: SchemaVersion,
    pub created_at: MonotonicTimeNs,
    pub project_id: ProjectId,
    pub event_type: ProgramAuditEventType,
    pub kind: Option<TestKind>,
    pub slot_index: Option<u8>,
    pub reason_code: ReasonCodeId,
    /// Optional key to detect duplicate emissions deterministically.
    pub idempotency_key: Option<String>,
}

impl ProgramAuditEventInput {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        created_at: MonotonicTimeNs,
        project_id: ProjectId,
        event_type: ProgramAuditEventType,
        kind: Option<TestKind>,
        slot_index: Option<u8>,
        reason_code: ReasonCodeId,
        idempotency_key: Option<String>,
    ) -> Result<Self, ContractViolation> {
        let e = Self {
            schema_version: PROGRAM_AUDIT_CONTRACT_VERSION,
            created_at,
            project_id,
            event_type,
            kind,
            slot_index,
            reason_code,
            idempotency_key,
        };
        e.validate()?;
        Ok(e)
    }
}

impl Validate for ProgramAuditEventInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PROGRAM_AUDIT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "program_audit_event_input.schema_version",
                reason: "must match PROGRAM_AUDIT_CONTRACT_VERSION",
            });
        }
        if self.created_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "program_audit_event_input.created_at",
                reason: "must be > 0",
            });
        }
        self.project_id.validate()?;
        if self.reason_code.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "program_audit_event_input.reason_code",
                reason: "must be > 0",
            });
        }
        match (self.event_type.is_slot_scoped(), self.kind, self.slot_index) {
            (true, Some(kind), Some(index)) => kind.check_index(index)?,
            (true, _, _) => {
                return Err(ContractViolation::InvalidValue {
                    field: "program_audit_event_input.slot_index",
                    reason: "slot events require kind and slot_index",
                });
            }
            (false, _, Some(_)) => {
                return Err(ContractViolation::InvalidValue {
                    field: "program_audit_event_input.slot_index",
                    reason: "must be None for project events",
                });
            }
            (false, _, None) => {}
        }
        if let Some(k) = &self.idempotency_key {
            if k.trim().is_empty() || k.len() > 128 {
                return Err(ContractViolation::InvalidValue {
                    field: "program_audit_event_input.idempotency_key",
                    reason: "must be 1..=128 chars when provided",
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramAuditEvent {
    pub schema_version: SchemaVersion,
    pub event_id: ProgramAuditEventId,
    pub created_at: MonotonicTimeNs,
    pub project_id: ProjectId,
    pub event_type: ProgramAuditEventType,
    pub kind: Option<TestKind>,
    pub slot_index: Option<u8>,
    pub reason_code: ReasonCodeId,
    pub idempotency_key: Option<String>,
}

impl ProgramAuditEvent {
    pub fn from_input_v1(
        event_id: ProgramAuditEventId,
        input: ProgramAuditEventInput,
    ) -> Result<Self, ContractViolation> {
        input.validate()?;
        if event_id.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "program_audit_event.event_id",
                reason: "must be > 0",
            });
        }
        Ok(Self {
            schema_version: PROGRAM_AUDIT_CONTRACT_VERSION,
            event_id,
            created_at: input.created_at,
            project_id: input.project_id,
            event_type: input.event_type,
            kind: input.kind,
            slot_index: input.slot_index,
            reason_code: input.reason_code,
            idempotency_key: input.idempotency_key,
        })
    }
}
