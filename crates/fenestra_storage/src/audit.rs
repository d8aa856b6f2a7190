#![forbid(unsafe_code)]

use fenestra_kernel_contracts::audit::{ProgramAuditEventId, ProgramAuditEventInput};

use crate::program_store::{ProgramStore, StorageError};

/// Append-only writer into the store's `program_audit_events` ledger.
#[derive(Debug, Default)]
pub struct ProgramAuditRuntime;

impl ProgramAuditRuntime {
    pub fn emit(
        store: &mut ProgramStore,
        input: ProgramAuditEventInput,
    ) -> Result<ProgramAuditEventId, StorageError> {
        store.append_audit_event(input)
    }
}
