#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use fenestra_kernel_contracts::audit::{
    ProgramAuditEvent, ProgramAuditEventId, ProgramAuditEventInput,
};
use fenestra_kernel_contracts::project::{
    DeviceId, DeviceRecord, ProjectId, ProjectInput, ProjectRecord,
};
use fenestra_kernel_contracts::test_slot::{
    SlotParams, TestKind, TestSlotId, TestSlotRecord, UpsertBatch,
};
use fenestra_kernel_contracts::MonotonicTimeNs;

use crate::program_store::{FinishOutcome, ProgramStore, StorageError};

/// Typed repository interface for device and project rows.
pub trait DeviceProjectRepo {
    fn insert_device_row(
        &mut self,
        name: String,
        now: MonotonicTimeNs,
    ) -> Result<DeviceId, StorageError>;
    fn device_row(&self, device_id: DeviceId) -> Option<&DeviceRecord>;
    fn device_rows(&self) -> Vec<&DeviceRecord>;

    fn insert_project_row(
        &mut self,
        device_id: DeviceId,
        input: ProjectInput,
        now: MonotonicTimeNs,
    ) -> Result<ProjectId, StorageError>;
    fn update_project_row(
        &mut self,
        project_id: ProjectId,
        input: ProjectInput,
        now: MonotonicTimeNs,
    ) -> Result<(), StorageError>;
    fn load_project(&self, project_id: ProjectId) -> Result<&ProjectRecord, StorageError>;
    fn project_rows_for_device(
        &self,
        device_id: DeviceId,
    ) -> Result<Vec<&ProjectRecord>, StorageError>;
}

/// Typed repository interface for test slot persistence.
pub trait TestSlotRepo {
    fn load_slots(
        &self,
        project_id: ProjectId,
        kind: TestKind,
    ) -> Result<BTreeMap<u8, TestSlotRecord>, StorageError>;
    fn load_slots_ordered_by_index(
        &self,
        project_id: ProjectId,
        kind: TestKind,
    ) -> Result<Vec<TestSlotRecord>, StorageError>;
    fn load_slot(&self, slot_id: TestSlotId) -> Result<&TestSlotRecord, StorageError>;
    fn apply_upserts(&mut self, batch: &UpsertBatch) -> Result<Vec<TestSlotId>, StorageError>;
    fn override_slot_params_row(
        &mut self,
        slot_id: TestSlotId,
        params: SlotParams,
    ) -> Result<TestSlotRecord, StorageError>;
    fn mark_finished(
        &mut self,
        slot_id: TestSlotId,
        now: MonotonicTimeNs,
    ) -> Result<FinishOutcome, StorageError>;
}

/// Typed repository interface for the append-only program audit ledger.
pub trait ProgramAuditRepo {
    fn append_audit_row(
        &mut self,
        input: ProgramAuditEventInput,
    ) -> Result<ProgramAuditEventId, StorageError>;
    fn audit_rows(&self) -> &[ProgramAuditEvent];
    fn audit_rows_by_project(&self, project_id: ProjectId) -> Vec<&ProgramAuditEvent>;
}

impl DeviceProjectRepo for ProgramStore {
    fn insert_device_row(
        &mut self,
        name: String,
        now: MonotonicTimeNs,
    ) -> Result<DeviceId, StorageError> {
        self.insert_device(name, now)
    }

    fn device_row(&self, device_id: DeviceId) -> Option<&DeviceRecord> {
        self.device(device_id)
    }

    fn device_rows(&self) -> Vec<&DeviceRecord> {
        self.devices()
    }

    fn insert_project_row(
        &mut self,
        device_id: DeviceId,
        input: ProjectInput,
        now: MonotonicTimeNs,
    ) -> Result<ProjectId, StorageError> {
        self.insert_project(device_id, input, now)
    }

    fn update_project_row(
        &mut self,
        project_id: ProjectId,
        input: ProjectInput,
        now: MonotonicTimeNs,
    ) -> Result<(), StorageError> {
        self.update_project(project_id, input, now).map(|_| ())
    }

    fn load_project(&self, project_id: ProjectId) -> Result<&ProjectRecord, StorageError> {
        self.project_or_err(project_id)
    }

    fn project_rows_for_device(
        &self,
        device_id: DeviceId,
    ) -> Result<Vec<&ProjectRecord>, StorageError> {
        self.projects_for_device(device_id)
    }
}

impl TestSlotRepo for ProgramStore {
    fn load_slots(
        &self,
        project_id: ProjectId,
        kind: TestKind,
    ) -> Result<BTreeMap<u8, TestSlotRecord>, StorageError> {
        self.slots_by_index(project_id, kind)
    }

    fn load_slots_ordered_by_index(
        &self,
        project_id: ProjectId,
        kind: TestKind,
    ) -> Result<Vec<TestSlotRecord>, StorageError> {
        self.slots_ordered_by_index(project_id, kind)
    }

    fn load_slot(&self, slot_id: TestSlotId) -> Result<&TestSlotRecord, StorageError> {
        self.slot_or_err(slot_id)
    }

    fn apply_upserts(&mut self, batch: &UpsertBatch) -> Result<Vec<TestSlotId>, StorageError> {
        self.apply_upsert_batch(batch)
    }

    fn override_slot_params_row(
        &mut self,
        slot_id: TestSlotId,
        params: SlotParams,
    ) -> Result<TestSlotRecord, StorageError> {
        self.override_slot_params(slot_id, params)
    }

    fn mark_finished(
        &mut self,
        slot_id: TestSlotId,
        now: MonotonicTimeNs,
    ) -> Result<FinishOutcome, StorageError> {
        ProgramStore::mark_finished(self, slot_id, now)
    }
}

impl ProgramAuditRepo for ProgramStore {
    fn append_audit_row(
        &mut self,
        input: ProgramAuditEventInput,
    ) -> Result<ProgramAuditEventId, StorageError> {
        self.append_audit_event(input)
    }

    fn audit_rows(&self) -> &[ProgramAuditEvent] {
        self.audit_events()
    }

    fn audit_rows_by_project(&self, project_id: ProjectId) -> Vec<&ProgramAuditEvent> {
        self.audit_events_for_project(project_id)
    }
}
