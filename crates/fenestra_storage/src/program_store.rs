#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use fenestra_engines::progression::ProgressionGuard;
use fenestra_kernel_contracts::audit::{
    ProgramAuditEvent, ProgramAuditEventId, ProgramAuditEventInput,
};
use fenestra_kernel_contracts::progression::{FinishDecision, FinishRequest};
use fenestra_kernel_contracts::project::{
    DeviceId, DeviceRecord, ProjectId, ProjectInput, ProjectRecord,
};
use fenestra_kernel_contracts::test_slot::{
    SlotParams, TestKind, TestSlotId, TestSlotRecord, UpsertBatch, UpsertOp,
};
use fenestra_kernel_contracts::{ContractViolation, MonotonicTimeNs, Validate};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum StorageError {
    ForeignKeyViolation {
        table: &'static str,
        key: String,
    },
    DuplicateKey {
        table: &'static str,
        key: String,
    },
    AppendOnlyViolation {
        table: &'static str,
    },
    UnknownDevice {
        device_id: DeviceId,
    },
    UnknownProject {
        project_id: ProjectId,
    },
    UnknownSlot {
        slot_id: TestSlotId,
    },
    /// An earlier slot of the same kind in the project is not finished yet.
    OutOfOrderFinish {
        project_id: ProjectId,
        kind: TestKind,
        target_index: u8,
        blocking_index: u8,
    },
    /// Derived fields of a finished slot are frozen.
    SlotFinished {
        slot_id: TestSlotId,
    },
    ContractViolation(ContractViolation),
}

impl From<ContractViolation> for StorageError {
    fn from(v: ContractViolation) -> Self {
        StorageError::ContractViolation(v)
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::ForeignKeyViolation { table, key } => {
                write!(f, "foreign key violation in {table}: {key}")
            }
            StorageError::DuplicateKey { table, key } => {
                write!(f, "duplicate key in {table}: {key}")
            }
            StorageError::AppendOnlyViolation { table } => {
                write!(f, "{table} is append-only")
            }
            StorageError::UnknownDevice { device_id } => {
                write!(f, "device {} not found", device_id.0)
            }
            StorageError::UnknownProject { project_id } => {
                write!(f, "project {} not found", project_id.0)
            }
            StorageError::UnknownSlot { slot_id } => write!(f, "test slot {} not found", slot_id.0),
            StorageError::OutOfOrderFinish {
                project_id,
                kind,
                target_index,
                blocking_index,
            } => write!(
                f,
                "previous {} tests are not finished: project {} index {} waits on index {}",
                kind.as_str(),
                project_id.0,
                target_index,
                blocking_index
            ),
            StorageError::SlotFinished { slot_id } => {
                write!(f, "test slot {} is finished and cannot change", slot_id.0)
            }
            StorageError::ContractViolation(v) => write!(f, "contract violation: {v}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::ContractViolation(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramStoreConfig {
    pub max_devices: usize,
    pub max_projects: usize,
    pub max_audit_events: usize,
}

impl ProgramStoreConfig {
    pub fn mvp_v1() -> Self {
        Self {
            max_devices: 10_000,
            max_projects: 100_000,
            max_audit_events: 10_000_000,
        }
    }
}

/// Result of a finish request that passed the ordering check.
#[derive(Debug, Clone, PartialEq)]
pub enum FinishOutcome {
    Finished(TestSlotRecord),
    /// The slot was already finished; nothing changed.
    AlreadyFinished(TestSlotRecord),
}

impl FinishOutcome {
    pub fn slot(&self) -> &TestSlotRecord {
        match self {
            FinishOutcome::Finished(s) | FinishOutcome::AlreadyFinished(s) => s,
        }
    }
}

// Inverse of one committed row write, replayed newest-first on rollback.
#[derive(Debug, Clone)]
enum UndoEntry {
    DeviceInserted(DeviceId),
    ProjectInserted(ProjectId),
    ProjectReplaced(ProjectRecord),
    SlotInserted(TestSlotId),
    SlotReplaced(TestSlotRecord),
    AuditKeyInserted((ProjectId, String)),
}

#[derive(Debug, Clone, Copy)]
struct TxMark {
    next_device_id: u64,
    next_project_id: u64,
    next_slot_id: u64,
    next_audit_event_id: u64,
    audit_len: usize,
}

/// In-memory storage for devices, projects and their test slots.
///
/// Every `&mut self` method is a serializable critical section; compound
/// read-decide-write sequences go through [`ProgramStore::in_transaction`].
#[derive(Debug, Clone)]
pub struct ProgramStore {
    config: ProgramStoreConfig,
    guard: ProgressionGuard,

    devices: BTreeMap<DeviceId, DeviceRecord>,
    next_device_id: u64,

    projects: BTreeMap<ProjectId, ProjectRecord>,
    next_project_id: u64,

    slots: BTreeMap<TestSlotId, TestSlotRecord>,
    // Unique (project_id, kind, index) -> slot_id.
    slot_key_index: BTreeMap<(ProjectId, TestKind, u8), TestSlotId>,
    next_slot_id: u64,

    audit_events: Vec<ProgramAuditEvent>,
    next_audit_event_id: u64,
    // (project_id, idempotency_key) -> event_id; deterministic no-op on retry.
    audit_idempotency_index: BTreeMap<(ProjectId, String), ProgramAuditEventId>,

    // Present only while a transaction is open.
    undo_log: Option<Vec<UndoEntry>>,
}

impl ProgramStore {
    pub fn new_in_memory() -> Self {
        Self::with_config(ProgramStoreConfig::mvp_v1())
    }

    pub fn with_config(config: ProgramStoreConfig) -> Self {
        Self {
            config,
            guard: ProgressionGuard::new(),
            devices: BTreeMap::new(),
            next_device_id: 1,
            projects: BTreeMap::new(),
            next_project_id: 1,
            slots: BTreeMap::new(),
            slot_key_index: BTreeMap::new(),
            next_slot_id: 1,
            audit_events: Vec::new(),
            next_audit_event_id: 1,
            audit_idempotency_index: BTreeMap::new(),
            undo_log: None,
        }
    }

    /// Runs `f` against the store; on error every write made by `f` is rolled back.
    ///
    /// Rollback replays an undo log of the rows `f` touched, so its cost follows the size of
    /// the transaction, not of the store. A nested call joins the outer transaction.
    pub fn in_transaction<T, F>(&mut self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut ProgramStore) -> Result<T, StorageError>,
    {
        if self.undo_log.is_some() {
            return f(self);
        }
        let mark = TxMark {
            next_device_id: self.next_device_id,
            next_project_id: self.next_project_id,
            next_slot_id: self.next_slot_id,
            next_audit_event_id: self.next_audit_event_id,
            audit_len: self.audit_events.len(),
        };
        self.undo_log = Some(Vec::new());
        let out = f(self);
        let log = self.undo_log.take().unwrap_or_default();
        if out.is_err() {
            self.rollback(mark, log);
        }
        out
    }

    fn rollback(&mut self, mark: TxMark, log: Vec<UndoEntry>) {
        debug!(entries = log.len(), "rolling back transaction");
        for entry in log.into_iter().rev() {
            match entry {
                UndoEntry::DeviceInserted(id) => {
                    self.devices.remove(&id);
                }
                UndoEntry::ProjectInserted(id) => {
                    self.projects.remove(&id);
                }
                UndoEntry::ProjectReplaced(prev) => {
                    self.projects.insert(prev.project_id, prev);
                }
                UndoEntry::SlotInserted(id) => {
                    if let Some(slot) = self.slots.remove(&id) {
                        self.slot_key_index
                            .remove(&(slot.project_id, slot.kind, slot.index));
                    }
                }
                UndoEntry::SlotReplaced(prev) => {
                    self.slots.insert(prev.slot_id, prev);
                }
                UndoEntry::AuditKeyInserted(key) => {
                    self.audit_idempotency_index.remove(&key);
                }
            }
        }
        self.audit_events.truncate(mark.audit_len);
        self.next_device_id = mark.next_device_id;
        self.next_project_id = mark.next_project_id;
        self.next_slot_id = mark.next_slot_id;
        self.next_audit_event_id = mark.next_audit_event_id;
    }

    fn record_undo(&mut self, entry: UndoEntry) {
        if let Some(log) = self.undo_log.as_mut() {
            log.push(entry);
        }
    }

    fn put_slot(&mut self, slot: TestSlotRecord) {
        let slot_id = slot.slot_id;
        self.slot_key_index
            .insert((slot.project_id, slot.kind, slot.index), slot_id);
        match self.slots.insert(slot_id, slot) {
            Some(prev) => self.record_undo(UndoEntry::SlotReplaced(prev)),
            None => self.record_undo(UndoEntry::SlotInserted(slot_id)),
        }
    }

    // ------------------------
    // Devices.
    // ------------------------

    pub fn insert_device(
        &mut self,
        name: String,
        now: MonotonicTimeNs,
    ) -> Result<DeviceId, StorageError> {
        if self.devices.len() >= self.config.max_devices {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "program_store.devices",
                    reason: "max_devices exceeded",
                },
            ));
        }
        let device_id = DeviceId(self.next_device_id);
        let record = DeviceRecord::v1(device_id, name, now)?;
        self.next_device_id = self.next_device_id.saturating_add(1);
        self.devices.insert(device_id, record);
        self.record_undo(UndoEntry::DeviceInserted(device_id));
        Ok(device_id)
    }

    pub fn device(&self, device_id: DeviceId) -> Option<&DeviceRecord> {
        self.devices.get(&device_id)
    }

    pub fn devices(&self) -> Vec<&DeviceRecord> {
        self.devices.values().collect()
    }

    // ------------------------
    // Projects.
    // ------------------------

    pub fn insert_project(
        &mut self,
        device_id: DeviceId,
        input: ProjectInput,
        now: MonotonicTimeNs,
    ) -> Result<ProjectId, StorageError> {
        if !self.devices.contains_key(&device_id) {
            return Err(StorageError::UnknownDevice { device_id });
        }
        if self.projects.len() >= self.config.max_projects {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "program_store.projects",
                    reason: "max_projects exceeded",
                },
            ));
        }
        let project_id = ProjectId(self.next_project_id);
        let record = ProjectRecord::from_input_v1(project_id, device_id, input, now)?;
        self.next_project_id = self.next_project_id.saturating_add(1);
        self.projects.insert(project_id, record);
        self.record_undo(UndoEntry::ProjectInserted(project_id));
        Ok(project_id)
    }

    pub fn update_project(
        &mut self,
        project_id: ProjectId,
        input: ProjectInput,
        now: MonotonicTimeNs,
    ) -> Result<&ProjectRecord, StorageError> {
        let current = self.project_or_err(project_id)?;
        let next = current.with_update_v1(input, now)?;
        if let Some(prev) = self.projects.insert(project_id, next) {
            self.record_undo(UndoEntry::ProjectReplaced(prev));
        }
        self.project_or_err(project_id)
    }

    pub fn project(&self, project_id: ProjectId) -> Option<&ProjectRecord> {
        self.projects.get(&project_id)
    }

    pub fn project_or_err(&self, project_id: ProjectId) -> Result<&ProjectRecord, StorageError> {
        self.projects
            .get(&project_id)
            .ok_or(StorageError::UnknownProject { project_id })
    }

    pub fn projects_for_device(
        &self,
        device_id: DeviceId,
    ) -> Result<Vec<&ProjectRecord>, StorageError> {
        if !self.devices.contains_key(&device_id) {
            return Err(StorageError::UnknownDevice { device_id });
        }
        Ok(self
            .projects
            .values()
            .filter(|p| p.device_id == device_id)
            .collect())
    }

    // ------------------------
    // Test slots.
    // ------------------------

    pub fn slot(&self, slot_id: TestSlotId) -> Option<&TestSlotRecord> {
        self.slots.get(&slot_id)
    }

    pub fn slot_or_err(&self, slot_id: TestSlotId) -> Result<&TestSlotRecord, StorageError> {
        self.slots
            .get(&slot_id)
            .ok_or(StorageError::UnknownSlot { slot_id })
    }

    pub fn slot_at(
        &self,
        project_id: ProjectId,
        kind: TestKind,
        index: u8,
    ) -> Option<&TestSlotRecord> {
        self.slot_key_index
            .get(&(project_id, kind, index))
            .and_then(|id| self.slots.get(id))
    }

    /// Slots of one kind keyed by index; `UnknownProject` if the project does not exist.
    pub fn slots_by_index(
        &self,
        project_id: ProjectId,
        kind: TestKind,
    ) -> Result<BTreeMap<u8, TestSlotRecord>, StorageError> {
        self.project_or_err(project_id)?;
        Ok(self
            .slot_key_index
            .range((project_id, kind, 0)..=(project_id, kind, u8::MAX))
            .filter_map(|((_, _, index), id)| self.slots.get(id).map(|s| (*index, s.clone())))
            .collect())
    }

    pub fn slots_ordered_by_index(
        &self,
        project_id: ProjectId,
        kind: TestKind,
    ) -> Result<Vec<TestSlotRecord>, StorageError> {
        Ok(self
            .slots_by_index(project_id, kind)?
            .into_values()
            .collect())
    }

    /// Applies every op of `batch` or none of them. Returns the ids touched, in op order.
    pub fn apply_upsert_batch(
        &mut self,
        batch: &UpsertBatch,
    ) -> Result<Vec<TestSlotId>, StorageError> {
        batch.validate()?;
        let project_id = batch.project_id;
        let kind = batch.kind;
        self.project_or_err(project_id)?;

        // Stage every write first so a failing op leaves the store untouched.
        let mut next_slot_id = self.next_slot_id;
        let mut staged: Vec<TestSlotRecord> = Vec::with_capacity(batch.ops.len());
        for op in &batch.ops {
            match op {
                UpsertOp::Create { index, params, .. } => {
                    if self.slot_key_index.contains_key(&(project_id, kind, *index)) {
                        return Err(StorageError::DuplicateKey {
                            table: "test_slots",
                            key: format!("{}:{}:{}", project_id.0, kind.as_str(), index),
                        });
                    }
                    let slot = TestSlotRecord::draft_v1(
                        TestSlotId(next_slot_id),
                        project_id,
                        kind,
                        *index,
                        params.clone(),
                    )?;
                    next_slot_id = next_slot_id.saturating_add(1);
                    staged.push(slot);
                }
                UpsertOp::UpdateDerivedFields {
                    slot_id,
                    index,
                    params,
                } => {
                    let current = self.slot_or_err(*slot_id)?;
                    if current.project_id != project_id
                        || current.kind != kind
                        || current.index != *index
                    {
                        return Err(StorageError::ForeignKeyViolation {
                            table: "test_slots",
                            key: format!("{}", slot_id.0),
                        });
                    }
                    if current.finished {
                        return Err(StorageError::SlotFinished { slot_id: *slot_id });
                    }
                    staged.push(current.with_params_v1(params.clone())?);
                }
            }
        }

        let ids: Vec<TestSlotId> = staged.iter().map(|s| s.slot_id).collect();
        for slot in staged {
            self.put_slot(slot);
        }
        self.next_slot_id = next_slot_id;
        debug!(
            project_id = project_id.0,
            kind = kind.as_str(),
            ops = ids.len(),
            "applied upsert batch"
        );
        Ok(ids)
    }

    /// Replaces the derived fields of one draft slot.
    pub fn override_slot_params(
        &mut self,
        slot_id: TestSlotId,
        params: SlotParams,
    ) -> Result<TestSlotRecord, StorageError> {
        let current = self.slot_or_err(slot_id)?;
        if current.finished {
            return Err(StorageError::SlotFinished { slot_id });
        }
        let next = current.with_params_v1(params)?;
        self.put_slot(next.clone());
        Ok(next)
    }

    /// Draft -> Finished, re-checking finish order against the stored slots.
    ///
    /// Finishing an already finished slot is a no-op and returns
    /// [`FinishOutcome::AlreadyFinished`].
    pub fn mark_finished(
        &mut self,
        slot_id: TestSlotId,
        now: MonotonicTimeNs,
    ) -> Result<FinishOutcome, StorageError> {
        let current = self.slot_or_err(slot_id)?.clone();
        let req = FinishRequest::v1(current.project_id, current.kind, current.index)?;
        let siblings = self.slots_ordered_by_index(current.project_id, current.kind)?;

        match self.guard.evaluate(&req, &siblings)? {
            FinishDecision::AlreadyFinished => Ok(FinishOutcome::AlreadyFinished(current)),
            FinishDecision::OutOfOrder { blocking_index } => {
                warn!(
                    project_id = current.project_id.0,
                    kind = current.kind.as_str(),
                    target_index = current.index,
                    blocking_index,
                    "finish rejected: earlier slot unfinished"
                );
                Err(StorageError::OutOfOrderFinish {
                    project_id: current.project_id,
                    kind: current.kind,
                    target_index: current.index,
                    blocking_index,
                })
            }
            FinishDecision::Allowed => {
                let finished = current.finish_v1(now)?;
                self.put_slot(finished.clone());
                info!(
                    project_id = finished.project_id.0,
                    kind = finished.kind.as_str(),
                    index = finished.index,
                    "test slot finished"
                );
                Ok(FinishOutcome::Finished(finished))
            }
        }
    }

    // ------------------------
    // Audit ledger (append-only).
    // ------------------------

    pub(crate) fn append_audit_event(
        &mut self,
        input: ProgramAuditEventInput,
    ) -> Result<ProgramAuditEventId, StorageError> {
        input.validate()?;
        if !self.projects.contains_key(&input.project_id) {
            return Err(StorageError::ForeignKeyViolation {
                table: "program_audit_events",
                key: format!("{}", input.project_id.0),
            });
        }

        if let Some(k) = &input.idempotency_key {
            if let Some(existing) = self
                .audit_idempotency_index
                .get(&(input.project_id, k.clone()))
            {
                return Ok(*existing);
            }
        }

        if self.audit_events.len() >= self.config.max_audit_events {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "program_store.audit_events",
                    reason: "max_audit_events exceeded",
                },
            ));
        }
        let event_id = ProgramAuditEventId(self.next_audit_event_id);
        let ev = ProgramAuditEvent::from_input_v1(event_id, input)?;
        self.next_audit_event_id = self.next_audit_event_id.saturating_add(1);
        if let Some(k) = &ev.idempotency_key {
            let key = (ev.project_id, k.clone());
            self.audit_idempotency_index.insert(key.clone(), ev.event_id);
            self.record_undo(UndoEntry::AuditKeyInserted(key));
        }
        self.audit_events.push(ev);
        Ok(event_id)
    }

    pub fn audit_events(&self) -> &[ProgramAuditEvent] {
        &self.audit_events
    }

    pub fn audit_events_for_project(&self, project_id: ProjectId) -> Vec<&ProgramAuditEvent> {
        self.audit_events
            .iter()
            .filter(|e| e.project_id == project_id)
            .collect()
    }

    pub fn attempt_overwrite_audit_event(
        &mut self,
        _event_id: ProgramAuditEventId,
    ) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: "program_audit_events",
        })
    }
}
