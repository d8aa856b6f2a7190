#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::env;

use fenestra_engines::progression::{self, ProgressionGuard};
use fenestra_engines::slot_reconcile::{self, ReconcilerConfig, TestSlotReconciler};
use fenestra_kernel_contracts::audit::{ProgramAuditEventInput, ProgramAuditEventType};
use fenestra_kernel_contracts::progression::{FinishDecision, FinishRequest};
use fenestra_kernel_contracts::project::{
    DesignPressures, DeviceId, DeviceRecord, ProjectId, ProjectInput, ProjectRecord,
    MAX_DESIGN_PRESSURE, MIN_DESIGN_PRESSURE,
};
use fenestra_kernel_contracts::test_slot::{
    SlotParams, TestKind, TestSlotId, TestSlotRecord, UpsertBatch, UpsertOp,
};
use fenestra_kernel_contracts::{ContractViolation, MonotonicTimeNs, ReasonCodeId, Validate};
use fenestra_storage::audit::ProgramAuditRuntime;
use fenestra_storage::program_store::{FinishOutcome, ProgramStore, StorageError};
use fenestra_storage::repo::{DeviceProjectRepo, TestSlotRepo};
use tracing::{debug, info, warn};

use crate::snapshot::ProgramSnapshot;

const MAX_DESIGN_PRESSURE_DEFAULT: f64 = 100_000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgramWiringConfig {
    /// Upper bound accepted for either design pressure. Tightens, never widens,
    /// the contract range `MIN_DESIGN_PRESSURE..=MAX_DESIGN_PRESSURE`.
    pub max_design_pressure: f64,
    pub audit_enabled: bool,
}

impl ProgramWiringConfig {
    pub fn mvp_v1() -> Self {
        Self {
            max_design_pressure: MAX_DESIGN_PRESSURE_DEFAULT,
            audit_enabled: true,
        }
    }

    /// `mvp_v1()` with `FENESTRA_MAX_DESIGN_PRESSURE` / `FENESTRA_AUDIT_ENABLED` applied.
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        Self::from_vars(
            env::var("FENESTRA_MAX_DESIGN_PRESSURE").ok().as_deref(),
            env::var("FENESTRA_AUDIT_ENABLED").ok().as_deref(),
        )
    }

    fn from_vars(max_design_pressure: Option<&str>, audit_enabled: Option<&str>) -> Self {
        let defaults = Self::mvp_v1();
        let max_design_pressure = max_design_pressure
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|v| max_design_pressure_in_range(*v))
            .unwrap_or(defaults.max_design_pressure);
        let audit_enabled = audit_enabled
            .and_then(parse_flag)
            .unwrap_or(defaults.audit_enabled);
        Self {
            max_design_pressure,
            audit_enabled,
        }
    }
}

fn max_design_pressure_in_range(v: f64) -> bool {
    v.is_finite() && (MIN_DESIGN_PRESSURE..=MAX_DESIGN_PRESSURE).contains(&v)
}

fn parse_flag(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Counts of slot writes produced by one reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub created: u16,
    pub recomputed: u16,
}

impl ReconcileSummary {
    fn absorb(&mut self, batch: &UpsertBatch) {
        for op in &batch.ops {
            match op {
                UpsertOp::Create { .. } => self.created = self.created.saturating_add(1),
                UpsertOp::UpdateDerivedFields { .. } => {
                    self.recomputed = self.recomputed.saturating_add(1)
                }
            }
        }
    }
}

pub trait ProgramEngine {
    fn reconcile(
        &self,
        project_id: ProjectId,
        pressures: &DesignPressures,
        kind: TestKind,
        existing: &BTreeMap<u8, TestSlotRecord>,
    ) -> Result<UpsertBatch, ContractViolation>;

    fn evaluate_finish(
        &self,
        req: &FinishRequest,
        slots: &[TestSlotRecord],
    ) -> Result<FinishDecision, ContractViolation>;
}

#[derive(Debug, Clone)]
pub struct SlotProgramEngine {
    reconciler: TestSlotReconciler,
    guard: ProgressionGuard,
}

impl SlotProgramEngine {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            reconciler: TestSlotReconciler::new(config),
            guard: ProgressionGuard::new(),
        }
    }
}

impl Default for SlotProgramEngine {
    fn default() -> Self {
        Self::new(ReconcilerConfig::mvp_v1())
    }
}

impl ProgramEngine for SlotProgramEngine {
    fn reconcile(
        &self,
        project_id: ProjectId,
        pressures: &DesignPressures,
        kind: TestKind,
        existing: &BTreeMap<u8, TestSlotRecord>,
    ) -> Result<UpsertBatch, ContractViolation> {
        self.reconciler
            .reconcile(project_id, pressures, kind, existing)
    }

    fn evaluate_finish(
        &self,
        req: &FinishRequest,
        slots: &[TestSlotRecord],
    ) -> Result<FinishDecision, ContractViolation> {
        self.guard.evaluate(req, slots)
    }
}

/// Orchestrates project lifecycle and slot progression against a [`ProgramStore`].
#[derive(Debug, Clone)]
pub struct ProgramWiring<E>
where
    E: ProgramEngine,
{
    config: ProgramWiringConfig,
    engine: E,
}

impl<E> ProgramWiring<E>
where
    E: ProgramEngine,
{
    pub fn new(config: ProgramWiringConfig, engine: E) -> Result<Self, ContractViolation> {
        if !max_design_pressure_in_range(config.max_design_pressure) {
            return Err(ContractViolation::InvalidRange {
                field: "program_wiring_config.max_design_pressure",
                min: MIN_DESIGN_PRESSURE,
                max: MAX_DESIGN_PRESSURE,
                got: config.max_design_pressure,
            });
        }
        Ok(Self { config, engine })
    }

    pub fn config(&self) -> ProgramWiringConfig {
        self.config
    }

    pub fn register_device(
        &self,
        store: &mut ProgramStore,
        name: String,
        now: MonotonicTimeNs,
    ) -> Result<DeviceId, StorageError> {
        let device_id = store.insert_device_row(name, now)?;
        info!(device_id = device_id.0, "device registered");
        Ok(device_id)
    }

    pub fn devices<'a>(&self, store: &'a ProgramStore) -> Vec<&'a DeviceRecord> {
        store.device_rows()
    }

    pub fn projects_for_device<'a>(
        &self,
        store: &'a ProgramStore,
        device_id: DeviceId,
    ) -> Result<Vec<&'a ProjectRecord>, StorageError> {
        store.project_rows_for_device(device_id)
    }

    /// Inserts the project and materializes all of its static and cyclic slots in one commit.
    pub fn create_project(
        &self,
        store: &mut ProgramStore,
        device_id: DeviceId,
        input: ProjectInput,
        now: MonotonicTimeNs,
    ) -> Result<ProjectId, StorageError> {
        self.check_pressure_limit(&input.design_pressures)?;
        let (project_id, summary) = store.in_transaction(|tx| {
            let project_id = tx.insert_project_row(device_id, input, now)?;
            self.audit_project(
                tx,
                project_id,
                ProgramAuditEventType::ProjectCreated,
                slot_reconcile::reason_codes::RECONCILE_OK_PROJECT_CREATED,
                now,
            )?;
            let summary = self.reconcile_all_kinds(tx, project_id, now)?;
            Ok((project_id, summary))
        })?;
        info!(
            project_id = project_id.0,
            device_id = device_id.0,
            created = summary.created,
            "project created"
        );
        Ok(project_id)
    }

    /// Replaces name and design pressures, then rescales every unfinished slot.
    pub fn update_project(
        &self,
        store: &mut ProgramStore,
        project_id: ProjectId,
        input: ProjectInput,
        now: MonotonicTimeNs,
    ) -> Result<ReconcileSummary, StorageError> {
        self.check_pressure_limit(&input.design_pressures)?;
        let summary = store.in_transaction(|tx| {
            tx.update_project_row(project_id, input, now)?;
            self.audit_project(
                tx,
                project_id,
                ProgramAuditEventType::ProjectUpdated,
                slot_reconcile::reason_codes::RECONCILE_OK_PROJECT_UPDATED,
                now,
            )?;
            self.reconcile_all_kinds(tx, project_id, now)
        })?;
        info!(
            project_id = project_id.0,
            created = summary.created,
            recomputed = summary.recomputed,
            "project updated"
        );
        Ok(summary)
    }

    /// Whether `target_index` may be finished now. Does not change state.
    pub fn can_finish(
        &self,
        store: &ProgramStore,
        project_id: ProjectId,
        kind: TestKind,
        target_index: u8,
    ) -> Result<bool, StorageError> {
        let req = FinishRequest::v1(project_id, kind, target_index)?;
        let slots = store.load_slots_ordered_by_index(project_id, kind)?;
        Ok(self.engine.evaluate_finish(&req, &slots)?.is_allowed())
    }

    /// Draft -> Finished. A rejected request is recorded in the audit ledger and returned as
    /// `OutOfOrderFinish`; re-finishing is a no-op.
    pub fn finish_slot(
        &self,
        store: &mut ProgramStore,
        slot_id: TestSlotId,
        now: MonotonicTimeNs,
    ) -> Result<FinishOutcome, StorageError> {
        let slot = store.load_slot(slot_id)?.clone();
        let req = FinishRequest::v1(slot.project_id, slot.kind, slot.index)?;
        let siblings = store.load_slots_ordered_by_index(slot.project_id, slot.kind)?;
        let decision = self.engine.evaluate_finish(&req, &siblings)?;

        if let FinishDecision::OutOfOrder { blocking_index } = decision {
            let rejected = StorageError::OutOfOrderFinish {
                project_id: slot.project_id,
                kind: slot.kind,
                target_index: slot.index,
                blocking_index,
            };
            self.record_finish_rejection(store, &slot, blocking_index, now);
            return Err(rejected);
        }

        // The store re-checks ordering inside its own critical section; the finish and its
        // audit row commit together.
        let outcome = store.in_transaction(|tx| {
            let outcome = tx.mark_finished(slot_id, now)?;
            if let FinishOutcome::Finished(finished) = &outcome {
                self.audit_slot(
                    tx,
                    finished,
                    ProgramAuditEventType::SlotFinished,
                    progression::reason_codes::PROGRESSION_OK_FINISH_ALLOWED,
                    now,
                )?;
            }
            Ok(outcome)
        });

        match &outcome {
            Ok(FinishOutcome::AlreadyFinished(_)) => {
                debug!(slot_id = slot_id.0, "finish ignored: slot already finished");
            }
            Err(StorageError::OutOfOrderFinish { blocking_index, .. }) => {
                self.record_finish_rejection(store, &slot, *blocking_index, now);
            }
            Ok(FinishOutcome::Finished(_)) | Err(_) => {}
        }
        outcome
    }

    // Best effort: a failed audit write must not mask the rejection itself.
    fn record_finish_rejection(
        &self,
        store: &mut ProgramStore,
        slot: &TestSlotRecord,
        blocking_index: u8,
        now: MonotonicTimeNs,
    ) {
        warn!(
            project_id = slot.project_id.0,
            kind = slot.kind.as_str(),
            target_index = slot.index,
            blocking_index,
            "previous tests are not finished"
        );
        if let Err(err) = self.audit_slot(
            store,
            slot,
            ProgramAuditEventType::FinishRejected,
            progression::reason_codes::PROGRESSION_OUT_OF_ORDER_FINISH,
            now,
        ) {
            warn!(error = %err, slot_id = slot.slot_id.0, "finish rejection not audited");
        }
    }

    /// Overwrites the derived fields of one unfinished slot.
    pub fn override_slot(
        &self,
        store: &mut ProgramStore,
        slot_id: TestSlotId,
        params: SlotParams,
        now: MonotonicTimeNs,
    ) -> Result<TestSlotRecord, StorageError> {
        let updated = store.in_transaction(|tx| {
            let updated = tx.override_slot_params_row(slot_id, params)?;
            self.audit_slot(
                tx,
                &updated,
                ProgramAuditEventType::SlotOverridden,
                slot_reconcile::reason_codes::RECONCILE_OK_SLOT_OVERRIDDEN,
                now,
            )?;
            Ok(updated)
        })?;
        info!(
            project_id = updated.project_id.0,
            kind = updated.kind.as_str(),
            index = updated.index,
            "test slot overridden"
        );
        Ok(updated)
    }

    /// Applies `(index, params)` overrides for one project and kind as a single batch.
    /// An index without a slot gets one; any finished target fails the whole batch.
    pub fn override_slots_by_index(
        &self,
        store: &mut ProgramStore,
        project_id: ProjectId,
        kind: TestKind,
        overrides: Vec<(u8, SlotParams)>,
        now: MonotonicTimeNs,
    ) -> Result<Vec<TestSlotId>, StorageError> {
        let existing = store.load_slots(project_id, kind)?;
        let mut ops = Vec::with_capacity(overrides.len());
        for (index, params) in overrides {
            match existing.get(&index) {
                Some(slot) if slot.finished => {
                    return Err(StorageError::SlotFinished {
                        slot_id: slot.slot_id,
                    })
                }
                Some(slot) => ops.push(UpsertOp::UpdateDerivedFields {
                    slot_id: slot.slot_id,
                    index,
                    params,
                }),
                None => ops.push(UpsertOp::Create {
                    index,
                    direction: kind.locate(index)?.direction,
                    params,
                }),
            }
        }
        let batch = UpsertBatch::v1(project_id, kind, ops)?;

        let ids = store.in_transaction(|tx| {
            let ids = tx.apply_upserts(&batch)?;
            for op in &batch.ops {
                let event_type = match op {
                    UpsertOp::Create { .. } => ProgramAuditEventType::SlotCreated,
                    UpsertOp::UpdateDerivedFields { .. } => ProgramAuditEventType::SlotOverridden,
                };
                self.audit_slot_index(
                    tx,
                    project_id,
                    kind,
                    op.index(),
                    event_type,
                    slot_reconcile::reason_codes::RECONCILE_OK_SLOT_OVERRIDDEN,
                    now,
                )?;
            }
            Ok(ids)
        })?;
        info!(
            project_id = project_id.0,
            kind = kind.as_str(),
            slots = ids.len(),
            "test slots overridden"
        );
        Ok(ids)
    }

    pub fn snapshot(
        &self,
        store: &ProgramStore,
        project_id: ProjectId,
    ) -> Result<ProgramSnapshot, StorageError> {
        ProgramSnapshot::load(store, project_id)
    }

    fn check_pressure_limit(&self, pressures: &DesignPressures) -> Result<(), ContractViolation> {
        pressures.validate()?;
        let max = self.config.max_design_pressure;
        for (field, got) in [
            (
                "program_wiring.inward_design_pressure",
                pressures.inward_design_pressure,
            ),
            (
                "program_wiring.outward_design_pressure",
                pressures.outward_design_pressure,
            ),
        ] {
            if got > max {
                return Err(ContractViolation::InvalidRange {
                    field,
                    min: MIN_DESIGN_PRESSURE,
                    max,
                    got,
                });
            }
        }
        Ok(())
    }

    fn reconcile_all_kinds(
        &self,
        tx: &mut ProgramStore,
        project_id: ProjectId,
        now: MonotonicTimeNs,
    ) -> Result<ReconcileSummary, StorageError> {
        let pressures = tx.load_project(project_id)?.design_pressures;
        let mut summary = ReconcileSummary::default();
        for kind in TestKind::ALL {
            let existing = tx.load_slots(project_id, kind)?;
            let batch = self
                .engine
                .reconcile(project_id, &pressures, kind, &existing)?;
            tx.apply_upserts(&batch)?;
            summary.absorb(&batch);
            for op in &batch.ops {
                let (event_type, reason_code) = match op {
                    UpsertOp::Create { .. } => (
                        ProgramAuditEventType::SlotCreated,
                        slot_reconcile::reason_codes::RECONCILE_OK_SLOT_CREATED,
                    ),
                    UpsertOp::UpdateDerivedFields { .. } => (
                        ProgramAuditEventType::SlotRecomputed,
                        slot_reconcile::reason_codes::RECONCILE_OK_SLOT_RECOMPUTED,
                    ),
                };
                self.audit_slot_index(
                    tx,
                    project_id,
                    kind,
                    op.index(),
                    event_type,
                    reason_code,
                    now,
                )?;
            }
            debug!(
                project_id = project_id.0,
                kind = kind.as_str(),
                ops = batch.ops.len(),
                "reconciled test slots"
            );
        }
        Ok(summary)
    }

    fn audit_project(
        &self,
        store: &mut ProgramStore,
        project_id: ProjectId,
        event_type: ProgramAuditEventType,
        reason_code: ReasonCodeId,
        now: MonotonicTimeNs,
    ) -> Result<(), StorageError> {
        if !self.config.audit_enabled {
            return Ok(());
        }
        let input =
            ProgramAuditEventInput::v1(now, project_id, event_type, None, None, reason_code, None)?;
        ProgramAuditRuntime::emit(store, input)?;
        Ok(())
    }

    fn audit_slot(
        &self,
        store: &mut ProgramStore,
        slot: &TestSlotRecord,
        event_type: ProgramAuditEventType,
        reason_code: ReasonCodeId,
        now: MonotonicTimeNs,
    ) -> Result<(), StorageError> {
        self.audit_slot_index(
            store,
            slot.project_id,
            slot.kind,
            slot.index,
            event_type,
            reason_code,
            now,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn audit_slot_index(
        &self,
        store: &mut ProgramStore,
        project_id: ProjectId,
        kind: TestKind,
        index: u8,
        event_type: ProgramAuditEventType,
        reason_code: ReasonCodeId,
        now: MonotonicTimeNs,
    ) -> Result<(), StorageError> {
        if !self.config.audit_enabled {
            return Ok(());
        }
        let input = ProgramAuditEventInput::v1(
            now,
            project_id,
            event_type,
            Some(kind),
            Some(index),
            reason_code,
            None,
        )?;
        ProgramAuditRuntime::emit(store, input)?;
        Ok(())
    }
}
