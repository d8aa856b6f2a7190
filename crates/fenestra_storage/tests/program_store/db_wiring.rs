#![forbid(unsafe_code)]

use fenestra_engines::slot_reconcile::{ReconcilerConfig, TestSlotReconciler};
use fenestra_kernel_contracts::audit::{ProgramAuditEventInput, ProgramAuditEventType};
use fenestra_kernel_contracts::project::{DesignPressures, DeviceId, ProjectId, ProjectInput};
use fenestra_kernel_contracts::test_slot::{
    CyclicTestParams, PressureDirection, SlotParams, TestKind, TestSlotId, UpsertBatch, UpsertOp,
};
use fenestra_kernel_contracts::{MonotonicTimeNs, ReasonCodeId};
use fenestra_storage::audit::ProgramAuditRuntime;
use fenestra_storage::program_store::{ProgramStore, StorageError};
use fenestra_storage::repo::{DeviceProjectRepo, ProgramAuditRepo, TestSlotRepo};

fn project_input(name: &str, inward: f64, outward: f64) -> ProjectInput {
    ProjectInput::v1(
        name.to_string(),
        DesignPressures::v1(inward, outward).unwrap(),
    )
    .unwrap()
}

fn reconcile_all(s: &mut ProgramStore, project_id: ProjectId) {
    let rc = TestSlotReconciler::new(ReconcilerConfig::mvp_v1());
    let pressures = s.load_project(project_id).unwrap().design_pressures;
    for kind in TestKind::ALL {
        let existing = s.load_slots(project_id, kind).unwrap();
        let batch = rc
            .reconcile(project_id, &pressures, kind, &existing)
            .unwrap();
        s.apply_upserts(&batch).unwrap();
    }
}

fn seeded_project(s: &mut ProgramStore) -> (DeviceId, ProjectId) {
    let device_id = s
        .insert_device_row("Sliding door".to_string(), MonotonicTimeNs(1))
        .unwrap();
    let project_id = s
        .insert_project_row(
            device_id,
            project_input("Door batch A", 100.0, 200.0),
            MonotonicTimeNs(2),
        )
        .unwrap();
    reconcile_all(s, project_id);
    (device_id, project_id)
}

fn static_pressures(s: &ProgramStore, project_id: ProjectId) -> Vec<f64> {
    s.load_slots_ordered_by_index(project_id, TestKind::Static)
        .unwrap()
        .iter()
        .map(|slot| slot.params.as_static().unwrap().pressure)
        .collect()
}

#[test]
fn at_program_store_db_01_new_project_gets_full_slot_program() {
    let mut s = ProgramStore::new_in_memory();
    let (_, project_id) = seeded_project(&mut s);

    assert_eq!(
        static_pressures(&s, project_id),
        vec![75.0, 100.0, 150.0, 300.0, 200.0, 150.0]
    );

    let cyclic = s
        .load_slots_ordered_by_index(project_id, TestKind::Cyclic)
        .unwrap();
    assert_eq!(cyclic.len(), 8);
    let got: Vec<(f64, f64, u32)> = cyclic
        .iter()
        .map(|slot| {
            let c = slot.params.as_cyclic().unwrap();
            (c.high_pressure, c.low_pressure, c.cycles)
        })
        .collect();
    assert_eq!(
        got,
        vec![
            (50.0, 20.0, 3500),
            (60.0, 0.0, 300),
            (80.0, 50.0, 600),
            (100.0, 30.0, 100),
            (200.0, 60.0, 50),
            (160.0, 100.0, 1050),
            (120.0, 0.0, 50),
            (100.0, 40.0, 3050),
        ]
    );
    assert_eq!(cyclic[3].direction, PressureDirection::Inward);
    assert_eq!(cyclic[4].direction, PressureDirection::Outward);
    assert!(cyclic.iter().all(|slot| !slot.finished));
}

#[test]
fn at_program_store_db_02_update_rescales_only_unfinished_slots() {
    let mut s = ProgramStore::new_in_memory();
    let (_, project_id) = seeded_project(&mut s);

    let first = s
        .load_slots(project_id, TestKind::Static)
        .unwrap()
        .remove(&0)
        .unwrap();
    s.mark_finished(first.slot_id, MonotonicTimeNs(3)).unwrap();

    s.update_project_row(
        project_id,
        project_input("Door batch A", 150.0, 200.0),
        MonotonicTimeNs(4),
    )
    .unwrap();
    reconcile_all(&mut s, project_id);

    assert_eq!(
        static_pressures(&s, project_id),
        vec![75.0, 150.0, 225.0, 300.0, 200.0, 150.0]
    );
    let project = s.load_project(project_id).unwrap();
    assert_eq!(project.revision, 2);
    assert_eq!(project.design_pressures.inward_design_pressure, 150.0);
    // Reconciling again must not create duplicates.
    assert_eq!(
        s.load_slots(project_id, TestKind::Static).unwrap().len(),
        6
    );
}

#[test]
fn at_program_store_db_03_unknown_ids_are_reported() {
    let mut s = ProgramStore::new_in_memory();
    assert!(matches!(
        s.load_slots(ProjectId(7), TestKind::Static),
        Err(StorageError::UnknownProject {
            project_id: ProjectId(7)
        })
    ));
    assert!(matches!(
        s.mark_finished(TestSlotId(3), MonotonicTimeNs(1)),
        Err(StorageError::UnknownSlot {
            slot_id: TestSlotId(3)
        })
    ));
    assert!(matches!(
        s.project_rows_for_device(DeviceId(5)),
        Err(StorageError::UnknownDevice { .. })
    ));
}

#[test]
fn at_program_store_db_04_projects_are_scoped_per_device() {
    let mut s = ProgramStore::new_in_memory();
    let (device_a, _) = seeded_project(&mut s);
    let device_b = s
        .insert_device_row("Casement".to_string(), MonotonicTimeNs(10))
        .unwrap();
    s.insert_project_row(
        device_b,
        project_input("Casement run", 80.0, 80.0),
        MonotonicTimeNs(11),
    )
    .unwrap();

    assert_eq!(s.device_rows().len(), 2);
    assert_eq!(s.project_rows_for_device(device_a).unwrap().len(), 1);
    let b_projects = s.project_rows_for_device(device_b).unwrap();
    assert_eq!(b_projects.len(), 1);
    assert_eq!(b_projects[0].name, "Casement run");
}

#[test]
fn at_program_store_db_05_finished_slot_rejects_updates_and_overrides() {
    let mut s = ProgramStore::new_in_memory();
    let (_, project_id) = seeded_project(&mut s);
    let slot = s
        .load_slots(project_id, TestKind::Cyclic)
        .unwrap()
        .remove(&0)
        .unwrap();
    s.mark_finished(slot.slot_id, MonotonicTimeNs(5)).unwrap();

    let params = SlotParams::Cyclic(CyclicTestParams::v1(70.0, 10.0, 10).unwrap());
    assert_eq!(
        s.override_slot_params_row(slot.slot_id, params.clone()),
        Err(StorageError::SlotFinished {
            slot_id: slot.slot_id
        })
    );

    let batch = UpsertBatch::v1(
        project_id,
        TestKind::Cyclic,
        vec![UpsertOp::UpdateDerivedFields {
            slot_id: slot.slot_id,
            index: 0,
            params,
        }],
    )
    .unwrap();
    assert!(matches!(
        s.apply_upserts(&batch),
        Err(StorageError::SlotFinished { .. })
    ));
    assert_eq!(s.load_slot(slot.slot_id).unwrap().params, slot.params);
}

#[test]
fn at_program_store_db_06_override_replaces_draft_params() {
    let mut s = ProgramStore::new_in_memory();
    let (_, project_id) = seeded_project(&mut s);
    let slot = s
        .load_slots(project_id, TestKind::Cyclic)
        .unwrap()
        .remove(&2)
        .unwrap();
    let params = SlotParams::Cyclic(CyclicTestParams::v1(90.0, 45.0, 700).unwrap());
    let updated = s
        .override_slot_params_row(slot.slot_id, params.clone())
        .unwrap();
    assert_eq!(updated.params, params);
    assert!(!updated.finished);
}

#[test]
fn at_program_store_db_07_audit_ledger_append_only_and_scoped() {
    let mut s = ProgramStore::new_in_memory();
    let (_, project_id) = seeded_project(&mut s);
    let input = ProgramAuditEventInput::v1(
        MonotonicTimeNs(20),
        project_id,
        ProgramAuditEventType::SlotFinished,
        Some(TestKind::Static),
        Some(0),
        ReasonCodeId(0x5047_0001),
        Some("finish_static_0".to_string()),
    )
    .unwrap();

    let id = ProgramAuditRuntime::emit(&mut s, input.clone()).unwrap();
    let retry = s.append_audit_row(input).unwrap();
    assert_eq!(id, retry);
    assert_eq!(s.audit_rows().len(), 1);
    assert_eq!(s.audit_rows_by_project(project_id).len(), 1);
    assert!(s.audit_rows_by_project(ProjectId(99)).is_empty());
    assert!(matches!(
        s.attempt_overwrite_audit_event(id),
        Err(StorageError::AppendOnlyViolation { .. })
    ));
}

#[test]
fn at_program_store_db_08_audit_requires_known_project() {
    let mut s = ProgramStore::new_in_memory();
    let input = ProgramAuditEventInput::v1(
        MonotonicTimeNs(1),
        ProjectId(404),
        ProgramAuditEventType::ProjectCreated,
        None,
        None,
        ReasonCodeId(1),
        None,
    )
    .unwrap();
    assert!(matches!(
        ProgramAuditRuntime::emit(&mut s, input),
        Err(StorageError::ForeignKeyViolation { .. })
    ));
}
