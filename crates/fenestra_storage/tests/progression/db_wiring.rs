#![forbid(unsafe_code)]

use fenestra_engines::slot_reconcile::{ReconcilerConfig, TestSlotReconciler};
use fenestra_kernel_contracts::project::{DesignPressures, ProjectId, ProjectInput};
use fenestra_kernel_contracts::test_slot::{TestKind, TestSlotId};
use fenestra_kernel_contracts::MonotonicTimeNs;
use fenestra_storage::program_store::{FinishOutcome, ProgramStore, StorageError};
use fenestra_storage::repo::{DeviceProjectRepo, TestSlotRepo};

fn seeded() -> (ProgramStore, ProjectId) {
    let mut s = ProgramStore::new_in_memory();
    let device_id = s
        .insert_device_row("Fixed pane".to_string(), MonotonicTimeNs(1))
        .unwrap();
    let input = ProjectInput::v1(
        "Pane run".to_string(),
        DesignPressures::v1(100.0, 200.0).unwrap(),
    )
    .unwrap();
    let project_id = s
        .insert_project_row(device_id, input, MonotonicTimeNs(2))
        .unwrap();
    let rc = TestSlotReconciler::new(ReconcilerConfig::mvp_v1());
    let pressures = s.load_project(project_id).unwrap().design_pressures;
    for kind in TestKind::ALL {
        let batch = rc
            .reconcile(
                project_id,
                &pressures,
                kind,
                &s.load_slots(project_id, kind).unwrap(),
            )
            .unwrap();
        s.apply_upserts(&batch).unwrap();
    }
    (s, project_id)
}

fn slot_id(s: &ProgramStore, project_id: ProjectId, kind: TestKind, index: u8) -> TestSlotId {
    s.load_slots(project_id, kind).unwrap()[&index].slot_id
}

#[test]
fn at_progression_db_01_in_order_finishes_succeed() {
    let (mut s, project_id) = seeded();
    for index in 0..3 {
        let id = slot_id(&s, project_id, TestKind::Cyclic, index);
        let out = s.mark_finished(id, MonotonicTimeNs(10 + u64::from(index)));
        assert!(matches!(out, Ok(FinishOutcome::Finished(_))));
    }
    let finished: Vec<bool> = s
        .load_slots_ordered_by_index(project_id, TestKind::Cyclic)
        .unwrap()
        .iter()
        .map(|slot| slot.finished)
        .collect();
    assert_eq!(
        finished,
        vec![true, true, true, false, false, false, false, false]
    );
}

#[test]
fn at_progression_db_02_out_of_order_finish_is_rejected_without_state_change() {
    let (mut s, project_id) = seeded();
    let id = slot_id(&s, project_id, TestKind::Cyclic, 3);
    assert_eq!(
        s.mark_finished(id, MonotonicTimeNs(10)),
        Err(StorageError::OutOfOrderFinish {
            project_id,
            kind: TestKind::Cyclic,
            target_index: 3,
            blocking_index: 0,
        })
    );
    assert!(!s.load_slot(id).unwrap().finished);
}

#[test]
fn at_progression_db_03_refinish_is_a_no_op() {
    let (mut s, project_id) = seeded();
    let id = slot_id(&s, project_id, TestKind::Static, 0);
    let first = s.mark_finished(id, MonotonicTimeNs(10)).unwrap();
    let again = s.mark_finished(id, MonotonicTimeNs(20)).unwrap();
    assert!(matches!(first, FinishOutcome::Finished(_)));
    assert!(matches!(again, FinishOutcome::AlreadyFinished(_)));
    assert_eq!(again.slot().finished_at, Some(MonotonicTimeNs(10)));
}

#[test]
fn at_progression_db_04_static_and_cyclic_tracks_are_independent() {
    let (mut s, project_id) = seeded();
    for index in 0..4 {
        let id = slot_id(&s, project_id, TestKind::Static, index);
        s.mark_finished(id, MonotonicTimeNs(10)).unwrap();
    }
    let cyclic_1 = slot_id(&s, project_id, TestKind::Cyclic, 1);
    assert!(matches!(
        s.mark_finished(cyclic_1, MonotonicTimeNs(11)),
        Err(StorageError::OutOfOrderFinish {
            blocking_index: 0,
            ..
        })
    ));
    let cyclic_0 = slot_id(&s, project_id, TestKind::Cyclic, 0);
    assert!(s.mark_finished(cyclic_0, MonotonicTimeNs(12)).is_ok());
}

#[test]
fn at_progression_db_05_finish_order_spans_directions() {
    let (mut s, project_id) = seeded();
    for index in 0..2 {
        let id = slot_id(&s, project_id, TestKind::Static, index);
        s.mark_finished(id, MonotonicTimeNs(10)).unwrap();
    }
    // First outward slot waits on the last inward slot.
    let outward_first = slot_id(&s, project_id, TestKind::Static, 3);
    assert!(matches!(
        s.mark_finished(outward_first, MonotonicTimeNs(11)),
        Err(StorageError::OutOfOrderFinish {
            blocking_index: 2,
            ..
        })
    ));
}
