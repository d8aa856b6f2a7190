#![forbid(unsafe_code)]

use fenestra_kernel_contracts::project::{ProjectId, ProjectRecord};
use fenestra_kernel_contracts::test_slot::{TestKind, TestSlotRecord};
use fenestra_storage::program_store::{ProgramStore, StorageError};
use fenestra_storage::repo::{DeviceProjectRepo, TestSlotRepo};
use serde::{Deserialize, Serialize};

/// Read model of one project: the project row plus both slot programs in index order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramSnapshot {
    pub project: ProjectRecord,
    pub static_tests: Vec<TestSlotRecord>,
    pub cyclic_tests: Vec<TestSlotRecord>,
}

impl ProgramSnapshot {
    pub fn load(store: &ProgramStore, project_id: ProjectId) -> Result<Self, StorageError> {
        Ok(Self {
            project: store.load_project(project_id)?.clone(),
            static_tests: store.load_slots_ordered_by_index(project_id, TestKind::Static)?,
            cyclic_tests: store.load_slots_ordered_by_index(project_id, TestKind::Cyclic)?,
        })
    }

    /// Index of the first unfinished slot of `kind`, or `None` when the program is complete.
    pub fn next_unfinished(&self, kind: TestKind) -> Option<u8> {
        self.slots(kind)
            .iter()
            .find(|slot| !slot.finished)
            .map(|slot| slot.index)
    }

    pub fn slots(&self, kind: TestKind) -> &[TestSlotRecord] {
        match kind {
            TestKind::Static => &self.static_tests,
            TestKind::Cyclic => &self.cyclic_tests,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
