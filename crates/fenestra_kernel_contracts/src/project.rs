#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::{validate_label, validate_positive_finite};
use crate::test_slot::PressureDirection;
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const PROJECT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

const MAX_NAME_LEN: usize = 256;

/// Accepted design pressure range. Every derivation factor lies in 0.2..=1.5 (or is zero), so
/// any pressure in this range derives strictly positive, finite test pressures.
pub const MIN_DESIGN_PRESSURE: f64 = 1.0e-3;
pub const MAX_DESIGN_PRESSURE: f64 = 1.0e9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u64);

impl Validate for DeviceId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "device_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProjectId(pub u64);

impl Validate for ProjectId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "project_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

/// The two engineering inputs every derived test parameter is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DesignPressures {
    pub inward_design_pressure: f64,
    pub outward_design_pressure: f64,
}

impl DesignPressures {
    pub fn v1(
        inward_design_pressure: f64,
        outward_design_pressure: f64,
    ) -> Result<Self, ContractViolation> {
        let p = Self {
            inward_design_pressure,
            outward_design_pressure,
        };
        p.validate()?;
        Ok(p)
    }

    pub fn for_direction(&self, direction: PressureDirection) -> f64 {
        match direction {
            PressureDirection::Inward => self.inward_design_pressure,
            PressureDirection::Outward => self.outward_design_pressure,
        }
    }
}

impl Validate for DesignPressures {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_design_pressure(
            "design_pressures.inward_design_pressure",
            self.inward_design_pressure,
        )?;
        validate_design_pressure(
            "design_pressures.outward_design_pressure",
            self.outward_design_pressure,
        )?;
        Ok(())
    }
}

fn validate_design_pressure(field: &'static str, value: f64) -> Result<(), ContractViolation> {
    validate_positive_finite(field, value)?;
    if !(MIN_DESIGN_PRESSURE..=MAX_DESIGN_PRESSURE).contains(&value) {
        return Err(ContractViolation::InvalidRange {
            field,
            min: MIN_DESIGN_PRESSURE,
            max: MAX_DESIGN_PRESSURE,
            got: value,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub schema_version: SchemaVersion,
    pub device_id: DeviceId,
    pub name: String,
    pub created_at: MonotonicTimeNs,
}

impl DeviceRecord {
    pub fn v1(
        device_id: DeviceId,
        name: String,
        created_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: PROJECT_CONTRACT_VERSION,
            device_id,
            name,
            created_at,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for DeviceRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PROJECT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "device_record.schema_version",
                reason: "must match PROJECT_CONTRACT_VERSION",
            });
        }
        self.device_id.validate()?;
        validate_label("device_record.name", &self.name, MAX_NAME_LEN)?;
        if self.created_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "device_record.created_at",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

/// Caller-supplied project fields, used both for creation and for updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectInput {
    pub schema_version: SchemaVersion,
    pub name: String,
    pub design_pressures: DesignPressures,
}

impl ProjectInput {
    pub fn v1(name: String, design_pressures: DesignPressures) -> Result<Self, ContractViolation> {
        let i = Self {
            schema_version: PROJECT_CONTRACT_VERSION,
            name,
            design_pressures,
        };
        i.validate()?;
        Ok(i)
    }
}

impl Validate for ProjectInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PROJECT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "project_input.schema_version",
                reason: "must match PROJECT_CONTRACT_VERSION",
            });
        }
        validate_label("project_input.name", &self.name, MAX_NAME_LEN)?;
        self.design_pressures.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub schema_version: SchemaVersion,
    pub project_id: ProjectId,
    pub device_id: DeviceId,
    pub name: String,
    pub design_pressures: DesignPressures,
    pub created_at: MonotonicTimeNs,
    pub updated_at: MonotonicTimeNs,
    /// Bumped on every committed update; starts at 1.
    pub revision: u64,
}

impl ProjectRecord {
    pub fn from_input_v1(
        project_id: ProjectId,
        device_id: DeviceId,
        input: ProjectInput,
        created_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        input.validate()?;
        let r = Self {
            schema_version: PROJECT_CONTRACT_VERSION,
            project_id,
            device_id,
            name: input.name,
            design_pressures: input.design_pressures,
            created_at,
            updated_at: created_at,
            revision: 1,
        };
        r.validate()?;
        Ok(r)
    }

    /// Returns the record as it looks after `input` is committed at `updated_at`.
    pub fn with_update_v1(
        &self,
        input: ProjectInput,
        updated_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        input.validate()?;
        if updated_at < self.updated_at {
            return Err(ContractViolation::InvalidValue {
                field: "project_record.updated_at",
                reason: "must not move backwards",
            });
        }
        let r = Self {
            name: input.name,
            design_pressures: input.design_pressures,
            updated_at,
            revision: self.revision.saturating_add(1),
            ..self.clone()
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for ProjectRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != PROJECT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "project_record.schema_version",
                reason: "must match PROJECT_CONTRACT_VERSION",
            });
        }
        self.project_id.validate()?;
        self.device_id.validate()?;
        validate_label("project_record.name", &self.name, MAX_NAME_LEN)?;
        self.design_pressures.validate()?;
        if self.created_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "project_record.created_at",
                reason: "must be > 0",
            });
        }
        if self.updated_at < self.created_at {
            return Err(ContractViolation::InvalidValue {
                field: "project_record.updated_at",
                reason: "must be >= created_at",
            });
        }
        if self.revision == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "project_record.revision",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_project_contract_01_design_pressures_must_be_positive_and_finite() {
        assert!(DesignPressures::v1(100.0, 200.0).is_ok());
        assert!(matches!(
            DesignPressures::v1(0.0, 200.0),
            Err(ContractViolation::InvalidValue {
                field: "design_pressures.inward_design_pressure",
                ..
            })
        ));
        assert!(matches!(
            DesignPressures::v1(100.0, f64::NAN),
            Err(ContractViolation::NotFinite {
                field: "design_pressures.outward_design_pressure"
            })
        ));
        assert!(DesignPressures::v1(-5.0, 10.0).is_err());
    }

    #[test]
    fn at_project_contract_05_design_pressures_are_bounded_at_both_ends() {
        assert!(DesignPressures::v1(MIN_DESIGN_PRESSURE, MAX_DESIGN_PRESSURE).is_ok());
        assert!(matches!(
            DesignPressures::v1(5e-324, 1.0),
            Err(ContractViolation::InvalidRange {
                field: "design_pressures.inward_design_pressure",
                ..
            })
        ));
        assert!(matches!(
            DesignPressures::v1(1.0, 1.5e308),
            Err(ContractViolation::InvalidRange {
                field: "design_pressures.outward_design_pressure",
                ..
            })
        ));
    }

    #[test]
    fn at_project_contract_02_direction_selects_matching_pressure() {
        let p = DesignPressures::v1(100.0, 200.0).unwrap();
        assert_eq!(p.for_direction(PressureDirection::Inward), 100.0);
        assert_eq!(p.for_direction(PressureDirection::Outward), 200.0);
    }

    #[test]
    fn at_project_contract_03_update_bumps_revision_and_keeps_identity() {
        let input = ProjectInput::v1(
            "Sliding door A".to_string(),
            DesignPressures::v1(100.0, 200.0).unwrap(),
        )
        .unwrap();
        let record =
            ProjectRecord::from_input_v1(ProjectId(7), DeviceId(3), input, MonotonicTimeNs(10))
                .unwrap();
        assert_eq!(record.revision, 1);

        let next_input = ProjectInput::v1(
            "Sliding door A rev".to_string(),
            DesignPressures::v1(150.0, 200.0).unwrap(),
        )
        .unwrap();
        let next = record
            .with_update_v1(next_input, MonotonicTimeNs(20))
            .unwrap();
        assert_eq!(next.project_id, ProjectId(7));
        assert_eq!(next.device_id, DeviceId(3));
        assert_eq!(next.created_at, MonotonicTimeNs(10));
        assert_eq!(next.updated_at, MonotonicTimeNs(20));
        assert_eq!(next.revision, 2);
        assert_eq!(next.design_pressures.inward_design_pressure, 150.0);
    }

    #[test]
    fn at_project_contract_04_blank_names_are_rejected() {
        assert!(matches!(
            ProjectInput::v1("  ".to_string(), DesignPressures::v1(1.0, 1.0).unwrap()),
            Err(ContractViolation::InvalidValue {
                field: "project_input.name",
                ..
            })
        ));
        assert!(DeviceRecord::v1(DeviceId(1), String::new(), MonotonicTimeNs(1)).is_err());
    }
}
