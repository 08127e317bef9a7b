//! Shared domain enumerations aligned with the backend's table names.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::DomainError;

/// Tables of the hosted data store that portal views read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    WaterQualityData,
    SewerQualityData,
    WaterSamples,
    TestParameters,
    LicenseApplications,
}

impl Table {
    pub const ALL: [Table; 5] = [
        Table::WaterQualityData,
        Table::SewerQualityData,
        Table::WaterSamples,
        Table::TestParameters,
        Table::LicenseApplications,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Table::WaterQualityData => "water_quality_data",
            Table::SewerQualityData => "sewer_quality_data",
            Table::WaterSamples => "water_samples",
            Table::TestParameters => "test_parameters",
            Table::LicenseApplications => "license_applications",
        }
    }

    /// Human-readable dataset name used in notifications.
    pub fn display_name(self) -> &'static str {
        match self {
            Table::WaterQualityData => "Water quality data",
            Table::SewerQualityData => "Sewer quality data",
            Table::WaterSamples => "Water samples",
            Table::TestParameters => "Test parameters",
            Table::LicenseApplications => "License applications",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Table::ALL
            .into_iter()
            .find(|table| table.as_str() == value)
            .ok_or_else(|| DomainError::unknown_table(value))
    }
}

/// Kind of row change, for local mutations and server-pushed notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RowOperation {
    Insert,
    Update,
    Delete,
}

impl RowOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            RowOperation::Insert => "INSERT",
            RowOperation::Update => "UPDATE",
            RowOperation::Delete => "DELETE",
        }
    }

    /// Past-tense verb for notifications.
    pub fn verb(self) -> &'static str {
        match self {
            RowOperation::Insert => "added",
            RowOperation::Update => "updated",
            RowOperation::Delete => "deleted",
        }
    }
}

impl FromStr for RowOperation {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(RowOperation::Insert),
            "UPDATE" => Ok(RowOperation::Update),
            "DELETE" => Ok(RowOperation::Delete),
            _ => Err(DomainError::unknown_operation(value)),
        }
    }
}
