//! Rows the sync core decodes directly. Every other table is handled as
//! opaque JSON.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Review state of a license application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationState {
    Submitted,
    UnderReview,
    Approved,
    Rejected,
}

impl ApplicationState {
    pub fn as_str(self) -> &'static str {
        match self {
            ApplicationState::Submitted => "submitted",
            ApplicationState::UnderReview => "under_review",
            ApplicationState::Approved => "approved",
            ApplicationState::Rejected => "rejected",
        }
    }

    pub fn is_final(self) -> bool {
        matches!(self, ApplicationState::Approved | ApplicationState::Rejected)
    }
}

/// A row of `license_applications` as exposed to public tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LicenseApplication {
    pub tracking_number: String,
    pub applicant_name: String,
    pub status: ApplicationState,
    #[serde(default)]
    pub remarks: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}
