//! Domain layer types: the portal's tables and the rows the sync core reads.

pub mod entities;
pub mod error;
pub mod types;

pub use entities::{ApplicationState, LicenseApplication};
pub use error::DomainError;
pub use types::{RowOperation, Table};
