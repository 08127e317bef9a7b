//! Portal wiring: the shared context, dataset views, admin writes and
//! public application tracking.

pub mod admin;
pub mod context;
pub mod tracking;
pub mod views;

pub use admin::{AdminError, AdminService};
pub use context::PortalContext;
pub use tracking::{ApplicationTracker, TrackingError};
pub use views::{DatasetView, ViewSpec};
