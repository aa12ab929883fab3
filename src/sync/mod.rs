//! Drift detection and reconciliation of the published mirror.

pub mod reconcile;
pub mod status;

pub use reconcile::{ReconcileError, ReconcileReport, Reconciler};
pub use status::{StatusBoard, SyncStatus, posts_by_status, status};
