//! Approval and split engine for expense reimbursement forms.
//!
//! [`service::ApprovalService`] is the entry point: it applies approver
//! decisions under optimistic concurrency control, replays duplicate
//! submissions from the approval log, and splits partially approved forms.

pub mod action;
pub mod audit;
pub mod config;
pub mod decision;
pub mod error;
pub mod fingerprint;
pub mod history;
pub mod model;
pub mod schema;
pub mod service;
pub mod store;
pub mod types;
pub mod utils;
pub mod voucher;

pub use error::{ApprovalError, Result};
