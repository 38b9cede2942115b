//! Decision payloads, their validation, and the results handed back to callers
use crate::action::Action;
use crate::error::{ApprovalError, Result};
use crate::types::{FormId, FormStatus, LogId, RecordId};
use crate::voucher::ReallocationWarning;
use std::collections::BTreeSet;

/// An approver's decision over every line item of one form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decision {
    /// Free text action token. Reported back, never used to pick a branch.
    pub action: String,
    pub approved_ids: Vec<RecordId>,
    pub rejected_ids: Vec<RecordId>,
    pub comment: String,
    pub expected_version: Option<u64>,
}

impl Decision {
    pub fn new(action: &str) -> Self {
        Self {
            action: action.to_string(),
            ..Default::default()
        }
    }
    pub fn set_approved(mut self, ids: &[RecordId]) -> Self {
        self.approved_ids = ids.to_vec();
        self
    }
    pub fn set_rejected(mut self, ids: &[RecordId]) -> Self {
        self.rejected_ids = ids.to_vec();
        self
    }
    pub fn set_comment(mut self, comment: &str) -> Self {
        self.comment = comment.to_string();
        self
    }
    pub fn set_expected_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionOutcome {
    pub original_form_id: FormId,
    pub original_form_status: FormStatus,
    pub new_form_id: Option<FormId>,
    pub approved_count: u64,
    pub rejected_count: u64,
    /// What the caller's action token claimed.
    pub requested_action: Action,
    pub final_action: Action,
    pub version_after: u64,
    pub log_id: LogId,
    pub warnings: Vec<ReallocationWarning>,
}

/// The recorded outcome of a decision that had already been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub original_form_id: FormId,
    pub original_form_status: FormStatus,
    pub new_form_id: Option<FormId>,
    pub approved_count: u64,
    pub rejected_count: u64,
    pub log_id: LogId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionResult {
    Applied(DecisionOutcome),
    Replayed(ReplayOutcome),
}

impl DecisionResult {
    pub const REPLAY_CODE: &'static str = "IDEMPOTENT_REPLAY";

    pub fn code(&self) -> &'static str {
        match self {
            DecisionResult::Applied(_) => "APPLIED",
            DecisionResult::Replayed(_) => Self::REPLAY_CODE,
        }
    }
    pub fn is_replay(&self) -> bool {
        matches!(self, DecisionResult::Replayed(_))
    }
    pub fn original_form_id(&self) -> FormId {
        match self {
            DecisionResult::Applied(o) => o.original_form_id,
            DecisionResult::Replayed(o) => o.original_form_id,
        }
    }
    pub fn original_form_status(&self) -> FormStatus {
        match self {
            DecisionResult::Applied(o) => o.original_form_status,
            DecisionResult::Replayed(o) => o.original_form_status,
        }
    }
    pub fn new_form_id(&self) -> Option<FormId> {
        match self {
            DecisionResult::Applied(o) => o.new_form_id,
            DecisionResult::Replayed(o) => o.new_form_id,
        }
    }
    pub fn counts(&self) -> (u64, u64) {
        match self {
            DecisionResult::Applied(o) => (o.approved_count, o.rejected_count),
            DecisionResult::Replayed(o) => (o.approved_count, o.rejected_count),
        }
    }
    pub fn applied(self) -> Option<DecisionOutcome> {
        match self {
            DecisionResult::Applied(o) => Some(o),
            DecisionResult::Replayed(_) => None,
        }
    }
}

/// The submitted ids must split the form's line items exactly, with nothing
/// foreign, nothing repeated and nothing left over.
pub fn check_partition(
    form_records: &[RecordId],
    approved: &[RecordId],
    rejected: &[RecordId],
) -> Result<()> {
    let owned: BTreeSet<RecordId> = form_records.iter().copied().collect();
    let mut seen = BTreeSet::new();
    let mut duplicated = BTreeSet::new();
    let mut foreign = BTreeSet::new();

    for &id in approved.iter().chain(rejected) {
        if !seen.insert(id) {
            duplicated.insert(id);
        }
        if !owned.contains(&id) {
            foreign.insert(id);
        }
    }

    if !foreign.is_empty() || !duplicated.is_empty() {
        return Err(ApprovalError::InvalidRecordIds {
            foreign: foreign.into_iter().collect(),
            duplicated: duplicated.into_iter().collect(),
        });
    }

    let unprocessed: Vec<RecordId> = owned.difference(&seen).copied().collect();
    if !unprocessed.is_empty() {
        return Err(ApprovalError::UnprocessedRecords { unprocessed });
    }
    Ok(())
}
