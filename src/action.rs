//! Canonical decision outcomes.
//!
//! Two independent mappings live here. [`classify_by_counts`] picks the state
//! machine branch from the item counts alone. [`normalize_label`] maps the free
//! text action token sent by older callers onto the same vocabulary, and is
//! only ever used to report what the caller said it meant to do.
use std::fmt;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    #[n(0)]
    AllApproved,
    #[n(1)]
    AllRejected,
    #[n(2)]
    Partial,
    #[n(3)]
    Unknown,
}

impl Action {
    pub fn code(&self) -> &'static str {
        match self {
            Action::AllApproved => "ALL_APPROVED",
            Action::AllRejected => "ALL_REJECTED",
            Action::Partial => "PARTIAL",
            Action::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

pub fn classify_by_counts(approved: usize, rejected: usize, total: usize) -> Action {
    if total == 0 {
        return Action::Unknown;
    }
    if approved == total && rejected == 0 {
        return Action::AllApproved;
    }
    if rejected == total && approved == 0 {
        return Action::AllRejected;
    }
    if approved > 0 && rejected > 0 {
        return Action::Partial;
    }
    Action::Unknown
}

/// Maps legacy action spellings ("approve", "reject_all", "partial-approve", ...).
pub fn normalize_label(label: &str) -> Action {
    let label = label.trim().to_ascii_lowercase().replace('-', "_");

    match label.as_str() {
        "approve" | "approved" | "approve_all" | "all_approved" | "pass" => Action::AllApproved,
        "reject" | "rejected" | "reject_all" | "all_rejected" => Action::AllRejected,
        "partial" | "partial_approve" | "partial_approval" | "partial_approved" | "split" => {
            Action::Partial
        }
        _ => Action::Unknown,
    }
}
