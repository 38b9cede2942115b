use crate::types::{FormId, FormStatus, RecordId, Role, UserId};

pub type Result<T, E = ApprovalError> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum ApprovalError {
    #[error("Form {0} does not exist")]
    NotFound(FormId),
    #[error("Role '{role}' may not decide on a form in status '{status}'")]
    Forbidden { role: Role, status: FormStatus },
    #[error("Version conflict on form {form_id}: expected {expected}, found {actual}")]
    Conflict {
        form_id: FormId,
        expected: u64,
        actual: u64,
    },
    #[error("Form {0} has no line items")]
    NoRecords(FormId),
    #[error("Submitted ids do not match the form: foreign {foreign:?}, duplicated {duplicated:?}")]
    InvalidRecordIds {
        foreign: Vec<RecordId>,
        duplicated: Vec<RecordId>,
    },
    #[error("Line items left without a decision: {unprocessed:?}")]
    UnprocessedRecords { unprocessed: Vec<RecordId> },
    #[error("Form {0} is locked")]
    Locked(FormId),
    #[error("User {user} does not own form {form_id}")]
    NotOwner { form_id: FormId, user: UserId },
    #[error("Line item {record_id} is no longer on form {form_id}")]
    RecordMoved { form_id: FormId, record_id: RecordId },
    #[error("Amounts on form {0} exceed the representable total")]
    AmountOverflow(FormId),
    #[error("Form {child} cannot descend from form {parent}")]
    InvalidParent { child: FormId, parent: FormId },
    #[error("Storage failure: {0}")]
    Storage(#[from] sled::Error),
    #[error("Failed to encode row: {0}")]
    Encode(String),
    #[error("Failed to decode row: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("Voucher file operation failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ApprovalError {
    /// Stable machine-readable code for the perimeter layer.
    pub fn code(&self) -> &'static str {
        match self {
            ApprovalError::NotFound(_) => "NOT_FOUND",
            ApprovalError::Forbidden { .. } => "FORBIDDEN",
            ApprovalError::Conflict { .. } | ApprovalError::RecordMoved { .. } => "CONFLICT",
            ApprovalError::NoRecords(_) => "NO_RECORDS",
            ApprovalError::InvalidRecordIds { .. } => "INVALID_RECORD_IDS",
            ApprovalError::UnprocessedRecords { .. } => "UNPROCESSED_RECORDS",
            ApprovalError::Locked(_) => "FORM_LOCKED",
            ApprovalError::NotOwner { .. } => "NOT_OWNER",
            ApprovalError::InvalidParent { .. } => "INVALID_PARENT",
            ApprovalError::AmountOverflow(_) => "AMOUNT_OVERFLOW",
            ApprovalError::Storage(_)
            | ApprovalError::Encode(_)
            | ApprovalError::Decode(_)
            | ApprovalError::Io(_) => "INTERNAL",
        }
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for ApprovalError {
    fn from(value: minicbor::encode::Error<E>) -> Self {
        ApprovalError::Encode(value.to_string())
    }
}
