//! Persisted rows. Every row is stored as CBOR under its big-endian id.
use crate::action::Action;
use crate::types::{
    FormId, FormStatus, LogId, RecordId, RecordStatus, SplitId, TimeStamp, UserId, VoucherId,
};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ReimbursementForm {
    #[n(0)]
    pub id: FormId,
    #[n(1)]
    pub owner_id: UserId,
    #[n(2)]
    pub form_number: String,
    #[n(3)]
    pub total_amount: u64, // minor units
    #[n(4)]
    pub status: FormStatus,
    #[n(5)]
    pub parent_form_id: Option<FormId>,
    #[n(6)]
    pub is_split_from_parent: bool,
    #[n(7)]
    pub split_reason: Option<String>,
    #[n(8)]
    pub approved_count: u64,
    #[n(9)]
    pub rejected_count: u64,
    #[n(10)]
    pub version: u64,
    #[n(11)]
    pub is_locked: bool,
    #[n(12)]
    pub lock_reason: Option<String>,
    #[n(13)]
    pub created_at: TimeStamp,
    #[n(14)]
    pub updated_at: TimeStamp,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ReimbursementRecord {
    #[n(0)]
    pub id: RecordId,
    #[n(1)]
    pub form_id: FormId,
    #[n(2)]
    pub amount: u64,
    #[n(3)]
    pub purpose: String,
    #[n(4)]
    pub expense_type: Option<String>,
    #[n(5)]
    pub approval_status: RecordStatus,
    #[n(6)]
    pub reject_reason: Option<String>,
    #[n(7)]
    pub approver_id: Option<UserId>,
    #[n(8)]
    pub approved_at: Option<TimeStamp>,
    // invoice extraction metadata, carried through untouched
    #[n(9)]
    pub invoice_number: Option<String>,
    #[n(10)]
    pub invoice_date: Option<String>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Voucher {
    #[n(0)]
    pub id: VoucherId,
    #[n(1)]
    pub form_id: FormId,
    #[n(2)]
    pub original_name: String,
    #[n(3)]
    pub stored_path: String, // relative to the storage root
    #[n(4)]
    pub content_type: Option<String>,
    #[n(5)]
    pub size: u64,
    #[n(6)]
    pub uploaded_by: UserId,
    #[n(7)]
    pub uploaded_at: TimeStamp,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ApprovalLogEntry {
    #[n(0)]
    pub id: LogId,
    #[n(1)]
    pub form_id: FormId,
    #[n(2)]
    pub approver_id: UserId,
    #[n(3)]
    pub action: Action,
    #[n(4)]
    pub approved_ids: Vec<RecordId>,
    #[n(5)]
    pub rejected_ids: Vec<RecordId>,
    #[n(6)]
    pub new_form_id: Option<FormId>,
    #[n(7)]
    pub comment: String,
    #[n(8)]
    pub fingerprint: String,
    #[n(9)]
    pub resulting_status: FormStatus,
    #[n(10)]
    pub version_before: u64,
    #[n(11)]
    pub version_after: u64,
    #[n(12)]
    pub created_at: TimeStamp,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct SplitEdge {
    #[n(0)]
    pub id: SplitId,
    #[n(1)]
    pub original_form_id: FormId,
    #[n(2)]
    pub new_form_id: FormId,
    #[n(3)]
    pub split_type: String,
    #[n(4)]
    pub moved_record_ids: Vec<RecordId>,
    #[n(5)]
    pub created_by: UserId,
    #[n(6)]
    pub created_at: TimeStamp,
}

/// Draft of a form, filled in with chained setters.
#[derive(Debug, Default, Clone)]
pub struct NewForm {
    pub(crate) owner_id: UserId,
    pub(crate) form_number: String,
    pub(crate) draft: bool,
}

#[derive(Debug, Default, Clone)]
pub struct NewRecord {
    pub(crate) amount: u64,
    pub(crate) purpose: String,
    pub(crate) expense_type: Option<String>,
    pub(crate) invoice_number: Option<String>,
    pub(crate) invoice_date: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct NewVoucher {
    pub(crate) original_name: String,
    pub(crate) content_type: Option<String>,
    pub(crate) uploaded_by: UserId,
}

impl NewForm {
    pub fn new(owner_id: UserId, form_number: &str) -> Self {
        Self {
            owner_id,
            form_number: form_number.to_string(),
            draft: false,
        }
    }
    /// Keep the form in `draft` instead of submitting it straight away.
    pub fn as_draft(mut self) -> Self {
        self.draft = true;
        self
    }
}

impl NewRecord {
    pub fn new(amount: u64, purpose: &str) -> Self {
        Self {
            amount,
            purpose: purpose.to_string(),
            ..Default::default()
        }
    }
    pub fn set_expense_type(mut self, expense_type: &str) -> Self {
        self.expense_type = Some(expense_type.to_string());
        self
    }
    pub fn set_invoice(mut self, number: &str, date: &str) -> Self {
        self.invoice_number = Some(number.to_string());
        self.invoice_date = Some(date.to_string());
        self
    }
}

impl NewVoucher {
    pub fn new(original_name: &str, uploaded_by: UserId) -> Self {
        Self {
            original_name: original_name.to_string(),
            content_type: None,
            uploaded_by,
        }
    }
    pub fn set_content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_string());
        self
    }
}

impl ApprovalLogEntry {
    pub fn approved_count(&self) -> u64 {
        self.approved_ids.len() as u64
    }
    pub fn rejected_count(&self) -> u64 {
        self.rejected_ids.len() as u64
    }
}
