//! Row access and the owner-side writes the approval engine depends on
use crate::error::{ApprovalError, Result};
use crate::model::{
    ApprovalLogEntry, NewForm, NewRecord, NewVoucher, ReimbursementForm, ReimbursementRecord,
    Voucher,
};
use crate::schema::Tables;
use crate::types::{FormId, FormStatus, LogId, RecordId, RecordStatus, Role, TimeStamp, UserId};
use crate::utils::{EMPTY, id_key, pair_key, tagged_pair_key, tagged_prefix, trailing_id};
use crate::voucher::{self, BY_RECORD, BY_VOUCHER, VoucherStorage};
use sled::Transactional;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionResult, TransactionalTree,
};
use std::sync::Arc;

pub(crate) const LOGS_BY_FORM: u8 = b'f';
pub(crate) const LOGS_BY_FINGERPRINT: u8 = b'p';

pub(crate) fn abort<E: Into<ApprovalError>>(e: E) -> ConflictableTransactionError<ApprovalError> {
    ConflictableTransactionError::Abort(e.into())
}

pub(crate) fn settle<T>(result: TransactionResult<T, ApprovalError>) -> Result<T> {
    result.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => ApprovalError::Storage(e),
    })
}

pub(crate) fn encode<T: minicbor::Encode<()>>(row: &T) -> Result<Vec<u8>> {
    Ok(minicbor::to_vec(row)?)
}

pub(crate) fn tx_get<T>(tree: &TransactionalTree, id: u64) -> ConflictableTransactionResult<Option<T>, ApprovalError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    match tree.get(id_key(id))? {
        Some(bytes) => minicbor::decode(&bytes).map(Some).map_err(abort),
        None => Ok(None),
    }
}

pub(crate) fn tx_put<T: minicbor::Encode<()>>(
    tree: &TransactionalTree,
    id: u64,
    row: &T,
) -> ConflictableTransactionResult<(), ApprovalError> {
    let bytes = encode(row).map_err(abort)?;
    tree.insert(&id_key(id)[..], bytes)?;
    Ok(())
}

pub(crate) fn load_form(tables: &Tables, form_id: FormId) -> Result<Option<ReimbursementForm>> {
    match tables.forms.get(id_key(form_id))? {
        Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
        None => Ok(None),
    }
}

pub(crate) fn require_form(tables: &Tables, form_id: FormId) -> Result<ReimbursementForm> {
    load_form(tables, form_id)?.ok_or(ApprovalError::NotFound(form_id))
}

pub(crate) fn load_record(tables: &Tables, record_id: RecordId) -> Result<Option<ReimbursementRecord>> {
    match tables.records.get(id_key(record_id))? {
        Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
        None => Ok(None),
    }
}

pub(crate) fn load_log(tables: &Tables, log_id: LogId) -> Result<Option<ApprovalLogEntry>> {
    match tables.approval_logs.get(id_key(log_id))? {
        Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
        None => Ok(None),
    }
}

pub(crate) fn record_ids_of(tables: &Tables, form_id: FormId) -> Result<Vec<RecordId>> {
    let mut ids = Vec::new();
    for key in tables.form_records.scan_prefix(id_key(form_id)).keys() {
        if let Some(id) = trailing_id(&key?) {
            ids.push(id);
        }
    }
    Ok(ids)
}

pub(crate) fn records_of(tables: &Tables, form_id: FormId) -> Result<Vec<ReimbursementRecord>> {
    let mut records = Vec::new();
    for id in record_ids_of(tables, form_id)? {
        if let Some(record) = load_record(tables, id)? {
            records.push(record);
        }
    }
    Ok(records)
}

/// Log entries of one form, oldest first.
pub(crate) fn logs_of(tables: &Tables, form_id: FormId) -> Result<Vec<ApprovalLogEntry>> {
    let mut logs = Vec::new();
    for key in tables.log_index.scan_prefix(tagged_prefix(LOGS_BY_FORM, form_id)).keys() {
        let Some(log_id) = trailing_id(&key?) else {
            continue;
        };
        if let Some(entry) = load_log(tables, log_id)? {
            logs.push(entry);
        }
    }
    Ok(logs)
}

pub(crate) fn latest_log(tables: &Tables, form_id: FormId) -> Result<Option<ApprovalLogEntry>> {
    let last = tables
        .log_index
        .scan_prefix(tagged_prefix(LOGS_BY_FORM, form_id))
        .keys()
        .next_back()
        .transpose()?;

    match last.as_deref().and_then(trailing_id) {
        Some(log_id) => load_log(tables, log_id),
        None => Ok(None),
    }
}

/// A parent must be an older form. Ids grow monotonically, so this rules out cycles.
pub(crate) fn check_lineage(child: FormId, parent: FormId) -> Result<()> {
    if parent >= child {
        return Err(ApprovalError::InvalidParent { child, parent });
    }
    Ok(())
}

/// Owner-side writes and plain reads over forms, line items and vouchers.
#[derive(Clone)]
pub struct FormStore {
    tables: Tables,
    storage: Arc<dyn VoucherStorage>,
}

impl FormStore {
    pub fn new(tables: Tables, storage: Arc<dyn VoucherStorage>) -> Self {
        Self { tables, storage }
    }

    pub fn form(&self, form_id: FormId) -> Result<ReimbursementForm> {
        require_form(&self.tables, form_id)
    }

    pub fn record(&self, record_id: RecordId) -> Result<Option<ReimbursementRecord>> {
        load_record(&self.tables, record_id)
    }

    pub fn records_of(&self, form_id: FormId) -> Result<Vec<ReimbursementRecord>> {
        records_of(&self.tables, form_id)
    }

    pub fn logs_of(&self, form_id: FormId) -> Result<Vec<ApprovalLogEntry>> {
        logs_of(&self.tables, form_id)
    }

    pub fn voucher(&self, voucher_id: u64) -> Result<Option<Voucher>> {
        voucher::load_voucher(&self.tables, voucher_id)
    }

    pub fn vouchers_of_record(&self, record_id: RecordId) -> Result<Vec<Voucher>> {
        let mut vouchers = Vec::new();
        for id in voucher::linked_vouchers(&self.tables, record_id)? {
            if let Some(v) = voucher::load_voucher(&self.tables, id)? {
                vouchers.push(v);
            }
        }
        Ok(vouchers)
    }

    pub fn create_form(&self, new: NewForm) -> Result<ReimbursementForm> {
        let now = TimeStamp::new();
        let form = ReimbursementForm {
            id: self.tables.generate_id()?,
            owner_id: new.owner_id,
            form_number: new.form_number,
            total_amount: 0,
            status: if new.draft {
                FormStatus::Draft
            } else {
                FormStatus::Submitted
            },
            parent_form_id: None,
            is_split_from_parent: false,
            split_reason: None,
            approved_count: 0,
            rejected_count: 0,
            version: 1,
            is_locked: false,
            lock_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.tables.forms.insert(id_key(form.id), encode(&form)?)?;

        Ok(form)
    }

    /// Appends a pending line item. Counts as an edit of the form, so the version moves.
    pub fn add_record(&self, form_id: FormId, new: NewRecord) -> Result<ReimbursementRecord> {
        let record = ReimbursementRecord {
            id: self.tables.generate_id()?,
            form_id,
            amount: new.amount,
            purpose: new.purpose,
            expense_type: new.expense_type,
            approval_status: RecordStatus::Pending,
            reject_reason: None,
            approver_id: None,
            approved_at: None,
            invoice_number: new.invoice_number,
            invoice_date: new.invoice_date,
        };

        let result = (&self.tables.forms, &self.tables.records, &self.tables.form_records)
            .transaction(|(forms, records, form_records)| {
                let mut form: ReimbursementForm =
                    tx_get(forms, form_id)?.ok_or_else(|| abort(ApprovalError::NotFound(form_id)))?;
                ensure_editable(&form).map_err(abort)?;

                form.total_amount = form
                    .total_amount
                    .checked_add(record.amount)
                    .ok_or_else(|| abort(ApprovalError::AmountOverflow(form_id)))?;
                form.version += 1;
                form.updated_at = TimeStamp::new();
                tx_put(forms, form_id, &form)?;
                tx_put(records, record.id, &record)?;
                form_records.insert(&pair_key(form_id, record.id)[..], EMPTY)?;
                Ok(())
            });
        settle(result)?;

        Ok(record)
    }

    /// Stores the file and links the voucher to each record. All records must share one form.
    /// Counts as an edit of the form, so a split that already scanned its vouchers conflicts.
    pub fn attach_voucher(
        &self,
        record_ids: &[RecordId],
        new: NewVoucher,
        bytes: &[u8],
    ) -> Result<Voucher> {
        let mut form_id = None;
        for &record_id in record_ids {
            let record = load_record(&self.tables, record_id)?.ok_or(
                ApprovalError::InvalidRecordIds {
                    foreign: vec![record_id],
                    duplicated: vec![],
                },
            )?;
            match form_id {
                None => form_id = Some(record.form_id),
                Some(id) if id != record.form_id => {
                    return Err(ApprovalError::InvalidRecordIds {
                        foreign: vec![record_id],
                        duplicated: vec![],
                    });
                }
                Some(_) => {}
            }
        }
        let Some(form_id) = form_id else {
            return Err(ApprovalError::InvalidRecordIds {
                foreign: vec![],
                duplicated: vec![],
            });
        };
        let current = require_form(&self.tables, form_id)?;
        ensure_editable(&current)?;
        let seen_version = current.version;

        let id = self.tables.generate_id()?;
        let extension = std::path::Path::new(&new.original_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{ext}"))
            .unwrap_or_default();
        let stored_path = format!("{form_id}/{id}{extension}");
        self.storage.write(&stored_path, bytes)?;

        let voucher = Voucher {
            id,
            form_id,
            original_name: new.original_name,
            stored_path,
            content_type: new.content_type,
            size: bytes.len() as u64,
            uploaded_by: new.uploaded_by,
            uploaded_at: TimeStamp::new(),
        };

        let result = (&self.tables.forms, &self.tables.vouchers, &self.tables.voucher_links).transaction(
            |(forms, vouchers, links)| {
                let mut form: ReimbursementForm =
                    tx_get(forms, form_id)?.ok_or_else(|| abort(ApprovalError::NotFound(form_id)))?;
                // the records were checked against this edition of the form
                if form.version != seen_version {
                    return Err(abort(ApprovalError::Conflict {
                        form_id,
                        expected: seen_version,
                        actual: form.version,
                    }));
                }
                form.version += 1;
                form.updated_at = TimeStamp::new();
                tx_put(forms, form_id, &form)?;

                tx_put(vouchers, voucher.id, &voucher)?;
                for &record_id in record_ids {
                    links.insert(&tagged_pair_key(BY_RECORD, record_id, voucher.id)[..], EMPTY)?;
                    links.insert(&tagged_pair_key(BY_VOUCHER, voucher.id, record_id)[..], EMPTY)?;
                }
                Ok(())
            },
        );
        if let Err(e) = settle(result) {
            let _ = self.storage.remove(&voucher.stored_path);
            return Err(e);
        }

        Ok(voucher)
    }

    /// Reopens a rejected form for another round of review.
    pub fn resubmit(&self, form_id: FormId, owner_id: UserId) -> Result<ReimbursementForm> {
        let current = require_form(&self.tables, form_id)?;
        if current.owner_id != owner_id {
            return Err(ApprovalError::NotOwner {
                form_id,
                user: owner_id,
            });
        }
        if !current.status.is_rejected() {
            return Err(ApprovalError::Forbidden {
                role: Role::Employee,
                status: current.status,
            });
        }
        let record_ids = record_ids_of(&self.tables, form_id)?;
        let seen_version = current.version;

        let result = (&self.tables.forms, &self.tables.records).transaction(|(forms, records)| {
            let mut form: ReimbursementForm =
                tx_get(forms, form_id)?.ok_or_else(|| abort(ApprovalError::NotFound(form_id)))?;
            if form.version != seen_version {
                return Err(abort(ApprovalError::Conflict {
                    form_id,
                    expected: seen_version,
                    actual: form.version,
                }));
            }

            for &record_id in &record_ids {
                let Some(mut record): Option<ReimbursementRecord> = tx_get(records, record_id)? else {
                    continue;
                };
                record.approval_status = RecordStatus::Pending;
                record.reject_reason = None;
                record.approver_id = None;
                record.approved_at = None;
                tx_put(records, record_id, &record)?;
            }

            form.status = FormStatus::Submitted;
            form.is_locked = false;
            form.lock_reason = None;
            form.approved_count = 0;
            form.rejected_count = 0;
            form.version += 1;
            form.updated_at = TimeStamp::new();
            tx_put(forms, form_id, &form)?;
            Ok(form)
        });

        settle(result)
    }
}

fn ensure_editable(form: &ReimbursementForm) -> Result<()> {
    if form.is_locked {
        return Err(ApprovalError::Locked(form.id));
    }
    if !matches!(form.status, FormStatus::Draft | FormStatus::Submitted) {
        return Err(ApprovalError::Forbidden {
            role: Role::Employee,
            status: form.status,
        });
    }
    Ok(())
}
