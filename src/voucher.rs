//! Voucher storage and relocation of vouchers onto split-off forms.
//!
//! Relocation is copy-then-delete and runs in three phases around the
//! decision transaction:
//!
//! 1. [`Reallocator::prepare`] copies each affected file to a path under the
//!    new form and encodes the replacement voucher rows. Nothing in the
//!    database changes yet.
//! 2. [`ReallocationPlan::apply`] runs inside the decision transaction and
//!    rewrites voucher rows and links.
//! 3. After commit, [`Reallocator::finish`] deletes the files of retired
//!    vouchers. If the transaction aborts, [`Reallocator::discard`] deletes
//!    the copies instead.
//!
//! A crash anywhere in between leaves both files on disk, so no approved line
//! item ever loses its evidence. File failures never abort the decision; they
//! are returned as [`ReallocationWarning`]s.
use crate::error::{ApprovalError, Result};
use crate::model::Voucher;
use crate::schema::Tables;
use crate::types::{FormId, RecordId, TimeStamp, VoucherId};
use crate::utils::{EMPTY, id_key, new_uuid_to_bech32, tagged_pair_key, tagged_prefix, trailing_id};
use sled::transaction::{ConflictableTransactionResult, TransactionalTree};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::{fs, io};

pub(crate) const BY_RECORD: u8 = b'r';
pub(crate) const BY_VOUCHER: u8 = b'v';

/// Physical attachment storage. Paths are relative to the storage root.
pub trait VoucherStorage: Send + Sync {
    fn write(&self, path: &str, bytes: &[u8]) -> io::Result<()>;
    fn copy(&self, from: &str, to: &str) -> io::Result<()>;
    fn remove(&self, path: &str) -> io::Result<()>;
}

/// Stores vouchers as plain files below a root directory.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
    pub fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
    fn ensure_parent(path: &Path) -> io::Result<()> {
        match path.parent() {
            Some(parent) => fs::create_dir_all(parent),
            None => Ok(()),
        }
    }
}

impl VoucherStorage for FsStorage {
    fn write(&self, path: &str, bytes: &[u8]) -> io::Result<()> {
        let target = self.resolve(path);
        Self::ensure_parent(&target)?;
        fs::write(target, bytes)
    }
    fn copy(&self, from: &str, to: &str) -> io::Result<()> {
        let target = self.resolve(to);
        Self::ensure_parent(&target)?;
        fs::copy(self.resolve(from), target).map(|_| ())
    }
    fn remove(&self, path: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(path))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReallocationWarning {
    LookupFailed {
        record_id: RecordId,
        reason: String,
    },
    VoucherUnavailable {
        voucher_id: VoucherId,
        reason: String,
    },
    CopyFailed {
        voucher_id: VoucherId,
        from: String,
        to: String,
        reason: String,
    },
    CleanupFailed {
        voucher_id: VoucherId,
        path: String,
        reason: String,
    },
}

/// One voucher duplicated onto the new form.
#[derive(Debug, Clone)]
pub struct VoucherMove {
    pub old: Voucher,
    pub new: Voucher,
    /// Approved records relinked from `old` to `new`.
    pub records: Vec<RecordId>,
    /// False when a rejected record still links `old`; it then stays behind.
    pub retire_old: bool,
    encoded: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct ReallocationPlan {
    pub moves: Vec<VoucherMove>,
    pub warnings: Vec<ReallocationWarning>,
}

pub struct Reallocator<'a> {
    tables: &'a Tables,
    storage: &'a dyn VoucherStorage,
}

impl<'a> Reallocator<'a> {
    pub fn new(tables: &'a Tables, storage: &'a dyn VoucherStorage) -> Self {
        Self { tables, storage }
    }

    /// Copies the file of every voucher linked to an approved record.
    pub fn prepare(
        &self,
        original_form_id: FormId,
        new_form_id: FormId,
        approved: &[RecordId],
    ) -> ReallocationPlan {
        let mut plan = ReallocationPlan::default();
        let approved_set: BTreeSet<RecordId> = approved.iter().copied().collect();

        // voucher id -> approved records linked to it
        let mut affected: BTreeMap<VoucherId, Vec<RecordId>> = BTreeMap::new();
        for &record_id in approved {
            match linked_vouchers(self.tables, record_id) {
                Ok(vouchers) => {
                    for voucher_id in vouchers {
                        affected.entry(voucher_id).or_default().push(record_id);
                    }
                }
                Err(e) => plan.warn(ReallocationWarning::LookupFailed {
                    record_id,
                    reason: e.to_string(),
                }),
            }
        }

        for (voucher_id, records) in affected {
            match self.copy_one(voucher_id, new_form_id, records, &approved_set) {
                Ok(Some(mv)) => plan.moves.push(mv),
                Ok(None) => {}
                Err(warning) => plan.warn(warning),
            }
        }

        tracing::debug!(
            form = original_form_id,
            new_form = new_form_id,
            moved = plan.moves.len(),
            warnings = plan.warnings.len(),
            "prepared voucher reallocation"
        );
        plan
    }

    fn copy_one(
        &self,
        voucher_id: VoucherId,
        new_form_id: FormId,
        records: Vec<RecordId>,
        approved: &BTreeSet<RecordId>,
    ) -> std::result::Result<Option<VoucherMove>, ReallocationWarning> {
        let lookup_failed = |reason: String| ReallocationWarning::VoucherUnavailable {
            voucher_id,
            reason,
        };

        let Some(old) = load_voucher(self.tables, voucher_id).map_err(|e| lookup_failed(e.to_string()))?
        else {
            // dangling link, nothing to copy
            return Ok(None);
        };
        let retire_old = linked_records(self.tables, voucher_id)
            .map_err(|e| lookup_failed(e.to_string()))?
            .iter()
            .all(|record_id| approved.contains(record_id));

        let new_path = relocated_path(new_form_id, &old.stored_path)
            .map_err(|e| lookup_failed(e.to_string()))?;
        self.storage
            .copy(&old.stored_path, &new_path)
            .map_err(|e| ReallocationWarning::CopyFailed {
                voucher_id,
                from: old.stored_path.clone(),
                to: new_path.clone(),
                reason: e.to_string(),
            })?;

        let built = self.tables.generate_id().and_then(|id| {
            let new = Voucher {
                id,
                form_id: new_form_id,
                stored_path: new_path.clone(),
                uploaded_at: TimeStamp::new(),
                ..old.clone()
            };
            let encoded = minicbor::to_vec(&new)?;
            Ok((new, encoded))
        });
        let (new, encoded) = match built {
            Ok(built) => built,
            Err(e) => {
                // the copy is unreachable without a row, drop it again
                let _ = self.storage.remove(&new_path);
                return Err(lookup_failed(e.to_string()));
            }
        };

        Ok(Some(VoucherMove {
            old,
            new,
            records,
            retire_old,
            encoded,
        }))
    }

    /// Deletes the files of retired vouchers once the decision has committed.
    pub fn finish(&self, plan: ReallocationPlan) -> Vec<ReallocationWarning> {
        let mut warnings = plan.warnings;
        for mv in plan.moves.iter().filter(|mv| mv.retire_old) {
            if let Err(e) = self.storage.remove(&mv.old.stored_path) {
                let warning = ReallocationWarning::CleanupFailed {
                    voucher_id: mv.old.id,
                    path: mv.old.stored_path.clone(),
                    reason: e.to_string(),
                };
                tracing::warn!(?warning, "voucher cleanup failed");
                warnings.push(warning);
            }
        }
        warnings
    }

    /// Removes the copies made by `prepare` after the decision was rolled back.
    pub fn discard(&self, plan: ReallocationPlan) {
        for mv in &plan.moves {
            if let Err(e) = self.storage.remove(&mv.new.stored_path) {
                tracing::warn!(
                    voucher = mv.new.id,
                    path = %mv.new.stored_path,
                    error = %e,
                    "failed to remove voucher copy after rollback"
                );
            }
        }
    }
}

impl ReallocationPlan {
    fn warn(&mut self, warning: ReallocationWarning) {
        tracing::warn!(?warning, "voucher reallocation degraded");
        self.warnings.push(warning);
    }

    /// Rewrites voucher rows and links. Runs inside the decision transaction.
    pub fn apply(
        &self,
        vouchers: &TransactionalTree,
        links: &TransactionalTree,
    ) -> ConflictableTransactionResult<(), ApprovalError> {
        for mv in &self.moves {
            vouchers.insert(&id_key(mv.new.id)[..], mv.encoded.as_slice())?;

            for &record_id in &mv.records {
                links.remove(&tagged_pair_key(BY_RECORD, record_id, mv.old.id)[..])?;
                links.remove(&tagged_pair_key(BY_VOUCHER, mv.old.id, record_id)[..])?;
                links.insert(&tagged_pair_key(BY_RECORD, record_id, mv.new.id)[..], EMPTY)?;
                links.insert(&tagged_pair_key(BY_VOUCHER, mv.new.id, record_id)[..], EMPTY)?;
            }

            if mv.retire_old {
                vouchers.remove(&id_key(mv.old.id)[..])?;
            }
        }
        Ok(())
    }
}

/// `<new form id>/<random name><original extension>`
fn relocated_path(new_form_id: FormId, old_path: &str) -> anyhow::Result<String> {
    let name = new_uuid_to_bech32("voucher_")?;
    let extension = Path::new(old_path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default();

    Ok(format!("{new_form_id}/{name}{extension}"))
}

pub(crate) fn load_voucher(tables: &Tables, voucher_id: VoucherId) -> Result<Option<Voucher>> {
    match tables.vouchers.get(id_key(voucher_id))? {
        Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
        None => Ok(None),
    }
}

pub(crate) fn linked_vouchers(tables: &Tables, record_id: RecordId) -> Result<Vec<VoucherId>> {
    scan_ids(tables, BY_RECORD, record_id)
}

pub(crate) fn linked_records(tables: &Tables, voucher_id: VoucherId) -> Result<Vec<RecordId>> {
    scan_ids(tables, BY_VOUCHER, voucher_id)
}

fn scan_ids(tables: &Tables, tag: u8, id: u64) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for key in tables.voucher_links.scan_prefix(tagged_prefix(tag, id)).keys() {
        if let Some(id) = trailing_id(&key?) {
            ids.push(id);
        }
    }
    Ok(ids)
}
