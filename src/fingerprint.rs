//! Decision digests used to recognise replayed submissions
use crate::model::ApprovalLogEntry;
use crate::schema::Tables;
use crate::store::{LOGS_BY_FINGERPRINT, load_log};
use crate::types::{FormId, RecordId, UserId};
use crate::utils::tagged_pair_key;

// Canonical form hashed into the digest. Field order is part of the encoding.
#[derive(minicbor::Encode, Debug)]
struct CanonicalDecision<'a> {
    #[n(0)]
    approved: Vec<RecordId>,
    #[n(1)]
    rejected: Vec<RecordId>,
    #[n(2)]
    comment: &'a str,
    #[n(3)]
    version: u64,
}

/// Hex encoded SHA-256 over the decision with both id lists sorted ascending.
/// The form version scopes the digest to one edition of the form.
pub fn fingerprint(
    approved: &[RecordId],
    rejected: &[RecordId],
    comment: &str,
    version: u64,
) -> crate::Result<String> {
    let mut approved = approved.to_vec();
    let mut rejected = rejected.to_vec();
    approved.sort_unstable();
    rejected.sort_unstable();

    let canonical = CanonicalDecision {
        approved,
        rejected,
        comment,
        version,
    };
    let cbor = minicbor::to_vec(&canonical)?;

    Ok(sha256::digest(&cbor))
}

/// Index key of the most recent log entry for `(form, approver, digest)`.
pub(crate) fn replay_key(form_id: FormId, approver_id: UserId, digest: &str) -> Vec<u8> {
    let mut key = tagged_pair_key(LOGS_BY_FINGERPRINT, form_id, approver_id).to_vec();
    key.extend_from_slice(digest.as_bytes());
    key
}

/// Looks up an already recorded decision with the same digest by the same approver.
pub fn find_replay(
    tables: &Tables,
    form_id: FormId,
    approver_id: UserId,
    digest: &str,
) -> crate::Result<Option<ApprovalLogEntry>> {
    let Some(log_id) = tables.log_index.get(replay_key(form_id, approver_id, digest))? else {
        return Ok(None);
    };
    let Ok(bytes) = <[u8; 8]>::try_from(&log_id[..]) else {
        return Ok(None);
    };
    load_log(tables, u64::from_be_bytes(bytes))
}
