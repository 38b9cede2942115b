//! Service layer API for approval decisions
use crate::action::{Action, classify_by_counts, normalize_label};
use crate::audit::{AuditEvent, AuditSink, TracingAudit};
use crate::config::ApprovalConfig;
use crate::decision::{Decision, DecisionOutcome, DecisionResult, ReplayOutcome, check_partition};
use crate::error::{ApprovalError, Result};
use crate::fingerprint::{self, fingerprint, replay_key};
use crate::history::{self, History, SplitInfo};
use crate::model::{ApprovalLogEntry, ReimbursementForm, ReimbursementRecord, SplitEdge};
use crate::schema::Tables;
use crate::store::{
    FormStore, LOGS_BY_FORM, abort, check_lineage, latest_log, record_ids_of, require_form,
    settle, tx_get, tx_put,
};
use crate::types::{Actor, ApprovalStage, FormId, RecordId, SplitId, TimeStamp, UserId};
use crate::utils::{EMPTY, id_key, pair_key, tagged_pair_key};
use crate::voucher::{FsStorage, ReallocationPlan, Reallocator, VoucherStorage};
use sled::Transactional;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree};
use std::cell::Cell;
use std::sync::Arc;

pub struct ApprovalService {
    tables: Tables,
    forms: FormStore,
    storage: Arc<dyn VoucherStorage>,
    audit: Arc<dyn AuditSink>,
    config: ApprovalConfig,
}

/// Everything a partial approval needs that must be settled before the transaction.
struct PendingSplit {
    new_form_id: FormId,
    new_form_number: String,
    split_id: SplitId,
    plan: ReallocationPlan,
}

enum Branch {
    AllApproved,
    AllRejected,
    Partial(PendingSplit),
}

impl ApprovalService {
    pub fn new(instance: Arc<sled::Db>, config: ApprovalConfig) -> Result<Self> {
        let storage = Arc::new(FsStorage::new(&config.voucher_root));
        Self::with_parts(instance, config, storage, Arc::new(TracingAudit))
    }

    pub fn with_parts(
        instance: Arc<sled::Db>,
        config: ApprovalConfig,
        storage: Arc<dyn VoucherStorage>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        let tables = Tables::open(&instance)?;
        let forms = FormStore::new(tables.clone(), storage.clone());

        Ok(Self {
            tables,
            forms,
            storage,
            audit,
            config,
        })
    }

    pub fn forms(&self) -> &FormStore {
        &self.forms
    }

    /// Applies an approver's decision to every line item of a form.
    ///
    /// A decision identical to one this approver already recorded against the
    /// same edition of the form is replayed from the log instead of applied
    /// again. Otherwise all checks run before any write, and the mutation
    /// itself (line items, form, split, voucher links, log entry) commits in
    /// one transaction guarded by the form version.
    pub fn apply_decision(
        &self,
        form_id: FormId,
        actor: Actor,
        decision: &Decision,
    ) -> Result<DecisionResult> {
        let form = require_form(&self.tables, form_id)?;

        if let Some(replay) = self.find_replay(&form, actor.id, decision)? {
            return Ok(replay);
        }

        let forbidden = ApprovalError::Forbidden {
            role: actor.role,
            status: form.status,
        };
        let Some(stage) = actor.role.stage() else {
            return Err(forbidden);
        };
        if !stage.may_decide(form.status) {
            return Err(forbidden);
        }
        if let Some(expected) = decision.expected_version.filter(|&v| v != form.version) {
            return Err(ApprovalError::Conflict {
                form_id,
                expected,
                actual: form.version,
            });
        }

        let record_ids = record_ids_of(&self.tables, form_id)?;
        if record_ids.is_empty() {
            return Err(ApprovalError::NoRecords(form_id));
        }
        check_partition(&record_ids, &decision.approved_ids, &decision.rejected_ids)?;

        let final_action = classify_by_counts(
            decision.approved_ids.len(),
            decision.rejected_ids.len(),
            record_ids.len(),
        );
        let requested_action = normalize_label(&decision.action);
        if requested_action != final_action {
            tracing::debug!(
                form = form_id,
                requested = %requested_action,
                applied = %final_action,
                "action token disagrees with submitted ids"
            );
        }

        let edition = form.version;
        let digest = fingerprint(
            &decision.approved_ids,
            &decision.rejected_ids,
            &decision.comment,
            edition,
        )?;
        let now = TimeStamp::new();
        let log_id = self.tables.generate_id()?;

        let branch = match final_action {
            Action::AllApproved => Branch::AllApproved,
            Action::AllRejected => Branch::AllRejected,
            Action::Partial => Branch::Partial(self.prepare_split(&form, &decision.approved_ids, now)?),
            Action::Unknown => {
                return Err(ApprovalError::UnprocessedRecords {
                    unprocessed: record_ids,
                });
            }
        };

        let t = &self.tables;
        let attempts = Cell::new(0u32);
        let result = (
            &t.forms,
            &t.records,
            &t.form_records,
            &t.vouchers,
            &t.voucher_links,
            &t.approval_logs,
            &t.log_index,
            &t.splits,
            &t.split_index,
        )
            .transaction(
                |(forms, records, form_records, vouchers, links, logs, log_index, splits, split_index)| {
                    attempts.set(attempts.get() + 1);
                    if attempts.get() > 1 {
                        tracing::debug!(form = form_id, attempt = attempts.get(), "retrying decision transaction");
                    }
                    let mut form: ReimbursementForm = tx_get(forms, form_id)?
                        .ok_or_else(|| abort(ApprovalError::NotFound(form_id)))?;
                    // authoritative optimistic lock check
                    if form.version != edition {
                        return Err(abort(ApprovalError::Conflict {
                            form_id,
                            expected: edition,
                            actual: form.version,
                        }));
                    }
                    let approved = load_owned(records, &form, &decision.approved_ids)?;
                    let rejected = load_owned(records, &form, &decision.rejected_ids)?;
                    let reason = (!decision.comment.is_empty()).then(|| decision.comment.clone());
                    let version_before = form.version;
                    let mut new_form_id = None;

                    match &branch {
                        Branch::AllApproved => {
                            for record in approved {
                                approve(records, record, stage, actor.id, now)?;
                            }
                            form.status = stage.approved_status();
                            form.approved_count = decision.approved_ids.len() as u64;
                            form.rejected_count = 0;
                        }
                        Branch::AllRejected => {
                            for record in rejected {
                                reject(records, record, stage, actor.id, reason.clone())?;
                            }
                            form.status = stage.rejected_status();
                            form.approved_count = 0;
                            form.rejected_count = decision.rejected_ids.len() as u64;
                            form.is_locked = true;
                            form.lock_reason = Some(format!(
                                "Rejected by {}; edit the line items and resubmit",
                                stage.role()
                            ));
                        }
                        Branch::Partial(split) => {
                            let approved_total = total_of(form_id, &approved)?;
                            let rejected_total = total_of(form_id, &rejected)?;

                            for record in rejected {
                                reject(records, record, stage, actor.id, reason.clone())?;
                            }
                            for mut record in approved {
                                form_records.remove(&pair_key(form_id, record.id)[..])?;
                                form_records
                                    .insert(&pair_key(split.new_form_id, record.id)[..], EMPTY)?;
                                record.form_id = split.new_form_id;
                                approve(records, record, stage, actor.id, now)?;
                            }

                            let child = ReimbursementForm {
                                id: split.new_form_id,
                                owner_id: form.owner_id,
                                form_number: split.new_form_number.clone(),
                                total_amount: approved_total,
                                status: stage.approved_status(),
                                parent_form_id: Some(form_id),
                                is_split_from_parent: true,
                                split_reason: Some(format!(
                                    "Approved items split from form {}",
                                    form.form_number
                                )),
                                approved_count: decision.approved_ids.len() as u64,
                                rejected_count: 0,
                                version: 1,
                                is_locked: false,
                                lock_reason: None,
                                created_at: now,
                                updated_at: now,
                            };
                            tx_put(forms, child.id, &child)?;
                            split.plan.apply(vouchers, links)?;

                            let mut moved = decision.approved_ids.clone();
                            moved.sort_unstable();
                            let edge = SplitEdge {
                                id: split.split_id,
                                original_form_id: form_id,
                                new_form_id: split.new_form_id,
                                split_type: self.config.split_type.clone(),
                                moved_record_ids: moved,
                                created_by: actor.id,
                                created_at: now,
                            };
                            tx_put(splits, edge.id, &edge)?;
                            split_index.insert(&pair_key(form_id, edge.id)[..], EMPTY)?;

                            form.status = stage.rejected_status();
                            form.total_amount = rejected_total;
                            form.approved_count = 0;
                            form.rejected_count = decision.rejected_ids.len() as u64;
                            form.is_locked = true;
                            form.lock_reason = Some(format!(
                                "Partially rejected by {}; approved items moved to form {}",
                                stage.role(),
                                split.new_form_number
                            ));
                            new_form_id = Some(split.new_form_id);
                        }
                    }

                    form.version += 1;
                    form.updated_at = now;
                    tx_put(forms, form_id, &form)?;

                    let mut approved_ids = decision.approved_ids.clone();
                    let mut rejected_ids = decision.rejected_ids.clone();
                    approved_ids.sort_unstable();
                    rejected_ids.sort_unstable();
                    let entry = ApprovalLogEntry {
                        id: log_id,
                        form_id,
                        approver_id: actor.id,
                        action: final_action,
                        approved_ids,
                        rejected_ids,
                        new_form_id,
                        comment: decision.comment.clone(),
                        fingerprint: digest.clone(),
                        resulting_status: form.status,
                        version_before,
                        version_after: form.version,
                        created_at: now,
                    };
                    tx_put(logs, log_id, &entry)?;
                    log_index.insert(&tagged_pair_key(LOGS_BY_FORM, form_id, log_id)[..], EMPTY)?;
                    log_index.insert(replay_key(form_id, actor.id, &digest), &id_key(log_id)[..])?;

                    Ok((form, new_form_id))
                },
            );

        let reallocator = Reallocator::new(&self.tables, self.storage.as_ref());
        let (form, new_form_id) = match settle(result) {
            Ok(committed) => committed,
            Err(e) => {
                if let Branch::Partial(split) = branch {
                    reallocator.discard(split.plan);
                }
                return Err(e);
            }
        };
        let warnings = match branch {
            Branch::Partial(split) => reallocator.finish(split.plan),
            Branch::AllApproved | Branch::AllRejected => Vec::new(),
        };

        let outcome = DecisionOutcome {
            original_form_id: form_id,
            original_form_status: form.status,
            new_form_id,
            approved_count: decision.approved_ids.len() as u64,
            rejected_count: decision.rejected_ids.len() as u64,
            requested_action,
            final_action,
            version_after: form.version,
            log_id,
            warnings,
        };

        tracing::info!(
            form = form_id,
            approver = actor.id,
            action = %final_action,
            status = %form.status,
            new_form = ?new_form_id,
            version = form.version,
            "applied approval decision"
        );
        self.audit.record(&AuditEvent {
            actor_id: actor.id,
            role: actor.role,
            form_id,
            action: final_action,
            resulting_status: form.status,
            new_form_id,
            approved_count: outcome.approved_count,
            rejected_count: outcome.rejected_count,
        });

        Ok(DecisionResult::Applied(outcome))
    }

    /// The form's own log, or with `include_ancestors` the merged log of its whole lineage.
    pub fn history(&self, form_id: FormId, include_ancestors: bool) -> Result<History> {
        history::history(&self.tables, form_id, include_ancestors)
    }

    pub fn split_info(&self, form_id: FormId) -> Result<SplitInfo> {
        history::split_info(&self.tables, form_id)
    }

    fn find_replay(
        &self,
        form: &ReimbursementForm,
        approver_id: UserId,
        decision: &Decision,
    ) -> Result<Option<DecisionResult>> {
        for edition in self.replay_editions(form, approver_id, decision.expected_version)? {
            let digest = fingerprint(
                &decision.approved_ids,
                &decision.rejected_ids,
                &decision.comment,
                edition,
            )?;
            let Some(entry) = fingerprint::find_replay(&self.tables, form.id, approver_id, &digest)?
            else {
                continue;
            };

            tracing::info!(
                form = form.id,
                approver = approver_id,
                log = entry.id,
                "replaying recorded decision"
            );
            return Ok(Some(DecisionResult::Replayed(ReplayOutcome {
                original_form_id: entry.form_id,
                original_form_status: entry.resulting_status,
                new_form_id: entry.new_form_id,
                approved_count: entry.approved_count(),
                rejected_count: entry.rejected_count(),
                log_id: entry.id,
            })));
        }

        tracing::debug!(form = form.id, approver = approver_id, "no recorded decision matches");
        Ok(None)
    }

    /// Form editions a decision may have targeted. Without an expected version
    /// this also covers the edition of this approver's last decision, provided
    /// nothing has touched the form since.
    fn replay_editions(
        &self,
        form: &ReimbursementForm,
        approver_id: UserId,
        expected_version: Option<u64>,
    ) -> Result<Vec<u64>> {
        if let Some(version) = expected_version {
            return Ok(vec![version]);
        }

        let mut editions = vec![form.version];
        if let Some(last) = latest_log(&self.tables, form.id)? {
            if last.approver_id == approver_id && last.version_after == form.version {
                editions.push(last.version_before);
            }
        }
        Ok(editions)
    }

    fn prepare_split(
        &self,
        form: &ReimbursementForm,
        approved: &[RecordId],
        now: TimeStamp,
    ) -> Result<PendingSplit> {
        let new_form_id = self.tables.generate_id()?;
        check_lineage(new_form_id, form.id)?;
        let split_id = self.tables.generate_id()?;

        let new_form_number = format!(
            "{}{}{}",
            form.form_number,
            self.config.form_number_separator,
            now.to_datetime_utc().format("%Y%m%d%H%M%S%3f")
        );
        let plan = Reallocator::new(&self.tables, self.storage.as_ref()).prepare(
            form.id,
            new_form_id,
            approved,
        );

        Ok(PendingSplit {
            new_form_id,
            new_form_number,
            split_id,
            plan,
        })
    }
}

/// Re-reads line items inside the transaction; each must still sit on the form.
fn load_owned(
    records: &TransactionalTree,
    form: &ReimbursementForm,
    ids: &[RecordId],
) -> ConflictableTransactionResult<Vec<ReimbursementRecord>, ApprovalError> {
    let mut owned = Vec::with_capacity(ids.len());
    for &id in ids {
        match tx_get::<ReimbursementRecord>(records, id)? {
            Some(record) if record.form_id == form.id => owned.push(record),
            _ => {
                return Err(abort(ApprovalError::RecordMoved {
                    form_id: form.id,
                    record_id: id,
                }));
            }
        }
    }
    Ok(owned)
}

fn total_of(
    form_id: FormId,
    records: &[ReimbursementRecord],
) -> ConflictableTransactionResult<u64, ApprovalError> {
    records
        .iter()
        .try_fold(0u64, |total, record| total.checked_add(record.amount))
        .ok_or_else(|| abort(ApprovalError::AmountOverflow(form_id)))
}

fn approve(
    records: &TransactionalTree,
    mut record: ReimbursementRecord,
    stage: ApprovalStage,
    approver_id: UserId,
    now: TimeStamp,
) -> ConflictableTransactionResult<(), ApprovalError> {
    record.approval_status = stage.approved_record_status();
    record.reject_reason = None;
    record.approver_id = Some(approver_id);
    record.approved_at = Some(now);
    tx_put(records, record.id, &record)
}

/// Rejections leave `approved_at` empty; the approver id records who decided.
fn reject(
    records: &TransactionalTree,
    mut record: ReimbursementRecord,
    stage: ApprovalStage,
    approver_id: UserId,
    reason: Option<String>,
) -> ConflictableTransactionResult<(), ApprovalError> {
    record.approval_status = stage.rejected_record_status();
    record.reject_reason = reason;
    record.approver_id = Some(approver_id);
    record.approved_at = None;
    tx_put(records, record.id, &record)
}
