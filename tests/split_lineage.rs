//! Voucher relocation, split lineage and history reconstruction
use anyhow::Context;
use expense_approval::{
    ApprovalError,
    action::Action,
    audit::{AuditEvent, AuditSink},
    config::ApprovalConfig,
    decision::Decision,
    history::{History, ancestor_chain},
    model::{NewForm, NewRecord, NewVoucher, ReimbursementForm, ReimbursementRecord},
    schema::Tables,
    service::ApprovalService,
    types::{Actor, FormId, RecordId, Role, UserId},
    utils::id_key,
    voucher::{FsStorage, ReallocationWarning, VoucherStorage},
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::{TempDir, tempdir};

const OWNER: UserId = 100;
const FINANCE: Actor = Actor {
    id: 200,
    role: Role::Finance,
};
const MANAGER: Actor = Actor {
    id: 300,
    role: Role::Manager,
};

/// File storage whose copy or remove can be switched off.
struct FlakyStorage {
    inner: FsStorage,
    fail_copy: bool,
    fail_remove: bool,
}

impl VoucherStorage for FlakyStorage {
    fn write(&self, path: &str, bytes: &[u8]) -> io::Result<()> {
        self.inner.write(path, bytes)
    }
    fn copy(&self, from: &str, to: &str) -> io::Result<()> {
        if self.fail_copy {
            return Err(io::Error::other("disk full"));
        }
        self.inner.copy(from, to)
    }
    fn remove(&self, path: &str) -> io::Result<()> {
        if self.fail_remove {
            return Err(io::Error::other("permission denied"));
        }
        self.inner.remove(path)
    }
}

#[derive(Default)]
struct RecordingAudit {
    events: Mutex<Vec<AuditEvent>>,
}

impl AuditSink for RecordingAudit {
    fn record(&self, event: &AuditEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

fn plain_storage(root: PathBuf) -> Arc<dyn VoucherStorage> {
    Arc::new(FsStorage::new(root))
}

fn open_with(
    storage: impl FnOnce(PathBuf) -> Arc<dyn VoucherStorage>,
    audit: Arc<dyn AuditSink>,
) -> anyhow::Result<(TempDir, ApprovalService, FsStorage)> {
    let temp_dir = tempdir()?;
    let db = Arc::new(sled::open(temp_dir.path().join("approvals.db"))?);
    let root = temp_dir.path().join("vouchers");
    let config = ApprovalConfig::new().set_voucher_root(&root);
    let service = ApprovalService::with_parts(db, config, storage(root.clone()), audit)?;
    Ok((temp_dir, service, FsStorage::new(root)))
}

fn open_service() -> anyhow::Result<(TempDir, ApprovalService, FsStorage)> {
    open_with(plain_storage, Arc::new(RecordingAudit::default()))
}

fn flaky(fail_copy: bool, fail_remove: bool) -> anyhow::Result<(TempDir, ApprovalService, FsStorage)> {
    open_with(
        move |root| {
            let storage: Arc<dyn VoucherStorage> = Arc::new(FlakyStorage {
                inner: FsStorage::new(root),
                fail_copy,
                fail_remove,
            });
            storage
        },
        Arc::new(RecordingAudit::default()),
    )
}

fn form_with(
    service: &ApprovalService,
    number: &str,
    amounts: &[u64],
) -> anyhow::Result<(ReimbursementForm, Vec<RecordId>)> {
    let form = service.forms().create_form(NewForm::new(OWNER, number))?;
    let mut ids = Vec::new();
    for amount in amounts {
        let record = service
            .forms()
            .add_record(form.id, NewRecord::new(*amount, "travel").set_expense_type("transport"))?;
        ids.push(record.id);
    }
    Ok((service.forms().form(form.id)?, ids))
}

fn split(
    service: &ApprovalService,
    form_id: FormId,
    actor: Actor,
    approved: &[RecordId],
    rejected: &[RecordId],
) -> anyhow::Result<FormId> {
    let decision = Decision::new("partial")
        .set_approved(approved)
        .set_rejected(rejected)
        .set_comment("over budget");
    let outcome = service
        .apply_decision(form_id, actor, &decision)?
        .applied()
        .context("expected a fresh decision")?;
    outcome.new_form_id.context("partial approval creates a form")
}

#[test]
fn vouchers_of_approved_items_follow_them() -> anyhow::Result<()> {
    let (_dir, service, files) = open_service()?;
    let (form, ids) = form_with(&service, "RB-100", &[1_000, 2_000, 300])?;

    let single = service.forms().attach_voucher(
        &ids[..1],
        NewVoucher::new("taxi.pdf", OWNER).set_content_type("application/pdf"),
        b"taxi receipt",
    )?;
    let both = service
        .forms()
        .attach_voucher(&ids[..2], NewVoucher::new("hotel.png", OWNER), b"hotel invoice")?;
    let rejected_only = service
        .forms()
        .attach_voucher(&ids[2..], NewVoucher::new("bar.jpg", OWNER), b"bar tab")?;

    let new_form_id = split(&service, form.id, FINANCE, &ids[..2], &ids[2..])?;

    // originals of fully approved vouchers are retired with their files
    for old in [&single, &both] {
        assert!(service.forms().voucher(old.id)?.is_none());
        assert!(!files.resolve(&old.stored_path).exists());
    }

    let first = service.forms().vouchers_of_record(ids[0])?;
    assert_eq!(first.len(), 2);
    for voucher in &first {
        assert_eq!(voucher.form_id, new_form_id);
        assert!(voucher.stored_path.starts_with(&format!("{new_form_id}/")));
        assert!(files.resolve(&voucher.stored_path).exists());
    }
    let copied_taxi = first
        .iter()
        .find(|v| v.original_name == "taxi.pdf")
        .context("taxi voucher relinked")?;
    assert_eq!(copied_taxi.content_type.as_deref(), Some("application/pdf"));
    assert_eq!(std::fs::read(files.resolve(&copied_taxi.stored_path))?, b"taxi receipt");

    // both approved items share the single copy of the hotel voucher
    let second = service.forms().vouchers_of_record(ids[1])?;
    assert_eq!(second.len(), 1);
    assert!(first.iter().any(|v| v.id == second[0].id));

    // the rejected item keeps its evidence untouched
    let remaining = service.forms().vouchers_of_record(ids[2])?;
    assert_eq!(remaining, vec![rejected_only.clone()]);
    assert!(files.resolve(&rejected_only.stored_path).exists());

    Ok(())
}

#[test]
fn voucher_shared_with_a_rejected_item_stays_behind() -> anyhow::Result<()> {
    let (_dir, service, files) = open_service()?;
    let (form, ids) = form_with(&service, "RB-101", &[500, 700])?;

    let shared = service.forms().attach_voucher(
        &ids,
        NewVoucher::new("combined.pdf", OWNER),
        b"one receipt for both",
    )?;

    let new_form_id = split(&service, form.id, FINANCE, &ids[..1], &ids[1..])?;

    let moved = service.forms().vouchers_of_record(ids[0])?;
    assert_eq!(moved.len(), 1);
    assert_ne!(moved[0].id, shared.id);
    assert_eq!(moved[0].form_id, new_form_id);

    let kept = service.forms().vouchers_of_record(ids[1])?;
    assert_eq!(kept, vec![shared.clone()]);
    assert!(service.forms().voucher(shared.id)?.is_some());
    assert!(files.resolve(&shared.stored_path).exists());

    Ok(())
}

#[test]
fn failed_copy_is_a_warning_not_a_rollback() -> anyhow::Result<()> {
    let (_dir, service, files) = flaky(true, false)?;
    let (form, ids) = form_with(&service, "RB-102", &[500, 700])?;
    let voucher = service
        .forms()
        .attach_voucher(&ids[..1], NewVoucher::new("fuel.pdf", OWNER), b"fuel")?;

    let decision = Decision::new("partial")
        .set_approved(&ids[..1])
        .set_rejected(&ids[1..]);
    let outcome = service
        .apply_decision(form.id, FINANCE, &decision)?
        .applied()
        .context("expected a fresh decision")?;

    assert!(outcome.new_form_id.is_some());
    assert!(matches!(
        outcome.warnings.as_slice(),
        [ReallocationWarning::CopyFailed { voucher_id, .. }] if *voucher_id == voucher.id
    ));

    // the approved item still reaches its original evidence
    assert_eq!(service.forms().vouchers_of_record(ids[0])?, vec![voucher.clone()]);
    assert!(files.resolve(&voucher.stored_path).exists());

    Ok(())
}

#[test]
fn failed_cleanup_leaves_both_files() -> anyhow::Result<()> {
    let (_dir, service, files) = flaky(false, true)?;
    let (form, ids) = form_with(&service, "RB-103", &[500, 700])?;
    let voucher = service
        .forms()
        .attach_voucher(&ids[..1], NewVoucher::new("meal.pdf", OWNER), b"meal")?;

    let decision = Decision::new("partial")
        .set_approved(&ids[..1])
        .set_rejected(&ids[1..]);
    let outcome = service
        .apply_decision(form.id, FINANCE, &decision)?
        .applied()
        .context("expected a fresh decision")?;

    assert!(matches!(
        outcome.warnings.as_slice(),
        [ReallocationWarning::CleanupFailed { voucher_id, .. }] if *voucher_id == voucher.id
    ));
    assert!(files.resolve(&voucher.stored_path).exists());
    let relinked = service.forms().vouchers_of_record(ids[0])?;
    assert_eq!(relinked.len(), 1);
    assert!(files.resolve(&relinked[0].stored_path).exists());

    Ok(())
}

type Interference = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Runs one interfering write while the split copies its vouchers.
struct InterferingStorage {
    inner: FsStorage,
    during_copy: Mutex<Option<Interference>>,
}

impl VoucherStorage for InterferingStorage {
    fn write(&self, path: &str, bytes: &[u8]) -> io::Result<()> {
        self.inner.write(path, bytes)
    }
    fn copy(&self, from: &str, to: &str) -> io::Result<()> {
        self.inner.copy(from, to)?;
        let interference = self.during_copy.lock().unwrap().take();
        if let Some(interfere) = interference {
            interfere().map_err(|e| io::Error::other(e.to_string()))?;
        }
        Ok(())
    }
    fn remove(&self, path: &str) -> io::Result<()> {
        self.inner.remove(path)
    }
}

struct Interfered {
    _dir: TempDir,
    db: Arc<sled::Db>,
    root: PathBuf,
    storage: Arc<InterferingStorage>,
    service: ApprovalService,
}

impl Interfered {
    fn open() -> anyhow::Result<Self> {
        let temp_dir = tempdir()?;
        let db = Arc::new(sled::open(temp_dir.path().join("approvals.db"))?);
        let root = temp_dir.path().join("vouchers");
        let storage = Arc::new(InterferingStorage {
            inner: FsStorage::new(&root),
            during_copy: Mutex::new(None),
        });
        let service = ApprovalService::with_parts(
            db.clone(),
            ApprovalConfig::new().set_voucher_root(&root),
            storage.clone(),
            Arc::new(RecordingAudit::default()),
        )?;
        Ok(Self {
            _dir: temp_dir,
            db,
            root,
            storage,
            service,
        })
    }

    fn during_copy(&self, interfere: impl FnOnce() -> anyhow::Result<()> + Send + 'static) {
        *self.storage.during_copy.lock().unwrap() = Some(Box::new(interfere));
    }
}

fn count_files(dir: &Path) -> io::Result<usize> {
    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        count += if path.is_dir() { count_files(&path)? } else { 1 };
    }
    Ok(count)
}

#[test]
fn rolled_back_split_discards_copies() -> anyhow::Result<()> {
    let env = Interfered::open()?;
    let service = &env.service;

    let (form, ids) = form_with(service, "RB-104", &[500, 700])?;
    let voucher = service
        .forms()
        .attach_voucher(&ids[..1], NewVoucher::new("a.pdf", OWNER), b"a")?;
    let form = service.forms().form(form.id)?;

    let store = service.forms().clone();
    let form_id = form.id;
    env.during_copy(move || {
        store.add_record(form_id, NewRecord::new(1, "late edit"))?;
        Ok(())
    });

    let decision = Decision::new("partial")
        .set_approved(&ids[..1])
        .set_rejected(&ids[1..])
        .set_expected_version(form.version);
    let err = service
        .apply_decision(form.id, FINANCE, &decision)
        .expect_err("the form changed during the split");
    assert!(matches!(err, ApprovalError::Conflict { .. }));

    // the copy was removed again and the original is still linked
    assert_eq!(count_files(&env.root)?, 1);
    assert_eq!(service.forms().vouchers_of_record(ids[0])?, vec![voucher.clone()]);
    assert!(service.split_info(form.id)?.splits.is_empty());
    assert!(service.forms().logs_of(form.id)?.is_empty());

    Ok(())
}

#[test]
fn voucher_attached_during_split_is_not_left_behind() -> anyhow::Result<()> {
    let env = Interfered::open()?;
    let service = &env.service;

    let (form, ids) = form_with(service, "RB-106", &[500, 700])?;
    service
        .forms()
        .attach_voucher(&ids[..1], NewVoucher::new("a.pdf", OWNER), b"a")?;

    let store = service.forms().clone();
    let approved_id = ids[0];
    env.during_copy(move || {
        store.attach_voucher(&[approved_id], NewVoucher::new("late.pdf", OWNER), b"late")?;
        Ok(())
    });

    let decision = Decision::new("partial")
        .set_approved(&ids[..1])
        .set_rejected(&ids[1..]);
    let err = service
        .apply_decision(form.id, FINANCE, &decision)
        .expect_err("a voucher arrived after the links were scanned");
    assert!(matches!(err, ApprovalError::Conflict { .. }));
    assert_eq!(count_files(&env.root)?, 2);

    // the approver retries against the current form and both vouchers follow
    let new_form_id = split(service, form.id, FINANCE, &ids[..1], &ids[1..])?;
    let moved = service.forms().vouchers_of_record(ids[0])?;
    let mut names: Vec<&str> = moved.iter().map(|v| v.original_name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["a.pdf", "late.pdf"]);
    assert!(moved.iter().all(|v| v.form_id == new_form_id));

    Ok(())
}

#[test]
fn record_moved_under_the_decision_is_reported() -> anyhow::Result<()> {
    let env = Interfered::open()?;
    let service = &env.service;

    let (form, ids) = form_with(service, "RB-107", &[500, 700])?;
    service
        .forms()
        .attach_voucher(&ids[..1], NewVoucher::new("a.pdf", OWNER), b"a")?;

    // rewrite the row directly, bypassing the version bump of owner edits
    let tables = Tables::open(&env.db)?;
    let stray = ids[1];
    env.during_copy(move || {
        let bytes = tables
            .records
            .get(id_key(stray))?
            .context("record exists")?;
        let mut record: ReimbursementRecord = minicbor::decode(&bytes)?;
        record.form_id += 1_000;
        tables.records.insert(id_key(stray), minicbor::to_vec(&record)?)?;
        Ok(())
    });

    let decision = Decision::new("partial")
        .set_approved(&ids[..1])
        .set_rejected(&ids[1..]);
    let err = service
        .apply_decision(form.id, FINANCE, &decision)
        .expect_err("a line item left the form");
    match err {
        ApprovalError::RecordMoved { form_id, record_id } => {
            assert_eq!((form_id, record_id), (form.id, stray));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(count_files(&env.root)?, 1);

    Ok(())
}

#[test]
fn lineage_cycle_does_not_hang_history() -> anyhow::Result<()> {
    let env = Interfered::open()?;
    let service = &env.service;
    let a = service.forms().create_form(NewForm::new(OWNER, "RB-108"))?;
    let b = service.forms().create_form(NewForm::new(OWNER, "RB-109"))?;

    // no write path produces this, so plant it directly
    let tables = Tables::open(&env.db)?;
    for (mut form, parent) in [(a.clone(), b.id), (b.clone(), a.id)] {
        form.parent_form_id = Some(parent);
        tables.forms.insert(id_key(form.id), minicbor::to_vec(&form)?)?;
    }

    let chain = ancestor_chain(&tables, a.id)?;
    let chain_ids: Vec<FormId> = chain.iter().map(|f| f.id).collect();
    assert_eq!(chain_ids, vec![a.id, b.id]);

    match service.history(a.id, true)? {
        History::Merged(merged) => {
            assert_eq!(merged.form_id, a.id);
            assert_eq!(merged.count, 0);
        }
        other => panic!("expected merged history, got {other:?}"),
    }

    Ok(())
}

#[test]
fn audit_sink_sees_applied_decisions_only() -> anyhow::Result<()> {
    let audit = Arc::new(RecordingAudit::default());
    let (_dir, service, _) = open_with(plain_storage, audit.clone())?;
    let (form, ids) = form_with(&service, "RB-105", &[100, 200])?;

    let decision = Decision::new("approve").set_approved(&ids);
    service.apply_decision(form.id, FINANCE, &decision)?;
    assert!(service.apply_decision(form.id, FINANCE, &decision)?.is_replay());

    let events = audit.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].actor_id, FINANCE.id);
    assert_eq!(events[0].form_id, form.id);
    assert_eq!(events[0].action, Action::AllApproved);
    assert_eq!((events[0].approved_count, events[0].rejected_count), (2, 0));

    Ok(())
}

#[test]
fn own_history_is_newest_first() -> anyhow::Result<()> {
    let (_dir, service, _) = open_service()?;
    let (form, ids) = form_with(&service, "RB-106", &[100, 200])?;

    service.apply_decision(form.id, FINANCE, &Decision::new("reject").set_rejected(&ids))?;
    service.forms().resubmit(form.id, OWNER)?;
    service.apply_decision(form.id, FINANCE, &Decision::new("approve").set_approved(&ids))?;

    let History::Own(logs) = service.history(form.id, false)? else {
        panic!("expected the form's own history");
    };
    let actions: Vec<Action> = logs.iter().map(|entry| entry.action).collect();
    assert_eq!(actions, vec![Action::AllApproved, Action::AllRejected]);
    assert_eq!(logs[1].rejected_ids, ids);

    assert!(matches!(
        service.history(424_242, false),
        Err(ApprovalError::NotFound(424_242))
    ));

    Ok(())
}

#[test]
fn merged_history_walks_the_lineage() -> anyhow::Result<()> {
    let (_dir, service, _) = open_service()?;
    let (root, ids) = form_with(&service, "RB-107", &[100, 200, 300])?;

    // finance keeps two items, the manager then keeps one of those
    let child = split(&service, root.id, FINANCE, &ids[..2], &ids[2..])?;
    let grandchild = split(&service, child, MANAGER, &ids[..1], &ids[1..2])?;

    let History::Merged(merged) = service.history(grandchild, true)? else {
        panic!("expected merged history");
    };
    assert_eq!(merged.form_id, grandchild);
    assert_eq!(merged.count, 2);
    assert_eq!(merged.logs[0].source_form_id, root.id);
    assert_eq!(merged.logs[0].source_form_number, "RB-107");
    assert_eq!(merged.logs[0].level, 2);
    assert_eq!(merged.logs[0].entry.new_form_id, Some(child));
    assert_eq!(merged.logs[1].source_form_id, child);
    assert_eq!(merged.logs[1].level, 1);
    assert_eq!(merged.logs[1].entry.new_form_id, Some(grandchild));

    // the grandchild is manager approved and has no log of its own yet
    assert!(service.history(grandchild, false)?.is_empty());

    let child_info = service.split_info(child)?;
    assert_eq!(child_info.splits.len(), 1);
    assert_eq!(child_info.derived_forms[0].id, grandchild);
    assert_eq!(child_info.derived_forms[0].total_amount, 100);
    assert_eq!(service.forms().form(child)?.total_amount, 200);

    Ok(())
}

#[test]
fn resubmitted_remainder_can_split_again() -> anyhow::Result<()> {
    let (_dir, service, _) = open_service()?;
    let (root, ids) = form_with(&service, "RB-108", &[100, 200, 300])?;

    let first = split(&service, root.id, FINANCE, &ids[..1], &ids[1..])?;
    service.forms().resubmit(root.id, OWNER)?;
    let second = split(&service, root.id, FINANCE, &ids[1..2], &ids[2..])?;
    assert_ne!(first, second);

    let info = service.split_info(root.id)?;
    let children: Vec<FormId> = info.splits.iter().map(|edge| edge.new_form_id).collect();
    assert_eq!(children, vec![first, second]);
    assert_eq!(service.forms().form(root.id)?.total_amount, 300);

    let History::Merged(merged) = service.history(second, true)? else {
        panic!("expected merged history");
    };
    // both decisions were recorded on the root form
    assert_eq!(merged.count, 2);
    assert!(merged.logs.iter().all(|tagged| tagged.level == 1));
    assert!(merged.logs[0].entry.created_at <= merged.logs[1].entry.created_at);

    Ok(())
}
