//! Ordered, idempotent migrations and the tree handles they produce.
//!
//! Each migration is recorded by name in `schema_migrations` once it has run.
//! Re-running a migration by hand is harmless: opening a tree that already
//! exists is a no-op and index rebuilds start from a cleared tree.
use crate::error::Result;
use crate::model::ReimbursementRecord;
use crate::types::TimeStamp;
use crate::utils::{EMPTY, pair_key};
use sled::{Db, Tree};

pub const FORMS: &str = "forms";
pub const RECORDS: &str = "records";
pub const FORM_RECORDS: &str = "form_records";
pub const VOUCHERS: &str = "vouchers";
pub const VOUCHER_LINKS: &str = "voucher_links";
pub const APPROVAL_LOGS: &str = "approval_logs";
pub const LOG_INDEX: &str = "log_index";
pub const SPLITS: &str = "splits";
pub const SPLIT_INDEX: &str = "split_index";
const SCHEMA_MIGRATIONS: &str = "schema_migrations";

pub struct Migration {
    pub name: &'static str,
    pub apply: fn(&Db) -> Result<()>,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "0001_core_tables",
        apply: core_tables,
    },
    Migration {
        name: "0002_approval_log",
        apply: approval_log,
    },
    Migration {
        name: "0003_split_edges",
        apply: split_edges,
    },
    Migration {
        name: "0004_form_record_index",
        apply: form_record_index,
    },
];

fn open_all(db: &Db, names: &[&str]) -> Result<()> {
    for name in names {
        db.open_tree(name)?;
    }
    Ok(())
}

fn core_tables(db: &Db) -> Result<()> {
    open_all(db, &[FORMS, RECORDS, VOUCHERS, VOUCHER_LINKS])
}

fn approval_log(db: &Db) -> Result<()> {
    open_all(db, &[APPROVAL_LOGS, LOG_INDEX])
}

fn split_edges(db: &Db) -> Result<()> {
    open_all(db, &[SPLITS, SPLIT_INDEX])
}

pub(crate) fn form_record_index(db: &Db) -> Result<()> {
    let records = db.open_tree(RECORDS)?;
    let index = db.open_tree(FORM_RECORDS)?;
    index.clear()?;

    for row in records.iter() {
        let (_, value) = row?;
        let record: ReimbursementRecord = minicbor::decode(&value)?;
        index.insert(pair_key(record.form_id, record.id), EMPTY)?;
    }
    Ok(())
}

/// Applies every migration not yet recorded, in order. Returns the names applied by this call.
pub fn migrate(db: &Db) -> Result<Vec<&'static str>> {
    let applied = db.open_tree(SCHEMA_MIGRATIONS)?;
    let mut ran = Vec::new();

    for migration in MIGRATIONS {
        if applied.contains_key(migration.name)? {
            continue;
        }
        (migration.apply)(db)?;
        applied.insert(migration.name, minicbor::to_vec(TimeStamp::new())?)?;
        tracing::debug!(migration = migration.name, "applied schema migration");
        ran.push(migration.name);
    }

    Ok(ran)
}

pub fn applied_migrations(db: &Db) -> Result<Vec<String>> {
    let applied = db.open_tree(SCHEMA_MIGRATIONS)?;
    let mut names = Vec::new();
    for key in applied.iter().keys() {
        names.push(String::from_utf8_lossy(&key?).into_owned());
    }
    Ok(names)
}

/// Handles to every tree the engine reads or writes.
#[derive(Clone)]
pub struct Tables {
    pub db: Db,
    pub forms: Tree,
    pub records: Tree,
    pub form_records: Tree,
    pub vouchers: Tree,
    pub voucher_links: Tree,
    pub approval_logs: Tree,
    pub log_index: Tree,
    pub splits: Tree,
    pub split_index: Tree,
}

impl Tables {
    /// Migrates the database and opens every tree.
    pub fn open(db: &Db) -> Result<Self> {
        migrate(db)?;

        Ok(Self {
            db: db.clone(),
            forms: db.open_tree(FORMS)?,
            records: db.open_tree(RECORDS)?,
            form_records: db.open_tree(FORM_RECORDS)?,
            vouchers: db.open_tree(VOUCHERS)?,
            voucher_links: db.open_tree(VOUCHER_LINKS)?,
            approval_logs: db.open_tree(APPROVAL_LOGS)?,
            log_index: db.open_tree(LOG_INDEX)?,
            splits: db.open_tree(SPLITS)?,
            split_index: db.open_tree(SPLIT_INDEX)?,
        })
    }

    pub fn generate_id(&self) -> Result<u64> {
        Ok(self.db.generate_id()?)
    }
}
