//! Decision timelines across split lineages
use crate::error::Result;
use crate::model::{ApprovalLogEntry, ReimbursementForm, SplitEdge};
use crate::schema::Tables;
use crate::store::{load_form, logs_of, require_form};
use crate::types::FormId;
use crate::utils::{id_key, trailing_id};
use std::collections::HashSet;

/// A log entry tagged with the form it was recorded on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedLogEntry {
    pub entry: ApprovalLogEntry,
    pub source_form_id: FormId,
    pub source_form_number: String,
    /// 0 is the queried form, growing toward the root of the lineage.
    pub level: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedHistory {
    pub form_id: FormId,
    pub count: usize,
    pub logs: Vec<TaggedLogEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum History {
    /// The form's own log, newest first.
    Own(Vec<ApprovalLogEntry>),
    /// Logs of the form and all its ancestors, oldest first.
    Merged(MergedHistory),
}

impl History {
    pub fn len(&self) -> usize {
        match self {
            History::Own(logs) => logs.len(),
            History::Merged(merged) => merged.count,
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitInfo {
    pub splits: Vec<SplitEdge>,
    pub derived_forms: Vec<ReimbursementForm>,
}

pub fn history(tables: &Tables, form_id: FormId, include_ancestors: bool) -> Result<History> {
    if !include_ancestors {
        require_form(tables, form_id)?;
        let mut logs = logs_of(tables, form_id)?;
        logs.reverse();
        return Ok(History::Own(logs));
    }

    let chain = ancestor_chain(tables, form_id)?;
    let mut logs = Vec::new();
    for (level, form) in chain.iter().enumerate() {
        for entry in logs_of(tables, form.id)? {
            logs.push(TaggedLogEntry {
                entry,
                source_form_id: form.id,
                source_form_number: form.form_number.clone(),
                level,
            });
        }
    }
    // log ids are allocated monotonically
    logs.sort_by_key(|tagged| (tagged.entry.created_at, tagged.entry.id));

    Ok(History::Merged(MergedHistory {
        form_id,
        count: logs.len(),
        logs,
    }))
}

/// The form followed by its parent, grandparent and so on up to the root.
pub fn ancestor_chain(tables: &Tables, form_id: FormId) -> Result<Vec<ReimbursementForm>> {
    let mut chain = vec![require_form(tables, form_id)?];
    let mut visited = HashSet::from([form_id]);

    while let Some(parent_id) = chain.last().and_then(|form| form.parent_form_id) {
        if !visited.insert(parent_id) {
            tracing::warn!(form = form_id, parent = parent_id, "cycle in form lineage");
            break;
        }
        match load_form(tables, parent_id)? {
            Some(parent) => chain.push(parent),
            None => break,
        }
    }

    Ok(chain)
}

pub fn split_info(tables: &Tables, form_id: FormId) -> Result<SplitInfo> {
    require_form(tables, form_id)?;

    let mut splits = Vec::new();
    let mut derived_forms = Vec::new();
    for key in tables.split_index.scan_prefix(id_key(form_id)).keys() {
        let Some(split_id) = trailing_id(&key?) else {
            continue;
        };
        let Some(bytes) = tables.splits.get(id_key(split_id))? else {
            continue;
        };
        let edge: SplitEdge = minicbor::decode(&bytes)?;
        if let Some(child) = load_form(tables, edge.new_form_id)? {
            derived_forms.push(child);
        }
        splits.push(edge);
    }

    Ok(SplitInfo {
        splits,
        derived_forms,
    })
}
