//! Fire-and-forget audit trail for applied decisions
use crate::action::Action;
use crate::types::{FormId, FormStatus, Role, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub actor_id: UserId,
    pub role: Role,
    pub form_id: FormId,
    pub action: Action,
    pub resulting_status: FormStatus,
    pub new_form_id: Option<FormId>,
    pub approved_count: u64,
    pub rejected_count: u64,
}

/// Receives one event per applied decision. Implementations must not fail the caller.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Writes audit events to the `audit` tracing target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, event: &AuditEvent) {
        tracing::info!(
            target: "audit",
            actor = event.actor_id,
            role = %event.role,
            form = event.form_id,
            action = %event.action,
            status = %event.resulting_status,
            new_form = ?event.new_form_id,
            approved = event.approved_count,
            rejected = event.rejected_count,
            "approval decision"
        );
    }
}
