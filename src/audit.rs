//! Append-only audit trail. Writing never fails the caller: a store error is
//! logged and swallowed so the primary operation always wins.

use crate::authz::Actor;
use crate::error::CoreResult;
use crate::model::{self, Page};
use crate::settings;
use rusqlite::{params_from_iter, types::Value as SqlValue, Connection};
use serde::Serialize;
use serde_json::Value;

macro_rules! audit_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }
    };
}

audit_enum!(Category {
    Authentication => "authentication",
    Authorization => "authorization",
    Attendance => "attendance",
    Financial => "financial",
    DataModification => "data_modification",
    System => "system",
});

audit_enum!(Outcome {
    Success => "success",
    Failure => "failure",
    Warning => "warning",
});

audit_enum!(Severity {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

pub struct AuditEvent<'a> {
    pub action: &'a str,
    pub entity_type: &'a str,
    pub entity_id: Option<&'a str>,
    pub actor: Option<&'a Actor>,
    pub description: String,
    pub details: Option<Value>,
    pub category: Category,
    pub status: Outcome,
    pub severity: Severity,
}

impl<'a> AuditEvent<'a> {
    pub fn new(action: &'a str, entity_type: &'a str, category: Category) -> Self {
        Self {
            action,
            entity_type,
            entity_id: None,
            actor: None,
            description: String::new(),
            details: None,
            category,
            status: Outcome::Success,
            severity: Severity::Low,
        }
    }

    pub fn entity(mut self, id: &'a str) -> Self {
        self.entity_id = Some(id);
        self
    }

    pub fn by(mut self, actor: &'a Actor) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn outcome(mut self, status: Outcome, severity: Severity) -> Self {
        self.status = status;
        self.severity = severity;
        self
    }
}

pub fn record(conn: &Connection, event: AuditEvent<'_>) {
    if let Err(e) = try_record(conn, &event) {
        tracing::warn!(
            action = event.action,
            entity_type = event.entity_type,
            error = %e,
            "audit write failed"
        );
    }
}

fn try_record(conn: &Connection, event: &AuditEvent<'_>) -> anyhow::Result<()> {
    let details = match &event.details {
        Some(v) => Some(serde_json::to_string(v)?),
        None => None,
    };
    let retention = settings::audit_retention_days(conn);
    conn.execute(
        "INSERT INTO audit_log(
            id, action, entity_type, entity_id, actor_id, actor_role, description,
            details, category, status, severity, created_at, expires_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            model::new_id(),
            event.action,
            event.entity_type,
            event.entity_id,
            event.actor.map(|a| a.id.as_str()),
            event.actor.map(|a| a.role.as_str()),
            event.description,
            details,
            event.category.as_str(),
            event.status.as_str(),
            event.severity.as_str(),
            model::now(),
            model::expires_after_days(retention),
        ],
    )?;
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub actor_id: Option<String>,
    pub actor_role: Option<String>,
    pub description: String,
    pub details: Option<Value>,
    pub category: String,
    pub status: String,
    pub severity: String,
    pub created_at: String,
    pub expires_at: String,
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub category: Option<String>,
    pub action: Option<String>,
    pub actor_id: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub status: Option<String>,
}

pub fn list(conn: &Connection, filter: &AuditFilter, page: Page) -> CoreResult<Vec<AuditLogEntry>> {
    let mut sql = String::from(
        "SELECT id, action, entity_type, entity_id, actor_id, actor_role, description,
                details, category, status, severity, created_at, expires_at
         FROM audit_log WHERE expires_at > ?",
    );
    let mut args: Vec<SqlValue> = vec![SqlValue::Text(model::now())];
    let columns = [
        ("category", &filter.category),
        ("action", &filter.action),
        ("actor_id", &filter.actor_id),
        ("entity_type", &filter.entity_type),
        ("entity_id", &filter.entity_id),
        ("status", &filter.status),
    ];
    for (column, value) in columns {
        if let Some(v) = value {
            sql.push_str(&format!(" AND {} = ?", column));
            args.push(SqlValue::Text(v.clone()));
        }
    }
    sql.push_str(" ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?");
    args.push(SqlValue::Integer(page.limit));
    args.push(SqlValue::Integer(page.offset));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args), |r| {
            let details: Option<String> = r.get(7)?;
            Ok(AuditLogEntry {
                id: r.get(0)?,
                action: r.get(1)?,
                entity_type: r.get(2)?,
                entity_id: r.get(3)?,
                actor_id: r.get(4)?,
                actor_role: r.get(5)?,
                description: r.get(6)?,
                details: details.and_then(|s| serde_json::from_str(&s).ok()),
                category: r.get(8)?,
                status: r.get(9)?,
                severity: r.get(10)?,
                created_at: r.get(11)?,
                expires_at: r.get(12)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Delete entries past their expiry. Idempotent; returns the number removed.
pub fn prune_expired(conn: &Connection) -> CoreResult<usize> {
    let removed = conn.execute("DELETE FROM audit_log WHERE expires_at <= ?", [model::now()])?;
    if removed > 0 {
        tracing::info!(removed, "pruned expired audit entries");
    }
    Ok(removed)
}
