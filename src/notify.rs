//! Notification dispatch and the notification lifecycle.
//!
//! Core operations hand finished messages to a `NotificationDispatch`
//! implementation they are given; they never reach for a global handle.
//! The default dispatcher files messages into the workspace inbox, where
//! they move through sent -> delivered -> read, or fail with a bounded
//! number of retries.

use crate::authz::{self, Actor, Role};
use crate::db;
use crate::error::{CoreError, CoreResult};
use crate::model::{self, Channels, NotificationStatus, NotificationType, Page, Priority};
use crate::settings;
use crate::validate;
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundNotification {
    pub recipient_type: Role,
    pub recipient_id: String,
    pub sender_id: Option<String>,
    pub title: String,
    pub message: String,
    pub notification_type: NotificationType,
    pub priority: Priority,
    pub channels: Channels,
}

pub trait NotificationDispatch {
    /// Accept one message for delivery and return its notification id.
    fn send(&self, notification: &OutboundNotification) -> anyhow::Result<String>;
}

/// Files notifications into the workspace's own `notifications` table.
pub struct InboxDispatcher {
    conn: Connection,
}

impl InboxDispatcher {
    pub fn open(workspace: &Path) -> anyhow::Result<Self> {
        let conn = db::open_connection(&workspace.join(db::DB_FILE_NAME))?;
        Ok(Self { conn })
    }
}

impl NotificationDispatch for InboxDispatcher {
    fn send(&self, n: &OutboundNotification) -> anyhow::Result<String> {
        insert(&self.conn, n)
    }
}

fn insert(conn: &Connection, n: &OutboundNotification) -> anyhow::Result<String> {
    let id = model::new_id();
    let max_retries = settings::notification_max_retries(conn);
    let retention = settings::notification_retention_days(conn);
    conn.execute(
        "INSERT INTO notifications(
            id, recipient_type, recipient_id, sender_id, title, message,
            notification_type, priority, channel_sms, channel_email, channel_push,
            channel_in_app, status, retry_count, max_retries, created_at, expires_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)",
        params![
            id,
            n.recipient_type.as_str(),
            n.recipient_id,
            n.sender_id,
            n.title,
            n.message,
            n.notification_type,
            n.priority,
            n.channels.sms,
            n.channels.email,
            n.channels.push,
            n.channels.in_app,
            NotificationStatus::Sent,
            max_retries,
            model::now(),
            model::expires_after_days(retention),
        ],
    )?;
    Ok(id)
}

/// Hand every message to the dispatcher. Failures are logged and do not
/// propagate; returns the ids that were accepted.
pub fn dispatch_all(
    dispatcher: &dyn NotificationDispatch,
    outbound: &[OutboundNotification],
) -> Vec<String> {
    let mut sent = Vec::with_capacity(outbound.len());
    for n in outbound {
        match dispatcher.send(n) {
            Ok(id) => sent.push(id),
            Err(e) => tracing::warn!(
                recipient = %n.recipient_id,
                kind = %n.notification_type,
                error = %e,
                "notification dispatch failed"
            ),
        }
    }
    sent
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub recipient_type: String,
    pub recipient_id: String,
    pub sender_id: Option<String>,
    pub title: String,
    pub message: String,
    pub notification_type: NotificationType,
    pub priority: Priority,
    pub channels: Channels,
    pub status: NotificationStatus,
    pub retry_count: i64,
    pub max_retries: i64,
    pub last_error: Option<String>,
    pub delivered_at: Option<String>,
    pub read_at: Option<String>,
    pub created_at: String,
    pub expires_at: String,
}

const SELECT_COLUMNS: &str = "id, recipient_type, recipient_id, sender_id, title, message,
    notification_type, priority, channel_sms, channel_email, channel_push, channel_in_app,
    status, retry_count, max_retries, last_error, delivered_at, read_at, created_at, expires_at";

fn row_to_notification(r: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: r.get(0)?,
        recipient_type: r.get(1)?,
        recipient_id: r.get(2)?,
        sender_id: r.get(3)?,
        title: r.get(4)?,
        message: r.get(5)?,
        notification_type: r.get(6)?,
        priority: r.get(7)?,
        channels: Channels {
            sms: r.get(8)?,
            email: r.get(9)?,
            push: r.get(10)?,
            in_app: r.get(11)?,
        },
        status: r.get(12)?,
        retry_count: r.get(13)?,
        max_retries: r.get(14)?,
        last_error: r.get(15)?,
        delivered_at: r.get(16)?,
        read_at: r.get(17)?,
        created_at: r.get(18)?,
        expires_at: r.get(19)?,
    })
}

pub fn get(conn: &Connection, id: &str) -> CoreResult<Notification> {
    conn.query_row(
        &format!("SELECT {} FROM notifications WHERE id = ?", SELECT_COLUMNS),
        [id],
        row_to_notification,
    )
    .optional()?
    .ok_or(CoreError::NotFound("notification"))
}

#[derive(Debug, Clone, Default)]
pub struct NotificationFilter {
    /// Only honoured for administrators; everyone else sees their own inbox.
    pub recipient_id: Option<String>,
    pub status: Option<NotificationStatus>,
    pub notification_type: Option<NotificationType>,
    pub unread_only: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbox {
    pub notifications: Vec<Notification>,
    pub unread: i64,
}

/// Unexpired notifications addressed to the actor, newest first.
pub fn list(
    conn: &Connection,
    actor: &Actor,
    filter: &NotificationFilter,
    page: Page,
) -> CoreResult<Inbox> {
    let recipient = match (&filter.recipient_id, actor.is_admin()) {
        (Some(id), true) => id.clone(),
        (Some(id), false) if *id != actor.id => {
            return Err(CoreError::forbidden("notifications belong to another account"))
        }
        _ => actor.id.clone(),
    };
    let now = model::now();

    let mut sql = format!(
        "SELECT {} FROM notifications WHERE recipient_id = ? AND expires_at > ?",
        SELECT_COLUMNS
    );
    let mut args = vec![SqlValue::Text(recipient.clone()), SqlValue::Text(now.clone())];
    if let Some(status) = filter.status {
        sql.push_str(" AND status = ?");
        args.push(SqlValue::Text(status.as_str().to_string()));
    }
    if let Some(kind) = filter.notification_type {
        sql.push_str(" AND notification_type = ?");
        args.push(SqlValue::Text(kind.as_str().to_string()));
    }
    if filter.unread_only {
        sql.push_str(" AND status IN ('sent', 'delivered')");
    }
    sql.push_str(" ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?");
    args.push(SqlValue::Integer(page.limit));
    args.push(SqlValue::Integer(page.offset));

    let mut stmt = conn.prepare(&sql)?;
    let notifications = stmt
        .query_map(params_from_iter(args), row_to_notification)?
        .collect::<Result<Vec<_>, _>>()?;
    let unread: i64 = conn.query_row(
        "SELECT COUNT(*) FROM notifications
         WHERE recipient_id = ? AND expires_at > ? AND status IN ('sent', 'delivered')",
        params![recipient, now],
        |r| r.get(0),
    )?;
    Ok(Inbox {
        notifications,
        unread,
    })
}

fn require_recipient(actor: &Actor, n: &Notification) -> CoreResult<()> {
    authz::require(actor, authz::Action::Update, &n.recipient_id, |_| Ok(Vec::new()))
}

/// Move a notification from `from` to `to` with a single conditional update.
fn transition(
    conn: &Connection,
    id: &str,
    from: &[NotificationStatus],
    to: NotificationStatus,
    stamp_column: Option<&str>,
) -> CoreResult<Notification> {
    let allowed: Vec<String> = from.iter().map(|s| format!("'{}'", s.as_str())).collect();
    let stamp = stamp_column
        .map(|c| format!(", {} = ?2", c))
        .unwrap_or_default();
    let changed = conn.execute(
        &format!(
            "UPDATE notifications SET status = ?1{} WHERE id = ?3 AND status IN ({})",
            stamp,
            allowed.join(", ")
        ),
        params![to, model::now(), id],
    )?;
    let current = get(conn, id)?;
    if changed == 0 {
        return Err(CoreError::invalid_state(format!(
            "notification is {}, cannot become {}",
            current.status, to
        )));
    }
    Ok(current)
}

pub fn mark_delivered(conn: &Connection, actor: &Actor, id: &str) -> CoreResult<Notification> {
    let n = get(conn, id)?;
    require_recipient(actor, &n)?;
    transition(
        conn,
        id,
        &[NotificationStatus::Sent],
        NotificationStatus::Delivered,
        Some("delivered_at"),
    )
}

/// Reading is idempotent: a notification already read stays read.
pub fn mark_read(conn: &Connection, actor: &Actor, id: &str) -> CoreResult<Notification> {
    let n = get(conn, id)?;
    require_recipient(actor, &n)?;
    if n.status == NotificationStatus::Read {
        return Ok(n);
    }
    transition(
        conn,
        id,
        &[NotificationStatus::Sent, NotificationStatus::Delivered],
        NotificationStatus::Read,
        Some("read_at"),
    )
}

pub fn mark_failed(
    conn: &Connection,
    actor: &Actor,
    id: &str,
    error: &str,
) -> CoreResult<Notification> {
    authz::require_admin(actor)?;
    let changed = conn.execute(
        "UPDATE notifications
         SET status = 'failed', retry_count = retry_count + 1, last_error = ?
         WHERE id = ? AND status IN ('sent', 'delivered')",
        params![error, id],
    )?;
    let n = get(conn, id)?;
    if changed == 0 {
        return Err(CoreError::invalid_state(format!(
            "notification is {}, cannot fail",
            n.status
        )));
    }
    Ok(n)
}

/// Resend a failed notification while it still has retries left.
pub fn retry(conn: &Connection, actor: &Actor, id: &str) -> CoreResult<Notification> {
    authz::require_admin(actor)?;
    let changed = conn.execute(
        "UPDATE notifications SET status = 'sent', last_error = NULL
         WHERE id = ? AND status = 'failed' AND retry_count < max_retries",
        [id],
    )?;
    let n = get(conn, id)?;
    if changed == 0 {
        if n.status == NotificationStatus::Failed {
            return Err(CoreError::invalid_state(format!(
                "retry limit of {} reached",
                n.max_retries
            )));
        }
        return Err(CoreError::invalid_state(format!(
            "notification is {}, only failed notifications can be retried",
            n.status
        )));
    }
    Ok(n)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Broadcast {
    #[serde(default)]
    pub recipient_ids: Vec<String>,
    #[serde(default)]
    pub role: Option<Role>,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub notification_type: Option<NotificationType>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub channels: Option<Channels>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastOutcome {
    pub sent: Vec<String>,
    pub recipients: usize,
}

/// Administrator announcement to explicit accounts or to every active
/// account holding a role.
pub fn broadcast(
    conn: &Connection,
    dispatcher: &dyn NotificationDispatch,
    actor: &Actor,
    input: &Broadcast,
) -> CoreResult<BroadcastOutcome> {
    authz::require_admin(actor)?;
    let title = validate::required_text(&input.title, "title", 200)?;
    let message = validate::required_text(&input.message, "message", 2000)?;

    let recipients: Vec<(String, String)> = match (input.recipient_ids.is_empty(), input.role) {
        (false, None) => {
            let mut out = Vec::with_capacity(input.recipient_ids.len());
            for id in &input.recipient_ids {
                let role: String = conn
                    .query_row("SELECT role FROM accounts WHERE id = ?", [id], |r| r.get(0))
                    .optional()?
                    .ok_or(CoreError::NotFound("account"))?;
                out.push((id.clone(), role));
            }
            out
        }
        (true, Some(Role::Admin)) => {
            return Err(CoreError::validation("role must be teacher, student or guardian"))
        }
        (true, Some(role)) => {
            let mut stmt =
                conn.prepare("SELECT id, role FROM accounts WHERE role = ? AND active = 1 ORDER BY id")?;
            let rows = stmt
                .query_map([role.as_str()], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        _ => {
            return Err(CoreError::validation(
                "give exactly one of recipientIds or role",
            ))
        }
    };

    let outbound: Vec<OutboundNotification> = recipients
        .iter()
        .filter_map(|(id, role)| {
            Role::parse(role).ok().map(|recipient_type| OutboundNotification {
                recipient_type,
                recipient_id: id.clone(),
                sender_id: Some(actor.id.clone()),
                title: title.clone(),
                message: message.clone(),
                notification_type: input.notification_type.unwrap_or(NotificationType::Announcement),
                priority: input.priority.unwrap_or(Priority::Normal),
                channels: input.channels.unwrap_or_default(),
            })
        })
        .collect();
    let sent = dispatch_all(dispatcher, &outbound);
    tracing::info!(recipients = outbound.len(), sent = sent.len(), "broadcast dispatched");
    Ok(BroadcastOutcome {
        sent,
        recipients: outbound.len(),
    })
}

/// Delete expired notifications. Safe to run repeatedly.
pub fn prune_expired(conn: &Connection) -> CoreResult<usize> {
    let removed = conn.execute(
        "DELETE FROM notifications WHERE expires_at <= ?",
        [model::now()],
    )?;
    if removed > 0 {
        tracing::info!(removed, "pruned expired notifications");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct Flaky {
        seen: RefCell<Vec<String>>,
    }

    impl NotificationDispatch for Flaky {
        fn send(&self, n: &OutboundNotification) -> anyhow::Result<String> {
            if n.recipient_id == "acc-down" {
                anyhow::bail!("inbox unavailable");
            }
            self.seen.borrow_mut().push(n.recipient_id.clone());
            Ok(format!("n-{}", n.recipient_id))
        }
    }

    fn outbound(recipient: &str) -> OutboundNotification {
        OutboundNotification {
            recipient_type: Role::Student,
            recipient_id: recipient.to_string(),
            sender_id: None,
            title: "Absence".into(),
            message: "absent today".into(),
            notification_type: NotificationType::Attendance,
            priority: Priority::High,
            channels: Channels::default(),
        }
    }

    #[test]
    fn dispatch_failures_do_not_stop_the_batch() {
        let d = Flaky {
            seen: RefCell::new(Vec::new()),
        };
        let ids = dispatch_all(&d, &[outbound("acc-1"), outbound("acc-down"), outbound("acc-2")]);
        assert_eq!(ids, vec!["n-acc-1".to_string(), "n-acc-2".to_string()]);
        assert_eq!(d.seen.borrow().len(), 2);
    }
}
