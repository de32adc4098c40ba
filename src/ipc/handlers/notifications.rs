use super::{params, to_json, with_actor, IdParams};
use crate::authz;
use crate::ipc::types::{AppState, Request};
use crate::model::{NotificationStatus, NotificationType, Page};
use crate::notify::{self, Broadcast, NotificationFilter};
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ListParams {
    recipient_id: Option<String>,
    status: Option<NotificationStatus>,
    notification_type: Option<NotificationType>,
    #[serde(default)]
    unread_only: bool,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MarkFailedParams {
    id: String,
    error: String,
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let p: ListParams = params(req)?;
        let filter = NotificationFilter {
            recipient_id: p.recipient_id,
            status: p.status,
            notification_type: p.notification_type,
            unread_only: p.unread_only,
        };
        to_json(notify::list(&ws.conn, actor, &filter, Page::new(p.limit, p.offset))?)
    })
}

fn handle_send(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let input: Broadcast = params(req)?;
        to_json(notify::broadcast(&ws.conn, ws.notifier.as_ref(), actor, &input)?)
    })
}

fn handle_mark_read(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let p: IdParams = params(req)?;
        to_json(notify::mark_read(&ws.conn, actor, &p.id)?)
    })
}

fn handle_mark_delivered(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let p: IdParams = params(req)?;
        to_json(notify::mark_delivered(&ws.conn, actor, &p.id)?)
    })
}

fn handle_mark_failed(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let p: MarkFailedParams = params(req)?;
        let error = crate::validate::required_text(&p.error, "error", 500)?;
        to_json(notify::mark_failed(&ws.conn, actor, &p.id, &error)?)
    })
}

fn handle_retry(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let p: IdParams = params(req)?;
        to_json(notify::retry(&ws.conn, actor, &p.id)?)
    })
}

fn handle_prune(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        authz::require_admin(actor)?;
        let removed = notify::prune_expired(&ws.conn)?;
        Ok(json!({ "removed": removed }))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "notifications.list" => Some(handle_list(state, req)),
        "notifications.send" => Some(handle_send(state, req)),
        "notifications.markRead" => Some(handle_mark_read(state, req)),
        "notifications.markDelivered" => Some(handle_mark_delivered(state, req)),
        "notifications.markFailed" => Some(handle_mark_failed(state, req)),
        "notifications.retry" => Some(handle_retry(state, req)),
        "notifications.prune" => Some(handle_prune(state, req)),
        _ => None,
    }
}
