use super::{params, with_actor};
use crate::audit::{self, AuditFilter};
use crate::authz;
use crate::ipc::types::{AppState, Request};
use crate::model::Page;
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ListParams {
    category: Option<String>,
    action: Option<String>,
    actor_id: Option<String>,
    entity_type: Option<String>,
    entity_id: Option<String>,
    status: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        authz::require_admin(actor)?;
        let p: ListParams = params(req)?;
        let filter = AuditFilter {
            category: p.category,
            action: p.action,
            actor_id: p.actor_id,
            entity_type: p.entity_type,
            entity_id: p.entity_id,
            status: p.status,
        };
        let entries = audit::list(&ws.conn, &filter, Page::new(p.limit, p.offset))?;
        Ok(json!({ "entries": entries }))
    })
}

fn handle_prune(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        authz::require_admin(actor)?;
        let removed = audit::prune_expired(&ws.conn)?;
        Ok(json!({ "removed": removed }))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "audit.list" => Some(handle_list(state, req)),
        "audit.prune" => Some(handle_prune(state, req)),
        _ => None,
    }
}
