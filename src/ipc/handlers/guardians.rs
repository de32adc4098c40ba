use super::{params, to_json, with_actor, IdParams, PatchParams};
use crate::ipc::types::{AppState, Request};
use crate::profiles;
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct LinkParams {
    guardian_id: String,
    student_id: String,
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let p: IdParams = params(req)?;
        to_json(profiles::get_guardian(&ws.conn, actor, &p.id)?)
    })
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let p: PatchParams = params(req)?;
        to_json(profiles::update_guardian(&ws.conn, actor, &p.id, &p.patch)?)
    })
}

fn handle_link_child(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let p: LinkParams = params(req)?;
        to_json(profiles::link_child(&ws.conn, actor, &p.guardian_id, &p.student_id)?)
    })
}

fn handle_children(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let p: IdParams = params(req)?;
        let children = profiles::children(&ws.conn, actor, &p.id)?;
        Ok(json!({ "children": children }))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "guardians.get" => Some(handle_get(state, req)),
        "guardians.update" => Some(handle_update(state, req)),
        "guardians.linkChild" => Some(handle_link_child(state, req)),
        "guardians.children" => Some(handle_children(state, req)),
        _ => None,
    }
}
