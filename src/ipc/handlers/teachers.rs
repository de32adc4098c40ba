use super::{params, to_json, with_actor, IdParams, PatchParams};
use crate::ipc::types::{AppState, Request};
use crate::profiles::{self, TeacherListFilter};
use serde_json::json;

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let p: IdParams = params(req)?;
        to_json(profiles::get_teacher(&ws.conn, actor, &p.id)?)
    })
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let filter: TeacherListFilter = params(req)?;
        let teachers = profiles::list_teachers(&ws.conn, actor, &filter)?;
        Ok(json!({ "teachers": teachers }))
    })
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let p: PatchParams = params(req)?;
        to_json(profiles::update_teacher(&ws.conn, actor, &p.id, &p.patch)?)
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.get" => Some(handle_get(state, req)),
        "teachers.list" => Some(handle_list(state, req)),
        "teachers.update" => Some(handle_update(state, req)),
        _ => None,
    }
}
