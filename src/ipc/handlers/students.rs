use super::{params, to_json, with_actor, IdParams, PatchParams};
use crate::ipc::types::{AppState, Request};
use crate::profiles::{self, StudentListFilter};
use serde_json::json;

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let p: IdParams = params(req)?;
        to_json(profiles::get_student(&ws.conn, actor, &p.id)?)
    })
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let filter: StudentListFilter = params(req)?;
        let students = profiles::list_students(&ws.conn, actor, &filter)?;
        Ok(json!({ "students": students }))
    })
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let p: PatchParams = params(req)?;
        to_json(profiles::update_student(&ws.conn, actor, &p.id, &p.patch)?)
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.get" => Some(handle_get(state, req)),
        "students.list" => Some(handle_list(state, req)),
        "students.update" => Some(handle_update(state, req)),
        _ => None,
    }
}
