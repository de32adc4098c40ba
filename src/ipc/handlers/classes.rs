use super::{params, to_json, with_actor, IdParams, PatchParams};
use crate::classes::{self, ClassFilter, ClassPatch, NewClass};
use crate::ipc::types::{AppState, Request};
use crate::validate;
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct EnrollmentParams {
    class_id: String,
    student_id: String,
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let input: NewClass = params(req)?;
        to_json(classes::create(&ws.conn, actor, &input)?)
    })
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let p: IdParams = params(req)?;
        to_json(classes::get(&ws.conn, actor, &p.id)?)
    })
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let filter: ClassFilter = params(req)?;
        let classes = classes::list(&ws.conn, actor, &filter)?;
        Ok(json!({ "classes": classes }))
    })
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let p: PatchParams = params(req)?;
        let patch: ClassPatch = validate::from_json(&p.patch)?;
        to_json(classes::update(&ws.conn, actor, &p.id, &patch)?)
    })
}

fn handle_enroll(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let p: EnrollmentParams = params(req)?;
        to_json(classes::enroll(&ws.conn, actor, &p.class_id, &p.student_id)?)
    })
}

fn handle_unenroll(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let p: EnrollmentParams = params(req)?;
        to_json(classes::unenroll(&ws.conn, actor, &p.class_id, &p.student_id)?)
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.create" => Some(handle_create(state, req)),
        "classes.get" => Some(handle_get(state, req)),
        "classes.list" => Some(handle_list(state, req)),
        "classes.update" => Some(handle_update(state, req)),
        "classes.enroll" => Some(handle_enroll(state, req)),
        "classes.unenroll" => Some(handle_unenroll(state, req)),
        _ => None,
    }
}
