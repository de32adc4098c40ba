use super::{params, to_json, with_actor, IdParams, PatchParams};
use crate::identity::{self, AccountFilter, AccountPatch, NewAccount};
use crate::ipc::types::{AppState, Request};
use crate::profiles;
use crate::validate;
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SetActiveParams {
    id: String,
    active: bool,
}

fn handle_me(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        if actor.is_admin() {
            return Ok(json!({ "id": actor.id, "role": actor.role, "account": null, "profile": null }));
        }
        let account = identity::load_account(&ws.conn, &actor.id)?;
        let profile = profiles::profile_for_account(&ws.conn, &actor.id, actor.role)?;
        Ok(json!({
            "id": actor.id,
            "role": actor.role,
            "account": account,
            "profile": profile,
        }))
    })
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let p: IdParams = params(req)?;
        to_json(identity::get_account(&ws.conn, actor, &p.id)?)
    })
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let filter: AccountFilter = params(req)?;
        let accounts = identity::list_accounts(&ws.conn, actor, &filter)?;
        Ok(json!({ "accounts": accounts }))
    })
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let cfg = &state.config;
    with_actor(state, req, |ws, actor| {
        let input: NewAccount = params(req)?;
        to_json(identity::create_by_admin(&ws.conn, cfg, actor, &input)?)
    })
}

fn handle_set_active(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let p: SetActiveParams = params(req)?;
        to_json(identity::set_active(&ws.conn, actor, &p.id, p.active)?)
    })
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let p: PatchParams = params(req)?;
        let patch: AccountPatch = validate::from_json(&p.patch)?;
        to_json(identity::update_account(&ws.conn, actor, &p.id, &patch)?)
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "accounts.me" => Some(handle_me(state, req)),
        "accounts.get" => Some(handle_get(state, req)),
        "accounts.list" => Some(handle_list(state, req)),
        "accounts.create" => Some(handle_create(state, req)),
        "accounts.setActive" => Some(handle_set_active(state, req)),
        "accounts.update" => Some(handle_update(state, req)),
        _ => None,
    }
}
