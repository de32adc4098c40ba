use super::{params, to_json, with_actor, with_workspace};
use crate::identity::{self, NewAccount};
use crate::ipc::types::{AppState, Request};
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct LoginParams {
    phone: String,
    password: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct AdminLoginParams {
    secret: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ChangePasswordParams {
    current_password: String,
    new_password: String,
}

fn handle_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let cfg = &state.config;
    with_workspace(state, req, |ws| {
        let input: NewAccount = params(req)?;
        to_json(identity::register(&ws.conn, cfg, &input)?)
    })
}

fn handle_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let cfg = &state.config;
    with_workspace(state, req, |ws| {
        let p: LoginParams = params(req)?;
        to_json(identity::authenticate(&ws.conn, cfg, &p.phone, &p.password)?)
    })
}

fn handle_admin_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let cfg = &state.config;
    with_workspace(state, req, |ws| {
        let p: AdminLoginParams = params(req)?;
        to_json(identity::authenticate_admin(&ws.conn, cfg, &p.secret)?)
    })
}

fn handle_verify(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |_, actor| {
        Ok(json!({ "accountId": actor.id, "role": actor.role }))
    })
}

fn handle_change_password(state: &mut AppState, req: &Request) -> serde_json::Value {
    let cfg = &state.config;
    with_actor(state, req, |ws, actor| {
        let p: ChangePasswordParams = params(req)?;
        identity::change_password(&ws.conn, cfg, actor, &p.current_password, &p.new_password)?;
        Ok(json!({ "ok": true }))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.register" => Some(handle_register(state, req)),
        "auth.login" => Some(handle_login(state, req)),
        "auth.adminLogin" => Some(handle_admin_login(state, req)),
        "auth.verify" => Some(handle_verify(state, req)),
        "auth.changePassword" => Some(handle_change_password(state, req)),
        _ => None,
    }
}
