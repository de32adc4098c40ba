pub mod accounts;
pub mod attendance;
pub mod audit;
pub mod auth;
pub mod backup;
pub mod classes;
pub mod core;
pub mod guardians;
pub mod notifications;
pub mod payments;
pub mod settings;
pub mod students;
pub mod teachers;

use crate::authz::Actor;
use crate::error::{CoreError, CoreResult};
use crate::identity;
use crate::ipc::error::{err, fail, ok};
use crate::ipc::types::{AppState, Request, Workspace};
use crate::validate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `{ "id": ... }`
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct IdParams {
    pub id: String,
}

/// `{ "id": ..., "patch": {...} }`; the patch is checked by the core
/// operation against its own allow-list.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct PatchParams {
    pub id: String,
    #[serde(default)]
    pub patch: Value,
}

pub(crate) fn params<T: DeserializeOwned>(req: &Request) -> CoreResult<T> {
    validate::from_json(&req.params)
}

pub(crate) fn to_json<T: Serialize>(value: T) -> CoreResult<Value> {
    Ok(serde_json::to_value(value)?)
}

pub(crate) fn no_workspace(req: &Request) -> Value {
    err(&req.id, "no_workspace", "select a workspace first", None)
}

pub(crate) fn respond(state: &AppState, req: &Request, result: CoreResult<Value>) -> Value {
    match result {
        Ok(v) => ok(&req.id, v),
        Err(e) => fail(&req.id, &e, state.config.dev_mode),
    }
}

/// Public method: needs an open workspace but no session.
pub(crate) fn with_workspace<F>(state: &AppState, req: &Request, f: F) -> Value
where
    F: FnOnce(&Workspace) -> CoreResult<Value>,
{
    let Some(ws) = state.workspace.as_ref() else {
        return no_workspace(req);
    };
    respond(state, req, f(ws))
}

/// Resolve the request token to an actor, or the error reply to send.
pub(crate) fn session_actor(state: &AppState, req: &Request) -> Result<Actor, Value> {
    let Some(ws) = state.workspace.as_ref() else {
        return Err(no_workspace(req));
    };
    let Some(token) = req.token.as_deref().filter(|t| !t.trim().is_empty()) else {
        let missing = CoreError::Unauthorized("missing session token".into());
        return Err(fail(&req.id, &missing, state.config.dev_mode));
    };
    match identity::resolve_session(&ws.conn, &state.config, token) {
        Ok(actor) => {
            tracing::Span::current().record("actor", actor.id.as_str());
            Ok(actor)
        }
        Err(e) => Err(fail(&req.id, &e, state.config.dev_mode)),
    }
}

/// Authenticated method: the request token is resolved to an actor first.
pub(crate) fn with_actor<F>(state: &AppState, req: &Request, f: F) -> Value
where
    F: FnOnce(&Workspace, &Actor) -> CoreResult<Value>,
{
    let actor = match session_actor(state, req) {
        Ok(a) => a,
        Err(reply) => return reply,
    };
    let Some(ws) = state.workspace.as_ref() else {
        return no_workspace(req);
    };
    respond(state, req, f(ws, &actor))
}
