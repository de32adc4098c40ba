use super::{params, respond, session_actor, with_actor};
use crate::audit::{self, AuditEvent, Category, Outcome, Severity};
use crate::authz;
use crate::backup;
use crate::error::CoreError;
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ExportParams {
    out_path: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ImportParams {
    in_path: String,
}

fn handle_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        authz::require_admin(actor)?;
        let p: ExportParams = params(req)?;
        let out_path = PathBuf::from(p.out_path);
        let summary = backup::export_workspace(&ws.path, &out_path)?;
        audit::record(
            &ws.conn,
            AuditEvent::new("backup.export", "workspace", Category::System)
                .by(actor)
                .describe(format!("exported workspace to {}", out_path.display()))
                .outcome(Outcome::Success, Severity::High),
        );
        Ok(json!({
            "path": out_path.to_string_lossy(),
            "bundleFormat": summary.bundle_format,
            "entryCount": summary.entry_count,
            "bytes": summary.bytes,
        }))
    })
}

/// Replacing the database requires closing every handle on it, so this
/// handler drops the workspace and reopens it afterwards.
fn handle_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let actor = match session_actor(state, req) {
        Ok(a) => a,
        Err(reply) => return reply,
    };
    if let Err(e) = authz::require_admin(&actor) {
        return respond(state, req, Err(e));
    }
    let p: ImportParams = match params(req) {
        Ok(p) => p,
        Err(e) => return respond(state, req, Err(e)),
    };
    let Some(workspace) = state.workspace.as_ref().map(|w| w.path.clone()) else {
        return super::no_workspace(req);
    };

    state.workspace = None;
    let imported = backup::import_workspace(&PathBuf::from(&p.in_path), &workspace);
    if let Err(e) = state.open_workspace(&workspace) {
        return err(&req.id, "db_open_failed", format!("{:#}", e), None);
    }
    let result = imported.map_err(CoreError::from).map(|summary| {
        if let Some(ws) = state.workspace.as_ref() {
            audit::record(
                &ws.conn,
                AuditEvent::new("backup.import", "workspace", Category::System)
                    .by(&actor)
                    .describe(format!("imported workspace from {}", p.in_path))
                    .details(json!({ "format": summary.bundle_format_detected }))
                    .outcome(Outcome::Success, Severity::Critical),
            );
        }
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "bundleFormatDetected": summary.bundle_format_detected,
        })
    });
    respond(state, req, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_export(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_import(state, req)),
        _ => None,
    }
}
