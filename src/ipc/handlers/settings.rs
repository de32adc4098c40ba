use super::with_actor;
use crate::audit::{self, AuditEvent, Category, Outcome, Severity};
use crate::authz;
use crate::error::CoreError;
use crate::ipc::types::{AppState, Request};
use crate::settings::{self, Section, ALL_SECTIONS};
use serde_json::{json, Map, Value};

fn handle_settings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        authz::require_admin(actor)?;
        let mut out = Map::new();
        for section in ALL_SECTIONS {
            out.insert(
                section.name().to_string(),
                settings::load_section(&ws.conn, section)?,
            );
        }
        Ok(Value::Object(out))
    })
}

fn handle_settings_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        authz::require_admin(actor)?;
        let section_raw = req
            .params
            .get("section")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::validation("missing section"))?;
        let section = Section::parse(section_raw)
            .ok_or_else(|| CoreError::validation(format!("unknown section: {}", section_raw)))?;
        let patch = req
            .params
            .get("patch")
            .and_then(|v| v.as_object())
            .ok_or_else(|| CoreError::validation("patch must be an object"))?;

        let before = settings::load_section(&ws.conn, section)?;
        let mut current = before.clone();
        settings::merge_section_patch(section, &mut current, patch).map_err(CoreError::Validation)?;
        settings::save_section(&ws.conn, section, &current)?;

        audit::record(
            &ws.conn,
            AuditEvent::new("settings.update", "settings", Category::System)
                .entity(section.name())
                .by(actor)
                .describe(format!("updated {} settings", section.name()))
                .details(json!({ "before": before, "after": current }))
                .outcome(Outcome::Success, Severity::Medium),
        );
        let mut out = Map::new();
        out.insert(section.name().to_string(), current);
        Ok(Value::Object(out))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.get" => Some(handle_settings_get(state, req)),
        "settings.update" => Some(handle_settings_update(state, req)),
        _ => None,
    }
}
