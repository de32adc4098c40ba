use super::{params, to_json, with_actor};
use crate::attendance::{self, AttendanceQuery, RecordBatch};
use crate::ipc::types::{AppState, Request};
use crate::model::JustificationStatus;
use serde::Deserialize;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SubmitParams {
    record_id: String,
    reason: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ReviewParams {
    record_id: String,
    decision: JustificationStatus,
}

fn handle_record_batch(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let batch: RecordBatch = params(req)?;
        to_json(attendance::record_batch(&ws.conn, ws.notifier.as_ref(), actor, &batch)?)
    })
}

fn handle_query(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let q: AttendanceQuery = params(req)?;
        to_json(attendance::query(&ws.conn, actor, &q)?)
    })
}

fn handle_submit_justification(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let p: SubmitParams = params(req)?;
        to_json(attendance::submit_justification(
            &ws.conn,
            ws.notifier.as_ref(),
            actor,
            &p.record_id,
            &p.reason,
        )?)
    })
}

fn handle_review_justification(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_actor(state, req, |ws, actor| {
        let p: ReviewParams = params(req)?;
        to_json(attendance::review_justification(
            &ws.conn,
            ws.notifier.as_ref(),
            actor,
            &p.record_id,
            p.decision,
        )?)
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.recordBatch" => Some(handle_record_batch(state, req)),
        "attendance.query" => Some(handle_query(state, req)),
        "attendance.submitJustification" => Some(handle_submit_justification(state, req)),
        "attendance.reviewJustification" => Some(handle_review_justification(state, req)),
        _ => None,
    }
}
