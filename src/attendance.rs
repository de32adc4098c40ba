//! Attendance reconciliation.
//!
//! A record is keyed by (class, student, calendar date, session number) and
//! the table carries a UNIQUE constraint on that tuple. Recording is a single
//! `INSERT .. ON CONFLICT DO UPDATE`, so repeated or concurrent batches for
//! the same key converge on one row with the last write winning.

use crate::audit::{self, AuditEvent, Category, Outcome, Severity};
use crate::authz::{Action, Actor, Role};
use crate::classes::{self, ClassRef};
use crate::error::{CoreError, CoreResult};
use crate::model::{self, AttendanceStatus, Channels, JustificationStatus, NotificationType, Page, Priority};
use crate::notify::{self, NotificationDispatch, OutboundNotification};
use crate::profiles::{self, StudentRef};
use crate::settings;
use crate::validate;
use chrono::{Duration, NaiveDate, Utc};
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;

const MAX_BATCH: usize = 500;
const MAX_NOTE_LEN: usize = 500;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Justification {
    pub reason: String,
    pub status: JustificationStatus,
    pub submitted_by: Option<String>,
    pub submitted_at: Option<String>,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: String,
    pub class_id: String,
    pub student_id: String,
    pub teacher_id: String,
    pub date: String,
    pub session_number: i64,
    pub status: AttendanceStatus,
    pub note: Option<String>,
    pub academic_year: String,
    pub semester: String,
    pub justification: Option<Justification>,
    pub created_by: String,
    pub modified_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

const RECORD_COLUMNS: &str = "a.id, a.class_id, a.student_id, a.teacher_id, a.date,
    a.session_number, a.status, a.note, a.academic_year, a.semester,
    a.justification_reason, a.justification_status, a.justification_submitted_by,
    a.justification_submitted_at, a.justification_reviewed_by, a.justification_reviewed_at,
    a.created_by, a.modified_by, a.created_at, a.updated_at";

fn row_to_record(r: &rusqlite::Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let reason: Option<String> = r.get(10)?;
    let j_status: Option<JustificationStatus> = r.get(11)?;
    let justification = match (reason, j_status) {
        (Some(reason), Some(status)) => Some(Justification {
            reason,
            status,
            submitted_by: r.get(12)?,
            submitted_at: r.get(13)?,
            reviewed_by: r.get(14)?,
            reviewed_at: r.get(15)?,
        }),
        _ => None,
    };
    Ok(AttendanceRecord {
        id: r.get(0)?,
        class_id: r.get(1)?,
        student_id: r.get(2)?,
        teacher_id: r.get(3)?,
        date: r.get(4)?,
        session_number: r.get(5)?,
        status: r.get(6)?,
        note: r.get(7)?,
        academic_year: r.get(8)?,
        semester: r.get(9)?,
        justification,
        created_by: r.get(16)?,
        modified_by: r.get(17)?,
        created_at: r.get(18)?,
        updated_at: r.get(19)?,
    })
}

pub fn load_record(conn: &Connection, record_id: &str) -> CoreResult<AttendanceRecord> {
    conn.query_row(
        &format!("SELECT {} FROM attendance a WHERE a.id = ?", RECORD_COLUMNS),
        [record_id],
        row_to_record,
    )
    .optional()?
    .ok_or(CoreError::NotFound("attendance record"))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BatchEntry {
    pub student_id: String,
    pub status: AttendanceStatus,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RecordBatch {
    pub class_id: String,
    pub session_number: i64,
    /// Calendar date of the session; today in local time when omitted.
    #[serde(default)]
    pub date: Option<String>,
    pub entries: Vec<BatchEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryFailure {
    pub student_id: String,
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub date: String,
    pub session_number: i64,
    pub records: Vec<AttendanceRecord>,
    pub created: usize,
    pub updated: usize,
    pub failures: Vec<EntryFailure>,
    pub notifications_sent: usize,
}

fn session_date(raw: Option<&str>) -> CoreResult<NaiveDate> {
    let today = Utc::now().date_naive();
    let date = match raw {
        Some(s) => validate::date(s, "date")?,
        None => today,
    };
    if date > today {
        return Err(CoreError::validation("date cannot be in the future"));
    }
    Ok(date)
}

fn follow_up_messages(
    student: &StudentRef,
    class: &ClassRef,
    status: AttendanceStatus,
    date: &str,
    session_number: i64,
    sender: &Actor,
) -> Vec<OutboundNotification> {
    let (title, priority) = match status {
        AttendanceStatus::Absent => ("Absence recorded", Priority::High),
        _ => ("Late arrival recorded", Priority::Normal),
    };
    let message = format!(
        "{} was marked {} in {} on {} (session {}).",
        student.name, status, class.name, date, session_number
    );
    let mut out = vec![OutboundNotification {
        recipient_type: Role::Student,
        recipient_id: student.account_id.clone(),
        sender_id: Some(sender.id.clone()),
        title: title.to_string(),
        message: message.clone(),
        notification_type: NotificationType::Attendance,
        priority,
        channels: Channels::default(),
    }];
    if let Some(guardian) = &student.guardian_account_id {
        out.push(OutboundNotification {
            recipient_type: Role::Guardian,
            recipient_id: guardian.clone(),
            sender_id: Some(sender.id.clone()),
            title: title.to_string(),
            message,
            notification_type: NotificationType::Attendance,
            priority,
            channels: student.guardian_preferences,
        });
    }
    out
}

/// Upsert one record per entry. Entries are independent: a failing entry
/// is reported and does not undo the ones before it. Absent and late
/// entries notify the student and, when linked, their guardian.
pub fn record_batch(
    conn: &Connection,
    dispatcher: &dyn NotificationDispatch,
    actor: &Actor,
    batch: &RecordBatch,
) -> CoreResult<BatchOutcome> {
    let class = classes::class_ref(conn, &batch.class_id)?;
    profiles::require_access(conn, actor, Action::Update, &class.teacher_account_id)?;

    let max_session = settings::max_session_number(conn);
    if !(1..=max_session).contains(&batch.session_number) {
        return Err(CoreError::validation(format!(
            "sessionNumber must be in 1..={}",
            max_session
        )));
    }
    if batch.entries.is_empty() {
        return Err(CoreError::validation("entries must not be empty"));
    }
    if batch.entries.len() > MAX_BATCH {
        return Err(CoreError::validation(format!(
            "at most {} entries per batch",
            MAX_BATCH
        )));
    }
    let date = session_date(batch.date.as_deref())?.format("%Y-%m-%d").to_string();

    let mut record_ids: Vec<String> = Vec::new();
    let mut created = 0usize;
    let mut updated = 0usize;
    let mut failures = Vec::new();
    let mut outbound = Vec::new();

    for entry in &batch.entries {
        match upsert_entry(conn, actor, &class, &date, batch.session_number, entry) {
            Ok((id, was_created, student)) => {
                if was_created {
                    created += 1;
                } else {
                    updated += 1;
                }
                if !record_ids.contains(&id) {
                    record_ids.push(id);
                }
                if entry.status.needs_follow_up() {
                    outbound.extend(follow_up_messages(
                        &student,
                        &class,
                        entry.status,
                        &date,
                        batch.session_number,
                        actor,
                    ));
                }
            }
            Err(e) => {
                tracing::info!(student = %entry.student_id, error = %e, "attendance entry rejected");
                failures.push(EntryFailure {
                    student_id: entry.student_id.clone(),
                    code: e.code(),
                    message: e.to_string(),
                });
            }
        }
    }

    let notifications_sent = notify::dispatch_all(dispatcher, &outbound).len();

    audit::record(
        conn,
        AuditEvent::new("attendance.record_batch", "class", Category::Attendance)
            .entity(&class.id)
            .by(actor)
            .describe(format!(
                "recorded attendance for {} on {} session {}",
                class.name, date, batch.session_number
            ))
            .details(json!({
                "date": date,
                "sessionNumber": batch.session_number,
                "created": created,
                "updated": updated,
                "failed": failures.len(),
            }))
            .outcome(
                if failures.is_empty() { Outcome::Success } else { Outcome::Warning },
                Severity::Low,
            ),
    );

    let mut records = Vec::with_capacity(record_ids.len());
    for id in &record_ids {
        records.push(load_record(conn, id)?);
    }
    Ok(BatchOutcome {
        date,
        session_number: batch.session_number,
        records,
        created,
        updated,
        failures,
        notifications_sent,
    })
}

fn upsert_entry(
    conn: &Connection,
    actor: &Actor,
    class: &ClassRef,
    date: &str,
    session_number: i64,
    entry: &BatchEntry,
) -> CoreResult<(String, bool, StudentRef)> {
    let student = profiles::student_ref(conn, &entry.student_id)?;
    if !classes::is_enrolled(conn, &class.id, &student.id)? {
        return Err(CoreError::validation("student is not enrolled in this class"));
    }
    let note = validate::optional_text(entry.note.as_deref(), "note", MAX_NOTE_LEN)?;
    let now = model::now();

    // modified_by stays NULL only on the insert path.
    let (id, was_created): (String, bool) = conn.query_row(
        "INSERT INTO attendance(
            id, class_id, student_id, teacher_id, date, session_number, status, note,
            academic_year, semester, created_by, modified_by, created_at, updated_at)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL, ?12, ?12)
         ON CONFLICT(class_id, student_id, date, session_number) DO UPDATE SET
            status = excluded.status,
            note = excluded.note,
            teacher_id = excluded.teacher_id,
            modified_by = ?11,
            updated_at = excluded.updated_at
         RETURNING id, modified_by IS NULL",
        params![
            model::new_id(),
            class.id,
            student.id,
            class.teacher_id,
            date,
            session_number,
            entry.status,
            note,
            class.academic_year,
            class.semester,
            actor.id,
            now
        ],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    Ok((id, was_created, student))
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AttendanceQuery {
    pub class_id: Option<String>,
    pub student_id: Option<String>,
    pub teacher_id: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub status: Option<AttendanceStatus>,
    pub session_number: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub present: i64,
    pub absent: i64,
    pub late: i64,
    pub excused: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub records: Vec<AttendanceRecord>,
    pub counts: StatusCounts,
}

/// Filtered read with per-status counts over the whole match (not just the
/// returned page). Results are limited to what the actor may see.
pub fn query(conn: &Connection, actor: &Actor, q: &AttendanceQuery) -> CoreResult<QueryResult> {
    let mut where_sql = String::from(" WHERE 1 = 1");
    let mut args: Vec<SqlValue> = Vec::new();

    if let Some(student_id) = &q.student_id {
        let student = profiles::student_ref(conn, student_id)?;
        if actor.role != Role::Teacher {
            profiles::require_access(conn, actor, Action::Read, &student.account_id)?;
        }
        where_sql.push_str(" AND a.student_id = ?");
        args.push(SqlValue::Text(student_id.clone()));
    }
    match actor.role {
        Role::Admin => {}
        Role::Teacher => {
            where_sql.push_str(
                " AND a.class_id IN (SELECT c.id FROM classes c
                   JOIN teachers t ON t.id = c.teacher_id WHERE t.account_id = ?)",
            );
            args.push(SqlValue::Text(actor.id.clone()));
        }
        Role::Student | Role::Guardian => {
            where_sql.push_str(
                " AND a.student_id IN (SELECT s.id FROM students s
                   LEFT JOIN guardians g ON g.id = s.guardian_id
                   WHERE s.account_id = ? OR g.account_id = ?)",
            );
            args.push(SqlValue::Text(actor.id.clone()));
            args.push(SqlValue::Text(actor.id.clone()));
        }
    }
    if let Some(class_id) = &q.class_id {
        where_sql.push_str(" AND a.class_id = ?");
        args.push(SqlValue::Text(class_id.clone()));
    }
    if let Some(teacher_id) = &q.teacher_id {
        where_sql.push_str(" AND a.teacher_id = ?");
        args.push(SqlValue::Text(teacher_id.clone()));
    }
    if let Some(from) = &q.from {
        let d = validate::date(from, "from")?;
        where_sql.push_str(" AND a.date >= ?");
        args.push(SqlValue::Text(d.format("%Y-%m-%d").to_string()));
    }
    if let Some(to) = &q.to {
        let d = validate::date(to, "to")?;
        where_sql.push_str(" AND a.date <= ?");
        args.push(SqlValue::Text(d.format("%Y-%m-%d").to_string()));
    }
    if let Some(n) = q.session_number {
        where_sql.push_str(" AND a.session_number = ?");
        args.push(SqlValue::Integer(n));
    }

    // Counts ignore the status filter so callers can see the full split.
    let mut counts = StatusCounts::default();
    {
        let mut stmt = conn.prepare(&format!(
            "SELECT a.status, COUNT(*) FROM attendance a{} GROUP BY a.status",
            where_sql
        ))?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |r| {
            Ok((r.get::<_, AttendanceStatus>(0)?, r.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, n) = row?;
            match status {
                AttendanceStatus::Present => counts.present = n,
                AttendanceStatus::Absent => counts.absent = n,
                AttendanceStatus::Late => counts.late = n,
                AttendanceStatus::Excused => counts.excused = n,
            }
            counts.total += n;
        }
    }

    if let Some(status) = q.status {
        where_sql.push_str(" AND a.status = ?");
        args.push(SqlValue::Text(status.as_str().to_string()));
    }
    let page = Page::new(q.limit, q.offset);
    args.push(SqlValue::Integer(page.limit));
    args.push(SqlValue::Integer(page.offset));
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM attendance a{} ORDER BY a.date DESC, a.session_number, a.student_id LIMIT ? OFFSET ?",
        RECORD_COLUMNS, where_sql
    ))?;
    let records = stmt
        .query_map(params_from_iter(args.iter()), row_to_record)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(QueryResult { records, counts })
}

/// A student or their guardian explains an absence or late arrival within
/// the configured window. A rejected justification may be resubmitted.
pub fn submit_justification(
    conn: &Connection,
    dispatcher: &dyn NotificationDispatch,
    actor: &Actor,
    record_id: &str,
    reason: &str,
) -> CoreResult<AttendanceRecord> {
    let record = load_record(conn, record_id)?;
    let student = profiles::student_ref(conn, &record.student_id)?;
    if actor.role == Role::Teacher {
        return Err(CoreError::forbidden(
            "justifications are submitted by the student or a guardian",
        ));
    }
    profiles::require_access(conn, actor, Action::Update, &student.account_id)?;
    let reason = validate::required_text(reason, "reason", MAX_NOTE_LEN)?;

    if !record.status.needs_follow_up() {
        return Err(CoreError::invalid_state(format!(
            "only absent or late records can be justified, this one is {}",
            record.status
        )));
    }
    let window = settings::justification_window_days(conn);
    let date = validate::date(&record.date, "date")?;
    if Utc::now().date_naive() > date + Duration::days(window) {
        return Err(CoreError::invalid_state(format!(
            "the {}-day justification window has passed",
            window
        )));
    }

    let now = model::now();
    let changed = conn.execute(
        "UPDATE attendance SET
            justification_reason = ?, justification_status = 'pending',
            justification_submitted_by = ?, justification_submitted_at = ?,
            justification_reviewed_by = NULL, justification_reviewed_at = NULL,
            updated_at = ?
         WHERE id = ? AND (justification_status IS NULL OR justification_status = 'rejected')",
        params![reason, actor.id, now, now, record_id],
    )?;
    if changed == 0 {
        return Err(CoreError::invalid_state(
            "a justification is already pending or approved for this record",
        ));
    }

    let class = classes::class_ref(conn, &record.class_id)?;
    notify::dispatch_all(
        dispatcher,
        &[OutboundNotification {
            recipient_type: Role::Teacher,
            recipient_id: class.teacher_account_id.clone(),
            sender_id: Some(actor.id.clone()),
            title: "Justification submitted".into(),
            message: format!(
                "{} submitted a justification for {} on {}.",
                student.name, class.name, record.date
            ),
            notification_type: NotificationType::Attendance,
            priority: Priority::Normal,
            channels: Channels::default(),
        }],
    );
    audit::record(
        conn,
        AuditEvent::new("attendance.submit_justification", "attendance", Category::Attendance)
            .entity(record_id)
            .by(actor)
            .describe(format!("justification submitted for {}", student.name))
            .details(json!({ "reason": reason })),
    );
    load_record(conn, record_id)
}

/// The class owner (or an administrator) settles a pending justification.
/// Approval turns the record into `excused`.
pub fn review_justification(
    conn: &Connection,
    dispatcher: &dyn NotificationDispatch,
    actor: &Actor,
    record_id: &str,
    decision: JustificationStatus,
) -> CoreResult<AttendanceRecord> {
    if decision == JustificationStatus::Pending {
        return Err(CoreError::validation("decision must be approved or rejected"));
    }
    let record = load_record(conn, record_id)?;
    let class = classes::class_ref(conn, &record.class_id)?;
    profiles::require_access(conn, actor, Action::Update, &class.teacher_account_id)?;

    let now = model::now();
    let changed = conn.execute(
        "UPDATE attendance SET
            justification_status = ?1,
            justification_reviewed_by = ?2,
            justification_reviewed_at = ?3,
            status = CASE WHEN ?1 = 'approved' THEN 'excused' ELSE status END,
            modified_by = ?2,
            updated_at = ?3
         WHERE id = ?4 AND justification_status = 'pending'",
        params![decision, actor.id, now, record_id],
    )?;
    if changed == 0 {
        return Err(CoreError::invalid_state("no pending justification on this record"));
    }

    let student = profiles::student_ref(conn, &record.student_id)?;
    let message = format!(
        "The justification for {} in {} on {} was {}.",
        student.name, class.name, record.date, decision
    );
    let mut outbound = vec![OutboundNotification {
        recipient_type: Role::Student,
        recipient_id: student.account_id.clone(),
        sender_id: Some(actor.id.clone()),
        title: "Justification reviewed".into(),
        message: message.clone(),
        notification_type: NotificationType::Attendance,
        priority: Priority::Normal,
        channels: Channels::default(),
    }];
    if let Some(guardian) = &student.guardian_account_id {
        outbound.push(OutboundNotification {
            recipient_type: Role::Guardian,
            recipient_id: guardian.clone(),
            sender_id: Some(actor.id.clone()),
            title: "Justification reviewed".into(),
            message,
            notification_type: NotificationType::Attendance,
            priority: Priority::Normal,
            channels: student.guardian_preferences,
        });
    }
    notify::dispatch_all(dispatcher, &outbound);

    audit::record(
        conn,
        AuditEvent::new("attendance.review_justification", "attendance", Category::Attendance)
            .entity(record_id)
            .by(actor)
            .describe(format!("justification {} for {}", decision, student.name))
            .details(json!({ "decision": decision, "previousStatus": record.status })),
    );
    load_record(conn, record_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student() -> StudentRef {
        StudentRef {
            id: "stu-1".into(),
            account_id: "acc-stu".into(),
            name: "Mona".into(),
            guardian_account_id: Some("acc-guard".into()),
            guardian_preferences: Channels {
                sms: true,
                email: false,
                push: false,
                in_app: true,
            },
        }
    }

    fn class() -> ClassRef {
        ClassRef {
            id: "cls-1".into(),
            name: "Algebra".into(),
            teacher_id: "tch-1".into(),
            teacher_account_id: "acc-tch".into(),
            academic_year: "2025/2026".into(),
            semester: "first".into(),
            status: model::ClassStatus::Active,
        }
    }

    #[test]
    fn absence_fans_out_to_student_and_guardian() {
        let sender = Actor::new("acc-tch", Role::Teacher);
        let out = follow_up_messages(&student(), &class(), AttendanceStatus::Absent, "2026-01-10", 2, &sender);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].recipient_id, "acc-stu");
        assert_eq!(out[0].priority, Priority::High);
        assert_eq!(out[1].recipient_id, "acc-guard");
        assert_eq!(out[1].recipient_type, Role::Guardian);
        assert!(out[1].channels.sms, "guardian preferences drive channels");
    }

    #[test]
    fn student_without_guardian_gets_one_message() {
        let mut s = student();
        s.guardian_account_id = None;
        let sender = Actor::new("acc-tch", Role::Teacher);
        let out = follow_up_messages(&s, &class(), AttendanceStatus::Late, "2026-01-10", 1, &sender);
        assert_eq!(out.len(), 1);
        assert!(out[0].message.contains("late"));
    }

    #[test]
    fn future_dates_are_rejected() {
        let tomorrow = Utc::now().date_naive() + Duration::days(1);
        let raw = tomorrow.format("%Y-%m-%d").to_string();
        assert!(session_date(Some(&raw)).is_err());
        assert!(session_date(None).is_ok());
    }
}
