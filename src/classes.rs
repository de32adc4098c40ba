use crate::audit::{self, AuditEvent, Category};
use crate::authz::{self, Action, Actor, Role};
use crate::error::{CoreError, CoreResult};
use crate::model::{self, ClassStatus, Page, Weekday};
use crate::profiles;
use crate::validate;
use chrono::NaiveTime;
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClassSlot {
    pub day: Weekday,
    pub start_time: String,
    pub end_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

fn validate_slots(slots: &[ClassSlot]) -> CoreResult<()> {
    for slot in slots {
        let start = NaiveTime::parse_from_str(&slot.start_time, "%H:%M")
            .map_err(|_| CoreError::validation("class schedule times must be HH:MM"))?;
        let end = NaiveTime::parse_from_str(&slot.end_time, "%H:%M")
            .map_err(|_| CoreError::validation("class schedule times must be HH:MM"))?;
        if start >= end {
            return Err(CoreError::validation(format!(
                "class slot on {} must end after it starts",
                slot.day
            )));
        }
    }
    Ok(())
}

/// Share of seats taken, in `0.0..=1.0`.
pub fn occupancy_rate(current_students: i64, max_students: i64) -> f64 {
    if max_students <= 0 {
        return 0.0;
    }
    (current_students as f64 / max_students as f64).clamp(0.0, 1.0)
}

/// The parts of a class the reconciler and resolver need.
#[derive(Debug, Clone)]
pub struct ClassRef {
    pub id: String,
    pub name: String,
    pub teacher_id: String,
    pub teacher_account_id: String,
    pub academic_year: String,
    pub semester: String,
    pub status: ClassStatus,
}

pub fn class_ref(conn: &Connection, class_id: &str) -> CoreResult<ClassRef> {
    conn.query_row(
        "SELECT c.id, c.name, c.teacher_id, t.account_id, c.academic_year, c.semester, c.status
         FROM classes c JOIN teachers t ON t.id = c.teacher_id
         WHERE c.id = ?",
        [class_id],
        |r| {
            Ok(ClassRef {
                id: r.get(0)?,
                name: r.get(1)?,
                teacher_id: r.get(2)?,
                teacher_account_id: r.get(3)?,
                academic_year: r.get(4)?,
                semester: r.get(5)?,
                status: r.get(6)?,
            })
        },
    )
    .optional()?
    .ok_or(CoreError::NotFound("class"))
}

pub fn is_enrolled(conn: &Connection, class_id: &str, student_id: &str) -> CoreResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM class_enrollments WHERE class_id = ? AND student_id = ?",
            [class_id, student_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub student_id: String,
    pub account_id: String,
    pub name: String,
    pub enrolled_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassView {
    pub id: String,
    pub name: String,
    pub subject: String,
    pub teacher_id: String,
    pub teacher_account_id: String,
    pub teacher_name: String,
    pub max_students: i64,
    pub current_students: i64,
    pub occupancy_rate: f64,
    pub schedule: Vec<ClassSlot>,
    pub price: f64,
    pub academic_year: String,
    pub semester: String,
    pub status: ClassStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roster: Option<Vec<RosterEntry>>,
    pub created_at: String,
    pub updated_at: String,
}

const CLASS_SELECT: &str = "SELECT c.id, c.name, c.subject, c.teacher_id, t.account_id, a.name,
        c.max_students,
        (SELECT COUNT(*) FROM class_enrollments e WHERE e.class_id = c.id),
        c.schedule, c.price, c.academic_year, c.semester, c.status, c.created_at, c.updated_at
     FROM classes c
     JOIN teachers t ON t.id = c.teacher_id
     JOIN accounts a ON a.id = t.account_id";

fn row_to_class(r: &rusqlite::Row<'_>) -> rusqlite::Result<ClassView> {
    let max_students: i64 = r.get(6)?;
    let current_students: i64 = r.get(7)?;
    let schedule: String = r.get(8)?;
    Ok(ClassView {
        id: r.get(0)?,
        name: r.get(1)?,
        subject: r.get(2)?,
        teacher_id: r.get(3)?,
        teacher_account_id: r.get(4)?,
        teacher_name: r.get(5)?,
        max_students,
        current_students,
        occupancy_rate: occupancy_rate(current_students, max_students),
        schedule: serde_json::from_str(&schedule).unwrap_or_default(),
        price: r.get(9)?,
        academic_year: r.get(10)?,
        semester: r.get(11)?,
        status: r.get(12)?,
        roster: None,
        created_at: r.get(13)?,
        updated_at: r.get(14)?,
    })
}

fn load_roster(conn: &Connection, class_id: &str) -> CoreResult<Vec<RosterEntry>> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.account_id, a.name, e.enrolled_at
         FROM class_enrollments e
         JOIN students s ON s.id = e.student_id
         JOIN accounts a ON a.id = s.account_id
         WHERE e.class_id = ?
         ORDER BY a.name COLLATE NOCASE",
    )?;
    let rows = stmt
        .query_map([class_id], |r| {
            Ok(RosterEntry {
                student_id: r.get(0)?,
                account_id: r.get(1)?,
                name: r.get(2)?,
                enrolled_at: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn load_class(conn: &Connection, class_id: &str) -> CoreResult<ClassView> {
    conn.query_row(&format!("{} WHERE c.id = ?", CLASS_SELECT), [class_id], row_to_class)
        .optional()?
        .ok_or(CoreError::NotFound("class"))
}

/// Student account ids that give the actor a member's view of classes:
/// their own for a student, their dependents' for a guardian.
fn member_accounts(conn: &Connection, actor: &Actor) -> CoreResult<Vec<String>> {
    match actor.role {
        Role::Student => Ok(vec![actor.id.clone()]),
        Role::Guardian => profiles::guardian_children(conn, &actor.id),
        _ => Ok(Vec::new()),
    }
}

fn member_filter(accounts: &[String]) -> String {
    let marks = vec!["?"; accounts.len()].join(", ");
    format!(
        "c.id IN (SELECT e.class_id FROM class_enrollments e
                  JOIN students s ON s.id = e.student_id
                  WHERE s.account_id IN ({}))",
        marks
    )
}

/// Owners and administrators see the roster; enrolled students and their
/// guardians see the class without it.
pub fn get(conn: &Connection, actor: &Actor, class_id: &str) -> CoreResult<ClassView> {
    let mut class = load_class(conn, class_id)?;
    if authz::require(actor, Action::Read, &class.teacher_account_id, |_| Ok(Vec::new())).is_ok() {
        class.roster = Some(load_roster(conn, class_id)?);
        return Ok(class);
    }
    let accounts = member_accounts(conn, actor)?;
    if accounts.is_empty() {
        return Err(CoreError::forbidden("class belongs to another teacher"));
    }
    let mut args: Vec<SqlValue> = vec![SqlValue::Text(class_id.to_string())];
    args.extend(accounts.iter().cloned().map(SqlValue::Text));
    let member: Option<i64> = conn
        .query_row(
            &format!("SELECT 1 FROM classes c WHERE c.id = ? AND {}", member_filter(&accounts)),
            params_from_iter(args),
            |r| r.get(0),
        )
        .optional()?;
    match member {
        Some(_) => Ok(class),
        None => Err(CoreError::forbidden("not enrolled in this class")),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClassFilter {
    pub teacher_id: Option<String>,
    pub subject: Option<String>,
    pub status: Option<ClassStatus>,
    pub academic_year: Option<String>,
    pub semester: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Classes visible to the actor: all for admin, owned for teachers,
/// enrolled for students and guardians.
pub fn list(conn: &Connection, actor: &Actor, filter: &ClassFilter) -> CoreResult<Vec<ClassView>> {
    let mut sql = format!("{} WHERE 1 = 1", CLASS_SELECT);
    let mut args: Vec<SqlValue> = Vec::new();
    match actor.role {
        Role::Admin => {}
        Role::Teacher => {
            sql.push_str(" AND t.account_id = ?");
            args.push(SqlValue::Text(actor.id.clone()));
        }
        Role::Student | Role::Guardian => {
            let accounts = member_accounts(conn, actor)?;
            if accounts.is_empty() {
                return Ok(Vec::new());
            }
            sql.push_str(&format!(" AND {}", member_filter(&accounts)));
            args.extend(accounts.into_iter().map(SqlValue::Text));
        }
    }
    if let Some(teacher_id) = &filter.teacher_id {
        sql.push_str(" AND c.teacher_id = ?");
        args.push(SqlValue::Text(teacher_id.clone()));
    }
    if let Some(subject) = &filter.subject {
        sql.push_str(" AND c.subject = ?");
        args.push(SqlValue::Text(subject.clone()));
    }
    if let Some(status) = filter.status {
        sql.push_str(" AND c.status = ?");
        args.push(SqlValue::Text(status.as_str().to_string()));
    }
    if let Some(year) = &filter.academic_year {
        sql.push_str(" AND c.academic_year = ?");
        args.push(SqlValue::Text(year.clone()));
    }
    if let Some(semester) = &filter.semester {
        sql.push_str(" AND c.semester = ?");
        args.push(SqlValue::Text(semester.clone()));
    }
    let page = Page::new(filter.limit, filter.offset);
    sql.push_str(" ORDER BY c.name COLLATE NOCASE, c.id LIMIT ? OFFSET ?");
    args.push(SqlValue::Integer(page.limit));
    args.push(SqlValue::Integer(page.offset));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(args), row_to_class)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NewClass {
    pub name: String,
    pub subject: String,
    pub teacher_id: String,
    pub max_students: i64,
    #[serde(default)]
    pub schedule: Vec<ClassSlot>,
    #[serde(default)]
    pub price: f64,
    pub academic_year: String,
    pub semester: String,
    pub status: Option<ClassStatus>,
}

fn ensure_teacher(conn: &Connection, teacher_id: &str) -> CoreResult<()> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM teachers WHERE id = ?", [teacher_id], |r| r.get(0))
        .optional()?;
    found.map(|_| ()).ok_or(CoreError::NotFound("teacher"))
}

fn capacity(max_students: i64) -> CoreResult<i64> {
    if !(1..=500).contains(&max_students) {
        return Err(CoreError::validation("maxStudents must be in 1..=500"));
    }
    Ok(max_students)
}

pub fn create(conn: &Connection, actor: &Actor, input: &NewClass) -> CoreResult<ClassView> {
    authz::require_admin(actor)?;
    let name = validate::required_text(&input.name, "name", 120)?;
    let subject = validate::required_text(&input.subject, "subject", 80)?;
    let academic_year = validate::required_text(&input.academic_year, "academicYear", 20)?;
    let semester = validate::required_text(&input.semester, "semester", 20)?;
    let max_students = capacity(input.max_students)?;
    let price = validate::money(input.price, "price")?;
    validate_slots(&input.schedule)?;
    ensure_teacher(conn, &input.teacher_id)?;

    let id = model::new_id();
    let now = model::now();
    conn.execute(
        "INSERT INTO classes(id, name, subject, teacher_id, max_students, schedule, price,
                             academic_year, semester, status, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            id,
            name,
            subject,
            input.teacher_id,
            max_students,
            serde_json::to_string(&input.schedule)?,
            price,
            academic_year,
            semester,
            input.status.unwrap_or(ClassStatus::Active),
            now,
            now
        ],
    )?;
    audit::record(
        conn,
        AuditEvent::new("class.create", "class", Category::DataModification)
            .entity(&id)
            .by(actor)
            .describe(format!("created class {}", name))
            .details(json!({ "teacherId": input.teacher_id, "maxStudents": max_students })),
    );
    load_class(conn, &id)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ClassPatch {
    pub name: Option<String>,
    pub subject: Option<String>,
    pub teacher_id: Option<String>,
    pub max_students: Option<i64>,
    pub schedule: Option<Vec<ClassSlot>>,
    pub price: Option<f64>,
    pub academic_year: Option<String>,
    pub semester: Option<String>,
    pub status: Option<ClassStatus>,
}

pub fn update(conn: &Connection, actor: &Actor, class_id: &str, patch: &ClassPatch) -> CoreResult<ClassView> {
    authz::require_admin(actor)?;
    let before = load_class(conn, class_id)?;

    let name = match &patch.name {
        Some(v) => validate::required_text(v, "name", 120)?,
        None => before.name.clone(),
    };
    let subject = match &patch.subject {
        Some(v) => validate::required_text(v, "subject", 80)?,
        None => before.subject.clone(),
    };
    let teacher_id = match &patch.teacher_id {
        Some(v) => {
            ensure_teacher(conn, v)?;
            v.clone()
        }
        None => before.teacher_id.clone(),
    };
    let max_students = match patch.max_students {
        Some(v) => capacity(v)?,
        None => before.max_students,
    };
    if max_students < before.current_students {
        return Err(CoreError::invalid_state(format!(
            "class already has {} students",
            before.current_students
        )));
    }
    let schedule = match &patch.schedule {
        Some(v) => {
            validate_slots(v)?;
            v.clone()
        }
        None => before.schedule.clone(),
    };
    let price = match patch.price {
        Some(v) => validate::money(v, "price")?,
        None => before.price,
    };
    let academic_year = match &patch.academic_year {
        Some(v) => validate::required_text(v, "academicYear", 20)?,
        None => before.academic_year.clone(),
    };
    let semester = match &patch.semester {
        Some(v) => validate::required_text(v, "semester", 20)?,
        None => before.semester.clone(),
    };
    let status = patch.status.unwrap_or(before.status);

    conn.execute(
        "UPDATE classes SET name = ?, subject = ?, teacher_id = ?, max_students = ?, schedule = ?,
             price = ?, academic_year = ?, semester = ?, status = ?, updated_at = ?
         WHERE id = ?",
        params![
            name,
            subject,
            teacher_id,
            max_students,
            serde_json::to_string(&schedule)?,
            price,
            academic_year,
            semester,
            status,
            model::now(),
            class_id
        ],
    )?;
    audit::record(
        conn,
        AuditEvent::new("class.update", "class", Category::DataModification)
            .entity(class_id)
            .by(actor)
            .describe(format!("updated class {}", name))
            .details(json!({
                "before": { "teacherId": before.teacher_id, "maxStudents": before.max_students, "status": before.status },
                "after": { "teacherId": teacher_id, "maxStudents": max_students, "status": status },
            })),
    );
    load_class(conn, class_id)
}

/// Add a student to an active class. The seat check and the insert are one
/// statement, so two concurrent enrollments cannot overfill the roster.
pub fn enroll(conn: &Connection, actor: &Actor, class_id: &str, student_id: &str) -> CoreResult<ClassView> {
    authz::require_admin(actor)?;
    let class = class_ref(conn, class_id)?;
    let student = profiles::student_ref(conn, student_id)?;
    if class.status != ClassStatus::Active {
        return Err(CoreError::invalid_state(format!(
            "class is {}, only active classes accept students",
            class.status
        )));
    }
    if is_enrolled(conn, class_id, student_id)? {
        return Err(CoreError::conflict("student is already enrolled in this class"));
    }
    let inserted = conn.execute(
        "INSERT INTO class_enrollments(class_id, student_id, enrolled_at)
         SELECT ?1, ?2, ?3
         WHERE (SELECT COUNT(*) FROM class_enrollments WHERE class_id = ?1)
             < (SELECT max_students FROM classes WHERE id = ?1 AND status = 'active')",
        params![class_id, student_id, model::now()],
    )?;
    if inserted == 0 {
        return Err(CoreError::invalid_state("class is full"));
    }
    audit::record(
        conn,
        AuditEvent::new("class.enroll", "class", Category::DataModification)
            .entity(class_id)
            .by(actor)
            .describe(format!("enrolled {} in {}", student.name, class.name))
            .details(json!({ "studentId": student_id })),
    );
    load_class(conn, class_id)
}

pub fn unenroll(conn: &Connection, actor: &Actor, class_id: &str, student_id: &str) -> CoreResult<ClassView> {
    authz::require_admin(actor)?;
    let class = class_ref(conn, class_id)?;
    let removed = conn.execute(
        "DELETE FROM class_enrollments WHERE class_id = ? AND student_id = ?",
        [class_id, student_id],
    )?;
    if removed == 0 {
        return Err(CoreError::NotFound("enrollment"));
    }
    audit::record(
        conn,
        AuditEvent::new("class.unenroll", "class", Category::DataModification)
            .entity(class_id)
            .by(actor)
            .describe(format!("removed a student from {}", class.name))
            .details(json!({ "studentId": student_id })),
    );
    load_class(conn, class_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occupancy_is_a_bounded_ratio() {
        assert_eq!(occupancy_rate(0, 20), 0.0);
        assert_eq!(occupancy_rate(5, 20), 0.25);
        assert_eq!(occupancy_rate(20, 20), 1.0);
        assert_eq!(occupancy_rate(3, 0), 0.0);
    }

    #[test]
    fn slots_reject_inverted_times() {
        let slot = ClassSlot {
            day: Weekday::Monday,
            start_time: "10:00".into(),
            end_time: "09:00".into(),
            room: None,
        };
        assert!(validate_slots(&[slot]).is_err());
    }
}
