//! Role profiles attached 1:1 to accounts, plus the ownership lookups the
//! resolver needs (a student's owning account, a guardian's dependents).

use crate::audit::{self, AuditEvent, Category};
use crate::authz::{self, Action, Actor, Role};
use crate::error::{CoreError, CoreResult};
use crate::model::{self, Channels, Page, Weekday};
use crate::validate;
use chrono::NaiveTime;
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

const MAX_NAME_LEN: usize = 120;
const MAX_LABEL_LEN: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScheduleSlot {
    pub day: Weekday,
    pub start_time: String,
    pub end_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_id: Option<String>,
}

pub fn validate_schedule(slots: &[ScheduleSlot]) -> CoreResult<()> {
    for slot in slots {
        let start = NaiveTime::parse_from_str(&slot.start_time, "%H:%M");
        let end = NaiveTime::parse_from_str(&slot.end_time, "%H:%M");
        match (start, end) {
            (Ok(s), Ok(e)) if s < e => {}
            (Ok(_), Ok(_)) => {
                return Err(CoreError::validation(format!(
                    "schedule slot on {} must end after it starts",
                    slot.day
                )))
            }
            _ => return Err(CoreError::validation("schedule times must be HH:MM")),
        }
    }
    Ok(())
}

/// Role-specific data supplied when an account is created. Only the fields
/// belonging to the account's role may be present.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProfileInput {
    pub national_id: Option<String>,
    pub grade: Option<String>,
    pub subjects: Option<Vec<String>>,
    pub qualification: Option<String>,
    pub schedule: Option<Vec<ScheduleSlot>>,
    pub salary: Option<f64>,
    pub relationship: Option<String>,
    pub preferences: Option<Channels>,
}

impl ProfileInput {
    fn present_fields(&self) -> Vec<(&'static str, Role)> {
        let mut out = Vec::new();
        if self.national_id.is_some() {
            out.push(("nationalId", Role::Student));
        }
        if self.grade.is_some() {
            out.push(("grade", Role::Student));
        }
        if self.subjects.is_some() {
            out.push(("subjects", Role::Teacher));
        }
        if self.qualification.is_some() {
            out.push(("qualification", Role::Teacher));
        }
        if self.schedule.is_some() {
            out.push(("schedule", Role::Teacher));
        }
        if self.salary.is_some() {
            out.push(("salary", Role::Teacher));
        }
        if self.relationship.is_some() {
            out.push(("relationship", Role::Guardian));
        }
        if self.preferences.is_some() {
            out.push(("preferences", Role::Guardian));
        }
        out
    }
}

fn required<'a>(value: &'a Option<String>, field: &str, role: Role) -> CoreResult<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| CoreError::validation(format!("{} is required for a {}", field, role)))
}

/// Insert the profile row for a freshly created account. `privileged` is set
/// when an administrator creates the account and unlocks salary.
pub fn create_profile(
    conn: &Connection,
    account_id: &str,
    role: Role,
    input: &ProfileInput,
    privileged: bool,
) -> CoreResult<String> {
    for (field, owner) in input.present_fields() {
        if owner != role {
            return Err(CoreError::validation(format!(
                "{} does not apply to a {} account",
                field, role
            )));
        }
    }
    let id = model::new_id();
    let now = model::now();
    match role {
        Role::Student => {
            let national_id = validate::national_id(required(&input.national_id, "nationalId", role)?)?;
            let grade = validate::required_text(required(&input.grade, "grade", role)?, "grade", MAX_LABEL_LEN)?;
            let taken: Option<String> = conn
                .query_row(
                    "SELECT id FROM students WHERE national_id = ?",
                    [&national_id],
                    |r| r.get(0),
                )
                .optional()?;
            if taken.is_some() {
                return Err(CoreError::conflict("national id is already registered"));
            }
            conn.execute(
                "INSERT INTO students(id, account_id, national_id, grade, guardian_id, balance, created_at, updated_at)
                 VALUES(?, ?, ?, ?, NULL, 0, ?, ?)",
                params![id, account_id, national_id, grade, now, now],
            )?;
        }
        Role::Teacher => {
            let subjects = clean_subjects(input.subjects.as_deref().unwrap_or_default())?;
            let qualification = validate::required_text(
                required(&input.qualification, "qualification", role)?,
                "qualification",
                MAX_NAME_LEN,
            )?;
            let schedule = input.schedule.clone().unwrap_or_default();
            validate_schedule(&schedule)?;
            let salary = match input.salary {
                Some(_) if !privileged => {
                    return Err(CoreError::forbidden("salary is set by an administrator"))
                }
                Some(v) => validate::money(v, "salary")?,
                None => 0.0,
            };
            conn.execute(
                "INSERT INTO teachers(id, account_id, subjects, qualification, schedule, salary, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    id,
                    account_id,
                    serde_json::to_string(&subjects)?,
                    qualification,
                    serde_json::to_string(&schedule)?,
                    salary,
                    now,
                    now
                ],
            )?;
        }
        Role::Guardian => {
            let relationship = validate::required_text(
                required(&input.relationship, "relationship", role)?,
                "relationship",
                MAX_LABEL_LEN,
            )?;
            let preferences = input.preferences.unwrap_or_default();
            conn.execute(
                "INSERT INTO guardians(id, account_id, relationship, preferences, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?)",
                params![
                    id,
                    account_id,
                    relationship,
                    serde_json::to_string(&preferences)?,
                    now,
                    now
                ],
            )?;
        }
        Role::Admin => {
            return Err(CoreError::validation(
                "administrator identities are not stored as accounts",
            ))
        }
    }
    Ok(id)
}

fn clean_subjects(raw: &[String]) -> CoreResult<Vec<String>> {
    let mut out: Vec<String> = Vec::new();
    for s in raw {
        let s = validate::required_text(s, "subject", MAX_LABEL_LEN)?;
        if !out.contains(&s) {
            out.push(s);
        }
    }
    if out.is_empty() {
        return Err(CoreError::validation("subjects is required for a teacher"));
    }
    Ok(out)
}

// --- ownership lookups ---

/// Just enough of a student to decide ownership and address notifications.
#[derive(Debug, Clone)]
pub struct StudentRef {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub guardian_account_id: Option<String>,
    pub guardian_preferences: Channels,
}

pub fn student_ref(conn: &Connection, student_id: &str) -> CoreResult<StudentRef> {
    conn.query_row(
        "SELECT s.id, s.account_id, a.name, g.account_id, g.preferences
         FROM students s
         JOIN accounts a ON a.id = s.account_id
         LEFT JOIN guardians g ON g.id = s.guardian_id
         WHERE s.id = ?",
        [student_id],
        |r| {
            let prefs: Option<String> = r.get(4)?;
            Ok(StudentRef {
                id: r.get(0)?,
                account_id: r.get(1)?,
                name: r.get(2)?,
                guardian_account_id: r.get(3)?,
                guardian_preferences: prefs
                    .and_then(|p| serde_json::from_str(&p).ok())
                    .unwrap_or_default(),
            })
        },
    )
    .optional()?
    .ok_or(CoreError::NotFound("student"))
}

/// Account ids of the students whose guardian is the given guardian account.
pub fn guardian_children(conn: &Connection, guardian_account_id: &str) -> CoreResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT s.account_id FROM students s
         JOIN guardians g ON g.id = s.guardian_id
         WHERE g.account_id = ?",
    )?;
    let ids = stmt
        .query_map([guardian_account_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Both authorization phases, loading the guardian's dependents on demand.
pub fn require_access(conn: &Connection, actor: &Actor, action: Action, owner: &str) -> CoreResult<()> {
    authz::require(actor, action, owner, |g| guardian_children(conn, g))
}

pub fn teacher_id_for_account(conn: &Connection, account_id: &str) -> CoreResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT id FROM teachers WHERE account_id = ?",
            [account_id],
            |r| r.get(0),
        )
        .optional()?)
}

pub fn student_id_for_account(conn: &Connection, account_id: &str) -> CoreResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT id FROM students WHERE account_id = ?",
            [account_id],
            |r| r.get(0),
        )
        .optional()?)
}

fn guardian_id_for_account(conn: &Connection, account_id: &str) -> CoreResult<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT id FROM guardians WHERE account_id = ?",
            [account_id],
            |r| r.get(0),
        )
        .optional()?)
}

/// The profile attached to an account, serialized for `accounts.me`.
pub fn profile_for_account(conn: &Connection, account_id: &str, role: Role) -> CoreResult<Option<Value>> {
    let value = match role {
        Role::Student => match student_id_for_account(conn, account_id)? {
            Some(id) => Some(serde_json::to_value(load_student(conn, &id)?)?),
            None => None,
        },
        Role::Teacher => match teacher_id_for_account(conn, account_id)? {
            Some(id) => Some(serde_json::to_value(load_teacher(conn, &id)?)?),
            None => None,
        },
        Role::Guardian => match guardian_id_for_account(conn, account_id)? {
            Some(id) => Some(serde_json::to_value(load_guardian(conn, &id)?)?),
            None => None,
        },
        Role::Admin => None,
    };
    Ok(value)
}

// --- students ---

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentProfile {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub phone: String,
    pub active: bool,
    pub national_id: String,
    pub grade: String,
    pub guardian_id: Option<String>,
    pub guardian_account_id: Option<String>,
    pub balance: f64,
    pub class_ids: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

const STUDENT_SELECT: &str = "SELECT s.id, s.account_id, a.name, a.phone, a.active, s.national_id,
        s.grade, s.guardian_id, g.account_id, s.balance, s.created_at, s.updated_at
     FROM students s
     JOIN accounts a ON a.id = s.account_id
     LEFT JOIN guardians g ON g.id = s.guardian_id";

fn row_to_student(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentProfile> {
    Ok(StudentProfile {
        id: r.get(0)?,
        account_id: r.get(1)?,
        name: r.get(2)?,
        phone: r.get(3)?,
        active: r.get(4)?,
        national_id: r.get(5)?,
        grade: r.get(6)?,
        guardian_id: r.get(7)?,
        guardian_account_id: r.get(8)?,
        balance: r.get(9)?,
        class_ids: Vec::new(),
        created_at: r.get(10)?,
        updated_at: r.get(11)?,
    })
}

fn enrolled_class_ids(conn: &Connection, student_id: &str) -> CoreResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT class_id FROM class_enrollments WHERE student_id = ? ORDER BY enrolled_at",
    )?;
    let ids = stmt
        .query_map([student_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn load_student(conn: &Connection, student_id: &str) -> CoreResult<StudentProfile> {
    let mut student = conn
        .query_row(&format!("{} WHERE s.id = ?", STUDENT_SELECT), [student_id], row_to_student)
        .optional()?
        .ok_or(CoreError::NotFound("student"))?;
    student.class_ids = enrolled_class_ids(conn, &student.id)?;
    Ok(student)
}

pub fn get_student(conn: &Connection, actor: &Actor, student_id: &str) -> CoreResult<StudentProfile> {
    let owner = student_ref(conn, student_id)?;
    require_access(conn, actor, Action::Read, &owner.account_id)?;
    load_student(conn, student_id)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StudentListFilter {
    pub grade: Option<String>,
    pub class_id: Option<String>,
    pub guardian_id: Option<String>,
    pub q: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub fn list_students(conn: &Connection, actor: &Actor, filter: &StudentListFilter) -> CoreResult<Vec<StudentProfile>> {
    authz::require_admin(actor)?;
    let mut sql = format!("{} WHERE 1 = 1", STUDENT_SELECT);
    let mut args: Vec<SqlValue> = Vec::new();
    if let Some(grade) = &filter.grade {
        sql.push_str(" AND s.grade = ?");
        args.push(SqlValue::Text(grade.clone()));
    }
    if let Some(class_id) = &filter.class_id {
        sql.push_str(" AND s.id IN (SELECT student_id FROM class_enrollments WHERE class_id = ?)");
        args.push(SqlValue::Text(class_id.clone()));
    }
    if let Some(guardian_id) = &filter.guardian_id {
        sql.push_str(" AND s.guardian_id = ?");
        args.push(SqlValue::Text(guardian_id.clone()));
    }
    if let Some(q) = filter.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        sql.push_str(" AND (a.name LIKE ? OR a.phone LIKE ? OR s.national_id LIKE ?)");
        let pattern = format!("%{}%", q);
        for _ in 0..3 {
            args.push(SqlValue::Text(pattern.clone()));
        }
    }
    let page = Page::new(filter.limit, filter.offset);
    sql.push_str(" ORDER BY a.name COLLATE NOCASE, s.id LIMIT ? OFFSET ?");
    args.push(SqlValue::Integer(page.limit));
    args.push(SqlValue::Integer(page.offset));

    let mut stmt = conn.prepare(&sql)?;
    let mut students = stmt
        .query_map(params_from_iter(args), row_to_student)?
        .collect::<Result<Vec<_>, _>>()?;
    for s in students.iter_mut() {
        s.class_ids = enrolled_class_ids(conn, &s.id)?;
    }
    Ok(students)
}

/// Fields a student (or their guardian) may change on their own.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct StudentSelfPatch {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct StudentAdminPatch {
    name: Option<String>,
    grade: Option<String>,
    national_id: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    guardian_id: Option<Option<String>>,
}

fn double_option<'de, D, T>(d: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(d).map(Some)
}

fn patch_keys(patch: &Value) -> Vec<String> {
    patch
        .as_object()
        .map(|o| o.keys().cloned().collect())
        .unwrap_or_default()
}

fn update_account_name(conn: &Connection, account_id: &str, name: &str) -> CoreResult<()> {
    let name = validate::required_text(name, "name", MAX_NAME_LEN)?;
    conn.execute(
        "UPDATE accounts SET name = ?, updated_at = ? WHERE id = ?",
        params![name, model::now(), account_id],
    )?;
    Ok(())
}

pub fn update_student(conn: &Connection, actor: &Actor, student_id: &str, patch: &Value) -> CoreResult<StudentProfile> {
    let owner = student_ref(conn, student_id)?;
    require_access(conn, actor, Action::Update, &owner.account_id)?;

    let tx = conn.unchecked_transaction()?;
    if actor.is_admin() {
        let p: StudentAdminPatch = validate::from_json(patch)?;
        if let Some(name) = &p.name {
            update_account_name(&tx, &owner.account_id, name)?;
        }
        if let Some(grade) = &p.grade {
            let grade = validate::required_text(grade, "grade", MAX_LABEL_LEN)?;
            tx.execute("UPDATE students SET grade = ? WHERE id = ?", params![grade, student_id])?;
        }
        if let Some(raw) = &p.national_id {
            let national_id = validate::national_id(raw)?;
            tx.execute(
                "UPDATE students SET national_id = ? WHERE id = ?",
                params![national_id, student_id],
            )?;
        }
        if let Some(guardian) = &p.guardian_id {
            if let Some(gid) = guardian {
                ensure_guardian_exists(&tx, gid)?;
            }
            tx.execute(
                "UPDATE students SET guardian_id = ? WHERE id = ?",
                params![guardian, student_id],
            )?;
        }
    } else {
        let p: StudentSelfPatch = validate::from_json(patch)?;
        if let Some(name) = &p.name {
            update_account_name(&tx, &owner.account_id, name)?;
        }
    }
    tx.execute(
        "UPDATE students SET updated_at = ? WHERE id = ?",
        params![model::now(), student_id],
    )?;
    tx.commit()?;

    audit::record(
        conn,
        AuditEvent::new("student.update", "student", Category::DataModification)
            .entity(student_id)
            .by(actor)
            .describe(format!("updated student {}", owner.name))
            .details(json!({ "fields": patch_keys(patch) })),
    );
    load_student(conn, student_id)
}

// --- teachers ---

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherProfile {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub phone: String,
    pub active: bool,
    pub subjects: Vec<String>,
    pub qualification: String,
    pub schedule: Vec<ScheduleSlot>,
    pub salary: f64,
    pub created_at: String,
    pub updated_at: String,
}

const TEACHER_SELECT: &str = "SELECT t.id, t.account_id, a.name, a.phone, a.active, t.subjects,
        t.qualification, t.schedule, t.salary, t.created_at, t.updated_at
     FROM teachers t
     JOIN accounts a ON a.id = t.account_id";

fn row_to_teacher(r: &rusqlite::Row<'_>) -> rusqlite::Result<TeacherProfile> {
    let subjects: String = r.get(5)?;
    let schedule: String = r.get(7)?;
    Ok(TeacherProfile {
        id: r.get(0)?,
        account_id: r.get(1)?,
        name: r.get(2)?,
        phone: r.get(3)?,
        active: r.get(4)?,
        subjects: serde_json::from_str(&subjects).unwrap_or_default(),
        qualification: r.get(6)?,
        schedule: serde_json::from_str(&schedule).unwrap_or_default(),
        salary: r.get(8)?,
        created_at: r.get(9)?,
        updated_at: r.get(10)?,
    })
}

fn load_teacher(conn: &Connection, teacher_id: &str) -> CoreResult<TeacherProfile> {
    conn.query_row(&format!("{} WHERE t.id = ?", TEACHER_SELECT), [teacher_id], row_to_teacher)
        .optional()?
        .ok_or(CoreError::NotFound("teacher"))
}

pub fn get_teacher(conn: &Connection, actor: &Actor, teacher_id: &str) -> CoreResult<TeacherProfile> {
    let teacher = load_teacher(conn, teacher_id)?;
    require_access(conn, actor, Action::Read, &teacher.account_id)?;
    Ok(teacher)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TeacherListFilter {
    pub subject: Option<String>,
    pub q: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub fn list_teachers(conn: &Connection, actor: &Actor, filter: &TeacherListFilter) -> CoreResult<Vec<TeacherProfile>> {
    authz::require_admin(actor)?;
    let mut sql = format!("{} WHERE 1 = 1", TEACHER_SELECT);
    let mut args: Vec<SqlValue> = Vec::new();
    if let Some(subject) = &filter.subject {
        sql.push_str(" AND EXISTS (SELECT 1 FROM json_each(t.subjects) WHERE json_each.value = ?)");
        args.push(SqlValue::Text(subject.clone()));
    }
    if let Some(q) = filter.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        sql.push_str(" AND (a.name LIKE ? OR a.phone LIKE ?)");
        let pattern = format!("%{}%", q);
        args.push(SqlValue::Text(pattern.clone()));
        args.push(SqlValue::Text(pattern));
    }
    let page = Page::new(filter.limit, filter.offset);
    sql.push_str(" ORDER BY a.name COLLATE NOCASE, t.id LIMIT ? OFFSET ?");
    args.push(SqlValue::Integer(page.limit));
    args.push(SqlValue::Integer(page.offset));
    let mut stmt = conn.prepare(&sql)?;
    let teachers = stmt
        .query_map(params_from_iter(args), row_to_teacher)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(teachers)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct TeacherSelfPatch {
    name: Option<String>,
    qualification: Option<String>,
    schedule: Option<Vec<ScheduleSlot>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct TeacherAdminPatch {
    name: Option<String>,
    qualification: Option<String>,
    schedule: Option<Vec<ScheduleSlot>>,
    subjects: Option<Vec<String>>,
    salary: Option<f64>,
}

pub fn update_teacher(conn: &Connection, actor: &Actor, teacher_id: &str, patch: &Value) -> CoreResult<TeacherProfile> {
    let teacher = load_teacher(conn, teacher_id)?;
    require_access(conn, actor, Action::Update, &teacher.account_id)?;

    let p = if actor.is_admin() {
        validate::from_json::<TeacherAdminPatch>(patch)?
    } else {
        let s: TeacherSelfPatch = validate::from_json(patch)?;
        TeacherAdminPatch {
            name: s.name,
            qualification: s.qualification,
            schedule: s.schedule,
            ..Default::default()
        }
    };

    let tx = conn.unchecked_transaction()?;
    if let Some(name) = &p.name {
        update_account_name(&tx, &teacher.account_id, name)?;
    }
    if let Some(q) = &p.qualification {
        let q = validate::required_text(q, "qualification", MAX_NAME_LEN)?;
        tx.execute("UPDATE teachers SET qualification = ? WHERE id = ?", params![q, teacher_id])?;
    }
    if let Some(schedule) = &p.schedule {
        validate_schedule(schedule)?;
        tx.execute(
            "UPDATE teachers SET schedule = ? WHERE id = ?",
            params![serde_json::to_string(schedule)?, teacher_id],
        )?;
    }
    if let Some(subjects) = &p.subjects {
        let subjects = clean_subjects(subjects)?;
        tx.execute(
            "UPDATE teachers SET subjects = ? WHERE id = ?",
            params![serde_json::to_string(&subjects)?, teacher_id],
        )?;
    }
    if let Some(salary) = p.salary {
        let salary = validate::money(salary, "salary")?;
        tx.execute("UPDATE teachers SET salary = ? WHERE id = ?", params![salary, teacher_id])?;
    }
    tx.execute(
        "UPDATE teachers SET updated_at = ? WHERE id = ?",
        params![model::now(), teacher_id],
    )?;
    tx.commit()?;

    audit::record(
        conn,
        AuditEvent::new("teacher.update", "teacher", Category::DataModification)
            .entity(teacher_id)
            .by(actor)
            .describe(format!("updated teacher {}", teacher.name))
            .details(json!({ "fields": patch_keys(patch) })),
    );
    load_teacher(conn, teacher_id)
}

// --- guardians ---

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildSummary {
    pub student_id: String,
    pub account_id: String,
    pub name: String,
    pub grade: String,
    pub balance: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardianProfile {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub phone: String,
    pub active: bool,
    pub relationship: String,
    pub preferences: Channels,
    pub children: Vec<ChildSummary>,
    pub created_at: String,
    pub updated_at: String,
}

fn load_children(conn: &Connection, guardian_id: &str) -> CoreResult<Vec<ChildSummary>> {
    let mut stmt = conn.prepare(
        "SELECT s.id, s.account_id, a.name, s.grade, s.balance
         FROM students s JOIN accounts a ON a.id = s.account_id
         WHERE s.guardian_id = ?
         ORDER BY a.name COLLATE NOCASE",
    )?;
    let children = stmt
        .query_map([guardian_id], |r| {
            Ok(ChildSummary {
                student_id: r.get(0)?,
                account_id: r.get(1)?,
                name: r.get(2)?,
                grade: r.get(3)?,
                balance: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(children)
}

fn load_guardian(conn: &Connection, guardian_id: &str) -> CoreResult<GuardianProfile> {
    let mut guardian = conn
        .query_row(
            "SELECT g.id, g.account_id, a.name, a.phone, a.active, g.relationship,
                    g.preferences, g.created_at, g.updated_at
             FROM guardians g JOIN accounts a ON a.id = g.account_id
             WHERE g.id = ?",
            [guardian_id],
            |r| {
                let prefs: String = r.get(6)?;
                Ok(GuardianProfile {
                    id: r.get(0)?,
                    account_id: r.get(1)?,
                    name: r.get(2)?,
                    phone: r.get(3)?,
                    active: r.get(4)?,
                    relationship: r.get(5)?,
                    preferences: serde_json::from_str(&prefs).unwrap_or_default(),
                    children: Vec::new(),
                    created_at: r.get(7)?,
                    updated_at: r.get(8)?,
                })
            },
        )
        .optional()?
        .ok_or(CoreError::NotFound("guardian"))?;
    guardian.children = load_children(conn, guardian_id)?;
    Ok(guardian)
}

fn ensure_guardian_exists(conn: &Connection, guardian_id: &str) -> CoreResult<()> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM guardians WHERE id = ?", [guardian_id], |r| r.get(0))
        .optional()?;
    found.map(|_| ()).ok_or(CoreError::NotFound("guardian"))
}

pub fn get_guardian(conn: &Connection, actor: &Actor, guardian_id: &str) -> CoreResult<GuardianProfile> {
    let guardian = load_guardian(conn, guardian_id)?;
    require_access(conn, actor, Action::Read, &guardian.account_id)?;
    Ok(guardian)
}

pub fn children(conn: &Connection, actor: &Actor, guardian_id: &str) -> CoreResult<Vec<ChildSummary>> {
    Ok(get_guardian(conn, actor, guardian_id)?.children)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct GuardianPatch {
    name: Option<String>,
    relationship: Option<String>,
    preferences: Option<Channels>,
}

pub fn update_guardian(conn: &Connection, actor: &Actor, guardian_id: &str, patch: &Value) -> CoreResult<GuardianProfile> {
    let guardian = load_guardian(conn, guardian_id)?;
    require_access(conn, actor, Action::Update, &guardian.account_id)?;
    let p: GuardianPatch = validate::from_json(patch)?;

    let tx = conn.unchecked_transaction()?;
    if let Some(name) = &p.name {
        update_account_name(&tx, &guardian.account_id, name)?;
    }
    if let Some(rel) = &p.relationship {
        let rel = validate::required_text(rel, "relationship", MAX_LABEL_LEN)?;
        tx.execute("UPDATE guardians SET relationship = ? WHERE id = ?", params![rel, guardian_id])?;
    }
    if let Some(prefs) = &p.preferences {
        tx.execute(
            "UPDATE guardians SET preferences = ? WHERE id = ?",
            params![serde_json::to_string(prefs)?, guardian_id],
        )?;
    }
    tx.execute(
        "UPDATE guardians SET updated_at = ? WHERE id = ?",
        params![model::now(), guardian_id],
    )?;
    tx.commit()?;

    audit::record(
        conn,
        AuditEvent::new("guardian.update", "guardian", Category::DataModification)
            .entity(guardian_id)
            .by(actor)
            .describe(format!("updated guardian {}", guardian.name))
            .details(json!({ "fields": patch_keys(patch) })),
    );
    load_guardian(conn, guardian_id)
}

/// Attach a student to a guardian, replacing any previous guardian.
pub fn link_child(conn: &Connection, actor: &Actor, guardian_id: &str, student_id: &str) -> CoreResult<GuardianProfile> {
    authz::require_admin(actor)?;
    ensure_guardian_exists(conn, guardian_id)?;
    let student = student_ref(conn, student_id)?;
    conn.execute(
        "UPDATE students SET guardian_id = ?, updated_at = ? WHERE id = ?",
        params![guardian_id, model::now(), student_id],
    )?;
    audit::record(
        conn,
        AuditEvent::new("guardian.link_child", "student", Category::DataModification)
            .entity(student_id)
            .by(actor)
            .describe(format!("linked {} to guardian {}", student.name, guardian_id))
            .details(json!({
                "guardianId": guardian_id,
                "previousGuardianAccountId": student.guardian_account_id,
            })),
    );
    load_guardian(conn, guardian_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_slots_must_be_ordered_times() {
        let ok = ScheduleSlot {
            day: Weekday::Sunday,
            start_time: "16:00".into(),
            end_time: "17:30".into(),
            class_id: None,
        };
        assert!(validate_schedule(&[ok.clone()]).is_ok());
        let backwards = ScheduleSlot {
            start_time: "18:00".into(),
            ..ok.clone()
        };
        assert!(validate_schedule(&[backwards]).is_err());
        let garbled = ScheduleSlot {
            end_time: "5pm".into(),
            ..ok
        };
        assert!(validate_schedule(&[garbled]).is_err());
    }

    #[test]
    fn admin_patch_distinguishes_clearing_from_absent_guardian() {
        let cleared: StudentAdminPatch =
            validate::from_json(&json!({ "guardianId": null })).expect("patch");
        assert_eq!(cleared.guardian_id, Some(None));
        let absent: StudentAdminPatch = validate::from_json(&json!({ "grade": "9" })).expect("patch");
        assert_eq!(absent.guardian_id, None);
    }

    #[test]
    fn self_patches_refuse_privileged_fields() {
        for field in ["balance", "role", "guardianId", "nationalId"] {
            let mut obj = serde_json::Map::new();
            obj.insert(field.to_string(), json!("x"));
            let patch = Value::Object(obj);
            assert!(validate::from_json::<StudentSelfPatch>(&patch).is_err(), "{}", field);
        }
        assert!(validate::from_json::<TeacherSelfPatch>(&json!({ "salary": 1 })).is_err());
    }
}
