mod common;

use common::Sidecar;
use serde_json::{json, Value};

fn batch(class_id: &str, session: i64, entries: &[(&str, &str)]) -> Value {
    let entries: Vec<Value> = entries
        .iter()
        .map(|(student, status)| json!({ "studentId": student, "status": status }))
        .collect();
    json!({ "classId": class_id, "sessionNumber": session, "entries": entries })
}

fn notifications(sc: &mut Sidecar, token: &str, kind: &str) -> Vec<Value> {
    let inbox = sc.ok(
        "notifications.list",
        json!({ "notificationType": kind }),
        Some(token),
    );
    inbox["notifications"].as_array().cloned().unwrap_or_default()
}

#[test]
fn teacher_cannot_record_for_another_teachers_class() {
    let mut sc = Sidecar::start("tutord-attendance-ownership");
    let admin = sc.admin();
    let owner = common::teacher(&mut sc, &admin, 100);
    let intruder = common::teacher(&mut sc, &admin, 101);
    let student = common::student(&mut sc, &admin, 102);
    let class_id = common::class(&mut sc, &admin, &owner, 20);
    common::enroll(&mut sc, &admin, &class_id, &student);

    let value = sc.request(
        "attendance.recordBatch",
        batch(&class_id, 1, &[(&student.profile_id, "absent")]),
        Some(&intruder.token),
    );
    assert_eq!(value["error"]["code"], "forbidden");

    let recorded = sc.ok("attendance.query", json!({ "classId": class_id }), Some(&admin));
    assert_eq!(recorded["counts"]["total"], 0);
    assert!(notifications(&mut sc, &student.token, "attendance").is_empty());

    // Students and guardians never record attendance.
    assert_eq!(
        sc.fails(
            "attendance.recordBatch",
            batch(&class_id, 1, &[(&student.profile_id, "present")]),
            Some(&student.token),
        ),
        "forbidden"
    );
}

#[test]
fn resubmitting_a_session_updates_the_single_record() {
    let mut sc = Sidecar::start("tutord-attendance-idempotent");
    let admin = sc.admin();
    let teacher = common::teacher(&mut sc, &admin, 110);
    let student = common::student(&mut sc, &admin, 111);
    let class_id = common::class(&mut sc, &admin, &teacher, 20);
    common::enroll(&mut sc, &admin, &class_id, &student);

    let first = sc.ok(
        "attendance.recordBatch",
        batch(&class_id, 2, &[(&student.profile_id, "present")]),
        Some(&teacher.token),
    );
    assert_eq!(first["created"], 1);
    assert_eq!(first["updated"], 0);
    let record_id = first["records"][0]["id"].as_str().expect("record id").to_string();

    let second = sc.ok(
        "attendance.recordBatch",
        batch(&class_id, 2, &[(&student.profile_id, "present")]),
        Some(&teacher.token),
    );
    assert_eq!(second["created"], 0);
    assert_eq!(second["updated"], 1);

    let third = sc.ok(
        "attendance.recordBatch",
        batch(&class_id, 2, &[(&student.profile_id, "absent")]),
        Some(&teacher.token),
    );
    assert_eq!(third["records"][0]["id"], record_id.as_str());
    assert_eq!(third["records"][0]["status"], "absent");
    assert_eq!(third["records"][0]["modifiedBy"], teacher.account_id.as_str());

    let all = sc.ok("attendance.query", json!({ "classId": class_id }), Some(&teacher.token));
    assert_eq!(all["counts"]["total"], 1);
    assert_eq!(all["counts"]["absent"], 1);
    assert_eq!(all["records"].as_array().map(|a| a.len()), Some(1));
}

#[test]
fn absence_notifies_student_and_guardian_once_each() {
    let mut sc = Sidecar::start("tutord-attendance-fanout");
    let admin = sc.admin();
    let teacher = common::teacher(&mut sc, &admin, 120);
    let student = common::student(&mut sc, &admin, 121);
    let sibling = common::student(&mut sc, &admin, 122);
    let guardian = common::guardian(&mut sc, &admin, 123);
    common::link(&mut sc, &admin, &guardian, &student);
    let class_id = common::class(&mut sc, &admin, &teacher, 20);
    common::enroll(&mut sc, &admin, &class_id, &student);
    common::enroll(&mut sc, &admin, &class_id, &sibling);

    let outcome = sc.ok(
        "attendance.recordBatch",
        batch(
            &class_id,
            1,
            &[(&student.profile_id, "absent"), (&sibling.profile_id, "present")],
        ),
        Some(&teacher.token),
    );
    assert_eq!(outcome["notificationsSent"], 2);

    let to_student = notifications(&mut sc, &student.token, "attendance");
    let to_guardian = notifications(&mut sc, &guardian.token, "attendance");
    assert_eq!(to_student.len(), 1);
    assert_eq!(to_guardian.len(), 1);
    assert_eq!(to_student[0]["recipientType"], "student");
    assert_eq!(to_guardian[0]["recipientType"], "guardian");
    assert_eq!(to_guardian[0]["priority"], "high");
    assert!(notifications(&mut sc, &sibling.token, "attendance").is_empty());

    // A guardian sees their child's record but not the sibling's.
    let seen = sc.ok("attendance.query", json!({}), Some(&guardian.token));
    assert_eq!(seen["counts"]["total"], 1);
    assert_eq!(
        sc.fails(
            "attendance.query",
            json!({ "studentId": sibling.profile_id }),
            Some(&guardian.token),
        ),
        "forbidden"
    );
}

#[test]
fn batch_reports_entries_it_could_not_record() {
    let mut sc = Sidecar::start("tutord-attendance-partial");
    let admin = sc.admin();
    let teacher = common::teacher(&mut sc, &admin, 130);
    let enrolled = common::student(&mut sc, &admin, 131);
    let outsider = common::student(&mut sc, &admin, 132);
    let class_id = common::class(&mut sc, &admin, &teacher, 20);
    common::enroll(&mut sc, &admin, &class_id, &enrolled);

    let outcome = sc.ok(
        "attendance.recordBatch",
        batch(
            &class_id,
            3,
            &[
                (&enrolled.profile_id, "late"),
                (&outsider.profile_id, "present"),
                ("no-such-student", "present"),
            ],
        ),
        Some(&teacher.token),
    );
    assert_eq!(outcome["created"], 1);
    let failures = outcome["failures"].as_array().cloned().unwrap_or_default();
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0]["code"], "validation_error");
    assert_eq!(failures[1]["code"], "not_found");

    assert_eq!(
        sc.fails(
            "attendance.recordBatch",
            batch(&class_id, 99, &[(&enrolled.profile_id, "present")]),
            Some(&teacher.token),
        ),
        "validation_error"
    );
    let mut future = batch(&class_id, 1, &[(&enrolled.profile_id, "present")]);
    future["date"] = json!("2999-01-01");
    assert_eq!(
        sc.fails("attendance.recordBatch", future, Some(&teacher.token)),
        "validation_error"
    );
    let mut unknown_field = batch(&class_id, 1, &[(&enrolled.profile_id, "present")]);
    unknown_field["createdBy"] = json!("someone-else");
    assert_eq!(
        sc.fails("attendance.recordBatch", unknown_field, Some(&teacher.token)),
        "validation_error"
    );
}

#[test]
fn justification_is_reviewed_by_the_class_owner() {
    let mut sc = Sidecar::start("tutord-attendance-justification");
    let admin = sc.admin();
    let teacher = common::teacher(&mut sc, &admin, 140);
    let other_teacher = common::teacher(&mut sc, &admin, 141);
    let student = common::student(&mut sc, &admin, 142);
    let guardian = common::guardian(&mut sc, &admin, 143);
    common::link(&mut sc, &admin, &guardian, &student);
    let class_id = common::class(&mut sc, &admin, &teacher, 20);
    common::enroll(&mut sc, &admin, &class_id, &student);

    let outcome = sc.ok(
        "attendance.recordBatch",
        batch(&class_id, 1, &[(&student.profile_id, "absent")]),
        Some(&teacher.token),
    );
    let record_id = outcome["records"][0]["id"].as_str().expect("record").to_string();

    assert_eq!(
        sc.fails(
            "attendance.submitJustification",
            json!({ "recordId": record_id, "reason": "medical appointment" }),
            Some(&teacher.token),
        ),
        "forbidden"
    );
    let submitted = sc.ok(
        "attendance.submitJustification",
        json!({ "recordId": record_id, "reason": "medical appointment" }),
        Some(&guardian.token),
    );
    assert_eq!(submitted["justification"]["status"], "pending");
    assert_eq!(submitted["justification"]["submittedBy"], guardian.account_id.as_str());

    assert_eq!(
        sc.fails(
            "attendance.reviewJustification",
            json!({ "recordId": record_id, "decision": "approved" }),
            Some(&other_teacher.token),
        ),
        "forbidden"
    );
    let reviewed = sc.ok(
        "attendance.reviewJustification",
        json!({ "recordId": record_id, "decision": "approved" }),
        Some(&teacher.token),
    );
    assert_eq!(reviewed["status"], "excused");
    assert_eq!(reviewed["justification"]["status"], "approved");

    assert_eq!(
        sc.fails(
            "attendance.reviewJustification",
            json!({ "recordId": record_id, "decision": "rejected" }),
            Some(&teacher.token),
        ),
        "invalid_state"
    );
}
