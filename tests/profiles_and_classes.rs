mod common;

use common::Sidecar;
use serde_json::json;

#[test]
fn self_service_updates_are_allow_listed() {
    let mut sc = Sidecar::start("tutord-profiles-allowlist");
    let admin = sc.admin();
    let student = common::student(&mut sc, &admin, 300);
    let teacher = common::teacher(&mut sc, &admin, 301);

    for forbidden_field in [
        json!({ "balance": 5000 }),
        json!({ "role": "admin" }),
        json!({ "grade": "12" }),
        json!({ "guardianId": null }),
    ] {
        assert_eq!(
            sc.fails(
                "students.update",
                json!({ "id": student.profile_id, "patch": forbidden_field }),
                Some(&student.token),
            ),
            "validation_error"
        );
    }
    let renamed = sc.ok(
        "students.update",
        json!({ "id": student.profile_id, "patch": { "name": "Nour Hassan" } }),
        Some(&student.token),
    );
    assert_eq!(renamed["name"], "Nour Hassan");
    assert_eq!(renamed["balance"], 0.0);

    // Administrators get more fields, but never the balance.
    let regraded = sc.ok(
        "students.update",
        json!({ "id": student.profile_id, "patch": { "grade": "12" } }),
        Some(&admin),
    );
    assert_eq!(regraded["grade"], "12");
    assert_eq!(
        sc.fails(
            "students.update",
            json!({ "id": student.profile_id, "patch": { "balance": 1 } }),
            Some(&admin),
        ),
        "validation_error"
    );

    assert_eq!(
        sc.fails(
            "teachers.update",
            json!({ "id": teacher.profile_id, "patch": { "salary": 20000 } }),
            Some(&teacher.token),
        ),
        "validation_error"
    );
    let paid = sc.ok(
        "teachers.update",
        json!({ "id": teacher.profile_id, "patch": { "salary": 20000 } }),
        Some(&admin),
    );
    assert_eq!(paid["salary"], 20000.0);

    assert_eq!(
        sc.fails(
            "students.update",
            json!({ "id": student.profile_id, "patch": { "name": "X" } }),
            Some(&teacher.token),
        ),
        "forbidden"
    );
}

#[test]
fn guardians_see_and_edit_their_children_only() {
    let mut sc = Sidecar::start("tutord-profiles-guardian");
    let admin = sc.admin();
    let child = common::student(&mut sc, &admin, 310);
    let other = common::student(&mut sc, &admin, 311);
    let guardian = common::guardian(&mut sc, &admin, 312);
    common::link(&mut sc, &admin, &guardian, &child);

    let children = sc.ok("guardians.children", json!({ "id": guardian.profile_id }), Some(&guardian.token));
    let children = children["children"].as_array().cloned().unwrap_or_default();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0]["studentId"], child.profile_id.as_str());

    sc.ok("students.get", json!({ "id": child.profile_id }), Some(&guardian.token));
    assert_eq!(
        sc.fails("students.get", json!({ "id": other.profile_id }), Some(&guardian.token)),
        "forbidden"
    );
    assert_eq!(
        sc.fails("students.list", json!({}), Some(&guardian.token)),
        "forbidden"
    );

    let prefs = sc.ok(
        "guardians.update",
        json!({ "id": guardian.profile_id, "patch": { "preferences": { "sms": true } } }),
        Some(&guardian.token),
    );
    assert_eq!(prefs["preferences"]["sms"], true);
    assert_eq!(prefs["preferences"]["inApp"], true);
    assert_eq!(
        sc.fails(
            "guardians.linkChild",
            json!({ "guardianId": guardian.profile_id, "studentId": other.profile_id }),
            Some(&guardian.token),
        ),
        "forbidden"
    );
}

#[test]
fn enrollment_respects_capacity_and_class_status() {
    let mut sc = Sidecar::start("tutord-classes-capacity");
    let admin = sc.admin();
    let teacher = common::teacher(&mut sc, &admin, 320);
    let a = common::student(&mut sc, &admin, 321);
    let b = common::student(&mut sc, &admin, 322);
    let c = common::student(&mut sc, &admin, 323);
    let class_id = common::class(&mut sc, &admin, &teacher, 2);

    common::enroll(&mut sc, &admin, &class_id, &a);
    let enroll_a = json!({ "classId": class_id, "studentId": a.profile_id });
    assert_eq!(sc.fails("classes.enroll", enroll_a, Some(&admin)), "conflict");
    let full = sc.ok(
        "classes.enroll",
        json!({ "classId": class_id, "studentId": b.profile_id }),
        Some(&admin),
    );
    assert_eq!(full["currentStudents"], 2);
    assert_eq!(full["occupancyRate"], 1.0);

    let value = sc.request(
        "classes.enroll",
        json!({ "classId": class_id, "studentId": c.profile_id }),
        Some(&admin),
    );
    assert_eq!(value["error"]["code"], "invalid_state");
    assert_eq!(value["error"]["message"], "class is full");

    assert_eq!(
        sc.fails(
            "classes.update",
            json!({ "id": class_id, "patch": { "maxStudents": 1 } }),
            Some(&admin),
        ),
        "invalid_state"
    );
    sc.ok(
        "classes.unenroll",
        json!({ "classId": class_id, "studentId": b.profile_id }),
        Some(&admin),
    );
    sc.ok(
        "classes.update",
        json!({ "id": class_id, "patch": { "status": "inactive" } }),
        Some(&admin),
    );
    assert_eq!(
        sc.fails(
            "classes.enroll",
            json!({ "classId": class_id, "studentId": c.profile_id }),
            Some(&admin),
        ),
        "invalid_state"
    );
}

#[test]
fn class_visibility_follows_ownership_and_enrollment() {
    let mut sc = Sidecar::start("tutord-classes-visibility");
    let admin = sc.admin();
    let owner = common::teacher(&mut sc, &admin, 330);
    let other_teacher = common::teacher(&mut sc, &admin, 331);
    let enrolled = common::student(&mut sc, &admin, 332);
    let outsider = common::student(&mut sc, &admin, 333);
    let class_id = common::class(&mut sc, &admin, &owner, 10);
    common::enroll(&mut sc, &admin, &class_id, &enrolled);

    let as_owner = sc.ok("classes.get", json!({ "id": class_id }), Some(&owner.token));
    assert_eq!(as_owner["roster"].as_array().map(|r| r.len()), Some(1));

    let as_student = sc.ok("classes.get", json!({ "id": class_id }), Some(&enrolled.token));
    assert!(as_student.get("roster").is_none());

    assert_eq!(
        sc.fails("classes.get", json!({ "id": class_id }), Some(&outsider.token)),
        "forbidden"
    );
    assert_eq!(
        sc.fails("classes.get", json!({ "id": class_id }), Some(&other_teacher.token)),
        "forbidden"
    );

    let mine = sc.ok("classes.list", json!({}), Some(&other_teacher.token));
    assert_eq!(mine["classes"].as_array().map(|c| c.len()), Some(0));
    let theirs = sc.ok("classes.list", json!({}), Some(&enrolled.token));
    assert_eq!(theirs["classes"].as_array().map(|c| c.len()), Some(1));
    assert_eq!(
        sc.fails(
            "classes.create",
            json!({
                "name": "Rogue",
                "subject": "Art",
                "teacherId": owner.profile_id,
                "maxStudents": 5,
                "academicYear": "2026/2027",
                "semester": "fall",
            }),
            Some(&owner.token),
        ),
        "forbidden"
    );
}
