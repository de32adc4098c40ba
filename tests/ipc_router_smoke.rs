mod common;

use common::Sidecar;
use serde_json::json;

const METHODS: &[&str] = &[
    "auth.register",
    "auth.login",
    "auth.adminLogin",
    "auth.verify",
    "auth.changePassword",
    "accounts.me",
    "accounts.get",
    "accounts.list",
    "accounts.create",
    "accounts.setActive",
    "accounts.update",
    "students.get",
    "students.list",
    "students.update",
    "teachers.get",
    "teachers.list",
    "teachers.update",
    "guardians.get",
    "guardians.update",
    "guardians.linkChild",
    "guardians.children",
    "classes.create",
    "classes.get",
    "classes.list",
    "classes.update",
    "classes.enroll",
    "classes.unenroll",
    "attendance.recordBatch",
    "attendance.query",
    "attendance.submitJustification",
    "attendance.reviewJustification",
    "payments.createInvoice",
    "payments.pay",
    "payments.applyDiscount",
    "payments.addLateFee",
    "payments.cancel",
    "payments.fail",
    "payments.refund",
    "payments.adjustBalance",
    "payments.get",
    "payments.list",
    "notifications.list",
    "notifications.send",
    "notifications.markRead",
    "notifications.markDelivered",
    "notifications.markFailed",
    "notifications.retry",
    "notifications.prune",
    "audit.list",
    "audit.prune",
    "settings.get",
    "settings.update",
    "backup.exportWorkspaceBundle",
    "backup.importWorkspaceBundle",
];

#[test]
fn every_documented_method_is_routed() {
    let mut sc = Sidecar::start("tutord-router-smoke");
    for method in METHODS {
        let value = sc.request(method, json!({}), None);
        let code = value
            .pointer("/error/code")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        assert_ne!(code, "not_implemented", "{} is not routed", method);
    }
    assert_eq!(sc.fails("grades.list", json!({}), None), "not_implemented");
}

#[test]
fn malformed_lines_and_missing_workspace_are_reported() {
    let mut sc = Sidecar::start("tutord-router-errors");
    let bad = sc.send_raw("{not json");
    assert_eq!(bad["ok"], false);
    assert_eq!(bad["error"]["code"], "bad_json");

    let health = sc.ok("health", json!({}), None);
    assert_eq!(health["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(health["adminLoginEnabled"], true);

    assert_eq!(sc.fails("workspace.select", json!({}), None), "bad_params");
}

#[test]
fn authenticated_methods_require_a_token() {
    let mut sc = Sidecar::start("tutord-router-auth");
    let value = sc.request("classes.list", json!({}), None);
    assert_eq!(value["error"]["code"], "unauthorized");
    assert_eq!(value["error"]["details"]["kind"], "unauthorized");

    let value = sc.request("classes.list", json!({}), Some("not-a-token"));
    assert_eq!(value["error"]["code"], "token_invalid");
    assert_eq!(value["error"]["details"]["kind"], "unauthorized");
}
