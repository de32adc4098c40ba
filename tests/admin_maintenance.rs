mod common;

use common::Sidecar;
use serde_json::json;

#[test]
fn workspace_bundle_round_trip_restores_prior_state() {
    let mut sc = Sidecar::start("tutord-backup-roundtrip");
    let admin = sc.admin();
    let kept = common::teacher(&mut sc, &admin, 500);

    let bundle = common::temp_dir("tutord-backup-out").join("workspace.tutorbundle");
    let exported = sc.ok(
        "backup.exportWorkspaceBundle",
        json!({ "outPath": bundle.to_string_lossy() }),
        Some(&admin),
    );
    assert_eq!(exported["bundleFormat"], "tutord-workspace-v1");
    assert_eq!(exported["entryCount"], 2);
    assert!(bundle.is_file());

    let added_later = common::teacher(&mut sc, &admin, 501);
    let imported = sc.ok(
        "backup.importWorkspaceBundle",
        json!({ "inPath": bundle.to_string_lossy() }),
        Some(&admin),
    );
    assert_eq!(imported["bundleFormatDetected"], "tutord-workspace-v1");

    sc.ok("accounts.get", json!({ "id": kept.account_id }), Some(&admin));
    assert_eq!(
        sc.fails("accounts.get", json!({ "id": added_later.account_id }), Some(&admin)),
        "not_found"
    );
    let entries = sc.ok(
        "audit.list",
        json!({ "action": "backup.import" }),
        Some(&admin),
    );
    assert_eq!(entries["entries"].as_array().map(|e| e.len()), Some(1));
    assert_eq!(entries["entries"][0]["category"], "system");
}

#[test]
fn backup_rejects_non_admins_and_garbage_input() {
    let mut sc = Sidecar::start("tutord-backup-guard");
    let admin = sc.admin();
    let teacher = common::teacher(&mut sc, &admin, 510);
    let dir = common::temp_dir("tutord-backup-guard-files");

    assert_eq!(
        sc.fails(
            "backup.exportWorkspaceBundle",
            json!({ "outPath": dir.join("x.zip").to_string_lossy() }),
            Some(&teacher.token),
        ),
        "forbidden"
    );

    let garbage = dir.join("garbage.bin");
    std::fs::write(&garbage, b"definitely not a bundle").expect("write garbage");
    assert_eq!(
        sc.fails(
            "backup.importWorkspaceBundle",
            json!({ "inPath": garbage.to_string_lossy() }),
            Some(&teacher.token),
        ),
        "forbidden"
    );
    let value = sc.request(
        "backup.importWorkspaceBundle",
        json!({ "inPath": garbage.to_string_lossy() }),
        Some(&admin),
    );
    assert_eq!(value["ok"], false);

    // The workspace is reopened even when the import is refused.
    sc.ok("accounts.get", json!({ "id": teacher.account_id }), Some(&admin));
}

#[test]
fn settings_updates_are_validated_and_audited() {
    let mut sc = Sidecar::start("tutord-settings");
    let admin = sc.admin();
    let student = common::student(&mut sc, &admin, 520);

    let all = sc.ok("settings.get", json!({}), Some(&admin));
    assert_eq!(all["attendance"]["maxSessionNumber"], 8);
    assert_eq!(all["notifications"]["maxRetries"], 3);
    assert_eq!(all["payments"]["defaultCurrency"], "EGP");

    let updated = sc.ok(
        "settings.update",
        json!({ "section": "attendance", "patch": { "maxSessionNumber": 4 } }),
        Some(&admin),
    );
    assert_eq!(updated["attendance"]["maxSessionNumber"], 4);
    assert_eq!(updated["attendance"]["justificationWindowDays"], 7);

    for bad in [
        json!({ "section": "attendance", "patch": { "maxSessionNumber": 13 } }),
        json!({ "section": "attendance", "patch": { "colour": "red" } }),
        json!({ "section": "payroll", "patch": {} }),
        json!({ "section": "payments", "patch": { "defaultCurrency": "euro" } }),
    ] {
        assert_eq!(sc.fails("settings.update", bad, Some(&admin)), "validation_error");
    }
    assert_eq!(
        sc.fails("settings.get", json!({}), Some(&student.token)),
        "forbidden"
    );

    let reread = sc.ok("settings.get", json!({}), Some(&admin));
    assert_eq!(reread["attendance"]["maxSessionNumber"], 4);
    let entries = sc.ok(
        "audit.list",
        json!({ "action": "settings.update" }),
        Some(&admin),
    );
    let entries = entries["entries"].as_array().cloned().unwrap_or_default();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["details"]["after"]["maxSessionNumber"], 4);
    assert_eq!(entries[0]["actorId"], "admin");
}
