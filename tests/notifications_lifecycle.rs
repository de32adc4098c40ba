mod common;

use common::Sidecar;
use serde_json::{json, Value};

fn inbox(sc: &mut Sidecar, token: &str) -> Vec<Value> {
    let listed = sc.ok("notifications.list", json!({}), Some(token));
    listed["notifications"].as_array().cloned().unwrap_or_default()
}

#[test]
fn role_broadcast_reaches_active_accounts_only() {
    let mut sc = Sidecar::start("tutord-notify-broadcast");
    let admin = sc.admin();
    let t1 = common::teacher(&mut sc, &admin, 400);
    let t2 = common::teacher(&mut sc, &admin, 401);
    let student = common::student(&mut sc, &admin, 402);
    sc.ok(
        "accounts.setActive",
        json!({ "id": t2.account_id, "active": false }),
        Some(&admin),
    );

    let outcome = sc.ok(
        "notifications.send",
        json!({ "role": "teacher", "title": "Staff meeting", "message": "Sunday 10:00" }),
        Some(&admin),
    );
    assert_eq!(outcome["recipients"], 1);

    let received = inbox(&mut sc, &t1.token);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["notificationType"], "announcement");
    assert_eq!(received[0]["priority"], "normal");
    assert_eq!(received[0]["status"], "sent");
    assert!(inbox(&mut sc, &student.token).is_empty());

    assert_eq!(
        sc.fails(
            "notifications.send",
            json!({ "role": "admin", "title": "x", "message": "y" }),
            Some(&admin),
        ),
        "validation_error"
    );
    assert_eq!(
        sc.fails(
            "notifications.send",
            json!({ "recipientIds": [student.account_id], "role": "student", "title": "x", "message": "y" }),
            Some(&admin),
        ),
        "validation_error"
    );
    assert_eq!(
        sc.fails(
            "notifications.send",
            json!({ "recipientIds": [student.account_id], "title": "x", "message": "y" }),
            Some(&t1.token),
        ),
        "forbidden"
    );
}

#[test]
fn recipients_walk_their_notifications_through_read() {
    let mut sc = Sidecar::start("tutord-notify-read");
    let admin = sc.admin();
    let student = common::student(&mut sc, &admin, 410);
    let other = common::student(&mut sc, &admin, 411);
    sc.ok(
        "notifications.send",
        json!({
            "recipientIds": [student.account_id],
            "title": "Exam",
            "message": "Bring a calculator",
            "priority": "high",
        }),
        Some(&admin),
    );
    let id = inbox(&mut sc, &student.token)[0]["id"]
        .as_str()
        .expect("notification id")
        .to_string();

    assert_eq!(
        sc.fails("notifications.markRead", json!({ "id": id }), Some(&other.token)),
        "forbidden"
    );
    assert_eq!(
        sc.fails(
            "notifications.list",
            json!({ "recipientId": student.account_id }),
            Some(&other.token),
        ),
        "forbidden"
    );

    let delivered = sc.ok("notifications.markDelivered", json!({ "id": id }), Some(&student.token));
    assert_eq!(delivered["status"], "delivered");
    assert!(delivered["deliveredAt"].is_string());

    let read = sc.ok("notifications.markRead", json!({ "id": id }), Some(&student.token));
    assert_eq!(read["status"], "read");
    let again = sc.ok("notifications.markRead", json!({ "id": id }), Some(&student.token));
    assert_eq!(again["readAt"], read["readAt"]);

    assert_eq!(
        sc.fails("notifications.markDelivered", json!({ "id": id }), Some(&student.token)),
        "invalid_state"
    );
    let listed = sc.ok("notifications.list", json!({ "unreadOnly": true }), Some(&student.token));
    assert_eq!(listed["unread"], 0);
    assert_eq!(listed["notifications"].as_array().map(|n| n.len()), Some(0));
}

#[test]
fn failed_notifications_retry_until_the_limit() {
    let mut sc = Sidecar::start("tutord-notify-retry");
    let admin = sc.admin();
    let guardian = common::guardian(&mut sc, &admin, 420);
    sc.ok(
        "notifications.send",
        json!({ "recipientIds": [guardian.account_id], "title": "Invoice", "message": "Due soon" }),
        Some(&admin),
    );
    let id = inbox(&mut sc, &guardian.token)[0]["id"]
        .as_str()
        .expect("notification id")
        .to_string();

    assert_eq!(
        sc.fails(
            "notifications.markFailed",
            json!({ "id": id, "error": "gateway timeout" }),
            Some(&guardian.token),
        ),
        "forbidden"
    );
    assert_eq!(
        sc.fails("notifications.retry", json!({ "id": id }), Some(&admin)),
        "invalid_state"
    );

    for attempt in 1..=3 {
        let failed = sc.ok(
            "notifications.markFailed",
            json!({ "id": id, "error": "gateway timeout" }),
            Some(&admin),
        );
        assert_eq!(failed["status"], "failed");
        assert_eq!(failed["retryCount"], attempt);
        assert_eq!(failed["lastError"], "gateway timeout");
        if attempt < 3 {
            let retried = sc.ok("notifications.retry", json!({ "id": id }), Some(&admin));
            assert_eq!(retried["status"], "sent");
            assert!(retried["lastError"].is_null());
        }
    }
    let value = sc.request("notifications.retry", json!({ "id": id }), Some(&admin));
    assert_eq!(value["error"]["code"], "invalid_state");
    assert_eq!(value["error"]["message"], "retry limit of 3 reached");

    assert_eq!(
        sc.fails("notifications.prune", json!({}), Some(&guardian.token)),
        "forbidden"
    );
    let pruned = sc.ok("notifications.prune", json!({}), Some(&admin));
    assert_eq!(pruned["removed"], 0);
}
