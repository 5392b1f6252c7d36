mod test_support;

use serde_json::json;
use test_support::Seeded;

fn pending_of_kind(s: &mut Seeded, kind: &str) -> Vec<serde_json::Value> {
    let pending = s.ok("notifications.pending", json!({}));
    pending["notifications"]
        .as_array()
        .expect("notifications")
        .iter()
        .filter(|n| n["kind"] == kind)
        .cloned()
        .collect()
}

#[test]
fn markers_without_a_final_submission_are_reminded_once() {
    let mut s = Seeded::new("dualmark-marking-overdue");
    s.submit("sup", "u1", 17);
    s.ok(
        "marking.saveDraft",
        json!({ "markerId": "rdr", "studentId": "s1", "unitId": "u1" }),
    );

    let early = s.ok("marking.remindOverdue", json!({ "now": "2026-05-01T00:00:00Z" }));
    assert_eq!(
        early,
        json!({ "markingReminders": 0, "negotiationReminders": 0, "notificationsQueued": 0 })
    );

    let late = s.ok("marking.remindOverdue", json!({ "now": "2026-07-01T00:00:00Z" }));
    assert_eq!(late["markingReminders"], 1);
    assert_eq!(late["notificationsQueued"], 1);

    let again = s.ok("marking.remindOverdue", json!({ "now": "2026-07-02T00:00:00Z" }));
    assert_eq!(again["markingReminders"], 1);
    assert_eq!(again["notificationsQueued"], 0);

    let reminders = pending_of_kind(&mut s, "MARKING_OVERDUE");
    assert_eq!(reminders.len(), 1);
    let r = &reminders[0];
    assert_eq!(r.pointer("/recipients/0/id"), Some(&json!("rdr")));
    assert_eq!(r.pointer("/data/role"), Some(&json!("reader")));
    assert_eq!(r.pointer("/data/markerDeadline"), Some(&json!("2026-06-01T17:00:00Z")));

    // Closed units are past chasing.
    s.ok("units.setOpen", json!({ "unitId": "u1", "open": false }));
    let closed = s.ok("marking.remindOverdue", json!({ "now": "2026-07-03T00:00:00Z" }));
    assert_eq!(closed["markingReminders"], 0);

    assert_eq!(
        s.err("marking.remindOverdue", json!({ "now": "tomorrow" })),
        "bad_params"
    );
}

#[test]
fn stalled_negotiations_remind_both_markers_until_resolved() {
    let mut s = Seeded::new("dualmark-negotiation-overdue");
    s.submit("sup", "u1", 17);
    let r = s.submit("rdr", "u1", 15);
    assert_eq!(
        r.pointer("/resolution/outcome/status"),
        Some(&json!("NEGOTIATE1"))
    );

    let within = s.ok("marking.remindOverdue", json!({ "now": "2000-01-01T00:00:00Z" }));
    assert_eq!(within["negotiationReminders"], 0);

    let overdue = s.ok("marking.remindOverdue", json!({ "now": "2099-01-01T00:00:00Z" }));
    assert_eq!(overdue["markingReminders"], 0);
    assert_eq!(overdue["negotiationReminders"], 2);
    assert_eq!(overdue["notificationsQueued"], 2);

    let reminders = pending_of_kind(&mut s, "NEGOTIATION_OVERDUE");
    let recipients: Vec<&str> = reminders
        .iter()
        .filter_map(|n| n.pointer("/recipients/0/id").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(recipients, vec!["sup", "rdr"]);
    // The reminder quotes the deadline the escalation was raised with.
    let escalation = pending_of_kind(&mut s, "NEGOTIATE1_SUPERVISOR");
    assert_eq!(
        reminders[0].pointer("/data/deadline"),
        escalation[0].pointer("/data/deadline")
    );

    let repeat = s.ok("marking.remindOverdue", json!({ "now": "2099-01-02T00:00:00Z" }));
    assert_eq!(repeat["notificationsQueued"], 0);

    s.ok(
        "marking.resolve",
        json!({
            "markerId": "sup",
            "studentId": "s1",
            "unitId": "u1",
            "grade": 16,
            "comment": "Agreed"
        }),
    );
    let settled = s.ok("marking.remindOverdue", json!({ "now": "2099-01-03T00:00:00Z" }));
    assert_eq!(settled["negotiationReminders"], 0);
}
