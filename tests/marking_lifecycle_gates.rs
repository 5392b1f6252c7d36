mod test_support;

use serde_json::json;
use test_support::Seeded;

fn two_criterion_unit(s: &mut Seeded) {
    s.ok(
        "units.create",
        json!({ "id": "u2", "title": "Report", "weight": 1, "open": true }),
    );
    s.ok(
        "criteria.set",
        json!({
            "unitId": "u2",
            "criteria": [
                { "id": "analysis", "title": "Analysis", "weight": 2 },
                { "id": "writing", "title": "Writing", "weight": 1 }
            ]
        }),
    );
}

#[test]
fn closed_unit_rejects_marker_writes() {
    let mut s = Seeded::new("dualmark-closed-unit");
    s.ok("units.setOpen", json!({ "unitId": "u1", "open": false }));

    let code = s.err(
        "marking.saveDraft",
        json!({ "markerId": "sup", "studentId": "s1", "unitId": "u1" }),
    );
    assert_eq!(code, "unit_closed");
    let code = s.err(
        "marking.submit",
        json!({
            "markerId": "sup",
            "studentId": "s1",
            "unitId": "u1",
            "marks": [{ "criterionId": "u1-c1", "mark": 12 }]
        }),
    );
    assert_eq!(code, "unit_closed");

    let status = s.ok("marking.status", json!({ "studentId": "s1", "unitId": "u1" }));
    let roles = status["roles"].as_array().expect("roles");
    assert_eq!(roles.len(), 2);
    assert!(roles.iter().all(|r| r["status"] == "CLOSED"));
    assert_eq!(status.pointer("/outcome/status"), Some(&json!("INSUFFICIENT")));
}

#[test]
fn drafts_are_editable_until_final_submission() {
    let mut s = Seeded::new("dualmark-drafts");
    two_criterion_unit(&mut s);

    let draft = s.ok(
        "marking.saveDraft",
        json!({
            "markerId": "sup",
            "studentId": "s1",
            "unitId": "u2",
            "marks": [{ "criterionId": "analysis", "mark": 18, "justification": "solid" }]
        }),
    );
    assert_eq!(draft["status"], "DRAFT");
    assert!(draft["grade"].is_null());

    // A draft may be saved again and stays partial.
    s.ok(
        "marking.saveDraft",
        json!({
            "markerId": "sup",
            "studentId": "s1",
            "unitId": "u2",
            "marks": [{ "criterionId": "writing", "mark": 12 }]
        }),
    );
    let got = s.ok(
        "marking.get",
        json!({ "markerId": "sup", "studentId": "s1", "unitId": "u2" }),
    );
    assert_eq!(got.pointer("/submission/draft"), Some(&json!(true)));
    assert_eq!(got.pointer("/submission/grade"), Some(&json!(-1)));
    let scores = got
        .pointer("/submission/criterionScores")
        .and_then(|v| v.as_array())
        .expect("scores");
    assert_eq!(scores.len(), 1);
    assert_eq!(scores[0]["criterionId"], "writing");

    let code = s.err(
        "marking.submit",
        json!({
            "markerId": "sup",
            "studentId": "s1",
            "unitId": "u2",
            "marks": [{ "criterionId": "analysis", "mark": 18 }]
        }),
    );
    assert_eq!(code, "bad_params");

    // (18*2 + 12*1) / 3 = 16
    let submitted = s.ok(
        "marking.submit",
        json!({
            "markerId": "sup",
            "studentId": "s1",
            "unitId": "u2",
            "marks": [
                { "criterionId": "analysis", "mark": 18 },
                { "criterionId": "writing", "mark": 12 }
            ],
            "finalComment": "Good work",
            "recommendation": true
        }),
    );
    assert_eq!(submitted["status"], "SUBMITTED");
    assert_eq!(submitted["mark"], 16);
    assert_eq!(submitted["grade"], "B2");

    let again = json!({
        "markerId": "sup",
        "studentId": "s1",
        "unitId": "u2",
        "marks": [
            { "criterionId": "analysis", "mark": 10 },
            { "criterionId": "writing", "mark": 10 }
        ]
    });
    assert_eq!(s.err("marking.submit", again.clone()), "already_submitted");
    assert_eq!(s.err("marking.saveDraft", again), "already_submitted");
}

#[test]
fn invalid_marks_and_markers_are_rejected() {
    let mut s = Seeded::new("dualmark-invalid-marks");
    s.ok(
        "markers.upsert",
        json!({ "id": "other", "name": "Someone Else", "email": "other@uni.example" }),
    );

    let submit = |marker: &str, mark: serde_json::Value| {
        json!({
            "markerId": marker,
            "studentId": "s1",
            "unitId": "u1",
            "marks": [{ "criterionId": "u1-c1", "mark": mark }]
        })
    };

    assert_eq!(s.err("marking.submit", submit("sup", json!(16.5))), "invalid_mark_format");
    assert_eq!(s.err("marking.submit", submit("sup", json!(23))), "bad_params");
    assert_eq!(s.err("marking.submit", submit("other", json!(12))), "not_allowed");
    assert_eq!(
        s.err(
            "marking.submit",
            json!({
                "markerId": "sup",
                "studentId": "s1",
                "unitId": "u1",
                "marks": [{ "criterionId": "nope", "mark": 12 }]
            })
        ),
        "bad_params"
    );
    assert_eq!(
        s.err(
            "marking.submit",
            json!({ "markerId": "sup", "studentId": "s1", "unitId": "missing", "marks": [] })
        ),
        "not_found"
    );

    // None of the rejected writes left a row behind.
    let got = s.ok(
        "marking.get",
        json!({ "markerId": "sup", "studentId": "s1", "unitId": "u1" }),
    );
    assert!(got["submission"].is_null());
}

#[test]
fn rubric_locks_once_scored_and_rejects_bad_weights() {
    let mut s = Seeded::new("dualmark-rubric-lock");

    assert_eq!(
        s.err(
            "criteria.set",
            json!({ "unitId": "u1", "criteria": [{ "title": "Zero", "weight": 0 }] })
        ),
        "bad_params"
    );
    assert_eq!(
        s.err("criteria.set", json!({ "unitId": "u1", "criteria": [] })),
        "bad_params"
    );

    s.ok(
        "marking.saveDraft",
        json!({
            "markerId": "rdr",
            "studentId": "s1",
            "unitId": "u1",
            "marks": [{ "criterionId": "u1-c1", "mark": 9 }]
        }),
    );
    assert_eq!(
        s.err(
            "criteria.set",
            json!({ "unitId": "u1", "criteria": [{ "title": "Replacement", "weight": 1 }] })
        ),
        "rubric_locked"
    );
    let listed = s.ok("criteria.list", json!({ "unitId": "u1" }));
    assert_eq!(listed.pointer("/criteria/0/id"), Some(&json!("u1-c1")));
}

#[test]
fn reopen_returns_submission_to_draft_and_clears_final_grade() {
    let mut s = Seeded::new("dualmark-reopen");
    s.submit("sup", "u1", 14);
    let resolved = s.submit("rdr", "u1", 14);
    assert_eq!(resolved.pointer("/resolution/finalGrade"), Some(&json!("C1")));

    s.ok(
        "marking.reopen",
        json!({ "markerId": "rdr", "studentId": "s1", "unitId": "u1" }),
    );
    let status = s.ok("marking.status", json!({ "studentId": "s1", "unitId": "u1" }));
    assert!(status["finalGrade"].is_null());
    assert_eq!(status.pointer("/outcome/status"), Some(&json!("INSUFFICIENT")));
    assert_eq!(status.pointer("/roles/1/status"), Some(&json!("DRAFT")));

    let overall = s.ok("marking.finalGrade", json!({ "studentId": "s1" }));
    assert_eq!(overall.pointer("/overall/status"), Some(&json!("PENDING")));

    let resubmitted = s.submit("rdr", "u1", 13);
    assert_eq!(resubmitted.pointer("/resolution/finalGrade"), Some(&json!("C1")));

    // Replacing the scores keeps exactly one row per criterion.
    let db = rusqlite::Connection::open(s.workspace.join("dualmark.sqlite3")).expect("open db");
    let rows: i64 = db
        .query_row(
            "SELECT COUNT(*) FROM criterion_scores cs
             JOIN marking_submissions ms ON ms.id = cs.submission_id
             WHERE ms.marker_id = 'rdr'",
            [],
            |r| r.get(0),
        )
        .expect("count scores");
    assert_eq!(rows, 1);

    assert_eq!(
        s.err(
            "marking.reopen",
            json!({ "markerId": "sup", "studentId": "s1", "unitId": "missing" })
        ),
        "not_found"
    );
}

#[test]
fn failed_finalization_rolls_back_the_whole_submission() {
    let mut s = Seeded::new("dualmark-atomic-submit");
    s.add_unit("solo", 1.0, &["supervisor"]);

    let db = rusqlite::Connection::open(s.workspace.join("dualmark.sqlite3")).expect("open db");
    db.execute_batch(
        "CREATE TRIGGER block_final BEFORE INSERT ON final_unit_grades
         BEGIN SELECT RAISE(ABORT, 'blocked'); END;",
    )
    .expect("create trigger");

    let submit = json!({
        "markerId": "sup",
        "studentId": "s1",
        "unitId": "solo",
        "marks": [{ "criterionId": "solo-c1", "mark": 15 }]
    });
    assert_eq!(s.err("marking.submit", submit.clone()), "db_insert_failed");

    let got = s.ok(
        "marking.get",
        json!({ "markerId": "sup", "studentId": "s1", "unitId": "solo" }),
    );
    assert!(got["submission"].is_null());
    assert!(s.pending_kinds().is_empty());
    let status = s.ok("marking.status", json!({ "studentId": "s1", "unitId": "solo" }));
    assert!(status["finalGrade"].is_null());

    db.execute_batch("DROP TRIGGER block_final;").expect("drop trigger");
    let done = s.ok("marking.submit", submit);
    assert_eq!(done.pointer("/resolution/finalGrade"), Some(&json!("B3")));
    assert_eq!(s.pending_kinds(), vec!["MARKING_SUBMITTED", "MARKING_COMPLETE"]);
}

#[test]
fn drafts_can_be_discarded_but_final_submissions_cannot() {
    let mut s = Seeded::new("dualmark-discard");
    let key = json!({ "markerId": "sup", "studentId": "s1", "unitId": "u1" });

    assert_eq!(s.err("marking.discardDraft", key.clone()), "no_draft");

    s.ok(
        "marking.saveDraft",
        json!({
            "markerId": "sup",
            "studentId": "s1",
            "unitId": "u1",
            "marks": [{ "criterionId": "u1-c1", "mark": 12, "justification": "first pass" }]
        }),
    );
    s.ok("marking.discardDraft", key.clone());

    let got = s.ok("marking.get", key.clone());
    assert!(got["submission"].is_null());
    let status = s.ok("marking.status", json!({ "studentId": "s1", "unitId": "u1" }));
    assert_eq!(status.pointer("/roles/0/status"), Some(&json!("OPEN")));

    let db = rusqlite::Connection::open(s.workspace.join("dualmark.sqlite3")).expect("open db");
    let scores: i64 = db
        .query_row("SELECT COUNT(*) FROM criterion_scores", [], |r| r.get(0))
        .expect("count scores");
    assert_eq!(scores, 0);

    s.submit("sup", "u1", 12);
    assert_eq!(s.err("marking.discardDraft", key.clone()), "already_submitted");
    let got = s.ok("marking.get", key);
    assert_eq!(got.pointer("/submission/draft"), Some(&json!(false)));

    assert_eq!(
        s.err(
            "marking.discardDraft",
            json!({ "markerId": "ghost", "studentId": "s1", "unitId": "u1" })
        ),
        "not_allowed"
    );
}
