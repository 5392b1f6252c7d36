use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "dualmark.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS markers(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS allocations(
            student_id TEXT PRIMARY KEY,
            student_name TEXT NOT NULL,
            project_id TEXT NOT NULL,
            project_title TEXT NOT NULL,
            supervisor_id TEXT NOT NULL,
            reader_id TEXT,
            FOREIGN KEY(supervisor_id) REFERENCES markers(id),
            FOREIGN KEY(reader_id) REFERENCES markers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_allocations_supervisor ON allocations(supervisor_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_allocations_reader ON allocations(reader_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS units(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            weight REAL NOT NULL,
            student_deadline TEXT,
            marker_deadline TEXT,
            is_open INTEGER NOT NULL DEFAULT 0,
            allowed_roles TEXT NOT NULL DEFAULT 'supervisor,reader',
            sort_order INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_criteria(
            id TEXT PRIMARY KEY,
            unit_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            weight REAL NOT NULL,
            layout_index INTEGER NOT NULL,
            FOREIGN KEY(unit_id) REFERENCES units(id),
            UNIQUE(unit_id, layout_index)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessment_criteria_unit ON assessment_criteria(unit_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS marking_submissions(
            id TEXT PRIMARY KEY,
            marker_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            unit_id TEXT NOT NULL,
            marker_role TEXT NOT NULL,
            grade INTEGER NOT NULL DEFAULT -1,
            final_comment TEXT NOT NULL DEFAULT '',
            recommendation INTEGER NOT NULL DEFAULT 0,
            draft INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT,
            FOREIGN KEY(marker_id) REFERENCES markers(id),
            FOREIGN KEY(student_id) REFERENCES allocations(student_id),
            FOREIGN KEY(unit_id) REFERENCES units(id),
            UNIQUE(marker_id, student_id, unit_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marking_submissions_case ON marking_submissions(student_id, unit_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS criterion_scores(
            id TEXT PRIMARY KEY,
            submission_id TEXT NOT NULL,
            criterion_id TEXT NOT NULL,
            mark INTEGER NOT NULL,
            justification TEXT NOT NULL DEFAULT '',
            FOREIGN KEY(submission_id) REFERENCES marking_submissions(id),
            FOREIGN KEY(criterion_id) REFERENCES assessment_criteria(id),
            UNIQUE(submission_id, criterion_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_criterion_scores_submission ON criterion_scores(submission_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS final_unit_grades(
            unit_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            grade INTEGER NOT NULL,
            comment TEXT NOT NULL,
            resolved_at TEXT NOT NULL,
            PRIMARY KEY(unit_id, student_id),
            FOREIGN KEY(unit_id) REFERENCES units(id),
            FOREIGN KEY(student_id) REFERENCES allocations(student_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS final_grades(
            student_id TEXT PRIMARY KEY,
            grade INTEGER NOT NULL,
            computed_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES allocations(student_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notification_outbox(
            id TEXT PRIMARY KEY,
            dedup_key TEXT NOT NULL UNIQUE,
            kind TEXT NOT NULL,
            student_id TEXT NOT NULL,
            unit_id TEXT NOT NULL,
            recipients_json TEXT NOT NULL,
            data_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            delivered_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notification_outbox_pending ON notification_outbox(delivered_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS escalations(
            student_id TEXT NOT NULL,
            unit_id TEXT NOT NULL,
            status TEXT NOT NULL,
            deadline TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY(student_id, unit_id),
            FOREIGN KEY(unit_id) REFERENCES units(id),
            FOREIGN KEY(student_id) REFERENCES allocations(student_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}
