#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_dualmarkd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn dualmarkd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

/// Asserts the call failed and returns the error code.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .pointer("/error/code")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Workspace with a supervisor, a reader, one student allocated to both, and
/// an open dual-marked unit `u1` with a single criterion `u1-c1`.
pub struct Seeded {
    pub child: Child,
    pub stdin: ChildStdin,
    pub reader: BufReader<ChildStdout>,
    pub workspace: PathBuf,
    next_id: u32,
}

impl Seeded {
    pub fn new(prefix: &str) -> Self {
        let workspace = temp_dir(prefix);
        let (child, stdin, reader) = spawn_sidecar();
        let mut s = Seeded {
            child,
            stdin,
            reader,
            workspace,
            next_id: 0,
        };
        let path = s.workspace.to_string_lossy().to_string();
        s.ok("workspace.select", json!({ "path": path }));
        s.ok(
            "markers.upsert",
            json!({ "id": "sup", "name": "Dr Supervisor", "email": "sup@uni.example" }),
        );
        s.ok(
            "markers.upsert",
            json!({ "id": "rdr", "name": "Dr Reader", "email": "rdr@uni.example" }),
        );
        s.ok(
            "allocations.upsert",
            json!({
                "studentId": "s1",
                "studentName": "Sam Student",
                "projectId": "p1",
                "projectTitle": "Compilers",
                "supervisorId": "sup",
                "readerId": "rdr"
            }),
        );
        s.add_unit("u1", 1.0, &["supervisor", "reader"]);
        s
    }

    fn id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    pub fn ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        let id = self.id();
        request_ok(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    pub fn err(&mut self, method: &str, params: serde_json::Value) -> String {
        let id = self.id();
        request_err(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    pub fn add_unit(&mut self, unit_id: &str, weight: f64, roles: &[&str]) {
        self.ok(
            "units.create",
            json!({
                "id": unit_id,
                "title": format!("Unit {}", unit_id),
                "weight": weight,
                "allowedRoles": roles,
                "open": true,
                "markerDeadline": "2026-06-01T17:00:00Z"
            }),
        );
        self.ok(
            "criteria.set",
            json!({
                "unitId": unit_id,
                "criteria": [{ "id": format!("{}-c1", unit_id), "title": "Overall", "weight": 1.0 }]
            }),
        );
    }

    /// Final submission of a single-criterion unit; the mark is the grade.
    pub fn submit(&mut self, marker: &str, unit_id: &str, mark: i64) -> serde_json::Value {
        self.ok(
            "marking.submit",
            json!({
                "markerId": marker,
                "studentId": "s1",
                "unitId": unit_id,
                "marks": [{ "criterionId": format!("{}-c1", unit_id), "mark": mark }],
                "finalComment": "ok"
            }),
        )
    }

    pub fn pending_kinds(&mut self) -> Vec<String> {
        let pending = self.ok("notifications.pending", json!({}));
        pending["notifications"]
            .as_array()
            .expect("notifications array")
            .iter()
            .map(|n| n["kind"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}
