use crate::dispatch::NotificationIntent;
use rusqlite::Connection;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub fn dedup_key(intent: &NotificationIntent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(intent.dedup_scope.as_bytes());
    for r in &intent.recipients {
        hasher.update(b"|");
        hasher.update(r.id.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Queue an intent for the transport. Returns `false` when an identical event
/// was already queued.
pub fn enqueue(
    conn: &Connection,
    student_id: &str,
    unit_id: &str,
    intent: &NotificationIntent,
) -> anyhow::Result<bool> {
    let key = dedup_key(intent);
    let inserted = conn.execute(
        "INSERT INTO notification_outbox(
            id, dedup_key, kind, student_id, unit_id, recipients_json, data_json, created_at
         )
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(dedup_key) DO NOTHING",
        (
            Uuid::new_v4().to_string(),
            &key,
            intent.kind.as_str(),
            student_id,
            unit_id,
            serde_json::to_string(&intent.recipients)?,
            serde_json::to_string(&intent.data)?,
            chrono::Utc::now().to_rfc3339(),
        ),
    )?;
    if inserted == 0 {
        tracing::debug!(kind = intent.kind.as_str(), student_id, unit_id, "duplicate notification suppressed");
    } else {
        tracing::info!(kind = intent.kind.as_str(), student_id, unit_id, "notification queued");
    }
    Ok(inserted > 0)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub id: String,
    pub kind: String,
    pub student_id: String,
    pub unit_id: String,
    pub recipients: serde_json::Value,
    pub data: serde_json::Value,
    pub created_at: String,
}

pub fn pending(conn: &Connection, limit: i64) -> anyhow::Result<Vec<OutboxEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, student_id, unit_id, recipients_json, data_json, created_at
         FROM notification_outbox
         WHERE delivered_at IS NULL
         ORDER BY created_at, rowid
         LIMIT ?",
    )?;
    let rows = stmt
        .query_map([limit], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (id, kind, student_id, unit_id, recipients_json, data_json, created_at) in rows {
        out.push(OutboxEntry {
            id,
            kind,
            student_id,
            unit_id,
            recipients: serde_json::from_str(&recipients_json)?,
            data: serde_json::from_str(&data_json)?,
            created_at,
        });
    }
    Ok(out)
}

pub fn mark_delivered(conn: &Connection, ids: &[String]) -> anyhow::Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let now = chrono::Utc::now().to_rfc3339();
    let mut changed = 0;
    for id in ids {
        changed += tx.execute(
            "UPDATE notification_outbox SET delivered_at = ? WHERE id = ? AND delivered_at IS NULL",
            (&now, id),
        )?;
    }
    tx.commit()?;
    Ok(changed)
}
