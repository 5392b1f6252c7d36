use crate::db;
use crate::dispatch::Contact;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{json, Map, Value};

pub const ENGINE_SETTINGS_KEY: &str = "engine";
pub const LOG_ENV_VAR: &str = "DUALMARKD_LOG";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    pub coordinator_name: String,
    pub coordinator_email: String,
    pub negotiation_deadline_days: i64,
    pub moderation_deadline_days: i64,
    pub guard_auto_resolved: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            coordinator_name: "Marking Coordinator".to_string(),
            coordinator_email: String::new(),
            negotiation_deadline_days: 7,
            moderation_deadline_days: 7,
            guard_auto_resolved: true,
        }
    }
}

impl EngineConfig {
    /// `None` when no coordinator address is configured.
    pub fn coordinator(&self) -> Option<Contact> {
        if self.coordinator_email.trim().is_empty() {
            return None;
        }
        Some(Contact {
            id: "coordinator".to_string(),
            name: self.coordinator_name.clone(),
            email: self.coordinator_email.clone(),
        })
    }

    pub fn to_json(&self) -> Value {
        json!(self)
    }

    pub fn apply_patch(&mut self, patch: &Map<String, Value>) -> Result<(), String> {
        for (k, v) in patch {
            match k.as_str() {
                "coordinatorName" => {
                    self.coordinator_name = parse_string_max(v, k, 120)?;
                }
                "coordinatorEmail" => {
                    let s = parse_string_max(v, k, 200)?;
                    if !s.is_empty() && !s.contains('@') {
                        return Err("coordinatorEmail must be an email address".into());
                    }
                    self.coordinator_email = s;
                }
                "negotiationDeadlineDays" => {
                    self.negotiation_deadline_days = parse_i64_range(v, k, 1, 60)?;
                }
                "moderationDeadlineDays" => {
                    self.moderation_deadline_days = parse_i64_range(v, k, 1, 60)?;
                }
                "guardAutoResolved" => {
                    self.guard_auto_resolved = v
                        .as_bool()
                        .ok_or_else(|| format!("{} must be boolean", k))?;
                }
                _ => return Err(format!("unknown engine field: {}", k)),
            }
        }
        Ok(())
    }
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

pub fn load(conn: &Connection) -> anyhow::Result<EngineConfig> {
    let mut cfg = EngineConfig::default();
    if let Some(saved) = db::settings_get_json(conn, ENGINE_SETTINGS_KEY)? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults.
            if let Err(e) = cfg.apply_patch(saved_obj) {
                tracing::warn!(error = %e, "ignoring invalid stored engine settings");
                cfg = EngineConfig::default();
            }
        }
    }
    Ok(cfg)
}

pub fn save(conn: &Connection, cfg: &EngineConfig) -> anyhow::Result<()> {
    db::settings_set_json(conn, ENGINE_SETTINGS_KEY, &cfg.to_json())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_updates_known_fields() {
        let mut cfg = EngineConfig::default();
        let patch = json!({
            "coordinatorEmail": "coord@example.ac.uk",
            "negotiationDeadlineDays": 14,
            "guardAutoResolved": false
        });
        cfg.apply_patch(patch.as_object().expect("object"))
            .expect("valid patch");
        assert_eq!(cfg.negotiation_deadline_days, 14);
        assert!(!cfg.guard_auto_resolved);
        assert_eq!(
            cfg.coordinator().map(|c| c.email),
            Some("coord@example.ac.uk".to_string())
        );
    }

    #[test]
    fn patch_rejects_bad_values() {
        let mut cfg = EngineConfig::default();
        for bad in [
            json!({ "negotiationDeadlineDays": 0 }),
            json!({ "moderationDeadlineDays": "7" }),
            json!({ "coordinatorEmail": "not-an-address" }),
            json!({ "colour": "blue" }),
        ] {
            assert!(cfg.apply_patch(bad.as_object().expect("object")).is_err());
        }
    }

    #[test]
    fn no_coordinator_by_default() {
        assert!(EngineConfig::default().coordinator().is_none());
    }

    #[test]
    fn round_trips_through_json_patch() {
        let mut cfg = EngineConfig::default();
        cfg.moderation_deadline_days = 3;
        let stored = cfg.to_json();
        let mut loaded = EngineConfig::default();
        loaded
            .apply_patch(stored.as_object().expect("object"))
            .expect("stored config is a valid patch");
        assert_eq!(loaded, cfg);
    }
}
