use crate::db;
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Section {
    Attendance,
    Payments,
    Notifications,
    Audit,
}

pub const ALL_SECTIONS: [Section; 4] = [
    Section::Attendance,
    Section::Payments,
    Section::Notifications,
    Section::Audit,
];

impl Section {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "attendance" => Some(Self::Attendance),
            "payments" => Some(Self::Payments),
            "notifications" => Some(Self::Notifications),
            "audit" => Some(Self::Audit),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Attendance => "attendance",
            Self::Payments => "payments",
            Self::Notifications => "notifications",
            Self::Audit => "audit",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Attendance => "settings.attendance",
            Self::Payments => "settings.payments",
            Self::Notifications => "settings.notifications",
            Self::Audit => "settings.audit",
        }
    }
}

fn default_section(section: Section) -> Value {
    match section {
        Section::Attendance => json!({
            "maxSessionNumber": 8,
            "justificationWindowDays": 7
        }),
        Section::Payments => json!({
            "defaultCurrency": "EGP",
            "maxDiscountPercent": 100
        }),
        Section::Notifications => json!({
            "maxRetries": 3,
            "retentionDays": 30
        }),
        Section::Audit => json!({
            "retentionDays": 90
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal settings object must be a JSON object".to_string())
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

fn parse_currency(v: &Value, key: &str) -> Result<String, String> {
    let s = v
        .as_str()
        .ok_or_else(|| format!("{} must be string", key))?
        .trim()
        .to_ascii_uppercase();
    if s.len() != 3 || !s.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(format!("{} must be a 3-letter currency code", key));
    }
    Ok(s)
}

pub fn merge_section_patch(
    section: Section,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            Section::Attendance => match k.as_str() {
                "maxSessionNumber" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 12)?));
                }
                "justificationWindowDays" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 60)?));
                }
                _ => return Err(format!("unknown attendance field: {}", k)),
            },
            Section::Payments => match k.as_str() {
                "defaultCurrency" => {
                    obj.insert(k.clone(), Value::String(parse_currency(v, k)?));
                }
                "maxDiscountPercent" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 100)?));
                }
                _ => return Err(format!("unknown payments field: {}", k)),
            },
            Section::Notifications => match k.as_str() {
                "maxRetries" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 10)?));
                }
                "retentionDays" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 365)?));
                }
                _ => return Err(format!("unknown notifications field: {}", k)),
            },
            Section::Audit => match k.as_str() {
                "retentionDays" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 3650)?));
                }
                _ => return Err(format!("unknown audit field: {}", k)),
            },
        }
    }
    Ok(())
}

pub fn load_section(conn: &Connection, section: Section) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults field by field.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

pub fn save_section(conn: &Connection, section: Section, value: &Value) -> anyhow::Result<()> {
    db::settings_set_json(conn, section.key(), value)
}

fn int_field(conn: &Connection, section: Section, field: &str) -> i64 {
    let from_store = load_section(conn, section)
        .ok()
        .and_then(|v| v.get(field).and_then(|n| n.as_i64()));
    from_store
        .or_else(|| default_section(section).get(field).and_then(|n| n.as_i64()))
        .unwrap_or_default()
}

pub fn max_session_number(conn: &Connection) -> i64 {
    int_field(conn, Section::Attendance, "maxSessionNumber")
}

pub fn justification_window_days(conn: &Connection) -> i64 {
    int_field(conn, Section::Attendance, "justificationWindowDays")
}

pub fn max_discount_percent(conn: &Connection) -> i64 {
    int_field(conn, Section::Payments, "maxDiscountPercent")
}

pub fn default_currency(conn: &Connection) -> String {
    load_section(conn, Section::Payments)
        .ok()
        .and_then(|v| v.get("defaultCurrency").and_then(|s| s.as_str()).map(String::from))
        .unwrap_or_else(|| "EGP".to_string())
}

pub fn notification_max_retries(conn: &Connection) -> i64 {
    int_field(conn, Section::Notifications, "maxRetries")
}

pub fn notification_retention_days(conn: &Connection) -> i64 {
    int_field(conn, Section::Notifications, "retentionDays")
}

pub fn audit_retention_days(conn: &Connection) -> i64 {
    int_field(conn, Section::Audit, "retentionDays")
}
