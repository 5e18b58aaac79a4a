use crate::db;
use crate::ipc::helpers::{run_org, HandlerErr, OrgCtx};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

const MENU_KEYS: [&str; 12] = [
    "dashboard",
    "students",
    "consultations",
    "waitlists",
    "exams",
    "expenses",
    "revenue",
    "teachers",
    "classes",
    "seats",
    "attendance",
    "settings",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupSection {
    Attendance,
    Seats,
    Branding,
    Menu,
    Notifications,
}

impl SetupSection {
    const ALL: [SetupSection; 5] = [
        Self::Attendance,
        Self::Seats,
        Self::Branding,
        Self::Menu,
        Self::Notifications,
    ];

    fn parse(s: &str) -> Option<Self> {
        match s {
            "attendance" => Some(Self::Attendance),
            "seats" => Some(Self::Seats),
            "branding" => Some(Self::Branding),
            "menu" => Some(Self::Menu),
            "notifications" => Some(Self::Notifications),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Attendance => "attendance",
            Self::Seats => "seats",
            Self::Branding => "branding",
            Self::Menu => "menu",
            Self::Notifications => "notifications",
        }
    }

    fn key(self, org_id: &str) -> String {
        format!("setup.{}.{}", org_id, self.name())
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Attendance => json!({
            "lateGraceMinutes": 10,
            "utcOffsetMinutes": 540,
            "statsWindowDays": 30,
            "rateTopCount": 20
        }),
        SetupSection::Seats => json!({
            "sleepMaxMinutes": 15,
            "sleepDailyLimit": 2,
            "expiringWarnSeconds": 30
        }),
        SetupSection::Branding => json!({
            "logoUrl": null,
            "displayName": ""
        }),
        SetupSection::Menu => json!({
            "hiddenMenus": []
        }),
        SetupSection::Notifications => json!({
            "autoSms": false,
            "autoEmail": false,
            "notificationEnabled": true
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v.as_i64().ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.chars().count() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_nullable_string_max(v: &Value, key: &str, max_len: usize) -> Result<Value, String> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    let s = parse_string_max(v, key, max_len)?;
    Ok(if s.is_empty() { Value::Null } else { Value::String(s) })
}

fn parse_menu_keys(v: &Value, key: &str) -> Result<Value, String> {
    let items = v
        .as_array()
        .ok_or_else(|| format!("{} must be an array", key))?;
    let mut out: Vec<String> = Vec::new();
    for item in items {
        let s = item
            .as_str()
            .ok_or_else(|| format!("{} must contain strings", key))?
            .trim();
        if !MENU_KEYS.contains(&s) {
            return Err(format!("unknown menu key: {}", s));
        }
        if s == "settings" {
            return Err("settings menu cannot be hidden".into());
        }
        if !out.iter().any(|m| m == s) {
            out.push(s.to_string());
        }
    }
    Ok(json!(out))
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Attendance => match k.as_str() {
                "lateGraceMinutes" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 120)?));
                }
                "utcOffsetMinutes" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, -720, 840)?));
                }
                "statsWindowDays" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 7, 90)?));
                }
                "rateTopCount" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 100)?));
                }
                _ => return Err(format!("unknown attendance field: {}", k)),
            },
            SetupSection::Seats => match k.as_str() {
                "sleepMaxMinutes" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 120)?));
                }
                "sleepDailyLimit" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 10)?));
                }
                "expiringWarnSeconds" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 600)?));
                }
                _ => return Err(format!("unknown seats field: {}", k)),
            },
            SetupSection::Branding => match k.as_str() {
                "logoUrl" => {
                    obj.insert(k.clone(), parse_nullable_string_max(v, k, 200_000)?);
                }
                "displayName" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 80)?));
                }
                _ => return Err(format!("unknown branding field: {}", k)),
            },
            SetupSection::Menu => match k.as_str() {
                "hiddenMenus" => {
                    obj.insert(k.clone(), parse_menu_keys(v, k)?);
                }
                _ => return Err(format!("unknown menu field: {}", k)),
            },
            SetupSection::Notifications => match k.as_str() {
                "autoSms" | "autoEmail" | "notificationEnabled" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown notifications field: {}", k)),
            },
        }
    }
    Ok(())
}

pub fn load_section(conn: &Connection, org_id: &str, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, &section.key(org_id))? {
        if let Some(saved_obj) = saved.as_object() {
            // Malformed historical values fall back to defaults.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

fn load_or_err(conn: &Connection, org_id: &str, section: SetupSection) -> Result<Value, HandlerErr> {
    load_section(conn, org_id, section).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn int_field(v: &Value, key: &str, fallback: i64) -> i64 {
    v.get(key).and_then(|x| x.as_i64()).unwrap_or(fallback)
}

#[derive(Debug, Clone, Copy)]
pub struct AttendanceSettings {
    pub late_grace_minutes: i64,
    pub utc_offset_minutes: i64,
    pub stats_window_days: i64,
    pub rate_top_count: i64,
}

pub fn attendance_settings(conn: &Connection, org_id: &str) -> Result<AttendanceSettings, HandlerErr> {
    let v = load_or_err(conn, org_id, SetupSection::Attendance)?;
    Ok(AttendanceSettings {
        late_grace_minutes: int_field(&v, "lateGraceMinutes", 10),
        utc_offset_minutes: int_field(&v, "utcOffsetMinutes", 540),
        stats_window_days: int_field(&v, "statsWindowDays", 30),
        rate_top_count: int_field(&v, "rateTopCount", 20),
    })
}

#[derive(Debug, Clone, Copy)]
pub struct SeatSettings {
    pub sleep_max_minutes: i64,
    pub sleep_daily_limit: i64,
    pub expiring_warn_seconds: i64,
}

pub fn seat_settings(conn: &Connection, org_id: &str) -> Result<SeatSettings, HandlerErr> {
    let v = load_or_err(conn, org_id, SetupSection::Seats)?;
    Ok(SeatSettings {
        sleep_max_minutes: int_field(&v, "sleepMaxMinutes", 15),
        sleep_daily_limit: int_field(&v, "sleepDailyLimit", 2),
        expiring_warn_seconds: int_field(&v, "expiringWarnSeconds", 30),
    })
}

fn setup_get(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let mut out = Map::new();
    for section in SetupSection::ALL {
        out.insert(
            section.name().to_string(),
            load_or_err(ctx.conn, ctx.org_id, section)?,
        );
    }
    Ok(Value::Object(out))
}

fn setup_update(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let Some(section_raw) = ctx.params.get("section").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::bad_params("missing section"));
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return Err(HandlerErr::bad_params("unknown section"));
    };
    let Some(patch_obj) = ctx.params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("patch must be an object"));
    };

    let mut current = load_or_err(ctx.conn, ctx.org_id, section)?;
    merge_section_patch(section, &mut current, patch_obj).map_err(HandlerErr::bad_params)?;
    db::settings_set_json(ctx.conn, &section.key(ctx.org_id), &current)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "section": section.name(), "value": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(run_org(state, req, setup_get)),
        "setup.update" => Some(run_org(state, req, setup_update)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(v: Value) -> Map<String, Value> {
        v.as_object().cloned().expect("object patch")
    }

    #[test]
    fn attendance_patch_validates_ranges() {
        let mut cur = default_section(SetupSection::Attendance);
        merge_section_patch(
            SetupSection::Attendance,
            &mut cur,
            &patch(json!({"lateGraceMinutes": 5, "utcOffsetMinutes": 0})),
        )
        .expect("valid patch");
        assert_eq!(cur["lateGraceMinutes"], 5);
        assert_eq!(cur["utcOffsetMinutes"], 0);
        assert_eq!(cur["statsWindowDays"], 30);

        let e = merge_section_patch(
            SetupSection::Attendance,
            &mut cur,
            &patch(json!({"statsWindowDays": 3})),
        )
        .unwrap_err();
        assert!(e.contains("7..=90"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut cur = default_section(SetupSection::Seats);
        let e = merge_section_patch(SetupSection::Seats, &mut cur, &patch(json!({"nap": 1})))
            .unwrap_err();
        assert_eq!(e, "unknown seats field: nap");
    }

    #[test]
    fn hidden_menus_dedupe_and_protect_settings() {
        let mut cur = default_section(SetupSection::Menu);
        merge_section_patch(
            SetupSection::Menu,
            &mut cur,
            &patch(json!({"hiddenMenus": ["exams", "expenses", "exams"]})),
        )
        .expect("valid menu patch");
        assert_eq!(cur["hiddenMenus"], json!(["exams", "expenses"]));
        assert!(merge_section_patch(
            SetupSection::Menu,
            &mut cur,
            &patch(json!({"hiddenMenus": ["settings"]}))
        )
        .is_err());
    }

    #[test]
    fn blank_logo_clears_to_null() {
        let mut cur = default_section(SetupSection::Branding);
        merge_section_patch(
            SetupSection::Branding,
            &mut cur,
            &patch(json!({"logoUrl": "  ", "displayName": "해피 스터디"})),
        )
        .expect("valid branding patch");
        assert!(cur["logoUrl"].is_null());
        assert_eq!(cur["displayName"], "해피 스터디");
    }
}
