use crate::ipc::error::{err, ok};
pub use crate::ipc::error::{
    commit_err, delete_err, insert_err, is_unique_violation, query_err, tx_err, update_err,
    HandlerErr,
};
use crate::ipc::types::{Actor, AppState, Request};
use crate::schedule;
use chrono::{DateTime, Utc};
use rusqlite::{params_from_iter, types::Value as SqlValue, Connection, OptionalExtension, Params};
use serde_json::Value;
use uuid::Uuid;

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn now_stored() -> String {
    schedule::to_stored(Utc::now())
}

pub fn has_key(params: &Value, key: &str) -> bool {
    params.get(key).is_some()
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    let Some(v) = params.get(key).filter(|v| !v.is_null()) else {
        return Err(HandlerErr::bad_params(format!("missing {}", key)));
    };
    let s = v
        .as_str()
        .ok_or_else(|| HandlerErr::bad_params(format!("{} must be string", key)))?
        .trim();
    if s.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(s.to_string())
}

/// Absent, null and blank strings all read as `None`.
pub fn get_optional_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be string", key))),
    }
}

pub fn get_required_i64(params: &Value, key: &str) -> Result<i64, HandlerErr> {
    get_optional_i64(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be integer", key))),
    }
}

pub fn get_required_f64(params: &Value, key: &str) -> Result<f64, HandlerErr> {
    get_optional_f64(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_f64(params: &Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .filter(|n| n.is_finite())
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key))),
    }
}

pub fn get_optional_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be boolean", key))),
    }
}

pub fn get_string_list(params: &Value, key: &str) -> Result<Option<Vec<String>>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(|s| s.trim().to_string())
                    .ok_or_else(|| HandlerErr::bad_params(format!("{} must contain strings", key)))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be an array", key))),
    }
}

pub fn get_required_date(params: &Value, key: &str) -> Result<String, HandlerErr> {
    let s = get_required_str(params, key)?;
    check_date(&s, key)?;
    Ok(s)
}

pub fn get_optional_date(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    let s = get_optional_str(params, key)?;
    if let Some(d) = s.as_deref() {
        check_date(d, key)?;
    }
    Ok(s)
}

fn check_date(s: &str, key: &str) -> Result<(), HandlerErr> {
    if schedule::parse_date(s).is_none() {
        return Err(HandlerErr::bad_params(format!("{} must be YYYY-MM-DD", key)));
    }
    Ok(())
}

/// Optional `now` override (RFC 3339); defaults to the wall clock.
pub fn get_now(params: &Value) -> Result<DateTime<Utc>, HandlerErr> {
    match get_optional_str(params, "now")? {
        Some(s) => schedule::parse_instant(&s)
            .ok_or_else(|| HandlerErr::bad_params("now must be an RFC 3339 timestamp")),
        None => Ok(Utc::now()),
    }
}

pub fn get_limit(params: &Value, key: &str, default: i64, max: i64) -> Result<i64, HandlerErr> {
    let n = get_optional_i64(params, key)?.unwrap_or(default);
    if n < 1 || n > max {
        return Err(HandlerErr::bad_params(format!("{} must be in 1..={}", key, max)));
    }
    Ok(n)
}

pub fn exists<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<bool, HandlerErr> {
    conn.query_row(sql, params, |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(query_err)
}

pub fn json_array_column(raw: &str) -> Value {
    serde_json::from_str::<Value>(raw)
        .ok()
        .filter(|v| v.is_array())
        .unwrap_or_else(|| Value::Array(Vec::new()))
}

pub fn require_role<'a>(actor: Option<&'a Actor>, roles: &[&str]) -> Result<&'a Actor, HandlerErr> {
    let Some(actor) = actor else {
        return Err(HandlerErr::new("auth_required", "sign in first"));
    };
    if !roles.contains(&actor.role.as_str()) {
        return Err(HandlerErr::new(
            "forbidden",
            format!("role {} may not perform this action", actor.role),
        )
        .with_details(serde_json::json!({ "allowedRoles": roles })));
    }
    Ok(actor)
}

/// A signed-in tenant account may not touch another organization.
pub fn check_tenant(actor: Option<&Actor>, org_id: &str) -> Result<(), HandlerErr> {
    match actor {
        Some(a) if !a.acts_in(org_id) => Err(HandlerErr::new(
            "forbidden",
            "account belongs to another organization",
        )
        .with_details(serde_json::json!({ "orgId": org_id }))),
        _ => Ok(()),
    }
}

pub fn require_org_role<'a>(
    actor: Option<&'a Actor>,
    org_id: &str,
    roles: &[&str],
) -> Result<&'a Actor, HandlerErr> {
    let actor = require_role(actor, roles)?;
    check_tenant(Some(actor), org_id)?;
    Ok(actor)
}

/// Everything a tenant-scoped handler needs.
pub struct OrgCtx<'a> {
    pub conn: &'a Connection,
    pub org_id: &'a str,
    pub actor: Option<&'a Actor>,
    pub params: &'a Value,
}

pub fn run_org<F>(state: &AppState, req: &Request, f: F) -> Value
where
    F: FnOnce(&OrgCtx) -> Result<Value, HandlerErr>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(org_id) = state.org_id.as_deref() else {
        return err(&req.id, "no_org", "select an organization first", None);
    };
    if let Err(e) = check_tenant(state.actor.as_ref(), org_id) {
        return e.response(&req.id);
    }
    let ctx = OrgCtx {
        conn,
        org_id,
        actor: state.actor.as_ref(),
        params: &req.params,
    };
    match f(&ctx) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn run_db<F>(state: &AppState, req: &Request, f: F) -> Value
where
    F: FnOnce(&Connection, Option<&Actor>, &Value) -> Result<Value, HandlerErr>,
{
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, state.actor.as_ref(), &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

/// Collects `column = ?` assignments for the keys present in a patch.
#[derive(Default)]
pub struct Patch {
    sets: Vec<String>,
    values: Vec<SqlValue>,
}

impl Patch {
    pub fn set(&mut self, column: &str, value: impl Into<SqlValue>) {
        self.sets.push(format!("{} = ?", column));
        self.values.push(value.into());
    }

    /// Present key: blank or null clears the column.
    pub fn text(&mut self, params: &Value, key: &str, column: &str) -> Result<(), HandlerErr> {
        if has_key(params, key) {
            let v = get_optional_str(params, key)?;
            self.set(column, v);
        }
        Ok(())
    }

    pub fn required_text(&mut self, params: &Value, key: &str, column: &str) -> Result<(), HandlerErr> {
        if has_key(params, key) {
            let v = get_required_str(params, key)?;
            self.set(column, v);
        }
        Ok(())
    }

    pub fn date(&mut self, params: &Value, key: &str, column: &str) -> Result<(), HandlerErr> {
        if has_key(params, key) {
            let v = get_optional_date(params, key)?;
            self.set(column, v);
        }
        Ok(())
    }

    pub fn bool(&mut self, params: &Value, key: &str, column: &str) -> Result<(), HandlerErr> {
        if let Some(b) = get_optional_bool(params, key)? {
            self.set(column, i64::from(b));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn execute(
        mut self,
        conn: &Connection,
        table: &'static str,
        where_sql: &str,
        where_values: Vec<SqlValue>,
    ) -> Result<usize, HandlerErr> {
        if self.sets.is_empty() {
            return Ok(0);
        }
        let sql = format!("UPDATE {} SET {} WHERE {}", table, self.sets.join(", "), where_sql);
        self.values.extend(where_values);
        conn.execute(&sql, params_from_iter(self.values.iter()))
            .map_err(|e| {
                if is_unique_violation(&e) {
                    HandlerErr::conflict(format!("{} already has a row with that value", table))
                } else {
                    update_err(table)(e)
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn optional_str_treats_blank_as_missing() {
        let p = json!({"a": "  ", "b": null, "c": " x ", "d": 3});
        assert_eq!(get_optional_str(&p, "a").ok().flatten(), None);
        assert_eq!(get_optional_str(&p, "b").ok().flatten(), None);
        assert_eq!(get_optional_str(&p, "c").ok().flatten().as_deref(), Some("x"));
        assert!(get_optional_str(&p, "d").is_err());
        assert!(get_required_str(&p, "a").is_err());
    }

    #[test]
    fn limit_is_bounded() {
        assert_eq!(get_limit(&json!({}), "limit", 20, 100).ok(), Some(20));
        assert!(get_limit(&json!({"limit": 101}), "limit", 20, 100).is_err());
        assert!(get_limit(&json!({"limit": 0}), "limit", 20, 100).is_err());
    }

    #[test]
    fn roles_gate_actions() {
        let owner = Actor {
            user_id: "u1".into(),
            name: "원장".into(),
            role: "owner".into(),
            org_id: Some("org-a".into()),
        };
        assert_eq!(require_role(None, &["owner"]).err().map(|e| e.code), Some("auth_required"));
        assert_eq!(
            require_role(Some(&owner), &["super_admin"]).err().map(|e| e.code),
            Some("forbidden")
        );
        assert!(require_role(Some(&owner), &["owner", "super_admin"]).is_ok());
    }

    #[test]
    fn tenant_accounts_stay_in_their_organization() {
        let owner = Actor {
            user_id: "u1".into(),
            name: "원장".into(),
            role: "owner".into(),
            org_id: Some("org-a".into()),
        };
        let admin = Actor {
            user_id: "u2".into(),
            name: "운영자".into(),
            role: "super_admin".into(),
            org_id: None,
        };
        assert!(check_tenant(None, "org-b").is_ok());
        assert!(check_tenant(Some(&owner), "org-a").is_ok());
        assert_eq!(
            check_tenant(Some(&owner), "org-b").err().map(|e| e.code),
            Some("forbidden")
        );
        assert!(check_tenant(Some(&admin), "org-b").is_ok());
        assert_eq!(
            require_org_role(Some(&owner), "org-b", &["owner"]).err().map(|e| e.code),
            Some("forbidden")
        );
        assert!(require_org_role(Some(&admin), "org-b", &["owner", "super_admin"]).is_ok());
    }
}
