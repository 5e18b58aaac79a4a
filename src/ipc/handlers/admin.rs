use crate::ipc::helpers::{
    commit_err, delete_err, get_limit, get_optional_bool, get_optional_i64,
    get_optional_str, get_required_i64, get_required_str, get_string_list, has_key, insert_err,
    is_unique_violation, json_array_column, new_id, now_stored, query_err, require_role, run_db,
    tx_err, HandlerErr, Patch,
};
use crate::ipc::types::{Actor, AppState, Request};
use rusqlite::{params_from_iter, types::Value as SqlValue, Connection, OptionalExtension, Row};
use serde_json::{json, Value};

const ADMIN_ONLY: [&str; 1] = ["super_admin"];

/// Platform-level change record. Written inside the caller's transaction.
fn audit(
    conn: &Connection,
    actor: &Actor,
    action: &str,
    target_type: &str,
    target_id: &str,
    changes: &Value,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO audit_logs(id, admin_id, action, target_type, target_id, changes_json, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            new_id(),
            &actor.user_id,
            action,
            target_type,
            target_id,
            changes.to_string(),
            now_stored(),
        ),
    )
    .map_err(insert_err("audit_logs"))?;
    Ok(())
}

const PLAN_COLUMNS: &str = "p.id, p.name, p.code, p.description, p.price_monthly, p.price_yearly, \
                            p.max_users, p.max_students, p.max_teachers, p.max_classes, \
                            p.features_json, p.is_active, p.sort_order, p.created_at, p.updated_at, \
                            (SELECT COUNT(*) FROM organizations o WHERE o.subscription_plan = p.code)";

fn plan_json(r: &Row) -> rusqlite::Result<Value> {
    let features: String = r.get(10)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "code": r.get::<_, String>(2)?,
        "description": r.get::<_, Option<String>>(3)?,
        "priceMonthly": r.get::<_, i64>(4)?,
        "priceYearly": r.get::<_, i64>(5)?,
        "maxUsers": r.get::<_, i64>(6)?,
        "maxStudents": r.get::<_, i64>(7)?,
        "maxTeachers": r.get::<_, i64>(8)?,
        "maxClasses": r.get::<_, i64>(9)?,
        "features": json_array_column(&features),
        "isActive": r.get::<_, i64>(11)? != 0,
        "sortOrder": r.get::<_, i64>(12)?,
        "createdAt": r.get::<_, String>(13)?,
        "updatedAt": r.get::<_, String>(14)?,
        "organizationCount": r.get::<_, i64>(15)?,
    }))
}

fn load_plan(conn: &Connection, id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM plans p WHERE p.id = ?", PLAN_COLUMNS),
        [id],
        plan_json,
    )
    .optional()
    .map_err(query_err)?
    .ok_or_else(|| HandlerErr::not_found("plan"))
}

fn non_negative(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    let v = get_optional_i64(params, key)?;
    if v.is_some_and(|n| n < 0) {
        return Err(HandlerErr::bad_params(format!("{} must not be negative", key)));
    }
    Ok(v)
}

fn positive(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    let v = get_optional_i64(params, key)?;
    if v.is_some_and(|n| n < 1) {
        return Err(HandlerErr::bad_params(format!("{} must be positive", key)));
    }
    Ok(v)
}

fn plan_code(params: &Value) -> Result<String, HandlerErr> {
    let code = get_required_str(params, "code")?.to_ascii_lowercase();
    if !code
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(HandlerErr::bad_params(
            "code may only contain letters, digits, '-' and '_'",
        ));
    }
    Ok(code)
}

fn code_conflict(table: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
    move |e| {
        if is_unique_violation(&e) {
            HandlerErr::conflict("plan code already exists")
        } else {
            insert_err(table)(e)
        }
    }
}

fn plan_usage(conn: &Connection, code: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COUNT(*) FROM organizations WHERE subscription_plan = ?",
        [code],
        |r| r.get(0),
    )
    .map_err(query_err)
}

fn plans_list(conn: &Connection, actor: Option<&Actor>, params: &Value) -> Result<Value, HandlerErr> {
    require_role(actor, &ADMIN_ONLY)?;
    let include_inactive = get_optional_bool(params, "includeInactive")?.unwrap_or(false);
    let filter = if include_inactive { "" } else { " WHERE p.is_active = 1" };
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM plans p{} ORDER BY p.sort_order, p.name",
            PLAN_COLUMNS, filter
        ))
        .map_err(query_err)?;
    let plans = stmt
        .query_map([], plan_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "plans": plans }))
}

fn plans_create(conn: &Connection, actor: Option<&Actor>, params: &Value) -> Result<Value, HandlerErr> {
    let actor = require_role(actor, &ADMIN_ONLY)?;
    let name = get_required_str(params, "name")?;
    let code = plan_code(params)?;
    let features = get_string_list(params, "features")?.unwrap_or_default();
    let id = new_id();
    let now = now_stored();

    let tx = conn.unchecked_transaction().map_err(tx_err)?;
    tx.execute(
        "INSERT INTO plans(id, name, code, description, price_monthly, price_yearly, max_users,
                           max_students, max_teachers, max_classes, features_json, is_active,
                           sort_order, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            name,
            code,
            get_optional_str(params, "description")?,
            non_negative(params, "priceMonthly")?.unwrap_or(0),
            non_negative(params, "priceYearly")?.unwrap_or(0),
            positive(params, "maxUsers")?.unwrap_or(5),
            positive(params, "maxStudents")?.unwrap_or(30),
            positive(params, "maxTeachers")?.unwrap_or(3),
            positive(params, "maxClasses")?.unwrap_or(5),
            json!(features).to_string(),
            i64::from(get_optional_bool(params, "isActive")?.unwrap_or(true)),
            get_optional_i64(params, "sortOrder")?.unwrap_or(0),
            now,
            now,
        ],
    )
    .map_err(code_conflict("plans"))?;
    let plan = load_plan(&tx, &id)?;
    audit(&tx, actor, "plan.create", "plan", &id, &plan)?;
    tx.commit().map_err(commit_err)?;
    Ok(json!({ "plan": plan }))
}

fn plans_update(conn: &Connection, actor: Option<&Actor>, params: &Value) -> Result<Value, HandlerErr> {
    let actor = require_role(actor, &ADMIN_ONLY)?;
    let id = get_required_str(params, "id")?;
    let before = load_plan(conn, &id)?;

    let mut patch = Patch::default();
    patch.required_text(params, "name", "name")?;
    if has_key(params, "code") {
        let code = plan_code(params)?;
        let old = before["code"].as_str().unwrap_or_default();
        if code != old && plan_usage(conn, old)? > 0 {
            return Err(HandlerErr::conflict("plan code cannot change while organizations use it"));
        }
        patch.set("code", code);
    }
    patch.text(params, "description", "description")?;
    for (key, column) in [("priceMonthly", "price_monthly"), ("priceYearly", "price_yearly")] {
        if let Some(v) = non_negative(params, key)? {
            patch.set(column, v);
        }
    }
    for (key, column) in [
        ("maxUsers", "max_users"),
        ("maxStudents", "max_students"),
        ("maxTeachers", "max_teachers"),
        ("maxClasses", "max_classes"),
    ] {
        if let Some(v) = positive(params, key)? {
            patch.set(column, v);
        }
    }
    if let Some(features) = get_string_list(params, "features")? {
        patch.set("features_json", json!(features).to_string());
    }
    patch.bool(params, "isActive", "is_active")?;
    if let Some(order) = get_optional_i64(params, "sortOrder")? {
        patch.set("sort_order", order);
    }
    if patch.is_empty() {
        return Ok(json!({ "plan": before }));
    }
    patch.set("updated_at", now_stored());

    let tx = conn.unchecked_transaction().map_err(tx_err)?;
    patch.execute(&tx, "plans", "id = ?", vec![id.clone().into()])?;
    let after = load_plan(&tx, &id)?;
    audit(
        &tx,
        actor,
        "plan.update",
        "plan",
        &id,
        &json!({ "before": before, "after": after }),
    )?;
    tx.commit().map_err(commit_err)?;
    Ok(json!({ "plan": after }))
}

fn plans_delete(conn: &Connection, actor: Option<&Actor>, params: &Value) -> Result<Value, HandlerErr> {
    let actor = require_role(actor, &ADMIN_ONLY)?;
    let id = get_required_str(params, "id")?;
    let plan = load_plan(conn, &id)?;
    let in_use = plan["organizationCount"].as_i64().unwrap_or(0);
    if in_use > 0 {
        return Err(HandlerErr::conflict("plan is in use by organizations")
            .with_details(json!({ "organizationCount": in_use })));
    }
    let tx = conn.unchecked_transaction().map_err(tx_err)?;
    tx.execute("DELETE FROM plans WHERE id = ?", [&id])
        .map_err(delete_err("plans"))?;
    audit(&tx, actor, "plan.delete", "plan", &id, &plan)?;
    tx.commit().map_err(commit_err)?;
    Ok(json!({ "ok": true }))
}

fn pricing_json(r: &Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "messageType": r.get::<_, String>(0)?,
        "price": r.get::<_, i64>(1)?,
        "cost": r.get::<_, Option<i64>>(2)?,
        "updatedAt": r.get::<_, String>(3)?,
    }))
}

fn load_pricing(conn: &Connection, message_type: &str) -> Result<Value, HandlerErr> {
    conn.query_row(
        "SELECT message_type, price, cost, updated_at FROM message_pricing WHERE message_type = ?",
        [message_type],
        pricing_json,
    )
    .optional()
    .map_err(query_err)?
    .ok_or_else(|| HandlerErr::not_found("message type"))
}

fn pricing_list(conn: &Connection, actor: Option<&Actor>, _params: &Value) -> Result<Value, HandlerErr> {
    require_role(actor, &ADMIN_ONLY)?;
    let mut stmt = conn
        .prepare("SELECT message_type, price, cost, updated_at FROM message_pricing ORDER BY message_type")
        .map_err(query_err)?;
    let rows = stmt
        .query_map([], pricing_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "pricing": rows }))
}

fn pricing_update(conn: &Connection, actor: Option<&Actor>, params: &Value) -> Result<Value, HandlerErr> {
    let actor = require_role(actor, &ADMIN_ONLY)?;
    let message_type = get_required_str(params, "messageType")?;
    let price = get_required_i64(params, "price")?;
    if price < 0 {
        return Err(HandlerErr::bad_params("price must not be negative"));
    }
    let cost = non_negative(params, "cost")?;
    let before = load_pricing(conn, &message_type)?;

    let tx = conn.unchecked_transaction().map_err(tx_err)?;
    let mut patch = Patch::default();
    patch.set("price", price);
    if has_key(params, "cost") {
        patch.set("cost", cost);
    }
    patch.set("updated_at", now_stored());
    patch.execute(&tx, "message_pricing", "message_type = ?", vec![message_type.clone().into()])?;
    let after = load_pricing(&tx, &message_type)?;
    audit(
        &tx,
        actor,
        "message_pricing.update",
        "message_pricing",
        &message_type,
        &json!({ "before": before, "after": after }),
    )?;
    tx.commit().map_err(commit_err)?;
    Ok(json!({ "pricing": after }))
}

fn audit_logs_list(conn: &Connection, actor: Option<&Actor>, params: &Value) -> Result<Value, HandlerErr> {
    require_role(actor, &ADMIN_ONLY)?;
    let limit = get_limit(params, "limit", 50, 500)?;
    let mut sql = String::from(
        "SELECT l.id, l.admin_id, u.name, l.action, l.target_type, l.target_id, l.changes_json,
                l.created_at
         FROM audit_logs l LEFT JOIN users u ON u.id = l.admin_id",
    );
    let mut binds: Vec<SqlValue> = Vec::new();
    if let Some(t) = get_optional_str(params, "targetType")? {
        sql.push_str(" WHERE l.target_type = ?");
        binds.push(t.into());
    }
    sql.push_str(" ORDER BY l.created_at DESC, l.rowid DESC LIMIT ?");
    binds.push(limit.into());
    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let rows = stmt
        .query_map(params_from_iter(binds.iter()), |r| {
            let changes: String = r.get(6)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "adminId": r.get::<_, Option<String>>(1)?,
                "adminName": r.get::<_, Option<String>>(2)?,
                "action": r.get::<_, String>(3)?,
                "targetType": r.get::<_, String>(4)?,
                "targetId": r.get::<_, Option<String>>(5)?,
                "changes": serde_json::from_str::<Value>(&changes).unwrap_or(Value::Null),
                "createdAt": r.get::<_, String>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "logs": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "admin.plans.list" => Some(run_db(state, req, plans_list)),
        "admin.plans.create" => Some(run_db(state, req, plans_create)),
        "admin.plans.update" => Some(run_db(state, req, plans_update)),
        "admin.plans.delete" => Some(run_db(state, req, plans_delete)),
        "admin.messagePricing.list" => Some(run_db(state, req, pricing_list)),
        "admin.messagePricing.update" => Some(run_db(state, req, pricing_update)),
        "admin.auditLogs.list" => Some(run_db(state, req, audit_logs_list)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::plan_code;
    use serde_json::json;

    #[test]
    fn plan_codes_are_lowercase_identifiers() {
        assert_eq!(plan_code(&json!({"code": "Pro-2024"})).ok().as_deref(), Some("pro-2024"));
        assert!(plan_code(&json!({"code": "pro plan"})).is_err());
        assert!(plan_code(&json!({})).is_err());
    }
}
