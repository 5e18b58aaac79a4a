use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    check_tenant, commit_err, delete_err, exists, get_optional_i64, get_optional_str, get_required_i64,
    get_required_str, insert_err, is_unique_violation, new_id, now_stored, query_err,
    require_org_role, run_db, run_org, tx_err, HandlerErr, OrgCtx, Patch,
};
use crate::ipc::types::{Actor, AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};

/// Roles allowed to change or remove an organization.
const ORG_ADMINS: [&str; 2] = ["owner", "super_admin"];
const ORG_STATUSES: [&str; 3] = ["active", "suspended", "inactive"];
const BRANCH_STATUSES: [&str; 2] = ["active", "inactive"];
const ROOM_STATUSES: [&str; 3] = ["available", "occupied", "maintenance"];

const ORG_COLUMNS: &str = "id, name, slug, owner_name, address, phone, email, logo_url,
     subscription_plan, status, created_at, updated_at";

fn org_json(r: &Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "slug": r.get::<_, String>(2)?,
        "ownerName": r.get::<_, Option<String>>(3)?,
        "address": r.get::<_, Option<String>>(4)?,
        "phone": r.get::<_, Option<String>>(5)?,
        "email": r.get::<_, Option<String>>(6)?,
        "logoUrl": r.get::<_, Option<String>>(7)?,
        "subscriptionPlan": r.get::<_, Option<String>>(8)?,
        "status": r.get::<_, String>(9)?,
        "createdAt": r.get::<_, String>(10)?,
        "updatedAt": r.get::<_, String>(11)?,
    }))
}

fn normalize_slug(raw: &str) -> Result<String, HandlerErr> {
    let slug = raw.trim().to_ascii_lowercase();
    let valid = !slug.is_empty()
        && slug.len() <= 64
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid {
        return Err(HandlerErr::bad_params(
            "slug must be lowercase letters, digits and inner dashes",
        ));
    }
    Ok(slug)
}

fn check_status(status: &str, allowed: &[&str]) -> Result<(), HandlerErr> {
    if !allowed.contains(&status) {
        return Err(HandlerErr::bad_params(format!(
            "status must be one of: {}",
            allowed.join(", ")
        )));
    }
    Ok(())
}

fn load_org(conn: &Connection, org_id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(
        &format!("SELECT {} FROM organizations WHERE id = ?", ORG_COLUMNS),
        [org_id],
        org_json,
    )
    .optional()
    .map_err(query_err)?
    .ok_or_else(|| HandlerErr::not_found("organization"))
}

fn orgs_list(conn: &Connection, _actor: Option<&Actor>, _params: &Value) -> Result<Value, HandlerErr> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM organizations ORDER BY created_at, rowid",
            ORG_COLUMNS
        ))
        .map_err(query_err)?;
    let rows = stmt
        .query_map([], org_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "organizations": rows }))
}

fn orgs_get(conn: &Connection, _actor: Option<&Actor>, params: &Value) -> Result<Value, HandlerErr> {
    let org_id = get_required_str(params, "orgId")?;
    let org = load_org(conn, &org_id)?;
    Ok(json!({ "organization": org }))
}

fn orgs_create(conn: &Connection, _actor: Option<&Actor>, params: &Value) -> Result<Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let slug = normalize_slug(&get_required_str(params, "slug")?)?;
    let plan = get_optional_str(params, "subscriptionPlan")?;
    if let Some(code) = plan.as_deref() {
        if !exists(conn, "SELECT 1 FROM plans WHERE code = ?", [code])? {
            return Err(HandlerErr::bad_params(format!("unknown plan: {}", code)));
        }
    }
    let id = new_id();
    let now = now_stored();
    conn.execute(
        "INSERT INTO organizations(
            id, name, slug, owner_name, address, phone, email, subscription_plan,
            status, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, ?)",
        (
            &id,
            &name,
            &slug,
            get_optional_str(params, "ownerName")?,
            get_optional_str(params, "address")?,
            get_optional_str(params, "phone")?,
            get_optional_str(params, "email")?,
            &plan,
            &now,
            &now,
        ),
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            HandlerErr::conflict(format!("slug already in use: {}", slug))
        } else {
            insert_err("organizations")(e)
        }
    })?;
    let org = load_org(conn, &id)?;
    Ok(json!({ "organization": org }))
}

fn orgs_update(conn: &Connection, actor: Option<&Actor>, params: &Value) -> Result<Value, HandlerErr> {
    let org_id = get_required_str(params, "orgId")?;
    require_org_role(actor, &org_id, &ORG_ADMINS)?;
    load_org(conn, &org_id)?;

    let mut patch = Patch::default();
    patch.required_text(params, "name", "name")?;
    if let Some(raw) = get_optional_str(params, "slug")? {
        patch.set("slug", normalize_slug(&raw)?);
    }
    patch.text(params, "ownerName", "owner_name")?;
    patch.text(params, "address", "address")?;
    patch.text(params, "phone", "phone")?;
    patch.text(params, "email", "email")?;
    patch.text(params, "logoUrl", "logo_url")?;
    if let Some(code) = get_optional_str(params, "subscriptionPlan")? {
        if !exists(conn, "SELECT 1 FROM plans WHERE code = ?", [&code])? {
            return Err(HandlerErr::bad_params(format!("unknown plan: {}", code)));
        }
        patch.set("subscription_plan", code);
    }
    if let Some(status) = get_optional_str(params, "status")? {
        check_status(&status, &ORG_STATUSES)?;
        patch.set("status", status);
    }
    if !patch.is_empty() {
        patch.set("updated_at", now_stored());
    }
    patch.execute(conn, "organizations", "id = ?", vec![org_id.clone().into()])?;
    let org = load_org(conn, &org_id)?;
    Ok(json!({ "organization": org }))
}

/// Tenant tables, children before parents.
const ORG_CASCADE: [(&str, &str); 26] = [
    ("waitlist_consultations", "DELETE FROM waitlist_consultations WHERE waitlist_id IN (SELECT id FROM waitlists WHERE org_id = ?1)"),
    ("waitlists", "DELETE FROM waitlists WHERE org_id = ?1"),
    ("consultations", "DELETE FROM consultations WHERE org_id = ?1"),
    ("exam_scores", "DELETE FROM exam_scores WHERE exam_id IN (SELECT id FROM exams WHERE org_id = ?1)"),
    ("exams", "DELETE FROM exams WHERE org_id = ?1"),
    ("expenses", "DELETE FROM expenses WHERE org_id = ?1"),
    ("expense_categories", "DELETE FROM expense_categories WHERE org_id = ?1"),
    ("revenue_categories", "DELETE FROM revenue_categories WHERE org_id = ?1"),
    ("class_enrollments", "DELETE FROM class_enrollments WHERE class_id IN (SELECT id FROM classes WHERE org_id = ?1)"),
    ("classes", "DELETE FROM classes WHERE org_id = ?1"),
    ("teacher_students", "DELETE FROM teacher_students WHERE teacher_id IN (SELECT id FROM teachers WHERE org_id = ?1)"),
    ("teachers", "DELETE FROM teachers WHERE org_id = ?1"),
    ("seat_assignments", "DELETE FROM seat_assignments WHERE org_id = ?1"),
    ("seat_config", "DELETE FROM seat_config WHERE org_id = ?1"),
    ("sleep_records", "DELETE FROM sleep_records WHERE org_id = ?1"),
    ("outing_records", "DELETE FROM outing_records WHERE org_id = ?1"),
    ("call_records", "DELETE FROM call_records WHERE org_id = ?1"),
    ("change_events", "DELETE FROM change_events WHERE org_id = ?1"),
    ("attendance", "DELETE FROM attendance WHERE org_id = ?1"),
    ("attendance_logs", "DELETE FROM attendance_logs WHERE org_id = ?1"),
    ("commute_schedules", "DELETE FROM commute_schedules WHERE org_id = ?1"),
    ("students", "DELETE FROM students WHERE org_id = ?1"),
    ("activity_logs", "DELETE FROM activity_logs WHERE org_id = ?1"),
    ("users", "DELETE FROM users WHERE org_id = ?1"),
    ("rooms", "DELETE FROM rooms WHERE org_id = ?1"),
    ("branches", "DELETE FROM branches WHERE org_id = ?1"),
];

fn delete_org(conn: &Connection, org_id: &str) -> Result<(), HandlerErr> {
    load_org(conn, org_id)?;
    let tx = conn.unchecked_transaction().map_err(tx_err)?;
    for (table, sql) in ORG_CASCADE {
        tx.execute(sql, [org_id]).map_err(delete_err(table))?;
    }
    db::settings_delete_prefix(&tx, &format!("setup.{}.", org_id))
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    tx.execute("DELETE FROM organizations WHERE id = ?", [org_id])
        .map_err(delete_err("organizations"))?;
    tx.commit().map_err(commit_err)
}

fn handle_orgs_delete(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let org_id = match get_required_str(&req.params, "orgId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = require_org_role(state.actor.as_ref(), &org_id, &ORG_ADMINS)
        .and_then(|_| delete_org(conn, &org_id))
    {
        return e.response(&req.id);
    }
    if let Some(actor) = state.actor.as_ref() {
        let still_there = exists(conn, "SELECT 1 FROM users WHERE id = ?", [&actor.user_id]);
        if !matches!(still_there, Ok(true)) {
            state.actor = None;
        }
    }
    if state.org_id.as_deref() == Some(org_id.as_str()) {
        state.org_id = None;
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_orgs_select(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let org_id = req.params.get("orgId").and_then(|v| v.as_str());
    let slug = req.params.get("slug").and_then(|v| v.as_str());
    let found = match (org_id, slug) {
        (Some(id), _) => conn
            .query_row(
                &format!("SELECT {} FROM organizations WHERE id = ?", ORG_COLUMNS),
                [id],
                org_json,
            )
            .optional(),
        (None, Some(slug)) => conn
            .query_row(
                &format!("SELECT {} FROM organizations WHERE slug = ?", ORG_COLUMNS),
                [slug.trim().to_ascii_lowercase()],
                org_json,
            )
            .optional(),
        (None, None) => return err(&req.id, "bad_params", "missing orgId or slug", None),
    };
    let org = match found {
        Ok(Some(org)) => org,
        Ok(None) => return err(&req.id, "not_found", "organization not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let id = org["id"].as_str().unwrap_or_default().to_string();
    // Anonymous selection stays open so the first account can be bootstrapped.
    if let Err(e) = check_tenant(state.actor.as_ref(), &id) {
        return e.response(&req.id);
    }
    tracing::info!(org_id = %id, "organization selected");
    state.org_id = Some(id);
    ok(&req.id, json!({ "organization": org }))
}

fn branch_json(r: &Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "address": r.get::<_, Option<String>>(2)?,
        "phone": r.get::<_, Option<String>>(3)?,
        "managerName": r.get::<_, Option<String>>(4)?,
        "status": r.get::<_, String>(5)?,
        "createdAt": r.get::<_, String>(6)?,
    }))
}

fn load_branch(ctx: &OrgCtx, id: &str) -> Result<Value, HandlerErr> {
    ctx.conn
        .query_row(
            "SELECT id, name, address, phone, manager_name, status, created_at
             FROM branches WHERE id = ? AND org_id = ?",
            (id, ctx.org_id),
            branch_json,
        )
        .optional()
        .map_err(query_err)?
        .ok_or_else(|| HandlerErr::not_found("branch"))
}

fn branches_list(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT id, name, address, phone, manager_name, status, created_at
             FROM branches WHERE org_id = ? ORDER BY name",
        )
        .map_err(query_err)?;
    let rows = stmt
        .query_map([ctx.org_id], branch_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "branches": rows }))
}

fn branches_create(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let name = get_required_str(ctx.params, "name")?;
    let status = get_optional_str(ctx.params, "status")?.unwrap_or_else(|| "active".into());
    check_status(&status, &BRANCH_STATUSES)?;
    let id = new_id();
    ctx.conn
        .execute(
            "INSERT INTO branches(id, org_id, name, address, phone, manager_name, status, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &id,
                ctx.org_id,
                &name,
                get_optional_str(ctx.params, "address")?,
                get_optional_str(ctx.params, "phone")?,
                get_optional_str(ctx.params, "managerName")?,
                &status,
                now_stored(),
            ),
        )
        .map_err(insert_err("branches"))?;
    Ok(json!({ "branch": load_branch(ctx, &id)? }))
}

fn branches_update(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let id = get_required_str(ctx.params, "id")?;
    load_branch(ctx, &id)?;
    let mut patch = Patch::default();
    patch.required_text(ctx.params, "name", "name")?;
    patch.text(ctx.params, "address", "address")?;
    patch.text(ctx.params, "phone", "phone")?;
    patch.text(ctx.params, "managerName", "manager_name")?;
    if let Some(status) = get_optional_str(ctx.params, "status")? {
        check_status(&status, &BRANCH_STATUSES)?;
        patch.set("status", status);
    }
    patch.execute(
        ctx.conn,
        "branches",
        "id = ? AND org_id = ?",
        vec![id.clone().into(), ctx.org_id.to_string().into()],
    )?;
    Ok(json!({ "branch": load_branch(ctx, &id)? }))
}

fn branches_delete(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let id = get_required_str(ctx.params, "id")?;
    let n = ctx
        .conn
        .execute(
            "DELETE FROM branches WHERE id = ? AND org_id = ?",
            (&id, ctx.org_id),
        )
        .map_err(delete_err("branches"))?;
    if n == 0 {
        return Err(HandlerErr::not_found("branch"));
    }
    Ok(json!({ "ok": true }))
}

fn room_json(r: &Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "capacity": r.get::<_, i64>(2)?,
        "status": r.get::<_, String>(3)?,
        "notes": r.get::<_, Option<String>>(4)?,
        "createdAt": r.get::<_, String>(5)?,
    }))
}

fn load_room(ctx: &OrgCtx, id: &str) -> Result<Value, HandlerErr> {
    ctx.conn
        .query_row(
            "SELECT id, name, capacity, status, notes, created_at
             FROM rooms WHERE id = ? AND org_id = ?",
            (id, ctx.org_id),
            room_json,
        )
        .optional()
        .map_err(query_err)?
        .ok_or_else(|| HandlerErr::not_found("room"))
}

fn check_capacity(capacity: i64) -> Result<i64, HandlerErr> {
    if capacity <= 0 {
        return Err(HandlerErr::bad_params("capacity must be greater than 0"));
    }
    Ok(capacity)
}

fn rooms_list(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT id, name, capacity, status, notes, created_at
             FROM rooms WHERE org_id = ? ORDER BY name",
        )
        .map_err(query_err)?;
    let rows = stmt
        .query_map([ctx.org_id], room_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "rooms": rows }))
}

fn rooms_create(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let name = get_required_str(ctx.params, "name")?;
    let capacity = check_capacity(get_required_i64(ctx.params, "capacity")?)?;
    let status = get_optional_str(ctx.params, "status")?.unwrap_or_else(|| "available".into());
    check_status(&status, &ROOM_STATUSES)?;
    let id = new_id();
    ctx.conn
        .execute(
            "INSERT INTO rooms(id, org_id, name, capacity, status, notes, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                &id,
                ctx.org_id,
                &name,
                capacity,
                &status,
                get_optional_str(ctx.params, "notes")?,
                now_stored(),
            ),
        )
        .map_err(insert_err("rooms"))?;
    Ok(json!({ "room": load_room(ctx, &id)? }))
}

fn rooms_update(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let id = get_required_str(ctx.params, "id")?;
    load_room(ctx, &id)?;
    let mut patch = Patch::default();
    patch.required_text(ctx.params, "name", "name")?;
    if let Some(capacity) = get_optional_i64(ctx.params, "capacity")? {
        patch.set("capacity", check_capacity(capacity)?);
    }
    if let Some(status) = get_optional_str(ctx.params, "status")? {
        check_status(&status, &ROOM_STATUSES)?;
        patch.set("status", status);
    }
    patch.text(ctx.params, "notes", "notes")?;
    patch.execute(
        ctx.conn,
        "rooms",
        "id = ? AND org_id = ?",
        vec![id.clone().into(), ctx.org_id.to_string().into()],
    )?;
    Ok(json!({ "room": load_room(ctx, &id)? }))
}

fn rooms_delete(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let id = get_required_str(ctx.params, "id")?;
    let n = ctx
        .conn
        .execute("DELETE FROM rooms WHERE id = ? AND org_id = ?", (&id, ctx.org_id))
        .map_err(delete_err("rooms"))?;
    if n == 0 {
        return Err(HandlerErr::not_found("room"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "orgs.list" => Some(run_db(state, req, orgs_list)),
        "orgs.get" => Some(run_db(state, req, orgs_get)),
        "orgs.create" => Some(run_db(state, req, orgs_create)),
        "orgs.update" => Some(run_db(state, req, orgs_update)),
        "orgs.delete" => Some(handle_orgs_delete(state, req)),
        "orgs.select" => Some(handle_orgs_select(state, req)),
        "branches.list" => Some(run_org(state, req, branches_list)),
        "branches.create" => Some(run_org(state, req, branches_create)),
        "branches.update" => Some(run_org(state, req, branches_update)),
        "branches.delete" => Some(run_org(state, req, branches_delete)),
        "rooms.list" => Some(run_org(state, req, rooms_list)),
        "rooms.create" => Some(run_org(state, req, rooms_create)),
        "rooms.update" => Some(run_org(state, req, rooms_update)),
        "rooms.delete" => Some(run_org(state, req, rooms_delete)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_are_lowercased_and_checked() {
        assert_eq!(normalize_slug(" Happy-Study ").ok().as_deref(), Some("happy-study"));
        assert!(normalize_slug("-edge").is_err());
        assert!(normalize_slug("has space").is_err());
        assert!(normalize_slug("학원").is_err());
    }
}
