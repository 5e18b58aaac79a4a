use crate::consultation::valid_email;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    delete_err, get_optional_str, get_required_str, insert_err, is_unique_violation, new_id,
    now_stored, query_err, require_role, run_org, HandlerErr, OrgCtx, Patch,
};
use crate::ipc::types::{Actor, AppState, Request};
use rusqlite::{OptionalExtension, Row};
use serde_json::{json, Value};

pub const ROLES: [&str; 5] = ["owner", "manager", "teacher", "staff", "super_admin"];
const ACCOUNT_MANAGERS: [&str; 3] = ["owner", "manager", "super_admin"];

fn account_json(r: &Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "orgId": r.get::<_, Option<String>>(1)?,
        "name": r.get::<_, String>(2)?,
        "email": r.get::<_, String>(3)?,
        "phone": r.get::<_, Option<String>>(4)?,
        "role": r.get::<_, String>(5)?,
        "status": r.get::<_, String>(6)?,
        "createdAt": r.get::<_, String>(7)?,
    }))
}

const ACCOUNT_COLUMNS: &str = "id, org_id, name, email, phone, role, status, created_at";

fn parse_role(raw: &str) -> Result<String, HandlerErr> {
    let role = raw.trim().to_ascii_lowercase();
    if !ROLES.contains(&role.as_str()) {
        return Err(HandlerErr::bad_params(format!(
            "role must be one of: {}",
            ROLES.join(", ")
        )));
    }
    Ok(role)
}

fn parse_email(raw: &str) -> Result<String, HandlerErr> {
    let email = raw.trim().to_ascii_lowercase();
    if !valid_email(&email) {
        return Err(HandlerErr::bad_params("email is not a valid address"));
    }
    Ok(email)
}

fn load_account(ctx: &OrgCtx, id: &str) -> Result<Value, HandlerErr> {
    ctx.conn
        .query_row(
            &format!(
                "SELECT {} FROM users WHERE id = ? AND org_id = ?",
                ACCOUNT_COLUMNS
            ),
            (id, ctx.org_id),
            account_json,
        )
        .optional()
        .map_err(query_err)?
        .ok_or_else(|| HandlerErr::not_found("account"))
}

fn email_conflict(e: rusqlite::Error) -> HandlerErr {
    if is_unique_violation(&e) {
        HandlerErr::conflict("email already registered")
    } else {
        insert_err("users")(e)
    }
}

fn accounts_list(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let mut stmt = ctx
        .conn
        .prepare(&format!(
            "SELECT {} FROM users WHERE org_id = ? ORDER BY name",
            ACCOUNT_COLUMNS
        ))
        .map_err(query_err)?;
    let rows = stmt
        .query_map([ctx.org_id], account_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "accounts": rows }))
}

/// The first account of an organization bootstraps it; later ones need a manager.
fn accounts_create(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let has_accounts: i64 = ctx
        .conn
        .query_row(
            "SELECT COUNT(*) FROM users WHERE org_id = ?",
            [ctx.org_id],
            |r| r.get(0),
        )
        .map_err(query_err)?;
    if has_accounts > 0 {
        require_role(ctx.actor, &ACCOUNT_MANAGERS)?;
    }
    let name = get_required_str(ctx.params, "name")?;
    let email = parse_email(&get_required_str(ctx.params, "email")?)?;
    let role = parse_role(&get_required_str(ctx.params, "role")?)?;
    if role == "super_admin" {
        let admins: i64 = ctx
            .conn
            .query_row(
                "SELECT COUNT(*) FROM users WHERE role = 'super_admin'",
                [],
                |r| r.get(0),
            )
            .map_err(query_err)?;
        if admins > 0 {
            require_role(ctx.actor, &["super_admin"])?;
        }
    }
    // Platform administrators are not tied to a tenant.
    let org_id = if role == "super_admin" { None } else { Some(ctx.org_id) };
    let id = new_id();
    ctx.conn
        .execute(
            "INSERT INTO users(id, org_id, name, email, phone, role, status, created_at)
             VALUES(?, ?, ?, ?, ?, ?, 'active', ?)",
            (
                &id,
                org_id,
                &name,
                &email,
                get_optional_str(ctx.params, "phone")?,
                &role,
                now_stored(),
            ),
        )
        .map_err(email_conflict)?;
    let account = ctx
        .conn
        .query_row(
            &format!("SELECT {} FROM users WHERE id = ?", ACCOUNT_COLUMNS),
            [&id],
            account_json,
        )
        .map_err(query_err)?;
    Ok(json!({ "account": account }))
}

fn accounts_update(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    require_role(ctx.actor, &ACCOUNT_MANAGERS)?;
    let id = get_required_str(ctx.params, "id")?;
    load_account(ctx, &id)?;
    let mut patch = Patch::default();
    patch.required_text(ctx.params, "name", "name")?;
    if let Some(raw) = get_optional_str(ctx.params, "email")? {
        patch.set("email", parse_email(&raw)?);
    }
    patch.text(ctx.params, "phone", "phone")?;
    if let Some(raw) = get_optional_str(ctx.params, "role")? {
        let role = parse_role(&raw)?;
        if role == "super_admin" {
            return Err(HandlerErr::bad_params("tenant accounts cannot become super_admin"));
        }
        patch.set("role", role);
    }
    if let Some(status) = get_optional_str(ctx.params, "status")? {
        if status != "active" && status != "inactive" {
            return Err(HandlerErr::bad_params("status must be one of: active, inactive"));
        }
        patch.set("status", status);
    }
    patch.execute(
        ctx.conn,
        "users",
        "id = ? AND org_id = ?",
        vec![id.clone().into(), ctx.org_id.to_string().into()],
    )?;
    Ok(json!({ "account": load_account(ctx, &id)? }))
}

fn accounts_delete(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let actor = require_role(ctx.actor, &ACCOUNT_MANAGERS)?;
    let id = get_required_str(ctx.params, "id")?;
    if actor.user_id == id {
        return Err(HandlerErr::conflict("cannot delete the signed-in account"));
    }
    let n = ctx
        .conn
        .execute("DELETE FROM users WHERE id = ? AND org_id = ?", (&id, ctx.org_id))
        .map_err(delete_err("users"))?;
    if n == 0 {
        return Err(HandlerErr::not_found("account"));
    }
    Ok(json!({ "ok": true }))
}

fn session_json(state: &AppState) -> Value {
    match state.actor.as_ref() {
        Some(a) => json!({
            "userId": a.user_id,
            "name": a.name,
            "role": a.role,
            "orgId": state.org_id,
        }),
        None => Value::Null,
    }
}

/// Signs in by email. Tenant users also select their organization.
fn handle_sign_in(state: &mut AppState, req: &Request) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let email = match get_required_str(&req.params, "email") {
        Ok(v) => v.to_ascii_lowercase(),
        Err(e) => return e.response(&req.id),
    };
    let row = conn
        .query_row(
            "SELECT id, org_id, name, role, status FROM users WHERE email = ?",
            [&email],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, Option<String>>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                ))
            },
        )
        .optional();
    let (user_id, org_id, name, role, status) = match row {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "no account with that email", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if status != "active" {
        return err(&req.id, "forbidden", "account is inactive", None);
    }
    tracing::info!(user_id = %user_id, role = %role, "signed in");
    state.actor = Some(Actor {
        user_id,
        name,
        role,
        org_id: org_id.clone(),
    });
    if org_id.is_some() {
        state.org_id = org_id;
    }
    ok(&req.id, json!({ "session": session_json(state) }))
}

fn handle_sign_out(state: &mut AppState, req: &Request) -> Value {
    state.actor = None;
    ok(&req.id, json!({ "ok": true }))
}

fn handle_current(state: &mut AppState, req: &Request) -> Value {
    ok(&req.id, json!({ "session": session_json(state) }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "accounts.list" => Some(run_org(state, req, accounts_list)),
        "accounts.create" => Some(run_org(state, req, accounts_create)),
        "accounts.update" => Some(run_org(state, req, accounts_update)),
        "accounts.delete" => Some(run_org(state, req, accounts_delete)),
        "session.signIn" => Some(handle_sign_in(state, req)),
        "session.signOut" => Some(handle_sign_out(state, req)),
        "session.current" => Some(handle_current(state, req)),
        _ => None,
    }
}
