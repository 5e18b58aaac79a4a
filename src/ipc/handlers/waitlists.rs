use crate::ipc::helpers::{
    commit_err, delete_err, exists, get_optional_str, get_required_str, insert_err, new_id,
    now_stored, query_err, run_org, tx_err, update_err, HandlerErr, OrgCtx, Patch,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};

fn waitlist_json(r: &Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "description": r.get::<_, Option<String>>(2)?,
        "status": r.get::<_, String>(3)?,
        "consultationCount": r.get::<_, i64>(4)?,
        "createdAt": r.get::<_, String>(5)?,
    }))
}

const WAITLIST_COLUMNS: &str = "id, name, description, status, consultation_count, created_at";

/// Keeps the cached count equal to the junction rows.
pub fn refresh_count(conn: &Connection, waitlist_id: &str) -> Result<(), HandlerErr> {
    conn.execute(
        "UPDATE waitlists
         SET consultation_count = (
           SELECT COUNT(*) FROM waitlist_consultations WHERE waitlist_id = ?1
         )
         WHERE id = ?1",
        [waitlist_id],
    )
    .map_err(update_err("waitlists"))?;
    Ok(())
}

pub fn waitlist_in_org(conn: &Connection, org_id: &str, waitlist_id: &str) -> Result<bool, HandlerErr> {
    exists(
        conn,
        "SELECT 1 FROM waitlists WHERE id = ? AND org_id = ?",
        (waitlist_id, org_id),
    )
}

pub fn is_member(conn: &Connection, waitlist_id: &str, consultation_id: &str) -> Result<bool, HandlerErr> {
    exists(
        conn,
        "SELECT 1 FROM waitlist_consultations WHERE waitlist_id = ? AND consultation_id = ?",
        (waitlist_id, consultation_id),
    )
}

/// Appends at `max(position) + 1` and refreshes the count. Returns the position.
pub fn append(
    conn: &Connection,
    waitlist_id: &str,
    consultation_id: &str,
    notes: Option<&str>,
) -> Result<i64, HandlerErr> {
    let position: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(position), 0) + 1 FROM waitlist_consultations WHERE waitlist_id = ?",
            [waitlist_id],
            |r| r.get(0),
        )
        .map_err(query_err)?;
    conn.execute(
        "INSERT INTO waitlist_consultations(id, waitlist_id, consultation_id, position, notes, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (new_id(), waitlist_id, consultation_id, position, notes, now_stored()),
    )
    .map_err(insert_err("waitlist_consultations"))?;
    refresh_count(conn, waitlist_id)?;
    Ok(position)
}

/// Drops a consultation from every waitlist. Returns the waitlists touched.
pub fn remove_everywhere(conn: &Connection, consultation_id: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT waitlist_id FROM waitlist_consultations WHERE consultation_id = ?")
        .map_err(query_err)?;
    let touched = stmt
        .query_map([consultation_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    conn.execute(
        "DELETE FROM waitlist_consultations WHERE consultation_id = ?",
        [consultation_id],
    )
    .map_err(delete_err("waitlist_consultations"))?;
    for id in &touched {
        refresh_count(conn, id)?;
    }
    Ok(touched)
}

fn consultation_ids(conn: &Connection, waitlist_id: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT consultation_id FROM waitlist_consultations
             WHERE waitlist_id = ? ORDER BY position",
        )
        .map_err(query_err)?;
    stmt.query_map([waitlist_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)
}

fn load_waitlist(ctx: &OrgCtx, id: &str) -> Result<Value, HandlerErr> {
    ctx.conn
        .query_row(
            &format!(
                "SELECT {} FROM waitlists WHERE id = ? AND org_id = ?",
                WAITLIST_COLUMNS
            ),
            (id, ctx.org_id),
            waitlist_json,
        )
        .optional()
        .map_err(query_err)?
        .ok_or_else(|| HandlerErr::not_found("waitlist"))
}

fn waitlists_list(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let mut stmt = ctx
        .conn
        .prepare(&format!(
            "SELECT {} FROM waitlists
             WHERE org_id = ? AND status = 'active'
             ORDER BY created_at DESC, rowid DESC",
            WAITLIST_COLUMNS
        ))
        .map_err(query_err)?;
    let mut rows = stmt
        .query_map([ctx.org_id], waitlist_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    for row in rows.iter_mut() {
        let id = row["id"].as_str().unwrap_or_default().to_string();
        row["consultationIds"] = json!(consultation_ids(ctx.conn, &id)?);
    }
    Ok(json!({ "waitlists": rows }))
}

fn waitlists_get(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let id = get_required_str(ctx.params, "id")?;
    let mut waitlist = load_waitlist(ctx, &id)?;
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT wc.consultation_id, wc.position, wc.notes, wc.created_at,
                    c.student_name, c.student_grade, c.parent_name, c.parent_phone, c.status
             FROM waitlist_consultations wc
             JOIN consultations c ON c.id = wc.consultation_id
             WHERE wc.waitlist_id = ?
             ORDER BY wc.position",
        )
        .map_err(query_err)?;
    let entries = stmt
        .query_map([&id], |r| {
            Ok(json!({
                "consultationId": r.get::<_, String>(0)?,
                "position": r.get::<_, i64>(1)?,
                "notes": r.get::<_, Option<String>>(2)?,
                "addedAt": r.get::<_, String>(3)?,
                "studentName": r.get::<_, String>(4)?,
                "studentGrade": r.get::<_, Option<String>>(5)?,
                "parentName": r.get::<_, String>(6)?,
                "parentPhone": r.get::<_, String>(7)?,
                "status": r.get::<_, String>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    waitlist["consultationIds"] = json!(entries
        .iter()
        .map(|e| e["consultationId"].clone())
        .collect::<Vec<_>>());
    waitlist["consultations"] = json!(entries);
    Ok(json!({ "waitlist": waitlist }))
}

fn check_status(status: &str) -> Result<(), HandlerErr> {
    if status != "active" && status != "archived" {
        return Err(HandlerErr::bad_params("status must be one of: active, archived"));
    }
    Ok(())
}

fn waitlists_create(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let name = get_required_str(ctx.params, "name")?;
    let id = new_id();
    ctx.conn
        .execute(
            "INSERT INTO waitlists(id, org_id, name, description, status, consultation_count, created_at)
             VALUES(?, ?, ?, ?, 'active', 0, ?)",
            (
                &id,
                ctx.org_id,
                &name,
                get_optional_str(ctx.params, "description")?,
                now_stored(),
            ),
        )
        .map_err(insert_err("waitlists"))?;
    let mut waitlist = load_waitlist(ctx, &id)?;
    waitlist["consultationIds"] = json!([]);
    Ok(json!({ "waitlist": waitlist }))
}

fn waitlists_update(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let id = get_required_str(ctx.params, "id")?;
    load_waitlist(ctx, &id)?;
    let mut patch = Patch::default();
    patch.required_text(ctx.params, "name", "name")?;
    patch.text(ctx.params, "description", "description")?;
    if let Some(status) = get_optional_str(ctx.params, "status")? {
        check_status(&status)?;
        patch.set("status", status);
    }
    patch.execute(
        ctx.conn,
        "waitlists",
        "id = ? AND org_id = ?",
        vec![id.clone().into(), ctx.org_id.to_string().into()],
    )?;
    let mut waitlist = load_waitlist(ctx, &id)?;
    waitlist["consultationIds"] = json!(consultation_ids(ctx.conn, &id)?);
    Ok(json!({ "waitlist": waitlist }))
}

fn waitlists_delete(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let id = get_required_str(ctx.params, "id")?;
    load_waitlist(ctx, &id)?;
    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    tx.execute("DELETE FROM waitlist_consultations WHERE waitlist_id = ?", [&id])
        .map_err(delete_err("waitlist_consultations"))?;
    tx.execute("DELETE FROM waitlists WHERE id = ?", [&id])
        .map_err(delete_err("waitlists"))?;
    tx.commit().map_err(commit_err)?;
    Ok(json!({ "ok": true }))
}

fn add_consultation(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let waitlist_id = get_required_str(ctx.params, "waitlistId")?;
    let consultation_id = get_required_str(ctx.params, "consultationId")?;
    let notes = get_optional_str(ctx.params, "notes")?;
    load_waitlist(ctx, &waitlist_id)?;
    if !exists(
        ctx.conn,
        "SELECT 1 FROM consultations WHERE id = ? AND org_id = ?",
        (&consultation_id, ctx.org_id),
    )? {
        return Err(HandlerErr::not_found("consultation"));
    }
    if is_member(ctx.conn, &waitlist_id, &consultation_id)? {
        return Err(HandlerErr::conflict("consultation is already on this waitlist")
            .with_details(json!({ "waitlistId": waitlist_id, "consultationId": consultation_id })));
    }
    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    let position = append(&tx, &waitlist_id, &consultation_id, notes.as_deref())?;
    tx.commit().map_err(commit_err)?;
    let waitlist = load_waitlist(ctx, &waitlist_id)?;
    Ok(json!({
        "position": position,
        "consultationCount": waitlist["consultationCount"],
    }))
}

fn remove_consultation(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let waitlist_id = get_required_str(ctx.params, "waitlistId")?;
    let consultation_id = get_required_str(ctx.params, "consultationId")?;
    load_waitlist(ctx, &waitlist_id)?;
    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    let n = tx
        .execute(
            "DELETE FROM waitlist_consultations WHERE waitlist_id = ? AND consultation_id = ?",
            (&waitlist_id, &consultation_id),
        )
        .map_err(delete_err("waitlist_consultations"))?;
    if n == 0 {
        return Err(HandlerErr::not_found("waitlist entry"));
    }
    refresh_count(&tx, &waitlist_id)?;
    tx.commit().map_err(commit_err)?;
    let waitlist = load_waitlist(ctx, &waitlist_id)?;
    Ok(json!({ "consultationCount": waitlist["consultationCount"] }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "waitlists.list" => Some(run_org(state, req, waitlists_list)),
        "waitlists.get" => Some(run_org(state, req, waitlists_get)),
        "waitlists.create" => Some(run_org(state, req, waitlists_create)),
        "waitlists.update" => Some(run_org(state, req, waitlists_update)),
        "waitlists.delete" => Some(run_org(state, req, waitlists_delete)),
        "waitlists.addConsultation" => Some(run_org(state, req, add_consultation)),
        "waitlists.removeConsultation" => Some(run_org(state, req, remove_consultation)),
        _ => None,
    }
}
