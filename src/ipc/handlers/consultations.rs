use crate::consultation::{plan_transition, valid_email, ConsultationStatus};
use crate::ipc::handlers::activity::{self, Activity};
use crate::ipc::handlers::{setup, waitlists};
use crate::ipc::helpers::{
    commit_err, delete_err, get_optional_bool, get_optional_date, get_optional_str,
    get_required_str, has_key, insert_err, json_array_column, new_id, now_stored, query_err,
    run_org, tx_err, update_err, HandlerErr, OrgCtx, Patch,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule;
use rusqlite::{OptionalExtension, Row};
use serde_json::{json, Value};

const CONSULTATION_COLUMNS: &str = "id, student_name, student_grade, parent_name, parent_phone,
     parent_email, goals, preferred_times, scheduled_date, status, notes, result,
     enrolled_date, images_json, created_at, updated_at";

fn consultation_json(r: &Row) -> rusqlite::Result<Value> {
    let images: String = r.get(13)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentName": r.get::<_, String>(1)?,
        "studentGrade": r.get::<_, Option<String>>(2)?,
        "parentName": r.get::<_, String>(3)?,
        "parentPhone": r.get::<_, String>(4)?,
        "parentEmail": r.get::<_, Option<String>>(5)?,
        "goals": r.get::<_, Option<String>>(6)?,
        "preferredTimes": r.get::<_, Option<String>>(7)?,
        "scheduledDate": r.get::<_, Option<String>>(8)?,
        "status": r.get::<_, String>(9)?,
        "notes": r.get::<_, Option<String>>(10)?,
        "result": r.get::<_, Option<String>>(11)?,
        "enrolledDate": r.get::<_, Option<String>>(12)?,
        "images": json_array_column(&images),
        "createdAt": r.get::<_, String>(14)?,
        "updatedAt": r.get::<_, String>(15)?,
    }))
}

fn load_consultation(ctx: &OrgCtx, id: &str) -> Result<Value, HandlerErr> {
    ctx.conn
        .query_row(
            &format!(
                "SELECT {} FROM consultations WHERE id = ? AND org_id = ?",
                CONSULTATION_COLUMNS
            ),
            (id, ctx.org_id),
            consultation_json,
        )
        .optional()
        .map_err(query_err)?
        .ok_or_else(|| HandlerErr::not_found("consultation"))
}

fn parse_status(raw: &str) -> Result<ConsultationStatus, HandlerErr> {
    ConsultationStatus::parse(raw).ok_or_else(|| {
        HandlerErr::bad_params(
            "status must be one of: new, scheduled, enrolled, rejected, on_hold, waitlist",
        )
    })
}

fn parse_email(params: &Value) -> Result<Option<String>, HandlerErr> {
    let email = get_optional_str(params, "parentEmail")?;
    if let Some(e) = email.as_deref() {
        if !valid_email(e) {
            return Err(HandlerErr::bad_params("parentEmail is not a valid address"));
        }
    }
    Ok(email)
}

/// Scheduled consultations carry either a date or a full timestamp.
fn parse_scheduled(params: &Value) -> Result<Option<String>, HandlerErr> {
    let raw = get_optional_str(params, "scheduledDate")?;
    if let Some(s) = raw.as_deref() {
        if schedule::parse_date(s).is_none() && schedule::parse_instant(s).is_none() {
            return Err(HandlerErr::bad_params(
                "scheduledDate must be YYYY-MM-DD or an RFC 3339 timestamp",
            ));
        }
    }
    Ok(raw)
}

fn parse_images(params: &Value) -> Result<Option<String>, HandlerErr> {
    match params.get("images") {
        None => Ok(None),
        Some(Value::Null) => Ok(Some("[]".to_string())),
        Some(Value::Array(items)) => {
            if items.iter().any(|v| !v.is_string()) {
                return Err(HandlerErr::bad_params("images must contain strings"));
            }
            Ok(Some(Value::Array(items.clone()).to_string()))
        }
        Some(_) => Err(HandlerErr::bad_params("images must be an array")),
    }
}

fn local_today(ctx: &OrgCtx) -> Result<String, HandlerErr> {
    let offset = setup::attendance_settings(ctx.conn, ctx.org_id)?.utc_offset_minutes;
    Ok(schedule::local_time(chrono::Utc::now(), offset)
        .format("%Y-%m-%d")
        .to_string())
}

fn consultations_list(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let status = match get_optional_str(ctx.params, "status")? {
        Some(s) => Some(parse_status(&s)?.as_str()),
        None => None,
    };
    let mut stmt = ctx
        .conn
        .prepare(&format!(
            "SELECT {} FROM consultations
             WHERE org_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC, rowid DESC",
            CONSULTATION_COLUMNS
        ))
        .map_err(query_err)?;
    let rows = stmt
        .query_map((ctx.org_id, status), consultation_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "consultations": rows }))
}

fn consultations_get(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let id = get_required_str(ctx.params, "id")?;
    Ok(json!({ "consultation": load_consultation(ctx, &id)? }))
}

fn consultations_create(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let student_name = get_required_str(ctx.params, "studentName")?;
    let parent_name = get_required_str(ctx.params, "parentName")?;
    let parent_phone = get_required_str(ctx.params, "parentPhone")?;
    let status = match get_optional_str(ctx.params, "status")? {
        Some(s) => parse_status(&s)?,
        None => ConsultationStatus::New,
    };
    if status.is_guarded() {
        return Err(HandlerErr::bad_params(format!(
            "a new consultation cannot start as {}; use consultations.setStatus",
            status.as_str()
        ))
        .with_details(json!({ "status": status.as_str() })));
    }
    let images = parse_images(ctx.params)?.unwrap_or_else(|| "[]".to_string());
    let id = new_id();
    let now = now_stored();
    ctx.conn
        .execute(
            "INSERT INTO consultations(
                id, org_id, student_name, student_grade, parent_name, parent_phone,
                parent_email, goals, preferred_times, scheduled_date, status, notes,
                result, images_json, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                &id,
                ctx.org_id,
                &student_name,
                get_optional_str(ctx.params, "studentGrade")?,
                &parent_name,
                &parent_phone,
                parse_email(ctx.params)?,
                get_optional_str(ctx.params, "goals")?,
                get_optional_str(ctx.params, "preferredTimes")?,
                parse_scheduled(ctx.params)?,
                status.as_str(),
                get_optional_str(ctx.params, "notes")?,
                get_optional_str(ctx.params, "result")?,
                &images,
                &now,
                &now,
            ],
        )
        .map_err(insert_err("consultations"))?;
    activity::record(
        ctx.conn,
        ctx.org_id,
        ctx.actor,
        Activity {
            action: "create",
            entity_type: "consultation",
            entity_id: &id,
            entity_name: &student_name,
            description: format!("상담 등록: {}", student_name),
        },
    )?;
    Ok(json!({ "consultation": load_consultation(ctx, &id)? }))
}

fn consultations_update(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let id = get_required_str(ctx.params, "id")?;
    let current = load_consultation(ctx, &id)?;
    if has_key(ctx.params, "status") {
        return Err(HandlerErr::bad_params(
            "use consultations.setStatus to change status",
        ));
    }
    let mut patch = Patch::default();
    patch.required_text(ctx.params, "studentName", "student_name")?;
    patch.text(ctx.params, "studentGrade", "student_grade")?;
    patch.required_text(ctx.params, "parentName", "parent_name")?;
    patch.required_text(ctx.params, "parentPhone", "parent_phone")?;
    if has_key(ctx.params, "parentEmail") {
        patch.set("parent_email", parse_email(ctx.params)?);
    }
    patch.text(ctx.params, "goals", "goals")?;
    patch.text(ctx.params, "preferredTimes", "preferred_times")?;
    if has_key(ctx.params, "scheduledDate") {
        patch.set("scheduled_date", parse_scheduled(ctx.params)?);
    }
    patch.text(ctx.params, "notes", "notes")?;
    patch.text(ctx.params, "result", "result")?;
    patch.date(ctx.params, "enrolledDate", "enrolled_date")?;
    if let Some(images) = parse_images(ctx.params)? {
        patch.set("images_json", images);
    }
    if patch.is_empty() {
        return Ok(json!({ "consultation": current }));
    }
    patch.set("updated_at", now_stored());

    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    patch.execute(
        &tx,
        "consultations",
        "id = ? AND org_id = ?",
        vec![id.clone().into(), ctx.org_id.to_string().into()],
    )?;
    let name = current["studentName"].as_str().unwrap_or_default();
    activity::record(
        &tx,
        ctx.org_id,
        ctx.actor,
        Activity {
            action: "update",
            entity_type: "consultation",
            entity_id: &id,
            entity_name: name,
            description: format!("상담 정보 수정: {}", name),
        },
    )?;
    tx.commit().map_err(commit_err)?;
    Ok(json!({ "consultation": load_consultation(ctx, &id)? }))
}

fn consultations_delete(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let id = get_required_str(ctx.params, "id")?;
    let current = load_consultation(ctx, &id)?;
    let name = current["studentName"].as_str().unwrap_or_default();
    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    waitlists::remove_everywhere(&tx, &id)?;
    tx.execute("DELETE FROM consultations WHERE id = ?", [&id])
        .map_err(delete_err("consultations"))?;
    activity::record(
        &tx,
        ctx.org_id,
        ctx.actor,
        Activity {
            action: "delete",
            entity_type: "consultation",
            entity_id: &id,
            entity_name: name,
            description: format!("상담 삭제: {}", name),
        },
    )?;
    tx.commit().map_err(commit_err)?;
    Ok(json!({ "ok": true }))
}

fn consultations_set_status(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let id = get_required_str(ctx.params, "id")?;
    let target = parse_status(&get_required_str(ctx.params, "status")?)?;
    let confirmed = get_optional_bool(ctx.params, "confirm")?.unwrap_or(false);
    let waitlist_id = get_optional_str(ctx.params, "waitlistId")?;
    let enrolled_date = get_optional_date(ctx.params, "enrolledDate")?;

    let current = load_consultation(ctx, &id)?;
    let previous_raw = current["status"].as_str().unwrap_or("new").to_string();
    let previous = ConsultationStatus::parse(&previous_raw).unwrap_or(ConsultationStatus::New);
    let plan = plan_transition(previous, target, waitlist_id.is_some());

    if waitlist_id.is_some() && target != ConsultationStatus::Waitlist {
        return Err(HandlerErr::bad_params("waitlistId is only valid with status waitlist"));
    }
    if plan.needs_confirmation && !confirmed {
        return Err(HandlerErr::new(
            "confirmation_required",
            format!("moving to {} must be confirmed", target.label()),
        )
        .with_details(json!({
            "currentStatus": previous.as_str(),
            "targetStatus": target.as_str(),
        })));
    }
    if let Some(wid) = waitlist_id.as_deref() {
        if !waitlists::waitlist_in_org(ctx.conn, ctx.org_id, wid)? {
            return Err(HandlerErr::not_found("waitlist"));
        }
    }

    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    let now = now_stored();
    if plan.stamp_enrolled_date {
        let date = match enrolled_date
            .or_else(|| current["enrolledDate"].as_str().map(str::to_string))
        {
            Some(d) => d,
            None => local_today(ctx)?,
        };
        tx.execute(
            "UPDATE consultations SET status = ?, enrolled_date = ?, updated_at = ? WHERE id = ?",
            (target.as_str(), &date, &now, &id),
        )
        .map_err(update_err("consultations"))?;
    } else {
        tx.execute(
            "UPDATE consultations SET status = ?, updated_at = ? WHERE id = ?",
            (target.as_str(), &now, &id),
        )
        .map_err(update_err("consultations"))?;
    }

    let mut left: Vec<String> = Vec::new();
    if plan.leave_waitlists {
        left = waitlists::remove_everywhere(&tx, &id)?;
    }
    let mut joined: Option<i64> = None;
    if plan.join_waitlist {
        if let Some(wid) = waitlist_id.as_deref() {
            if !waitlists::is_member(&tx, wid, &id)? {
                joined = Some(waitlists::append(&tx, wid, &id, None)?);
            }
        }
    }

    let name = current["studentName"].as_str().unwrap_or_default();
    activity::record(
        &tx,
        ctx.org_id,
        ctx.actor,
        Activity {
            action: "status_change",
            entity_type: "consultation",
            entity_id: &id,
            entity_name: name,
            description: format!(
                "상담 상태 변경: {} ({} → {})",
                name,
                previous.label(),
                target.label()
            ),
        },
    )?;
    tx.commit().map_err(commit_err)?;

    Ok(json!({
        "consultation": load_consultation(ctx, &id)?,
        "previousStatus": previous_raw,
        "leftWaitlists": left,
        "waitlistPosition": joined,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "consultations.list" => Some(run_org(state, req, consultations_list)),
        "consultations.get" => Some(run_org(state, req, consultations_get)),
        "consultations.create" => Some(run_org(state, req, consultations_create)),
        "consultations.update" => Some(run_org(state, req, consultations_update)),
        "consultations.delete" => Some(run_org(state, req, consultations_delete)),
        "consultations.setStatus" => Some(run_org(state, req, consultations_set_status)),
        _ => None,
    }
}
