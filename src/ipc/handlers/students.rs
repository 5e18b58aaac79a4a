use crate::ipc::helpers::{
    commit_err, delete_err, get_optional_i64, get_optional_str, get_required_str, insert_err,
    new_id, now_stored, query_err, run_org, tx_err, HandlerErr, OrgCtx, Patch,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{self, WEEKDAY_KEYS};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};

const STUDENT_STATUSES: [&str; 3] = ["active", "paused", "withdrawn"];
const PASS_TYPES: [&str; 2] = ["period", "hours"];

const STUDENT_COLUMNS: &str =
    "id, name, grade, student_code, parent_phone, status, pass_type, remaining_minutes, created_at";

fn student_json(r: &Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "grade": r.get::<_, Option<String>>(2)?,
        "studentCode": r.get::<_, Option<String>>(3)?,
        "parentPhone": r.get::<_, Option<String>>(4)?,
        "status": r.get::<_, String>(5)?,
        "passType": r.get::<_, String>(6)?,
        "remainingMinutes": r.get::<_, Option<i64>>(7)?,
        "createdAt": r.get::<_, String>(8)?,
    }))
}

/// Display name of a student in this organization, if any.
pub fn student_name(conn: &Connection, org_id: &str, student_id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT name FROM students WHERE id = ? AND org_id = ?",
        (student_id, org_id),
        |r| r.get(0),
    )
    .optional()
    .map_err(query_err)
}

pub fn require_student(conn: &Connection, org_id: &str, student_id: &str) -> Result<String, HandlerErr> {
    student_name(conn, org_id, student_id)?.ok_or_else(|| HandlerErr::not_found("student"))
}

fn load_student(ctx: &OrgCtx, id: &str) -> Result<Value, HandlerErr> {
    ctx.conn
        .query_row(
            &format!(
                "SELECT {} FROM students WHERE id = ? AND org_id = ?",
                STUDENT_COLUMNS
            ),
            (id, ctx.org_id),
            student_json,
        )
        .optional()
        .map_err(query_err)?
        .ok_or_else(|| HandlerErr::not_found("student"))
}

fn check_one_of(value: &str, key: &str, allowed: &[&str]) -> Result<(), HandlerErr> {
    if !allowed.contains(&value) {
        return Err(HandlerErr::bad_params(format!(
            "{} must be one of: {}",
            key,
            allowed.join(", ")
        )));
    }
    Ok(())
}

fn check_minutes(v: Option<i64>) -> Result<Option<i64>, HandlerErr> {
    if let Some(m) = v {
        if m < 0 {
            return Err(HandlerErr::bad_params("remainingMinutes must be >= 0"));
        }
    }
    Ok(v)
}

fn students_list(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let search = get_optional_str(ctx.params, "search")?.map(|s| format!("%{}%", s));
    let status = get_optional_str(ctx.params, "status")?;
    let mut stmt = ctx
        .conn
        .prepare(&format!(
            "SELECT {} FROM students
             WHERE org_id = ?1
               AND (?2 IS NULL OR name LIKE ?2 OR student_code LIKE ?2 OR parent_phone LIKE ?2)
               AND (?3 IS NULL OR status = ?3)
             ORDER BY name, rowid",
            STUDENT_COLUMNS
        ))
        .map_err(query_err)?;
    let rows = stmt
        .query_map((ctx.org_id, &search, &status), student_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "students": rows }))
}

fn students_create(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let name = get_required_str(ctx.params, "name")?;
    let pass_type = get_optional_str(ctx.params, "passType")?.unwrap_or_else(|| "period".into());
    check_one_of(&pass_type, "passType", &PASS_TYPES)?;
    let remaining = check_minutes(get_optional_i64(ctx.params, "remainingMinutes")?)?;
    let id = new_id();
    ctx.conn
        .execute(
            "INSERT INTO students(
                id, org_id, name, grade, student_code, parent_phone, status,
                pass_type, remaining_minutes, created_at)
             VALUES(?, ?, ?, ?, ?, ?, 'active', ?, ?, ?)",
            (
                &id,
                ctx.org_id,
                &name,
                get_optional_str(ctx.params, "grade")?,
                get_optional_str(ctx.params, "studentCode")?,
                get_optional_str(ctx.params, "parentPhone")?,
                &pass_type,
                remaining,
                now_stored(),
            ),
        )
        .map_err(insert_err("students"))?;
    Ok(json!({ "student": load_student(ctx, &id)? }))
}

fn students_update(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let id = get_required_str(ctx.params, "id")?;
    load_student(ctx, &id)?;
    let mut patch = Patch::default();
    patch.required_text(ctx.params, "name", "name")?;
    patch.text(ctx.params, "grade", "grade")?;
    patch.text(ctx.params, "studentCode", "student_code")?;
    patch.text(ctx.params, "parentPhone", "parent_phone")?;
    if let Some(status) = get_optional_str(ctx.params, "status")? {
        check_one_of(&status, "status", &STUDENT_STATUSES)?;
        patch.set("status", status);
    }
    if let Some(pass_type) = get_optional_str(ctx.params, "passType")? {
        check_one_of(&pass_type, "passType", &PASS_TYPES)?;
        patch.set("pass_type", pass_type);
    }
    if ctx.params.get("remainingMinutes").is_some() {
        patch.set(
            "remaining_minutes",
            check_minutes(get_optional_i64(ctx.params, "remainingMinutes")?)?,
        );
    }
    patch.execute(
        ctx.conn,
        "students",
        "id = ? AND org_id = ?",
        vec![id.clone().into(), ctx.org_id.to_string().into()],
    )?;
    Ok(json!({ "student": load_student(ctx, &id)? }))
}

const STUDENT_CASCADE: [(&str, &str); 11] = [
    ("commute_schedules", "DELETE FROM commute_schedules WHERE student_id = ?1"),
    ("teacher_students", "DELETE FROM teacher_students WHERE student_id = ?1"),
    ("class_enrollments", "DELETE FROM class_enrollments WHERE student_id = ?1"),
    ("exam_scores", "DELETE FROM exam_scores WHERE student_id = ?1"),
    ("attendance", "DELETE FROM attendance WHERE student_id = ?1"),
    ("attendance_logs", "DELETE FROM attendance_logs WHERE student_id = ?1"),
    ("seat_assignments", "DELETE FROM seat_assignments WHERE student_id = ?1"),
    ("sleep_records", "DELETE FROM sleep_records WHERE student_id = ?1"),
    ("outing_records", "DELETE FROM outing_records WHERE student_id = ?1"),
    ("call_records", "DELETE FROM call_records WHERE student_id = ?1"),
    ("students", "DELETE FROM students WHERE id = ?1"),
];

fn students_delete(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let id = get_required_str(ctx.params, "id")?;
    require_student(ctx.conn, ctx.org_id, &id)?;
    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    for (table, sql) in STUDENT_CASCADE {
        tx.execute(sql, [&id]).map_err(delete_err(table))?;
    }
    tx.commit().map_err(commit_err)?;
    Ok(json!({ "ok": true }))
}

fn schedules_for(conn: &Connection, student_id: &str) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, weekday, check_in_time, check_out_time, notes
             FROM commute_schedules WHERE student_id = ?",
        )
        .map_err(query_err)?;
    let mut rows = stmt
        .query_map([student_id], |r| {
            Ok((
                r.get::<_, String>(1)?,
                json!({
                    "id": r.get::<_, String>(0)?,
                    "weekday": r.get::<_, String>(1)?,
                    "checkInTime": r.get::<_, Option<String>>(2)?,
                    "checkOutTime": r.get::<_, Option<String>>(3)?,
                    "notes": r.get::<_, Option<String>>(4)?,
                }),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    rows.sort_by_key(|(day, _)| WEEKDAY_KEYS.iter().position(|k| k == day).unwrap_or(7));
    Ok(rows.into_iter().map(|(_, v)| v).collect())
}

fn commute_get(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(ctx.params, "studentId")?;
    require_student(ctx.conn, ctx.org_id, &student_id)?;
    Ok(json!({ "studentId": student_id, "schedules": schedules_for(ctx.conn, &student_id)? }))
}

struct CommuteRow {
    weekday: String,
    check_in: Option<String>,
    check_out: Option<String>,
    notes: Option<String>,
}

fn parse_commute_rows(v: Option<&Value>) -> Result<Vec<CommuteRow>, HandlerErr> {
    let Some(items) = v.and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("schedules must be an array"));
    };
    let mut out: Vec<CommuteRow> = Vec::new();
    for (i, item) in items.iter().enumerate() {
        let weekday = get_required_str(item, "weekday")
            .map_err(|e| HandlerErr::bad_params(format!("schedules[{}]: {}", i, e.message)))?
            .to_ascii_lowercase();
        let Some(day) = schedule::parse_weekday(&weekday) else {
            return Err(HandlerErr::bad_params(format!(
                "schedules[{}].weekday must be monday..sunday",
                i
            )));
        };
        let weekday = schedule::weekday_key(day).to_string();
        if out.iter().any(|r| r.weekday == weekday) {
            return Err(HandlerErr::bad_params(format!("duplicate weekday: {}", weekday)));
        }
        let mut times = [None, None];
        for (slot, key) in ["checkInTime", "checkOutTime"].iter().enumerate() {
            if let Some(t) = get_optional_str(item, key)? {
                if schedule::parse_time_of_day(&t).is_none() {
                    return Err(HandlerErr::bad_params(format!(
                        "schedules[{}].{} must be HH:MM or HH:MM:SS",
                        i, key
                    )));
                }
                times[slot] = Some(t);
            }
        }
        let [check_in, check_out] = times;
        out.push(CommuteRow {
            weekday,
            check_in,
            check_out,
            notes: get_optional_str(item, "notes")?,
        });
    }
    Ok(out)
}

fn commute_set(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(ctx.params, "studentId")?;
    require_student(ctx.conn, ctx.org_id, &student_id)?;
    let rows = parse_commute_rows(ctx.params.get("schedules"))?;

    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    tx.execute(
        "DELETE FROM commute_schedules WHERE student_id = ?",
        [&student_id],
    )
    .map_err(delete_err("commute_schedules"))?;
    for row in &rows {
        tx.execute(
            "INSERT INTO commute_schedules(
                id, org_id, student_id, weekday, check_in_time, check_out_time, notes)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                new_id(),
                ctx.org_id,
                &student_id,
                &row.weekday,
                &row.check_in,
                &row.check_out,
                &row.notes,
            ),
        )
        .map_err(insert_err("commute_schedules"))?;
    }
    tx.commit().map_err(commit_err)?;
    Ok(json!({ "studentId": student_id, "schedules": schedules_for(ctx.conn, &student_id)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(run_org(state, req, students_list)),
        "students.create" => Some(run_org(state, req, students_create)),
        "students.update" => Some(run_org(state, req, students_update)),
        "students.delete" => Some(run_org(state, req, students_delete)),
        "students.commuteSchedules.get" => Some(run_org(state, req, commute_get)),
        "students.commuteSchedules.set" => Some(run_org(state, req, commute_set)),
        _ => None,
    }
}
