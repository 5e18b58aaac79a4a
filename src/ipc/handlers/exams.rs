use crate::grading::{self, RosterEntry};
use crate::ipc::helpers::{
    commit_err, delete_err, get_optional_date, get_optional_i64, get_optional_str,
    get_required_date, get_required_i64, get_required_str, insert_err, new_id, now_stored,
    query_err, run_org, tx_err, update_err, HandlerErr, OrgCtx, Patch,
};
use crate::ipc::handlers::students::student_name;
use crate::ipc::types::{AppState, Request};
use crate::schedule;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use std::collections::HashSet;

const EXAM_STATUSES: [&str; 4] = ["scheduled", "in_progress", "completed", "cancelled"];

const EXAM_COLUMNS: &str = "id, title, subject, description, class_id, exam_date, exam_time, \
                            max_score, status, created_at, updated_at";

fn exam_json(r: &Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "title": r.get::<_, String>(1)?,
        "subject": r.get::<_, Option<String>>(2)?,
        "description": r.get::<_, Option<String>>(3)?,
        "classId": r.get::<_, Option<String>>(4)?,
        "examDate": r.get::<_, String>(5)?,
        "examTime": r.get::<_, Option<String>>(6)?,
        "maxScore": r.get::<_, i64>(7)?,
        "status": r.get::<_, String>(8)?,
        "createdAt": r.get::<_, String>(9)?,
        "updatedAt": r.get::<_, String>(10)?,
    }))
}

struct ExamHead {
    max_score: i64,
    class_id: Option<String>,
}

fn exam_head(conn: &Connection, org_id: &str, exam_id: &str) -> Result<ExamHead, HandlerErr> {
    conn.query_row(
        "SELECT max_score, class_id FROM exams WHERE id = ? AND org_id = ?",
        (exam_id, org_id),
        |r| {
            Ok(ExamHead {
                max_score: r.get(0)?,
                class_id: r.get(1)?,
            })
        },
    )
    .optional()
    .map_err(query_err)?
    .ok_or_else(|| HandlerErr::not_found("exam"))
}

fn load_exam(ctx: &OrgCtx, id: &str) -> Result<Value, HandlerErr> {
    ctx.conn
        .query_row(
            &format!("SELECT {} FROM exams WHERE id = ? AND org_id = ?", EXAM_COLUMNS),
            (id, ctx.org_id),
            exam_json,
        )
        .optional()
        .map_err(query_err)?
        .ok_or_else(|| HandlerErr::not_found("exam"))
}

fn parse_exam_status(raw: &str) -> Result<String, HandlerErr> {
    if !EXAM_STATUSES.contains(&raw) {
        return Err(HandlerErr::bad_params(format!(
            "status must be one of: {}",
            EXAM_STATUSES.join(", ")
        )));
    }
    Ok(raw.to_string())
}

fn parse_exam_time(params: &Value) -> Result<Option<String>, HandlerErr> {
    let t = get_optional_str(params, "examTime")?;
    if let Some(s) = t.as_deref() {
        if schedule::parse_time_of_day(s).is_none() {
            return Err(HandlerErr::bad_params("examTime must be HH:MM"));
        }
    }
    Ok(t)
}

fn check_class(ctx: &OrgCtx, class_id: &str) -> Result<(), HandlerErr> {
    let found = ctx
        .conn
        .query_row(
            "SELECT 1 FROM classes WHERE id = ? AND org_id = ?",
            (class_id, ctx.org_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(query_err)?;
    if found.is_none() {
        return Err(HandlerErr::not_found("class"));
    }
    Ok(())
}

fn exams_list(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let exam_date = get_optional_date(ctx.params, "examDate")?;
    let mut sql = format!("SELECT {} FROM exams WHERE org_id = ?", EXAM_COLUMNS);
    let mut binds: Vec<String> = vec![ctx.org_id.to_string()];
    if let Some(d) = exam_date {
        sql.push_str(" AND exam_date = ?");
        binds.push(d);
    }
    sql.push_str(" ORDER BY exam_date DESC, exam_time DESC, created_at DESC");
    let mut stmt = ctx.conn.prepare(&sql).map_err(query_err)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), exam_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "exams": rows }))
}

fn exams_get(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let id = get_required_str(ctx.params, "id")?;
    Ok(json!({ "exam": load_exam(ctx, &id)? }))
}

fn exams_create(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let title = get_required_str(ctx.params, "title")?;
    let exam_date = get_required_date(ctx.params, "examDate")?;
    let max_score = get_optional_i64(ctx.params, "maxScore")?.unwrap_or(100);
    if max_score <= 0 {
        return Err(HandlerErr::bad_params("maxScore must be positive"));
    }
    let status = match get_optional_str(ctx.params, "status")? {
        Some(s) => parse_exam_status(&s)?,
        None => "scheduled".to_string(),
    };
    let class_id = get_optional_str(ctx.params, "classId")?;
    if let Some(cid) = class_id.as_deref() {
        check_class(ctx, cid)?;
    }
    let id = new_id();
    let now = now_stored();
    ctx.conn
        .execute(
            "INSERT INTO exams(id, org_id, title, subject, description, class_id, exam_date,
                               exam_time, max_score, status, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                id,
                ctx.org_id,
                title,
                get_optional_str(ctx.params, "subject")?,
                get_optional_str(ctx.params, "description")?,
                class_id,
                exam_date,
                parse_exam_time(ctx.params)?,
                max_score,
                status,
                now,
                now,
            ],
        )
        .map_err(insert_err("exams"))?;
    Ok(json!({ "exam": load_exam(ctx, &id)? }))
}

fn exams_update(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let id = get_required_str(ctx.params, "id")?;
    load_exam(ctx, &id)?;
    let mut patch = Patch::default();
    patch.required_text(ctx.params, "title", "title")?;
    patch.text(ctx.params, "subject", "subject")?;
    patch.text(ctx.params, "description", "description")?;
    if ctx.params.get("classId").is_some() {
        let class_id = get_optional_str(ctx.params, "classId")?;
        if let Some(cid) = class_id.as_deref() {
            check_class(ctx, cid)?;
        }
        patch.set("class_id", class_id);
    }
    if ctx.params.get("examDate").is_some() {
        patch.set("exam_date", get_required_date(ctx.params, "examDate")?);
    }
    if ctx.params.get("examTime").is_some() {
        patch.set("exam_time", parse_exam_time(ctx.params)?);
    }
    if let Some(max_score) = get_optional_i64(ctx.params, "maxScore")? {
        if max_score <= 0 {
            return Err(HandlerErr::bad_params("maxScore must be positive"));
        }
        let above: i64 = ctx
            .conn
            .query_row(
                "SELECT COUNT(*) FROM exam_scores WHERE exam_id = ? AND score > ?",
                (&id, max_score),
                |r| r.get(0),
            )
            .map_err(query_err)?;
        if above > 0 {
            return Err(HandlerErr::conflict(
                "existing scores exceed the new maxScore",
            ));
        }
        patch.set("max_score", max_score);
    }
    if let Some(s) = get_optional_str(ctx.params, "status")? {
        patch.set("status", parse_exam_status(&s)?);
    }
    if !patch.is_empty() {
        patch.set("updated_at", now_stored());
        patch.execute(
            ctx.conn,
            "exams",
            "id = ? AND org_id = ?",
            vec![id.clone().into(), ctx.org_id.to_string().into()],
        )?;
    }
    Ok(json!({ "exam": load_exam(ctx, &id)? }))
}

fn exams_delete(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let id = get_required_str(ctx.params, "id")?;
    exam_head(ctx.conn, ctx.org_id, &id)?;
    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    tx.execute("DELETE FROM exam_scores WHERE exam_id = ?", [&id])
        .map_err(delete_err("exam_scores"))?;
    tx.execute("DELETE FROM exams WHERE id = ?", [&id])
        .map_err(delete_err("exams"))?;
    tx.commit().map_err(commit_err)?;
    Ok(json!({ "ok": true }))
}

fn score_rows(conn: &Connection, exam_id: &str) -> Result<Vec<Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.student_id, st.name, s.score, s.notes, s.updated_at
             FROM exam_scores s
             JOIN students st ON st.id = s.student_id
             WHERE s.exam_id = ?
             ORDER BY st.name, s.student_id",
        )
        .map_err(query_err)?;
    let rows = stmt
        .query_map([exam_id], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "studentName": r.get::<_, String>(2)?,
                "score": r.get::<_, i64>(3)?,
                "notes": r.get::<_, Option<String>>(4)?,
                "updatedAt": r.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(rows)
}

fn scores_get(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let exam_id = get_required_str(ctx.params, "examId")?;
    exam_head(ctx.conn, ctx.org_id, &exam_id)?;
    Ok(json!({ "scores": score_rows(ctx.conn, &exam_id)? }))
}

fn check_score(score: i64, max_score: i64) -> Result<(), HandlerErr> {
    if score < 0 || score > max_score {
        return Err(HandlerErr::bad_params(format!(
            "score must be in 0..={}",
            max_score
        ))
        .with_details(json!({ "score": score, "maxScore": max_score })));
    }
    Ok(())
}

fn upsert_score(
    conn: &Connection,
    exam_id: &str,
    student_id: &str,
    score: i64,
    notes: Option<&str>,
    now: &str,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO exam_scores(id, exam_id, student_id, score, notes, updated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(exam_id, student_id) DO UPDATE SET
           score = excluded.score,
           notes = excluded.notes,
           updated_at = excluded.updated_at",
        (new_id(), exam_id, student_id, score, notes, now),
    )
    .map_err(insert_err("exam_scores"))?;
    Ok(())
}

/// Replaces every score of the exam. Validation happens before any write.
fn scores_save(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let exam_id = get_required_str(ctx.params, "examId")?;
    let head = exam_head(ctx.conn, ctx.org_id, &exam_id)?;
    let Some(items) = ctx.params.get("scores").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("scores must be an array"));
    };

    let mut parsed: Vec<(String, i64, Option<String>)> = Vec::with_capacity(items.len());
    let mut seen: HashSet<String> = HashSet::new();
    for item in items {
        let student_id = get_required_str(item, "studentId")?;
        let score = get_required_i64(item, "score")?;
        check_score(score, head.max_score)?;
        if !seen.insert(student_id.clone()) {
            return Err(HandlerErr::bad_params("duplicate studentId in scores")
                .with_details(json!({ "studentId": student_id })));
        }
        if student_name(ctx.conn, ctx.org_id, &student_id)?.is_none() {
            return Err(HandlerErr::not_found("student")
                .with_details(json!({ "studentId": student_id })));
        }
        parsed.push((student_id, score, get_optional_str(item, "notes")?));
    }

    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    tx.execute("DELETE FROM exam_scores WHERE exam_id = ?", [&exam_id])
        .map_err(delete_err("exam_scores"))?;
    let now = now_stored();
    for (student_id, score, notes) in &parsed {
        upsert_score(&tx, &exam_id, student_id, *score, notes.as_deref(), &now)?;
    }
    tx.commit().map_err(commit_err)?;
    Ok(json!({ "saved": parsed.len(), "scores": score_rows(ctx.conn, &exam_id)? }))
}

fn roster_entry(r: &Row) -> rusqlite::Result<RosterEntry> {
    Ok(RosterEntry {
        id: r.get(0)?,
        name: r.get(1)?,
    })
}

/// Active students eligible for the exam, in registration order.
/// A class exam only matches students actively enrolled in that class.
fn roster(ctx: &OrgCtx, head: &ExamHead) -> Result<Vec<RosterEntry>, HandlerErr> {
    let rows = match head.class_id.as_deref() {
        Some(class_id) => {
            let mut stmt = ctx
                .conn
                .prepare(
                    "SELECT s.id, s.name FROM students s
                     JOIN class_enrollments e ON e.student_id = s.id
                     WHERE s.org_id = ? AND e.class_id = ? AND e.status = 'active'
                       AND s.status = 'active'
                     ORDER BY s.created_at, s.id",
                )
                .map_err(query_err)?;
            let rows = stmt
                .query_map((ctx.org_id, class_id), roster_entry)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(query_err)?;
            rows
        }
        None => {
            let mut stmt = ctx
                .conn
                .prepare(
                    "SELECT id, name FROM students
                     WHERE org_id = ? AND status = 'active'
                     ORDER BY created_at, id",
                )
                .map_err(query_err)?;
            let rows = stmt
                .query_map([ctx.org_id], roster_entry)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(query_err)?;
            rows
        }
    };
    Ok(rows)
}

struct BulkPlan {
    matched: Vec<grading::MatchedScore>,
    unmatched: Vec<grading::ParsedScore>,
    unparsed: Vec<grading::UnparsedLine>,
}

fn bulk_plan(ctx: &OrgCtx, head: &ExamHead) -> Result<BulkPlan, HandlerErr> {
    let Some(text) = ctx.params.get("text").and_then(|v| v.as_str()) else {
        return Err(HandlerErr::bad_params("missing text"));
    };
    let parse = grading::parse_bulk_scores(text);
    let outcome = grading::match_roster(&parse.rows, &roster(ctx, head)?);
    Ok(BulkPlan {
        matched: outcome.matched,
        unmatched: outcome.unmatched,
        unparsed: parse.unparsed,
    })
}

fn bulk_json(plan: &BulkPlan) -> Value {
    json!({
        "matched": plan.matched,
        "unmatched": plan.unmatched,
        "unparsed": plan.unparsed,
    })
}

fn scores_bulk_preview(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let exam_id = get_required_str(ctx.params, "examId")?;
    let head = exam_head(ctx.conn, ctx.org_id, &exam_id)?;
    let plan = bulk_plan(ctx, &head)?;
    Ok(bulk_json(&plan))
}

fn scores_bulk_apply(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let exam_id = get_required_str(ctx.params, "examId")?;
    let head = exam_head(ctx.conn, ctx.org_id, &exam_id)?;
    let plan = bulk_plan(ctx, &head)?;
    if plan.matched.is_empty() {
        return Err(HandlerErr::bad_params("no lines matched a student")
            .with_details(bulk_json(&plan)));
    }
    for m in &plan.matched {
        check_score(m.score, head.max_score)
            .map_err(|e| e.with_details(json!({ "lineNo": m.line_no, "studentName": m.student_name })))?;
    }

    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    let now = now_stored();
    for m in &plan.matched {
        upsert_score(&tx, &exam_id, &m.student_id, m.score, m.feedback.as_deref(), &now)?;
    }
    tx.execute(
        "UPDATE exams SET updated_at = ? WHERE id = ?",
        (&now, &exam_id),
    )
    .map_err(update_err("exams"))?;
    tx.commit().map_err(commit_err)?;

    let mut out = bulk_json(&plan);
    out["applied"] = json!(plan.matched.len());
    Ok(out)
}

fn exams_stats(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let exam_id = get_required_str(ctx.params, "examId")?;
    let head = exam_head(ctx.conn, ctx.org_id, &exam_id)?;
    let mut stmt = ctx
        .conn
        .prepare("SELECT score FROM exam_scores WHERE exam_id = ?")
        .map_err(query_err)?;
    let scores = stmt
        .query_map([&exam_id], |r| r.get::<_, i64>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    let stats = grading::exam_stats(&scores, head.max_score);
    Ok(json!({ "examId": exam_id, "maxScore": head.max_score, "stats": stats }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exams.list" => Some(run_org(state, req, exams_list)),
        "exams.get" => Some(run_org(state, req, exams_get)),
        "exams.create" => Some(run_org(state, req, exams_create)),
        "exams.update" => Some(run_org(state, req, exams_update)),
        "exams.delete" => Some(run_org(state, req, exams_delete)),
        "exams.scores.get" => Some(run_org(state, req, scores_get)),
        "exams.scores.save" => Some(run_org(state, req, scores_save)),
        "exams.scores.bulkPreview" => Some(run_org(state, req, scores_bulk_preview)),
        "exams.scores.bulkApply" => Some(run_org(state, req, scores_bulk_apply)),
        "exams.stats" => Some(run_org(state, req, exams_stats)),
        _ => None,
    }
}
