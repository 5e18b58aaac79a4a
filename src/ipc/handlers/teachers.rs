use crate::grading::round_2;
use crate::ipc::handlers::students::require_student;
use crate::ipc::helpers::{
    commit_err, delete_err, get_optional_date, get_optional_f64, get_optional_str,
    get_required_str, get_string_list, has_key, insert_err, is_unique_violation,
    json_array_column, new_id, now_stored, query_err, require_role, run_org, tx_err, update_err, HandlerErr,
    OrgCtx, Patch,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{self, ClassSlot};
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{json, Value};

const TEACHER_STATUSES: [&str; 3] = ["active", "inactive", "on_leave"];
const EMPLOYMENT_TYPES: [&str; 3] = ["full_time", "part_time", "contract"];
const SALARY_TYPES: [&str; 2] = ["monthly", "hourly"];
const CLASS_STATUSES: [&str; 2] = ["active", "inactive"];
const TEACHER_MANAGERS: [&str; 2] = ["owner", "super_admin"];

const TEACHER_COLUMNS: &str = "id, name, email, phone, subjects_json, status, employment_type, \
                               salary_type, salary_amount, hire_date, notes, created_at, updated_at";

fn one_of(value: String, key: &str, allowed: &[&str]) -> Result<String, HandlerErr> {
    if !allowed.contains(&value.as_str()) {
        return Err(HandlerErr::bad_params(format!(
            "{} must be one of: {}",
            key,
            allowed.join(", ")
        )));
    }
    Ok(value)
}

fn teacher_json(r: &Row) -> rusqlite::Result<Value> {
    let subjects: String = r.get(4)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "email": r.get::<_, String>(2)?,
        "phone": r.get::<_, Option<String>>(3)?,
        "subjects": json_array_column(&subjects),
        "status": r.get::<_, String>(5)?,
        "employmentType": r.get::<_, String>(6)?,
        "salaryType": r.get::<_, String>(7)?,
        "salaryAmount": r.get::<_, f64>(8)?,
        "hireDate": r.get::<_, Option<String>>(9)?,
        "notes": r.get::<_, Option<String>>(10)?,
        "createdAt": r.get::<_, String>(11)?,
        "updatedAt": r.get::<_, String>(12)?,
    }))
}

fn assigned_students(conn: &Connection, teacher_id: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT student_id FROM teacher_students WHERE teacher_id = ? ORDER BY student_id")
        .map_err(query_err)?;
    let ids = stmt
        .query_map([teacher_id], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(ids)
}

fn with_students(conn: &Connection, mut teacher: Value) -> Result<Value, HandlerErr> {
    let id = teacher["id"].as_str().unwrap_or_default().to_string();
    teacher["assignedStudents"] = json!(assigned_students(conn, &id)?);
    Ok(teacher)
}

fn load_teacher(ctx: &OrgCtx, id: &str) -> Result<Value, HandlerErr> {
    let teacher = ctx
        .conn
        .query_row(
            &format!(
                "SELECT {} FROM teachers WHERE id = ? AND org_id = ?",
                TEACHER_COLUMNS
            ),
            (id, ctx.org_id),
            teacher_json,
        )
        .optional()
        .map_err(query_err)?
        .ok_or_else(|| HandlerErr::not_found("teacher"))?;
    with_students(ctx.conn, teacher)
}

fn email_conflict(e: rusqlite::Error) -> HandlerErr {
    if is_unique_violation(&e) {
        HandlerErr::conflict("a teacher with that email already exists")
    } else {
        insert_err("teachers")(e)
    }
}

fn parse_subjects(params: &Value) -> Result<Option<String>, HandlerErr> {
    Ok(get_string_list(params, "subjects")?.map(|list| {
        let cleaned: Vec<String> = list.into_iter().filter(|s| !s.is_empty()).collect();
        json!(cleaned).to_string()
    }))
}

fn parse_salary_amount(params: &Value) -> Result<Option<f64>, HandlerErr> {
    let amount = get_optional_f64(params, "salaryAmount")?;
    if amount.is_some_and(|a| a < 0.0) {
        return Err(HandlerErr::bad_params("salaryAmount must not be negative"));
    }
    Ok(amount)
}

fn teachers_list(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let mut sql = format!("SELECT {} FROM teachers WHERE org_id = ?", TEACHER_COLUMNS);
    let mut binds: Vec<String> = vec![ctx.org_id.to_string()];
    if let Some(q) = get_optional_str(ctx.params, "search")? {
        sql.push_str(" AND (name LIKE ? OR email LIKE ? OR subjects_json LIKE ?)");
        let pattern = format!("%{}%", q);
        binds.extend([pattern.clone(), pattern.clone(), pattern]);
    }
    sql.push_str(" ORDER BY name");
    let mut stmt = ctx.conn.prepare(&sql).map_err(query_err)?;
    let rows = stmt
        .query_map(params_from_iter(binds.iter()), teacher_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    let teachers = rows
        .into_iter()
        .map(|t| with_students(ctx.conn, t))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "teachers": teachers }))
}

fn teachers_get(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let id = get_required_str(ctx.params, "id")?;
    Ok(json!({ "teacher": load_teacher(ctx, &id)? }))
}

fn teachers_create(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    require_role(ctx.actor, &TEACHER_MANAGERS)?;
    let name = get_required_str(ctx.params, "name")?;
    let email = get_required_str(ctx.params, "email")?.to_ascii_lowercase();
    if !crate::consultation::valid_email(&email) {
        return Err(HandlerErr::bad_params("email is not a valid address"));
    }
    let status = one_of(
        get_optional_str(ctx.params, "status")?.unwrap_or_else(|| "active".into()),
        "status",
        &TEACHER_STATUSES,
    )?;
    let employment_type = one_of(
        get_optional_str(ctx.params, "employmentType")?.unwrap_or_else(|| "full_time".into()),
        "employmentType",
        &EMPLOYMENT_TYPES,
    )?;
    let salary_type = one_of(
        get_optional_str(ctx.params, "salaryType")?.unwrap_or_else(|| "monthly".into()),
        "salaryType",
        &SALARY_TYPES,
    )?;
    let id = new_id();
    let now = now_stored();
    ctx.conn
        .execute(
            "INSERT INTO teachers(id, org_id, name, email, phone, subjects_json, status,
                                  employment_type, salary_type, salary_amount, hire_date, notes,
                                  created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                id,
                ctx.org_id,
                name,
                email,
                get_optional_str(ctx.params, "phone")?,
                parse_subjects(ctx.params)?.unwrap_or_else(|| "[]".into()),
                status,
                employment_type,
                salary_type,
                parse_salary_amount(ctx.params)?.unwrap_or(0.0),
                get_optional_date(ctx.params, "hireDate")?,
                get_optional_str(ctx.params, "notes")?,
                now,
                now,
            ],
        )
        .map_err(email_conflict)?;
    Ok(json!({ "teacher": load_teacher(ctx, &id)? }))
}

fn teachers_update(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    require_role(ctx.actor, &TEACHER_MANAGERS)?;
    let id = get_required_str(ctx.params, "id")?;
    load_teacher(ctx, &id)?;
    let mut patch = Patch::default();
    patch.required_text(ctx.params, "name", "name")?;
    if has_key(ctx.params, "email") {
        let email = get_required_str(ctx.params, "email")?.to_ascii_lowercase();
        if !crate::consultation::valid_email(&email) {
            return Err(HandlerErr::bad_params("email is not a valid address"));
        }
        patch.set("email", email);
    }
    patch.text(ctx.params, "phone", "phone")?;
    if let Some(subjects) = parse_subjects(ctx.params)? {
        patch.set("subjects_json", subjects);
    }
    if let Some(s) = get_optional_str(ctx.params, "status")? {
        patch.set("status", one_of(s, "status", &TEACHER_STATUSES)?);
    }
    if let Some(s) = get_optional_str(ctx.params, "employmentType")? {
        patch.set("employment_type", one_of(s, "employmentType", &EMPLOYMENT_TYPES)?);
    }
    if let Some(s) = get_optional_str(ctx.params, "salaryType")? {
        patch.set("salary_type", one_of(s, "salaryType", &SALARY_TYPES)?);
    }
    if let Some(a) = parse_salary_amount(ctx.params)? {
        patch.set("salary_amount", a);
    }
    patch.date(ctx.params, "hireDate", "hire_date")?;
    patch.text(ctx.params, "notes", "notes")?;
    if !patch.is_empty() {
        patch.set("updated_at", now_stored());
        patch.execute(
            ctx.conn,
            "teachers",
            "id = ? AND org_id = ?",
            vec![id.clone().into(), ctx.org_id.to_string().into()],
        )?;
    }
    Ok(json!({ "teacher": load_teacher(ctx, &id)? }))
}

fn teachers_delete(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    require_role(ctx.actor, &TEACHER_MANAGERS)?;
    let id = get_required_str(ctx.params, "id")?;
    load_teacher(ctx, &id)?;
    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    tx.execute("DELETE FROM teacher_students WHERE teacher_id = ?", [&id])
        .map_err(delete_err("teacher_students"))?;
    tx.execute(
        "UPDATE classes SET teacher_id = NULL WHERE teacher_id = ?",
        [&id],
    )
    .map_err(update_err("classes"))?;
    tx.execute("DELETE FROM teachers WHERE id = ?", [&id])
        .map_err(delete_err("teachers"))?;
    tx.commit().map_err(commit_err)?;
    Ok(json!({ "ok": true }))
}

/// Replaces the teacher's assigned students.
fn teachers_assign_students(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let teacher_id = get_required_str(ctx.params, "teacherId")?;
    load_teacher(ctx, &teacher_id)?;
    let mut ids = get_string_list(ctx.params, "studentIds")?
        .ok_or_else(|| HandlerErr::bad_params("missing studentIds"))?;
    ids.sort();
    ids.dedup();
    for sid in &ids {
        require_student(ctx.conn, ctx.org_id, sid)
            .map_err(|e| e.with_details(json!({ "studentId": sid })))?;
    }
    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    tx.execute("DELETE FROM teacher_students WHERE teacher_id = ?", [&teacher_id])
        .map_err(delete_err("teacher_students"))?;
    for sid in &ids {
        tx.execute(
            "INSERT INTO teacher_students(teacher_id, student_id) VALUES(?, ?)",
            (&teacher_id, sid),
        )
        .map_err(insert_err("teacher_students"))?;
    }
    tx.commit().map_err(commit_err)?;
    Ok(json!({ "teacher": load_teacher(ctx, &teacher_id)? }))
}

const CLASS_COLUMNS: &str = "c.id, c.name, c.subject, c.teacher_id, t.name, c.schedule_json, \
                             c.status, c.created_at, \
                             (SELECT COUNT(*) FROM class_enrollments e
                              WHERE e.class_id = c.id AND e.status = 'active')";

fn class_json(r: &Row) -> rusqlite::Result<Value> {
    let schedule: String = r.get(5)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "subject": r.get::<_, Option<String>>(2)?,
        "teacherId": r.get::<_, Option<String>>(3)?,
        "teacherName": r.get::<_, Option<String>>(4)?,
        "schedule": json_array_column(&schedule),
        "status": r.get::<_, String>(6)?,
        "createdAt": r.get::<_, String>(7)?,
        "studentCount": r.get::<_, i64>(8)?,
    }))
}

fn load_class(ctx: &OrgCtx, id: &str) -> Result<Value, HandlerErr> {
    ctx.conn
        .query_row(
            &format!(
                "SELECT {} FROM classes c LEFT JOIN teachers t ON t.id = c.teacher_id
                 WHERE c.id = ? AND c.org_id = ?",
                CLASS_COLUMNS
            ),
            (id, ctx.org_id),
            class_json,
        )
        .optional()
        .map_err(query_err)?
        .ok_or_else(|| HandlerErr::not_found("class"))
}

/// Stored form of a validated `[{day, startTime, endTime}]` schedule.
fn parse_schedule(params: &Value) -> Result<Option<String>, HandlerErr> {
    match params.get("schedule") {
        None | Some(Value::Null) => Ok(None),
        Some(v) => {
            let slots = schedule::parse_class_schedule(v).map_err(HandlerErr::bad_params)?;
            Ok(Some(json!(slots).to_string()))
        }
    }
}

fn check_teacher_ref(ctx: &OrgCtx, teacher_id: Option<&str>) -> Result<(), HandlerErr> {
    if let Some(tid) = teacher_id {
        load_teacher(ctx, tid)?;
    }
    Ok(())
}

fn classes_list(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let mut sql = format!(
        "SELECT {} FROM classes c LEFT JOIN teachers t ON t.id = c.teacher_id WHERE c.org_id = ?",
        CLASS_COLUMNS
    );
    let mut binds: Vec<String> = vec![ctx.org_id.to_string()];
    if let Some(tid) = get_optional_str(ctx.params, "teacherId")? {
        sql.push_str(" AND c.teacher_id = ?");
        binds.push(tid);
    }
    if let Some(status) = get_optional_str(ctx.params, "status")? {
        sql.push_str(" AND c.status = ?");
        binds.push(status);
    }
    sql.push_str(" ORDER BY c.name");
    let mut stmt = ctx.conn.prepare(&sql).map_err(query_err)?;
    let rows = stmt
        .query_map(params_from_iter(binds.iter()), class_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "classes": rows }))
}

fn classes_create(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let name = get_required_str(ctx.params, "name")?;
    let teacher_id = get_optional_str(ctx.params, "teacherId")?;
    check_teacher_ref(ctx, teacher_id.as_deref())?;
    let status = one_of(
        get_optional_str(ctx.params, "status")?.unwrap_or_else(|| "active".into()),
        "status",
        &CLASS_STATUSES,
    )?;
    let id = new_id();
    ctx.conn
        .execute(
            "INSERT INTO classes(id, org_id, name, subject, teacher_id, schedule_json, status, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &id,
                ctx.org_id,
                &name,
                get_optional_str(ctx.params, "subject")?,
                teacher_id,
                parse_schedule(ctx.params)?.unwrap_or_else(|| "[]".into()),
                status,
                now_stored(),
            ),
        )
        .map_err(insert_err("classes"))?;
    Ok(json!({ "class": load_class(ctx, &id)? }))
}

fn classes_update(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let id = get_required_str(ctx.params, "id")?;
    load_class(ctx, &id)?;
    let mut patch = Patch::default();
    patch.required_text(ctx.params, "name", "name")?;
    patch.text(ctx.params, "subject", "subject")?;
    if has_key(ctx.params, "teacherId") {
        let teacher_id = get_optional_str(ctx.params, "teacherId")?;
        check_teacher_ref(ctx, teacher_id.as_deref())?;
        patch.set("teacher_id", teacher_id);
    }
    if let Some(s) = parse_schedule(ctx.params)? {
        patch.set("schedule_json", s);
    }
    if let Some(s) = get_optional_str(ctx.params, "status")? {
        patch.set("status", one_of(s, "status", &CLASS_STATUSES)?);
    }
    patch.execute(
        ctx.conn,
        "classes",
        "id = ? AND org_id = ?",
        vec![id.clone().into(), ctx.org_id.to_string().into()],
    )?;
    Ok(json!({ "class": load_class(ctx, &id)? }))
}

fn classes_delete(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let id = get_required_str(ctx.params, "id")?;
    load_class(ctx, &id)?;
    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    tx.execute("DELETE FROM class_enrollments WHERE class_id = ?", [&id])
        .map_err(delete_err("class_enrollments"))?;
    tx.execute("UPDATE exams SET class_id = NULL WHERE class_id = ?", [&id])
        .map_err(update_err("exams"))?;
    tx.execute("DELETE FROM classes WHERE id = ?", [&id])
        .map_err(delete_err("classes"))?;
    tx.commit().map_err(commit_err)?;
    Ok(json!({ "ok": true }))
}

fn classes_enroll(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(ctx.params, "classId")?;
    let student_id = get_required_str(ctx.params, "studentId")?;
    load_class(ctx, &class_id)?;
    require_student(ctx.conn, ctx.org_id, &student_id)?;
    ctx.conn
        .execute(
            "INSERT INTO class_enrollments(class_id, student_id, status, enrolled_at)
             VALUES(?, ?, 'active', ?)
             ON CONFLICT(class_id, student_id) DO UPDATE SET status = 'active'",
            (&class_id, &student_id, now_stored()),
        )
        .map_err(insert_err("class_enrollments"))?;
    Ok(json!({ "class": load_class(ctx, &class_id)? }))
}

fn classes_unenroll(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(ctx.params, "classId")?;
    let student_id = get_required_str(ctx.params, "studentId")?;
    load_class(ctx, &class_id)?;
    let n = ctx
        .conn
        .execute(
            "DELETE FROM class_enrollments WHERE class_id = ? AND student_id = ?",
            (&class_id, &student_id),
        )
        .map_err(delete_err("class_enrollments"))?;
    if n == 0 {
        return Err(HandlerErr::not_found("enrollment"));
    }
    Ok(json!({ "class": load_class(ctx, &class_id)? }))
}

fn teachers_classes(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let teacher_id = get_required_str(ctx.params, "teacherId")?;
    load_teacher(ctx, &teacher_id)?;
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT c.id, c.name, c.subject, c.status,
                    (SELECT COUNT(*) FROM class_enrollments e
                     WHERE e.class_id = c.id AND e.status = 'active')
             FROM classes c WHERE c.org_id = ? AND c.teacher_id = ?
             ORDER BY c.name",
        )
        .map_err(query_err)?;
    let rows = stmt
        .query_map((ctx.org_id, &teacher_id), |r| {
            Ok(json!({
                "classId": r.get::<_, String>(0)?,
                "className": r.get::<_, String>(1)?,
                "subject": r.get::<_, Option<String>>(2)?,
                "status": r.get::<_, String>(3)?,
                "studentCount": r.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "classes": rows }))
}

fn parse_month(raw: &str) -> Option<(i32, u32)> {
    let (y, m) = raw.split_once('-')?;
    if y.len() != 4 || m.len() != 2 {
        return None;
    }
    let year: i32 = y.parse().ok()?;
    let month: u32 = m.parse().ok()?;
    (1..=12).contains(&month).then_some((year, month))
}

fn teachers_salary(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let teacher_id = get_required_str(ctx.params, "teacherId")?;
    let month_raw = get_required_str(ctx.params, "month")?;
    let (year, month) =
        parse_month(&month_raw).ok_or_else(|| HandlerErr::bad_params("month must be YYYY-MM"))?;
    let (salary_type, amount): (String, f64) = ctx
        .conn
        .query_row(
            "SELECT salary_type, salary_amount FROM teachers WHERE id = ? AND org_id = ?",
            (&teacher_id, ctx.org_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(query_err)?
        .ok_or_else(|| HandlerErr::not_found("teacher"))?;

    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT schedule_json FROM classes
             WHERE org_id = ? AND teacher_id = ? AND status = 'active'",
        )
        .map_err(query_err)?;
    let schedules = stmt
        .query_map((ctx.org_id, &teacher_id), |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    let slots: Vec<ClassSlot> = schedules
        .iter()
        .filter_map(|raw| schedule::parse_class_schedule(&json_array_column(raw)).ok())
        .flatten()
        .collect();
    let minutes = schedule::monthly_scheduled_minutes(&slots, year, month);
    let hours = minutes as f64 / 60.0;

    let total = if salary_type == "hourly" {
        round_2(amount * hours)
    } else {
        amount
    };
    Ok(json!({
        "teacherId": teacher_id,
        "month": month_raw,
        "salaryType": salary_type,
        "salaryAmount": amount,
        "scheduledMinutes": minutes,
        "scheduledHours": round_2(hours),
        "total": total,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.list" => Some(run_org(state, req, teachers_list)),
        "teachers.get" => Some(run_org(state, req, teachers_get)),
        "teachers.create" => Some(run_org(state, req, teachers_create)),
        "teachers.update" => Some(run_org(state, req, teachers_update)),
        "teachers.delete" => Some(run_org(state, req, teachers_delete)),
        "teachers.assignStudents" => Some(run_org(state, req, teachers_assign_students)),
        "teachers.classes" => Some(run_org(state, req, teachers_classes)),
        "teachers.salary" => Some(run_org(state, req, teachers_salary)),
        "classes.list" => Some(run_org(state, req, classes_list)),
        "classes.create" => Some(run_org(state, req, classes_create)),
        "classes.update" => Some(run_org(state, req, classes_update)),
        "classes.delete" => Some(run_org(state, req, classes_delete)),
        "classes.enroll" => Some(run_org(state, req, classes_enroll)),
        "classes.unenroll" => Some(run_org(state, req, classes_unenroll)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::parse_month;

    #[test]
    fn month_param_is_year_dash_month() {
        assert_eq!(parse_month("2024-02"), Some((2024, 2)));
        assert_eq!(parse_month("2024-13"), None);
        assert_eq!(parse_month("2024-2"), None);
        assert_eq!(parse_month("202402"), None);
    }
}
