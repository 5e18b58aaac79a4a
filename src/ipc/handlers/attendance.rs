use crate::grading::round_2;
use crate::ipc::handlers::setup::{self, AttendanceSettings};
use crate::ipc::handlers::students::{require_student, student_name};
use crate::ipc::helpers::{
    commit_err, delete_err, get_limit, get_now, get_optional_i64, get_optional_str,
    get_required_date, get_required_str, insert_err, json_array_column, new_id, now_stored,
    query_err, run_org, tx_err, update_err, HandlerErr, OrgCtx,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{self, AttendanceStatus, ClassSlot, CommuteStatus};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, Utc, Weekday};
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

/// Request time seen through the organization's UTC offset.
pub struct LocalClock {
    pub now: DateTime<Utc>,
    pub local: DateTime<FixedOffset>,
    pub today: NaiveDate,
    pub settings: AttendanceSettings,
}

impl LocalClock {
    pub fn today_str(&self) -> String {
        date_str(self.today)
    }

    pub fn minutes_now(&self) -> u32 {
        schedule::minutes_of_day(&self.local)
    }

    /// Local minute of day for a stored UTC timestamp.
    pub fn local_minutes(&self, stored: &str) -> Option<u32> {
        let t = schedule::parse_instant(stored)?;
        Some(schedule::minutes_of_day(&schedule::local_time(
            t,
            self.settings.utc_offset_minutes,
        )))
    }

    /// Stored-format bounds of a local calendar day.
    pub fn day_bounds(&self, date: NaiveDate) -> (String, String) {
        let (start, end) = schedule::local_day_bounds(date, self.settings.utc_offset_minutes);
        (schedule::to_stored(start), schedule::to_stored(end))
    }
}

pub fn clock(ctx: &OrgCtx) -> Result<LocalClock, HandlerErr> {
    let settings = setup::attendance_settings(ctx.conn, ctx.org_id)?;
    let now = get_now(ctx.params)?;
    let local = schedule::local_time(now, settings.utc_offset_minutes);
    Ok(LocalClock {
        now,
        local,
        today: local.date_naive(),
        settings,
    })
}

pub fn date_str(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

/// A class meeting on a given weekday for one enrolled student.
#[derive(Debug, Clone)]
pub struct ScheduledClass {
    pub student_id: String,
    pub class_id: String,
    pub class_name: String,
    pub slot: ClassSlot,
}

/// Active enrollments in active classes that meet on `day`, earliest first.
pub fn scheduled_classes(
    conn: &Connection,
    org_id: &str,
    student_id: Option<&str>,
    day: Weekday,
) -> Result<Vec<ScheduledClass>, HandlerErr> {
    let mut sql = String::from(
        "SELECT e.student_id, c.id, c.name, c.schedule_json
         FROM class_enrollments e
         JOIN classes c ON c.id = e.class_id
         JOIN students s ON s.id = e.student_id
         WHERE c.org_id = ? AND c.status = 'active' AND e.status = 'active'
           AND s.status = 'active'",
    );
    let mut binds: Vec<String> = vec![org_id.to_string()];
    if let Some(sid) = student_id {
        sql.push_str(" AND e.student_id = ?");
        binds.push(sid.to_string());
    }
    let mut stmt = conn.prepare(&sql).map_err(query_err)?;
    let rows = stmt
        .query_map(params_from_iter(binds.iter()), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    let mut out = Vec::new();
    for (sid, class_id, class_name, raw) in rows {
        let Ok(slots) = schedule::parse_class_schedule(&json_array_column(&raw)) else {
            tracing::warn!(class_id = %class_id, "skipping class with unreadable schedule");
            continue;
        };
        if let Some(slot) = schedule::slot_for_day(&slots, day) {
            out.push(ScheduledClass {
                student_id: sid,
                class_id,
                class_name,
                slot: slot.clone(),
            });
        }
    }
    out.sort_by(|a, b| {
        a.slot
            .start_minutes()
            .cmp(&b.slot.start_minutes())
            .then_with(|| a.class_name.cmp(&b.class_name))
    });
    Ok(out)
}

/// Class attendance written when a student checks in at a seat: the earliest
/// class of the day becomes `late` or `present`. A row that already has a
/// check-in time is left alone.
pub fn record_seat_check_in(
    conn: &Connection,
    org_id: &str,
    student_id: &str,
    clock: &LocalClock,
) -> Result<Option<Value>, HandlerErr> {
    let classes = scheduled_classes(conn, org_id, Some(student_id), clock.today.weekday())?;
    let Some(first) = classes.first() else {
        return Ok(None);
    };
    let status = schedule::class_check_in_status(
        clock.minutes_now(),
        first.slot.start_minutes(),
        clock.settings.late_grace_minutes.max(0) as u32,
    );
    let date = clock.today_str();
    let stamp = schedule::to_stored(clock.now);
    conn.execute(
        "INSERT INTO attendance(id, org_id, student_id, class_id, date, status, check_in_time,
                                created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(org_id, student_id, class_id, date) DO UPDATE SET
           status = CASE WHEN attendance.check_in_time IS NULL THEN excluded.status
                         ELSE attendance.status END,
           check_in_time = COALESCE(attendance.check_in_time, excluded.check_in_time),
           updated_at = excluded.updated_at",
        rusqlite::params![
            new_id(),
            org_id,
            student_id,
            first.class_id,
            date,
            status.as_str(),
            stamp,
            stamp,
            stamp,
        ],
    )
    .map_err(insert_err("attendance"))?;
    let recorded: String = conn
        .query_row(
            "SELECT status FROM attendance
             WHERE org_id = ? AND student_id = ? AND class_id = ? AND date = ?",
            (org_id, student_id, &first.class_id, &date),
            |r| r.get(0),
        )
        .map_err(query_err)?;
    Ok(Some(json!({
        "classId": first.class_id,
        "className": first.class_name,
        "status": recorded,
    })))
}

/// Stamps the check-out time on today's earliest class row. The check-in
/// time and status of an existing row are preserved.
pub fn record_seat_check_out(
    conn: &Connection,
    org_id: &str,
    student_id: &str,
    session_start: Option<&str>,
    clock: &LocalClock,
) -> Result<Option<Value>, HandlerErr> {
    let classes = scheduled_classes(conn, org_id, Some(student_id), clock.today.weekday())?;
    let Some(first) = classes.first() else {
        return Ok(None);
    };
    let date = clock.today_str();
    let stamp = schedule::to_stored(clock.now);
    let check_in_status = session_start
        .and_then(|s| clock.local_minutes(s))
        .map(|m| {
            schedule::class_check_in_status(
                m,
                first.slot.start_minutes(),
                clock.settings.late_grace_minutes.max(0) as u32,
            )
        })
        .unwrap_or(AttendanceStatus::Present);
    conn.execute(
        "INSERT INTO attendance(id, org_id, student_id, class_id, date, status, check_in_time,
                                check_out_time, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(org_id, student_id, class_id, date) DO UPDATE SET
           check_in_time = COALESCE(attendance.check_in_time, excluded.check_in_time),
           check_out_time = excluded.check_out_time,
           updated_at = excluded.updated_at",
        rusqlite::params![
            new_id(),
            org_id,
            student_id,
            first.class_id,
            date,
            check_in_status.as_str(),
            session_start,
            stamp,
            stamp,
            stamp,
        ],
    )
    .map_err(insert_err("attendance"))?;
    Ok(Some(json!({ "classId": first.class_id, "className": first.class_name })))
}

const ATTENDANCE_COLUMNS: &str = "a.id, a.student_id, s.name, a.class_id, c.name, a.date, a.status, \
                                  a.check_in_time, a.check_out_time, a.notes, a.created_at, a.updated_at";

const ATTENDANCE_FROM: &str = "FROM attendance a
     JOIN students s ON s.id = a.student_id
     LEFT JOIN classes c ON c.id = a.class_id";

fn attendance_json(r: &Row) -> rusqlite::Result<Value> {
    let class_id: String = r.get(3)?;
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "studentName": r.get::<_, String>(2)?,
        "classId": if class_id.is_empty() { None } else { Some(class_id) },
        "className": r.get::<_, Option<String>>(4)?,
        "date": r.get::<_, String>(5)?,
        "status": r.get::<_, String>(6)?,
        "checkInTime": r.get::<_, Option<String>>(7)?,
        "checkOutTime": r.get::<_, Option<String>>(8)?,
        "notes": r.get::<_, Option<String>>(9)?,
        "createdAt": r.get::<_, String>(10)?,
        "updatedAt": r.get::<_, String>(11)?,
    }))
}

fn load_attendance(ctx: &OrgCtx, id: &str) -> Result<Value, HandlerErr> {
    ctx.conn
        .query_row(
            &format!(
                "SELECT {} {} WHERE a.id = ? AND a.org_id = ?",
                ATTENDANCE_COLUMNS, ATTENDANCE_FROM
            ),
            (id, ctx.org_id),
            attendance_json,
        )
        .optional()
        .map_err(query_err)?
        .ok_or_else(|| HandlerErr::not_found("attendance"))
}

fn parse_status(raw: &str) -> Result<AttendanceStatus, HandlerErr> {
    AttendanceStatus::parse(raw).ok_or_else(|| {
        HandlerErr::bad_params("status must be one of: scheduled, present, late, absent, excused")
    })
}

fn attendance_list(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let limit = get_limit(ctx.params, "limit", 20, 100)?;
    let offset = get_optional_i64(ctx.params, "offset")?.unwrap_or(0);
    if offset < 0 {
        return Err(HandlerErr::bad_params("offset must not be negative"));
    }
    let mut filter = String::from(" WHERE a.org_id = ?");
    let mut binds: Vec<rusqlite::types::Value> = vec![ctx.org_id.to_string().into()];
    if let Some(sid) = get_optional_str(ctx.params, "studentId")? {
        filter.push_str(" AND a.student_id = ?");
        binds.push(sid.into());
    }
    if let Some(cid) = get_optional_str(ctx.params, "classId")? {
        filter.push_str(" AND a.class_id = ?");
        binds.push(cid.into());
    }
    if let Some(date) = get_optional_str(ctx.params, "date")? {
        if schedule::parse_date(&date).is_none() {
            return Err(HandlerErr::bad_params("date must be YYYY-MM-DD"));
        }
        filter.push_str(" AND a.date = ?");
        binds.push(date.into());
    }
    if let Some(status) = get_optional_str(ctx.params, "status")? {
        filter.push_str(" AND a.status = ?");
        binds.push(parse_status(&status)?.as_str().to_string().into());
    }

    let total: i64 = ctx
        .conn
        .query_row(
            &format!("SELECT COUNT(*) FROM attendance a{}", filter),
            params_from_iter(binds.iter()),
            |r| r.get(0),
        )
        .map_err(query_err)?;

    let sql = format!(
        "SELECT {} {}{} ORDER BY a.date DESC, a.created_at DESC LIMIT ? OFFSET ?",
        ATTENDANCE_COLUMNS, ATTENDANCE_FROM, filter
    );
    binds.push(limit.into());
    binds.push(offset.into());
    let mut stmt = ctx.conn.prepare(&sql).map_err(query_err)?;
    let rows = stmt
        .query_map(params_from_iter(binds.iter()), attendance_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "records": rows, "total": total, "limit": limit, "offset": offset }))
}

fn attendance_upsert(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let student_id = get_required_str(ctx.params, "studentId")?;
    require_student(ctx.conn, ctx.org_id, &student_id)?;
    let class_id = get_optional_str(ctx.params, "classId")?.unwrap_or_default();
    if !class_id.is_empty() {
        let found = ctx
            .conn
            .query_row(
                "SELECT 1 FROM classes WHERE id = ? AND org_id = ?",
                (&class_id, ctx.org_id),
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .map_err(query_err)?;
        if found.is_none() {
            return Err(HandlerErr::not_found("class"));
        }
    }
    let date = get_required_date(ctx.params, "date")?;
    let status = parse_status(&get_required_str(ctx.params, "status")?)?;
    let notes = get_optional_str(ctx.params, "notes")?;
    let now = now_stored();
    ctx.conn
        .execute(
            "INSERT INTO attendance(id, org_id, student_id, class_id, date, status, notes,
                                    created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(org_id, student_id, class_id, date) DO UPDATE SET
               status = excluded.status,
               notes = COALESCE(excluded.notes, attendance.notes),
               updated_at = excluded.updated_at",
            rusqlite::params![
                new_id(),
                ctx.org_id,
                student_id,
                class_id,
                date,
                status.as_str(),
                notes,
                now,
                now,
            ],
        )
        .map_err(insert_err("attendance"))?;
    let id: String = ctx
        .conn
        .query_row(
            "SELECT id FROM attendance
             WHERE org_id = ? AND student_id = ? AND class_id = ? AND date = ?",
            (ctx.org_id, &student_id, &class_id, &date),
            |r| r.get(0),
        )
        .map_err(query_err)?;
    Ok(json!({ "record": load_attendance(ctx, &id)? }))
}

fn attendance_set_status(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let id = get_required_str(ctx.params, "id")?;
    let status = parse_status(&get_required_str(ctx.params, "status")?)?;
    let n = ctx
        .conn
        .execute(
            "UPDATE attendance SET status = ?, updated_at = ? WHERE id = ? AND org_id = ?",
            (status.as_str(), now_stored(), &id, ctx.org_id),
        )
        .map_err(update_err("attendance"))?;
    if n == 0 {
        return Err(HandlerErr::not_found("attendance"));
    }
    Ok(json!({ "record": load_attendance(ctx, &id)? }))
}

fn attendance_delete(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let id = get_required_str(ctx.params, "id")?;
    let n = ctx
        .conn
        .execute(
            "DELETE FROM attendance WHERE id = ? AND org_id = ?",
            (&id, ctx.org_id),
        )
        .map_err(delete_err("attendance"))?;
    if n == 0 {
        return Err(HandlerErr::not_found("attendance"));
    }
    Ok(json!({ "ok": true }))
}

fn logs_list(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let date = get_required_date(ctx.params, "date")?;
    let clock = clock(ctx)?;
    let day = schedule::parse_date(&date).unwrap_or(clock.today);
    let (start, end) = clock.day_bounds(day);
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT l.id, l.student_id, s.name, l.seat_number, l.check_in_time,
                    l.check_out_time, l.duration_minutes
             FROM attendance_logs l
             JOIN students s ON s.id = l.student_id
             WHERE l.org_id = ? AND l.check_in_time >= ? AND l.check_in_time < ?
             ORDER BY l.check_in_time",
        )
        .map_err(query_err)?;
    let rows = stmt
        .query_map((ctx.org_id, &start, &end), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "studentName": r.get::<_, String>(2)?,
                "seatNumber": r.get::<_, Option<i64>>(3)?,
                "checkInTime": r.get::<_, String>(4)?,
                "checkOutTime": r.get::<_, Option<String>>(5)?,
                "durationMinutes": r.get::<_, Option<i64>>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "date": date, "logs": rows }))
}

fn commute_status(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let clock = clock(ctx)?;
    let weekday = clock.today.weekday();
    let (start, end) = clock.day_bounds(clock.today);

    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT cs.student_id, s.name, cs.check_in_time, cs.check_out_time,
                    (SELECT MIN(l.check_in_time) FROM attendance_logs l
                     WHERE l.student_id = cs.student_id AND l.org_id = cs.org_id
                       AND l.check_in_time >= ?2 AND l.check_in_time < ?3),
                    (SELECT MAX(l.check_out_time) FROM attendance_logs l
                     WHERE l.student_id = cs.student_id AND l.org_id = cs.org_id
                       AND l.check_in_time >= ?2 AND l.check_in_time < ?3)
             FROM commute_schedules cs
             JOIN students s ON s.id = cs.student_id
             WHERE cs.org_id = ?1 AND cs.weekday = ?4 AND s.status = 'active'
               AND cs.check_in_time IS NOT NULL
             ORDER BY cs.check_in_time, s.name",
        )
        .map_err(query_err)?;
    let rows = stmt
        .query_map(
            (ctx.org_id, &start, &end, schedule::weekday_key(weekday)),
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, Option<String>>(4)?,
                    r.get::<_, Option<String>>(5)?,
                ))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    let now_minutes = clock.minutes_now();
    let mut out = Vec::with_capacity(rows.len());
    for (student_id, name, sched_in, sched_out, first_in, last_out) in rows {
        let Some(scheduled) = schedule::parse_time_of_day(&sched_in) else {
            continue;
        };
        let first_minutes = first_in.as_deref().and_then(|t| clock.local_minutes(t));
        let status: CommuteStatus =
            schedule::derive_commute_status(scheduled, first_minutes, now_minutes);
        out.push(json!({
            "studentId": student_id,
            "studentName": name,
            "scheduledCheckIn": schedule::format_time_of_day(scheduled),
            "scheduledCheckOut": sched_out,
            "firstCheckIn": first_in,
            "lastCheckOut": last_out,
            "status": status.as_str(),
        }));
    }
    Ok(json!({
        "date": clock.today_str(),
        "weekday": schedule::weekday_key(weekday),
        "students": out,
    }))
}

fn recorded_statuses(
    conn: &Connection,
    org_id: &str,
    date: &str,
) -> Result<HashMap<(String, String), (String, String)>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT student_id, class_id, id, status FROM attendance WHERE org_id = ? AND date = ?")
        .map_err(query_err)?;
    let rows = stmt
        .query_map((org_id, date), |r| {
            Ok((
                (r.get::<_, String>(0)?, r.get::<_, String>(1)?),
                (r.get::<_, String>(2)?, r.get::<_, String>(3)?),
            ))
        })
        .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
        .map_err(query_err)?;
    Ok(rows)
}

fn attendance_today(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let clock = clock(ctx)?;
    let date = clock.today_str();
    let weekday = clock.today.weekday();
    let classes = scheduled_classes(ctx.conn, ctx.org_id, None, weekday)?;
    let recorded = recorded_statuses(ctx.conn, ctx.org_id, &date)?;

    let mut by_student: BTreeMap<String, Vec<&ScheduledClass>> = BTreeMap::new();
    for c in &classes {
        by_student.entry(c.student_id.clone()).or_default().push(c);
    }

    let mut students = Vec::with_capacity(by_student.len());
    for (student_id, list) in by_student {
        let name = student_name(ctx.conn, ctx.org_id, &student_id)?
            .unwrap_or_default();
        let mut statuses = Vec::with_capacity(list.len());
        let rows: Vec<Value> = list
            .iter()
            .map(|c| {
                let rec = recorded.get(&(student_id.clone(), c.class_id.clone()));
                let status = rec
                    .and_then(|(_, s)| AttendanceStatus::parse(s))
                    .unwrap_or(AttendanceStatus::Scheduled);
                statuses.push(status);
                json!({
                    "classId": c.class_id,
                    "className": c.class_name,
                    "startTime": c.slot.start_time,
                    "endTime": c.slot.end_time,
                    "status": status.as_str(),
                    "attendanceId": rec.map(|(id, _)| id.clone()),
                })
            })
            .collect();
        students.push(json!({
            "studentId": student_id,
            "studentName": name,
            "status": schedule::aggregate_status(statuses).as_str(),
            "classes": rows,
        }));
    }
    students.sort_by(|a, b| {
        a["studentName"]
            .as_str()
            .unwrap_or_default()
            .cmp(b["studentName"].as_str().unwrap_or_default())
    });
    Ok(json!({
        "date": date,
        "weekday": schedule::weekday_key(weekday),
        "students": students,
    }))
}

/// Marks every scheduled-but-unrecorded class of a past day as absent.
fn attendance_reconcile(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let date_raw = get_required_date(ctx.params, "date")?;
    let clock = clock(ctx)?;
    let date = schedule::parse_date(&date_raw)
        .ok_or_else(|| HandlerErr::bad_params("date must be YYYY-MM-DD"))?;
    if date >= clock.today {
        return Err(HandlerErr::bad_params("only past dates can be reconciled")
            .with_details(json!({ "date": date_raw, "today": clock.today_str() })));
    }
    let classes = scheduled_classes(ctx.conn, ctx.org_id, None, date.weekday())?;
    let now = now_stored();
    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    let mut inserted = 0i64;
    let mut skipped = 0i64;
    for c in &classes {
        let n = tx
            .execute(
                "INSERT INTO attendance(id, org_id, student_id, class_id, date, status,
                                        created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, 'absent', ?, ?)
                 ON CONFLICT(org_id, student_id, class_id, date) DO NOTHING",
                rusqlite::params![new_id(), ctx.org_id, c.student_id, c.class_id, date_raw, now, now],
            )
            .map_err(insert_err("attendance"))?;
        if n > 0 {
            inserted += 1;
        } else {
            skipped += 1;
        }
    }
    tx.commit().map_err(commit_err)?;
    tracing::info!(date = %date_raw, inserted, skipped, "attendance reconciled");
    Ok(json!({ "date": date_raw, "inserted": inserted, "skipped": skipped }))
}

#[derive(Default)]
struct Tally {
    present: i64,
    late: i64,
    absent: i64,
    excused: i64,
    scheduled: i64,
}

impl Tally {
    fn add(&mut self, status: &str) {
        match AttendanceStatus::parse(status) {
            Some(AttendanceStatus::Present) => self.present += 1,
            Some(AttendanceStatus::Late) => self.late += 1,
            Some(AttendanceStatus::Absent) => self.absent += 1,
            Some(AttendanceStatus::Excused) => self.excused += 1,
            Some(AttendanceStatus::Scheduled) | None => self.scheduled += 1,
        }
    }

    fn total(&self) -> i64 {
        self.present + self.late + self.absent + self.excused + self.scheduled
    }
}

fn attendance_stats(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let clock = clock(ctx)?;
    let today = clock.today;
    let window = clock.settings.stats_window_days.max(1);
    let window_start = today - Duration::days(window - 1);
    let week_start = today - Duration::days(6);
    let from = date_str(window_start.min(week_start));

    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT a.student_id, s.name, a.date, a.status
             FROM attendance a JOIN students s ON s.id = a.student_id
             WHERE a.org_id = ? AND a.date >= ? AND a.date <= ?",
        )
        .map_err(query_err)?;
    let rows = stmt
        .query_map((ctx.org_id, &from, clock.today_str()), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    let week_from = date_str(week_start);
    let window_from = date_str(window_start);
    let mut days: BTreeMap<String, Tally> = BTreeMap::new();
    for i in 0..7 {
        days.insert(date_str(week_start + Duration::days(i)), Tally::default());
    }
    let mut per_student: HashMap<String, (String, Tally)> = HashMap::new();
    for (student_id, name, date, status) in &rows {
        if *date >= week_from {
            if let Some(t) = days.get_mut(date) {
                t.add(status);
            }
        }
        if *date >= window_from {
            per_student
                .entry(student_id.clone())
                .or_insert_with(|| (name.clone(), Tally::default()))
                .1
                .add(status);
        }
    }

    let daily: Vec<Value> = days
        .iter()
        .map(|(date, t)| {
            json!({
                "date": date,
                "present": t.present,
                "late": t.late,
                "absent": t.absent,
                "excused": t.excused,
                "total": t.total(),
            })
        })
        .collect();

    let mut rates: Vec<(f64, String, String, &Tally)> = per_student
        .iter()
        .filter(|(_, (_, t))| t.total() > 0)
        .map(|(id, (name, t))| {
            let rate = (t.present + t.late) as f64 * 100.0 / t.total() as f64;
            (round_2(rate), id.clone(), name.clone(), t)
        })
        .collect();
    rates.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.2.cmp(&b.2))
    });
    let top: Vec<Value> = rates
        .into_iter()
        .take(clock.settings.rate_top_count.max(1) as usize)
        .map(|(rate, id, name, t)| {
            json!({
                "studentId": id,
                "studentName": name,
                "rate": rate,
                "present": t.present,
                "late": t.late,
                "total": t.total(),
            })
        })
        .collect();

    Ok(json!({
        "today": clock.today_str(),
        "windowDays": window,
        "daily": daily,
        "studentRates": top,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.list" => Some(run_org(state, req, attendance_list)),
        "attendance.upsert" => Some(run_org(state, req, attendance_upsert)),
        "attendance.setStatus" => Some(run_org(state, req, attendance_set_status)),
        "attendance.delete" => Some(run_org(state, req, attendance_delete)),
        "attendance.logs.list" => Some(run_org(state, req, logs_list)),
        "attendance.commuteStatus" => Some(run_org(state, req, commute_status)),
        "attendance.today" => Some(run_org(state, req, attendance_today)),
        "attendance.reconcile" => Some(run_org(state, req, attendance_reconcile)),
        "attendance.stats" => Some(run_org(state, req, attendance_stats)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::Tally;

    #[test]
    fn tally_counts_unknown_status_as_scheduled() {
        let mut t = Tally::default();
        for s in ["present", "late", "absent", "excused", "bogus"] {
            t.add(s);
        }
        assert_eq!(t.present, 1);
        assert_eq!(t.late, 1);
        assert_eq!(t.absent, 1);
        assert_eq!(t.excused, 1);
        assert_eq!(t.scheduled, 1);
        assert_eq!(t.total(), 5);
    }
}
