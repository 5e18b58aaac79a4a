use crate::ipc::handlers::attendance::{self, LocalClock};
use crate::ipc::handlers::realtime::{self, ChangeKind};
use crate::ipc::handlers::setup::{self, SeatSettings};
use crate::ipc::handlers::students::require_student;
use crate::ipc::helpers::{
    commit_err, delete_err, get_optional_date, get_optional_i64, get_optional_str,
    get_required_i64, get_required_str, insert_err, new_id, now_stored, query_err, run_org, tx_err,
    update_err, HandlerErr, OrgCtx,
};
use crate::ipc::types::{AppState, Request};
use crate::schedule;
use crate::timers::{self, SeatIndicator};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use std::collections::HashMap;

const MAX_SEATS: i64 = 100;
const MAX_TYPE_NAME_CHARS: usize = 50;

#[derive(Debug, Clone)]
struct SeatRow {
    seat_number: i64,
    student_id: String,
    student_name: String,
    status: String,
    session_start: Option<String>,
    allocated_minutes: Option<i64>,
    pass_type: String,
    remaining_minutes: Option<i64>,
}

const SEAT_SELECT: &str = "SELECT a.seat_number, a.student_id, s.name, a.status, a.session_start_time,
            a.allocated_minutes, s.pass_type, s.remaining_minutes
     FROM seat_assignments a JOIN students s ON s.id = a.student_id";

fn seat_row(r: &Row) -> rusqlite::Result<SeatRow> {
    Ok(SeatRow {
        seat_number: r.get(0)?,
        student_id: r.get(1)?,
        student_name: r.get(2)?,
        status: r.get(3)?,
        session_start: r.get(4)?,
        allocated_minutes: r.get(5)?,
        pass_type: r.get(6)?,
        remaining_minutes: r.get(7)?,
    })
}

impl SeatRow {
    fn checked_in(&self) -> bool {
        self.status == "checked_in"
    }

    /// Minutes granted to an hour-pass session, if the student has one.
    fn allotted_minutes(&self) -> Option<i64> {
        if self.pass_type != "hours" {
            return None;
        }
        self.allocated_minutes.or(self.remaining_minutes)
    }

    fn to_json(&self) -> Value {
        json!({
            "seatNumber": self.seat_number,
            "studentId": self.student_id,
            "studentName": self.student_name,
            "status": self.status,
            "sessionStartTime": self.session_start,
            "allocatedMinutes": self.allocated_minutes,
            "passType": self.pass_type,
            "remainingMinutes": self.remaining_minutes,
        })
    }
}

fn seat_config(conn: &Connection, org_id: &str) -> Result<Option<(String, i64)>, HandlerErr> {
    conn.query_row(
        "SELECT type_name, total_seats FROM seat_config WHERE org_id = ?",
        [org_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .optional()
    .map_err(query_err)
}

fn load_seat(conn: &Connection, org_id: &str, seat_number: i64) -> Result<SeatRow, HandlerErr> {
    conn.query_row(
        &format!("{} WHERE a.org_id = ? AND a.seat_number = ?", SEAT_SELECT),
        (org_id, seat_number),
        seat_row,
    )
    .optional()
    .map_err(query_err)?
    .ok_or_else(|| HandlerErr::not_found("seat assignment").with_details(json!({ "seatNumber": seat_number })))
}

fn require_checked_in(seat: &SeatRow) -> Result<(), HandlerErr> {
    if !seat.checked_in() {
        return Err(HandlerErr::conflict("student is not checked in")
            .with_details(json!({ "seatNumber": seat.seat_number })));
    }
    Ok(())
}

fn seat_number_param(params: &Value) -> Result<i64, HandlerErr> {
    let n = get_required_i64(params, "seatNumber")?;
    if !(1..=MAX_SEATS).contains(&n) {
        return Err(HandlerErr::bad_params(format!("seatNumber must be in 1..={}", MAX_SEATS)));
    }
    Ok(n)
}

fn seat_clock(ctx: &OrgCtx) -> Result<(LocalClock, SeatSettings), HandlerErr> {
    Ok((attendance::clock(ctx)?, setup::seat_settings(ctx.conn, ctx.org_id)?))
}

fn config_get(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let config = seat_config(ctx.conn, ctx.org_id)?
        .map(|(type_name, total)| json!({ "typeName": type_name, "totalSeats": total }));
    Ok(json!({ "config": config }))
}

fn config_set(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let type_name = get_required_str(ctx.params, "typeName")?;
    if type_name.chars().count() > MAX_TYPE_NAME_CHARS {
        return Err(HandlerErr::bad_params(format!(
            "typeName must be at most {} characters",
            MAX_TYPE_NAME_CHARS
        )));
    }
    let total = get_required_i64(ctx.params, "totalSeats")?;
    if !(1..=MAX_SEATS).contains(&total) {
        return Err(HandlerErr::bad_params(format!("totalSeats must be in 1..={}", MAX_SEATS)));
    }
    let beyond: i64 = ctx
        .conn
        .query_row(
            "SELECT COUNT(*) FROM seat_assignments WHERE org_id = ? AND seat_number > ?",
            (ctx.org_id, total),
            |r| r.get(0),
        )
        .map_err(query_err)?;
    if beyond > 0 {
        return Err(HandlerErr::conflict("seats beyond the new total are still assigned")
            .with_details(json!({ "assignedBeyond": beyond })));
    }
    ctx.conn
        .execute(
            "INSERT INTO seat_config(org_id, type_name, total_seats) VALUES(?, ?, ?)
             ON CONFLICT(org_id) DO UPDATE SET
               type_name = excluded.type_name,
               total_seats = excluded.total_seats",
            (ctx.org_id, &type_name, total),
        )
        .map_err(insert_err("seat_config"))?;
    config_get(ctx)
}

fn seats_list(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let mut stmt = ctx
        .conn
        .prepare(&format!("{} WHERE a.org_id = ? ORDER BY a.seat_number", SEAT_SELECT))
        .map_err(query_err)?;
    let seats = stmt
        .query_map([ctx.org_id], seat_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    let config = seat_config(ctx.conn, ctx.org_id)?
        .map(|(type_name, total)| json!({ "typeName": type_name, "totalSeats": total }));
    Ok(json!({
        "config": config,
        "seats": seats.iter().map(SeatRow::to_json).collect::<Vec<_>>(),
    }))
}

fn seats_assign(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let seat_number = seat_number_param(ctx.params)?;
    let student_id = get_required_str(ctx.params, "studentId")?;
    let allocated = get_optional_i64(ctx.params, "allocatedMinutes")?;
    if allocated.is_some_and(|m| m < 0) {
        return Err(HandlerErr::bad_params("allocatedMinutes must not be negative"));
    }
    let Some((_, total)) = seat_config(ctx.conn, ctx.org_id)? else {
        return Err(HandlerErr::bad_params("configure seats first"));
    };
    if seat_number > total {
        return Err(HandlerErr::bad_params(format!("seatNumber must be in 1..={}", total)));
    }
    require_student(ctx.conn, ctx.org_id, &student_id)?;

    let taken = ctx
        .conn
        .query_row(
            "SELECT student_id FROM seat_assignments WHERE org_id = ? AND seat_number = ?",
            (ctx.org_id, seat_number),
            |r| r.get::<_, String>(0),
        )
        .optional()
        .map_err(query_err)?;
    if taken.is_some() {
        return Err(HandlerErr::conflict("seat is already assigned")
            .with_details(json!({ "seatNumber": seat_number })));
    }
    let elsewhere = ctx
        .conn
        .query_row(
            "SELECT seat_number FROM seat_assignments WHERE org_id = ? AND student_id = ?",
            (ctx.org_id, &student_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()
        .map_err(query_err)?;
    if let Some(other) = elsewhere {
        return Err(HandlerErr::conflict("student already has a seat")
            .with_details(json!({ "seatNumber": other })));
    }

    ctx.conn
        .execute(
            "INSERT INTO seat_assignments(org_id, seat_number, student_id, status,
                                          allocated_minutes, assigned_at)
             VALUES(?, ?, ?, 'checked_out', ?, ?)",
            (
                ctx.org_id,
                seat_number,
                &student_id,
                allocated,
                now_stored(),
            ),
        )
        .map_err(insert_err("seat_assignments"))?;
    Ok(json!({ "seat": load_seat(ctx.conn, ctx.org_id, seat_number)?.to_json() }))
}

fn seats_unassign(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let seat_number = seat_number_param(ctx.params)?;
    let seat = load_seat(ctx.conn, ctx.org_id, seat_number)?;
    if seat.checked_in() {
        return Err(HandlerErr::conflict("check the student out first")
            .with_details(json!({ "seatNumber": seat_number })));
    }
    ctx.conn
        .execute(
            "DELETE FROM seat_assignments WHERE org_id = ? AND seat_number = ?",
            (ctx.org_id, seat_number),
        )
        .map_err(delete_err("seat_assignments"))?;
    Ok(json!({ "ok": true }))
}

fn seats_check_in(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let seat_number = seat_number_param(ctx.params)?;
    let clock = attendance::clock(ctx)?;
    let seat = load_seat(ctx.conn, ctx.org_id, seat_number)?;
    if seat.checked_in() {
        return Err(HandlerErr::conflict("student is already checked in")
            .with_details(json!({ "seatNumber": seat_number })));
    }
    let stamp = schedule::to_stored(clock.now);

    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    tx.execute(
        "UPDATE seat_assignments SET status = 'checked_in', session_start_time = ?
         WHERE org_id = ? AND seat_number = ?",
        (&stamp, ctx.org_id, seat_number),
    )
    .map_err(update_err("seat_assignments"))?;
    let log_id = new_id();
    tx.execute(
        "INSERT INTO attendance_logs(id, org_id, student_id, seat_number, check_in_time)
         VALUES(?, ?, ?, ?, ?)",
        (&log_id, ctx.org_id, &seat.student_id, seat_number, &stamp),
    )
    .map_err(insert_err("attendance_logs"))?;
    let class_attendance =
        attendance::record_seat_check_in(&tx, ctx.org_id, &seat.student_id, &clock)?;
    tx.commit().map_err(commit_err)?;

    tracing::debug!(seat = seat_number, student_id = %seat.student_id, "checked in");
    Ok(json!({
        "seat": load_seat(ctx.conn, ctx.org_id, seat_number)?.to_json(),
        "logId": log_id,
        "classAttendance": class_attendance,
    }))
}

fn close_sleep(
    conn: &Connection,
    org_id: &str,
    id: &str,
    sleep_time: &str,
    now: chrono::DateTime<chrono::Utc>,
    status: &str,
) -> Result<Value, HandlerErr> {
    let duration = schedule::parse_instant(sleep_time)
        .map(|start| schedule::duration_minutes_ceil(start, now))
        .unwrap_or(0);
    conn.execute(
        "UPDATE sleep_records SET wake_time = ?, duration_minutes = ?, status = ?
         WHERE id = ? AND status = 'sleeping'",
        (schedule::to_stored(now), duration, status, id),
    )
    .map_err(update_err("sleep_records"))?;
    let record = load_sleep(conn, id)?;
    realtime::emit(conn, org_id, "sleep_records", ChangeKind::Update, id, &record)?;
    Ok(record)
}

fn close_outing(
    conn: &Connection,
    org_id: &str,
    id: &str,
    outing_time: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<Value, HandlerErr> {
    let duration = schedule::parse_instant(outing_time)
        .map(|start| schedule::duration_minutes_ceil(start, now))
        .unwrap_or(0);
    conn.execute(
        "UPDATE outing_records SET return_time = ?, duration_minutes = ?, status = 'returned'
         WHERE id = ? AND status = 'out'",
        (schedule::to_stored(now), duration, id),
    )
    .map_err(update_err("outing_records"))?;
    let record = load_outing(conn, id)?;
    realtime::emit(conn, org_id, "outing_records", ChangeKind::Update, id, &record)?;
    Ok(record)
}

fn seats_check_out(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let seat_number = seat_number_param(ctx.params)?;
    let clock = attendance::clock(ctx)?;
    let seat = load_seat(ctx.conn, ctx.org_id, seat_number)?;
    require_checked_in(&seat)?;
    let stamp = schedule::to_stored(clock.now);

    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    if let Some((id, started)) = open_record(&tx, ctx.org_id, seat_number, OpenKind::Sleep)? {
        close_sleep(&tx, ctx.org_id, &id, &started, clock.now, "awake")?;
    }
    if let Some((id, started)) = open_record(&tx, ctx.org_id, seat_number, OpenKind::Outing)? {
        close_outing(&tx, ctx.org_id, &id, &started, clock.now)?;
    }

    let open_log: Option<(String, String)> = tx
        .query_row(
            "SELECT id, check_in_time FROM attendance_logs
             WHERE org_id = ? AND student_id = ? AND check_out_time IS NULL
             ORDER BY check_in_time DESC LIMIT 1",
            (ctx.org_id, &seat.student_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(query_err)?;
    let mut duration: Option<i64> = None;
    if let Some((log_id, check_in)) = open_log.as_ref() {
        let minutes = schedule::parse_instant(check_in)
            .map(|start| schedule::duration_minutes_ceil(start, clock.now))
            .unwrap_or(0);
        tx.execute(
            "UPDATE attendance_logs SET check_out_time = ?, duration_minutes = ? WHERE id = ?",
            (&stamp, minutes, log_id),
        )
        .map_err(update_err("attendance_logs"))?;
        duration = Some(minutes);
    }
    if seat.pass_type == "hours" {
        if let Some(minutes) = duration {
            tx.execute(
                "UPDATE students SET remaining_minutes = MAX(0, COALESCE(remaining_minutes, 0) - ?)
                 WHERE id = ?",
                (minutes, &seat.student_id),
            )
            .map_err(update_err("students"))?;
        }
    }
    tx.execute(
        "UPDATE seat_assignments SET status = 'checked_out', session_start_time = NULL
         WHERE org_id = ? AND seat_number = ?",
        (ctx.org_id, seat_number),
    )
    .map_err(update_err("seat_assignments"))?;
    let class_attendance = attendance::record_seat_check_out(
        &tx,
        ctx.org_id,
        &seat.student_id,
        seat.session_start.as_deref(),
        &clock,
    )?;
    tx.commit().map_err(commit_err)?;

    tracing::debug!(seat = seat_number, student_id = %seat.student_id, "checked out");
    Ok(json!({
        "seat": load_seat(ctx.conn, ctx.org_id, seat_number)?.to_json(),
        "durationMinutes": duration,
        "classAttendance": class_attendance,
    }))
}

#[derive(Debug, Clone, Copy)]
enum OpenKind {
    Sleep,
    Outing,
}

/// Id and start time of the seat's open sleep or outing.
fn open_record(
    conn: &Connection,
    org_id: &str,
    seat_number: i64,
    kind: OpenKind,
) -> Result<Option<(String, String)>, HandlerErr> {
    let sql = match kind {
        OpenKind::Sleep => {
            "SELECT id, sleep_time FROM sleep_records
             WHERE org_id = ? AND seat_number = ? AND status = 'sleeping'
             ORDER BY sleep_time DESC LIMIT 1"
        }
        OpenKind::Outing => {
            "SELECT id, outing_time FROM outing_records
             WHERE org_id = ? AND seat_number = ? AND status = 'out'
             ORDER BY outing_time DESC LIMIT 1"
        }
    };
    conn.query_row(sql, (org_id, seat_number), |r| Ok((r.get(0)?, r.get(1)?)))
        .optional()
        .map_err(query_err)
}

fn ensure_no_open_records(conn: &Connection, org_id: &str, seat_number: i64) -> Result<(), HandlerErr> {
    if open_record(conn, org_id, seat_number, OpenKind::Sleep)?.is_some() {
        return Err(HandlerErr::conflict("student is already sleeping")
            .with_details(json!({ "seatNumber": seat_number })));
    }
    if open_record(conn, org_id, seat_number, OpenKind::Outing)?.is_some() {
        return Err(HandlerErr::conflict("student is out")
            .with_details(json!({ "seatNumber": seat_number })));
    }
    Ok(())
}

fn sleep_json(r: &Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "seatNumber": r.get::<_, i64>(2)?,
        "date": r.get::<_, String>(3)?,
        "sleepTime": r.get::<_, String>(4)?,
        "wakeTime": r.get::<_, Option<String>>(5)?,
        "durationMinutes": r.get::<_, Option<i64>>(6)?,
        "status": r.get::<_, String>(7)?,
    }))
}

fn load_sleep(conn: &Connection, id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(
        "SELECT id, student_id, seat_number, date, sleep_time, wake_time, duration_minutes, status
         FROM sleep_records WHERE id = ?",
        [id],
        sleep_json,
    )
    .map_err(query_err)
}

fn outing_json(r: &Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "seatNumber": r.get::<_, i64>(2)?,
        "date": r.get::<_, String>(3)?,
        "outingTime": r.get::<_, String>(4)?,
        "returnTime": r.get::<_, Option<String>>(5)?,
        "durationMinutes": r.get::<_, Option<i64>>(6)?,
        "reason": r.get::<_, Option<String>>(7)?,
        "status": r.get::<_, String>(8)?,
    }))
}

fn load_outing(conn: &Connection, id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(
        "SELECT id, student_id, seat_number, date, outing_time, return_time, duration_minutes,
                reason, status
         FROM outing_records WHERE id = ?",
        [id],
        outing_json,
    )
    .map_err(query_err)
}

fn sleep_start(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let seat_number = seat_number_param(ctx.params)?;
    let (clock, settings) = seat_clock(ctx)?;
    let seat = load_seat(ctx.conn, ctx.org_id, seat_number)?;
    require_checked_in(&seat)?;
    ensure_no_open_records(ctx.conn, ctx.org_id, seat_number)?;

    let today = clock.today_str();
    let used: i64 = ctx
        .conn
        .query_row(
            "SELECT COUNT(*) FROM sleep_records WHERE org_id = ? AND student_id = ? AND date = ?",
            (ctx.org_id, &seat.student_id, &today),
            |r| r.get(0),
        )
        .map_err(query_err)?;
    if used >= settings.sleep_daily_limit {
        return Err(HandlerErr::conflict("daily sleep limit reached").with_details(json!({
            "used": used,
            "limit": settings.sleep_daily_limit,
        })));
    }

    let id = new_id();
    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    tx.execute(
        "INSERT INTO sleep_records(id, org_id, student_id, seat_number, date, sleep_time, status)
         VALUES(?, ?, ?, ?, ?, ?, 'sleeping')",
        (
            &id,
            ctx.org_id,
            &seat.student_id,
            seat_number,
            &today,
            schedule::to_stored(clock.now),
        ),
    )
    .map_err(insert_err("sleep_records"))?;
    let record = load_sleep(&tx, &id)?;
    realtime::emit(&tx, ctx.org_id, "sleep_records", ChangeKind::Insert, &id, &record)?;
    tx.commit().map_err(commit_err)?;
    Ok(json!({
        "sleep": record,
        "usedToday": used + 1,
        "dailyLimit": settings.sleep_daily_limit,
    }))
}

fn sleep_wake(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let seat_number = seat_number_param(ctx.params)?;
    let clock = attendance::clock(ctx)?;
    let Some((id, started)) = open_record(ctx.conn, ctx.org_id, seat_number, OpenKind::Sleep)? else {
        return Err(HandlerErr::not_found("active sleep"));
    };
    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    let record = close_sleep(&tx, ctx.org_id, &id, &started, clock.now, "awake")?;
    tx.commit().map_err(commit_err)?;
    Ok(json!({ "sleep": record }))
}

/// Wakes every sleep that has run past the configured maximum.
fn sleep_sweep_expired(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let (clock, settings) = seat_clock(ctx)?;
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT id, sleep_time FROM sleep_records
             WHERE org_id = ? AND status = 'sleeping'
             ORDER BY sleep_time",
        )
        .map_err(query_err)?;
    let open = stmt
        .query_map([ctx.org_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;

    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    let mut woken = Vec::new();
    for (id, started) in open {
        let Some(start) = schedule::parse_instant(&started) else {
            continue;
        };
        if timers::sleep_expired(start, clock.now, settings.sleep_max_minutes) {
            woken.push(close_sleep(&tx, ctx.org_id, &id, &started, clock.now, "expired")?);
        }
    }
    tx.commit().map_err(commit_err)?;
    if !woken.is_empty() {
        tracing::info!(count = woken.len(), "expired sleeps woken");
    }
    Ok(json!({ "woken": woken }))
}

fn outing_start(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let seat_number = seat_number_param(ctx.params)?;
    let clock = attendance::clock(ctx)?;
    let seat = load_seat(ctx.conn, ctx.org_id, seat_number)?;
    require_checked_in(&seat)?;
    ensure_no_open_records(ctx.conn, ctx.org_id, seat_number)?;

    let id = new_id();
    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    tx.execute(
        "INSERT INTO outing_records(id, org_id, student_id, seat_number, date, outing_time,
                                    reason, status)
         VALUES(?, ?, ?, ?, ?, ?, ?, 'out')",
        (
            &id,
            ctx.org_id,
            &seat.student_id,
            seat_number,
            clock.today_str(),
            schedule::to_stored(clock.now),
            get_optional_str(ctx.params, "reason")?,
        ),
    )
    .map_err(insert_err("outing_records"))?;
    let record = load_outing(&tx, &id)?;
    realtime::emit(&tx, ctx.org_id, "outing_records", ChangeKind::Insert, &id, &record)?;
    tx.commit().map_err(commit_err)?;
    Ok(json!({ "outing": record }))
}

fn outing_return(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let seat_number = seat_number_param(ctx.params)?;
    let clock = attendance::clock(ctx)?;
    let Some((id, started)) = open_record(ctx.conn, ctx.org_id, seat_number, OpenKind::Outing)? else {
        return Err(HandlerErr::not_found("active outing"));
    };
    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    let record = close_outing(&tx, ctx.org_id, &id, &started, clock.now)?;
    tx.commit().map_err(commit_err)?;
    Ok(json!({ "outing": record }))
}

const CALL_COLUMNS: &str = "c.id, c.student_id, s.name, c.seat_number, c.date, c.call_time, \
                            c.acknowledged_time, c.message, c.status";

fn call_json(r: &Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentId": r.get::<_, String>(1)?,
        "studentName": r.get::<_, String>(2)?,
        "seatNumber": r.get::<_, i64>(3)?,
        "date": r.get::<_, String>(4)?,
        "callTime": r.get::<_, String>(5)?,
        "acknowledgedTime": r.get::<_, Option<String>>(6)?,
        "message": r.get::<_, String>(7)?,
        "status": r.get::<_, String>(8)?,
    }))
}

fn load_call(conn: &Connection, org_id: &str, id: &str) -> Result<Value, HandlerErr> {
    conn.query_row(
        &format!(
            "SELECT {} FROM call_records c JOIN students s ON s.id = c.student_id
             WHERE c.id = ? AND c.org_id = ?",
            CALL_COLUMNS
        ),
        (id, org_id),
        call_json,
    )
    .optional()
    .map_err(query_err)?
    .ok_or_else(|| HandlerErr::not_found("call"))
}

fn calls_create(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let seat_number = seat_number_param(ctx.params)?;
    let message = get_required_str(ctx.params, "message")?;
    let clock = attendance::clock(ctx)?;
    let seat = load_seat(ctx.conn, ctx.org_id, seat_number)?;
    let id = new_id();
    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    tx.execute(
        "INSERT INTO call_records(id, org_id, student_id, seat_number, date, call_time, message, status)
         VALUES(?, ?, ?, ?, ?, ?, ?, 'calling')",
        (
            &id,
            ctx.org_id,
            &seat.student_id,
            seat_number,
            clock.today_str(),
            schedule::to_stored(clock.now),
            &message,
        ),
    )
    .map_err(insert_err("call_records"))?;
    let record = load_call(&tx, ctx.org_id, &id)?;
    realtime::emit(&tx, ctx.org_id, "call_records", ChangeKind::Insert, &id, &record)?;
    tx.commit().map_err(commit_err)?;
    Ok(json!({ "call": record }))
}

fn calls_acknowledge(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let id = get_required_str(ctx.params, "id")?;
    let clock = attendance::clock(ctx)?;
    let current = load_call(ctx.conn, ctx.org_id, &id)?;
    if current["status"] != "calling" {
        return Ok(json!({ "call": current }));
    }
    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    tx.execute(
        "UPDATE call_records SET status = 'acknowledged', acknowledged_time = ? WHERE id = ?",
        (schedule::to_stored(clock.now), &id),
    )
    .map_err(update_err("call_records"))?;
    let record = load_call(&tx, ctx.org_id, &id)?;
    realtime::emit(&tx, ctx.org_id, "call_records", ChangeKind::Update, &id, &record)?;
    tx.commit().map_err(commit_err)?;
    Ok(json!({ "call": record }))
}

fn calls_delete(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let id = get_required_str(ctx.params, "id")?;
    load_call(ctx.conn, ctx.org_id, &id)?;
    let tx = ctx.conn.unchecked_transaction().map_err(tx_err)?;
    tx.execute("DELETE FROM call_records WHERE id = ?", [&id])
        .map_err(delete_err("call_records"))?;
    realtime::emit(&tx, ctx.org_id, "call_records", ChangeKind::Delete, &id, &json!({ "id": id }))?;
    tx.commit().map_err(commit_err)?;
    Ok(json!({ "ok": true }))
}

fn calls_list(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let date = match get_optional_date(ctx.params, "date")? {
        Some(d) => d,
        None => attendance::clock(ctx)?.today_str(),
    };
    let mut stmt = ctx
        .conn
        .prepare(&format!(
            "SELECT {} FROM call_records c JOIN students s ON s.id = c.student_id
             WHERE c.org_id = ? AND c.date = ?
             ORDER BY c.call_time DESC",
            CALL_COLUMNS
        ))
        .map_err(query_err)?;
    let calls = stmt
        .query_map((ctx.org_id, &date), call_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "date": date, "calls": calls }))
}

fn open_by_seat(
    conn: &Connection,
    org_id: &str,
    sql: &str,
) -> Result<HashMap<i64, (String, String)>, HandlerErr> {
    let mut stmt = conn.prepare(sql).map_err(query_err)?;
    let rows = stmt
        .query_map([org_id], |r| {
            Ok((r.get::<_, i64>(0)?, (r.get::<_, String>(1)?, r.get::<_, String>(2)?)))
        })
        .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
        .map_err(query_err)?;
    Ok(rows)
}

/// Per-seat snapshot with the timers the dashboard renders.
fn live_status(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let (clock, settings) = seat_clock(ctx)?;
    let Some((type_name, total)) = seat_config(ctx.conn, ctx.org_id)? else {
        return Ok(json!({ "config": null, "now": schedule::to_stored(clock.now), "seats": [] }));
    };

    let mut stmt = ctx
        .conn
        .prepare(&format!("{} WHERE a.org_id = ?", SEAT_SELECT))
        .map_err(query_err)?;
    let assigned: HashMap<i64, SeatRow> = stmt
        .query_map([ctx.org_id], seat_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?
        .into_iter()
        .map(|s| (s.seat_number, s))
        .collect();
    let sleeps = open_by_seat(
        ctx.conn,
        ctx.org_id,
        "SELECT seat_number, id, sleep_time FROM sleep_records
         WHERE org_id = ? AND status = 'sleeping' ORDER BY sleep_time",
    )?;
    let outings = open_by_seat(
        ctx.conn,
        ctx.org_id,
        "SELECT seat_number, id, outing_time FROM outing_records
         WHERE org_id = ? AND status = 'out' ORDER BY outing_time",
    )?;
    let calls = open_by_seat(
        ctx.conn,
        ctx.org_id,
        "SELECT seat_number, id, message FROM call_records
         WHERE org_id = ? AND status = 'calling' ORDER BY call_time",
    )?;

    let mut seats = Vec::with_capacity(total.max(0) as usize);
    for n in 1..=total {
        let Some(seat) = assigned.get(&n) else {
            seats.push(json!({ "seatNumber": n, "assigned": false, "indicator": SeatIndicator::Idle.as_str() }));
            continue;
        };
        let sleep = sleeps.get(&n);
        let outing = outings.get(&n);
        let indicator = SeatIndicator::pick(sleep.is_some(), outing.is_some());

        let sleep_json = sleep.and_then(|(id, started)| {
            let start = schedule::parse_instant(started)?;
            let countdown = timers::sleep_countdown(
                start,
                clock.now,
                settings.sleep_max_minutes,
                settings.expiring_warn_seconds,
            );
            Some(json!({
                "id": id,
                "sleepTime": started,
                "remainingSeconds": countdown.remaining_seconds,
                "expiring": countdown.expiring,
                "expired": countdown.expired,
                "display": countdown.display,
            }))
        });
        let outing_json = outing.and_then(|(id, started)| {
            let start = schedule::parse_instant(started)?;
            let elapsed = timers::elapsed_seconds(start, clock.now);
            Some(json!({
                "id": id,
                "outingTime": started,
                "elapsedSeconds": elapsed,
                "display": timers::format_hh_mm_ss(elapsed),
            }))
        });
        let usage_json = match (seat.checked_in(), seat.session_start.as_deref(), seat.allotted_minutes()) {
            (true, Some(started), Some(allotted)) => schedule::parse_instant(started).map(|start| {
                let remaining = timers::usage_remaining_seconds(start, clock.now, allotted);
                json!({
                    "allottedMinutes": allotted,
                    "remainingSeconds": remaining,
                    "display": timers::format_hh_mm_ss(remaining),
                })
            }),
            _ => None,
        };
        let call_json = calls
            .get(&n)
            .map(|(id, message)| json!({ "id": id, "message": message }));

        seats.push(json!({
            "seatNumber": n,
            "assigned": true,
            "studentId": seat.student_id,
            "studentName": seat.student_name,
            "status": seat.status,
            "indicator": indicator.as_str(),
            "sleep": sleep_json,
            "outing": outing_json,
            "usage": usage_json,
            "call": call_json,
        }));
    }

    Ok(json!({
        "config": { "typeName": type_name, "totalSeats": total },
        "now": schedule::to_stored(clock.now),
        "seats": seats,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "seats.config.get" => Some(run_org(state, req, config_get)),
        "seats.config.set" => Some(run_org(state, req, config_set)),
        "seats.list" => Some(run_org(state, req, seats_list)),
        "seats.assign" => Some(run_org(state, req, seats_assign)),
        "seats.unassign" => Some(run_org(state, req, seats_unassign)),
        "seats.checkIn" => Some(run_org(state, req, seats_check_in)),
        "seats.checkOut" => Some(run_org(state, req, seats_check_out)),
        "seats.sleep.start" => Some(run_org(state, req, sleep_start)),
        "seats.sleep.wake" => Some(run_org(state, req, sleep_wake)),
        "seats.sleep.sweepExpired" => Some(run_org(state, req, sleep_sweep_expired)),
        "seats.outing.start" => Some(run_org(state, req, outing_start)),
        "seats.outing.return" => Some(run_org(state, req, outing_return)),
        "seats.calls.create" => Some(run_org(state, req, calls_create)),
        "seats.calls.acknowledge" => Some(run_org(state, req, calls_acknowledge)),
        "seats.calls.delete" => Some(run_org(state, req, calls_delete)),
        "seats.calls.list" => Some(run_org(state, req, calls_list)),
        "seats.liveStatus" => Some(run_org(state, req, live_status)),
        _ => None,
    }
}
