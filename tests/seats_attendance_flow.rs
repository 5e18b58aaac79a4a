use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_academyd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn academyd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .pointer("/error/code")
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn str_at<'a>(value: &'a serde_json::Value, pointer: &str) -> &'a str {
    value
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", pointer, value))
}

#[test]
fn seat_session_tracks_sleep_outing_and_class_attendance() {
    let workspace = temp_dir("academy-seats-flow");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let s = &mut stdin;
    let r = &mut reader;

    request_ok(s, r, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let org = request_ok(s, r, "2", "orgs.create", json!({ "name": "해오름 학원", "slug": "haeoreum" }));
    let org_id = str_at(&org, "/organization/id").to_string();
    request_ok(s, r, "3", "orgs.select", json!({ "orgId": org_id }));

    let student = request_ok(
        s,
        r,
        "4",
        "students.create",
        json!({ "name": "김민수", "passType": "hours", "remainingMinutes": 120 }),
    );
    let student_id = str_at(&student, "/student/id").to_string();
    let other = request_ok(s, r, "5", "students.create", json!({ "name": "이서연" }));
    let other_id = str_at(&other, "/student/id").to_string();

    let class = request_ok(
        s,
        r,
        "6",
        "classes.create",
        json!({
            "name": "수학 심화",
            "schedule": [{ "day": "monday", "startTime": "18:00", "endTime": "20:00" }]
        }),
    );
    let class_id = str_at(&class, "/class/id").to_string();
    request_ok(s, r, "7", "classes.enroll", json!({ "classId": class_id, "studentId": student_id }));

    // Seats cannot be assigned before the room is configured.
    let early = request(s, r, "8", "seats.assign", json!({ "seatNumber": 3, "studentId": student_id }));
    assert_eq!(error_code(&early), "bad_params");

    request_ok(s, r, "9", "seats.config.set", json!({ "typeName": "독서실", "totalSeats": 10 }));
    request_ok(s, r, "10", "seats.assign", json!({ "seatNumber": 3, "studentId": student_id }));
    let taken = request(s, r, "11", "seats.assign", json!({ "seatNumber": 3, "studentId": other_id }));
    assert_eq!(error_code(&taken), "conflict");
    let twice = request(s, r, "12", "seats.assign", json!({ "seatNumber": 4, "studentId": student_id }));
    assert_eq!(error_code(&twice), "conflict");
    let shrink = request(s, r, "13", "seats.config.set", json!({ "typeName": "독서실", "totalSeats": 2 }));
    assert_eq!(error_code(&shrink), "conflict");

    // Monday 18:15 local (UTC+9): fifteen minutes after class start is late.
    let checked_in = request_ok(
        s,
        r,
        "14",
        "seats.checkIn",
        json!({ "seatNumber": 3, "now": "2026-03-02T09:15:00Z" }),
    );
    assert_eq!(str_at(&checked_in, "/seat/status"), "checked_in");
    assert_eq!(str_at(&checked_in, "/classAttendance/status"), "late");
    let again = request(s, r, "15", "seats.checkIn", json!({ "seatNumber": 3, "now": "2026-03-02T09:16:00Z" }));
    assert_eq!(error_code(&again), "conflict");

    let sleep = request_ok(
        s,
        r,
        "16",
        "seats.sleep.start",
        json!({ "seatNumber": 3, "now": "2026-03-02T09:30:00Z" }),
    );
    assert_eq!(sleep.get("usedToday").and_then(|v| v.as_i64()), Some(1));
    let blocked = request(
        s,
        r,
        "17",
        "seats.outing.start",
        json!({ "seatNumber": 3, "now": "2026-03-02T09:31:00Z" }),
    );
    assert_eq!(error_code(&blocked), "conflict");

    let live = request_ok(s, r, "18", "seats.liveStatus", json!({ "now": "2026-03-02T09:40:00Z" }));
    let seats = live.get("seats").and_then(|v| v.as_array()).expect("seats");
    assert_eq!(seats.len(), 10);
    let seat3 = &seats[2];
    assert_eq!(str_at(seat3, "/indicator"), "sleeping");
    assert_eq!(seat3.pointer("/sleep/remainingSeconds").and_then(|v| v.as_i64()), Some(300));
    assert_eq!(str_at(seat3, "/sleep/display"), "05:00");
    assert_eq!(seat3.pointer("/usage/remainingSeconds").and_then(|v| v.as_i64()), Some(95 * 60));
    assert_eq!(str_at(seat3, "/usage/display"), "01:35:00");
    assert_eq!(str_at(&seats[0], "/indicator"), "idle");
    assert_eq!(seats[0].get("assigned").and_then(|v| v.as_bool()), Some(false));

    let swept = request_ok(s, r, "19", "seats.sleep.sweepExpired", json!({ "now": "2026-03-02T09:46:00Z" }));
    let woken = swept.get("woken").and_then(|v| v.as_array()).expect("woken");
    assert_eq!(woken.len(), 1);
    assert_eq!(str_at(&woken[0], "/status"), "expired");
    assert_eq!(woken[0].get("durationMinutes").and_then(|v| v.as_i64()), Some(16));

    let events = request_ok(s, r, "20", "realtime.poll", json!({}));
    let kinds: Vec<&str> = events
        .get("events")
        .and_then(|v| v.as_array())
        .expect("events")
        .iter()
        .filter_map(|e| e.get("eventType").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(kinds, vec!["INSERT", "UPDATE"]);
    let last_seq = events.get("lastSeq").and_then(|v| v.as_i64()).expect("lastSeq");

    request_ok(
        s,
        r,
        "21",
        "seats.outing.start",
        json!({ "seatNumber": 3, "reason": "편의점", "now": "2026-03-02T09:50:00Z" }),
    );

    // Checking out closes the open outing and charges the hour pass.
    let out = request_ok(
        s,
        r,
        "22",
        "seats.checkOut",
        json!({ "seatNumber": 3, "now": "2026-03-02T10:15:00Z" }),
    );
    assert_eq!(out.get("durationMinutes").and_then(|v| v.as_i64()), Some(60));
    assert_eq!(str_at(&out, "/seat/status"), "checked_out");
    assert_eq!(out.pointer("/seat/remainingMinutes").and_then(|v| v.as_i64()), Some(60));

    let later = request_ok(s, r, "23", "realtime.poll", json!({ "afterSeq": last_seq }));
    let later_events = later.get("events").and_then(|v| v.as_array()).expect("events");
    assert_eq!(later_events.len(), 2);
    assert_eq!(str_at(&later_events[1], "/payload/status"), "returned");

    let logs = request_ok(s, r, "24", "attendance.logs.list", json!({ "date": "2026-03-02" }));
    let logs = logs.get("logs").and_then(|v| v.as_array()).expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].get("durationMinutes").and_then(|v| v.as_i64()), Some(60));

    let records = request_ok(s, r, "25", "attendance.list", json!({ "studentId": student_id }));
    assert_eq!(records.get("total").and_then(|v| v.as_i64()), Some(1));
    let record = &records["records"][0];
    assert_eq!(str_at(record, "/status"), "late");
    assert_eq!(str_at(record, "/checkInTime"), "2026-03-02T09:15:00Z");
    assert_eq!(str_at(record, "/checkOutTime"), "2026-03-02T10:15:00Z");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn commute_status_and_reconcile_follow_local_schedule() {
    let workspace = temp_dir("academy-commute");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let s = &mut stdin;
    let r = &mut reader;

    request_ok(s, r, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let org = request_ok(s, r, "2", "orgs.create", json!({ "name": "별빛 학원", "slug": "byeolbit" }));
    let org_id = str_at(&org, "/organization/id").to_string();
    request_ok(s, r, "3", "orgs.select", json!({ "orgId": org_id }));

    let a = request_ok(s, r, "4", "students.create", json!({ "name": "가온" }));
    let a_id = str_at(&a, "/student/id").to_string();
    let b = request_ok(s, r, "5", "students.create", json!({ "name": "나래" }));
    let b_id = str_at(&b, "/student/id").to_string();
    for (i, sid) in [&a_id, &b_id].iter().enumerate() {
        request_ok(
            s,
            r,
            &format!("6-{}", i),
            "students.commuteSchedules.set",
            json!({
                "studentId": sid,
                "schedules": [{ "weekday": "monday", "checkInTime": "17:00", "checkOutTime": "21:00" }]
            }),
        );
    }
    let bad = request(
        s,
        r,
        "7",
        "students.commuteSchedules.set",
        json!({ "studentId": a_id, "schedules": [{ "weekday": "someday" }] }),
    );
    assert_eq!(error_code(&bad), "bad_params");

    request_ok(s, r, "8", "seats.config.set", json!({ "typeName": "자습실", "totalSeats": 5 }));
    request_ok(s, r, "9", "seats.assign", json!({ "seatNumber": 1, "studentId": a_id }));
    // 16:50 local, ten minutes early.
    request_ok(s, r, "10", "seats.checkIn", json!({ "seatNumber": 1, "now": "2026-03-02T07:50:00Z" }));

    let before = request_ok(s, r, "11", "attendance.commuteStatus", json!({ "now": "2026-03-02T07:55:00Z" }));
    assert_eq!(str_at(&before, "/weekday"), "monday");
    let rows = before.get("students").and_then(|v| v.as_array()).expect("students");
    let status_of = |rows: &Vec<serde_json::Value>, id: &str| -> String {
        rows.iter()
            .find(|row| row.get("studentId").and_then(|v| v.as_str()) == Some(id))
            .and_then(|row| row.get("status").and_then(|v| v.as_str()))
            .unwrap_or("")
            .to_string()
    };
    assert_eq!(status_of(rows, &a_id), "present");
    assert_eq!(status_of(rows, &b_id), "scheduled");

    let after = request_ok(s, r, "12", "attendance.commuteStatus", json!({ "now": "2026-03-02T08:30:00Z" }));
    let rows = after.get("students").and_then(|v| v.as_array()).expect("students");
    assert_eq!(status_of(rows, &b_id), "absent");

    let class = request_ok(
        s,
        r,
        "13",
        "classes.create",
        json!({
            "name": "영어 회화",
            "schedule": [{ "day": "월요일", "startTime": "19:00", "endTime": "20:30" }]
        }),
    );
    let class_id = str_at(&class, "/class/id").to_string();
    request_ok(s, r, "14", "classes.enroll", json!({ "classId": class_id, "studentId": b_id }));

    let today = request_ok(s, r, "15", "attendance.today", json!({ "now": "2026-03-02T08:30:00Z" }));
    assert_eq!(str_at(&today, "/students/0/status"), "scheduled");

    let future = request(
        s,
        r,
        "16",
        "attendance.reconcile",
        json!({ "date": "2026-03-02", "now": "2026-03-02T08:30:00Z" }),
    );
    assert_eq!(error_code(&future), "bad_params");
    let first = request_ok(
        s,
        r,
        "17",
        "attendance.reconcile",
        json!({ "date": "2026-02-23", "now": "2026-03-02T08:30:00Z" }),
    );
    assert_eq!(first.get("inserted").and_then(|v| v.as_i64()), Some(1));
    let second = request_ok(
        s,
        r,
        "18",
        "attendance.reconcile",
        json!({ "date": "2026-02-23", "now": "2026-03-02T08:30:00Z" }),
    );
    assert_eq!(second.get("inserted").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(second.get("skipped").and_then(|v| v.as_i64()), Some(1));

    let absent = request_ok(s, r, "19", "attendance.list", json!({ "status": "absent" }));
    assert_eq!(absent.get("total").and_then(|v| v.as_i64()), Some(1));

    let _ = std::fs::remove_dir_all(workspace);
}
