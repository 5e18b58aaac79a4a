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

fn create_consultation(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    student: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "consultations.create",
        json!({
            "studentName": student,
            "studentGrade": "중2",
            "parentName": "보호자",
            "parentPhone": "010-1234-5678",
            "parentEmail": "parent@example.com"
        }),
    );
    created
        .pointer("/consultation/id")
        .and_then(|v| v.as_str())
        .expect("consultation id")
        .to_string()
}

#[test]
fn consultation_pipeline_moves_through_waitlists() {
    let workspace = temp_dir("academy-consultations");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let s = &mut stdin;
    let r = &mut reader;

    request_ok(s, r, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let no_org = request(s, r, "2", "consultations.list", json!({}));
    assert_eq!(error_code(&no_org), "no_org");

    let org = request_ok(s, r, "3", "orgs.create", json!({ "name": "푸른 학원", "slug": "pureun" }));
    let org_id = org
        .pointer("/organization/id")
        .and_then(|v| v.as_str())
        .expect("org id")
        .to_string();
    request_ok(s, r, "4", "orgs.select", json!({ "orgId": org_id }));

    let bad_email = request(
        s,
        r,
        "5",
        "consultations.create",
        json!({
            "studentName": "박지후",
            "parentName": "박보호",
            "parentPhone": "010-0000-0000",
            "parentEmail": "not-an-email"
        }),
    );
    assert_eq!(error_code(&bad_email), "bad_params");

    let first = create_consultation(s, r, "6", "박지후");
    let second = create_consultation(s, r, "7", "최하은");

    let waitlist = request_ok(s, r, "8", "waitlists.create", json!({ "name": "중등 수학 대기" }));
    let waitlist_id = waitlist
        .pointer("/waitlist/id")
        .and_then(|v| v.as_str())
        .expect("waitlist id")
        .to_string();

    // Waitlisting is a confirmed move.
    let unconfirmed = request(
        s,
        r,
        "9",
        "consultations.setStatus",
        json!({ "id": first, "status": "waitlist", "waitlistId": waitlist_id }),
    );
    assert_eq!(error_code(&unconfirmed), "confirmation_required");

    let moved = request_ok(
        s,
        r,
        "10",
        "consultations.setStatus",
        json!({ "id": first, "status": "waitlist", "waitlistId": waitlist_id, "confirm": true }),
    );
    assert_eq!(moved.get("waitlistPosition").and_then(|v| v.as_i64()), Some(1));

    // Joining a second waitlist while already waitlisted is still confirmed.
    let other = request_ok(s, r, "10a", "waitlists.create", json!({ "name": "고등 영어 대기" }));
    let other_id = other
        .pointer("/waitlist/id")
        .and_then(|v| v.as_str())
        .expect("second waitlist id")
        .to_string();
    let rejoin = request(
        s,
        r,
        "10b",
        "consultations.setStatus",
        json!({ "id": first, "status": "waitlist", "waitlistId": other_id }),
    );
    assert_eq!(error_code(&rejoin), "confirmation_required");
    let other_loaded = request_ok(s, r, "10c", "waitlists.get", json!({ "id": other_id }));
    assert_eq!(
        other_loaded.pointer("/waitlist/consultationCount").and_then(|v| v.as_i64()),
        Some(0)
    );
    request_ok(s, r, "10d", "waitlists.delete", json!({ "id": other_id }));

    // Guarded statuses cannot be set at creation time.
    for (i, status) in ["enrolled", "waitlist"].iter().enumerate() {
        let direct = request(
            s,
            r,
            &format!("10e{}", i),
            "consultations.create",
            json!({
                "studentName": "바로등록",
                "parentName": "보호자",
                "parentPhone": "010-0000-0000",
                "status": status
            }),
        );
        assert_eq!(error_code(&direct), "bad_params", "{}", direct);
    }

    let added = request_ok(
        s,
        r,
        "11",
        "waitlists.addConsultation",
        json!({ "waitlistId": waitlist_id, "consultationId": second }),
    );
    assert_eq!(added.get("position").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(added.get("consultationCount").and_then(|v| v.as_i64()), Some(2));
    let duplicate = request(
        s,
        r,
        "12",
        "waitlists.addConsultation",
        json!({ "waitlistId": waitlist_id, "consultationId": second }),
    );
    assert_eq!(error_code(&duplicate), "conflict");

    let loaded = request_ok(s, r, "13", "waitlists.get", json!({ "id": waitlist_id }));
    let ids: Vec<&str> = loaded
        .pointer("/waitlist/consultationIds")
        .and_then(|v| v.as_array())
        .expect("consultationIds")
        .iter()
        .filter_map(|v| v.as_str())
        .collect();
    assert_eq!(ids, vec![first.as_str(), second.as_str()]);

    let status_key = request(
        s,
        r,
        "14",
        "consultations.update",
        json!({ "id": first, "status": "enrolled" }),
    );
    assert_eq!(error_code(&status_key), "bad_params");

    // Enrolling leaves every waitlist and stamps the enrolment date.
    let enrolled = request_ok(
        s,
        r,
        "15",
        "consultations.setStatus",
        json!({ "id": first, "status": "enrolled", "confirm": true, "enrolledDate": "2026-03-05" }),
    );
    assert_eq!(
        enrolled.pointer("/consultation/enrolledDate").and_then(|v| v.as_str()),
        Some("2026-03-05")
    );
    assert_eq!(enrolled.get("previousStatus").and_then(|v| v.as_str()), Some("waitlist"));
    assert_eq!(
        enrolled.get("leftWaitlists").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(1)
    );

    let after = request_ok(s, r, "16", "waitlists.list", json!({}));
    assert_eq!(
        after.pointer("/waitlists/0/consultationCount").and_then(|v| v.as_i64()),
        Some(1)
    );

    let again = request_ok(
        s,
        r,
        "17",
        "consultations.setStatus",
        json!({ "id": first, "status": "enrolled" }),
    );
    assert_eq!(
        again.pointer("/consultation/enrolledDate").and_then(|v| v.as_str()),
        Some("2026-03-05")
    );

    request_ok(s, r, "18", "consultations.delete", json!({ "id": second }));
    let emptied = request_ok(s, r, "19", "waitlists.get", json!({ "id": waitlist_id }));
    assert_eq!(
        emptied.pointer("/waitlist/consultationCount").and_then(|v| v.as_i64()),
        Some(0)
    );

    let enrolled_only = request_ok(s, r, "20", "consultations.list", json!({ "status": "enrolled" }));
    assert_eq!(
        enrolled_only.get("consultations").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(1)
    );

    let activity = request_ok(s, r, "21", "activity.list", json!({ "entityType": "consultation" }));
    let actions: Vec<&str> = activity
        .get("activities")
        .and_then(|v| v.as_array())
        .expect("activities")
        .iter()
        .filter_map(|a| a.get("actionType").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(
        actions,
        vec!["delete", "status_change", "status_change", "status_change", "create", "create"]
    );

    let _ = std::fs::remove_dir_all(workspace);
}
