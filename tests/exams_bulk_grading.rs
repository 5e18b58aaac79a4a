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

fn created_id(value: &serde_json::Value, pointer: &str) -> String {
    value
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", pointer, value))
        .to_string()
}

#[test]
fn bulk_grading_matches_class_roster_and_reports_stats() {
    let workspace = temp_dir("academy-exams");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let s = &mut stdin;
    let r = &mut reader;

    request_ok(s, r, "1", "workspace.select", json!({ "path": workspace.to_string_lossy() }));
    let org = request_ok(s, r, "2", "orgs.create", json!({ "name": "한빛 학원", "slug": "hanbit" }));
    request_ok(s, r, "3", "orgs.select", json!({ "orgId": created_id(&org, "/organization/id") }));

    let hong = created_id(&request_ok(s, r, "4", "students.create", json!({ "name": "홍길동" })), "/student/id");
    let kim = created_id(&request_ok(s, r, "5", "students.create", json!({ "name": "김철수" })), "/student/id");
    let lee = created_id(&request_ok(s, r, "6", "students.create", json!({ "name": "이영희" })), "/student/id");

    let class = request_ok(s, r, "7", "classes.create", json!({ "name": "고1 수학" }));
    let class_id = created_id(&class, "/class/id");
    for (i, sid) in [&hong, &kim].iter().enumerate() {
        request_ok(
            s,
            r,
            &format!("8-{}", i),
            "classes.enroll",
            json!({ "classId": class_id, "studentId": sid }),
        );
    }

    let bad_max = request(
        s,
        r,
        "9",
        "exams.create",
        json!({ "title": "중간고사", "examDate": "2026-04-20", "maxScore": 0 }),
    );
    assert_eq!(error_code(&bad_max), "bad_params");
    let exam = request_ok(
        s,
        r,
        "10",
        "exams.create",
        json!({ "title": "중간고사", "examDate": "2026-04-20", "classId": class_id, "subject": "수학" }),
    );
    let exam_id = created_id(&exam, "/exam/id");

    let text = "홍길동 95 잘함\n김철수: 80\n이영희 70\n점수없음\n";
    let preview = request_ok(
        s,
        r,
        "11",
        "exams.scores.bulkPreview",
        json!({ "examId": exam_id, "text": text }),
    );
    let matched = preview.get("matched").and_then(|v| v.as_array()).expect("matched");
    assert_eq!(matched.len(), 2);
    assert_eq!(matched[0].get("studentId").and_then(|v| v.as_str()), Some(hong.as_str()));
    assert_eq!(matched[0].get("feedback").and_then(|v| v.as_str()), Some("잘함"));
    assert_eq!(matched[1].get("score").and_then(|v| v.as_i64()), Some(80));
    // Not enrolled in the exam's class.
    assert_eq!(
        preview.pointer("/unmatched/0/name").and_then(|v| v.as_str()),
        Some("이영희")
    );
    assert_eq!(preview.pointer("/unparsed/0/lineNo").and_then(|v| v.as_u64()), Some(4));

    let nothing_saved = request_ok(s, r, "12", "exams.scores.get", json!({ "examId": exam_id }));
    assert_eq!(
        nothing_saved.get("scores").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    let applied = request_ok(
        s,
        r,
        "13",
        "exams.scores.bulkApply",
        json!({ "examId": exam_id, "text": text }),
    );
    assert_eq!(applied.get("applied").and_then(|v| v.as_u64()), Some(2));

    let stats = request_ok(s, r, "14", "exams.stats", json!({ "examId": exam_id }));
    assert_eq!(stats.pointer("/stats/count").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(stats.pointer("/stats/average").and_then(|v| v.as_f64()), Some(87.5));
    assert_eq!(stats.pointer("/stats/highest").and_then(|v| v.as_i64()), Some(95));
    assert_eq!(stats.pointer("/stats/lowest").and_then(|v| v.as_i64()), Some(80));
    let buckets = stats.pointer("/stats/distribution").and_then(|v| v.as_array()).expect("distribution");
    assert_eq!(buckets.len(), 10);
    assert_eq!(buckets[8].get("count").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(buckets[9].get("label").and_then(|v| v.as_str()), Some("90-100"));
    assert_eq!(buckets[9].get("count").and_then(|v| v.as_u64()), Some(1));

    let shrink = request(s, r, "15", "exams.update", json!({ "id": exam_id, "maxScore": 90 }));
    assert_eq!(error_code(&shrink), "conflict");

    let too_high = request(
        s,
        r,
        "16",
        "exams.scores.save",
        json!({ "examId": exam_id, "scores": [{ "studentId": lee, "score": 150 }] }),
    );
    assert_eq!(error_code(&too_high), "bad_params");
    let kept = request_ok(s, r, "17", "exams.scores.get", json!({ "examId": exam_id }));
    assert_eq!(kept.get("scores").and_then(|v| v.as_array()).map(|a| a.len()), Some(2));

    let saved = request_ok(
        s,
        r,
        "18",
        "exams.scores.save",
        json!({ "examId": exam_id, "scores": [{ "studentId": kim, "score": 88, "notes": "재시험" }] }),
    );
    assert_eq!(saved.get("saved").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(saved.pointer("/scores/0/score").and_then(|v| v.as_i64()), Some(88));
    assert_eq!(saved.get("scores").and_then(|v| v.as_array()).map(|a| a.len()), Some(1));

    let no_match = request(
        s,
        r,
        "19",
        "exams.scores.bulkApply",
        json!({ "examId": exam_id, "text": "없는학생 50" }),
    );
    assert_eq!(error_code(&no_match), "bad_params");

    let listed = request_ok(s, r, "20", "exams.list", json!({ "examDate": "2026-04-20" }));
    assert_eq!(listed.get("exams").and_then(|v| v.as_array()).map(|a| a.len()), Some(1));

    request_ok(s, r, "21", "exams.delete", json!({ "id": exam_id }));
    let gone = request(s, r, "22", "exams.get", json!({ "id": exam_id }));
    assert_eq!(error_code(&gone), "not_found");

    let _ = std::fs::remove_dir_all(workspace);
}
