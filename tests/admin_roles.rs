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

#[test]
fn accounts_bootstrap_and_admin_console_enforce_roles() {
    let workspace = temp_dir("academyd-admin");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let org = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "orgs.create",
        json!({ "name": "한빛학원", "slug": "hanbit" }),
    );
    let org_id = org["organization"]["id"].as_str().expect("org id").to_string();
    request_ok(&mut stdin, &mut reader, "3", "orgs.select", json!({ "orgId": org_id }));

    // First account of the organization needs no session.
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "accounts.create",
        json!({ "name": "원장", "email": "Owner@Hanbit.kr", "role": "owner" }),
    );
    let anon = request(
        &mut stdin,
        &mut reader,
        "5",
        "accounts.create",
        json!({ "name": "강사", "email": "teacher@hanbit.kr", "role": "teacher" }),
    );
    assert_eq!(error_code(&anon), "auth_required");

    let session = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "session.signIn",
        json!({ "email": "owner@hanbit.kr" }),
    );
    assert_eq!(session["session"]["role"], "owner");
    assert_eq!(session["session"]["orgId"].as_str(), Some(org_id.as_str()));

    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "accounts.create",
        json!({ "name": "강사", "email": "teacher@hanbit.kr", "role": "teacher" }),
    );
    let dup = request(
        &mut stdin,
        &mut reader,
        "8",
        "accounts.create",
        json!({ "name": "강사2", "email": "teacher@hanbit.kr", "role": "staff" }),
    );
    assert_eq!(error_code(&dup), "conflict");
    let bad_role = request(
        &mut stdin,
        &mut reader,
        "9",
        "accounts.create",
        json!({ "name": "x", "email": "x@hanbit.kr", "role": "janitor" }),
    );
    assert_eq!(error_code(&bad_role), "bad_params");

    let owner_admin = request(&mut stdin, &mut reader, "10", "admin.plans.list", json!({}));
    assert_eq!(error_code(&owner_admin), "forbidden");
    let allowed = owner_admin
        .pointer("/error/details/allowedRoles")
        .and_then(|v| v.as_array())
        .expect("allowed roles");
    assert_eq!(allowed, &vec![json!("super_admin")]);

    // Teachers cannot manage accounts.
    request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "session.signIn",
        json!({ "email": "teacher@hanbit.kr" }),
    );
    let teacher_create = request(
        &mut stdin,
        &mut reader,
        "12",
        "accounts.create",
        json!({ "name": "직원", "email": "staff@hanbit.kr", "role": "staff" }),
    );
    assert_eq!(error_code(&teacher_create), "forbidden");

    // The first platform administrator bootstraps without super_admin rights.
    request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "session.signIn",
        json!({ "email": "owner@hanbit.kr" }),
    );
    let admin = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "accounts.create",
        json!({ "name": "운영자", "email": "admin@platform.kr", "role": "super_admin" }),
    );
    assert!(admin["account"]["orgId"].is_null());
    let second_admin = request(
        &mut stdin,
        &mut reader,
        "15",
        "accounts.create",
        json!({ "name": "운영자2", "email": "admin2@platform.kr", "role": "super_admin" }),
    );
    assert_eq!(error_code(&second_admin), "forbidden");

    let admin_session = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "session.signIn",
        json!({ "email": "admin@platform.kr" }),
    );
    assert_eq!(admin_session["session"]["role"], "super_admin");

    let empty = request_ok(&mut stdin, &mut reader, "17", "admin.plans.list", json!({}));
    assert_eq!(empty["plans"].as_array().map(|a| a.len()), Some(0));

    let plan = request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "admin.plans.create",
        json!({
            "name": "프로",
            "code": "PRO",
            "priceMonthly": 99000,
            "priceYearly": 990000,
            "maxStudents": 300,
            "features": ["sms", "seats"],
            "sortOrder": 2
        }),
    );
    let plan_id = plan["plan"]["id"].as_str().expect("plan id").to_string();
    assert_eq!(plan["plan"]["code"], "pro");
    assert_eq!(plan["plan"]["organizationCount"], 0);

    let dup_code = request(
        &mut stdin,
        &mut reader,
        "19",
        "admin.plans.create",
        json!({ "name": "또 프로", "code": "pro", "priceMonthly": 1 }),
    );
    assert_eq!(error_code(&dup_code), "conflict");
    let bad_code = request(
        &mut stdin,
        &mut reader,
        "20",
        "admin.plans.create",
        json!({ "name": "이상함", "code": "pro plan", "priceMonthly": 1 }),
    );
    assert_eq!(error_code(&bad_code), "bad_params");

    let unknown_plan = request(
        &mut stdin,
        &mut reader,
        "21",
        "orgs.update",
        json!({ "orgId": org_id, "subscriptionPlan": "enterprise" }),
    );
    assert_eq!(error_code(&unknown_plan), "bad_params");
    request_ok(
        &mut stdin,
        &mut reader,
        "22",
        "orgs.update",
        json!({ "orgId": org_id, "subscriptionPlan": "pro" }),
    );

    let in_use = request(
        &mut stdin,
        &mut reader,
        "23",
        "admin.plans.delete",
        json!({ "id": plan_id }),
    );
    assert_eq!(error_code(&in_use), "conflict");
    assert_eq!(
        in_use.pointer("/error/details/organizationCount").and_then(|v| v.as_i64()),
        Some(1)
    );
    let recode = request(
        &mut stdin,
        &mut reader,
        "24",
        "admin.plans.update",
        json!({ "id": plan_id, "code": "premium" }),
    );
    assert_eq!(error_code(&recode), "conflict");
    let renamed = request_ok(
        &mut stdin,
        &mut reader,
        "25",
        "admin.plans.update",
        json!({ "id": plan_id, "name": "프로 플러스", "priceMonthly": 129000 }),
    );
    assert_eq!(renamed["plan"]["name"], "프로 플러스");
    assert_eq!(renamed["plan"]["organizationCount"], 1);

    let pricing = request_ok(&mut stdin, &mut reader, "26", "admin.messagePricing.list", json!({}));
    let types: Vec<&str> = pricing["pricing"]
        .as_array()
        .expect("pricing")
        .iter()
        .filter_map(|p| p["messageType"].as_str())
        .collect();
    assert_eq!(types, vec!["kakao_alimtalk", "sms"]);
    let negative = request(
        &mut stdin,
        &mut reader,
        "27",
        "admin.messagePricing.update",
        json!({ "messageType": "sms", "price": -1 }),
    );
    assert_eq!(error_code(&negative), "bad_params");
    let sms = request_ok(
        &mut stdin,
        &mut reader,
        "28",
        "admin.messagePricing.update",
        json!({ "messageType": "sms", "price": 25 }),
    );
    assert_eq!(sms["pricing"]["price"], 25);
    assert_eq!(sms["pricing"]["cost"], 10);

    let logs = request_ok(&mut stdin, &mut reader, "29", "admin.auditLogs.list", json!({}));
    let actions: Vec<&str> = logs["logs"]
        .as_array()
        .expect("logs")
        .iter()
        .filter_map(|l| l["action"].as_str())
        .collect();
    assert_eq!(actions, vec!["message_pricing.update", "plan.update", "plan.create"]);
    assert_eq!(logs["logs"][0]["adminName"], "운영자");
    let plan_logs = request_ok(
        &mut stdin,
        &mut reader,
        "30",
        "admin.auditLogs.list",
        json!({ "targetType": "plan" }),
    );
    assert_eq!(plan_logs["logs"].as_array().map(|a| a.len()), Some(2));

    request_ok(&mut stdin, &mut reader, "31", "session.signOut", json!({}));
    let current = request_ok(&mut stdin, &mut reader, "32", "session.current", json!({}));
    assert!(current["session"].is_null());
    let signed_out = request(&mut stdin, &mut reader, "33", "admin.auditLogs.list", json!({}));
    assert_eq!(error_code(&signed_out), "auth_required");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn tenant_accounts_cannot_reach_other_organizations() {
    let workspace = temp_dir("academyd-tenants");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let a = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "orgs.create",
        json!({ "name": "한빛학원", "slug": "hanbit" }),
    );
    let a_id = a["organization"]["id"].as_str().expect("org a").to_string();
    let b = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "orgs.create",
        json!({ "name": "새롬학원", "slug": "saerom" }),
    );
    let b_id = b["organization"]["id"].as_str().expect("org b").to_string();

    // Changing or removing an organization needs a session.
    let anon_update = request(
        &mut stdin,
        &mut reader,
        "4",
        "orgs.update",
        json!({ "orgId": b_id, "name": "가로챔" }),
    );
    assert_eq!(error_code(&anon_update), "auth_required");
    let anon_delete = request(&mut stdin, &mut reader, "5", "orgs.delete", json!({ "orgId": b_id }));
    assert_eq!(error_code(&anon_delete), "auth_required");

    request_ok(&mut stdin, &mut reader, "6", "orgs.select", json!({ "orgId": a_id }));
    request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "accounts.create",
        json!({ "name": "한빛 원장", "email": "owner@hanbit.kr", "role": "owner" }),
    );
    // Leave organization B selected, then sign in as A's owner.
    request_ok(&mut stdin, &mut reader, "8", "orgs.select", json!({ "orgId": b_id }));
    request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "session.signIn",
        json!({ "email": "owner@hanbit.kr" }),
    );
    let session = request_ok(&mut stdin, &mut reader, "10", "session.current", json!({}));
    assert_eq!(session["session"]["orgId"].as_str(), Some(a_id.as_str()));

    let hop = request(&mut stdin, &mut reader, "11", "orgs.select", json!({ "orgId": b_id }));
    assert_eq!(error_code(&hop), "forbidden");
    assert_eq!(hop.pointer("/error/details/orgId").and_then(|v| v.as_str()), Some(b_id.as_str()));
    let by_slug = request(&mut stdin, &mut reader, "12", "orgs.select", json!({ "slug": "saerom" }));
    assert_eq!(error_code(&by_slug), "forbidden");
    // Still working inside A.
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "teachers.create",
        json!({ "name": "김강사", "email": "kim@hanbit.kr" }),
    );
    assert!(teacher["teacher"]["id"].is_string());

    let foreign_update = request(
        &mut stdin,
        &mut reader,
        "14",
        "orgs.update",
        json!({ "orgId": b_id, "name": "가로챔" }),
    );
    assert_eq!(error_code(&foreign_update), "forbidden");
    let foreign_delete = request(&mut stdin, &mut reader, "15", "orgs.delete", json!({ "orgId": b_id }));
    assert_eq!(error_code(&foreign_delete), "forbidden");
    let own_update = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "orgs.update",
        json!({ "orgId": a_id, "phone": "02-123-4567" }),
    );
    assert_eq!(own_update["organization"]["phone"], "02-123-4567");

    // Staff of the organization cannot change it.
    request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "accounts.create",
        json!({ "name": "한빛 강사", "email": "teacher@hanbit.kr", "role": "teacher" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "18",
        "session.signIn",
        json!({ "email": "teacher@hanbit.kr" }),
    );
    let staff_update = request(
        &mut stdin,
        &mut reader,
        "19",
        "orgs.update",
        json!({ "orgId": a_id, "name": "바꿈" }),
    );
    assert_eq!(error_code(&staff_update), "forbidden");

    // Platform administrators work across organizations.
    request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "session.signIn",
        json!({ "email": "owner@hanbit.kr" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "21",
        "accounts.create",
        json!({ "name": "운영자", "email": "admin@platform.kr", "role": "super_admin" }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "22",
        "session.signIn",
        json!({ "email": "admin@platform.kr" }),
    );
    request_ok(&mut stdin, &mut reader, "23", "orgs.select", json!({ "orgId": b_id }));
    let renamed = request_ok(
        &mut stdin,
        &mut reader,
        "24",
        "orgs.update",
        json!({ "orgId": b_id, "name": "새롬학원 본점" }),
    );
    assert_eq!(renamed["organization"]["name"], "새롬학원 본점");
    request_ok(&mut stdin, &mut reader, "25", "orgs.delete", json!({ "orgId": b_id }));
    let listed = request_ok(&mut stdin, &mut reader, "26", "orgs.list", json!({}));
    assert_eq!(listed["organizations"].as_array().map(|a| a.len()), Some(1));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
