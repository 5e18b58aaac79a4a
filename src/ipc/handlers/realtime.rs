use crate::ipc::helpers::{
    get_limit, get_optional_i64, insert_err, now_stored, query_err, run_org, HandlerErr, OrgCtx,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// Appends one row to the change feed. Call inside the mutating transaction.
pub fn emit(
    conn: &Connection,
    org_id: &str,
    table: &str,
    kind: ChangeKind,
    record_id: &str,
    payload: &Value,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO change_events(org_id, table_name, event_type, record_id, payload_json, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            org_id,
            table,
            kind.as_str(),
            record_id,
            payload.to_string(),
            now_stored(),
        ),
    )
    .map_err(insert_err("change_events"))?;
    Ok(())
}

fn realtime_poll(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let after = get_optional_i64(ctx.params, "afterSeq")?.unwrap_or(0);
    let limit = get_limit(ctx.params, "limit", 100, 500)?;
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT seq, table_name, event_type, record_id, payload_json, created_at
             FROM change_events
             WHERE org_id = ? AND seq > ?
             ORDER BY seq
             LIMIT ?",
        )
        .map_err(query_err)?;
    let events = stmt
        .query_map((ctx.org_id, after, limit), |r| {
            let payload: String = r.get(4)?;
            Ok(json!({
                "seq": r.get::<_, i64>(0)?,
                "table": r.get::<_, String>(1)?,
                "eventType": r.get::<_, String>(2)?,
                "recordId": r.get::<_, String>(3)?,
                "payload": serde_json::from_str::<Value>(&payload).unwrap_or(Value::Null),
                "createdAt": r.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    let last_seq = events
        .last()
        .and_then(|e| e["seq"].as_i64())
        .unwrap_or(after);
    Ok(json!({ "events": events, "lastSeq": last_seq }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "realtime.poll" => Some(run_org(state, req, realtime_poll)),
        _ => None,
    }
}
