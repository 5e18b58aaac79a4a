use crate::ipc::helpers::{
    get_limit, get_optional_str, insert_err, new_id, now_stored, query_err, run_org, HandlerErr,
    OrgCtx,
};
use crate::ipc::types::{Actor, AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};

pub struct Activity<'a> {
    pub action: &'a str,
    pub entity_type: &'a str,
    pub entity_id: &'a str,
    pub entity_name: &'a str,
    pub description: String,
}

pub fn record(
    conn: &Connection,
    org_id: &str,
    actor: Option<&Actor>,
    activity: Activity,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO activity_logs(
            id, org_id, user_id, user_role, action_type, entity_type, entity_id,
            entity_name, description, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            new_id(),
            org_id,
            actor.map(|a| a.user_id.as_str()),
            actor.map(|a| a.role.as_str()),
            activity.action,
            activity.entity_type,
            activity.entity_id,
            activity.entity_name,
            &activity.description,
            now_stored(),
        ),
    )
    .map_err(insert_err("activity_logs"))?;
    Ok(())
}

fn activity_list(ctx: &OrgCtx) -> Result<Value, HandlerErr> {
    let limit = get_limit(ctx.params, "limit", 50, 500)?;
    let entity_type = get_optional_str(ctx.params, "entityType")?;
    let mut stmt = ctx
        .conn
        .prepare(
            "SELECT a.id, a.user_id, u.name, a.user_role, a.action_type, a.entity_type,
                    a.entity_id, a.entity_name, a.description, a.created_at
             FROM activity_logs a
             LEFT JOIN users u ON u.id = a.user_id
             WHERE a.org_id = ?1 AND (?2 IS NULL OR a.entity_type = ?2)
             ORDER BY a.created_at DESC, a.rowid DESC
             LIMIT ?3",
        )
        .map_err(query_err)?;
    let rows = stmt
        .query_map((ctx.org_id, &entity_type, limit), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "userId": r.get::<_, Option<String>>(1)?,
                "userName": r.get::<_, Option<String>>(2)?,
                "userRole": r.get::<_, Option<String>>(3)?,
                "actionType": r.get::<_, String>(4)?,
                "entityType": r.get::<_, String>(5)?,
                "entityId": r.get::<_, Option<String>>(6)?,
                "entityName": r.get::<_, Option<String>>(7)?,
                "description": r.get::<_, String>(8)?,
                "createdAt": r.get::<_, String>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(query_err)?;
    Ok(json!({ "activities": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "activity.list" => Some(run_org(state, req, activity_list)),
        _ => None,
    }
}
