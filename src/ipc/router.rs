use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

type TryHandle = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

const HANDLERS: &[TryHandle] = &[
    handlers::core::try_handle,
    handlers::organizations::try_handle,
    handlers::accounts::try_handle,
    handlers::setup::try_handle,
    handlers::students::try_handle,
    handlers::waitlists::try_handle,
    handlers::consultations::try_handle,
    handlers::activity::try_handle,
    handlers::teachers::try_handle,
    handlers::exams::try_handle,
    handlers::attendance::try_handle,
    handlers::seats::try_handle,
    handlers::expenses::try_handle,
    handlers::realtime::try_handle,
    handlers::admin::try_handle,
];

fn log_outcome(req: &Request, resp: &serde_json::Value) {
    if resp.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = resp
            .pointer("/error/code")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        tracing::warn!(id = %req.id, method = %req.method, code, "request failed");
    }
}

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    tracing::debug!(id = %req.id, method = %req.method, "request");
    for try_handle in HANDLERS {
        if let Some(resp) = try_handle(state, &req) {
            log_outcome(&req, &resp);
            return resp;
        }
    }

    let resp = err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    );
    log_outcome(&req, &resp);
    resp
}
