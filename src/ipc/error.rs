use serde_json::{json, Map, Value};

fn envelope(id: Option<&str>, ok: bool, key: &str, body: Value) -> Value {
    let mut out = Map::new();
    if let Some(id) = id {
        out.insert("id".into(), Value::from(id));
    }
    out.insert("ok".into(), Value::Bool(ok));
    out.insert(key.into(), body);
    Value::Object(out)
}

fn error_body(code: &str, message: String, details: Option<Value>) -> Value {
    let mut error = json!({ "code": code, "message": message });
    if let Some(d) = details {
        error["details"] = d;
    }
    error
}

pub fn ok(id: &str, result: Value) -> Value {
    envelope(Some(id), true, "result", result)
}

pub fn err(id: &str, code: &str, message: impl Into<String>, details: Option<Value>) -> Value {
    envelope(Some(id), false, "error", error_body(code, message.into(), details))
}

/// Reply to a line that is not a request at all, so there is no id to echo.
pub fn bad_json(message: impl Into<String>) -> Value {
    envelope(None, false, "error", error_body("bad_json", message.into(), None))
}

/// A failed request: stable machine code, human message, optional details.
#[derive(Debug)]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(what: &str) -> Self {
        Self::new("not_found", format!("{} not found", what))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("conflict", message)
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

fn table_failure(code: &'static str, table: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
    move |e| HandlerErr::new(code, e.to_string()).with_details(json!({ "table": table }))
}

pub fn query_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

pub fn insert_err(table: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
    table_failure("db_insert_failed", table)
}

pub fn update_err(table: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
    table_failure("db_update_failed", table)
}

pub fn delete_err(table: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
    table_failure("db_delete_failed", table)
}

pub fn tx_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_tx_failed", e.to_string())
}

pub fn commit_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_commit_failed", e.to_string())
}

pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}
