use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Signed-in dashboard user.
#[derive(Debug, Clone)]
pub struct Actor {
    pub user_id: String,
    pub name: String,
    pub role: String,
    /// Home organization; `None` for platform administrators.
    pub org_id: Option<String>,
}

impl Actor {
    pub fn is_platform_admin(&self) -> bool {
        self.role == "super_admin"
    }

    /// Platform administrators act in every organization, everyone else only in their own.
    pub fn acts_in(&self, org_id: &str) -> bool {
        self.is_platform_admin() || self.org_id.as_deref() == Some(org_id)
    }
}

#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub org_id: Option<String>,
    pub actor: Option<Actor>,
}
