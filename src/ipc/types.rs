use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

/// One request line from the shell. `params` defaults to null so bare
/// method calls carry no payload.
#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Daemon-lifetime state. Nothing is open until the shell selects a
/// workspace; every handler that touches storage goes through `conn`.
#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}

impl AppState {
    pub fn conn(&self) -> Option<&Connection> {
        self.db.as_ref()
    }
}
