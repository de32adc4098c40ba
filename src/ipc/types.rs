use crate::config::Config;
use crate::db;
use crate::notify::{InboxDispatcher, NotificationDispatch};
use rusqlite::Connection;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Bearer token; absent for public methods.
    #[serde(default)]
    pub token: Option<String>,
}

pub struct Workspace {
    pub path: PathBuf,
    pub conn: Connection,
    pub notifier: Box<dyn NotificationDispatch>,
}

impl Workspace {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = db::open_db(path)?;
        let notifier = InboxDispatcher::open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            conn,
            notifier: Box::new(notifier),
        })
    }
}

pub struct AppState {
    pub config: Config,
    pub workspace: Option<Workspace>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            workspace: None,
        }
    }

    /// Open `path` as the active workspace, closing any previous one first.
    pub fn open_workspace(&mut self, path: &Path) -> anyhow::Result<&Workspace> {
        self.workspace = None;
        let ws = Workspace::open(path)?;
        tracing::info!(path = %path.display(), "workspace opened");
        Ok(self.workspace.insert(ws))
    }
}
