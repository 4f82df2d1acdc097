use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::Connection;
use serde::Deserialize;
use tokio::runtime::Runtime;

use crate::cache::{FetchCache, FetchCell};
use crate::config::Config;
use crate::grades::StudentGradeRow;
use crate::reconcile::{GradeReconciler, UnlockSet};

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub type GradeCache = FetchCache<Vec<StudentGradeRow>>;

/// The grade grid currently open in the front end.
pub struct GradeSession {
    pub cell: FetchCell<Vec<StudentGradeRow>>,
    pub reconciler: GradeReconciler,
    pub unlocked: UnlockSet,
}

pub struct AppState {
    pub config: Config,
    pub runtime: Runtime,
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub grade_cache: Arc<GradeCache>,
    pub session: Option<GradeSession>,
}

impl AppState {
    pub fn new(config: Config, runtime: Runtime) -> Self {
        Self {
            config,
            runtime,
            workspace: None,
            db: None,
            grade_cache: Arc::new(FetchCache::new()),
            session: None,
        }
    }
}
