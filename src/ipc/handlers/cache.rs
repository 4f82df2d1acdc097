use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use tracing::debug;

fn handle_cache_invalidate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(key) = req.params.get("key").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing key", None);
    };
    let removed = state.grade_cache.invalidate(key);
    debug!(key, removed, "cache entry invalidated");
    ok(&req.id, json!({ "key": key, "removed": removed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "cache.invalidate" => Some(handle_cache_invalidate(state, req)),
        _ => None,
    }
}
