//! Data hooks: workspace logic code can veto or amend writes made through the
//! data routes by exporting `POST /hooks/<type>/<table>` handlers.

use std::sync::Arc;

use hive_kernel::VmRequest;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::server::{ApiError, AppState};

const REJECTED: &str = "operation rejected by business rule";

/// What a hook decided about a pending write.
#[derive(Debug, Clone, PartialEq)]
pub enum HookOutcome {
    /// No hook answered; the write proceeds unchanged.
    Passthrough,
    /// Allowed, with fields to merge into the row.
    Allow(Map<String, Value>),
    Reject(String),
}

impl HookOutcome {
    /// Reads `{ allow, data, error }`. A missing `allow` counts as allowed.
    pub fn from_body(body: &Value) -> Self {
        let Some(body) = body.as_object() else {
            return HookOutcome::Allow(Map::new());
        };
        if body.get("allow").and_then(Value::as_bool) == Some(false) {
            let message = body
                .get("error")
                .and_then(Value::as_str)
                .filter(|message| !message.is_empty())
                .unwrap_or(REJECTED);
            return HookOutcome::Reject(message.to_string());
        }
        let patch = body
            .get("data")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        HookOutcome::Allow(patch)
    }
}

pub async fn call_hook(
    state: &AppState,
    workspace: &str,
    hook: &str,
    table: &str,
    data: Value,
) -> HookOutcome {
    let vm = match state.pool.get_or_create(workspace).await {
        Ok(vm) => vm,
        Err(error) => {
            debug!(workspace, hook, table, %error, "hook skipped");
            return HookOutcome::Passthrough;
        }
    };

    let request = VmRequest::new("POST", format!("/hooks/{hook}/{table}"))
        .with_body(json!({ "table": table, "data": data }));
    match vm.handle(request).await {
        Ok(response) if response.status == 404 => HookOutcome::Passthrough,
        Ok(response) => HookOutcome::from_body(&response.body),
        Err(error) => {
            warn!(workspace, hook, table, %error, "hook failed, passing through");
            HookOutcome::Passthrough
        }
    }
}

/// Runs a blocking `before-*` hook and merges any returned fields into `row`.
pub async fn before_write(
    state: &AppState,
    workspace: &str,
    hook: &str,
    table: &str,
    row: &mut Map<String, Value>,
) -> Result<(), ApiError> {
    match call_hook(state, workspace, hook, table, Value::Object(row.clone())).await {
        HookOutcome::Passthrough => Ok(()),
        HookOutcome::Allow(patch) => {
            row.extend(patch);
            Ok(())
        }
        HookOutcome::Reject(message) => {
            Err(ApiError::bad_request(message).with_code("HOOK_REJECTED"))
        }
    }
}

/// Fires an `after-*` hook on a background task; its answer is ignored.
pub fn spawn_after(
    state: Arc<AppState>,
    workspace: String,
    hook: &'static str,
    table: String,
    data: Value,
) {
    tokio::spawn(async move {
        call_hook(&state, &workspace, hook, &table, data).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_denial_rejects() {
        assert_eq!(
            HookOutcome::from_body(&json!({"allow": false, "error": "title required"})),
            HookOutcome::Reject("title required".into())
        );
        assert_eq!(
            HookOutcome::from_body(&json!({"allow": false})),
            HookOutcome::Reject(REJECTED.into())
        );
        assert_eq!(
            HookOutcome::from_body(&json!({"allow": false, "error": ""})),
            HookOutcome::Reject(REJECTED.into())
        );
    }

    #[test]
    fn allowed_bodies_carry_their_patch() {
        let mut patch = Map::new();
        patch.insert("slug".into(), json!("hello"));
        assert_eq!(
            HookOutcome::from_body(&json!({"allow": true, "data": {"slug": "hello"}})),
            HookOutcome::Allow(patch.clone())
        );
        assert_eq!(
            HookOutcome::from_body(&json!({"data": {"slug": "hello"}})),
            HookOutcome::Allow(patch)
        );
    }

    #[test]
    fn odd_bodies_allow_without_changes() {
        for body in [json!(null), json!("ok"), json!({"data": [1, 2]}), json!({"allow": "no"})] {
            assert_eq!(HookOutcome::from_body(&body), HookOutcome::Allow(Map::new()));
        }
    }
}
