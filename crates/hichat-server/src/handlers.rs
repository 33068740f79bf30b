use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::rejection::FormRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Form, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hichat_core::{history_key, GroupId, UserId};
use hichat_store::{RangeOrder, StoreError};
use tracing::Instrument;

use crate::response::{lenient_bool, lenient_i64, require_parsed, require_str, ResponseBody};
use crate::server::AppState;
use crate::session;

type Params = HashMap<String, String>;

/// First present key among `keys`, so clients may use either the current or
/// the legacy field name.
fn aliased<'a>(params: &Params, keys: &[&'a str]) -> &'a str {
    keys.iter()
        .find(|k| params.contains_key(**k))
        .copied()
        .unwrap_or(keys[0])
}

/// `GET /v1/message/send?userId=N`: upgrade to a chat session.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<Params>,
    ws: WebSocketUpgrade,
) -> Response {
    let user_id: UserId = match require_parsed(&params, "userId") {
        Ok(id) => id,
        Err(msg) => return ResponseBody::bad_request(msg).into_response(),
    };

    if state.verify_users {
        match state.users.exists(user_id) {
            Ok(true) => {}
            Ok(false) => {
                return ResponseBody::from_store_error(&StoreError::NotFound(format!(
                    "user {user_id}"
                )))
                .into_response();
            }
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, kind = e.error_kind(), "User lookup failed");
                return ResponseBody::from_store_error(&e).into_response();
            }
        }
    }

    let groups: HashSet<GroupId> = match state.communities.groups_of(user_id) {
        Ok(groups) => groups.into_iter().collect(),
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, kind = e.error_kind(), "Failed to load group memberships");
            HashSet::new()
        }
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id, groups))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: UserId, groups: HashSet<GroupId>) {
    let (session, rx) = state.registry.connect(user_id, groups);
    tracing::info!(
        user_id = %user_id,
        connection_id = %session.connection_id(),
        "WebSocket client connected"
    );

    let span = tracing::info_span!(
        "session",
        user_id = %user_id,
        connection_id = %session.connection_id()
    );
    session::handle_ws_connection(
        socket,
        session,
        rx,
        Arc::clone(&state.registry),
        state.relay.clone(),
        state.heartbeat_interval,
    )
    .instrument(span)
    .await;
}

/// `POST /v1/message/get-records?userId=A&targetId=B`, form `start`, `end`, `isRev`.
pub async fn records_handler(
    State(state): State<AppState>,
    Query(query): Query<Params>,
    form: Result<Form<Params>, FormRejection>,
) -> ResponseBody {
    let user_id: UserId = match require_parsed(&query, "userId") {
        Ok(id) => id,
        Err(msg) => return ResponseBody::bad_request(msg),
    };
    let target_id: UserId = match require_parsed(&query, "targetId") {
        Ok(id) => id,
        Err(msg) => return ResponseBody::bad_request(msg),
    };

    let form = match form {
        Ok(Form(form)) => form,
        Err(e) => {
            tracing::debug!(error = %e, "Unreadable records form, using defaults");
            Params::new()
        }
    };
    let start = lenient_i64(&form, "start");
    let end = lenient_i64(&form, "end");
    let order = RangeOrder::from_reverse(lenient_bool(&form, "isRev"));

    let key = history_key(user_id, target_id);
    match state.history.range(&key, start, end, order) {
        Ok(rows) => ResponseBody::ok("Success to get records").with_rows(rows),
        Err(e) => {
            tracing::error!(conversation = %key, error = %e, kind = e.error_kind(), "Failed to read history");
            ResponseBody::error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to get records")
        }
    }
}

/// `POST /v1/relation/new`, form `ownerId` (or `id`), `name`, `desc`.
pub async fn create_group_handler(
    State(state): State<AppState>,
    Form(form): Form<Params>,
) -> ResponseBody {
    let owner: UserId = match require_parsed(&form, aliased(&form, &["ownerId", "id"])) {
        Ok(id) => id,
        Err(msg) => return ResponseBody::bad_request(msg),
    };
    let name = match require_str(&form, "name") {
        Ok(name) => name,
        Err(msg) => return ResponseBody::bad_request(msg),
    };
    let desc = form.get("desc").map(String::as_str).unwrap_or_default();

    match state.communities.create(owner, name, desc) {
        Ok(group) => {
            tracing::info!(user_id = %owner, group_id = %group.id, "Group created");
            ResponseBody::ok("Group created")
                .with_data("groupId", group.id)
                .with_data("name", &group.name)
        }
        Err(e) => {
            tracing::warn!(user_id = %owner, error = %e, kind = e.error_kind(), "Group creation failed");
            ResponseBody::from_store_error(&e)
        }
    }
}

/// `POST /v1/relation/join`, form `userId` (or `id`), `groupId` (or `group_id`).
pub async fn join_group_handler(
    State(state): State<AppState>,
    Form(form): Form<Params>,
) -> ResponseBody {
    let user: UserId = match require_parsed(&form, aliased(&form, &["userId", "id"])) {
        Ok(id) => id,
        Err(msg) => return ResponseBody::bad_request(msg),
    };
    let group: GroupId = match require_parsed(&form, aliased(&form, &["groupId", "group_id"])) {
        Ok(id) => id,
        Err(msg) => return ResponseBody::bad_request(msg),
    };

    match state.communities.join(user, group) {
        Ok(()) => {
            tracing::info!(user_id = %user, group_id = %group, "User joined group");
            ResponseBody::ok("Joined group").with_data("groupId", group)
        }
        Err(e) => {
            tracing::warn!(user_id = %user, group_id = %group, error = %e, kind = e.error_kind(), "Group join failed");
            ResponseBody::from_store_error(&e)
        }
    }
}

/// `GET /health`
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "connections": state.registry.count(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn aliased_prefers_first_present_key() {
        let p = params(&[("id", "3")]);
        assert_eq!(aliased(&p, &["ownerId", "id"]), "id");
        let p = params(&[("ownerId", "4"), ("id", "3")]);
        assert_eq!(aliased(&p, &["ownerId", "id"]), "ownerId");
    }

    #[test]
    fn aliased_falls_back_to_primary_name() {
        let p = params(&[]);
        assert_eq!(aliased(&p, &["groupId", "group_id"]), "groupId");
    }
}
