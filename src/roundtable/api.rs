use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use uuid::Uuid;

use super::kamiwaza::KamiwazaClient;
use super::models::{AgentUpdate, NewAgent, NewDiscussion};
use super::orchestrator::RoundTableService;
use crate::errors::DiscussionError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub service: RoundTableService,
    /// Present when `kamiwaza.api_uri` is configured.
    pub kamiwaza: Option<KamiwazaClient>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct DiscussRequest {
    pub discussion_prompt: String,
    /// Display names to call on, in order, for manual speaker selection.
    #[serde(default)]
    pub speaker_hints: Vec<String>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<DiscussionError> for ApiError {
    fn from(err: DiscussionError) -> Self {
        let message = err.to_string();
        if err.is_not_found() {
            ApiError::NotFound(message)
        } else if err.is_client_error() {
            ApiError::BadRequest(message)
        } else {
            ApiError::Internal(message)
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route(
            "/api/v1/agents",
            get(list_agents).post(create_agent).delete(delete_all_agents),
        )
        .route(
            "/api/v1/agents/{id}",
            get(get_agent).put(update_agent).delete(delete_agent),
        )
        .route(
            "/api/v1/round-tables",
            get(list_round_tables)
                .post(create_round_table)
                .delete(delete_all_round_tables),
        )
        .route("/api/v1/round-tables/{id}", get(get_round_table))
        .route(
            "/api/v1/round-tables/{id}/participants",
            get(list_participants),
        )
        .route(
            "/api/v1/round-tables/{id}/phase/{new_phase}",
            post(transition_phase),
        )
        .route("/api/v1/round-tables/{id}/discuss", post(start_discussion))
        .route("/api/v1/round-tables/{id}/pause", post(pause_discussion))
        .route("/api/v1/round-tables/{id}/resume", post(resume_discussion))
        .route("/api/v1/messages", axum::routing::delete(delete_all_messages))
        .route(
            "/api/v1/messages/round-table/{id}",
            get(get_round_table_messages),
        )
        .route("/api/v1/kamiwaza/models", get(list_kamiwaza_models))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_agent(
    State(state): State<SharedState>,
    Json(req): Json<NewAgent>,
) -> Result<impl IntoResponse, ApiError> {
    let agent = state.service.create_agent(req).await?;
    Ok((StatusCode::CREATED, Json(agent)))
}

async fn list_agents(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.list_agents().await?))
}

async fn get_agent(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.get_agent(id).await?))
}

async fn update_agent(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(req): Json<AgentUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.update_agent(id, req).await?))
}

async fn delete_agent(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.service.delete_agent(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_all_agents(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.service.delete_all_agents().await?;
    Ok(Json(serde_json::json!({"deleted": deleted})))
}

async fn create_round_table(
    State(state): State<SharedState>,
    Json(req): Json<NewDiscussion>,
) -> Result<impl IntoResponse, ApiError> {
    let discussion = state.service.create_discussion(req).await?;
    Ok((StatusCode::CREATED, Json(discussion)))
}

async fn list_round_tables(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.list_discussions().await?))
}

async fn get_round_table(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.get_discussion(id).await?))
}

async fn delete_all_round_tables(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.service.delete_all_discussions().await?;
    Ok(Json(serde_json::json!({"deleted": deleted})))
}

async fn list_participants(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.participants(id).await?))
}

async fn transition_phase(
    State(state): State<SharedState>,
    Path((id, new_phase)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.transition_phase(id, new_phase).await?))
}

async fn start_discussion(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(req): Json<DiscussRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.discussion_prompt.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "discussion_prompt must not be empty".into(),
        ));
    }
    let outcome = state
        .service
        .run_discussion(id, req.discussion_prompt, req.speaker_hints)
        .await?;
    Ok(Json(outcome))
}

async fn pause_discussion(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.pause(id).await?))
}

async fn resume_discussion(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service.resume(id).await?))
}

async fn get_round_table_messages(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state.service.messages(id).await.map_err(|e| match e {
        DiscussionError::NotFound { id } => {
            ApiError::NotFound(format!("No messages found for round table {}", id))
        }
        other => other.into(),
    })?;
    Ok(Json(messages))
}

async fn list_kamiwaza_models(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let client = state.kamiwaza.as_ref().ok_or_else(|| {
        ApiError::Internal("Kamiwaza API URI is not configured (KAMIWAZA_API_URI)".into())
    })?;
    let models = client
        .available_models()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(models))
}

async fn delete_all_messages(
    State(state): State<SharedState>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.service.purge_messages().await?;
    Ok(Json(serde_json::json!({"deleted": deleted})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roundtable::db::{DbHandle, RoundTableDb};
    use crate::roundtable::generation::EchoGenerator;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tokio::sync::broadcast;
    use tower::ServiceExt;

    fn test_app() -> Router {
        let db = RoundTableDb::new_in_memory().unwrap();
        let (ws_tx, _) = broadcast::channel(16);
        let service = RoundTableService::new(DbHandle::new(db), Arc::new(EchoGenerator), ws_tx);
        api_router().with_state(Arc::new(AppState {
            service,
            kamiwaza: None,
        }))
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    /// Create agents and a round-robin round table; returns the round table id.
    async fn seed_round_table(app: &Router, names: &[&str], max_rounds: u32) -> String {
        let mut participants = Vec::new();
        for name in names {
            let response = app
                .clone()
                .oneshot(post_json(
                    "/api/v1/agents",
                    serde_json::json!({
                        "name": name,
                        "title": "Panelist",
                        "background": format!("You are {}.", name),
                    }),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::CREATED);
            let agent: serde_json::Value = body_json(response.into_body()).await;
            participants.push(serde_json::json!({"agent_id": agent["id"]}));
        }
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/v1/round-tables",
                serde_json::json!({
                    "title": "Roadmap",
                    "context": "Plan the next quarter",
                    "participants": participants,
                    "settings": {
                        "max_rounds": max_rounds,
                        "speaker_selection_method": "round_robin",
                        "allow_repeat_speaker": false,
                    },
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let round_table: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(round_table["status"], "pending");
        round_table["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = test_app();
        let response = app.oneshot(empty("GET", "/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_list_round_tables_empty() {
        let app = test_app();
        let response = app
            .oneshot(empty("GET", "/api/v1/round-tables"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let round_tables: Vec<serde_json::Value> = body_json(response.into_body()).await;
        assert!(round_tables.is_empty());
    }

    #[tokio::test]
    async fn test_get_unknown_round_table_is_404() {
        let app = test_app();
        let uri = format!("/api/v1/round-tables/{}", Uuid::new_v4());
        let response = app.oneshot(empty("GET", &uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_create_round_table_with_unknown_agent_is_404() {
        let app = test_app();
        let response = app
            .oneshot(post_json(
                "/api/v1/round-tables",
                serde_json::json!({
                    "title": "t",
                    "context": "c",
                    "participants": [{"agent_id": Uuid::new_v4()}],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_discuss_runs_to_completion() {
        let app = test_app();
        let id = seed_round_table(&app, &["Ada", "Grace", "Linus"], 3).await;

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/api/v1/round-tables/{}/discuss", id),
                serde_json::json!({"discussion_prompt": "Pick three goals"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let outcome: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(outcome["status"], "completed");
        assert_eq!(outcome["discussion_id"], id.as_str());
        assert_eq!(outcome["chat_history"].as_array().unwrap().len(), 4);
        assert_eq!(outcome["attribution_fallbacks"], 0);

        let response = app
            .clone()
            .oneshot(empty(
                "GET",
                &format!("/api/v1/messages/round-table/{}", id),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let messages: Vec<serde_json::Value> = body_json(response.into_body()).await;
        let speakers: Vec<&str> = messages
            .iter()
            .map(|m| m["agent_name"].as_str().unwrap())
            .collect();
        assert_eq!(speakers, vec!["Ada", "Grace", "Linus", "Ada"]);
        assert_eq!(messages[0]["message_type"], "introduction");

        // A finished round table cannot be run again.
        let response = app
            .oneshot(post_json(
                &format!("/api/v1/round-tables/{}/discuss", id),
                serde_json::json!({"discussion_prompt": "Again"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_discuss_requires_prompt() {
        let app = test_app();
        let id = seed_round_table(&app, &["Ada"], 1).await;
        let response = app
            .oneshot(post_json(
                &format!("/api/v1/round-tables/{}/discuss", id),
                serde_json::json!({"discussion_prompt": "   "}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_phase_transitions_over_http() {
        let app = test_app();
        let id = seed_round_table(&app, &["Ada"], 1).await;

        // No current phase yet: nothing is reachable.
        let response = app
            .clone()
            .oneshot(empty(
                "POST",
                &format!("/api/v1/round-tables/{}/phase/discussion", id),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"]
            .as_str()
            .unwrap()
            .contains("Invalid phase transition"));
    }

    #[tokio::test]
    async fn test_pause_and_resume_wrong_state_are_400() {
        let app = test_app();
        let id = seed_round_table(&app, &["Ada", "Grace"], 2).await;
        for action in ["pause", "resume"] {
            let response = app
                .clone()
                .oneshot(empty(
                    "POST",
                    &format!("/api/v1/round-tables/{}/{}", id, action),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", action);
        }
    }

    #[tokio::test]
    async fn test_messages_for_empty_transcript_is_404() {
        let app = test_app();
        let id = seed_round_table(&app, &["Ada"], 1).await;
        let response = app
            .oneshot(empty(
                "GET",
                &format!("/api/v1/messages/round-table/{}", id),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("No messages"));
    }

    #[tokio::test]
    async fn test_bulk_deletes() {
        let app = test_app();
        let id = seed_round_table(&app, &["Ada", "Grace"], 1).await;
        app.clone()
            .oneshot(post_json(
                &format!("/api/v1/round-tables/{}/discuss", id),
                serde_json::json!({"discussion_prompt": "Go"}),
            ))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(empty("DELETE", "/api/v1/messages"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["deleted"], 2);

        let response = app
            .clone()
            .oneshot(empty("DELETE", "/api/v1/round-tables"))
            .await
            .unwrap();
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["deleted"], 1);

        let response = app
            .oneshot(empty("GET", &format!("/api/v1/round-tables/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_agent_crud() {
        let app = test_app();
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/v1/agents",
                serde_json::json!({"name": "Ada", "title": "Engineer", "background": ""}),
            ))
            .await
            .unwrap();
        let agent: serde_json::Value = body_json(response.into_body()).await;
        let id = agent["id"].as_str().unwrap().to_string();
        assert_eq!(agent["agent_type"], "standard");
        assert_eq!(agent["is_active"], true);

        let response = app
            .clone()
            .oneshot(empty("GET", &format!("/api/v1/agents/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(empty("DELETE", &format!("/api/v1/agents/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(empty("GET", &format!("/api/v1/agents/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    fn put_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_update_agent() {
        let app = test_app();
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/v1/agents",
                serde_json::json!({"name": "Ada", "title": "Engineer", "background": "b"}),
            ))
            .await
            .unwrap();
        let agent: serde_json::Value = body_json(response.into_body()).await;
        let uri = format!("/api/v1/agents/{}", agent["id"].as_str().unwrap());

        let response = app
            .clone()
            .oneshot(put_json(&uri, serde_json::json!({"title": "Architect"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let updated: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(updated["name"], "Ada");
        assert_eq!(updated["title"], "Architect");
        assert_eq!(updated["background"], "b");

        let response = app
            .clone()
            .oneshot(put_json(&uri, serde_json::json!({"name": ""})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(put_json(
                &format!("/api/v1/agents/{}", Uuid::new_v4()),
                serde_json::json!({"title": "x"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_kamiwaza_models_requires_configuration() {
        let app = test_app();
        let response = app
            .oneshot(empty("GET", "/api/v1/kamiwaza/models"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(
            body["error"]
                .as_str()
                .unwrap()
                .contains("KAMIWAZA_API_URI")
        );
    }

    #[test]
    fn test_error_mapping() {
        let id = Uuid::new_v4();
        assert!(matches!(
            ApiError::from(DiscussionError::EmptyRoster { id }),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from(DiscussionError::MissingState { id }),
            ApiError::BadRequest(_)
        ));
        assert!(matches!(
            ApiError::from(DiscussionError::Database(anyhow::anyhow!("disk full"))),
            ApiError::Internal(_)
        ));
    }
}
