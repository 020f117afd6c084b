//! The Registry/Router's plain request/response endpoints: registration,
//! discovery, teamup, the agent listing, and the chat-record archive. The
//! two websocket endpoints live in `routes::ws`.

use std::collections::HashSet;

use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use conclave_schema::{AgentInfo, ChatRecord, Session};

use crate::registry::AgentRecord;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/retrieve_assistant", post(retrieve_assistant))
        .route("/query_assistant", post(query_assistant))
        .route("/teamup", post(teamup))
        .route("/list_all_agents", post(list_all_agents))
        .route("/fetch_chat_record", post(fetch_chat_record))
        .route("/health_check", post(health_check).get(health_check))
}

/// `register`: idempotent by name. `AgentInfo` is immutable post-registration,
/// so a second registration under an existing name is a no-op rather than
/// an overwrite.
async fn register(State(state): State<AppState>, Json(info): Json<AgentInfo>) -> Json<AgentInfo> {
    match state.agents.get::<AgentInfo>("agents", &info.name).await {
        Ok(Some(existing)) => Json(existing),
        _ => {
            if let Err(err) = state.agents.put("agents", &info.name, &info).await {
                tracing::warn!(%err, agent = %info.name, "failed to persist agent registration");
            }
            if let Err(err) = state.directory.upsert(AgentRecord(info.clone())).await {
                tracing::warn!(%err, agent = %info.name, "failed to index agent for capability search");
            }
            Json(info)
        }
    }
}

#[derive(Debug, Deserialize)]
struct RetrieveAssistantRequest {
    sender: String,
    capabilities: Vec<String>,
    #[serde(default = "default_top_k")]
    top_k: usize,
}

fn default_top_k() -> usize {
    5
}

/// `retrieve_assistant`: capability search, deduplicated, with the caller
/// excluded from its own results.
async fn retrieve_assistant(
    State(state): State<AppState>,
    Json(request): Json<RetrieveAssistantRequest>,
) -> Json<Vec<AgentInfo>> {
    let hits = state
        .directory
        .search(&request.capabilities, request.top_k)
        .await
        .unwrap_or_default();
    Json(
        hits.into_iter()
            .map(|r| r.0)
            .filter(|info| info.name != request.sender)
            .collect(),
    )
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NameOrNames {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct QueryAssistantRequest {
    name: NameOrNames,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum QueryAssistantResponse {
    One(Option<AgentInfo>),
    Many(Vec<Option<AgentInfo>>),
}

/// `query_assistant`: a single name returns one optional `AgentInfo`; a list
/// of names returns results in the same order, preserving position for
/// unknown names (`None`).
async fn query_assistant(
    State(state): State<AppState>,
    Json(request): Json<QueryAssistantRequest>,
) -> Json<QueryAssistantResponse> {
    match request.name {
        NameOrNames::One(name) => {
            let info = state.agents.get::<AgentInfo>("agents", &name).await.unwrap_or(None);
            Json(QueryAssistantResponse::One(info))
        }
        NameOrNames::Many(names) => {
            let mut out = Vec::with_capacity(names.len());
            for name in names {
                out.push(state.agents.get::<AgentInfo>("agents", &name).await.unwrap_or(None));
            }
            Json(QueryAssistantResponse::Many(out))
        }
    }
}

#[derive(Debug, Deserialize)]
struct TeamupRequest {
    sender: String,
    agent_names: Vec<String>,
    #[serde(default)]
    team_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct TeamupResponse {
    comm_id: Uuid,
    member_names: HashSet<String>,
}

/// `teamup`: allocates a fresh `comm_id`, persists the `Session`
/// (member_names = agent_names ∪ {sender}), opens an empty archived chat
/// record, and broadcasts a `Teamup` event to the observer socket.
async fn teamup(State(state): State<AppState>, Json(request): Json<TeamupRequest>) -> Json<TeamupResponse> {
    let comm_id = Uuid::new_v4();
    let mut member_names: HashSet<String> = request.agent_names.into_iter().collect();
    member_names.insert(request.sender);

    let session = Session {
        comm_id,
        member_names: member_names.clone(),
        team_name: request.team_name.clone(),
    };
    if let Err(err) = state.sessions.put("sessions", &comm_id.to_string(), &session).await {
        tracing::warn!(%err, %comm_id, "failed to persist session");
    }

    let record = ChatRecord::new(comm_id, member_names.iter().cloned().collect(), request.team_name);
    if let Err(err) = state.chat.put("chat", &comm_id.to_string(), &record).await {
        tracing::warn!(%err, %comm_id, "failed to persist empty chat record");
    }

    state.observer_bus.publish(
        crate::state::OBSERVER_TOPIC,
        conclave_bus::FrontendEvent::Teamup {
            comm_id,
            member_names: member_names.iter().cloned().collect(),
        },
    );

    Json(TeamupResponse { comm_id, member_names })
}

async fn list_all_agents(State(state): State<AppState>) -> Json<Vec<AgentInfo>> {
    let agents = state.agents.iter::<AgentInfo>("agents").await.unwrap_or_default();
    Json(agents.into_iter().map(|(_, info)| info).collect())
}

#[derive(Debug, Deserialize, Default)]
struct FetchChatRecordRequest {
    #[serde(default)]
    comm_id: Option<NameOrUuids>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NameOrUuids {
    One(Uuid),
    Many(Vec<Uuid>),
}

/// `fetch_chat_record`: a single id, a list of ids, or `null`/absent for
/// every archived record.
async fn fetch_chat_record(
    State(state): State<AppState>,
    body: Option<Json<FetchChatRecordRequest>>,
) -> Json<Vec<ChatRecord>> {
    let requested = body.and_then(|Json(b)| b.comm_id);
    let records = match requested {
        None => state
            .chat
            .iter::<ChatRecord>("chat")
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|(_, r)| r)
            .collect(),
        Some(NameOrUuids::One(id)) => state
            .chat
            .get::<ChatRecord>("chat", &id.to_string())
            .await
            .unwrap_or(None)
            .into_iter()
            .collect(),
        Some(NameOrUuids::Many(ids)) => {
            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                if let Ok(Some(record)) = state.chat.get::<ChatRecord>("chat", &id.to_string()).await {
                    out.push(record);
                }
            }
            out
        }
    };
    Json(records)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}


impl std::fmt::Debug for QueryAssistantResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryAssistantResponse::One(o) => write!(f, "One({o:?})"),
            QueryAssistantResponse::Many(m) => write!(f, "Many({m:?})"),
        }
    }
}
