use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use conclave_bus::{Bus, FrontendEvent};
use conclave_schema::AgentMessage;
use conclave_store::Store;
use conclave_vector::{EmbeddingProvider, VectorStore};

use crate::registry::AgentRecord;

pub const OBSERVER_TOPIC: &str = "observer";

/// Shared state for the Registry/Router service. One `AppState` backs the
/// whole process: the Router multiplexes every agent socket plus the
/// single observer socket over this state.
#[derive(Clone)]
pub struct AppState {
    /// `server/sessions.db` table `sessions`: comm_id -> member_names.
    pub sessions: Store,
    /// `server/chat.db` table `chat`: comm_id -> archived chat record.
    pub chat: Store,
    /// Raw `AgentInfo` by name, for exact lookups (`query_assistant`,
    /// `list_all_agents`).
    pub agents: Store,
    /// Capability-searchable agent catalogue (`retrieve_assistant`).
    pub directory: Arc<VectorStore<AgentRecord>>,
    /// agent name -> live outbound sender for that agent's websocket.
    /// Reconnecting under the same name overwrites the old entry
    /// (last-writer-wins, see DESIGN.md).
    pub connections: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<AgentMessage>>>>,
    /// Fans every teamup and every routed message out to the observer
    /// socket, tagged by `FrontendEvent`'s discriminant.
    pub observer_bus: Arc<Bus<FrontendEvent>>,
}

impl AppState {
    pub fn new(sessions: Store, chat: Store, agents: Store, embedder: Arc<dyn EmbeddingProvider>) -> anyhow::Result<Self> {
        let directory = VectorStore::open_in_memory("agent_registry", embedder)?;
        Ok(Self {
            sessions,
            chat,
            agents,
            directory: Arc::new(directory),
            connections: Arc::new(Mutex::new(HashMap::new())),
            observer_bus: Arc::new(Bus::new(256)),
        })
    }

    /// Opens the three on-disk stores and the vector directory under a
    /// server data directory (`sessions.db`, `chat.db`, `agents.db`, and an
    /// `agent_registry` vector collection).
    pub fn bootstrap(data_dir: &std::path::Path, embedder: Arc<dyn EmbeddingProvider>) -> anyhow::Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let sessions = Store::open(data_dir.join("sessions.db").to_str().expect("utf8 path"))?;
        let chat = Store::open(data_dir.join("chat.db").to_str().expect("utf8 path"))?;
        let agents = Store::open(data_dir.join("agents.db").to_str().expect("utf8 path"))?;
        let directory = VectorStore::open(
            data_dir.join("agent_registry.db").to_str().expect("utf8 path"),
            "agent_registry",
            embedder,
        )?;
        Ok(Self {
            sessions,
            chat,
            agents,
            directory: Arc::new(directory),
            connections: Arc::new(Mutex::new(HashMap::new())),
            observer_bus: Arc::new(Bus::new(256)),
        })
    }
}
