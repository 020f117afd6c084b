use conclave_schema::AgentInfo;
use conclave_vector::Embeddable;

/// Newtype so `Embeddable` can be implemented locally (orphan rule: neither
/// `AgentInfo` nor `Embeddable` lives in this crate).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AgentRecord(pub AgentInfo);

impl Embeddable for AgentRecord {
    fn key(&self) -> String {
        self.0.name.clone()
    }

    fn embedding_text(&self) -> &str {
        &self.0.desc
    }
}
