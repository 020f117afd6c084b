//! Observation Adapter: a named, pluggable async callable that produces a
//! string pasted verbatim into the discussion prompt as "Current
//! Observation" whenever it is non-empty.

use async_trait::async_trait;

#[async_trait]
pub trait ObservationAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn observe(&self, kwargs: &serde_json::Value) -> anyhow::Result<String>;
}

/// The documented config default: always returns an empty observation, so
/// no "Current Observation" section is added to the prompt.
pub struct DummyObservationAdapter;

#[async_trait]
impl ObservationAdapter for DummyObservationAdapter {
    fn name(&self) -> &str {
        "dummy"
    }

    async fn observe(&self, _kwargs: &serde_json::Value) -> anyhow::Result<String> {
        Ok(String::new())
    }
}

/// Renders the "Current Observation" prompt section, omitted entirely
/// when the observation text is empty.
pub fn render_observation_section(observation: &str) -> Option<String> {
    if observation.is_empty() {
        None
    } else {
        Some(format!("Current Observation:\n{observation}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoAdapter;

    #[async_trait]
    impl ObservationAdapter for EchoAdapter {
        fn name(&self) -> &str {
            "echo"
        }

        async fn observe(&self, kwargs: &serde_json::Value) -> anyhow::Result<String> {
            Ok(kwargs.get("text").and_then(|v| v.as_str()).unwrap_or_default().to_string())
        }
    }

    #[tokio::test]
    async fn dummy_adapter_returns_empty_string() {
        let adapter = DummyObservationAdapter;
        let observation = adapter.observe(&serde_json::json!({})).await.unwrap();
        assert_eq!(observation, "");
        assert!(render_observation_section(&observation).is_none());
    }

    #[tokio::test]
    async fn nonempty_observation_renders_a_section() {
        let adapter = EchoAdapter;
        let observation = adapter.observe(&serde_json::json!({"text": "sensor reading: 42"})).await.unwrap();
        let section = render_observation_section(&observation).unwrap();
        assert!(section.starts_with("Current Observation:\n"));
        assert!(section.contains("sensor reading: 42"));
    }
}
