//! `reqwest`-backed `RouterClient` against the Registry/Router's HTTP
//! surface.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use conclave_core::RouterClient;
use conclave_schema::{AgentInfo, Session};

pub struct HttpRouterClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRouterClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum NameOrNames<'a> {
    One(&'a str),
    Many(&'a [String]),
}

#[derive(Serialize)]
struct QueryAssistantRequest<'a> {
    name: NameOrNames<'a>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QueryAssistantResponse {
    One(Option<AgentInfo>),
    Many(Vec<Option<AgentInfo>>),
}

#[derive(Serialize)]
struct RetrieveAssistantRequest<'a> {
    sender: &'a str,
    capabilities: &'a [String],
}

#[derive(Serialize)]
struct TeamupRequest<'a> {
    sender: &'a str,
    agent_names: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    team_name: Option<String>,
}

#[derive(Deserialize)]
struct TeamupResponse {
    comm_id: uuid::Uuid,
    member_names: std::collections::HashSet<String>,
}

#[async_trait]
impl RouterClient for HttpRouterClient {
    async fn query_assistant(&self, queries: &[String]) -> Result<Vec<AgentInfo>> {
        let body = match queries {
            [one] => QueryAssistantRequest {
                name: NameOrNames::One(one),
            },
            many => QueryAssistantRequest {
                name: NameOrNames::Many(many),
            },
        };
        let resp = self
            .client
            .post(format!("{}/api/query_assistant", self.base_url))
            .json(&body)
            .send()
            .await
            .context("query_assistant request failed")?
            .error_for_status()
            .context("query_assistant returned an error status")?
            .json::<QueryAssistantResponse>()
            .await
            .context("query_assistant response was not valid JSON")?;
        Ok(match resp {
            QueryAssistantResponse::One(info) => info.into_iter().collect(),
            QueryAssistantResponse::Many(infos) => infos.into_iter().flatten().collect(),
        })
    }

    async fn retrieve_assistant(&self, sender: &str, capabilities: &[String]) -> Result<Vec<AgentInfo>> {
        let resp = self
            .client
            .post(format!("{}/api/retrieve_assistant", self.base_url))
            .json(&RetrieveAssistantRequest { sender, capabilities })
            .send()
            .await
            .context("retrieve_assistant request failed")?
            .error_for_status()
            .context("retrieve_assistant returned an error status")?
            .json::<Vec<AgentInfo>>()
            .await
            .context("retrieve_assistant response was not valid JSON")?;
        Ok(resp)
    }

    async fn teamup(&self, sender: &str, agent_names: &[String], team_name: Option<String>) -> Result<Session> {
        let resp = self
            .client
            .post(format!("{}/api/teamup", self.base_url))
            .json(&TeamupRequest {
                sender,
                agent_names,
                team_name: team_name.clone(),
            })
            .send()
            .await
            .context("teamup request failed")?
            .error_for_status()
            .context("teamup returned an error status")?
            .json::<TeamupResponse>()
            .await
            .context("teamup response was not valid JSON")?;
        if resp.member_names.is_empty() {
            return Err(anyhow!("teamup returned an empty member set"));
        }
        Ok(Session {
            comm_id: resp.comm_id,
            member_names: resp.member_names,
            team_name,
        })
    }
}
