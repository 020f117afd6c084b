//! LLM Gateway: prompt assembly, structured JSON + repair, tool-call
//! validation/retry, provider failover and rate limiting.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use conclave_provider::{ContentBlock, LlmMessage, LlmRequest, LlmResponse, ProviderRegistry, ToolSchema};
use conclave_schema::ChatTurn;

pub use conclave_provider::ToolChoice;

const MAX_TOOL_RETRIES: u32 = 20;
const TOOL_RETRY_BASE_BACKOFF_MS: u64 = 250;
const TOOL_RETRY_MAX_BACKOFF: Duration = Duration::from_secs(10);
const DEFAULT_COOLDOWN_SECS: u64 = 60;
const BILLING_COOLDOWN_SECS: u64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("content policy refusal: {0}")]
    ContentPolicyRefusal(String),
    #[error("model returned a tool name not present in the supplied schema after {attempts} attempts: {name}")]
    UnknownToolName { name: String, attempts: u32 },
    #[error("response_format=json_object but the model's output could not be parsed or repaired: {0}")]
    JsonUnparseable(String),
    #[error("all model candidates failed or are in cooldown (tried: {0})")]
    AllCandidatesFailed(String),
    #[error("rate limit exceeded for provider {0}")]
    RateLimited(String),
    #[error(transparent)]
    Provider(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    JsonObject,
    Text,
}

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Result of a `Generate` call. `content` is `string | object | null`
/// depending on `response_format`.
#[derive(Debug, Clone)]
pub struct LlmResult {
    pub content: serde_json::Value,
    pub role: String,
    pub tool_calls: Vec<ToolCall>,
    pub send_tokens: u32,
    pub recv_tokens: u32,
}

#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub model: String,
    pub prepend: Vec<String>,
    pub history: Vec<ChatTurn>,
    pub append: Vec<String>,
    pub tools: Vec<ToolSchema>,
    pub tool_choice: Option<ToolChoice>,
    pub response_format: Option<ResponseFormat>,
    pub max_tokens: u32,
}

/// First non-empty `prepend[0]` becomes the system turn; the rest of
/// `prepend` become user turns, then `history`, then `append` as user
/// turns.
fn assemble_messages(prepend: &[String], history: &[ChatTurn], append: &[String]) -> (Option<String>, Vec<LlmMessage>) {
    let mut messages = Vec::new();
    let mut iter = prepend.iter();
    let system = iter.next().filter(|s| !s.is_empty()).cloned();
    for p in iter {
        messages.push(LlmMessage::user(p.clone()));
    }
    for turn in history {
        messages.push(LlmMessage {
            role: turn.role.clone(),
            content: vec![ContentBlock::Text {
                text: turn.content.clone(),
            }],
        });
    }
    for a in append {
        messages.push(LlmMessage::user(a.clone()));
    }
    (system, messages)
}

/// Best-effort recovery for a model response that was supposed to be JSON
/// but isn't valid as-is: strips markdown code fences, then falls back to
/// the first balanced `{...}`/`[...]` substring.
fn repair_json(raw: &str) -> Option<serde_json::Value> {
    let trimmed = raw.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed)
        .trim_end_matches("```")
        .trim();

    if let Ok(v) = serde_json::from_str(unfenced) {
        return Some(v);
    }

    let start = unfenced.find(['{', '['])?;
    let end = unfenced.rfind(['}', ']'])?;
    if end < start {
        return None;
    }
    serde_json::from_str(&unfenced[start..=end]).ok()
}

fn is_content_policy_refusal(resp: &LlmResponse) -> bool {
    matches!(
        resp.stop_reason.as_deref(),
        Some("content_filter") | Some("refusal") | Some("content_policy")
    )
}

/// Error classification for failover decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverReason {
    RateLimit,
    Billing,
    Timeout,
    ServerError,
    AuthError,
    Unknown,
}

impl FailoverReason {
    fn cooldown(self) -> Duration {
        match self {
            Self::Billing => Duration::from_secs(BILLING_COOLDOWN_SECS),
            Self::RateLimit => Duration::from_secs(DEFAULT_COOLDOWN_SECS),
            Self::Timeout | Self::ServerError => Duration::from_secs(30),
            Self::AuthError => Duration::from_secs(3600),
            Self::Unknown => Duration::from_secs(DEFAULT_COOLDOWN_SECS),
        }
    }
}

fn classify_failover_reason(err: &str) -> Option<FailoverReason> {
    let lower = err.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") {
        Some(FailoverReason::RateLimit)
    } else if lower.contains("insufficient") || lower.contains("billing") || lower.contains("quota") {
        Some(FailoverReason::Billing)
    } else if lower.contains("timeout") || lower.contains("timed out") {
        Some(FailoverReason::Timeout)
    } else if lower.contains("500") || lower.contains("502") || lower.contains("503") {
        Some(FailoverReason::ServerError)
    } else if lower.contains("401") || lower.contains("403") || lower.contains("unauthorized") {
        Some(FailoverReason::AuthError)
    } else {
        Some(FailoverReason::Unknown)
    }
}

#[derive(Debug, Clone, Default)]
struct ProviderCooldown {
    until: Option<Instant>,
}

impl ProviderCooldown {
    fn is_active(&self) -> bool {
        self.until.map(|u| Instant::now() < u).unwrap_or(false)
    }
}

#[derive(Default)]
struct CooldownStore {
    stats: HashMap<String, ProviderCooldown>,
}

impl CooldownStore {
    fn is_in_cooldown(&self, provider_id: &str) -> bool {
        self.stats.get(provider_id).map(|s| s.is_active()).unwrap_or(false)
    }

    fn set_cooldown(&mut self, provider_id: &str, duration: Duration) {
        self.stats.entry(provider_id.to_string()).or_default().until = Some(Instant::now() + duration);
    }

    fn clear(&mut self, provider_id: &str) {
        if let Some(s) = self.stats.get_mut(provider_id) {
            s.until = None;
        }
    }
}

/// `key/model` pair, e.g. `"anthropic/claude-3-5-sonnet-latest"`.
fn parse_provider_model(input: &str) -> anyhow::Result<(String, String)> {
    let mut parts = input.splitn(2, '/');
    let provider = parts.next().ok_or_else(|| anyhow::anyhow!("invalid model format: {input}"))?;
    let model = parts.next().ok_or_else(|| anyhow::anyhow!("invalid model format: {input}"))?;
    Ok((provider.to_string(), model.to_string()))
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 30,
            burst: 10,
        }
    }
}

struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(config: &RateLimitConfig) -> Self {
        Self {
            tokens: config.burst as f64,
            max_tokens: config.burst as f64,
            refill_rate: config.requests_per_minute as f64 / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-key (agent, session, ...) rate limiter. One token bucket per key.
pub struct RateLimiter {
    buckets: std::sync::Mutex<HashMap<String, TokenBucket>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: std::sync::Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn check(&self, key: &str) -> bool {
        let mut buckets = self.buckets.lock().expect("rate limiter mutex poisoned");
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| TokenBucket::new(&self.config));
        bucket.try_consume()
    }
}

/// Generates completions against a registry of providers with alias
/// resolution, ordered fallback and per-provider cooldown on failure.
pub struct Gateway {
    registry: ProviderRegistry,
    aliases: HashMap<String, String>,
    global_fallbacks: Vec<String>,
    cooldowns: Arc<RwLock<CooldownStore>>,
    rate_limiter: RateLimiter,
}

impl Gateway {
    pub fn new(registry: ProviderRegistry, aliases: HashMap<String, String>, global_fallbacks: Vec<String>) -> Self {
        Self::with_rate_limit(registry, aliases, global_fallbacks, RateLimitConfig::default())
    }

    pub fn with_rate_limit(
        registry: ProviderRegistry,
        aliases: HashMap<String, String>,
        global_fallbacks: Vec<String>,
        rate_limit: RateLimitConfig,
    ) -> Self {
        Self {
            registry,
            aliases,
            global_fallbacks,
            cooldowns: Arc::new(RwLock::new(CooldownStore::default())),
            rate_limiter: RateLimiter::new(rate_limit),
        }
    }

    fn resolve_model(&self, raw: &str) -> anyhow::Result<String> {
        if raw.contains('/') {
            return Ok(raw.to_string());
        }
        self.aliases
            .get(raw)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown model alias: {raw}"))
    }

    fn candidates(&self, primary: &str, fallbacks: &[String]) -> Vec<String> {
        let mut candidates = vec![primary.to_string()];
        candidates.extend(fallbacks.iter().cloned());
        candidates.extend(self.global_fallbacks.clone());
        let mut seen = std::collections::HashSet::new();
        candidates.retain(|c| seen.insert(c.clone()));
        candidates
    }

    /// Issues one chat call against the first available, non-cooled-down
    /// candidate, without tool-name validation or JSON repair.
    async fn chat_with_failover(
        &self,
        primary: &str,
        fallbacks: &[String],
        request_template: &LlmRequest,
    ) -> Result<LlmResponse, GatewayError> {
        let candidates = self.candidates(primary, fallbacks);
        let mut tried = Vec::new();
        let mut last_err = None;
        let mut any_rate_limited = false;

        for candidate in &candidates {
            let resolved = match self.resolve_model(candidate) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("failed to resolve model {candidate}: {e}");
                    continue;
                }
            };
            let (provider_id, model_id) = match parse_provider_model(&resolved) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!("invalid model format {resolved}: {e}");
                    continue;
                }
            };

            if self.cooldowns.read().unwrap().is_in_cooldown(&provider_id) {
                tracing::info!("skipping provider {provider_id} (in cooldown), trying next");
                continue;
            }

            if !self.rate_limiter.check(&provider_id) {
                any_rate_limited = true;
                tracing::info!("skipping provider {provider_id} (rate limited), trying next");
                continue;
            }

            let provider = match self.registry.get(&provider_id) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!("provider {provider_id} not available: {e}");
                    continue;
                }
            };

            tried.push(format!("{provider_id}/{model_id}"));
            let mut req = request_template.clone();
            req.model = model_id.clone();

            match provider.chat(req).await {
                Ok(resp) => {
                    self.cooldowns.write().unwrap().clear(&provider_id);
                    return Ok(resp);
                }
                Err(err) => {
                    let err_str = err.to_string();
                    if let Some(reason) = classify_failover_reason(&err_str) {
                        self.cooldowns.write().unwrap().set_cooldown(&provider_id, reason.cooldown());
                    }
                    tracing::warn!("provider {provider_id} failed: {err_str}");
                    last_err = Some(err);
                }
            }
        }

        match last_err {
            Some(e) => Err(GatewayError::Provider(e)),
            None if tried.is_empty() && any_rate_limited => Err(GatewayError::RateLimited(primary.to_string())),
            None => Err(GatewayError::AllCandidatesFailed(tried.join(" -> "))),
        }
    }

    /// Runs the full `Generate` operation end to end: prompt assembly,
    /// provider failover, tool-call validation with bounded retry, and
    /// JSON response parsing with a repair pass.
    pub async fn generate(&self, primary: &str, fallbacks: &[String], request: GenerateRequest) -> Result<LlmResult, GatewayError> {
        let (system, messages) = assemble_messages(&request.prepend, &request.history, &request.append);
        let req_template = LlmRequest {
            model: String::new(),
            system,
            messages,
            max_tokens: if request.max_tokens == 0 { 2048 } else { request.max_tokens },
            tools: request.tools.clone(),
            tool_choice: request.tool_choice.clone(),
        };

        let mut attempt: u32 = 0;
        loop {
            let resp = self.chat_with_failover(primary, fallbacks, &req_template).await?;

            if is_content_policy_refusal(&resp) {
                return Err(GatewayError::ContentPolicyRefusal(resp.text));
            }

            let tool_calls: Vec<ToolCall> = resp
                .tool_calls()
                .into_iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        arguments: input.clone(),
                    }),
                    _ => None,
                })
                .collect();

            let allowed: std::collections::HashSet<&str> = request.tools.iter().map(|t| t.name.as_str()).collect();
            if let Some(bad) = tool_calls.iter().find(|c| !allowed.is_empty() && !allowed.contains(c.name.as_str())) {
                attempt += 1;
                if attempt >= MAX_TOOL_RETRIES {
                    return Err(GatewayError::UnknownToolName {
                        name: bad.name.clone(),
                        attempts: attempt,
                    });
                }
                let backoff = Duration::from_millis(TOOL_RETRY_BASE_BACKOFF_MS * 2u64.pow(attempt.min(10))).min(TOOL_RETRY_MAX_BACKOFF);
                tracing::warn!(attempt, tool = %bad.name, "model used a tool not in schema, retrying");
                tokio::time::sleep(backoff).await;
                continue;
            }

            let content = match request.response_format {
                Some(ResponseFormat::JsonObject) => match serde_json::from_str::<serde_json::Value>(&resp.text) {
                    Ok(v) => v,
                    Err(_) => repair_json(&resp.text).ok_or_else(|| GatewayError::JsonUnparseable(resp.text.clone()))?,
                },
                _ => serde_json::Value::String(resp.text.clone()),
            };

            return Ok(LlmResult {
                content,
                role: "assistant".to_string(),
                tool_calls,
                send_tokens: resp.input_tokens.unwrap_or(0),
                recv_tokens: resp.output_tokens.unwrap_or(0),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conclave_provider::LlmProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticProvider {
        response: LlmResponse,
    }

    #[async_trait]
    impl LlmProvider for StaticProvider {
        async fn chat(&self, _request: LlmRequest) -> anyhow::Result<LlmResponse> {
            Ok(self.response.clone())
        }
    }

    struct RecordingProvider {
        response: LlmResponse,
        last_request: std::sync::Mutex<Option<LlmRequest>>,
    }

    #[async_trait]
    impl LlmProvider for RecordingProvider {
        async fn chat(&self, request: LlmRequest) -> anyhow::Result<LlmResponse> {
            *self.last_request.lock().unwrap() = Some(request);
            Ok(self.response.clone())
        }
    }

    struct FailThenSucceed {
        calls: AtomicUsize,
        fail_times: usize,
        eventual: LlmResponse,
    }

    #[async_trait]
    impl LlmProvider for FailThenSucceed {
        async fn chat(&self, _request: LlmRequest) -> anyhow::Result<LlmResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                anyhow::bail!("500 internal server error")
            }
            Ok(self.eventual.clone())
        }
    }

    fn resp(text: &str, blocks: Vec<ContentBlock>) -> LlmResponse {
        LlmResponse {
            text: text.to_string(),
            content: blocks,
            input_tokens: Some(10),
            output_tokens: Some(5),
            stop_reason: Some("end_turn".to_string()),
        }
    }

    fn gateway_with(provider_id: &str, provider: Arc<dyn LlmProvider>, alias: &str) -> Gateway {
        let mut registry = ProviderRegistry::new();
        registry.register(provider_id, provider);
        let aliases = HashMap::from([(alias.to_string(), format!("{provider_id}/model"))]);
        Gateway::new(registry, aliases, vec![])
    }

    #[test]
    fn assemble_messages_first_prepend_is_system_rest_are_user() {
        let (system, messages) = assemble_messages(
            &["sys".to_string(), "context note".to_string()],
            &[ChatTurn {
                role: "user".to_string(),
                content: "hist".to_string(),
            }],
            &["append note".to_string()],
        );
        assert_eq!(system, Some("sys".to_string()));
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].text(), "context note");
        assert_eq!(messages[1].text(), "hist");
        assert_eq!(messages[2].text(), "append note");
    }

    #[test]
    fn assemble_messages_empty_first_prepend_has_no_system() {
        let (system, messages) = assemble_messages(&["".to_string()], &[], &[]);
        assert_eq!(system, None);
        assert!(messages.is_empty());
    }

    #[test]
    fn repair_json_strips_markdown_fence() {
        let raw = "```json\n{\"ok\": true}\n```";
        let value = repair_json(raw).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn repair_json_extracts_balanced_braces_from_prose() {
        let raw = "Sure, here you go: {\"ok\": true} hope that helps!";
        let value = repair_json(raw).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn repair_json_gives_up_on_garbage() {
        assert!(repair_json("not json at all").is_none());
    }

    #[tokio::test]
    async fn generate_returns_text_content_by_default() {
        let provider = Arc::new(StaticProvider {
            response: resp("hello there", vec![]),
        });
        let gw = gateway_with("p", provider, "m");
        let result = gw
            .generate("m", &[], GenerateRequest {
                model: "m".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.content, serde_json::Value::String("hello there".to_string()));
    }

    #[tokio::test]
    async fn generate_parses_json_object_response_format() {
        let provider = Arc::new(StaticProvider {
            response: resp("{\"answer\": 42}", vec![]),
        });
        let gw = gateway_with("p", provider, "m");
        let result = gw
            .generate("m", &[], GenerateRequest {
                model: "m".to_string(),
                response_format: Some(ResponseFormat::JsonObject),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.content["answer"], 42);
    }

    #[tokio::test]
    async fn generate_repairs_fenced_json_response() {
        let provider = Arc::new(StaticProvider {
            response: resp("```json\n{\"answer\": 7}\n```", vec![]),
        });
        let gw = gateway_with("p", provider, "m");
        let result = gw
            .generate("m", &[], GenerateRequest {
                model: "m".to_string(),
                response_format: Some(ResponseFormat::JsonObject),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.content["answer"], 7);
    }

    #[tokio::test]
    async fn generate_content_policy_refusal_is_fatal() {
        let mut r = resp("refused", vec![]);
        r.stop_reason = Some("content_filter".to_string());
        let provider = Arc::new(StaticProvider { response: r });
        let gw = gateway_with("p", provider, "m");
        let result = gw
            .generate("m", &[], GenerateRequest {
                model: "m".to_string(),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(GatewayError::ContentPolicyRefusal(_))));
    }

    #[tokio::test]
    async fn generate_flattens_tool_calls_from_content_blocks() {
        let provider = Arc::new(StaticProvider {
            response: resp(
                "",
                vec![ContentBlock::ToolUse {
                    id: "1".to_string(),
                    name: "search".to_string(),
                    input: serde_json::json!({"q": "rust"}),
                }],
            ),
        });
        let gw = gateway_with("p", provider, "m");
        let result = gw
            .generate("m", &[], GenerateRequest {
                model: "m".to_string(),
                tools: vec![ToolSchema {
                    name: "search".to_string(),
                    description: "".to_string(),
                    input_schema: serde_json::json!({}),
                }],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.tool_calls[0].name, "search");
    }

    #[tokio::test]
    async fn generate_failover_moves_to_fallback_provider() {
        let mut registry = ProviderRegistry::new();
        registry.register(
            "fail",
            Arc::new(FailThenSucceed {
                calls: AtomicUsize::new(0),
                fail_times: 99,
                eventual: resp("unused", vec![]),
            }),
        );
        registry.register(
            "good",
            Arc::new(StaticProvider {
                response: resp("from fallback", vec![]),
            }),
        );
        let aliases = HashMap::from([
            ("bad".to_string(), "fail/model".to_string()),
            ("fallback".to_string(), "good/model".to_string()),
        ]);
        let gw = Gateway::new(registry, aliases, vec![]);

        let result = gw
            .generate("bad", &["fallback".to_string()], GenerateRequest {
                model: "bad".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.content, serde_json::Value::String("from fallback".to_string()));
    }

    #[tokio::test]
    async fn generate_is_rate_limited_per_provider() {
        let mut registry = ProviderRegistry::new();
        registry.register(
            "p",
            Arc::new(StaticProvider {
                response: resp("hello", vec![]),
            }),
        );
        let aliases = HashMap::from([("m".to_string(), "p/model".to_string())]);
        let gw = Gateway::with_rate_limit(registry, aliases, vec![], RateLimitConfig { requests_per_minute: 60, burst: 1 });

        gw.generate("m", &[], GenerateRequest { model: "m".to_string(), ..Default::default() })
            .await
            .unwrap();

        let result = gw.generate("m", &[], GenerateRequest { model: "m".to_string(), ..Default::default() }).await;
        assert!(matches!(result, Err(GatewayError::RateLimited(_))));
    }

    #[tokio::test]
    async fn rate_limited_provider_falls_back_to_next_candidate() {
        let mut registry = ProviderRegistry::new();
        registry.register(
            "busy",
            Arc::new(StaticProvider {
                response: resp("from busy", vec![]),
            }),
        );
        registry.register(
            "spare",
            Arc::new(StaticProvider {
                response: resp("from spare", vec![]),
            }),
        );
        let aliases = HashMap::from([
            ("bad".to_string(), "busy/model".to_string()),
            ("fallback".to_string(), "spare/model".to_string()),
        ]);
        let gw = Gateway::with_rate_limit(registry, aliases, vec![], RateLimitConfig { requests_per_minute: 60, burst: 1 });

        gw.generate("bad", &[], GenerateRequest { model: "bad".to_string(), ..Default::default() })
            .await
            .unwrap();

        let result = gw
            .generate("bad", &["fallback".to_string()], GenerateRequest {
                model: "bad".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.content, serde_json::Value::String("from spare".to_string()));
    }

    #[tokio::test]
    async fn generate_forwards_tool_choice_to_the_provider() {
        let provider = Arc::new(RecordingProvider {
            response: resp("", vec![]),
            last_request: std::sync::Mutex::new(None),
        });
        let mut registry = ProviderRegistry::new();
        registry.register("p", provider.clone() as Arc<dyn LlmProvider>);
        let aliases = HashMap::from([("m".to_string(), "p/model".to_string())]);
        let gw = Gateway::new(registry, aliases, vec![]);

        gw.generate("m", &[], GenerateRequest {
            model: "m".to_string(),
            tool_choice: Some(ToolChoice::Named("team_up".to_string())),
            ..Default::default()
        })
        .await
        .unwrap();

        let sent = provider.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(sent.tool_choice, Some(ToolChoice::Named("team_up".to_string())));
    }

    #[tokio::test]
    async fn rate_limiter_exhausts_burst_then_refuses() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_minute: 60,
            burst: 2,
        });
        assert!(limiter.check("agent-a"));
        assert!(limiter.check("agent-a"));
        assert!(!limiter.check("agent-a"));
    }

    #[tokio::test]
    async fn rate_limiter_tracks_keys_independently() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_minute: 60,
            burst: 1,
        });
        assert!(limiter.check("agent-a"));
        assert!(limiter.check("agent-b"));
    }
}
