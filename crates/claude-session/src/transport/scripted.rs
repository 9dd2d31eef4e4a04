use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde::Serialize;

use super::{Record, ToolResolution, Transport};
use crate::types::{
    AssistantMessage, ContentBlock, Message, ResultMessage, SystemMessage, Usage, UserMessage,
};
use crate::{Result, SessionError};

pub const DEFAULT_SCENARIO: &str = "quick-success";

// ─── Scenario ─────────────────────────────────────────────────────────────

/// A pre-built message sequence replayed in place of a real agent.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub id: String,
    pub description: String,
    pub messages: Vec<Message>,
    /// Wait before each message.
    pub delay: Duration,
}

impl Scenario {
    pub fn new(id: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            messages,
            delay: Duration::ZERO,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// One row of [`ScenarioRegistry::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScenarioSummary {
    pub id: String,
    pub description: String,
    pub messages: usize,
    pub delay_ms: u64,
    pub is_default: bool,
}

// ─── Registry ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct PatternMapping {
    pattern: String,
    regex: Regex,
    scenario: String,
}

#[derive(Debug)]
struct RegistryState {
    scenarios: HashMap<String, Arc<Scenario>>,
    default_id: String,
    mappings: Vec<PatternMapping>,
}

impl RegistryState {
    fn builtin() -> Self {
        let scenarios = builtin_scenarios()
            .into_iter()
            .map(|s| (s.id.clone(), Arc::new(s)))
            .collect();
        Self {
            scenarios,
            default_id: DEFAULT_SCENARIO.to_owned(),
            mappings: Vec::new(),
        }
    }

    fn require(&self, id: &str) -> Result<()> {
        if self.scenarios.contains_key(id) {
            Ok(())
        } else {
            Err(SessionError::ScenarioNotFound(id.to_owned()))
        }
    }
}

/// Shared, injectable store of scripted scenarios and prompt routing.
///
/// Clones share state. Edits take effect for the next session started; a
/// running session holds its own `Arc<Scenario>` and never sees them.
#[derive(Debug, Clone)]
pub struct ScenarioRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

impl Default for ScenarioRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ScenarioRegistry {
    /// A registry holding only the built-in scenarios, `quick-success` as
    /// default, and no pattern mappings.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryState::builtin())),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RegistryState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RegistryState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add or replace a scenario.
    pub fn register(&self, scenario: Scenario) {
        let mut state = self.write();
        tracing::debug!(scenario = %scenario.id, "registered scenario");
        state
            .scenarios
            .insert(scenario.id.clone(), Arc::new(scenario));
    }

    pub fn set_default(&self, id: &str) -> Result<()> {
        let mut state = self.write();
        state.require(id)?;
        state.default_id = id.to_owned();
        Ok(())
    }

    pub fn default_scenario(&self) -> String {
        self.read().default_id.clone()
    }

    /// Route prompts matching `pattern` to scenario `id`.
    ///
    /// Patterns are case-insensitive regular expressions. Mapping an existing
    /// pattern again retargets it without changing its match priority.
    pub fn map_pattern(&self, pattern: &str, id: &str) -> Result<()> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| SessionError::InvalidPattern {
                pattern: pattern.to_owned(),
                source,
            })?;

        let mut state = self.write();
        state.require(id)?;
        match state.mappings.iter_mut().find(|m| m.pattern == pattern) {
            Some(existing) => existing.scenario = id.to_owned(),
            None => state.mappings.push(PatternMapping {
                pattern: pattern.to_owned(),
                regex,
                scenario: id.to_owned(),
            }),
        }
        Ok(())
    }

    /// Returns whether a mapping was removed.
    pub fn remove_mapping(&self, pattern: &str) -> bool {
        let mut state = self.write();
        let before = state.mappings.len();
        state.mappings.retain(|m| m.pattern != pattern);
        state.mappings.len() != before
    }

    /// Back to built-ins only: custom scenarios and mappings are discarded.
    pub fn reset(&self) {
        *self.write() = RegistryState::builtin();
    }

    /// `(pattern, scenario)` pairs in match order.
    pub fn mappings(&self) -> Vec<(String, String)> {
        self.read()
            .mappings
            .iter()
            .map(|m| (m.pattern.clone(), m.scenario.clone()))
            .collect()
    }

    /// Every scenario, sorted by id.
    pub fn list(&self) -> Vec<ScenarioSummary> {
        let state = self.read();
        let mut rows: Vec<_> = state
            .scenarios
            .values()
            .map(|s| ScenarioSummary {
                id: s.id.clone(),
                description: s.description.clone(),
                messages: s.messages.len(),
                delay_ms: s.delay.as_millis() as u64,
                is_default: s.id == state.default_id,
            })
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    pub fn get(&self, id: &str) -> Option<Arc<Scenario>> {
        self.read().scenarios.get(id).cloned()
    }

    /// The scenario a session started with `prompt` replays: the first
    /// matching pattern's target, else the default.
    pub fn resolve(&self, prompt: &str) -> Result<Arc<Scenario>> {
        let state = self.read();
        let id = state
            .mappings
            .iter()
            .find(|m| m.regex.is_match(prompt))
            .map(|m| m.scenario.as_str())
            .unwrap_or(state.default_id.as_str());
        state
            .scenarios
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::ScenarioNotFound(id.to_owned()))
    }
}

// ─── Transport ────────────────────────────────────────────────────────────

/// Tool resolutions received by a [`ScriptedTransport`], in arrival order.
#[derive(Debug, Clone, Default)]
pub struct ResolutionLog {
    inner: Arc<Mutex<Vec<ToolResolution>>>,
}

impl ResolutionLog {
    fn push(&self, resolution: ToolResolution) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(resolution);
    }

    pub fn snapshot(&self) -> Vec<ToolResolution> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Replays one scenario with the same contract as the process transport.
pub struct ScriptedTransport {
    scenario: Arc<Scenario>,
    next: usize,
    resolutions: ResolutionLog,
    closed: bool,
}

impl ScriptedTransport {
    /// Bind the scenario `prompt` resolves to right now.
    pub fn start(registry: &ScenarioRegistry, prompt: &str) -> Result<Self> {
        let scenario = registry.resolve(prompt)?;
        tracing::info!(scenario = %scenario.id, "starting scripted session");
        Ok(Self::new(scenario))
    }

    pub fn new(scenario: Arc<Scenario>) -> Self {
        Self {
            scenario,
            next: 0,
            resolutions: ResolutionLog::default(),
            closed: false,
        }
    }

    pub fn scenario_id(&self) -> &str {
        &self.scenario.id
    }

    /// A handle that keeps observing resolutions after the transport is
    /// moved into a session.
    pub fn resolutions(&self) -> ResolutionLog {
        self.resolutions.clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn next_record(&mut self) -> Result<Option<Record>> {
        if self.closed || self.next >= self.scenario.messages.len() {
            return Ok(None);
        }
        if !self.scenario.delay.is_zero() {
            tokio::time::sleep(self.scenario.delay).await;
        }
        // Advance only after the delay so a cancelled call loses nothing.
        let msg = self.scenario.messages[self.next].clone();
        self.next += 1;
        Ok(Some(Record::Message(msg)))
    }

    fn resolve_tool(&mut self, resolution: ToolResolution) -> Result<()> {
        tracing::debug!(
            scenario = %self.scenario.id,
            tool_use_id = %resolution.tool_use_id(),
            "scripted agent received resolution"
        );
        self.resolutions.push(resolution);
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.closed = true;
    }
}

// ─── Built-ins ────────────────────────────────────────────────────────────

fn system(session_id: &str) -> Message {
    Message::System(SystemMessage {
        session_id: Some(session_id.to_owned()),
        model: Some("scripted".into()),
        ..Default::default()
    })
}

fn assistant(blocks: Vec<ContentBlock>) -> Message {
    Message::Assistant(AssistantMessage::new(blocks))
}

fn tool_result(id: &str, content: &str) -> Message {
    Message::User(UserMessage::new(vec![ContentBlock::tool_result(id, content)]))
}

fn result(usage: Usage, num_turns: u32, text: &str) -> Message {
    Message::Result(ResultMessage {
        num_turns: Some(num_turns),
        duration_ms: Some(0),
        result: Some(text.to_owned()),
        ..ResultMessage::success(usage)
    })
}

pub fn builtin_scenarios() -> Vec<Scenario> {
    vec![
        Scenario::new(
            "quick-success",
            vec![
                assistant(vec![ContentBlock::text("done")]),
                Message::Result(ResultMessage::success(Usage::new(5, 10))),
            ],
        )
        .with_description("One text reply, then success"),
        Scenario::new(
            "tool-use",
            vec![
                system("scripted-tool-use"),
                assistant(vec![
                    ContentBlock::text("Writing the file."),
                    ContentBlock::tool_use(
                        "t1",
                        "write_file",
                        serde_json::json!({"path": "out.txt", "content": "hello"}),
                    ),
                ]),
                tool_result("t1", "wrote out.txt"),
                assistant(vec![ContentBlock::text("File written.")]),
                result(Usage::new(40, 25), 2, "File written."),
            ],
        )
        .with_description("A single write_file tool call"),
        Scenario::new(
            "error",
            vec![
                assistant(vec![ContentBlock::text("Something went wrong.")]),
                Message::Result(ResultMessage {
                    subtype: "error_during_execution".into(),
                    is_error: true,
                    num_turns: Some(1),
                    ..ResultMessage::success(Usage::new(3, 4))
                }),
            ],
        )
        .with_description("Ends with an error result"),
        Scenario::new(
            "slow",
            vec![
                assistant(vec![ContentBlock::text("thinking it over")]),
                assistant(vec![ContentBlock::text("done")]),
                result(Usage::new(8, 12), 1, "done"),
            ],
        )
        .with_description("Three messages, 500ms apart")
        .with_delay(Duration::from_millis(500)),
        Scenario::new(
            "multi-turn",
            vec![
                system("scripted-multi-turn"),
                assistant(vec![ContentBlock::tool_use(
                    "t1",
                    "read_file",
                    serde_json::json!({"path": "src/lib.rs"}),
                )]),
                tool_result("t1", "pub fn answer() -> u32 { 41 }"),
                assistant(vec![
                    ContentBlock::text("Fixing the constant."),
                    ContentBlock::tool_use(
                        "t2",
                        "write_file",
                        serde_json::json!({"path": "src/lib.rs", "content": "pub fn answer() -> u32 { 42 }"}),
                    ),
                ]),
                tool_result("t2", "wrote src/lib.rs"),
                assistant(vec![ContentBlock::text("Updated answer() to return 42.")]),
                result(Usage::new(120, 60), 3, "Updated answer() to return 42."),
            ],
        )
        .with_description("Read then write across three turns"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered_with_quick_success_default() {
        let registry = ScenarioRegistry::new();
        let ids: Vec<_> = registry.list().into_iter().map(|s| s.id).collect();
        assert_eq!(
            ids,
            ["error", "multi-turn", "quick-success", "slow", "tool-use"]
        );
        assert_eq!(registry.default_scenario(), DEFAULT_SCENARIO);
        assert!(registry
            .list()
            .iter()
            .any(|s| s.id == "quick-success" && s.is_default && s.messages == 2));
    }

    #[test]
    fn first_matching_pattern_wins_else_default() {
        let registry = ScenarioRegistry::new();
        registry.map_pattern("bug", "error").unwrap();
        registry.map_pattern("fix", "tool-use").unwrap();

        assert_eq!(registry.resolve("fix this bug").unwrap().id, "error");
        assert_eq!(registry.resolve("FIX the docs").unwrap().id, "tool-use");
        assert_eq!(registry.resolve("add feature").unwrap().id, "quick-success");

        registry.set_default("slow").unwrap();
        assert_eq!(registry.resolve("add feature").unwrap().id, "slow");
    }

    #[test]
    fn remapping_keeps_priority() {
        let registry = ScenarioRegistry::new();
        registry.map_pattern("bug", "error").unwrap();
        registry.map_pattern("fix", "tool-use").unwrap();
        registry.map_pattern("bug", "slow").unwrap();
        assert_eq!(
            registry.mappings(),
            vec![
                ("bug".to_string(), "slow".to_string()),
                ("fix".to_string(), "tool-use".to_string()),
            ]
        );
        assert_eq!(registry.resolve("fix bug").unwrap().id, "slow");
    }

    #[test]
    fn unknown_scenario_rejected_at_configuration() {
        let registry = ScenarioRegistry::new();
        assert!(matches!(
            registry.set_default("nope"),
            Err(SessionError::ScenarioNotFound(id)) if id == "nope"
        ));
        assert!(matches!(
            registry.map_pattern("x", "nope"),
            Err(SessionError::ScenarioNotFound(_))
        ));
        assert!(registry.mappings().is_empty());
        assert_eq!(registry.default_scenario(), DEFAULT_SCENARIO);
    }

    #[test]
    fn invalid_regex_rejected() {
        let registry = ScenarioRegistry::new();
        let err = registry.map_pattern("(unclosed", "error").unwrap_err();
        assert!(matches!(err, SessionError::InvalidPattern { .. }));
    }

    #[test]
    fn removal_and_default_are_idempotent() {
        let registry = ScenarioRegistry::new();
        registry.map_pattern("bug", "error").unwrap();
        assert!(!registry.remove_mapping("never-mapped"));
        assert_eq!(registry.mappings().len(), 1);

        registry.set_default("error").unwrap();
        registry.set_default("error").unwrap();
        assert_eq!(registry.default_scenario(), "error");

        assert!(registry.remove_mapping("bug"));
        assert!(!registry.remove_mapping("bug"));
    }

    #[test]
    fn reset_restores_builtins() {
        let registry = ScenarioRegistry::new();
        registry.register(Scenario::new("custom", vec![]));
        registry.map_pattern("bug", "custom").unwrap();
        registry.set_default("custom").unwrap();

        registry.reset();
        assert!(registry.get("custom").is_none());
        assert!(registry.mappings().is_empty());
        assert_eq!(registry.default_scenario(), DEFAULT_SCENARIO);
    }

    #[test]
    fn clones_share_state() {
        let registry = ScenarioRegistry::new();
        let handle = registry.clone();
        handle.map_pattern("bug", "error").unwrap();
        assert_eq!(registry.resolve("a bug").unwrap().id, "error");
    }

    #[tokio::test]
    async fn bound_scenario_ignores_later_edits() {
        let registry = ScenarioRegistry::new();
        registry.register(Scenario::new(
            "custom",
            vec![assistant(vec![ContentBlock::text("v1")])],
        ));
        let mut transport = ScriptedTransport::start(&registry, "anything").unwrap();
        assert_eq!(transport.scenario_id(), "quick-success");

        registry.set_default("custom").unwrap();
        registry.register(Scenario::new("quick-success", vec![]));

        let mut count = 0;
        while transport.next_record().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn shutdown_stops_replay() {
        let registry = ScenarioRegistry::new();
        let mut transport = ScriptedTransport::start(&registry, "go").unwrap();
        assert!(transport.next_record().await.unwrap().is_some());
        transport.shutdown().await;
        assert!(transport.next_record().await.unwrap().is_none());
    }

    #[test]
    fn resolutions_are_logged_in_order() {
        let mut transport = ScriptedTransport::new(Arc::new(Scenario::new("empty", vec![])));
        let log = transport.resolutions();
        transport
            .resolve_tool(ToolResolution::Deny {
                tool_use_id: "t1".into(),
                tool_name: "Bash".into(),
                message: "access denied: no".into(),
            })
            .unwrap();
        assert_eq!(log.snapshot().len(), 1);
        assert_eq!(log.snapshot()[0].tool_use_id(), "t1");
    }
}
