use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Seed entry for the dynamic collaborative plan before any real update has
/// been recorded, so `TaskManager::latest_plan` never returns an empty string.
pub const INITIAL_PLAN: &str = "No collaborative consensual plans shaped yet.";

/// Who must speak next: a single agent name, or an explicit set of names.
/// `next_speaker` on the wire is duck-typed as `name | [name]`; this tagged
/// union normalises both shapes on receive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum NextSpeaker {
    Single(String),
    Many(Vec<String>),
    /// Nobody — used by a Pause message while triggers are outstanding.
    None(EmptyNextSpeaker),
}

/// Matches the source's empty-string `next_speaker=""` sentinel for "nobody".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub struct EmptyNextSpeaker;

impl TryFrom<String> for EmptyNextSpeaker {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            Ok(EmptyNextSpeaker)
        } else {
            Err(format!("expected empty next_speaker, got {value:?}"))
        }
    }
}

impl From<EmptyNextSpeaker> for String {
    fn from(_: EmptyNextSpeaker) -> Self {
        String::new()
    }
}

impl NextSpeaker {
    pub fn single(name: impl Into<String>) -> Self {
        NextSpeaker::Single(name.into())
    }

    pub fn many(names: impl IntoIterator<Item = String>) -> Self {
        NextSpeaker::Many(names.into_iter().collect())
    }

    pub fn nobody() -> Self {
        NextSpeaker::None(EmptyNextSpeaker)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, NextSpeaker::None(_))
    }

    /// Normalised set of addressed names (empty when nobody is addressed).
    pub fn names(&self) -> HashSet<String> {
        match self {
            NextSpeaker::Single(name) => std::iter::once(name.clone()).collect(),
            NextSpeaker::Many(names) => names.iter().cloned().collect(),
            NextSpeaker::None(_) => HashSet::new(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        match self {
            NextSpeaker::Single(n) => n == name,
            NextSpeaker::Many(names) => names.iter().any(|n| n == name),
            NextSpeaker::None(_) => false,
        }
    }
}

/// Human vs automated participant. Selects which system persona the
/// Coordination Engine loads.
#[derive(Debug, Clone, Copy, Serialize_repr, Deserialize_repr, PartialEq, Eq)]
#[repr(u8)]
pub enum AgentType {
    HumanAssistant = 0,
    ThingAssistant = 1,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    pub desc: String,
    pub created_at: DateTime<Utc>,
}

/// A group chat with a fixed member list, created by teamup and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub comm_id: Uuid,
    pub member_names: HashSet<String>,
    #[serde(default)]
    pub team_name: Option<String>,
}

/// Communication state machine stage, integer-tagged to match the source
/// exactly (0-indexed, declaration order).
#[derive(Debug, Clone, Copy, Serialize_repr, Deserialize_repr, PartialEq, Eq)]
#[repr(u8)]
pub enum CommunicationState {
    Teamup = 0,
    Discussion = 1,
    Vote = 2,
    Execution = 3,
}

/// AgentMessage type discriminant, integer-tagged to match the source exactly.
#[derive(Debug, Clone, Copy, Serialize_repr, Deserialize_repr, PartialEq, Eq)]
#[repr(u8)]
pub enum CommunicationType {
    Default = 0,
    Proposal = 1,
    Vote = 2,
    VotingResult = 3,
    Discussion = 4,
    SyncAssign = 5,
    AsyncAssign = 6,
    InformResult = 7,
    InformProgress = 8,
    Pause = 9,
    ConcludeDiscussion = 10,
    Conclusion = 11,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMessage {
    pub content: String,
    pub sender: String,
    pub comm_id: Uuid,
    pub next_speaker: NextSpeaker,
    pub state: CommunicationState,
    #[serde(rename = "type")]
    pub message_type: CommunicationType,
    #[serde(default)]
    pub proposal_id: Option<String>,
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub team_members: Option<Vec<String>>,
    #[serde(default)]
    pub team_up_depth: Option<u32>,
    #[serde(default)]
    pub task_id: Option<Uuid>,
    #[serde(default)]
    pub task_desc: Option<String>,
    #[serde(default)]
    pub task_conclusion: Option<String>,
    #[serde(default)]
    pub task_abstract: Option<String>,
    #[serde(default)]
    pub triggers: Vec<Uuid>,
    #[serde(default)]
    pub updated_plan: Option<String>,
    #[serde(default)]
    pub is_collaborative_planning_enabled: bool,
    #[serde(default)]
    pub max_turns: Option<u32>,
}

/// Archived, append-only transcript for one session.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatRecord {
    pub comm_id: Option<Uuid>,
    pub agent_names: Vec<String>,
    pub team_name: Option<String>,
    pub chat_record: Vec<AgentMessage>,
}

impl ChatRecord {
    pub fn new(comm_id: Uuid, agent_names: Vec<String>, team_name: Option<String>) -> Self {
        Self {
            comm_id: Some(comm_id),
            agent_names,
            team_name,
            chat_record: Vec::new(),
        }
    }

    pub fn append(&mut self, message: AgentMessage) {
        self.chat_record.push(message);
    }
}

/// One rendered turn for LLM consumption.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// Append-only per-session transcript, rendered relative to a viewer.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatHistory {
    entries: Vec<AgentMessage>,
}

impl ChatHistory {
    pub fn push(&mut self, message: AgentMessage) {
        self.entries.push(message);
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[AgentMessage] {
        &self.entries
    }

    /// Messages authored by `viewer_name` render as `assistant`; everyone
    /// else's content already carries the `[name]:` prefix and renders as
    /// `user`.
    pub fn to_messages(&self, viewer_name: &str) -> Vec<ChatTurn> {
        self.entries
            .iter()
            .map(|msg| ChatTurn {
                role: if msg.sender == viewer_name {
                    "assistant".to_string()
                } else {
                    "user".to_string()
                },
                content: msg.content.clone(),
            })
            .collect()
    }

    /// The most recent non-housekeeping messages (everything except
    /// Pause/ConcludeDiscussion/Conclusion bookkeeping), newest last.
    pub fn recent_substantive(&self, count: usize) -> Vec<&AgentMessage> {
        self.entries
            .iter()
            .filter(|m| {
                !matches!(
                    m.message_type,
                    CommunicationType::Pause
                        | CommunicationType::ConcludeDiscussion
                        | CommunicationType::Conclusion
                )
            })
            .rev()
            .take(count)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }
}

/// Per-session, per-client coordination state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunicationInfo {
    pub comm_id: Uuid,
    pub goal: String,
    pub team_members: Vec<String>,
    pub memory: ChatHistory,
    pub state: CommunicationState,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub team_up_depth: Option<u32>,
    #[serde(default)]
    pub is_collaborative_planning_enabled: bool,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub curr_turn: u32,
}

impl CommunicationInfo {
    pub fn new(comm_id: Uuid, goal: impl Into<String>, team_members: Vec<String>) -> Self {
        Self {
            comm_id,
            goal: goal.into(),
            team_members,
            memory: ChatHistory::default(),
            state: CommunicationState::Teamup,
            conclusion: None,
            team_up_depth: None,
            is_collaborative_planning_enabled: false,
            max_turns: None,
            curr_turn: 0,
        }
    }

    /// `conclusion` transitions null -> non-null exactly once; re-setting it
    /// for a continuation goes through `clear_conclusion` first.
    pub fn set_conclusion(&mut self, conclusion: impl Into<String>) {
        self.conclusion = Some(conclusion.into());
    }

    pub fn clear_conclusion(&mut self) {
        self.conclusion = None;
    }

    pub fn is_concluded(&self) -> bool {
        self.conclusion.is_some()
    }
}

/// Task lifecycle. Priority is monotone non-decreasing; Failed shares
/// Completed's priority so triggers release on either outcome.
#[derive(Debug, Clone, Copy, Serialize_repr, Deserialize_repr, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    ToStart = 0,
    InProgress = 1,
    Completed = 2,
    Failed = 3,
}

impl TaskStatus {
    pub fn priority(self) -> u8 {
        match self {
            TaskStatus::ToStart => 0,
            TaskStatus::InProgress => 1,
            TaskStatus::Completed | TaskStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEntry {
    pub task_id: Uuid,
    pub task_desc: String,
    pub task_abstract: String,
    pub assignee: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub conclusion: Option<String>,
}

impl TaskEntry {
    pub fn new(
        task_id: Uuid,
        task_desc: impl Into<String>,
        task_abstract: impl Into<String>,
        assignee: impl Into<String>,
        status: TaskStatus,
    ) -> Self {
        Self {
            task_id,
            task_desc: task_desc.into(),
            task_abstract: task_abstract.into(),
            assignee: assignee.into(),
            status,
            conclusion: None,
        }
    }

    /// Apply a status update, enforcing monotone-by-priority.
    pub fn update_status(&mut self, status: TaskStatus) {
        if status.priority() >= self.status.priority() {
            self.status = status;
        }
    }
}

/// Gates the post-assignment speaker: after an assignment broadcast, no
/// further coordination turn runs until every assignee has sent an INFORM.
/// A fresh assignment fully replaces the previous wait set (not additive).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskAssignmentRespondManager {
    pub comm_id: Option<Uuid>,
    pub await_agents: HashSet<String>,
}

impl TaskAssignmentRespondManager {
    pub fn register_await_agents(&mut self, comm_id: Uuid, names: impl IntoIterator<Item = String>) {
        self.comm_id = Some(comm_id);
        self.await_agents = names.into_iter().collect();
    }

    pub fn mark(&mut self, name: &str) {
        self.await_agents.remove(name);
    }

    pub fn is_empty(&self) -> bool {
        self.await_agents.is_empty()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TaskManagerError {
    #[error("SetTriggers/UpdateTriggers requires an empty trigger set")]
    TriggersNotEmpty,
}

/// Per-session task ledger: lifecycle, dependency triggers, and the dynamic
/// collaborative plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskManager {
    global_index: u64,
    tasks: Vec<(Uuid, TaskEntry)>,
    index_by_id: HashMap<Uuid, usize>,
    pub task_assign_manager: TaskAssignmentRespondManager,
    triggers: HashMap<Uuid, bool>,
    trigger_setter: Option<String>,
    previous_triggers_status: bool,
    current_triggers_status: bool,
    msg_to_task: HashMap<Uuid, Uuid>,
    dynamic_plan: Vec<String>,
}

impl Default for TaskManager {
    fn default() -> Self {
        Self {
            global_index: 0,
            tasks: Vec::new(),
            index_by_id: HashMap::new(),
            task_assign_manager: TaskAssignmentRespondManager::default(),
            triggers: HashMap::new(),
            trigger_setter: None,
            previous_triggers_status: true,
            current_triggers_status: true,
            msg_to_task: HashMap::new(),
            dynamic_plan: vec![INITIAL_PLAN.to_string()],
        }
    }
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assigns a monotonically increasing index and a fresh id when none is
    /// supplied.
    pub fn create_task(
        &mut self,
        desc: impl Into<String>,
        task_abstract: impl Into<String>,
        assignee: impl Into<String>,
        status: TaskStatus,
        id: Option<Uuid>,
    ) -> Uuid {
        let task_id = id.unwrap_or_else(Uuid::new_v4);
        let entry = TaskEntry::new(task_id, desc, task_abstract, assignee, status);
        let index = self.tasks.len();
        self.tasks.push((task_id, entry));
        self.index_by_id.insert(task_id, index);
        self.global_index += 1;
        task_id
    }

    /// Creates the task if unknown (out-of-order delivery), then applies the
    /// monotone status update. On reaching terminal priority, flips a live
    /// trigger and recomputes `current_triggers_status`; binds `msg` to the
    /// task if supplied.
    #[allow(clippy::too_many_arguments)]
    pub fn update_task(
        &mut self,
        id: Uuid,
        desc: impl Into<String>,
        task_abstract: impl Into<String>,
        assignee: impl Into<String>,
        status: TaskStatus,
        conclusion: Option<String>,
        msg_id: Option<Uuid>,
    ) {
        if !self.index_by_id.contains_key(&id) {
            self.create_task(desc, task_abstract, assignee, status, Some(id));
        }
        let index = self.index_by_id[&id];
        let entry = &mut self.tasks[index].1;
        entry.update_status(status);
        if conclusion.is_some() {
            entry.conclusion = conclusion;
        }

        if status.is_terminal() {
            if let Some(flag) = self.triggers.get_mut(&id) {
                *flag = true;
                self.previous_triggers_status = self.current_triggers_status;
                self.current_triggers_status = self.check_triggers();
            }
        }
        if let Some(msg_id) = msg_id {
            self.msg_to_task.insert(msg_id, id);
        }
    }

    pub fn task(&self, id: Uuid) -> Option<&TaskEntry> {
        self.index_by_id.get(&id).map(|&i| &self.tasks[i].1)
    }

    pub fn tasks_by_status(&self, statuses: &[TaskStatus]) -> Vec<&TaskEntry> {
        self.tasks
            .iter()
            .map(|(_, entry)| entry)
            .filter(|entry| statuses.contains(&entry.status))
            .collect()
    }

    fn check_triggers(&self) -> bool {
        self.triggers.is_empty() || self.triggers.values().all(|&v| v)
    }

    /// Resolves each selection as index-or-id, dropping unresolvable indices.
    /// Called by the pause initiator.
    pub fn set_triggers(
        &mut self,
        selections: &[TriggerSelector],
        setter: impl Into<String>,
    ) -> Result<(bool, Vec<Uuid>), TaskManagerError> {
        if !self.triggers.is_empty() {
            return Err(TaskManagerError::TriggersNotEmpty);
        }
        let mut ids = Vec::new();
        for sel in selections {
            let resolved = match sel {
                TriggerSelector::Index(i) => self.tasks.get(*i as usize).map(|(id, _)| *id),
                TriggerSelector::Id(id) => self.index_by_id.contains_key(id).then_some(*id),
            };
            let Some(id) = resolved else { continue };
            let terminal = self.task(id).map(|t| t.status.is_terminal()).unwrap_or(false);
            self.triggers.insert(id, terminal);
            ids.push(id);
        }
        self.finish_set_triggers(setter, ids)
    }

    /// Identical semantics to `set_triggers` except selections are ids only
    /// and unknown ids are still registered with trigger=false (eventual
    /// consistency across delivery latency). Called by non-initiators
    /// reacting to a broadcast Pause.
    pub fn update_triggers(
        &mut self,
        selections: &[Uuid],
        setter: impl Into<String>,
    ) -> Result<(bool, Vec<Uuid>), TaskManagerError> {
        if !self.triggers.is_empty() {
            return Err(TaskManagerError::TriggersNotEmpty);
        }
        let mut ids = Vec::new();
        for &id in selections {
            let terminal = self.task(id).map(|t| t.status.is_terminal()).unwrap_or(false);
            self.triggers.insert(id, terminal);
            ids.push(id);
        }
        self.finish_set_triggers(setter, ids)
    }

    fn finish_set_triggers(
        &mut self,
        setter: impl Into<String>,
        ids: Vec<Uuid>,
    ) -> Result<(bool, Vec<Uuid>), TaskManagerError> {
        if self.triggers.is_empty() || self.triggers.values().all(|&v| v) {
            self.clear_triggers();
            Ok((false, ids))
        } else {
            self.trigger_setter = Some(setter.into());
            self.previous_triggers_status = true;
            self.current_triggers_status = false;
            Ok((true, ids))
        }
    }

    /// One-shot edge: true iff the previous check was false and the current
    /// one is true.
    pub fn is_triggered(&self) -> bool {
        !self.previous_triggers_status && self.current_triggers_status
    }

    pub fn clear_triggers(&mut self) {
        self.triggers.clear();
        self.trigger_setter = None;
        self.previous_triggers_status = true;
        self.current_triggers_status = true;
    }

    pub fn trigger_setter(&self) -> Option<&str> {
        self.trigger_setter.as_deref()
    }

    /// `"The view of task management:\n"` plus one
    /// `"=== task index : N===\n"` block per task in insertion order, or
    /// `"No tasks existed\n"` when empty. Part of the LLM prompt contract —
    /// must be byte-for-byte stable.
    pub fn tasks_view(&self) -> String {
        if self.tasks.is_empty() {
            return "No tasks existed\n".to_string();
        }
        let mut out = String::from("The view of task management:\n");
        for (index, (_, entry)) in self.tasks.iter().enumerate() {
            out.push_str(&format!("=== task index : {index}===\n"));
            out.push_str(&format!("task_id: {}\n", entry.task_id));
            out.push_str(&format!("description: {}\n", entry.task_desc));
            out.push_str(&format!("assignee: {}\n", entry.assignee));
            out.push_str(&format!("status: {:?}\n", entry.status));
            if let Some(c) = &entry.conclusion {
                out.push_str(&format!("conclusion: {c}\n"));
            }
        }
        out
    }

    pub fn update_plan(&mut self, text: impl Into<String>) {
        self.dynamic_plan.push(text.into());
    }

    /// Never empty: seeded with `INITIAL_PLAN`.
    pub fn latest_plan(&self) -> &str {
        self.dynamic_plan.last().expect("dynamic_plan is never empty")
    }

    pub fn bind_msg_to_task(&mut self, msg_id: Uuid, task_id: Uuid) {
        self.msg_to_task.insert(msg_id, task_id);
    }

    pub fn task_for_msg(&self, msg_id: Uuid) -> Option<Uuid> {
        self.msg_to_task.get(&msg_id).copied()
    }

    pub fn completed_tasks(&self) -> Vec<&TaskEntry> {
        self.tasks
            .iter()
            .map(|(_, e)| e)
            .filter(|e| e.status == TaskStatus::Completed)
            .collect()
    }
}

/// A trigger selector accepted by `set_triggers`: either the task's
/// presentation index or its id directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSelector {
    Index(u32),
    Id(Uuid),
}

/// `POST /launch_goal` request body. Normalises empty-string `comm_id` to
/// `None` and an empty/blank `cont_input.content` to a dropped `cont_input`,
/// matching the source's loose dict handling.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LaunchGoalRequest {
    pub goal: String,
    #[serde(default)]
    pub team_member_names: Option<Vec<String>>,
    #[serde(default)]
    pub team_up_depth: Option<u32>,
    #[serde(default)]
    pub is_collaborative_planning_enabled: bool,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub comm_id: Option<Uuid>,
    #[serde(default)]
    pub cont_input: Option<ContinuationInput>,
    #[serde(default)]
    pub obs_kwargs: Option<serde_json::Value>,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub skip_naming: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContinuationInput {
    pub sender: String,
    pub content: String,
}

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<Uuid>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(s) if s.is_empty() => Ok(None),
        Some(s) => Uuid::parse_str(&s).map(Some).map_err(serde::de::Error::custom),
    }
}

/// Replace every character outside `[A-Za-z0-9_]` with `_`, for use as a
/// sqlite table/file name or vector collection name.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_tags_match_source_ordering() {
        assert_eq!(serde_json::to_value(CommunicationState::Teamup).unwrap(), 0);
        assert_eq!(serde_json::to_value(CommunicationState::Discussion).unwrap(), 1);
        assert_eq!(serde_json::to_value(CommunicationState::Vote).unwrap(), 2);
        assert_eq!(serde_json::to_value(CommunicationState::Execution).unwrap(), 3);

        assert_eq!(serde_json::to_value(CommunicationType::Default).unwrap(), 0);
        assert_eq!(serde_json::to_value(CommunicationType::Proposal).unwrap(), 1);
        assert_eq!(serde_json::to_value(CommunicationType::Vote).unwrap(), 2);
        assert_eq!(serde_json::to_value(CommunicationType::VotingResult).unwrap(), 3);
        assert_eq!(serde_json::to_value(CommunicationType::Discussion).unwrap(), 4);
        assert_eq!(serde_json::to_value(CommunicationType::SyncAssign).unwrap(), 5);
        assert_eq!(serde_json::to_value(CommunicationType::AsyncAssign).unwrap(), 6);
        assert_eq!(serde_json::to_value(CommunicationType::InformResult).unwrap(), 7);
        assert_eq!(serde_json::to_value(CommunicationType::InformProgress).unwrap(), 8);
        assert_eq!(serde_json::to_value(CommunicationType::Pause).unwrap(), 9);
        assert_eq!(serde_json::to_value(CommunicationType::ConcludeDiscussion).unwrap(), 10);
        assert_eq!(serde_json::to_value(CommunicationType::Conclusion).unwrap(), 11);
    }

    #[test]
    fn task_status_priority_failed_matches_completed() {
        assert_eq!(TaskStatus::Completed.priority(), TaskStatus::Failed.priority());
        assert!(TaskStatus::ToStart.priority() < TaskStatus::InProgress.priority());
        assert!(TaskStatus::InProgress.priority() < TaskStatus::Completed.priority());
    }

    #[test]
    fn next_speaker_roundtrips_single_and_many() {
        let single = NextSpeaker::single("AgentB");
        let json = serde_json::to_string(&single).unwrap();
        assert_eq!(json, "\"AgentB\"");
        let back: NextSpeaker = serde_json::from_str(&json).unwrap();
        assert_eq!(back, single);

        let many = NextSpeaker::many(["AgentB".to_string(), "AgentC".to_string()]);
        let json = serde_json::to_string(&many).unwrap();
        let back: NextSpeaker = serde_json::from_str(&json).unwrap();
        assert_eq!(back, many);

        let empty = NextSpeaker::nobody();
        let json = serde_json::to_string(&empty).unwrap();
        assert_eq!(json, "\"\"");
        let back: NextSpeaker = serde_json::from_str(&json).unwrap();
        assert!(back.is_empty());
    }

    #[test]
    fn task_manager_create_then_update_is_monotone() {
        let mut tm = TaskManager::new();
        let id = tm.create_task("do thing", "brief", "AgentB", TaskStatus::ToStart, None);
        assert_eq!(tm.task(id).unwrap().status, TaskStatus::ToStart);

        tm.update_task(id, "do thing", "brief", "AgentB", TaskStatus::InProgress, None, None);
        assert_eq!(tm.task(id).unwrap().status, TaskStatus::InProgress);

        // A stale ToStart update must not regress an InProgress task.
        tm.update_task(id, "do thing", "brief", "AgentB", TaskStatus::ToStart, None, None);
        assert_eq!(tm.task(id).unwrap().status, TaskStatus::InProgress);
    }

    #[test]
    fn update_task_creates_on_unknown_id_out_of_order() {
        let mut tm = TaskManager::new();
        let id = Uuid::new_v4();
        tm.update_task(id, "late arrival", "brief", "AgentC", TaskStatus::Completed, Some("done".into()), None);
        let entry = tm.task(id).unwrap();
        assert_eq!(entry.status, TaskStatus::Completed);
        assert_eq!(entry.conclusion.as_deref(), Some("done"));
    }

    #[test]
    fn set_triggers_empty_selection_degrades_to_not_activated() {
        let mut tm = TaskManager::new();
        let (activated, ids) = tm.set_triggers(&[], "AgentA").unwrap();
        assert!(!activated);
        assert!(ids.is_empty());
    }

    #[test]
    fn set_triggers_then_completion_fires_one_shot_edge() {
        let mut tm = TaskManager::new();
        let id = tm.create_task("task", "brief", "AgentB", TaskStatus::InProgress, None);

        let (activated, ids) = tm.set_triggers(&[TriggerSelector::Id(id)], "AgentA").unwrap();
        assert!(activated);
        assert_eq!(ids, vec![id]);
        assert_eq!(tm.trigger_setter(), Some("AgentA"));
        assert!(!tm.is_triggered());

        tm.update_task(id, "task", "brief", "AgentB", TaskStatus::Completed, Some("ok".into()), None);
        assert!(tm.is_triggered());

        tm.clear_triggers();
        assert!(!tm.is_triggered());
    }

    #[test]
    fn set_triggers_rejects_nonempty_trigger_set() {
        let mut tm = TaskManager::new();
        let id = tm.create_task("task", "brief", "AgentB", TaskStatus::InProgress, None);
        tm.set_triggers(&[TriggerSelector::Id(id)], "AgentA").unwrap();
        let err = tm.set_triggers(&[TriggerSelector::Id(id)], "AgentA").unwrap_err();
        assert_eq!(err, TaskManagerError::TriggersNotEmpty);
    }

    #[test]
    fn update_triggers_registers_unknown_id_as_false() {
        let mut tm = TaskManager::new();
        let unknown = Uuid::new_v4();
        let (activated, ids) = tm.update_triggers(&[unknown], "AgentB").unwrap();
        assert!(activated);
        assert_eq!(ids, vec![unknown]);
    }

    #[test]
    fn set_triggers_drops_unresolvable_index() {
        let mut tm = TaskManager::new();
        let (activated, ids) = tm.set_triggers(&[TriggerSelector::Index(99)], "AgentA").unwrap();
        assert!(!activated);
        assert!(ids.is_empty());
    }

    #[test]
    fn tasks_view_empty_and_populated() {
        let mut tm = TaskManager::new();
        assert_eq!(tm.tasks_view(), "No tasks existed\n");

        tm.create_task("write report", "brief", "AgentB", TaskStatus::ToStart, None);
        let view = tm.tasks_view();
        assert!(view.starts_with("The view of task management:\n"));
        assert!(view.contains("=== task index : 0===\n"));
    }

    #[test]
    fn latest_plan_seeded_and_appends_never_replace() {
        let mut tm = TaskManager::new();
        assert_eq!(tm.latest_plan(), INITIAL_PLAN);
        tm.update_plan("revise section 2");
        assert_eq!(tm.latest_plan(), "revise section 2");
        tm.update_plan("add conclusion");
        assert_eq!(tm.latest_plan(), "add conclusion");
    }

    #[test]
    fn task_assignment_respond_manager_replaces_not_merges() {
        let mut waits = TaskAssignmentRespondManager::default();
        let comm_id = Uuid::new_v4();
        waits.register_await_agents(comm_id, ["B".to_string(), "C".to_string()]);
        waits.mark("B");
        assert!(!waits.is_empty());

        waits.register_await_agents(comm_id, ["D".to_string()]);
        assert!(!waits.await_agents.contains("C"));
        assert!(waits.await_agents.contains("D"));
    }

    #[test]
    fn chat_history_to_messages_roles_by_viewer() {
        let mut history = ChatHistory::default();
        history.push(AgentMessage {
            content: "[AgentA]: hello".into(),
            sender: "AgentA".into(),
            comm_id: Uuid::new_v4(),
            next_speaker: NextSpeaker::single("AgentB"),
            state: CommunicationState::Discussion,
            message_type: CommunicationType::Discussion,
            proposal_id: None,
            goal: None,
            team_members: None,
            team_up_depth: None,
            task_id: None,
            task_desc: None,
            task_conclusion: None,
            task_abstract: None,
            triggers: vec![],
            updated_plan: None,
            is_collaborative_planning_enabled: false,
            max_turns: None,
        });

        let as_a = history.to_messages("AgentA");
        assert_eq!(as_a[0].role, "assistant");
        let as_b = history.to_messages("AgentB");
        assert_eq!(as_b[0].role, "user");
    }

    #[test]
    fn launch_goal_request_normalises_empty_comm_id() {
        let raw = serde_json::json!({
            "goal": "summarise X",
            "comm_id": "",
        });
        let req: LaunchGoalRequest = serde_json::from_value(raw).unwrap();
        assert!(req.comm_id.is_none());
    }

    #[test]
    fn sanitize_name_replaces_non_alnum() {
        assert_eq!(sanitize_name("agent-42 beta"), "agent_42_beta");
        assert_eq!(sanitize_name("plain_Name1"), "plain_Name1");
    }

    #[test]
    fn communication_info_conclusion_transitions_once() {
        let mut info = CommunicationInfo::new(Uuid::new_v4(), "goal", vec!["AgentA".into()]);
        assert!(!info.is_concluded());
        info.set_conclusion("done");
        assert!(info.is_concluded());
        info.clear_conclusion();
        assert!(!info.is_concluded());
    }
}
