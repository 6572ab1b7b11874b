use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::content::Message;
use crate::ids::{QuestionId, SessionId};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    RunningHooks,
    WaitingForInput,
    Running,
    WaitingForQuestionAnswer,
    WaitingForPlanExecution,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Whether a user turn may be started from this state. `Error` is
    /// accepted: a new message re-attempts the backend call chain.
    pub fn accepts_message(self) -> bool {
        !matches!(self, Self::Stopped | Self::Starting | Self::RunningHooks | Self::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::RunningHooks => "running_hooks",
            Self::WaitingForInput => "waiting_for_input",
            Self::Running => "running",
            Self::WaitingForQuestionAnswer => "waiting_for_question_answer",
            Self::WaitingForPlanExecution => "waiting_for_plan_execution",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Plan,
    #[default]
    Build,
}

impl SessionMode {
    /// Permission mode the agent runs under by default in this mode.
    pub fn default_permission(self) -> PermissionMode {
        match self {
            Self::Plan => PermissionMode::Plan,
            Self::Build => PermissionMode::AcceptEdits,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Build => "build",
        }
    }
}

impl std::str::FromStr for SessionMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "build" => Ok(Self::Build),
            other => Err(format!("unknown mode '{other}' (expected plan or build)")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

impl PermissionMode {
    /// Flag value understood by the agent CLI.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::BypassPermissions => "bypassPermissions",
            Self::Plan => "plan",
        }
    }
}

impl std::str::FromStr for PermissionMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "acceptEdits" => Ok(Self::AcceptEdits),
            "bypassPermissions" => Ok(Self::BypassPermissions),
            "plan" => Ok(Self::Plan),
            other => Err(format!("unknown permission mode '{other}'")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Question {
    #[serde(default)]
    pub header: String,
    pub question: String,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    #[serde(default, rename = "multiSelect")]
    pub multi_select: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingQuestion {
    pub id: QuestionId,
    pub tool_use_id: String,
    pub questions: Vec<Question>,
}

impl PendingQuestion {
    /// Build from an `AskUserQuestion` tool input. Entries that don't carry a
    /// question text are skipped; `None` when nothing usable remains.
    pub fn from_tool_input(tool_use_id: impl Into<String>, input: &Value) -> Option<Self> {
        let questions: Vec<Question> = input
            .get("questions")?
            .as_array()?
            .iter()
            .filter_map(|q| serde_json::from_value::<Question>(q.clone()).ok())
            .filter(|q| !q.question.trim().is_empty())
            .collect();
        if questions.is_empty() {
            return None;
        }
        Some(Self {
            id: QuestionId::new(),
            tool_use_id: tool_use_id.into(),
            questions,
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PendingPlan {
    pub tool_use_id: Option<String>,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// One user-visible agent conversation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub entity_id: String,
    pub project_id: String,
    pub working_dir: String,
    pub model: String,
    pub mode: SessionMode,
    status: SessionStatus,
    /// Backend-native resumable conversation id; unset until the agent
    /// announces one.
    pub resume_id: Option<String>,
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub pending_question: Option<PendingQuestion>,
    pub plan: Option<PendingPlan>,
    pub total_cost_usd: f64,
    pub total_duration_ms: u64,
    pub context_cleared_at: Vec<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        entity_id: impl Into<String>,
        project_id: impl Into<String>,
        working_dir: impl Into<String>,
        mode: SessionMode,
        model: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            entity_id: entity_id.into(),
            project_id: project_id.into(),
            working_dir: working_dir.into(),
            model: model.into(),
            mode,
            status: SessionStatus::Starting,
            resume_id: None,
            system_prompt: None,
            messages: Vec::new(),
            pending_question: None,
            plan: None,
            total_cost_usd: 0.0,
            total_duration_ms: 0,
            context_cleared_at: Vec::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Move to `next`. Once stopped a session never leaves that state, so a
    /// turn settling after a concurrent stop cannot resurrect it. Returns
    /// whether the status changed.
    pub fn transition(&mut self, next: SessionStatus) -> bool {
        if self.status.is_terminal() || self.status == next {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next != SessionStatus::Error {
            self.error = None;
        }
        true
    }

    /// Move to `next` only if the current status is `expected`.
    pub fn transition_from(&mut self, expected: SessionStatus, next: SessionStatus) -> bool {
        self.status == expected && self.transition(next)
    }

    pub fn fail(&mut self, message: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.transition(SessionStatus::Error);
        self.error = Some(message.into());
        true
    }

    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    /// Forget the backend conversation but keep history.
    pub fn clear_context(&mut self) {
        self.resume_id = None;
        self.context_cleared_at.push(Utc::now());
        self.updated_at = Utc::now();
    }

    pub fn record_usage(&mut self, cost_usd: Option<f64>, duration_ms: u64) {
        if let Some(cost) = cost_usd {
            self.total_cost_usd += cost;
        }
        self.total_duration_ms += duration_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session() -> Session {
        Session::new("entity", "project", "/work", SessionMode::Build, "sonnet")
    }

    #[test]
    fn new_session_starts_in_starting() {
        let s = session();
        assert_eq!(s.status(), SessionStatus::Starting);
        assert!(s.resume_id.is_none());
        assert!(s.id.as_str().starts_with("sess_"));
    }

    #[test]
    fn stopped_is_sticky() {
        let mut s = session();
        assert!(s.transition(SessionStatus::Running));
        assert!(s.transition(SessionStatus::Stopped));
        assert!(!s.transition(SessionStatus::WaitingForInput));
        assert!(!s.fail("late"));
        assert_eq!(s.status(), SessionStatus::Stopped);
        assert!(s.error.is_none());
    }

    #[test]
    fn error_records_message_and_clears_on_revival() {
        let mut s = session();
        s.transition(SessionStatus::Running);
        assert!(s.fail("boom"));
        assert_eq!(s.error.as_deref(), Some("boom"));
        assert!(s.status().accepts_message());
        s.transition(SessionStatus::Running);
        assert!(s.error.is_none());
    }

    #[test]
    fn transition_from_checks_current_state() {
        let mut s = session();
        s.transition(SessionStatus::Running);
        assert!(!s.transition_from(SessionStatus::WaitingForInput, SessionStatus::Stopped));
        assert!(s.transition_from(SessionStatus::Running, SessionStatus::WaitingForInput));
    }

    #[test]
    fn clear_context_keeps_history() {
        let mut s = session();
        s.resume_id = Some("native".into());
        s.push_message(Message::user_text("hi"));
        s.clear_context();
        assert!(s.resume_id.is_none());
        assert_eq!(s.messages.len(), 1);
        assert_eq!(s.context_cleared_at.len(), 1);
    }

    #[test]
    fn usage_accumulates() {
        let mut s = session();
        s.record_usage(Some(0.5), 100);
        s.record_usage(None, 50);
        s.record_usage(Some(0.25), 0);
        assert!((s.total_cost_usd - 0.75).abs() < f64::EPSILON);
        assert_eq!(s.total_duration_ms, 150);
    }

    #[test]
    fn pending_question_from_input() {
        let input = json!({"questions": [
            {"question": "Which db?", "header": "DB", "multiSelect": false,
             "options": [{"label": "sqlite", "description": "embedded"}, {"label": "postgres"}]},
            {"question": "Add tests?", "header": "Tests", "multiSelect": true, "options": []}
        ]});
        let q = PendingQuestion::from_tool_input("tool_1", &input).unwrap();
        assert_eq!(q.tool_use_id, "tool_1");
        assert_eq!(q.questions.len(), 2);
        assert_eq!(q.questions[0].options[1].description, "");
        assert!(q.questions[1].multi_select);
    }

    #[test]
    fn pending_question_rejects_empty_input() {
        assert!(PendingQuestion::from_tool_input("t", &json!({})).is_none());
        assert!(PendingQuestion::from_tool_input("t", &json!({"questions": []})).is_none());
        assert!(PendingQuestion::from_tool_input("t", &json!({"questions": [{"question": "  "}]})).is_none());
    }

    #[test]
    fn mode_parsing() {
        assert_eq!("plan".parse::<SessionMode>().unwrap(), SessionMode::Plan);
        assert!("yolo".parse::<SessionMode>().is_err());
        assert_eq!(SessionMode::Plan.default_permission().as_str(), "plan");
        for mode in [PermissionMode::Default, PermissionMode::AcceptEdits, PermissionMode::BypassPermissions] {
            assert_eq!(mode.as_str().parse::<PermissionMode>().unwrap(), mode);
        }
    }
}
