//! Plan capture and resolution for `ExitPlanMode`.

use std::path::{Path, PathBuf};

use corral_core::backend::ExecutionBackend;
use corral_core::ids::SessionId;
use corral_core::session::PendingPlan;
use corral_settings::PlanSettings;
use regex::Regex;
use serde_json::Value;

/// Keys under which a plan proposal may name its file.
const PATH_KEYS: &[&str] = &["planFilePath", "plan_file_path", "filePath", "file_path"];

/// Decides which written paths look like plan files.
#[derive(Clone, Debug)]
pub struct PlanMatcher {
    patterns: Vec<Regex>,
    default_file_name: String,
}

impl PlanMatcher {
    pub fn new(patterns: Vec<Regex>, default_file_name: impl Into<String>) -> Self {
        Self { patterns, default_file_name: default_file_name.into() }
    }

    /// Invalid patterns are logged and skipped.
    pub fn from_settings(settings: &PlanSettings) -> Self {
        let patterns = settings
            .path_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "ignoring invalid plan path pattern");
                    None
                }
            })
            .collect();
        Self::new(patterns, settings.default_file_name.clone())
    }

    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(path))
    }

    pub fn default_file_name(&self) -> &str {
        &self.default_file_name
    }
}

impl Default for PlanMatcher {
    fn default() -> Self {
        Self::from_settings(&PlanSettings::default())
    }
}

/// A write-tool call that targeted a plan-like path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedPlan {
    pub path: String,
    /// Full text when the tool wrote the whole file; edits only carry a path.
    pub content: Option<String>,
}

/// Capture a write-tool invocation whose path matches the matcher.
pub fn capture(matcher: &PlanMatcher, tool_name: &str, input: &Value) -> Option<CapturedPlan> {
    let path = input.get("file_path").or_else(|| input.get("filePath")).and_then(Value::as_str)?;
    if !matcher.matches(path) {
        return None;
    }
    match tool_name {
        "Write" => Some(CapturedPlan {
            path: path.to_string(),
            content: input.get("content").and_then(Value::as_str).map(str::to_owned),
        }),
        "Edit" | "MultiEdit" => Some(CapturedPlan { path: path.to_string(), content: None }),
        _ => None,
    }
}

fn inline_plan(input: &Value) -> Option<String> {
    input
        .get("plan")
        .and_then(Value::as_str)
        .filter(|p| !p.trim().is_empty())
        .map(str::to_owned)
}

fn explicit_path(input: &Value) -> Option<String> {
    PATH_KEYS
        .iter()
        .find_map(|k| input.get(*k).and_then(Value::as_str))
        .filter(|p| !p.trim().is_empty())
        .map(str::to_owned)
}

/// Split a `plan-pending` payload into its tool-use id and tool input. The
/// input may be nested under `input` or be the payload itself.
pub fn payload_parts(payload: &Value) -> (Option<String>, Value) {
    let tool_use_id = ["toolUseId", "tool_use_id"]
        .iter()
        .find_map(|k| payload.get(*k).and_then(Value::as_str))
        .map(str::to_owned);
    let input = payload.get("input").cloned().unwrap_or_else(|| payload.clone());
    (tool_use_id, input)
}

fn resolve_local(working_dir: &str, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        Path::new(working_dir).join(p)
    }
}

async fn read_local(working_dir: &str, path: &str) -> Option<String> {
    match tokio::fs::read_to_string(resolve_local(working_dir, path)).await {
        Ok(text) if !text.trim().is_empty() => Some(text),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(path, error = %e, "plan file not readable locally");
            None
        }
    }
}

/// Everything plan resolution may consult.
pub struct PlanSources<'a> {
    pub input: &'a Value,
    pub tool_use_id: Option<String>,
    pub captured: Option<CapturedPlan>,
    pub working_dir: &'a str,
    pub default_file_name: &'a str,
    pub backend: &'a dyn ExecutionBackend,
    pub session_id: &'a SessionId,
}

/// Find the plan text. Order: inline plan, explicit file path, captured
/// write-tool content or path, the default project-root file, and finally
/// a read through the backend of every candidate path.
pub async fn resolve(src: PlanSources<'_>) -> Option<PendingPlan> {
    let found = |content: String, path: Option<String>| PendingPlan {
        tool_use_id: src.tool_use_id.clone(),
        content,
        path,
    };

    if let Some(plan) = inline_plan(src.input) {
        return Some(found(plan, explicit_path(src.input)));
    }

    let explicit = explicit_path(src.input);
    if let Some(path) = &explicit {
        if let Some(text) = read_local(src.working_dir, path).await {
            return Some(found(text, Some(path.clone())));
        }
    }

    if let Some(captured) = &src.captured {
        if let Some(text) = captured.content.clone().filter(|t| !t.trim().is_empty()) {
            return Some(found(text, Some(captured.path.clone())));
        }
        if let Some(text) = read_local(src.working_dir, &captured.path).await {
            return Some(found(text, Some(captured.path.clone())));
        }
    }

    if let Some(text) = read_local(src.working_dir, src.default_file_name).await {
        return Some(found(text, Some(src.default_file_name.to_string())));
    }

    let candidates = explicit
        .into_iter()
        .chain(src.captured.as_ref().map(|c| c.path.clone()))
        .chain(std::iter::once(src.default_file_name.to_string()));
    for path in candidates {
        match src.backend.read_file_from_agent(src.session_id, &path).await {
            Ok(Some(text)) if !text.trim().is_empty() => return Some(found(text, Some(path))),
            Ok(_) => {}
            Err(e) => tracing::debug!(path = %path, error = %e, "agent-side plan read failed"),
        }
    }
    None
}

/// User message that executes a stored plan. The plan travels inline since a
/// fresh context may run somewhere the old plan file doesn't exist.
pub fn execution_message(plan: &str) -> String {
    format!(
        "Implement the following plan. The complete plan is included below; \
         do not read any plan file from disk.\n\n{plan}"
    )
}

pub fn approval_message() -> String {
    "The plan is approved. Proceed with the implementation.".to_string()
}

pub fn revision_message(feedback: Option<&str>) -> String {
    match feedback.map(str::trim).filter(|f| !f.is_empty()) {
        Some(feedback) => format!("I'd like changes to the plan before you proceed. Please revise it:\n\n{feedback}"),
        None => "I'd like changes to the plan before you proceed. Please revise it.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_backends::MockBackend;
    use serde_json::json;

    #[test]
    fn default_patterns_match_plan_locations() {
        let m = PlanMatcher::default();
        assert!(m.matches("/home/u/.claude/plans/refactor.md"));
        assert!(m.matches("/repo/.agent/PLAN.md"));
        assert!(m.matches("/repo/.agent/notes/my-plan.md"));
        assert!(!m.matches("/repo/src/plan.rs"));
        assert!(!m.matches("/repo/docs/plan.md"));
    }

    #[test]
    fn invalid_patterns_are_skipped() {
        let settings = PlanSettings { path_patterns: vec!["(".into(), "plans".into()], ..Default::default() };
        let m = PlanMatcher::from_settings(&settings);
        assert!(m.matches("/x/plans/a"));
    }

    #[test]
    fn capture_write_and_edit() {
        let m = PlanMatcher::default();
        let write = capture(&m, "Write", &json!({"file_path": "/w/.claude/plans/a.md", "content": "# A"})).unwrap();
        assert_eq!(write.content.as_deref(), Some("# A"));
        let edit = capture(&m, "Edit", &json!({"file_path": "/w/.claude/plans/a.md", "old_string": "x"})).unwrap();
        assert!(edit.content.is_none());
        assert!(capture(&m, "Write", &json!({"file_path": "/w/src/main.rs", "content": "fn"})).is_none());
        assert!(capture(&m, "Read", &json!({"file_path": "/w/.claude/plans/a.md"})).is_none());
    }

    #[test]
    fn payload_input_may_be_nested() {
        let (id, input) = payload_parts(&json!({"toolUseId": "t1", "input": {"plan": "p"}}));
        assert_eq!(id.as_deref(), Some("t1"));
        assert_eq!(input["plan"], "p");
        let (id, input) = payload_parts(&json!({"plan": "flat"}));
        assert!(id.is_none());
        assert_eq!(input["plan"], "flat");
    }

    fn sources<'a>(
        input: &'a Value,
        captured: Option<CapturedPlan>,
        working_dir: &'a str,
        default_file_name: &'a str,
        backend: &'a MockBackend,
        session_id: &'a SessionId,
    ) -> PlanSources<'a> {
        PlanSources {
            input,
            tool_use_id: Some("toolu_plan".into()),
            captured,
            working_dir,
            default_file_name,
            backend,
            session_id,
        }
    }

    #[tokio::test]
    async fn resolution_order() {
        let dir = tempfile::tempdir().unwrap();
        let wd = dir.path().to_string_lossy().into_owned();
        std::fs::write(dir.path().join("explicit.md"), "from explicit").unwrap();
        std::fs::write(dir.path().join("PLAN.md"), "from default").unwrap();
        let backend = MockBackend::new(vec![]).with_file("agent.md", "from agent");
        let sid = SessionId::new();
        let captured = Some(CapturedPlan { path: "/gone/plans/x.md".into(), content: Some("from capture".into()) });

        let inline = json!({"plan": "inline"});
        let explicit = json!({"planFilePath": "explicit.md"});
        let empty = json!({});
        let agent_only = json!({"filePath": "agent.md"});

        let plan = resolve(sources(&inline, captured.clone(), &wd, "PLAN.md", &backend, &sid)).await.unwrap();
        assert_eq!(plan.content, "inline");
        assert_eq!(plan.tool_use_id.as_deref(), Some("toolu_plan"));
        let plan = resolve(sources(&explicit, captured.clone(), &wd, "PLAN.md", &backend, &sid)).await.unwrap();
        assert_eq!(plan.content, "from explicit");
        let plan = resolve(sources(&empty, captured, &wd, "PLAN.md", &backend, &sid)).await.unwrap();
        assert_eq!(plan.content, "from capture");
        let plan = resolve(sources(&empty, None, &wd, "PLAN.md", &backend, &sid)).await.unwrap();
        assert_eq!(plan.content, "from default");
        let plan = resolve(sources(&agent_only, None, &wd, "MISSING.md", &backend, &sid)).await.unwrap();
        assert_eq!(plan.content, "from agent");
        assert_eq!(plan.path.as_deref(), Some("agent.md"));
        assert!(resolve(sources(&empty, None, &wd, "MISSING.md", &backend, &sid)).await.is_none());
    }

    #[test]
    fn messages_carry_plan_and_feedback() {
        let m = execution_message("1. do it");
        assert!(m.contains("1. do it"));
        assert!(m.contains("do not read any plan file"));
        assert!(revision_message(Some("smaller steps")).ends_with("smaller steps"));
        assert!(revision_message(Some("  ")).ends_with("revise it."));
    }
}
