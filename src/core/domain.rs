//! Domain records shared by every ring: flows, results, jobs and the per-run log sink.

use std::{
    fmt,
    str::FromStr,
    sync::{Arc, Mutex},
};

use serde::{Deserialize, Serialize};

use crate::core::error::Error;

/// Selects which executor strategy runs a flow's methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Backend,
    Frontend,
    Performance,
    Unit,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Backend,
        Category::Frontend,
        Category::Performance,
        Category::Unit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Backend => "BACKEND",
            Category::Frontend => "FRONTEND",
            Category::Performance => "PERFORMANCE",
            Category::Unit => "UNIT",
        }
    }

    /// Whether the strategy needs a materialized repository rather than a staging URL.
    pub fn requires_repository(self) -> bool {
        !matches!(self, Category::Performance)
    }
}

impl FromStr for Category {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "BACKEND" => Ok(Category::Backend),
            "FRONTEND" => Ok(Category::Frontend),
            "PERFORMANCE" => Ok(Category::Performance),
            "UNIT" => Ok(Category::Unit),
            _ => Err(Error::UnsupportedCategory(value.to_string())),
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a flow. Only the state machine moves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowStatus {
    Idle,
    Running,
    Success,
    Failed,
}

impl FlowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FlowStatus::Idle => "IDLE",
            FlowStatus::Running => "RUNNING",
            FlowStatus::Success => "SUCCESS",
            FlowStatus::Failed => "FAILED",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "IDLE" => Some(FlowStatus::Idle),
            "RUNNING" => Some(FlowStatus::Running),
            "SUCCESS" => Some(FlowStatus::Success),
            "FAILED" => Some(FlowStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FlowStatus::Success | FlowStatus::Failed)
    }
}

impl From<ResultStatus> for FlowStatus {
    fn from(value: ResultStatus) -> Self {
        match value {
            ResultStatus::Success => FlowStatus::Success,
            ResultStatus::Failed => FlowStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    Success,
    Failed,
}

impl ResultStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultStatus::Success => "SUCCESS",
            ResultStatus::Failed => "FAILED",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "SUCCESS" => Some(ResultStatus::Success),
            "FAILED" => Some(ResultStatus::Failed),
            _ => None,
        }
    }
}

/// The slice of a project record the engine reads. Its CRUD lives elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub github_url: Option<String>,
    pub staging_url: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestFlow {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub description: String,
    pub category: Category,
    pub methods: Vec<String>,
    pub status: FlowStatus,
    pub last_run: Option<i64>,
    pub duration: Option<i64>,
}

/// Immutable record of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub id: String,
    pub flow_id: String,
    pub status: ResultStatus,
    pub started_at: i64,
    pub ended_at: i64,
    pub duration: i64,
    pub logs: Vec<LogLine>,
    pub screenshot_urls: Vec<String>,
    pub error_message: Option<String>,
    pub attempt_group: Option<String>,
    pub attempt: u32,
}

/// Queue-level unit of work. The queue never looks past these identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestJob {
    pub id: String,
    pub flow_id: String,
    pub user_id: String,
    pub project_id: String,
    pub attempt: u32,
    pub attempt_group: String,
    pub enqueued_at: i64,
}

/// Pushed to live observers on every lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowStatusEvent {
    pub flow_id: String,
    pub status: FlowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_id: Option<String>,
}

/// Short-lived source-hosting credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

pub const STDERR_TAG: &str = "STDERR: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One captured line. Serialized as a plain string, stderr lines carry [`STDERR_TAG`].
/// A stdout line that would read as tagged (after any leading backslashes) gains one extra
/// leading backslash, which deserialization strips again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct LogLine {
    pub stream: LogStream,
    pub text: String,
}

impl LogLine {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: LogStream::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: LogStream::Stderr,
            text: text.into(),
        }
    }
}

impl From<String> for LogLine {
    fn from(raw: String) -> Self {
        if let Some(rest) = raw.strip_prefix(STDERR_TAG) {
            return LogLine::stderr(rest);
        }
        match raw.strip_prefix('\\') {
            Some(rest) if looks_tagged(rest) => LogLine::stdout(rest),
            _ => LogLine::stdout(raw),
        }
    }
}

impl From<LogLine> for String {
    fn from(line: LogLine) -> Self {
        match line.stream {
            LogStream::Stdout if looks_tagged(&line.text) => format!("\\{}", line.text),
            LogStream::Stdout => line.text,
            LogStream::Stderr => format!("{STDERR_TAG}{}", line.text),
        }
    }
}

fn looks_tagged(text: &str) -> bool {
    text.trim_start_matches('\\').starts_with(STDERR_TAG)
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stream {
            LogStream::Stdout => f.write_str(&self.text),
            LogStream::Stderr => write!(f, "{STDERR_TAG}{}", self.text),
        }
    }
}

/// Append-only log for one run, passed down the call chain by reference.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    lines: Arc<Mutex<Vec<LogLine>>>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: LogLine) {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(line);
    }

    pub fn stdout(&self, text: impl Into<String>) {
        self.push(LogLine::stdout(text));
    }

    pub fn stderr(&self, text: impl Into<String>) {
        self.push(LogLine::stderr(text));
    }

    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logs_survive_serialization_in_order() {
        let sink = LogSink::new();
        sink.stdout("Starting unit test for flow: math");
        sink.stderr("npm WARN deprecated glob@7");
        sink.stdout("Tests: 1 passed");
        sink.stdout("STDERR: printed by the test itself");
        sink.stdout("\\STDERR: already escaped");
        let lines = sink.snapshot();

        let json = serde_json::to_string(&lines).unwrap();
        assert_eq!(
            json,
            r#"["Starting unit test for flow: math","STDERR: npm WARN deprecated glob@7","Tests: 1 passed","\\STDERR: printed by the test itself","\\\\STDERR: already escaped"]"#
        );
        let restored: Vec<LogLine> = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, lines);
        assert_eq!(restored[1].stream, LogStream::Stderr);
        assert_eq!(restored[3], LogLine::stdout("STDERR: printed by the test itself"));
    }

    #[test]
    fn category_parsing_rejects_unknown_values() {
        assert_eq!("unit".parse::<Category>().unwrap(), Category::Unit);
        let err = "SECURITY".parse::<Category>().unwrap_err();
        assert!(matches!(err, Error::UnsupportedCategory(c) if c == "SECURITY"));
    }

    #[test]
    fn access_token_is_redacted_in_debug() {
        let token = AccessToken::new("ghp_secret");
        assert_eq!(format!("{token:?}"), "AccessToken(***)");
        assert_eq!(token.expose(), "ghp_secret");
    }

    #[test]
    fn status_event_omits_absent_fields() {
        let event = FlowStatusEvent {
            flow_id: "f1".into(),
            status: FlowStatus::Running,
            last_run: Some(10),
            duration: None,
            result_id: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"flowId": "f1", "status": "RUNNING", "lastRun": 10})
        );
    }
}
