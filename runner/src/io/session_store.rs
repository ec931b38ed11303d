//! File-per-session persistence under `.runner/sessions/`.
//!
//! Each session is one pretty-printed JSON file named `<id>.json`, written
//! atomically (temp file + rename). Archives group sessions by creation year in
//! `<archive_dir>/sessions-<year>.json`.
//!
//! The store does no locking. Callers must serialize writes to one session id.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Datelike, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::error::SubagentError;
use crate::core::types::{
    BackendKind, ExecutionRequest, ExecutionStatistics, ExecutionStatus, MaxIterations,
    SubagentKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

impl From<ExecutionStatus> for SessionStatus {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Pending | ExecutionStatus::Running | ExecutionStatus::RateLimited => {
                SessionStatus::Running
            }
            ExecutionStatus::Completed => SessionStatus::Completed,
            ExecutionStatus::Cancelled => SessionStatus::Cancelled,
            ExecutionStatus::Failed | ExecutionStatus::Timeout => SessionStatus::Failed,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

impl FromStr for SessionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "running" => Ok(SessionStatus::Running),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "cancelled" | "canceled" => Ok(SessionStatus::Cancelled),
            other => Err(anyhow!("unknown session status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub status: SessionStatus,
    pub subagent: SubagentKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub working_directory: PathBuf,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Snapshot of what the session was asked to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub instruction: String,
    pub max_iterations: MaxIterations,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub backend: BackendKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Iteration,
    Error,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: HistoryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

impl HistoryEntry {
    pub fn new(kind: HistoryKind, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            iteration: None,
            content: content.into(),
            duration_ms: None,
            metadata: Value::Null,
        }
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Terminal outcome recorded on completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResult {
    pub status: ExecutionStatus,
    pub iterations: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SubagentError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub info: SessionInfo,
    pub context: SessionContext,
    #[serde(default)]
    pub statistics: ExecutionStatistics,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SessionResult>,
}

impl Session {
    /// No history and no result.
    pub fn is_empty(&self) -> bool {
        self.history.is_empty() && self.result.is_none()
    }
}

/// Input for [`SessionStore::create_session`].
#[derive(Debug, Clone)]
pub struct NewSession {
    pub name: Option<String>,
    pub instruction: String,
    pub subagent: SubagentKind,
    pub working_directory: PathBuf,
    pub max_iterations: MaxIterations,
    pub model: Option<String>,
    pub backend: BackendKind,
    pub request_id: Option<String>,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

impl NewSession {
    pub fn from_request(request: &ExecutionRequest, backend: BackendKind) -> Self {
        Self {
            name: None,
            instruction: request.instruction.clone(),
            subagent: request.subagent.clone(),
            working_directory: request.working_directory.clone(),
            max_iterations: request.max_iterations,
            model: request.model.clone(),
            backend,
            request_id: Some(request.request_id.clone()),
            tags: Vec::new(),
            metadata: request.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortField {
    #[default]
    Created,
    Updated,
    Name,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// All configured criteria must match.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub statuses: Vec<SessionStatus>,
    pub subagent: Option<SubagentKind>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
}

impl SessionFilter {
    pub fn matches(&self, info: &SessionInfo) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&info.status))
            && self.subagent.as_ref().is_none_or(|s| *s == info.subagent)
            && self.created_after.is_none_or(|t| info.created_at >= t)
            && self.created_before.is_none_or(|t| info.created_at <= t)
            && self.tags.iter().all(|tag| info.tags.contains(tag))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub filter: SessionFilter,
    pub sort_by: SortField,
    pub order: SortOrder,
    pub offset: usize,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    /// Only sessions created more than this many days ago.
    pub older_than_days: Option<u32>,
    /// Only these statuses. Empty means every terminal status.
    pub statuses: Vec<SessionStatus>,
    /// Keep statistics, history, and result in the archive entry.
    pub include_data: bool,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            older_than_days: None,
            statuses: Vec::new(),
            include_data: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveReport {
    pub archived: Vec<String>,
    pub archive_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupOptions {
    pub older_than_days: Option<u32>,
    pub statuses: Vec<SessionStatus>,
    /// Only sessions with no history and no result.
    pub empty_only: bool,
    pub dry_run: bool,
}

impl CleanupOptions {
    fn has_criteria(&self) -> bool {
        self.older_than_days.is_some() || !self.statuses.is_empty() || self.empty_only
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<String>,
    pub dry_run: bool,
}

/// One session inside a yearly archive file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedSession {
    pub info: SessionInfo,
    pub context: SessionContext,
    pub archived_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<ExecutionStatistics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<HistoryEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SessionResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveFile {
    pub year: i32,
    pub sessions: Vec<ArchivedSession>,
}

/// Sortable, timestamp-based session id: `YYYYMMDDTHHMMSSmmmZ-<8 hex>`.
pub fn new_session_id(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.format("%Y%m%dT%H%M%S%3fZ"), &suffix[..8])
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions_dir: PathBuf,
    archive_dir: PathBuf,
}

impl SessionStore {
    pub fn new(sessions_dir: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
            archive_dir: archive_dir.into(),
        }
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// File for session `id`. Ids that could escape the sessions directory are rejected.
    pub fn session_path(&self, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty()
            && id != "."
            && !id.contains("..")
            && !id.contains(['/', '\\', '\0'])
            && Path::new(id).components().count() == 1;
        if !valid {
            return Err(anyhow!("invalid session id {id:?}"));
        }
        Ok(self.sessions_dir.join(format!("{id}.json")))
    }

    pub fn archive_path(&self, year: i32) -> PathBuf {
        self.archive_dir.join(format!("sessions-{year}.json"))
    }

    /// Create and persist a running session.
    #[instrument(skip_all, fields(subagent = %input.subagent))]
    pub fn create_session(&self, input: NewSession) -> Result<Session> {
        let now = Utc::now();
        let id = new_session_id(now);
        let name = input
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| default_name(&input.instruction));
        let session = Session {
            info: SessionInfo {
                id: id.clone(),
                name,
                status: SessionStatus::Running,
                subagent: input.subagent,
                created_at: now,
                updated_at: now,
                completed_at: None,
                working_directory: input.working_directory,
                tags: input.tags,
                metadata: input.metadata,
            },
            context: SessionContext {
                instruction: input.instruction,
                max_iterations: input.max_iterations,
                model: input.model,
                backend: input.backend,
                request_id: input.request_id,
            },
            statistics: ExecutionStatistics::default(),
            history: Vec::new(),
            result: None,
        };
        self.save_session(&session)?;
        info!(session_id = %id, "session created");
        Ok(session)
    }

    /// Write the whole session, replacing any previous file.
    pub fn save_session(&self, session: &Session) -> Result<()> {
        let path = self.session_path(&session.info.id)?;
        debug!(path = %path.display(), status = %session.info.status, "writing session");
        write_json_atomic(&path, session)
    }

    /// Load a session; `None` when no file exists.
    pub fn load_session(&self, id: &str) -> Result<Option<Session>> {
        let path = self.session_path(id)?;
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read session {}", path.display()))?;
        let session = serde_json::from_str(&contents)
            .with_context(|| format!("parse session {}", path.display()))?;
        Ok(Some(session))
    }

    /// Load, apply `update`, bump `updated_at`, and save.
    pub fn update_session<F>(&self, id: &str, update: F) -> Result<Session>
    where
        F: FnOnce(&mut Session),
    {
        let mut session = self
            .load_session(id)?
            .ok_or_else(|| anyhow!("session {id} not found"))?;
        update(&mut session);
        session.info.updated_at = Utc::now();
        self.save_session(&session)?;
        Ok(session)
    }

    pub fn add_history_entry(&self, id: &str, entry: HistoryEntry) -> Result<()> {
        self.update_session(id, |session| session.history.push(entry))?;
        Ok(())
    }

    pub fn update_statistics(&self, id: &str, statistics: &ExecutionStatistics) -> Result<()> {
        self.update_session(id, |session| session.statistics = statistics.clone())?;
        Ok(())
    }

    /// Record the terminal status and result.
    #[instrument(skip(self, result), fields(session_id = %id))]
    pub fn complete_session(
        &self,
        id: &str,
        status: SessionStatus,
        result: SessionResult,
    ) -> Result<Session> {
        let session = self.update_session(id, |session| {
            session.info.status = status;
            session.info.completed_at = Some(Utc::now());
            session.result = Some(result);
        })?;
        info!(status = %status, "session completed");
        Ok(session)
    }

    /// Filter, sort, and page the stored sessions. Unreadable files are skipped.
    pub fn list_sessions(&self, options: &ListOptions) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .read_all()?
            .into_iter()
            .filter(|s| options.filter.matches(&s.info))
            .collect();
        sessions.sort_by(|a, b| {
            let ordering = match options.sort_by {
                SortField::Created => a.info.created_at.cmp(&b.info.created_at),
                SortField::Updated => a.info.updated_at.cmp(&b.info.updated_at),
                SortField::Name => a.info.name.cmp(&b.info.name),
            }
            .then_with(|| a.info.id.cmp(&b.info.id));
            match options.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });
        let page = sessions
            .into_iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(page)
    }

    /// Delete a session file. Returns whether a file was removed.
    pub fn remove_session(&self, id: &str) -> Result<bool> {
        let path = self.session_path(id)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(session_id = id, "session removed");
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("remove session {}", path.display())),
        }
    }

    /// Move matching sessions into yearly archive files.
    ///
    /// Re-archiving a session id replaces its existing archive entry.
    #[instrument(skip_all, fields(include_data = options.include_data))]
    pub fn archive_sessions(&self, options: &ArchiveOptions) -> Result<ArchiveReport> {
        let now = Utc::now();
        let mut by_year: BTreeMap<i32, Vec<Session>> = BTreeMap::new();
        for session in self.read_all()? {
            let status_ok = if options.statuses.is_empty() {
                session.info.status.is_terminal()
            } else {
                options.statuses.contains(&session.info.status)
            };
            if status_ok && older_than(&session.info, options.older_than_days, now) {
                by_year
                    .entry(session.info.created_at.year())
                    .or_default()
                    .push(session);
            }
        }

        let mut report = ArchiveReport::default();
        for (year, sessions) in by_year {
            let path = self.archive_path(year);
            let mut archive = self.load_archive(year)?.unwrap_or(ArchiveFile {
                year,
                sessions: Vec::new(),
            });
            for session in &sessions {
                let entry = archived(session, options.include_data, now);
                match archive
                    .sessions
                    .iter_mut()
                    .find(|existing| existing.info.id == entry.info.id)
                {
                    Some(existing) => *existing = entry,
                    None => archive.sessions.push(entry),
                }
            }
            write_json_atomic(&path, &archive)?;
            for session in sessions {
                self.remove_session(&session.info.id)?;
                report.archived.push(session.info.id);
            }
            report.archive_files.push(path);
        }
        info!(archived = report.archived.len(), "sessions archived");
        Ok(report)
    }

    pub fn load_archive(&self, year: i32) -> Result<Option<ArchiveFile>> {
        let path = self.archive_path(year);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read archive {}", path.display()))?;
        let archive = serde_json::from_str(&contents)
            .with_context(|| format!("parse archive {}", path.display()))?;
        Ok(Some(archive))
    }

    /// Delete sessions matching every configured criterion.
    ///
    /// At least one criterion is required.
    #[instrument(skip_all, fields(dry_run = options.dry_run))]
    pub fn cleanup(&self, options: &CleanupOptions) -> Result<CleanupReport> {
        if !options.has_criteria() {
            return Err(anyhow!(
                "cleanup needs at least one criterion (age, status, or empty)"
            ));
        }
        let now = Utc::now();
        let mut report = CleanupReport {
            removed: Vec::new(),
            dry_run: options.dry_run,
        };
        for session in self.read_all()? {
            let matches = older_than(&session.info, options.older_than_days, now)
                && (options.statuses.is_empty() || options.statuses.contains(&session.info.status))
                && (!options.empty_only || session.is_empty());
            if !matches {
                continue;
            }
            if !options.dry_run {
                self.remove_session(&session.info.id)?;
            }
            report.removed.push(session.info.id);
        }
        info!(removed = report.removed.len(), dry_run = options.dry_run, "session cleanup finished");
        Ok(report)
    }

    fn read_all(&self) -> Result<Vec<Session>> {
        if !self.sessions_dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.sessions_dir)
            .with_context(|| format!("read directory {}", self.sessions_dir.display()))?;
        let mut sessions = Vec::new();
        for entry in entries {
            let path = entry
                .with_context(|| format!("read entry in {}", self.sessions_dir.display()))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_session_file(&path) {
                Ok(session) => sessions.push(session),
                Err(err) => warn!(path = %path.display(), err = %format!("{err:#}"), "skipping unreadable session"),
            }
        }
        Ok(sessions)
    }
}

fn read_session_file(path: &Path) -> Result<Session> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read session {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse session {}", path.display()))
}

fn older_than(info: &SessionInfo, days: Option<u32>, now: DateTime<Utc>) -> bool {
    match days {
        Some(days) => TimeDelta::try_days(i64::from(days))
            .and_then(|age| now.checked_sub_signed(age))
            .is_some_and(|cutoff| info.created_at <= cutoff),
        None => true,
    }
}

fn archived(session: &Session, include_data: bool, now: DateTime<Utc>) -> ArchivedSession {
    ArchivedSession {
        info: session.info.clone(),
        context: session.context.clone(),
        archived_at: now,
        statistics: include_data.then(|| session.statistics.clone()),
        history: include_data.then(|| session.history.clone()),
        result: if include_data {
            session.result.clone()
        } else {
            None
        },
    }
}

fn default_name(instruction: &str) -> String {
    let first_line = instruction.lines().next().unwrap_or("").trim();
    let mut name: String = first_line.chars().take(60).collect();
    if first_line.chars().count() > 60 {
        name.push_str("...");
    }
    if name.is_empty() {
        "session".to_string()
    } else {
        name
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(root: &Path) -> SessionStore {
        SessionStore::new(root.join("sessions"), root.join("archive"))
    }

    fn input(instruction: &str) -> NewSession {
        NewSession {
            name: None,
            instruction: instruction.to_string(),
            subagent: SubagentKind::Claude,
            working_directory: PathBuf::from("/work"),
            max_iterations: MaxIterations::Limited(2),
            model: None,
            backend: BackendKind::Shell,
            request_id: None,
            tags: vec!["nightly".to_string()],
            metadata: BTreeMap::new(),
        }
    }

    fn backdate(store: &SessionStore, id: &str, created_at: DateTime<Utc>) {
        let mut session = store.load_session(id).unwrap().unwrap();
        session.info.created_at = created_at;
        store.save_session(&session).unwrap();
    }

    #[test]
    fn session_id_format_is_sortable() {
        let now = DateTime::parse_from_rfc3339("2025-03-04T05:06:07.089Z")
            .unwrap()
            .with_timezone(&Utc);
        let id = new_session_id(now);
        assert!(id.starts_with("20250304T050607089Z-"), "{id}");
        assert_eq!(id.len(), "20250304T050607089Z-".len() + 8);
    }

    #[test]
    fn create_load_update_complete() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let session = store.create_session(input("say hi")).expect("create");
        assert_eq!(session.info.status, SessionStatus::Running);
        assert_eq!(session.info.name, "say hi");

        store
            .add_history_entry(
                &session.info.id,
                HistoryEntry::new(HistoryKind::Iteration, "hello").with_iteration(1),
            )
            .expect("history");
        let completed = store
            .complete_session(
                &session.info.id,
                SessionStatus::Completed,
                SessionResult {
                    status: ExecutionStatus::Completed,
                    iterations: 1,
                    duration_ms: 10,
                    summary: Some("hello".to_string()),
                    error: None,
                },
            )
            .expect("complete");
        assert!(completed.info.completed_at.is_some());
        assert!(completed.info.updated_at >= session.info.updated_at);

        let loaded = store.load_session(&session.info.id).expect("load").expect("exists");
        assert_eq!(loaded, completed);
        assert_eq!(loaded.history.len(), 1);
    }

    #[test]
    fn load_missing_is_none_and_update_missing_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        assert!(store.load_session("nope").expect("load").is_none());
        assert!(store.update_session("nope", |_| {}).is_err());
    }

    #[test]
    fn remove_is_idempotent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let session = store.create_session(input("x")).expect("create");
        assert!(store.remove_session(&session.info.id).expect("remove"));
        assert!(!store.remove_session(&session.info.id).expect("remove again"));
    }

    #[test]
    fn list_filters_sorts_pages_and_skips_corrupt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let a = store.create_session(input("alpha")).expect("a");
        let b = store.create_session(input("bravo")).expect("b");
        let mut c_input = input("charlie");
        c_input.tags = Vec::new();
        let c = store.create_session(c_input).expect("c");
        store
            .update_session(&b.info.id, |s| s.info.status = SessionStatus::Failed)
            .expect("update");
        fs::write(store.sessions_dir().join("broken.json"), "{not json").expect("corrupt");

        let all = store.list_sessions(&ListOptions::default()).expect("list");
        assert_eq!(all.len(), 3);

        let by_name = store
            .list_sessions(&ListOptions {
                sort_by: SortField::Name,
                order: SortOrder::Asc,
                ..ListOptions::default()
            })
            .expect("list");
        let names: Vec<_> = by_name.iter().map(|s| s.info.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "bravo", "charlie"]);

        let tagged_running = store
            .list_sessions(&ListOptions {
                filter: SessionFilter {
                    statuses: vec![SessionStatus::Running],
                    tags: vec!["nightly".to_string()],
                    ..SessionFilter::default()
                },
                ..ListOptions::default()
            })
            .expect("list");
        assert_eq!(tagged_running.len(), 1);
        assert_eq!(tagged_running[0].info.id, a.info.id);

        let page = store
            .list_sessions(&ListOptions {
                sort_by: SortField::Name,
                order: SortOrder::Asc,
                offset: 1,
                limit: Some(1),
                ..ListOptions::default()
            })
            .expect("list");
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].info.id, b.info.id);
        assert_ne!(page[0].info.id, c.info.id);
    }

    #[test]
    fn archive_without_data_keeps_info_and_context() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let session = store.create_session(input("archive me")).expect("create");
        let id = session.info.id.clone();
        store
            .add_history_entry(&id, HistoryEntry::new(HistoryKind::System, "note"))
            .expect("history");
        store
            .update_session(&id, |s| s.info.status = SessionStatus::Completed)
            .expect("update");

        let report = store
            .archive_sessions(&ArchiveOptions {
                include_data: false,
                ..ArchiveOptions::default()
            })
            .expect("archive");
        assert_eq!(report.archived, vec![id.clone()]);
        assert!(store.load_session(&id).expect("load").is_none());

        let year = session.info.created_at.year();
        let archive = store.load_archive(year).expect("archive").expect("exists");
        assert_eq!(archive.sessions.len(), 1);
        let entry = &archive.sessions[0];
        assert_eq!(entry.info.id, id);
        assert_eq!(entry.context.instruction, "archive me");
        assert!(entry.history.is_none());
        assert!(entry.statistics.is_none());
        assert!(entry.result.is_none());
    }

    #[test]
    fn archiving_same_id_twice_replaces_entry() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let mut session = store.create_session(input("twice")).expect("create");
        session.info.status = SessionStatus::Failed;
        store.save_session(&session).expect("save");
        store.archive_sessions(&ArchiveOptions::default()).expect("archive 1");

        session.info.name = "renamed".to_string();
        store.save_session(&session).expect("restore");
        store.archive_sessions(&ArchiveOptions::default()).expect("archive 2");

        let archive = store
            .load_archive(session.info.created_at.year())
            .expect("archive")
            .expect("exists");
        assert_eq!(archive.sessions.len(), 1);
        assert_eq!(archive.sessions[0].info.name, "renamed");
    }

    #[test]
    fn archive_skips_running_and_young_sessions() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let running = store.create_session(input("running")).expect("create");
        let done = store.create_session(input("done")).expect("create");
        store
            .update_session(&done.info.id, |s| s.info.status = SessionStatus::Completed)
            .expect("update");

        let report = store
            .archive_sessions(&ArchiveOptions {
                older_than_days: Some(30),
                ..ArchiveOptions::default()
            })
            .expect("archive");
        assert!(report.archived.is_empty());

        backdate(&store, &done.info.id, Utc::now() - chrono::Duration::days(40));
        let report = store
            .archive_sessions(&ArchiveOptions {
                older_than_days: Some(30),
                ..ArchiveOptions::default()
            })
            .expect("archive");
        assert_eq!(report.archived, vec![done.info.id.clone()]);
        assert!(store.load_session(&running.info.id).expect("load").is_some());
    }

    #[test]
    fn cleanup_requires_all_criteria_and_honours_dry_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let empty_old = store.create_session(input("empty old")).expect("create");
        let full_old = store.create_session(input("full old")).expect("create");
        let empty_new = store.create_session(input("empty new")).expect("create");
        store
            .add_history_entry(&full_old.info.id, HistoryEntry::new(HistoryKind::Iteration, "x"))
            .expect("history");
        let old = Utc::now() - chrono::Duration::days(10);
        backdate(&store, &empty_old.info.id, old);
        backdate(&store, &full_old.info.id, old);

        let options = CleanupOptions {
            older_than_days: Some(7),
            empty_only: true,
            dry_run: true,
            ..CleanupOptions::default()
        };
        let report = store.cleanup(&options).expect("dry run");
        assert_eq!(report.removed, vec![empty_old.info.id.clone()]);
        assert!(store.load_session(&empty_old.info.id).expect("load").is_some());

        let report = store
            .cleanup(&CleanupOptions {
                dry_run: false,
                ..options
            })
            .expect("cleanup");
        assert_eq!(report.removed, vec![empty_old.info.id.clone()]);
        assert!(store.load_session(&empty_old.info.id).expect("load").is_none());
        assert!(store.load_session(&full_old.info.id).expect("load").is_some());
        assert!(store.load_session(&empty_new.info.id).expect("load").is_some());

        assert!(store.cleanup(&CleanupOptions::default()).is_err());
    }

    #[test]
    fn ids_that_escape_the_store_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(&temp.path().join("project"));
        fs::write(temp.path().join("secret.json"), "{}").expect("write");

        for id in ["../../secret", "../secret", "a/b", "a\\b", "..", "", "."] {
            assert!(store.load_session(id).is_err(), "{id:?} accepted");
            assert!(store.remove_session(id).is_err(), "{id:?} accepted");
        }
        assert!(temp.path().join("secret.json").exists());
        assert!(store.load_session("20250101T000000000Z-deadbeef").expect("load").is_none());
    }

    #[test]
    fn huge_age_threshold_matches_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let session = store.create_session(input("keep me")).expect("create");

        let report = store
            .cleanup(&CleanupOptions {
                older_than_days: Some(u32::MAX),
                ..CleanupOptions::default()
            })
            .expect("cleanup");
        assert!(report.removed.is_empty());
        assert!(store.load_session(&session.info.id).expect("load").is_some());
    }
}
