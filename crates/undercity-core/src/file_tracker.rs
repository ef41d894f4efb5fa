//! `FileTracker` — records every file operation attributable to a worker,
//! detects write-write conflicts between active workers, and (optionally)
//! surfaces higher-level semantic conflicts.
//!
//! Holds one mutex around a small map; every public method takes the lock
//! only for the duration of its own critical section and returns owned
//! snapshots, never a reference into the map (§5: "guarded by a single
//! lock held only for the duration of a small critical section").

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::ast_index::AstIndex;
use crate::model::file_tracking::{
    ConflictSeverity, ConflictingTouch, FileConflict, FileOperation, FileTouch,
    FileTrackingEntry, SemanticConflict,
};
use crate::model::task::TaskId;

/// Structured record of one tool-call the `FileTracker` can recognize. This
/// is the closed variant an `AgentRunner` converts SDK/tool-call messages
/// into at the boundary (§9 REDESIGN FLAGS: "dynamic-typed opaque tool-call
/// messages").
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileOperationEvent {
    /// A file read.
    Read { path: String },
    /// A full-file write.
    Write { path: String },
    /// A targeted edit.
    Edit { path: String },
    /// A file delete.
    Delete { path: String },
    /// A shell command; the tracker best-effort extracts paths from it.
    Shell { command: String },
}

/// Result of [`FileTracker::detect_semantic_conflicts`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SemanticConflictReport {
    /// Every detected semantic conflict.
    pub conflicts: Vec<SemanticConflict>,
    /// How many distinct files were sent to the AST index.
    pub analyzed_files: usize,
    /// How many distinct symbols were observed across those files.
    pub symbols_analyzed: usize,
}

/// Snapshot of all tracker state, suitable for persistence.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct FileTrackerState {
    /// All entries, keyed by agent id.
    pub entries: BTreeMap<String, FileTrackingEntry>,
    /// Last time this state was persisted, milliseconds since the Unix
    /// epoch. `0` if never persisted.
    #[serde(default)]
    pub last_updated: i64,
}

/// Records file operations and derives conflicts from them.
pub struct FileTracker {
    repo_root: PathBuf,
    entries: Mutex<HashMap<String, FileTrackingEntry>>,
    now_ms: fn() -> i64,
}

impl FileTracker {
    /// Create a tracker rooted at `repo_root`.
    ///
    /// `now_ms` supplies the current time in milliseconds since the Unix
    /// epoch; tests inject a deterministic clock, production code passes
    /// a wrapper around `SystemTime::now()`.
    #[must_use]
    pub fn new(repo_root: impl Into<PathBuf>, now_ms: fn() -> i64) -> Self {
        Self {
            repo_root: repo_root.into(),
            entries: Mutex::new(HashMap::new()),
            now_ms,
        }
    }

    /// Begin tracking `agent_id`'s file operations for `task_id` within
    /// `session_id`.
    ///
    /// If an entry already exists for `agent_id`, it is overwritten and a
    /// warning is logged (the spec permits silent overwrite with a logged
    /// warning, not an error).
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn start_tracking(&self, agent_id: &str, task_id: Option<TaskId>, session_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(agent_id) {
            warn!(agent_id, "overwriting existing file-tracking entry");
        }
        entries.insert(
            agent_id.to_owned(),
            FileTrackingEntry {
                agent_id: agent_id.to_owned(),
                task_id,
                session_id: session_id.to_owned(),
                started_at: (self.now_ms)(),
                ended_at: None,
                files: Vec::new(),
            },
        );
        debug!(agent_id, session_id, "started file tracking");
    }

    /// Seal `agent_id`'s entry with an `ended_at` timestamp. No-op if the
    /// agent was never tracked.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn stop_tracking(&self, agent_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(agent_id) {
            entry.ended_at = Some((self.now_ms)());
            debug!(agent_id, "stopped file tracking");
        }
    }

    /// Normalize and record a single file access.
    ///
    /// `agent_cwd`, if given and different from the repository root,
    /// indicates the worker runs inside a workspace; `path` is resolved
    /// against it before being re-rooted. See [`normalize_path`].
    ///
    /// Logs a warning (does not error) if `agent_id` is not currently
    /// tracked.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn record_file_access(
        &self,
        agent_id: &str,
        path: &str,
        operation: FileOperation,
        agent_cwd: Option<&Path>,
    ) {
        let normalized = normalize_path(&self.repo_root, path, agent_cwd);
        let mut entries = self.entries.lock().unwrap();
        let Some(entry) = entries.get_mut(agent_id) else {
            warn!(agent_id, path = %normalized, "file access from untracked agent");
            return;
        };
        entry.files.push(FileTouch {
            path: normalized,
            operation,
            timestamp: (self.now_ms)(),
        });
    }

    /// Parse a structured tool-call event and record the file access(es)
    /// it implies.
    ///
    /// Recognizes `Read`/`Write`/`Edit`/`Delete` directly. For `Shell`
    /// events, extracts a path from `rm [-flags] PATH ...` (first
    /// non-flag argument) or from output-redirection tokens `> PATH` /
    /// `>> PATH` (first token after the redirection); if nothing is
    /// extractable, nothing is recorded.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned (via [`Self::record_file_access`]).
    pub fn record_event(
        &self,
        agent_id: &str,
        event: &FileOperationEvent,
        agent_cwd: Option<&Path>,
    ) {
        match event {
            FileOperationEvent::Read { path } => {
                self.record_file_access(agent_id, path, FileOperation::Read, agent_cwd);
            }
            FileOperationEvent::Write { path } => {
                self.record_file_access(agent_id, path, FileOperation::Write, agent_cwd);
            }
            FileOperationEvent::Edit { path } => {
                self.record_file_access(agent_id, path, FileOperation::Edit, agent_cwd);
            }
            FileOperationEvent::Delete { path } => {
                self.record_file_access(agent_id, path, FileOperation::Delete, agent_cwd);
            }
            FileOperationEvent::Shell { command } => {
                for (path, op) in parse_shell_touches(command) {
                    self.record_file_access(agent_id, &path, op, agent_cwd);
                }
            }
        }
    }

    /// Detect write-write conflicts among currently active entries.
    ///
    /// Considers only entries with `ended_at` unset. Builds `path → [entry]`
    /// for write-class operations and emits a conflict for every path
    /// touched by two or more distinct agents.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn detect_conflicts(&self, exclude_agent_id: Option<&str>) -> Vec<FileConflict> {
        let entries = self.entries.lock().unwrap();
        let mut by_path: BTreeMap<String, Vec<ConflictingTouch>> = BTreeMap::new();
        let mut agents_by_path: BTreeMap<String, HashSet<String>> = BTreeMap::new();

        for entry in entries.values() {
            if !entry.is_active() {
                continue;
            }
            if exclude_agent_id == Some(entry.agent_id.as_str()) {
                continue;
            }
            for touch in &entry.files {
                if !touch.operation.is_write_class() {
                    continue;
                }
                by_path
                    .entry(touch.path.clone())
                    .or_default()
                    .push(ConflictingTouch {
                        agent_id: entry.agent_id.clone(),
                        task_id: entry.task_id.clone(),
                        operation: touch.operation,
                        timestamp: touch.timestamp,
                    });
                agents_by_path
                    .entry(touch.path.clone())
                    .or_default()
                    .insert(entry.agent_id.clone());
            }
        }

        let conflicts: Vec<FileConflict> = by_path
            .into_iter()
            .filter(|(path, _)| agents_by_path.get(path).is_some_and(|a| a.len() >= 2))
            .map(|(path, touched_by)| FileConflict { path, touched_by })
            .collect();

        for conflict in &conflicts {
            warn!(path = %conflict.path, agents = conflict.touched_by.len(), "file conflict detected");
        }
        conflicts
    }

    /// Predict which active agents would conflict with a hypothetical new
    /// worker touching `paths`, without recording anything.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn would_conflict(
        &self,
        paths: &[String],
        exclude_agent_id: Option<&str>,
    ) -> BTreeMap<String, Vec<String>> {
        let entries = self.entries.lock().unwrap();
        let mut result: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let path_set: HashSet<&str> = paths.iter().map(String::as_str).collect();

        for entry in entries.values() {
            if !entry.is_active() || exclude_agent_id == Some(entry.agent_id.as_str()) {
                continue;
            }
            for touch in &entry.files {
                if touch.operation.is_write_class() && path_set.contains(touch.path.as_str()) {
                    result
                        .entry(touch.path.clone())
                        .or_default()
                        .push(entry.agent_id.clone());
                }
            }
        }
        for agents in result.values_mut() {
            agents.sort();
            agents.dedup();
        }
        result
    }

    /// Detect semantic conflicts: two or more active agents touching files
    /// that export a common symbol, per an external [`AstIndex`].
    ///
    /// If the index reports no symbols for anything touched, returns an
    /// empty, well-formed report rather than erroring.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn detect_semantic_conflicts(&self, index: &dyn AstIndex) -> SemanticConflictReport {
        let entries = self.entries.lock().unwrap();

        // symbol (name, kind) -> (agent_id -> files)
        let mut by_symbol: BTreeMap<(String, &'static str), BTreeMap<String, HashSet<String>>> =
            BTreeMap::new();
        let mut analyzed_files: HashSet<String> = HashSet::new();

        for entry in entries.values() {
            if !entry.is_active() {
                continue;
            }
            let mut touched_paths: HashSet<&str> = HashSet::new();
            for touch in &entry.files {
                if touch.operation.is_write_class() {
                    touched_paths.insert(touch.path.as_str());
                }
            }
            for path in touched_paths {
                analyzed_files.insert(path.to_owned());
                for symbol in index.exported_symbols(path) {
                    let kind_tag = symbol_kind_tag(symbol.kind);
                    by_symbol
                        .entry((symbol.name.clone(), kind_tag))
                        .or_default()
                        .entry(entry.agent_id.clone())
                        .or_default()
                        .insert(path.to_owned());
                }
            }
        }

        let mut conflicts = Vec::new();
        for ((name, kind_tag), agents) in &by_symbol {
            if agents.len() < 2 {
                continue;
            }
            let mut files: Vec<String> = agents.values().flatten().cloned().collect();
            files.sort();
            files.dedup();
            let mut touched_by: Vec<String> = agents.keys().cloned().collect();
            touched_by.sort();
            conflicts.push(SemanticConflict {
                symbol_name: name.clone(),
                symbol_kind: symbol_kind_from_tag(kind_tag),
                files,
                severity: ConflictSeverity::for_agent_count(touched_by.len()),
                touched_by,
            });
        }

        let symbols_analyzed = by_symbol.len();
        SemanticConflictReport {
            conflicts,
            analyzed_files: analyzed_files.len(),
            symbols_analyzed,
        }
    }

    /// Remove every entry belonging to `session_id`.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn clear_session(&self, session_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, e| e.session_id != session_id);
    }

    /// Remove every sealed (non-active) entry.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn clear_completed(&self) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(FileTrackingEntry::is_active);
    }

    /// Remove every entry whose `task_id` is not in `active_task_ids`.
    /// Entries with no `task_id` are retained (they're not attributable to
    /// a stale task).
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn clear_inactive_tasks(&self, active_task_ids: &HashSet<TaskId>) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, e| match &e.task_id {
            Some(id) => active_task_ids.contains(id),
            None => true,
        });
    }

    /// Snapshot all state for persistence.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    #[must_use]
    pub fn get_state(&self) -> FileTrackerState {
        let entries = self.entries.lock().unwrap();
        FileTrackerState {
            entries: entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            last_updated: (self.now_ms)(),
        }
    }

    /// Restore tracker state from a previously persisted snapshot,
    /// replacing anything currently held.
    ///
    /// # Panics
    /// Panics if the internal mutex is poisoned.
    pub fn restore_state(&self, state: FileTrackerState) {
        let mut entries = self.entries.lock().unwrap();
        *entries = state.entries.into_iter().collect();
    }
}

fn symbol_kind_tag(kind: crate::model::file_tracking::SymbolKind) -> &'static str {
    use crate::model::file_tracking::SymbolKind as K;
    match kind {
        K::Function => "function",
        K::Class => "class",
        K::Interface => "interface",
        K::Type => "type",
        K::Const => "const",
        K::Enum => "enum",
    }
}

fn symbol_kind_from_tag(tag: &str) -> crate::model::file_tracking::SymbolKind {
    use crate::model::file_tracking::SymbolKind as K;
    match tag {
        "function" => K::Function,
        "class" => K::Class,
        "interface" => K::Interface,
        "type" => K::Type,
        "const" => K::Const,
        _ => K::Enum,
    }
}

/// Normalize a recorded path relative to the repository root.
///
/// 1. If `path` is absolute, relativize it against `repo_root`.
/// 2. Else if `agent_cwd` is set and differs from `repo_root`, resolve
///    `path` against `agent_cwd` first, then relativize against
///    `repo_root`.
/// 3. Else return `path` unchanged.
///
/// No path is allowed to silently escape the repository root: an escaping
/// path is returned as-is (prefixed so it is visibly outside the tree) and
/// flagged via a `tracing::warn!`.
#[must_use]
pub fn normalize_path(repo_root: &Path, path: &str, agent_cwd: Option<&Path>) -> String {
    let raw = Path::new(path);

    let candidate: PathBuf = if raw.is_absolute() {
        raw.to_path_buf()
    } else if let Some(cwd) = agent_cwd.filter(|c| *c != repo_root) {
        cwd.join(raw)
    } else {
        return path.to_owned();
    };

    match relativize(&candidate, repo_root) {
        Some(rel) => rel,
        None => {
            warn!(path, "recorded path escapes repository root");
            candidate.to_string_lossy().into_owned()
        }
    }
}

fn relativize(candidate: &Path, root: &Path) -> Option<String> {
    let normalized = lexically_normalize(candidate);
    let normalized_root = lexically_normalize(root);
    normalized
        .strip_prefix(&normalized_root)
        .ok()
        .map(|rel| rel.to_string_lossy().replace('\\', "/"))
}

/// Purely lexical `.`/`..` collapsing (no filesystem access — paths may not
/// exist yet, e.g. a file about to be created).
fn lexically_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Extract candidate file paths from a shell command string.
///
/// Recognizes `rm [-flags] PATH ...` (first non-flag argument) and output
/// redirection tokens `> PATH` / `>> PATH` (first token after the
/// redirection). Best-effort: unrecognized commands yield no touches.
fn parse_shell_touches(command: &str) -> Vec<(String, FileOperation)> {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    let mut touches = Vec::new();

    if let Some(&first) = tokens.first() {
        if first == "rm" || first.ends_with("/rm") {
            if let Some(path) = tokens[1..].iter().find(|t| !t.starts_with('-')) {
                touches.push(((*path).to_owned(), FileOperation::Delete));
            }
        }
    }

    for (i, &tok) in tokens.iter().enumerate() {
        if (tok == ">" || tok == ">>") && i + 1 < tokens.len() {
            touches.push((tokens[i + 1].to_owned(), FileOperation::Write));
        }
    }

    touches
}
