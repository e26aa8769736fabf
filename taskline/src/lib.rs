//! Task-line metadata parsing and parent completion propagation for Markdown outlines.
//! The parser and the outline queries are pure functions over borrowed text; the
//! interceptor turns their answers into an amended edit transaction and never touches
//! the document itself.

pub mod core {
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};
    use std::fmt;

    /* ------------------------------- IDs ------------------------------- */

    /// Identifier derived from file path and line number. Only stable while the line
    /// number is unchanged.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct TaskId(pub String);

    impl TaskId {
        pub fn new(file_path: &str, line: usize) -> Self {
            Self(format!("{file_path}-L{line}"))
        }
    }

    impl fmt::Display for TaskId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    /* ---------------------------- Value Objects ---------------------------- */

    /// A `#tag` token, kept with its leading `#`.
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct Tag(pub String);

    impl From<&str> for Tag {
        fn from(s: &str) -> Self {
            Self(s.to_string())
        }
    }

    /// Metadata notation tried first for every field. The other notation is always
    /// tried as a fallback, so a line may mix both.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Dialect {
        /// Inline glyphs: `📅 2025-01-31`, `🔺`, `🔁 every week`, `#project/x`, `@home`.
        #[default]
        Symbols,
        /// Bracketed key-value fields: `[due:: 2025-01-31]`, `[priority:: high]`.
        Fields,
    }

    impl Dialect {
        pub fn other(self) -> Self {
            match self {
                Dialect::Symbols => Dialect::Fields,
                Dialect::Fields => Dialect::Symbols,
            }
        }

        /// Both notations, preferred one first.
        pub fn preference(self) -> [Dialect; 2] {
            [self, self.other()]
        }
    }

    pub fn is_complete_status(status: char) -> bool {
        matches!(status, 'x' | 'X')
    }

    /* ------------------------------ Entity ------------------------------ */

    /// One parsed task line.
    ///
    /// Consumers treat a `Task` as immutable: an edit produces a new value, and
    /// [`Task::changed_fields`] tells a view what to redraw.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Task {
        pub id: TaskId,
        pub file_path: String,
        /// 1-based line number.
        pub line: usize,

        /// Description with every extracted metadata token removed.
        pub content: String,
        /// Checkbox character, e.g. `' '`, `'x'`, `'/'`.
        pub status: char,
        pub completed: bool,
        /// The untouched source line.
        pub original_markdown: String,

        pub start_date: Option<NaiveDate>,
        pub due_date: Option<NaiveDate>,
        pub scheduled_date: Option<NaiveDate>,
        pub completed_date: Option<NaiveDate>,
        pub created_date: Option<NaiveDate>,

        /// 1 (lowest) ..= 5 (highest).
        pub priority: Option<u8>,
        pub recurrence: Option<String>,
        /// Slash-delimited project path, e.g. `work/q1`.
        pub project: Option<String>,
        pub context: Option<String>,

        /// Source order, duplicates kept.
        #[serde(default)]
        pub tags: Vec<Tag>,
    }

    impl Task {
        pub fn new(file_path: &str, line: usize, status: char, original_markdown: &str) -> Self {
            Self {
                id: TaskId::new(file_path, line),
                file_path: file_path.to_string(),
                line,
                content: String::new(),
                status,
                completed: is_complete_status(status),
                original_markdown: original_markdown.to_string(),
                start_date: None,
                due_date: None,
                scheduled_date: None,
                completed_date: None,
                created_date: None,
                priority: None,
                recurrence: None,
                project: None,
                context: None,
                tags: vec![],
            }
        }

        /// Fields that differ between `self` and a re-parsed `newer` value.
        pub fn changed_fields(&self, newer: &Task) -> Vec<TaskField> {
            let mut out = Vec::new();
            if self.id != newer.id || self.file_path != newer.file_path || self.line != newer.line {
                out.push(TaskField::Position);
            }
            if self.original_markdown != newer.original_markdown {
                out.push(TaskField::Markdown);
            }
            if self.content != newer.content {
                out.push(TaskField::Content);
            }
            if self.status != newer.status {
                out.push(TaskField::Status);
            }
            let dates = [
                (self.start_date, newer.start_date, TaskField::StartDate),
                (self.due_date, newer.due_date, TaskField::DueDate),
                (self.scheduled_date, newer.scheduled_date, TaskField::ScheduledDate),
                (self.completed_date, newer.completed_date, TaskField::CompletedDate),
                (self.created_date, newer.created_date, TaskField::CreatedDate),
            ];
            for (old, new, field) in dates {
                if old != new {
                    out.push(field);
                }
            }
            if self.priority != newer.priority {
                out.push(TaskField::Priority);
            }
            if self.recurrence != newer.recurrence {
                out.push(TaskField::Recurrence);
            }
            if self.project != newer.project {
                out.push(TaskField::Project);
            }
            if self.context != newer.context {
                out.push(TaskField::Context);
            }
            if self.tags != newer.tags {
                out.push(TaskField::Tags);
            }
            out
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum TaskField {
        Position,
        Markdown,
        Content,
        Status,
        StartDate,
        DueDate,
        ScheduledDate,
        CompletedDate,
        CreatedDate,
        Priority,
        Recurrence,
        Project,
        Context,
        Tags,
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn task_id_combines_path_and_line() {
            let task = Task::new("notes/today.md", 7, ' ', "- [ ] a");
            assert_eq!(task.id.to_string(), "notes/today.md-L7");
            assert!(!task.completed);
            assert!(Task::new("a.md", 1, 'X', "- [X] a").completed);
        }

        #[test]
        fn changed_fields_reports_only_differences() {
            let old = Task::new("a.md", 3, ' ', "- [ ] a");
            let mut new = old.clone();
            new.status = 'x';
            new.completed = true;
            new.tags.push(Tag::from("#done"));
            assert_eq!(
                old.changed_fields(&new),
                vec![TaskField::Status, TaskField::Tags]
            );
            assert!(old.changed_fields(&old.clone()).is_empty());
        }

        #[test]
        fn dialect_preference_puts_chosen_notation_first() {
            assert_eq!(
                Dialect::Fields.preference(),
                [Dialect::Fields, Dialect::Symbols]
            );
            assert_eq!(Dialect::default(), Dialect::Symbols);
        }
    }
}

pub mod buffer {
    //! Immutable, line-indexed snapshot of a document. Offsets are byte offsets into the
    //! UTF-8 text; line numbers are 1-based.

    /// One line of a [`LineBuffer`]. `from..to` covers the text without its newline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Line<'a> {
        pub number: usize,
        pub from: usize,
        pub to: usize,
        pub text: &'a str,
    }

    impl<'a> Line<'a> {
        /// The leading whitespace run.
        pub fn indent_text(&self) -> &'a str {
            let end = self
                .text
                .find(|c: char| !c.is_whitespace())
                .unwrap_or(self.text.len());
            &self.text[..end]
        }

        /// Indentation level in raw characters; tabs count as one.
        pub fn indent(&self) -> usize {
            self.indent_text().chars().count()
        }

        pub fn is_blank(&self) -> bool {
            self.text.trim().is_empty()
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct LineBuffer {
        text: String,
        starts: Vec<usize>,
    }

    impl Default for LineBuffer {
        fn default() -> Self {
            Self::new(String::new())
        }
    }

    impl LineBuffer {
        pub fn new(text: impl Into<String>) -> Self {
            let text = text.into();
            let mut starts = vec![0];
            starts.extend(text.match_indices('\n').map(|(i, _)| i + 1));
            Self { text, starts }
        }

        pub fn text(&self) -> &str {
            &self.text
        }

        pub fn len(&self) -> usize {
            self.text.len()
        }

        pub fn is_empty(&self) -> bool {
            self.text.is_empty()
        }

        pub fn line_count(&self) -> usize {
            self.starts.len()
        }

        pub fn line(&self, number: usize) -> Option<Line<'_>> {
            if number == 0 || number > self.starts.len() {
                return None;
            }
            let from = self.starts[number - 1];
            let to = self
                .starts
                .get(number)
                .map(|next| next - 1)
                .unwrap_or(self.text.len());
            Some(Line {
                number,
                from,
                to,
                text: &self.text[from..to],
            })
        }

        /// The line containing byte `offset`; the end of the document belongs to the last line.
        pub fn line_at(&self, offset: usize) -> Option<Line<'_>> {
            if offset > self.text.len() {
                return None;
            }
            let idx = match self.starts.binary_search(&offset) {
                Ok(i) => i,
                Err(i) => i - 1,
            };
            self.line(idx + 1)
        }

        pub fn lines(&self) -> impl Iterator<Item = Line<'_>> {
            (1..=self.line_count()).filter_map(move |n| self.line(n))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn lines_and_offsets() {
            let buf = LineBuffer::new("- [ ] a\n  - [x] b\n");
            assert_eq!(buf.line_count(), 3);
            let second = buf.line(2).expect("line 2");
            assert_eq!(second.text, "  - [x] b");
            assert_eq!((second.from, second.to), (8, 17));
            assert_eq!(buf.line(3).expect("trailing line").text, "");
            assert!(buf.line(0).is_none());
            assert!(buf.line(4).is_none());

            assert_eq!(buf.line_at(0).map(|l| l.number), Some(1));
            assert_eq!(buf.line_at(7).map(|l| l.number), Some(1));
            assert_eq!(buf.line_at(8).map(|l| l.number), Some(2));
            assert_eq!(buf.line_at(buf.len()).map(|l| l.number), Some(3));
            assert!(buf.line_at(buf.len() + 1).is_none());
        }

        #[test]
        fn indentation_counts_raw_characters() {
            let buf = LineBuffer::new("\t\t- [ ] tabbed\n    - [ ] spaced\n   \n");
            let tabbed = buf.line(1).expect("line");
            assert_eq!(tabbed.indent_text(), "\t\t");
            assert_eq!(tabbed.indent(), 2);
            assert_eq!(buf.line(2).expect("line").indent(), 4);
            assert!(buf.line(3).expect("line").is_blank());
        }
    }
}

pub mod transaction {
    //! Edit transactions: a change set in start-document coordinates, the user event that
    //! produced it, and provenance annotations.

    use crate::buffer::LineBuffer;
    use std::{fmt, ops::Range};

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum EditError {
        #[error("change {from}..{to} is inverted")]
        Inverted { from: usize, to: usize },
        #[error("change {from}..{to} overlaps a change ending at {previous_end}")]
        Overlapping {
            from: usize,
            to: usize,
            previous_end: usize,
        },
        #[error("change {from}..{to} is outside the document (length {len})")]
        OutOfBounds { from: usize, to: usize, len: usize },
        #[error("offset {0} is not on a character boundary")]
        NotCharBoundary(usize),
    }

    /// Replace `from..to` of the start document with `insert`.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Change {
        pub from: usize,
        pub to: usize,
        pub insert: String,
    }

    impl Change {
        pub fn insert(at: usize, text: impl Into<String>) -> Self {
            Self {
                from: at,
                to: at,
                insert: text.into(),
            }
        }

        pub fn replace(range: Range<usize>, text: impl Into<String>) -> Self {
            Self {
                from: range.start,
                to: range.end,
                insert: text.into(),
            }
        }

        pub fn delete(range: Range<usize>) -> Self {
            Self::replace(range, String::new())
        }
    }

    /// A change located in both documents: `from_a..to_a` in the start document,
    /// `from_b..to_b` in the resulting one.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChangeSpan<'a> {
        pub from_a: usize,
        pub to_a: usize,
        pub from_b: usize,
        pub to_b: usize,
        pub inserted: &'a str,
    }

    /// Sorted, non-overlapping changes against one start document.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct ChangeSet {
        changes: Vec<Change>,
    }

    impl ChangeSet {
        pub fn new(mut changes: Vec<Change>) -> Result<Self, EditError> {
            changes.sort_by_key(|c| (c.from, c.to));
            let mut previous_end: Option<usize> = None;
            for c in &changes {
                if c.from > c.to {
                    return Err(EditError::Inverted {
                        from: c.from,
                        to: c.to,
                    });
                }
                if let Some(end) = previous_end {
                    if c.from < end {
                        return Err(EditError::Overlapping {
                            from: c.from,
                            to: c.to,
                            previous_end: end,
                        });
                    }
                }
                previous_end = Some(c.to);
            }
            Ok(Self { changes })
        }

        pub fn changes(&self) -> &[Change] {
            &self.changes
        }

        /// True when applying the set would leave the document untouched.
        pub fn is_empty(&self) -> bool {
            self.changes
                .iter()
                .all(|c| c.from == c.to && c.insert.is_empty())
        }

        pub fn spans(&self) -> Vec<ChangeSpan<'_>> {
            let mut grown = 0;
            let mut shrunk = 0;
            self.changes
                .iter()
                .map(|c| {
                    let from_b = c.from + grown - shrunk;
                    let span = ChangeSpan {
                        from_a: c.from,
                        to_a: c.to,
                        from_b,
                        to_b: from_b + c.insert.len(),
                        inserted: &c.insert,
                    };
                    grown += c.insert.len();
                    shrunk += c.to - c.from;
                    span
                })
                .collect()
        }

        /// Whether some change writes the byte at `pos` of the resulting document.
        pub fn touches(&self, pos: usize) -> bool {
            self.spans()
                .iter()
                .any(|s| pos >= s.from_b && pos < s.to_b)
        }

        /// Maps an offset in the resulting document back to the start document.
        /// `None` for offsets inside inserted text.
        pub fn map_to_start(&self, pos: usize) -> Option<usize> {
            let mut grown = 0;
            let mut shrunk = 0;
            for s in self.spans() {
                if pos < s.from_b {
                    break;
                }
                if pos < s.to_b {
                    return None;
                }
                grown += s.to_b - s.from_b;
                shrunk += s.to_a - s.from_a;
            }
            Some(pos + shrunk - grown)
        }

        pub fn push(&mut self, change: Change) -> Result<(), EditError> {
            let mut all = self.changes.clone();
            all.push(change);
            *self = Self::new(all)?;
            Ok(())
        }

        pub fn apply(&self, doc: &LineBuffer) -> Result<LineBuffer, EditError> {
            let text = doc.text();
            let mut out = String::with_capacity(text.len());
            let mut cursor = 0;
            for c in &self.changes {
                if c.to > text.len() {
                    return Err(EditError::OutOfBounds {
                        from: c.from,
                        to: c.to,
                        len: text.len(),
                    });
                }
                for at in [c.from, c.to] {
                    if !text.is_char_boundary(at) {
                        return Err(EditError::NotCharBoundary(at));
                    }
                }
                out.push_str(&text[cursor..c.from]);
                out.push_str(&c.insert);
                cursor = c.to;
            }
            out.push_str(&text[cursor..]);
            Ok(LineBuffer::new(out))
        }
    }

    /// The user event behind a transaction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum Origin {
        #[default]
        Input,
        Paste,
        Delete,
        Programmatic,
    }

    /// Outcome recorded on transactions amended by parent completion.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum PropagationStage {
        Done,
        InProgress,
    }

    impl fmt::Display for PropagationStage {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                PropagationStage::Done => f.write_str("DONE"),
                PropagationStage::InProgress => f.write_str("IN_PROGRESS"),
            }
        }
    }

    /// Provenance tag. Lives only as long as its transaction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Annotation {
        /// Produced by parent completion propagation.
        ParentCompletion(PropagationStage),
        /// An explicit status toggle on a single task.
        StatusCycle,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct Transaction {
        changes: ChangeSet,
        origin: Origin,
        annotations: Vec<Annotation>,
    }

    impl Transaction {
        pub fn new(changes: ChangeSet, origin: Origin) -> Self {
            Self {
                changes,
                origin,
                annotations: vec![],
            }
        }

        pub fn from_changes(changes: Vec<Change>, origin: Origin) -> Result<Self, EditError> {
            Ok(Self::new(ChangeSet::new(changes)?, origin))
        }

        pub fn with_annotation(mut self, annotation: Annotation) -> Self {
            self.annotations.push(annotation);
            self
        }

        pub fn changes(&self) -> &ChangeSet {
            &self.changes
        }

        pub fn origin(&self) -> Origin {
            self.origin
        }

        pub fn annotations(&self) -> &[Annotation] {
            &self.annotations
        }

        pub fn doc_changed(&self) -> bool {
            !self.changes.is_empty()
        }

        pub fn is_self_produced(&self) -> bool {
            self.propagation_stage().is_some()
        }

        pub fn propagation_stage(&self) -> Option<PropagationStage> {
            self.annotations.iter().find_map(|a| match a {
                Annotation::ParentCompletion(stage) => Some(*stage),
                Annotation::StatusCycle => None,
            })
        }

        /// A copy with one more change and one more annotation.
        pub fn amended(&self, change: Change, annotation: Annotation) -> Result<Self, EditError> {
            let mut changes = self.changes.clone();
            changes.push(change)?;
            let mut annotations = self.annotations.clone();
            annotations.push(annotation);
            Ok(Self {
                changes,
                origin: self.origin,
                annotations,
            })
        }

        pub fn apply(&self, doc: &LineBuffer) -> Result<LineBuffer, EditError> {
            self.changes.apply(doc)
        }
    }

}

pub mod config {
    //! Settings supplied by the host's settings store.

    use crate::core::Dialect;
    use serde::{Deserialize, Serialize};
    use std::{fs, path::Path, path::PathBuf};

    pub const DEFAULT_IN_PROGRESS_MARKER: char = '/';

    #[derive(Debug, thiserror::Error)]
    pub enum ConfigError {
        #[error("reading settings from {path:?}")]
        Read {
            path: PathBuf,
            #[source]
            source: std::io::Error,
        },
        #[error("invalid settings: {0}")]
        Invalid(#[from] serde_json::Error),
    }

    /// Switches for parent completion propagation.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct PropagationSettings {
        /// Master switch for the interceptor.
        pub auto_complete_parent: bool,
        /// Put a completed parent back in progress when a child is incomplete.
        pub revert_parent_on_partial_completion: bool,
        /// Mark an empty parent in progress once any child has a status.
        pub mark_parent_in_progress_on_partial_activity: bool,
        pub workflow_enabled: bool,
        /// Only count `[x]` children that the workflow oracle reports as terminal.
        pub workflow_strict_terminal_check: bool,
        /// Status cycle for "in progress"; the first entry is written.
        pub in_progress_markers: Vec<char>,
        pub tab_width: usize,
    }

    impl Default for PropagationSettings {
        fn default() -> Self {
            Self {
                auto_complete_parent: true,
                revert_parent_on_partial_completion: true,
                mark_parent_in_progress_on_partial_activity: true,
                workflow_enabled: false,
                workflow_strict_terminal_check: false,
                in_progress_markers: vec![DEFAULT_IN_PROGRESS_MARKER],
                tab_width: 4,
            }
        }
    }

    impl PropagationSettings {
        pub fn in_progress_marker(&self) -> char {
            self.in_progress_markers
                .first()
                .copied()
                .unwrap_or(DEFAULT_IN_PROGRESS_MARKER)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(default)]
    pub struct Settings {
        pub dialect: Dialect,
        pub propagation: PropagationSettings,
    }

    impl Settings {
        pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
            Ok(serde_json::from_str(text)?)
        }

        pub fn load(path: &Path) -> Result<Self, ConfigError> {
            let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            Self::from_json_str(&text)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn missing_keys_fall_back_to_defaults() {
            let settings = Settings::from_json_str(
                r#"{"dialect": "fields", "propagation": {"tab_width": 2, "in_progress_markers": [">", "/"]}}"#,
            )
            .expect("parse settings");
            assert_eq!(settings.dialect, Dialect::Fields);
            assert_eq!(settings.propagation.tab_width, 2);
            assert_eq!(settings.propagation.in_progress_marker(), '>');
            assert!(settings.propagation.auto_complete_parent);
            assert!(!settings.propagation.workflow_enabled);
        }

        #[test]
        fn empty_marker_cycle_uses_default_marker() {
            let settings = PropagationSettings {
                in_progress_markers: vec![],
                ..Default::default()
            };
            assert_eq!(settings.in_progress_marker(), DEFAULT_IN_PROGRESS_MARKER);
        }

        #[test]
        fn load_reports_missing_file_and_bad_json() {
            let dir = tempfile::tempdir().expect("tempdir");
            let missing = dir.path().join("missing.json");
            assert!(matches!(
                Settings::load(&missing),
                Err(ConfigError::Read { .. })
            ));

            let bad = dir.path().join("bad.json");
            fs::write(&bad, "{ not json").expect("write");
            assert!(matches!(Settings::load(&bad), Err(ConfigError::Invalid(_))));

            let good = dir.path().join("good.json");
            fs::write(&good, "{}").expect("write");
            assert_eq!(Settings::load(&good).expect("load"), Settings::default());
        }
    }
}

pub mod parser {
    //! Task-line metadata extraction.
    //!
    //! The checkbox header and calendar dates are nom combinators. Inline metadata is
    //! pulled out with precompiled patterns, one field at a time, in a fixed order:
    //! dates, recurrence, priority, project, context, tags. Every step cuts what it
    //! claimed from the running remainder, so later steps never see it again.

    use crate::core::{Dialect, Tag, Task};
    use chrono::NaiveDate;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while, take_while_m_n},
        character::complete::{char, digit1, satisfy},
        combinator::{all_consuming, map_res, recognize},
        error::VerboseError,
        sequence::{terminated, tuple},
    };
    use regex::Regex;
    use std::{ops::Range, sync::LazyLock};
    use tracing::warn;

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /* ------------------------ Public entry points ------------------------ */

    /// Parse one line. `None` means the line is not a task.
    pub fn parse_task_line(
        file_path: &str,
        line: &str,
        line_number: usize,
        dialect: Dialect,
    ) -> Option<Task> {
        let marker = task_marker(line)?;
        let mut ex = Extraction {
            task: Task::new(file_path, line_number, marker.status, line),
            remaining: line[marker.body_offset..].to_string(),
            dialect,
        };
        ex.dates();
        ex.recurrence();
        ex.priority();
        ex.project();
        ex.context();
        ex.tags();
        Some(ex.finish())
    }

    /// Every task line of a document, numbered from 1.
    pub fn parse_document(file_path: &str, text: &str, dialect: Dialect) -> Vec<Task> {
        text.lines()
            .enumerate()
            .filter_map(|(idx, line)| parse_task_line(file_path, line, idx + 1, dialect))
            .collect()
    }

    /* --------------------------- Checkbox header --------------------------- */

    /// Byte positions of a task line's checkbox.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskMarker {
        pub status: char,
        /// Offset of the status character.
        pub status_offset: usize,
        /// Offset of the description, after the whitespace following `]`.
        pub body_offset: usize,
    }

    impl TaskMarker {
        pub fn open_bracket(&self) -> usize {
            self.status_offset - 1
        }

        pub fn close_bracket(&self) -> usize {
            self.status_offset + self.status.len_utf8()
        }

        pub fn status_range(&self) -> Range<usize> {
            self.status_offset..self.close_bracket()
        }
    }

    /// Recognize `[indent|>]* (-|*|+|N.) <ws> [c]` at the start of `line`.
    pub fn task_marker(line: &str) -> Option<TaskMarker> {
        let (rest, status) = checkbox_header(line).ok()?;
        let close = line.len() - rest.len() - 1;
        Some(TaskMarker {
            status,
            status_offset: close - status.len_utf8(),
            body_offset: line.len() - rest.trim_start().len(),
        })
    }

    fn checkbox_header(i: &str) -> PResult<'_, char> {
        let (i, _) = take_while(|c: char| c.is_whitespace() || c == '>')(i)?;
        let (i, _) = alt((
            tag("-"),
            tag("*"),
            tag("+"),
            recognize(terminated(digit1, char('.'))),
        ))(i)?;
        let (i, _) = satisfy(|c| c == ' ' || c == '\t')(i)?;
        let (i, _) = char('[')(i)?;
        let (i, status) = satisfy(|c| c != '\n' && c != '\r')(i)?;
        let (i, _) = char(']')(i)?;
        Ok((i, status))
    }

    /* ------------------------------- Dates ------------------------------- */

    fn calendar_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                map_res(take_while_m_n(4, 4, |c: char| c.is_ascii_digit()), |s: &str| {
                    s.parse::<i32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, |c: char| c.is_ascii_digit()), |s: &str| {
                    s.parse::<u32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, |c: char| c.is_ascii_digit()), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    /// Strict `YYYY-MM-DD`. Anything else is reported and yields `None`.
    pub fn parse_calendar_date(raw: &str) -> Option<NaiveDate> {
        match all_consuming(calendar_date)(raw) {
            Ok((_, date)) => Some(date),
            Err(_) => {
                warn!(target: "taskline::parser", token = raw, "invalid date; field left unset");
                None
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum DateField {
        Due,
        Scheduled,
        Start,
        Completion,
        Created,
    }

    impl DateField {
        const ORDER: [DateField; 5] = [
            DateField::Due,
            DateField::Scheduled,
            DateField::Start,
            DateField::Completion,
            DateField::Created,
        ];

        fn glyphs(self) -> &'static str {
            match self {
                DateField::Due => r"(?:📅|🗓\x{FE0F}?)",
                DateField::Scheduled => "⏳",
                DateField::Start => "🛫",
                DateField::Completion => "✅",
                DateField::Created => "➕",
            }
        }

        fn keyword(self) -> &'static str {
            match self {
                DateField::Due => "due",
                DateField::Scheduled => "scheduled",
                DateField::Start => "start",
                DateField::Completion => "completion",
                DateField::Created => "created",
            }
        }

        fn slot(self, task: &mut Task) -> &mut Option<NaiveDate> {
            match self {
                DateField::Due => &mut task.due_date,
                DateField::Scheduled => &mut task.scheduled_date,
                DateField::Start => &mut task.start_date,
                DateField::Completion => &mut task.completed_date,
                DateField::Created => &mut task.created_date,
            }
        }
    }

    /* ------------------------------ Patterns ------------------------------ */

    const DATE: &str = "[0-9]{4}-[0-9]{2}-[0-9]{2}";
    const PRIORITY_GLYPHS: &str = r"🔺|⏫|🔼|🔽|⏬|\[#[A-E]\]";

    fn pattern(src: &str) -> Regex {
        Regex::new(src).expect("static pattern compiles")
    }

    static SYMBOL_DATES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
        DateField::ORDER
            .iter()
            .map(|f| pattern(&format!(r"{}\s*({DATE})", f.glyphs())))
            .collect()
    });
    static FIELD_DATES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
        DateField::ORDER
            .iter()
            .map(|f| {
                pattern(&format!(
                    r"(?i)\[(?:{}|{})::\s*({DATE})\]",
                    f.keyword(),
                    f.glyphs()
                ))
            })
            .collect()
    });

    static SYMBOL_RECURRENCE: LazyLock<Regex> = LazyLock::new(|| pattern(r"🔁\s*"));
    static FIELD_RECURRENCE: LazyLock<Regex> =
        LazyLock::new(|| pattern(r"(?i)\[(?:repeat|recurrence|🔁)::\s*([^\]]+)\]"));
    static RECURRENCE_STOP: LazyLock<Regex> = LazyLock::new(|| {
        pattern(&format!(
            r"\s(?:📅|🗓|🛫|⏳|✅|➕|🔁|{PRIORITY_GLYPHS}|@|#|\[[^\]]*::)"
        ))
    });

    static SYMBOL_PRIORITY: LazyLock<Regex> =
        LazyLock::new(|| pattern(&format!(r"(?:{PRIORITY_GLYPHS})\x{{FE0F}}?")));
    static FIELD_PRIORITY: LazyLock<Regex> =
        LazyLock::new(|| pattern(r"(?i)\[priority::\s*([^\]]+)\]"));

    static SYMBOL_PROJECT: LazyLock<Regex> = LazyLock::new(|| pattern(r"#project/([\w/-]+)"));
    static FIELD_PROJECT: LazyLock<Regex> =
        LazyLock::new(|| pattern(r"(?i)\[project::\s*([^\]]+)\]"));

    static CONTEXT: LazyLock<Regex> = LazyLock::new(|| pattern(r"@[\w-]+"));
    static FIELD_CONTEXT: LazyLock<Regex> =
        LazyLock::new(|| pattern(r"(?i)\[context::\s*([^\]]+)\]"));

    static ANY_FIELD: LazyLock<Regex> = LazyLock::new(|| {
        pattern(r"\[(?:\w+|📅|🗓\x{FE0F}?|✅|➕|🛫|⏳|🔁)::\s*[^\]]+\]")
    });
    static KNOWN_FIELD: LazyLock<Regex> = LazyLock::new(|| {
        pattern(
            r"(?i)^\[(?:due|scheduled|start|completion|created|repeat|recurrence|priority|project|context|📅|🗓\x{FE0F}?|⏳|🛫|✅|➕|🔁)::",
        )
    });
    static WIKI_LINK: LazyLock<Regex> = LazyLock::new(|| pattern(r"\[\[[^\[\]]+\]\]"));
    static INLINE_LINK: LazyLock<Regex> =
        LazyLock::new(|| pattern(r"\[[^\[\]]*\]\([^)]*\)"));
    static TAG: LazyLock<Regex> = LazyLock::new(|| {
        pattern(r##"#[^\x{2000}-\x{206F}\x{2E00}-\x{2E7F}'!"#$%&()*+,.:;<=>?@^`{|}~\[\]\\\s]+"##)
    });
    static WHITESPACE_RUN: LazyLock<Regex> = LazyLock::new(|| pattern(r"\s{2,}"));

    /* ------------------------------ Priority ------------------------------ */

    /// Rank a priority token: glyph, `[#A]`..`[#E]`, English word or bare integer.
    /// 5 is highest. Unknown tokens and integers outside 1..=5 give `None`.
    pub fn priority_rank(token: &str) -> Option<u8> {
        let token = token.trim().trim_end_matches('\u{FE0F}').to_lowercase();
        let rank = match token.as_str() {
            "🔺" | "[#a]" | "highest" => 5,
            "⏫" | "[#b]" | "high" => 4,
            "🔼" | "[#c]" | "medium" => 3,
            "🔽" | "[#d]" | "low" => 2,
            "⏬" | "[#e]" | "lowest" => 1,
            other => return other.parse::<u8>().ok().filter(|n| (1..=5).contains(n)),
        };
        Some(rank)
    }

    /* ----------------------------- Extraction ----------------------------- */

    struct Extraction {
        task: Task,
        remaining: String,
        dialect: Dialect,
    }

    impl Extraction {
        fn cut(&mut self, range: Range<usize>) {
            self.remaining.replace_range(range, " ");
        }

        fn cut_all(&mut self, ranges: Vec<Range<usize>>) {
            for range in merge(ranges).into_iter().rev() {
                self.cut(range);
            }
        }

        fn dates(&mut self) {
            for field in DateField::ORDER {
                for dialect in self.dialect.preference() {
                    let re = match dialect {
                        Dialect::Symbols => &SYMBOL_DATES[field as usize],
                        Dialect::Fields => &FIELD_DATES[field as usize],
                    };
                    let Some(caps) = re.captures(&self.remaining) else {
                        continue;
                    };
                    let (Some(whole), Some(raw)) = (caps.get(0), caps.get(1)) else {
                        continue;
                    };
                    let range = whole.range();
                    if let Some(date) = parse_calendar_date(raw.as_str()) {
                        *field.slot(&mut self.task) = Some(date);
                        self.cut(range);
                        break;
                    }
                }
            }
        }

        fn recurrence(&mut self) {
            for dialect in self.dialect.preference() {
                let found = match dialect {
                    Dialect::Symbols => symbol_recurrence(&self.remaining),
                    Dialect::Fields => captured(&FIELD_RECURRENCE, &self.remaining),
                };
                if let Some((range, value)) = found {
                    self.task.recurrence = Some(value);
                    self.cut(range);
                    return;
                }
            }
        }

        fn priority(&mut self) {
            for dialect in self.dialect.preference() {
                let found = match dialect {
                    Dialect::Symbols => SYMBOL_PRIORITY
                        .find(&self.remaining)
                        .and_then(|m| Some((m.range(), priority_rank(m.as_str())?))),
                    Dialect::Fields => captured(&FIELD_PRIORITY, &self.remaining)
                        .and_then(|(range, value)| Some((range, priority_rank(&value)?))),
                };
                if let Some((range, rank)) = found {
                    self.task.priority = Some(rank);
                    self.cut(range);
                    return;
                }
            }
        }

        fn project(&mut self) {
            for dialect in self.dialect.preference() {
                let found = match dialect {
                    Dialect::Symbols => captured(
                        &SYMBOL_PROJECT,
                        &mask(&self.remaining, &link_spans(&self.remaining)),
                    ),
                    Dialect::Fields => captured(&FIELD_PROJECT, &self.remaining),
                };
                if let Some((range, value)) = found {
                    self.task.project = Some(value);
                    self.cut(range);
                    return;
                }
            }
        }

        fn context(&mut self) {
            for dialect in self.dialect.preference() {
                let found = match dialect {
                    Dialect::Symbols => {
                        let masked = mask(&self.remaining, &link_spans(&self.remaining));
                        let first = CONTEXT
                            .find_iter(&masked)
                            .find(|m| at_word_start(&masked, m.start()))
                            .map(|m| (m.range(), m.as_str()[1..].to_string()));
                        first
                    }
                    Dialect::Fields => captured(&FIELD_CONTEXT, &self.remaining),
                };
                if let Some((range, value)) = found {
                    self.task.context = Some(value);
                    self.cut(range);
                    return;
                }
            }
        }

        fn tags(&mut self) {
            if self.dialect == Dialect::Fields {
                // known keys only survive here when their value was rejected
                let fields = ANY_FIELD
                    .find_iter(&self.remaining)
                    .filter(|m| !KNOWN_FIELD.is_match(m.as_str()))
                    .map(|m| m.range())
                    .collect();
                self.cut_all(fields);
            }

            let mut hidden = link_spans(&self.remaining);
            hidden.extend(ANY_FIELD.find_iter(&self.remaining).map(|m| m.range()));
            let masked = mask(&self.remaining, &hidden);

            let mut cuts = Vec::new();
            for m in TAG.find_iter(&masked) {
                self.task.tags.push(Tag::from(m.as_str()));
                cuts.push(m.range());
            }
            // leftover contexts
            cuts.extend(
                CONTEXT
                    .find_iter(&masked)
                    .filter(|m| at_word_start(&masked, m.start()))
                    .map(|m| m.range()),
            );
            self.cut_all(cuts);
        }

        fn finish(mut self) -> Task {
            self.task.content = WHITESPACE_RUN
                .replace_all(&self.remaining, " ")
                .trim()
                .to_string();
            self.task
        }
    }

    fn captured(re: &Regex, text: &str) -> Option<(Range<usize>, String)> {
        let caps = re.captures(text)?;
        let value = caps.get(1)?.as_str().trim();
        if value.is_empty() {
            return None;
        }
        Some((caps.get(0)?.range(), value.to_string()))
    }

    /// `🔁 <rule>` up to the next metadata token. Glyphs inside `[🔁:: ..]` fields are
    /// left to the field pattern.
    fn symbol_recurrence(text: &str) -> Option<(Range<usize>, String)> {
        let m = SYMBOL_RECURRENCE
            .find_iter(text)
            .find(|m| !text[..m.start()].ends_with('['))?;
        let tail = &text[m.end()..];
        let stop = RECURRENCE_STOP
            .find(tail)
            .map(|s| s.start())
            .unwrap_or(tail.len());
        let value = tail[..stop].trim();
        if value.is_empty() {
            return None;
        }
        Some((m.start()..m.end() + stop, value.to_string()))
    }

    fn at_word_start(text: &str, offset: usize) -> bool {
        text[..offset]
            .chars()
            .next_back()
            .is_none_or(char::is_whitespace)
    }

    /// Wiki links, then inline links that do not overlap one.
    fn link_spans(text: &str) -> Vec<Range<usize>> {
        let mut spans: Vec<Range<usize>> = WIKI_LINK.find_iter(text).map(|m| m.range()).collect();
        let inline: Vec<Range<usize>> = INLINE_LINK
            .find_iter(text)
            .map(|m| m.range())
            .filter(|r| !spans.iter().any(|w| r.start < w.end && w.start < r.end))
            .collect();
        spans.extend(inline);
        spans.sort_by_key(|r| r.start);
        spans
    }

    /// Blank out `spans` with spaces of the same byte length, so offsets found in the
    /// masked text are valid in the original.
    fn mask(text: &str, spans: &[Range<usize>]) -> String {
        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for span in merge(spans.to_vec()) {
            out.push_str(&text[cursor..span.start]);
            out.push_str(&" ".repeat(span.end - span.start));
            cursor = span.end;
        }
        out.push_str(&text[cursor..]);
        out
    }

    fn merge(mut ranges: Vec<Range<usize>>) -> Vec<Range<usize>> {
        ranges.sort_by_key(|r| r.start);
        let mut out: Vec<Range<usize>> = Vec::with_capacity(ranges.len());
        for r in ranges {
            match out.last_mut() {
                Some(last) if r.start <= last.end => last.end = last.end.max(r.end),
                _ => out.push(r),
            }
        }
        out
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn parse(line: &str, dialect: Dialect) -> Task {
            parse_task_line("notes/today.md", line, 1, dialect).expect("task line")
        }

        fn tags(task: &Task) -> Vec<&str> {
            task.tags.iter().map(|t| t.0.as_str()).collect()
        }

        fn date(s: &str) -> NaiveDate {
            NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
        }

        #[test]
        fn checkbox_positions() {
            let marker = task_marker("  - [x] done").expect("task");
            assert_eq!(marker.status, 'x');
            assert_eq!(marker.status_offset, 5);
            assert_eq!(marker.open_bracket(), 4);
            assert_eq!(marker.close_bracket(), 6);
            assert_eq!(marker.status_range(), 5..6);
            assert_eq!(marker.body_offset, 8);
        }

        #[test]
        fn list_marker_variants() {
            assert_eq!(parse("1. [x] shipped", Dialect::Symbols).status, 'x');
            assert_eq!(parse("> - [ ] quoted", Dialect::Symbols).content, "quoted");
            let nested = parse("    * [/] doing", Dialect::Symbols);
            assert_eq!(nested.status, '/');
            assert!(!nested.completed);
            assert_eq!(parse("\t+ [X] tabbed", Dialect::Symbols).status, 'X');
        }

        #[test]
        fn non_task_lines_do_not_match() {
            for line in ["- not a task", "plain text", "-[ ] no space", "- [] empty", "# - [ ] heading", ""] {
                assert!(
                    parse_task_line("a.md", line, 1, Dialect::Symbols).is_none(),
                    "expected no task for {line:?}"
                );
            }
        }

        #[test]
        fn id_uses_path_and_line() {
            let task = parse_task_line("notes/a.md", "- [ ] a", 12, Dialect::Symbols).expect("task");
            assert_eq!(task.id.0, "notes/a.md-L12");
            assert_eq!(task.original_markdown, "- [ ] a");
        }

        #[test]
        fn symbol_notation_full_line() {
            let task = parse(
                "- [ ] Write report 📅 2025-03-10 ⏳ 2025-03-08 🛫 2025-03-01 ➕ 2025-02-20 🔁 every week 🔺 #project/work/q1 @office #writing",
                Dialect::Symbols,
            );
            assert_eq!(task.content, "Write report");
            assert_eq!(task.due_date, Some(date("2025-03-10")));
            assert_eq!(task.scheduled_date, Some(date("2025-03-08")));
            assert_eq!(task.start_date, Some(date("2025-03-01")));
            assert_eq!(task.created_date, Some(date("2025-02-20")));
            assert_eq!(task.completed_date, None);
            assert_eq!(task.recurrence.as_deref(), Some("every week"));
            assert_eq!(task.priority, Some(5));
            assert_eq!(task.project.as_deref(), Some("work/q1"));
            assert_eq!(task.context.as_deref(), Some("office"));
            assert_eq!(tags(&task), vec!["#writing"]);
        }

        #[test]
        fn field_notation_full_line() {
            let task = parse(
                "- [x] Ship it [due:: 2025-04-01] [completion:: 2025-03-30] [priority:: high] [project:: launch/v2] [context:: desk] [repeat:: every month] #release",
                Dialect::Fields,
            );
            assert!(task.completed);
            assert_eq!(task.content, "Ship it");
            assert_eq!(task.due_date, Some(date("2025-04-01")));
            assert_eq!(task.completed_date, Some(date("2025-03-30")));
            assert_eq!(task.priority, Some(4));
            assert_eq!(task.project.as_deref(), Some("launch/v2"));
            assert_eq!(task.context.as_deref(), Some("desk"));
            assert_eq!(task.recurrence.as_deref(), Some("every month"));
            assert_eq!(tags(&task), vec!["#release"]);
        }

        #[test]
        fn links_hide_tags_and_contexts() {
            let task = parse(
                "- [ ] check [[Project #notes|See #notes]] @home #urgent",
                Dialect::Symbols,
            );
            assert_eq!(task.context.as_deref(), Some("home"));
            assert_eq!(tags(&task), vec!["#urgent"]);
            assert_eq!(task.content, "check [[Project #notes|See #notes]]");

            let inline = parse("- [ ] read [notes #draft](https://x.y/#frag) #later", Dialect::Symbols);
            assert_eq!(tags(&inline), vec!["#later"]);
            assert_eq!(inline.content, "read [notes #draft](https://x.y/#frag)");

            let mention = parse("- [ ] sync with [[Team @alice]]", Dialect::Symbols);
            assert_eq!(mention.context, None);
            assert_eq!(mention.content, "sync with [[Team @alice]]");
        }

        #[test]
        fn tag_adjacent_to_link_keeps_one_space() {
            let task = parse("- [ ] see [[Page|Page]]#tag now", Dialect::Symbols);
            assert_eq!(tags(&task), vec!["#tag"]);
            assert_eq!(task.content, "see [[Page|Page]] now");
        }

        #[test]
        fn priority_tokens() {
            assert_eq!(parse("- [ ] task 🔺", Dialect::Symbols).priority, Some(5));
            assert_eq!(parse("- [ ] task [priority:: Medium]", Dialect::Symbols).priority, Some(3));
            assert_eq!(parse("- [ ] task [#B]", Dialect::Symbols).priority, Some(4));
            assert_eq!(parse("- [ ] task ⏬\u{FE0F}", Dialect::Symbols).priority, Some(1));
            assert_eq!(parse("- [ ] task [priority:: 2]", Dialect::Fields).priority, Some(2));
            let rejected = parse("- [ ] task [priority:: urgent]", Dialect::Fields);
            assert_eq!(rejected.priority, None);
            assert_eq!(rejected.content, "task [priority:: urgent]");
            let out_of_range = parse("- [ ] task [priority:: 7] #t", Dialect::Fields);
            assert_eq!(out_of_range.priority, None);
            assert_eq!(out_of_range.content, "task [priority:: 7]");
            assert_eq!(out_of_range.tags, vec![Tag::from("#t")]);
            assert_eq!(priority_rank("9"), None);
            assert_eq!(priority_rank("lowest"), Some(1));
        }

        #[test]
        fn first_priority_wins() {
            let task = parse("- [ ] task 🔽 ⏫", Dialect::Symbols);
            assert_eq!(task.priority, Some(2));
        }

        #[test]
        fn invalid_date_stays_in_content() {
            let task = parse("- [ ] later 📅 2024-13-40", Dialect::Symbols);
            assert_eq!(task.due_date, None);
            assert_eq!(task.content, "later 📅 2024-13-40");

            let field = parse("- [ ] later [due:: 2024-13-40]", Dialect::Fields);
            assert_eq!(field.due_date, None);
            assert_eq!(field.content, "later [due:: 2024-13-40]");
            assert_eq!(parse_calendar_date("2024-02-29"), Some(date("2024-02-29")));
            assert_eq!(parse_calendar_date("2024-2-29"), None);
            assert_eq!(parse_calendar_date("2024-02-29x"), None);
        }

        #[test]
        fn dialect_is_a_preference() {
            for line in ["- [ ] pay [due:: 2025-05-01]", "- [ ] pay 📅 2025-05-01"] {
                let symbols = parse(line, Dialect::Symbols);
                let fields = parse(line, Dialect::Fields);
                assert_eq!(symbols, fields, "dialects disagree on {line:?}");
                assert_eq!(symbols.due_date, Some(date("2025-05-01")));
                assert_eq!(symbols.content, "pay");
            }

            let mixed = parse("- [ ] mix [due:: 2025-05-01] ⏳ 2025-04-30", Dialect::Fields);
            assert_eq!(mixed.due_date, Some(date("2025-05-01")));
            assert_eq!(mixed.scheduled_date, Some(date("2025-04-30")));
            assert_eq!(mixed.content, "mix");
        }

        #[test]
        fn recurrence_stops_at_next_token() {
            let task = parse("- [ ] water plants 🔁 every 3 days 📅 2025-01-02 #home", Dialect::Symbols);
            assert_eq!(task.recurrence.as_deref(), Some("every 3 days"));
            assert_eq!(task.content, "water plants");

            let field = parse("- [ ] backup [🔁:: every day]", Dialect::Symbols);
            assert_eq!(field.recurrence.as_deref(), Some("every day"));
            assert_eq!(field.content, "backup");
        }

        #[test]
        fn recurrence_stops_before_bracketed_fields() {
            let line = "- [ ] water 🔁 every week [priority:: high] [project:: home/garden]";
            for dialect in [Dialect::Symbols, Dialect::Fields] {
                let task = parse(line, dialect);
                assert_eq!(task.recurrence.as_deref(), Some("every week"));
                assert_eq!(task.priority, Some(4));
                assert_eq!(task.project.as_deref(), Some("home/garden"));
                assert_eq!(task.content, "water");
            }
        }

        #[test]
        fn project_tokens_inside_links_are_left_alone() {
            for dialect in [Dialect::Symbols, Dialect::Fields] {
                let inline = parse("- [ ] read [docs](https://x.y/#project/alpha) #later", dialect);
                assert_eq!(inline.project, None);
                assert_eq!(inline.content, "read [docs](https://x.y/#project/alpha)");
                assert_eq!(tags(&inline), vec!["#later"]);
            }

            let wiki = parse("- [ ] see [[#project/beta]] #project/gamma", Dialect::Symbols);
            assert_eq!(wiki.project.as_deref(), Some("gamma"));
            assert_eq!(wiki.content, "see [[#project/beta]]");
            assert!(wiki.tags.is_empty());
        }

        #[test]
        fn duplicate_tags_are_kept_in_order() {
            let task = parse("- [ ] a #x #y #x", Dialect::Symbols);
            assert_eq!(tags(&task), vec!["#x", "#y", "#x"]);
            assert_eq!(task.content, "a");
        }

        #[test]
        fn second_project_token_is_a_tag() {
            let task = parse("- [ ] a #project/one #project/two", Dialect::Symbols);
            assert_eq!(task.project.as_deref(), Some("one"));
            assert_eq!(tags(&task), vec!["#project/two"]);
        }

        #[test]
        fn contexts_need_a_word_boundary() {
            let mail = parse("- [ ] mail me@host.com @work", Dialect::Symbols);
            assert_eq!(mail.context.as_deref(), Some("work"));
            assert_eq!(mail.content, "mail me@host.com");

            let many = parse("- [ ] call @home @phone", Dialect::Symbols);
            assert_eq!(many.context.as_deref(), Some("home"));
            assert_eq!(many.content, "call");
        }

        #[test]
        fn unknown_fields_depend_on_dialect() {
            let fields = parse("- [ ] a [owner:: sam #lead] #t", Dialect::Fields);
            assert_eq!(fields.content, "a");
            assert_eq!(tags(&fields), vec!["#t"]);

            let symbols = parse("- [ ] a [owner:: sam #lead] #t", Dialect::Symbols);
            assert_eq!(symbols.content, "a [owner:: sam #lead]");
            assert_eq!(tags(&symbols), vec!["#t"]);
        }

        #[test]
        fn reparsing_original_markdown_is_stable() {
            let lines = [
                "- [ ] Write report 📅 2025-03-10 🔁 every week 🔺 #project/work @office #writing",
                "- [x] Ship [due:: 2025-04-01] [priority:: low] #release",
                "  1. [/] check [[Page #x]] @desk",
            ];
            for dialect in [Dialect::Symbols, Dialect::Fields] {
                for line in lines {
                    let first = parse(line, dialect);
                    let second = parse(&first.original_markdown, dialect);
                    assert_eq!(first, second);
                }
            }
        }

        #[test]
        fn extracted_values_leave_content() {
            let task = parse(
                "- [ ] pack 📅 2025-06-01 🔼 #project/trip @home #bags",
                Dialect::Symbols,
            );
            for fragment in ["📅", "2025-06-01", "🔼", "#project/trip", "@home", "#bags"] {
                assert!(!task.content.contains(fragment), "{fragment} left in {:?}", task.content);
            }
        }

        #[test]
        fn document_numbers_lines_from_one() {
            let text = "# Title\n- [ ] one\ntext\n  - [x] two 📅 2025-01-02\n";
            let tasks = parse_document("a.md", text, Dialect::Symbols);
            assert_eq!(tasks.len(), 2);
            assert_eq!(tasks[0].line, 2);
            assert_eq!(tasks[1].line, 4);
            assert_eq!(tasks[1].due_date, Some(date("2025-01-02")));
            assert_eq!(tasks[1].id.0, "a.md-L4");
        }
    }
}

pub mod outline {
    //! Parent and child lookup by leading whitespace.

    use crate::buffer::LineBuffer;
    use crate::parser::task_marker;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ParentTask {
        pub line_number: usize,
        pub indent: usize,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChildTask<'a> {
        pub line_number: usize,
        pub status: char,
        pub text: &'a str,
    }

    /// Nearest task line above `line_number` with strictly smaller indentation.
    ///
    /// Headings and blockquotes are walked past; any other non-task line ends the
    /// search. Candidates indented with a different unit (tabs vs. spaces) are skipped.
    pub fn find_parent(buffer: &LineBuffer, line_number: usize) -> Option<ParentTask> {
        let current = buffer.line(line_number)?;
        let indent = current.indent();
        if indent == 0 {
            return None;
        }
        let current_ws = current.indent_text();

        for n in (1..line_number).rev() {
            let Some(candidate) = buffer.line(n) else {
                continue;
            };
            if candidate.is_blank() {
                continue;
            }
            if mismatched_units(current_ws, candidate.indent_text()) {
                continue;
            }
            if candidate.indent() >= indent {
                continue;
            }
            if task_marker(candidate.text).is_some() {
                return Some(ParentTask {
                    line_number: n,
                    indent: candidate.indent(),
                });
            }
            let head = candidate.text.trim_start();
            if head.starts_with('#') || head.starts_with('>') {
                continue;
            }
            break;
        }
        None
    }

    fn mismatched_units(current: &str, candidate: &str) -> bool {
        if current.is_empty() || candidate.is_empty() {
            return false;
        }
        (current.contains(' ') && !candidate.contains(' '))
            || (current.contains('\t') && !candidate.contains('\t'))
    }

    /// Task lines exactly one level below the parent, up to the end of its subtree.
    /// Deeper lines are skipped; the subtree ends at the first non-blank line indented
    /// no deeper than the parent.
    pub fn direct_children(
        buffer: &LineBuffer,
        parent_line: usize,
        parent_indent: usize,
        expected_child_indent: usize,
    ) -> Vec<ChildTask<'_>> {
        let parent_ws = buffer
            .line(parent_line)
            .map(|l| l.indent_text())
            .unwrap_or("");
        let mut out = Vec::new();
        for line in buffer.lines().skip(parent_line) {
            if line.is_blank() {
                continue;
            }
            let indent = line.indent();
            if indent <= parent_indent {
                break;
            }
            if indent != expected_child_indent || !line.text.starts_with(parent_ws) {
                continue;
            }
            if let Some(marker) = task_marker(line.text) {
                out.push(ChildTask {
                    line_number: line.number,
                    status: marker.status,
                    text: line.text,
                });
            }
        }
        out
    }

    pub fn expected_child_indent(
        parent_indent: usize,
        child_indent_text: &str,
        tab_width: usize,
    ) -> usize {
        if child_indent_text.contains('\t') {
            parent_indent + 1
        } else {
            parent_indent + tab_width
        }
    }

}

pub mod completion {
    use crate::buffer::LineBuffer;
    use crate::config::PropagationSettings;
    use crate::core::is_complete_status;
    use crate::outline::ChildTask;
    use crate::transaction::PropagationStage;

    /// Answers whether a task line sits at its workflow's final stage.
    pub trait WorkflowOracle {
        fn is_terminal_stage(&self, line_text: &str, line_number: usize, buffer: &LineBuffer) -> bool;
    }

    impl<F> WorkflowOracle for F
    where
        F: Fn(&str, usize, &LineBuffer) -> bool,
    {
        fn is_terminal_stage(&self, line_text: &str, line_number: usize, buffer: &LineBuffer) -> bool {
            self(line_text, line_number, buffer)
        }
    }

    /// No workflow subsystem: every line is terminal.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NoWorkflow;

    impl WorkflowOracle for NoWorkflow {
        fn is_terminal_stage(&self, _: &str, _: usize, _: &LineBuffer) -> bool {
            true
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Decision {
        Keep,
        SetComplete,
        SetInProgress(char),
    }

    impl Decision {
        /// Status character to write, if any.
        pub fn marker(&self) -> Option<char> {
            match self {
                Decision::Keep => None,
                Decision::SetComplete => Some('x'),
                Decision::SetInProgress(c) => Some(*c),
            }
        }

        pub fn stage(&self) -> Option<PropagationStage> {
            match self {
                Decision::Keep => None,
                Decision::SetComplete => Some(PropagationStage::Done),
                Decision::SetInProgress(_) => Some(PropagationStage::InProgress),
            }
        }
    }

    pub fn child_is_complete<O: WorkflowOracle + ?Sized>(
        child: &ChildTask<'_>,
        settings: &PropagationSettings,
        oracle: &O,
        buffer: &LineBuffer,
    ) -> bool {
        if !is_complete_status(child.status) {
            return false;
        }
        if !settings.workflow_enabled || !settings.workflow_strict_terminal_check {
            return true;
        }
        oracle.is_terminal_stage(child.text, child.line_number, buffer)
    }

    /// New parent status for the given direct children. Rules apply in order; full
    /// completion is checked before partial activity.
    pub fn decide<O: WorkflowOracle + ?Sized>(
        children: &[ChildTask<'_>],
        parent_status: char,
        settings: &PropagationSettings,
        oracle: &O,
        buffer: &LineBuffer,
    ) -> Decision {
        if children.is_empty() {
            return Decision::Keep;
        }
        let all_complete = children
            .iter()
            .all(|c| child_is_complete(c, settings, oracle, buffer));
        let parent_complete = is_complete_status(parent_status);
        let marker = settings.in_progress_marker();

        if all_complete && !parent_complete {
            return Decision::SetComplete;
        }
        if parent_complete
            && !all_complete
            && settings.revert_parent_on_partial_completion
            && parent_status != marker
        {
            return Decision::SetInProgress(marker);
        }
        if parent_status == ' '
            && settings.mark_parent_in_progress_on_partial_activity
            && children.iter().any(|c| c.status != ' ')
            && parent_status != marker
        {
            return Decision::SetInProgress(marker);
        }
        Decision::Keep
    }

}

pub mod interceptor {
    //! Folds parent status updates into the transaction that triggered them.

    use crate::buffer::LineBuffer;
    use crate::completion::{Decision, NoWorkflow, WorkflowOracle, decide};
    use crate::config::PropagationSettings;
    use crate::outline::{direct_children, expected_child_indent, find_parent};
    use crate::parser::task_marker;
    use crate::transaction::{Annotation, Change, Origin, PropagationStage, Transaction};
    use regex::Regex;
    use std::sync::LazyLock;
    use tracing::{debug, warn};

    static FRESH_TASK: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?m)^[ \t]*(?:[-*+]|[0-9]+\.)[ \t]\[ \]").expect("static pattern compiles")
    });

    /// A proposed replacement of the parent's status character. `offset` is in
    /// post-edit coordinates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Amendment {
        pub parent_line: usize,
        pub offset: usize,
        pub len: usize,
        pub marker: char,
        pub stage: PropagationStage,
    }

    /// First line in `after` that gained a fresh `[ ]` task or had its checkbox edited.
    pub fn find_status_change(
        tr: &Transaction,
        before: &LineBuffer,
        after: &LineBuffer,
    ) -> Option<usize> {
        for span in tr.changes().spans() {
            let fresh = FRESH_TASK
                .find_iter(span.inserted)
                .filter_map(|m| after.line_at(span.from_b + m.start()))
                .find(|line| task_marker(line.text).is_some());
            if let Some(line) = fresh {
                return Some(line.number);
            }

            let Some(line) = after.line_at(span.from_b) else {
                continue;
            };
            let Some(marker) = task_marker(line.text) else {
                continue;
            };
            let open = line.from + marker.open_bracket();
            let close = line.from + marker.close_bracket();
            let appended = span.from_a >= before.len();
            let hits_checkbox =
                !span.inserted.is_empty() && open <= span.to_b && close >= span.from_b;
            if appended || hits_checkbox {
                return Some(line.number);
            }
        }
        None
    }

    /// Parent completion propagation over edit transactions.
    #[derive(Debug, Clone)]
    pub struct ParentCompletion<O = NoWorkflow> {
        settings: PropagationSettings,
        oracle: O,
    }

    impl ParentCompletion<NoWorkflow> {
        pub fn new(settings: PropagationSettings) -> Self {
            Self {
                settings,
                oracle: NoWorkflow,
            }
        }
    }

    impl<O: WorkflowOracle> ParentCompletion<O> {
        pub fn with_oracle<P: WorkflowOracle>(self, oracle: P) -> ParentCompletion<P> {
            ParentCompletion {
                settings: self.settings,
                oracle,
            }
        }

        pub fn settings(&self) -> &PropagationSettings {
            &self.settings
        }

        /// The parent status change `tr` calls for, if any. `after` must be `tr`
        /// applied to `before`.
        pub fn propose(
            &self,
            tr: &Transaction,
            before: &LineBuffer,
            after: &LineBuffer,
        ) -> Option<Amendment> {
            let settings = &self.settings;
            if !settings.auto_complete_parent
                || !tr.doc_changed()
                || tr.origin() == Origin::Paste
                || tr.is_self_produced()
            {
                return None;
            }

            let changed = find_status_change(tr, before, after)?;
            let parent = find_parent(after, changed)?;
            let parent_line = after.line(parent.line_number)?;
            let marker = task_marker(parent_line.text)?;
            let child_indent = after.line(changed)?.indent_text();
            let expected = expected_child_indent(parent.indent, child_indent, settings.tab_width);
            let children = direct_children(after, parent.line_number, parent.indent, expected);
            let decision = decide(&children, marker.status, settings, &self.oracle, after);
            debug!(
                target: "taskline::interceptor",
                changed_line = changed,
                parent_line = parent.line_number,
                children = children.len(),
                ?decision,
                "parent completion decision"
            );

            let (new_marker, stage) = match decision {
                Decision::Keep => return None,
                Decision::SetComplete => ('x', PropagationStage::Done),
                Decision::SetInProgress(c) => (c, PropagationStage::InProgress),
            };
            let offset = parent_line.from + marker.status_offset;
            if tr.changes().touches(offset) {
                debug!(
                    target: "taskline::interceptor",
                    offset,
                    "parent status already edited in this transaction"
                );
                return None;
            }
            Some(Amendment {
                parent_line: parent.line_number,
                offset,
                len: marker.status.len_utf8(),
                marker: new_marker,
                stage,
            })
        }

        /// `tr` with the parent status amendment appended, or `tr` unchanged.
        pub fn intercept(
            &self,
            tr: Transaction,
            before: &LineBuffer,
            after: &LineBuffer,
        ) -> Transaction {
            let Some(amendment) = self.propose(&tr, before, after) else {
                return tr;
            };
            let Some(start) = tr.changes().map_to_start(amendment.offset) else {
                debug!(
                    target: "taskline::interceptor",
                    parent_line = amendment.parent_line,
                    "parent line was inserted by this transaction"
                );
                return tr;
            };
            let change = Change::replace(start..start + amendment.len, amendment.marker.to_string());
            match tr.amended(change, Annotation::ParentCompletion(amendment.stage)) {
                Ok(amended) => amended,
                Err(err) => {
                    warn!(target: "taskline::interceptor", error = %err, "dropping parent status amendment");
                    tr
                }
            }
        }
    }

}

pub mod source {
    use crate::core::{Dialect, Task};
    use crate::parser::parse_document;
    use anyhow::{Context, Result};
    use std::{fs, path::Path};

    /// Reads tasks from storage.
    pub trait TaskSource {
        fn parse_file(&self, abs_path: &Path) -> Result<Vec<Task>>;
    }

    #[derive(Debug, Clone, Copy, Default)]
    pub struct MarkdownTaskSource {
        pub dialect: Dialect,
    }

    impl TaskSource for MarkdownTaskSource {
        fn parse_file(&self, abs_path: &Path) -> Result<Vec<Task>> {
            let text =
                fs::read_to_string(abs_path).with_context(|| format!("reading {:?}", abs_path))?;
            Ok(parse_document(
                &abs_path.to_string_lossy(),
                &text,
                self.dialect,
            ))
        }
    }

}

pub use buffer::LineBuffer;
pub use completion::{Decision, NoWorkflow, WorkflowOracle, decide};
pub use config::{PropagationSettings, Settings};
pub use crate::core::{Dialect, Tag, Task, TaskId};
pub use interceptor::{Amendment, ParentCompletion};
pub use parser::{parse_document, parse_task_line};
pub use source::{MarkdownTaskSource, TaskSource};
pub use transaction::{Annotation, Change, ChangeSet, EditError, Origin, PropagationStage, Transaction};
