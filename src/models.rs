use crate::errors::{AppError, AppResult};
use crate::ical::Property;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Highest `PRIORITY` value; 0 means undefined.
pub const MAX_PRIORITY: u8 = 9;
pub const MAX_PERCENT: u8 = 100;

fn check_priority(value: Option<u8>) -> AppResult<()> {
    match value {
        Some(priority) if priority > MAX_PRIORITY => Err(AppError::InvalidPriority(priority)),
        _ => Ok(()),
    }
}

fn check_percent(value: Option<u8>) -> AppResult<()> {
    match value {
        Some(percent) if percent > MAX_PERCENT => Err(AppError::InvalidPercent(percent)),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TodoStatus {
    #[default]
    NeedsAction,
    InProgress,
    Completed,
    Cancelled,
}

impl TodoStatus {
    /// Value as written in the `STATUS` property.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NeedsAction => "NEEDS-ACTION",
            Self::InProgress => "IN-PROCESS",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "NEEDS-ACTION" => Some(Self::NeedsAction),
            "IN-PROCESS" | "IN-PROGRESS" => Some(Self::InProgress),
            "COMPLETED" => Some(Self::Completed),
            "CANCELLED" | "CANCELED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_closed(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// A date or date-time as found in a file. Comparison across variants goes
/// through [`Timestamp::instant`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Timestamp {
    Date { date: NaiveDate },
    Floating { local: NaiveDateTime },
    Utc { at: DateTime<Utc> },
    Zoned { local: NaiveDateTime, tzid: String },
}

impl Timestamp {
    pub fn now() -> Self {
        Self::from_utc(Utc::now())
    }

    pub fn from_utc(at: DateTime<Utc>) -> Self {
        // Sub-second precision cannot be written back to a file.
        let at = DateTime::from_timestamp(at.timestamp(), 0).unwrap_or(at);
        Self::Utc { at }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum FileState {
    #[default]
    Writable,
    ReadOnly { reason: String },
}

impl FileState {
    pub fn for_record_count(count: usize, filename: &str) -> Self {
        if count > 1 {
            Self::ReadOnly {
                reason: format!("{} todos share {}", count, filename),
            }
        } else {
            Self::Writable
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnly { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Todo {
    pub uid: String,
    pub summary: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub categories: Vec<String>,
    pub priority: Option<u8>,
    pub percent_complete: Option<u8>,
    pub status: TodoStatus,
    pub due: Option<Timestamp>,
    pub start: Option<Timestamp>,
    pub created_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub last_modified: Option<Timestamp>,
    pub dtstamp: Option<Timestamp>,
    /// Properties this crate does not model, written back untouched.
    #[serde(default)]
    pub extra: Vec<Property>,
    #[serde(default)]
    pub list: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub file_state: FileState,
    /// Display index from the query that produced this value.
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(skip)]
    dirty: bool,
}

// Display index and dirtiness are annotations, not part of the record.
impl PartialEq for Todo {
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
            && self.summary == other.summary
            && self.description == other.description
            && self.location == other.location
            && self.categories == other.categories
            && self.priority == other.priority
            && self.percent_complete == other.percent_complete
            && self.status == other.status
            && self.due == other.due
            && self.start == other.start
            && self.created_at == other.created_at
            && self.completed_at == other.completed_at
            && self.last_modified == other.last_modified
            && self.dtstamp == other.dtstamp
            && self.extra == other.extra
            && self.list == other.list
            && self.filename == other.filename
            && self.file_state == other.file_state
    }
}

impl Todo {
    /// An unsaved todo. The uid is allocated and the creation timestamps are
    /// stamped when it is first saved.
    pub fn draft(summary: &str) -> Self {
        Self {
            uid: String::new(),
            summary: summary.to_string(),
            description: None,
            location: None,
            categories: Vec::new(),
            priority: None,
            percent_complete: None,
            status: TodoStatus::NeedsAction,
            due: None,
            start: None,
            created_at: None,
            completed_at: None,
            last_modified: None,
            dtstamp: None,
            extra: Vec::new(),
            list: String::new(),
            filename: String::new(),
            file_state: FileState::Writable,
            index: None,
            dirty: true,
        }
    }

    pub fn is_new(&self) -> bool {
        self.filename.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn is_completed(&self) -> bool {
        self.status == TodoStatus::Completed
    }

    /// Categories sorted and joined, the form used for comparison.
    pub fn categories_key(&self) -> Option<String> {
        if self.categories.is_empty() {
            return None;
        }
        let mut values = self.categories.clone();
        values.sort();
        values.dedup();
        Some(values.join(","))
    }

    /// Rejects values a file could not hold.
    pub fn validate(&self) -> AppResult<()> {
        check_priority(self.priority)?;
        check_percent(self.percent_complete)
    }

    pub fn ensure_writable(&self) -> AppResult<()> {
        match &self.file_state {
            FileState::Writable => Ok(()),
            FileState::ReadOnly { .. } => Err(AppError::RecordReadOnly(format!(
                "{}/{}",
                self.list, self.filename
            ))),
        }
    }

    pub fn mark_done(&mut self) {
        self.status = TodoStatus::Completed;
        self.percent_complete = Some(100);
        if self.completed_at.is_none() {
            self.completed_at = Some(Timestamp::now());
        }
        self.dirty = true;
    }

    pub fn mark_undone(&mut self) {
        self.status = TodoStatus::NeedsAction;
        self.percent_complete = None;
        self.completed_at = None;
        self.dirty = true;
    }

    pub fn cancel(&mut self) {
        self.status = TodoStatus::Cancelled;
        self.dirty = true;
    }

    /// Applies the field changes, returning whether anything differed.
    pub fn apply(&mut self, changes: &TodoChanges) -> bool {
        let before = self.clone();
        let was_dirty = self.dirty;
        if let Some(summary) = &changes.summary {
            self.summary = summary.clone();
        }
        if let Some(description) = &changes.description {
            self.description = description.clone();
        }
        if let Some(location) = &changes.location {
            self.location = location.clone();
        }
        if let Some(categories) = &changes.categories {
            self.categories = categories.clone();
        }
        if let Some(priority) = changes.priority {
            self.priority = priority.filter(|value| *value > 0);
        }
        if let Some(due) = &changes.due {
            self.due = due.clone();
        }
        if let Some(start) = &changes.start {
            self.start = start.clone();
        }
        if let Some(percent) = changes.percent_complete {
            self.percent_complete = percent.map(|value| value.min(MAX_PERCENT));
        }
        match changes.status {
            Some(TodoStatus::Completed) => self.mark_done(),
            Some(TodoStatus::NeedsAction) if self.is_completed() => self.mark_undone(),
            Some(status) => self.status = status,
            // Percent 100 and the completed status move together.
            None if changes.percent_complete.is_some() => match self.percent_complete {
                Some(MAX_PERCENT) if !self.is_completed() => self.mark_done(),
                percent if self.is_completed() && percent != Some(MAX_PERCENT) => {
                    self.mark_undone();
                    self.percent_complete = percent;
                }
                _ => {}
            },
            None => {}
        }

        let changed = *self != before;
        self.dirty = was_dirty || changed;
        changed
    }
}

/// Field edits for [`crate::store::TodoStore::edit`]. The outer `Option`
/// means "leave unchanged"; the inner one clears the field.
#[derive(Debug, Clone, Default)]
pub struct TodoChanges {
    pub summary: Option<String>,
    pub description: Option<Option<String>>,
    pub location: Option<Option<String>>,
    pub categories: Option<Vec<String>>,
    pub priority: Option<Option<u8>>,
    pub percent_complete: Option<Option<u8>>,
    pub status: Option<TodoStatus>,
    pub due: Option<Option<Timestamp>>,
    pub start: Option<Option<Timestamp>>,
    pub list: Option<String>,
}

impl TodoChanges {
    pub fn validate(&self) -> AppResult<()> {
        check_priority(self.priority.flatten())?;
        check_percent(self.percent_complete.flatten())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WarningKind {
    DecodeFailed,
    ReadOnly,
    ListUnreadable,
    DuplicateList,
}

/// A non-fatal condition found while reconciling, attached to the list or
/// file it concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Warning {
    pub kind: WarningKind,
    pub list: String,
    pub filename: Option<String>,
    pub message: String,
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.filename {
            Some(filename) => write!(f, "warning: {}/{}: {}", self.list, filename, self.message),
            None => write!(f, "warning: {}: {}", self.list, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_and_undone_keep_percent_and_status_together() {
        let mut todo = Todo::draft("water plants");
        todo.mark_done();
        assert_eq!(todo.status, TodoStatus::Completed);
        assert_eq!(todo.percent_complete, Some(100));
        assert!(todo.completed_at.is_some());

        todo.mark_undone();
        assert_eq!(todo.status, TodoStatus::NeedsAction);
        assert_eq!(todo.percent_complete, None);
        assert!(todo.completed_at.is_none());
    }

    #[test]
    fn mark_done_keeps_existing_completion_time() {
        let mut todo = Todo::draft("file taxes");
        let earlier = Timestamp::from_utc(Utc::now() - chrono::Duration::days(3));
        todo.completed_at = Some(earlier.clone());
        todo.mark_done();
        assert_eq!(todo.completed_at, Some(earlier));
    }

    #[test]
    fn apply_reports_whether_anything_changed() {
        let mut todo = Todo::draft("call mom");
        todo.mark_clean();
        assert!(!todo.apply(&TodoChanges {
            summary: Some("call mom".to_string()),
            ..TodoChanges::default()
        }));
        assert!(!todo.is_dirty());

        assert!(todo.apply(&TodoChanges {
            priority: Some(Some(0)),
            location: Some(Some("home".to_string())),
            ..TodoChanges::default()
        }));
        assert_eq!(todo.priority, None);
        assert!(todo.is_dirty());
    }

    #[test]
    fn read_only_records_refuse_writes() {
        let mut todo = Todo::draft("shared");
        todo.list = "work".to_string();
        todo.filename = "pair.ics".to_string();
        todo.file_state = FileState::for_record_count(2, "pair.ics");
        let error = todo.ensure_writable().expect_err("read-only");
        assert!(matches!(error, AppError::RecordReadOnly(_)));
        assert!(error.to_string().contains("read-only mode"));
    }

    #[test]
    fn full_percent_completes_and_partial_percent_reopens() {
        let mut todo = Todo::draft("paint fence");
        todo.apply(&TodoChanges {
            percent_complete: Some(Some(100)),
            ..TodoChanges::default()
        });
        assert_eq!(todo.status, TodoStatus::Completed);
        assert!(todo.completed_at.is_some());

        todo.apply(&TodoChanges {
            percent_complete: Some(Some(40)),
            ..TodoChanges::default()
        });
        assert_eq!(todo.status, TodoStatus::NeedsAction);
        assert_eq!(todo.percent_complete, Some(40));
        assert!(todo.completed_at.is_none());
    }

    #[test]
    fn unrelated_edits_leave_completion_alone() {
        let mut todo = Todo::draft("imported");
        todo.status = TodoStatus::Completed;
        todo.apply(&TodoChanges {
            summary: Some("imported, renamed".to_string()),
            ..TodoChanges::default()
        });
        assert_eq!(todo.status, TodoStatus::Completed);
    }

    #[test]
    fn clearing_percent_reopens_a_completed_todo() {
        let mut todo = Todo::draft("sand deck");
        todo.mark_done();
        todo.apply(&TodoChanges {
            percent_complete: Some(None),
            ..TodoChanges::default()
        });
        assert_eq!(todo.status, TodoStatus::NeedsAction);
        assert_eq!(todo.percent_complete, None);
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let mut todo = Todo::draft("x");
        todo.priority = Some(12);
        assert!(matches!(todo.validate(), Err(AppError::InvalidPriority(12))));
        todo.priority = Some(MAX_PRIORITY);
        todo.percent_complete = Some(101);
        assert!(matches!(todo.validate(), Err(AppError::InvalidPercent(101))));

        let changes = TodoChanges {
            priority: Some(Some(10)),
            ..TodoChanges::default()
        };
        assert!(matches!(changes.validate(), Err(AppError::InvalidPriority(10))));
        assert!(TodoChanges::default().validate().is_ok());
    }

    #[test]
    fn categories_key_is_sorted_and_deduplicated() {
        let mut todo = Todo::draft("x");
        assert_eq!(todo.categories_key(), None);
        todo.categories = vec!["work".into(), "home".into(), "work".into()];
        assert_eq!(todo.categories_key().as_deref(), Some("home,work"));
    }
}
