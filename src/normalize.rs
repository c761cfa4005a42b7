//! Turns raw field values into comparable index values, and sort
//! specifications into an ordering over those values.
//!
//! All instants are compared in the process local zone. Timestamps carrying
//! a `TZID` are converted, floating times and dates are taken as already
//! local. The index stores the resulting instant as UTC epoch seconds, which
//! orders the same way.

use crate::errors::{AppError, AppResult};
use crate::models::{Timestamp, Todo};
use chrono::{DateTime, Days, Local, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

pub const DEFAULT_SORT: &str = "due,-priority";

impl Timestamp {
    /// The point in time this value denotes.
    pub fn instant(&self) -> DateTime<Utc> {
        match self {
            Self::Date { date } => local_to_utc(&date.and_time(NaiveTime::MIN)),
            Self::Floating { local } => local_to_utc(local),
            Self::Utc { at } => *at,
            Self::Zoned { local, tzid } => match tzid.parse::<Tz>() {
                Ok(zone) => match zone.from_local_datetime(local) {
                    LocalResult::Single(at) => at.with_timezone(&Utc),
                    LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
                    LocalResult::None => local_to_utc(local),
                },
                Err(_) => {
                    tracing::warn!(tzid = %tzid, "unknown TZID; treating time as local");
                    local_to_utc(local)
                }
            },
        }
    }

    pub fn to_local(&self) -> DateTime<Local> {
        self.instant().with_timezone(&Local)
    }

    pub fn same_instant(&self, other: &Timestamp) -> bool {
        self.instant() == other.instant()
    }
}

fn local_to_utc(local: &NaiveDateTime) -> DateTime<Utc> {
    match Local.from_local_datetime(local) {
        LocalResult::Single(at) => at.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        // Inside a DST gap: the wall-clock time never happened locally.
        LocalResult::None => Utc.from_utc_datetime(local),
    }
}

/// Epoch seconds for an optional timestamp; `None` stays absent.
pub fn instant_key(value: Option<&Timestamp>) -> Option<i64> {
    value.map(|timestamp| timestamp.instant().timestamp())
}

/// First instant of the local day after `now`.
pub fn next_local_midnight(now: DateTime<Local>) -> DateTime<Utc> {
    let tomorrow = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .unwrap_or_else(|| now.date_naive());
    local_to_utc(&tomorrow.and_time(NaiveTime::MIN))
}

/// Denormalized, comparable values of one todo, as stored in the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedFields {
    pub due: Option<i64>,
    pub start: Option<i64>,
    pub created_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub last_modified: Option<i64>,
    pub dtstamp: Option<i64>,
    pub priority: Option<i64>,
    pub percent_complete: Option<i64>,
    pub categories: Option<String>,
}

impl IndexedFields {
    pub fn from_todo(todo: &Todo) -> Self {
        Self {
            due: instant_key(todo.due.as_ref()),
            start: instant_key(todo.start.as_ref()),
            created_at: instant_key(todo.created_at.as_ref()),
            completed_at: instant_key(todo.completed_at.as_ref()),
            last_modified: instant_key(todo.last_modified.as_ref()),
            dtstamp: instant_key(todo.dtstamp.as_ref()),
            priority: todo.priority.filter(|value| *value > 0).map(i64::from),
            percent_complete: todo.percent_complete.map(i64::from),
            categories: todo.categories_key(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Id,
    Uid,
    Summary,
    Due,
    Start,
    Priority,
    PercentComplete,
    CreatedAt,
    CompletedAt,
    LastModified,
    Dtstamp,
    Status,
    Description,
    Location,
    Categories,
    List,
}

impl SortField {
    pub const ALL: [SortField; 16] = [
        Self::Id,
        Self::Uid,
        Self::Summary,
        Self::Due,
        Self::Start,
        Self::Priority,
        Self::PercentComplete,
        Self::CreatedAt,
        Self::CompletedAt,
        Self::LastModified,
        Self::Dtstamp,
        Self::Status,
        Self::Description,
        Self::Location,
        Self::Categories,
        Self::List,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Uid => "uid",
            Self::Summary => "summary",
            Self::Due => "due",
            Self::Start => "start",
            Self::Priority => "priority",
            Self::PercentComplete => "percent_complete",
            Self::CreatedAt => "created_at",
            Self::CompletedAt => "completed_at",
            Self::LastModified => "last_modified",
            Self::Dtstamp => "dtstamp",
            Self::Status => "status",
            Self::Description => "description",
            Self::Location => "location",
            Self::Categories => "categories",
            Self::List => "list",
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        Self::ALL
            .into_iter()
            .find(|field| field.as_str() == raw)
            .ok_or_else(|| AppError::UnknownSortField(raw.to_string()))
    }

    /// Column of the `todos` table holding the normalized value.
    pub(crate) fn column(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::Uid => "uid",
            Self::Summary => "summary",
            Self::Due => "due",
            Self::Start => "start",
            Self::Priority => "priority",
            Self::PercentComplete => "percent_complete",
            Self::CreatedAt => "created_at",
            Self::CompletedAt => "completed_at",
            Self::LastModified => "last_modified",
            Self::Dtstamp => "dtstamp",
            Self::Status => "status",
            Self::Description => "description",
            Self::Location => "location",
            Self::Categories => "categories",
            Self::List => "list_name",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    fn flip(self) -> Self {
        match self {
            Self::Ascending => Self::Descending,
            Self::Descending => Self::Ascending,
        }
    }

    fn sql(self) -> &'static str {
        match self {
            Self::Ascending => "ASC",
            Self::Descending => "DESC",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub field: SortField,
    pub direction: Direction,
}

/// An ordered list of sort keys.
///
/// A key written as `field` sorts descending and `-field` ascending; with
/// `reverse` off every key is inverted. Absent values always come last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    keys: Vec<SortKey>,
}

impl SortSpec {
    pub fn parse(spec: &str, reverse: bool) -> AppResult<Self> {
        let names: Vec<&str> = spec
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .collect();
        Self::from_names(&names, reverse)
    }

    pub fn from_names(names: &[&str], reverse: bool) -> AppResult<Self> {
        let mut keys = Vec::with_capacity(names.len());
        for name in names {
            let (field, direction) = match name.strip_prefix('-') {
                Some(rest) => (SortField::parse(rest)?, Direction::Ascending),
                None => (SortField::parse(name)?, Direction::Descending),
            };
            let direction = if reverse { direction } else { direction.flip() };
            keys.push(SortKey { field, direction });
        }
        Ok(Self { keys })
    }

    pub fn keys(&self) -> &[SortKey] {
        &self.keys
    }

    /// `ORDER BY` body over the `todos` table, aliased as `alias`. Ties fall
    /// back to row order.
    pub(crate) fn order_by(&self, alias: &str) -> String {
        let mut terms: Vec<String> = Vec::new();
        for key in &self.keys {
            let column = format!("{}.{}", alias, key.field.column());
            terms.push(format!("{} IS NULL", column));
            terms.push(format!("{} {}", column, key.direction.sql()));
        }
        terms.push(format!("{}.id ASC", alias));
        terms.join(", ")
    }
}
