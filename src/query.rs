use crate::db::{Bound, Cache, DateBound, DateField, TodoFilter};
use crate::errors::{AppError, AppResult};
use crate::ical::RecordCodec;
use crate::lists::{describe_roots, TodoList};
use crate::models::{Timestamp, Todo, Warning, WarningKind};
use crate::normalize::{next_local_midnight, SortSpec, DEFAULT_SORT};
use crate::reconcile::Reconciler;
use crate::settings::Settings;
use chrono::{DateTime, Duration, Local, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;

const DATE_FILTER_FORMAT: &str = "Format should be '[before|after] [DATE]'";

/// One side of a date range on `due` or `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateFilter {
    pub bound: Bound,
    pub at: DateTime<Utc>,
}

impl DateFilter {
    /// Parses `before`/`after` plus a local date (`YYYY-MM-DD`) or date-time
    /// (`YYYY-MM-DD HH:MM`).
    pub fn parse(direction: &str, date: &str) -> AppResult<Self> {
        let bound = match direction.trim().to_ascii_lowercase().as_str() {
            "before" => Bound::Before,
            "after" => Bound::After,
            _ => return Err(AppError::InvalidDate(DATE_FILTER_FORMAT.to_string())),
        };
        Ok(Self {
            bound,
            at: parse_local_date(date)?,
        })
    }
}

pub fn parse_local_date(raw: &str) -> AppResult<DateTime<Utc>> {
    let raw = raw.trim();
    let timestamp = if let Ok(local) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M") {
        Timestamp::Floating { local }
    } else if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        Timestamp::Date { date }
    } else {
        return Err(AppError::InvalidDate(format!("'{}'; {}", raw, DATE_FILTER_FORMAT)));
    };
    Ok(timestamp.instant())
}

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// List names; empty means all lists.
    pub lists: Vec<String>,
    pub sort: Option<String>,
    pub reverse: Option<bool>,
    pub due: Vec<DateFilter>,
    pub start: Vec<DateFilter>,
    pub due_within_hours: Option<i64>,
    pub priority: Option<u8>,
    pub location: Option<String>,
    pub category: Option<String>,
    pub grep: Option<String>,
    pub include_completed: bool,
    pub today: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct QueryResult {
    pub todos: Vec<Todo>,
    pub warnings: Vec<Warning>,
}

impl QueryResult {
    /// The todo shown under display index `index`.
    pub fn get(&self, index: usize) -> AppResult<&Todo> {
        self.todos
            .iter()
            .find(|todo| todo.index == Some(index))
            .ok_or_else(|| AppError::NotFound(index.to_string()))
    }
}

/// Runs listings against a reconciled cache.
pub struct QueryEngine<'a> {
    settings: &'a Settings,
    cache: &'a Cache,
    lists: &'a [TodoList],
    codec: &'a dyn RecordCodec,
    /// Found while discovering lists; repeated with every result.
    discovery_warnings: &'a [Warning],
}

impl<'a> QueryEngine<'a> {
    pub fn new(
        settings: &'a Settings,
        cache: &'a Cache,
        lists: &'a [TodoList],
        codec: &'a dyn RecordCodec,
        discovery_warnings: &'a [Warning],
    ) -> Self {
        Self {
            settings,
            cache,
            lists,
            codec,
            discovery_warnings,
        }
    }

    pub fn todos(&self, options: &QueryOptions) -> AppResult<QueryResult> {
        // Validate everything the caller supplied before touching the cache.
        for name in &options.lists {
            if !self.lists.iter().any(|list| &list.name == name) {
                return Err(AppError::UnknownList(name.clone()));
            }
        }
        let sort = self.sort_spec(options)?;
        let mut filter = self.filter(options, Local::now());

        let report = Reconciler::new(self.cache, self.codec).run(self.lists)?;
        // Cached rows of a list that cannot be read may be stale.
        filter.exclude_lists = report
            .warnings
            .iter()
            .filter(|warning| warning.kind == WarningKind::ListUnreadable)
            .map(|warning| warning.list.clone())
            .collect();
        if !self.lists.is_empty() && filter.exclude_lists.len() == self.lists.len() {
            return Err(AppError::NoListsFound(describe_roots(&self.settings.paths)));
        }
        let todos = self.cache.query(&filter, &sort, options.include_completed)?;

        let mut warnings = self.discovery_warnings.to_vec();
        warnings.extend(report.warnings);
        Ok(QueryResult { todos, warnings })
    }

    fn sort_spec(&self, options: &QueryOptions) -> AppResult<SortSpec> {
        let spec = options
            .sort
            .as_deref()
            .or(self.settings.default_sort.as_deref())
            .unwrap_or(DEFAULT_SORT);
        SortSpec::parse(spec, options.reverse.unwrap_or(self.settings.reverse))
    }

    fn filter(&self, options: &QueryOptions, now: DateTime<Local>) -> TodoFilter {
        let mut dates: Vec<DateBound> = Vec::new();
        let ranges = [(DateField::Due, &options.due), (DateField::Start, &options.start)];
        for (field, filters) in ranges {
            dates.extend(filters.iter().map(|filter| DateBound {
                field,
                bound: filter.bound,
                at: filter.at,
            }));
        }
        if let Some(hours) = options.due_within_hours {
            dates.push(DateBound {
                field: DateField::Due,
                bound: Bound::Before,
                at: now.with_timezone(&Utc) + Duration::hours(hours),
            });
        }

        let today = options.today || self.settings.today;
        TodoFilter {
            lists: options.lists.clone(),
            exclude_lists: Vec::new(),
            dates,
            startable_before: today.then(|| next_local_midnight(now)),
            priority_at_most: options.priority,
            location: options.location.clone(),
            category: options.category.clone(),
            grep: options.grep.clone(),
        }
    }
}
