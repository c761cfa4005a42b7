use crate::errors::{AppError, AppResult};
use crate::lists::TodoList;
use crate::models::{FileState, Todo};
use crate::normalize::{IndexedFields, SortSpec};
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Bumped whenever the layout of the cache changes. The cache only holds
/// derived data, so a mismatch simply drops every table.
const SCHEMA_VERSION: i64 = 1;

const TODO_COLUMNS: &str = "t.id, t.list_name, t.filename, t.record_json, f.read_only_reason";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateField {
    Due,
    Start,
}

impl DateField {
    fn column(self) -> &'static str {
        match self {
            Self::Due => "t.due",
            Self::Start => "t.start",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Before,
    After,
}

/// `field` strictly before or strictly after `at`. Records without the field
/// never match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateBound {
    pub field: DateField,
    pub bound: Bound,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct TodoFilter {
    /// Empty means every list.
    pub lists: Vec<String>,
    /// Lists whose cached rows are hidden, e.g. because the directory could
    /// not be read.
    pub exclude_lists: Vec<String>,
    pub dates: Vec<DateBound>,
    /// Keep records whose start is absent or earlier than this instant.
    pub startable_before: Option<DateTime<Utc>>,
    pub priority_at_most: Option<u8>,
    pub location: Option<String>,
    pub category: Option<String>,
    /// Case-insensitive substring of summary or description.
    pub grep: Option<String>,
}

impl TodoFilter {
    fn matches_text(&self, todo: &Todo) -> bool {
        if let Some(needle) = self.grep.as_ref().map(|value| value.to_lowercase()) {
            let in_summary = todo.summary.to_lowercase().contains(&needle);
            let in_description = todo
                .description
                .as_ref()
                .map(|value| value.to_lowercase().contains(&needle))
                .unwrap_or(false);
            if !in_summary && !in_description {
                return false;
            }
        }
        if let Some(needle) = self.location.as_ref().map(|value| value.to_lowercase()) {
            let found = todo
                .location
                .as_ref()
                .map(|value| value.to_lowercase().contains(&needle))
                .unwrap_or(false);
            if !found {
                return false;
            }
        }
        if let Some(category) = self.category.as_ref() {
            if !todo
                .categories
                .iter()
                .any(|value| value.eq_ignore_ascii_case(category))
            {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOnlyFile {
    pub list: String,
    pub filename: String,
    pub reason: String,
}

/// SQLite index over the todo files.
#[derive(Debug)]
pub struct Cache {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Cache {
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let cache = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };
        cache.ensure_schema()?;
        Ok(cache)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("cache mutex poisoned".to_string()))
    }

    fn ensure_schema(&self) -> AppResult<()> {
        let conn = self.lock()?;
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version != SCHEMA_VERSION {
            if version != 0 {
                tracing::info!(found = version, expected = SCHEMA_VERSION, "cache schema changed; rebuilding");
            }
            drop_tables(&conn)?;
        }
        conn.execute_batch(SCHEMA_SQL)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    /// Records the configured lists, dropping cached data of lists that are
    /// gone. Returns how many lists were dropped.
    pub fn sync_lists(&self, lists: &[TodoList]) -> AppResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let known: Vec<String> = {
            let mut stmt = tx.prepare("SELECT name FROM lists")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        let current: HashSet<&str> = lists.iter().map(|list| list.name.as_str()).collect();

        let mut dropped = 0;
        for name in known.iter().filter(|name| !current.contains(name.as_str())) {
            tx.execute("DELETE FROM lists WHERE name = ?1", [name])?;
            dropped += 1;
        }
        for list in lists {
            tx.execute(
                "INSERT INTO lists (name, path) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET path = excluded.path",
                params![list.name, list.path.to_string_lossy().to_string()],
            )?;
        }
        tx.commit()?;
        Ok(dropped)
    }

    /// Replaces everything cached for one file.
    pub fn put(&self, list: &TodoList, filename: &str, mtime: i64, records: &[Todo]) -> AppResult<()> {
        let state = FileState::for_record_count(records.len(), filename);
        let read_only_reason = match &state {
            FileState::ReadOnly { reason } => Some(reason.clone()),
            FileState::Writable => None,
        };

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO lists (name, path) VALUES (?1, ?2) ON CONFLICT(name) DO NOTHING",
            params![list.name, list.path.to_string_lossy().to_string()],
        )?;
        tx.execute(
            "DELETE FROM files WHERE list_name = ?1 AND filename = ?2",
            params![list.name, filename],
        )?;
        tx.execute(
            "INSERT INTO files (list_name, filename, mtime, record_count, read_only_reason)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![list.name, filename, mtime, records.len() as i64, read_only_reason],
        )?;

        for (position, todo) in records.iter().enumerate() {
            let fields = IndexedFields::from_todo(todo);
            tx.execute(
                "INSERT INTO todos (
                   list_name, filename, position, uid, summary, description, location, categories,
                   priority, percent_complete, status, due, start, created_at, completed_at,
                   last_modified, dtstamp, record_json
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                params![
                    list.name,
                    filename,
                    position as i64,
                    todo.uid,
                    todo.summary,
                    todo.description,
                    todo.location,
                    fields.categories,
                    fields.priority,
                    fields.percent_complete,
                    todo.status.as_str(),
                    fields.due,
                    fields.start,
                    fields.created_at,
                    fields.completed_at,
                    fields.last_modified,
                    fields.dtstamp,
                    serde_json::to_string(todo)?,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn remove(&self, list_name: &str, filename: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM files WHERE list_name = ?1 AND filename = ?2",
            params![list_name, filename],
        )?;
        Ok(())
    }

    pub fn get_mtime(&self, list_name: &str, filename: &str) -> AppResult<Option<i64>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT mtime FROM files WHERE list_name = ?1 AND filename = ?2",
            params![list_name, filename],
            |row| row.get(0),
        )
        .optional()
        .map_err(AppError::from)
    }

    /// Filename to cached mtime for every file of a list.
    pub fn cached_files(&self, list_name: &str) -> AppResult<HashMap<String, i64>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT filename, mtime FROM files WHERE list_name = ?1")?;
        let rows = stmt.query_map([list_name], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut files = HashMap::new();
        for row in rows {
            let (filename, mtime) = row?;
            files.insert(filename, mtime);
        }
        Ok(files)
    }

    pub fn read_only_files(&self, list_names: &[String]) -> AppResult<Vec<ReadOnlyFile>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT list_name, filename, read_only_reason FROM files
             WHERE read_only_reason IS NOT NULL ORDER BY list_name, filename",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ReadOnlyFile {
                list: row.get(0)?,
                filename: row.get(1)?,
                reason: row.get(2)?,
            })
        })?;

        let mut files = Vec::new();
        for row in rows {
            let file = row?;
            if list_names.is_empty() || list_names.contains(&file.list) {
                files.push(file);
            }
        }
        Ok(files)
    }

    /// Matching todos in `sort` order. Each carries a display index: its rank
    /// by cache row among the matches, starting at 1.
    pub fn query(&self, filter: &TodoFilter, sort: &SortSpec, include_completed: bool) -> AppResult<Vec<Todo>> {
        let mut query = format!(
            "SELECT {} FROM todos t
             JOIN files f ON f.list_name = t.list_name AND f.filename = t.filename
             WHERE 1 = 1",
            TODO_COLUMNS
        );
        let mut values: Vec<Value> = Vec::new();

        if !filter.lists.is_empty() {
            let placeholders = vec!["?"; filter.lists.len()].join(", ");
            query.push_str(&format!(" AND t.list_name IN ({})", placeholders));
            values.extend(filter.lists.iter().cloned().map(Value::Text));
        }
        if !filter.exclude_lists.is_empty() {
            let placeholders = vec!["?"; filter.exclude_lists.len()].join(", ");
            query.push_str(&format!(" AND t.list_name NOT IN ({})", placeholders));
            values.extend(filter.exclude_lists.iter().cloned().map(Value::Text));
        }
        if !include_completed {
            query.push_str(" AND t.status NOT IN ('COMPLETED', 'CANCELLED')");
        }
        for bound in &filter.dates {
            let column = bound.field.column();
            let operator = match bound.bound {
                Bound::Before => "<",
                Bound::After => ">",
            };
            query.push_str(&format!(" AND {} IS NOT NULL AND {} {} ?", column, column, operator));
            values.push(Value::Integer(bound.at.timestamp()));
        }
        if let Some(limit) = filter.startable_before {
            query.push_str(" AND (t.start IS NULL OR t.start < ?)");
            values.push(Value::Integer(limit.timestamp()));
        }
        if let Some(priority) = filter.priority_at_most {
            query.push_str(" AND t.priority IS NOT NULL AND t.priority <= ?");
            values.push(Value::Integer(i64::from(priority)));
        }
        query.push_str(" ORDER BY ");
        query.push_str(&sort.order_by("t"));

        let rows = {
            let conn = self.lock()?;
            let mut statement = conn.prepare(&query)?;
            let rows = statement.query_map(rusqlite::params_from_iter(values), parse_todo_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let matched: Vec<(i64, Todo)> = rows
            .into_iter()
            .filter(|(_, todo)| filter.matches_text(todo))
            .collect();

        let mut row_ids: Vec<i64> = matched.iter().map(|(id, _)| *id).collect();
        row_ids.sort_unstable();
        let ranks: HashMap<i64, usize> = row_ids
            .into_iter()
            .enumerate()
            .map(|(rank, id)| (id, rank + 1))
            .collect();

        Ok(matched
            .into_iter()
            .map(|(id, mut todo)| {
                todo.index = ranks.get(&id).copied();
                todo
            })
            .collect())
    }

    pub fn get_todo(&self, uid: &str) -> AppResult<Option<Todo>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM todos t
                 JOIN files f ON f.list_name = t.list_name AND f.filename = t.filename
                 WHERE t.uid = ?1 ORDER BY t.id LIMIT 1",
                TODO_COLUMNS
            ),
            [uid],
            parse_todo_row,
        )
        .optional()
        .map(|row| row.map(|(_, todo)| todo))
        .map_err(AppError::from)
    }

    /// Forgets everything. The next reconciliation re-reads every file.
    pub fn clear(&self) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute_batch("DELETE FROM todos; DELETE FROM files; DELETE FROM lists;")?;
        Ok(())
    }
}

fn drop_tables(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "DROP TABLE IF EXISTS todos;
         DROP TABLE IF EXISTS files;
         DROP TABLE IF EXISTS lists;",
    )?;
    Ok(())
}

fn parse_todo_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, Todo)> {
    let record_raw: String = row.get(3)?;
    let mut todo: Todo = serde_json::from_str(&record_raw).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(error))
    })?;
    todo.list = row.get(1)?;
    todo.filename = row.get(2)?;
    todo.file_state = match row.get::<_, Option<String>>(4)? {
        Some(reason) => FileState::ReadOnly { reason },
        None => FileState::Writable,
    };
    todo.index = None;
    todo.mark_clean();
    Ok((row.get(0)?, todo))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Timestamp, TodoStatus};
    use chrono::TimeZone;

    fn open(dir: &tempfile::TempDir) -> Cache {
        Cache::open(&dir.path().join("cache.sqlite3")).expect("cache")
    }

    fn todo(uid: &str, summary: &str) -> Todo {
        let mut todo = Todo::draft(summary);
        todo.uid = uid.to_string();
        todo
    }

    fn default_sort() -> SortSpec {
        SortSpec::parse(crate::normalize::DEFAULT_SORT, true).expect("sort")
    }

    #[test]
    fn put_is_idempotent_and_replaces_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = open(&dir);
        let list = TodoList::new("default", dir.path());

        cache.put(&list, "a.ics", 10, &[todo("a", "first")]).expect("put");
        cache.put(&list, "a.ics", 10, &[todo("a", "first")]).expect("put again");
        assert_eq!(cache.query(&TodoFilter::default(), &default_sort(), true).expect("query").len(), 1);

        cache.put(&list, "a.ics", 11, &[todo("a", "renamed")]).expect("replace");
        let todos = cache.query(&TodoFilter::default(), &default_sort(), true).expect("query");
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].summary, "renamed");
        assert_eq!(cache.get_mtime("default", "a.ics").expect("mtime"), Some(11));
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = open(&dir);
        let list = TodoList::new("default", dir.path());
        cache.put(&list, "a.ics", 1, &[todo("a", "x")]).expect("put");

        cache.remove("default", "a.ics").expect("remove");
        cache.remove("default", "a.ics").expect("remove again");
        assert_eq!(cache.get_mtime("default", "a.ics").expect("mtime"), None);
        assert!(cache.get_todo("a").expect("get").is_none());
    }

    #[test]
    fn multi_record_files_are_read_only() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = open(&dir);
        let list = TodoList::new("default", dir.path());
        cache
            .put(&list, "pair.ics", 1, &[todo("a", "a"), todo("b", "b")])
            .expect("put");

        let todos = cache.query(&TodoFilter::default(), &default_sort(), true).expect("query");
        assert_eq!(todos.len(), 2);
        assert!(todos.iter().all(|todo| todo.file_state.is_read_only()));
        let flagged = cache.read_only_files(&[]).expect("read-only files");
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].filename, "pair.ics");
    }

    #[test]
    fn display_index_is_contiguous_over_the_filtered_result() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = open(&dir);
        let list = TodoList::new("default", dir.path());
        let mut done = todo("done", "aaa");
        done.status = TodoStatus::Completed;
        cache.put(&list, "done.ics", 1, &[done]).expect("put");
        cache.put(&list, "open.ics", 1, &[todo("open", "bbb")]).expect("put");
        cache.put(&list, "other.ics", 1, &[todo("other", "ccc")]).expect("put");

        let todos = cache.query(&TodoFilter::default(), &default_sort(), false).expect("query");
        let mut indices: Vec<_> = todos.iter().filter_map(|todo| todo.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![1, 2]);

        let all = cache.query(&TodoFilter::default(), &default_sort(), true).expect("query");
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn absent_values_sort_last_in_both_directions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = open(&dir);
        let list = TodoList::new("default", dir.path());
        let mut early = todo("early", "early");
        early.due = Some(Timestamp::from_utc(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()));
        let mut late = todo("late", "late");
        late.due = Some(Timestamp::from_utc(Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap()));
        cache.put(&list, "none.ics", 1, &[todo("none", "none")]).expect("put");
        cache.put(&list, "early.ics", 1, &[early]).expect("put");
        cache.put(&list, "late.ics", 1, &[late]).expect("put");

        for (spec, expected) in [("due", ["late", "early", "none"]), ("-due", ["early", "late", "none"])] {
            let sort = SortSpec::parse(spec, true).expect("sort");
            let todos = cache.query(&TodoFilter::default(), &sort, true).expect("query");
            let order: Vec<_> = todos.iter().map(|todo| todo.uid.as_str()).collect();
            assert_eq!(order, expected, "sort {}", spec);
        }
    }

    #[test]
    fn filters_by_list_dates_priority_and_text() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = open(&dir);
        let home = TodoList::new("home", &dir.path().join("home"));
        let work = TodoList::new("work", &dir.path().join("work"));

        let mut report = todo("report", "Quarterly REPORT");
        report.priority = Some(1);
        report.due = Some(Timestamp::from_utc(Utc.with_ymd_and_hms(2030, 5, 1, 12, 0, 0).unwrap()));
        report.categories = vec!["Office".to_string()];
        let mut dishes = todo("dishes", "dishes");
        dishes.description = Some("use the green sponge".to_string());
        dishes.location = Some("Kitchen".to_string());
        cache.put(&work, "report.ics", 1, &[report]).expect("put");
        cache.put(&home, "dishes.ics", 1, &[dishes]).expect("put");

        let uids = |filter: &TodoFilter| -> Vec<String> {
            cache
                .query(filter, &default_sort(), true)
                .expect("query")
                .into_iter()
                .map(|todo| todo.uid)
                .collect()
        };

        assert_eq!(uids(&TodoFilter { lists: vec!["home".into()], ..TodoFilter::default() }), vec!["dishes"]);
        assert_eq!(uids(&TodoFilter { exclude_lists: vec!["home".into()], ..TodoFilter::default() }), vec!["report"]);
        assert_eq!(uids(&TodoFilter { grep: Some("report".into()), ..TodoFilter::default() }), vec!["report"]);
        assert_eq!(uids(&TodoFilter { grep: Some("GREEN".into()), ..TodoFilter::default() }), vec!["dishes"]);
        assert_eq!(uids(&TodoFilter { priority_at_most: Some(5), ..TodoFilter::default() }), vec!["report"]);
        assert_eq!(uids(&TodoFilter { location: Some("kitchen".into()), ..TodoFilter::default() }), vec!["dishes"]);
        assert_eq!(uids(&TodoFilter { category: Some("office".into()), ..TodoFilter::default() }), vec!["report"]);

        let before = DateBound {
            field: DateField::Due,
            bound: Bound::Before,
            at: Utc.with_ymd_and_hms(2031, 1, 1, 0, 0, 0).unwrap(),
        };
        assert_eq!(uids(&TodoFilter { dates: vec![before], ..TodoFilter::default() }), vec!["report"]);
        let after = DateBound { bound: Bound::After, ..before };
        assert!(uids(&TodoFilter { dates: vec![after], ..TodoFilter::default() }).is_empty());
    }

    #[test]
    fn dropping_a_list_cascades_to_its_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = open(&dir);
        let home = TodoList::new("home", &dir.path().join("home"));
        let work = TodoList::new("work", &dir.path().join("work"));
        cache.put(&home, "a.ics", 1, &[todo("a", "a")]).expect("put");
        cache.put(&work, "b.ics", 1, &[todo("b", "b")]).expect("put");

        let dropped = cache.sync_lists(&[work]).expect("sync lists");
        assert_eq!(dropped, 1);
        assert_eq!(cache.get_mtime("home", "a.ics").expect("mtime"), None);
        assert!(cache.get_todo("b").expect("get").is_some());
    }

    #[test]
    fn reopening_keeps_data_and_clear_empties_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let list = TodoList::new("default", dir.path());
        {
            let cache = open(&dir);
            cache.put(&list, "a.ics", 42, &[todo("a", "x")]).expect("put");
        }
        let cache = open(&dir);
        assert_eq!(cache.get_mtime("default", "a.ics").expect("mtime"), Some(42));
        cache.clear().expect("clear");
        assert_eq!(cache.get_mtime("default", "a.ics").expect("mtime"), None);
    }

    #[test]
    fn schema_version_mismatch_rebuilds_the_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cache.sqlite3");
        {
            let conn = Connection::open(&path).expect("conn");
            conn.execute_batch("CREATE TABLE todos (legacy TEXT); PRAGMA user_version = 99;")
                .expect("legacy schema");
        }
        let cache = Cache::open(&path).expect("cache");
        let list = TodoList::new("default", dir.path());
        cache.put(&list, "a.ics", 1, &[todo("a", "x")]).expect("put on rebuilt schema");
    }
}
