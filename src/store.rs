//! Writes todos back to their files, keeping the cache in step.
//!
//! Disk comes first: the cache is only updated once the file operation it
//! mirrors has succeeded, so a failure leaves the cache describing what is
//! actually on disk.

use crate::db::Cache;
use crate::errors::{AppError, AppResult};
use crate::ical::RecordCodec;
use crate::lists::{file_mtime, TodoList};
use crate::models::{FileState, Timestamp, Todo, TodoChanges};
use crate::reconcile::uid_from_filename;
use crate::settings::Settings;
use chrono::Duration;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use uuid::Uuid;

pub struct TodoStore<'a> {
    settings: &'a Settings,
    cache: &'a Cache,
    lists: &'a [TodoList],
    codec: &'a dyn RecordCodec,
}

impl<'a> TodoStore<'a> {
    pub fn new(settings: &'a Settings, cache: &'a Cache, lists: &'a [TodoList], codec: &'a dyn RecordCodec) -> Self {
        Self {
            settings,
            cache,
            lists,
            codec,
        }
    }

    /// Saves a new todo into `list`, or the configured default list.
    pub fn create(&self, draft: Todo, list: Option<&str>) -> AppResult<Todo> {
        if draft.summary.trim().is_empty() {
            return Err(AppError::MissingSummary);
        }
        draft.validate()?;
        let name = list
            .or(self.settings.default_list.as_deref())
            .ok_or(AppError::AmbiguousDefaultList)?;
        let target = self.resolve_list(name)?;

        let mut todo = draft;
        let now = Timestamp::now();
        if todo.created_at.is_none() {
            todo.created_at = Some(now.clone());
        }
        if todo.due.is_none() {
            if let (Some(hours), Some(created)) = (self.settings.default_due_hours(), todo.created_at.as_ref()) {
                todo.due = Some(Timestamp::from_utc(created.instant() + Duration::hours(hours)));
            }
        }
        self.insert(todo, target)
    }

    /// Writes in-memory changes of an existing todo. Clean todos are left
    /// alone. `DTSTAMP` keeps the value from the first save.
    pub fn save(&self, todo: &mut Todo) -> AppResult<()> {
        if todo.is_new() {
            return Err(AppError::Internal("todo has never been saved; create it first".to_string()));
        }
        if !todo.is_dirty() {
            return Ok(());
        }
        todo.ensure_writable()?;
        todo.validate()?;
        let list = self.resolve_list(&todo.list)?;

        let now = Timestamp::now();
        if todo.dtstamp.is_none() {
            todo.dtstamp = Some(now.clone());
        }
        todo.last_modified = Some(now);
        let mtime = self.write_record(list, &todo.filename, todo, false)?;
        todo.mark_clean();
        self.cache.put(list, &todo.filename, mtime, std::slice::from_ref(&*todo))?;
        tracing::debug!(list = %list.name, file = %todo.filename, "saved todo");
        Ok(())
    }

    /// Applies `changes` and persists them, moving the file when the list
    /// changes. Returns whether anything changed.
    pub fn edit(&self, todo: &mut Todo, changes: &TodoChanges) -> AppResult<bool> {
        todo.ensure_writable()?;
        if matches!(changes.summary.as_deref(), Some(summary) if summary.trim().is_empty()) {
            return Err(AppError::MissingSummary);
        }
        changes.validate()?;
        let target = match changes.list.as_deref() {
            Some(name) if name != todo.list => Some(self.resolve_list(name)?),
            _ => None,
        };

        let changed = todo.apply(changes);
        if let Some(target) = target {
            self.move_to(todo, &target.name)?;
        }
        self.save(todo)?;
        Ok(changed || target.is_some())
    }

    pub fn delete(&self, todo: &Todo) -> AppResult<()> {
        todo.ensure_writable()?;
        if todo.is_new() {
            return Err(AppError::NotFound(todo.uid.clone()));
        }
        let list = self.resolve_list(&todo.list)?;
        match fs::remove_file(list.file_path(&todo.filename)) {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {
                tracing::debug!(list = %list.name, file = %todo.filename, "file already gone");
            }
            Err(error) => return Err(error.into()),
        }
        self.cache.remove(&list.name, &todo.filename)?;
        tracing::info!(list = %list.name, file = %todo.filename, uid = %todo.uid, "deleted todo");
        Ok(())
    }

    pub fn mark_done(&self, todo: &mut Todo) -> AppResult<()> {
        todo.ensure_writable()?;
        todo.mark_done();
        self.save(todo)
    }

    pub fn mark_undone(&self, todo: &mut Todo) -> AppResult<()> {
        todo.ensure_writable()?;
        todo.mark_undone();
        self.save(todo)
    }

    pub fn cancel(&self, todo: &mut Todo) -> AppResult<()> {
        todo.ensure_writable()?;
        todo.cancel();
        self.save(todo)
    }

    /// Duplicates `todo` into `target` under a fresh uid. The source is not
    /// touched, so read-only todos can be copied.
    pub fn copy(&self, todo: &Todo, target: &str) -> AppResult<Todo> {
        let target = self.resolve_list(target)?;
        let mut duplicate = todo.clone();
        duplicate.uid = String::new();
        duplicate.filename = String::new();
        duplicate.file_state = FileState::Writable;
        duplicate.index = None;
        self.insert(duplicate, target)
    }

    /// Moves the file holding `todo` into `target`.
    pub fn move_to(&self, todo: &mut Todo, target: &str) -> AppResult<()> {
        todo.ensure_writable()?;
        if todo.is_new() {
            return Err(AppError::NotFound(todo.uid.clone()));
        }
        let source = self.resolve_list(&todo.list)?;
        let target = self.resolve_list(target)?;
        if source.name == target.name {
            return Ok(());
        }

        let from = source.file_path(&todo.filename);
        let to = target.file_path(&todo.filename);
        if to.exists() {
            return Err(AppError::Io(format!(
                "{} already exists in list {}",
                todo.filename, target.name
            )));
        }
        if let Err(error) = fs::rename(&from, &to) {
            tracing::debug!(from = %from.to_string_lossy(), to = %to.to_string_lossy(), error = %error, "rename failed; copying instead");
            self.copy_verified(&from, &to, &todo.uid)?;
            fs::remove_file(&from)?;
        }

        // Index what is on disk; unsaved edits stay in memory until `save`.
        let mtime = file_mtime(&to)?;
        let mut records = self.codec.decode(&fs::read(&to)?)?;
        for record in records.iter_mut().filter(|record| record.uid.is_empty()) {
            record.uid = uid_from_filename(&todo.filename);
        }
        self.cache.remove(&source.name, &todo.filename)?;
        self.cache.put(target, &todo.filename, mtime, &records)?;
        todo.list = target.name.clone();
        tracing::info!(from = %source.name, to = %target.name, file = %todo.filename, "moved todo");
        Ok(())
    }

    fn insert(&self, mut todo: Todo, target: &TodoList) -> AppResult<Todo> {
        if todo.uid.is_empty() {
            todo.uid = Uuid::new_v4().to_string();
        }
        let now = Timestamp::now();
        if todo.created_at.is_none() {
            todo.created_at = Some(now.clone());
        }
        todo.last_modified = Some(now.clone());
        todo.dtstamp = Some(now);
        todo.list = target.name.clone();
        todo.filename = format!("{}.ics", todo.uid);
        todo.file_state = FileState::Writable;

        let mtime = self.write_record(target, &todo.filename, &todo, true)?;
        todo.mark_clean();
        self.cache.put(target, &todo.filename, mtime, std::slice::from_ref(&todo))?;
        tracing::info!(list = %target.name, file = %todo.filename, "created todo");
        Ok(todo)
    }

    /// Writes through a hidden temporary file so readers never see half a
    /// record. Returns the new mtime.
    fn write_record(&self, list: &TodoList, filename: &str, todo: &Todo, create: bool) -> AppResult<i64> {
        let path = list.file_path(filename);
        if create && path.exists() {
            return Err(AppError::Io(format!("{} already exists in list {}", filename, list.name)));
        }
        let bytes = self.codec.encode(todo)?;
        let temp = list.file_path(&format!(".{}.tmp", filename));
        fs::write(&temp, bytes)?;
        if let Err(error) = fs::rename(&temp, &path) {
            let _ = fs::remove_file(&temp);
            return Err(error.into());
        }
        file_mtime(&path)
    }

    fn copy_verified(&self, from: &Path, to: &Path, uid: &str) -> AppResult<()> {
        let bytes = fs::read(from)?;
        fs::write(to, &bytes)?;
        let written = fs::read(to)?;
        let intact = written == bytes
            && self
                .codec
                .decode(&written)
                .map(|records| records.iter().any(|record| record.uid == uid))
                .unwrap_or(false);
        if !intact {
            let _ = fs::remove_file(to);
            return Err(AppError::Io(format!(
                "copy of {} did not read back intact",
                from.to_string_lossy()
            )));
        }
        Ok(())
    }

    fn resolve_list(&self, name: &str) -> AppResult<&'a TodoList> {
        self.lists
            .iter()
            .find(|list| list.name == name)
            .ok_or_else(|| AppError::UnknownList(name.to_string()))
    }
}
