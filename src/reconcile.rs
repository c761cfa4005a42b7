//! Brings the cache in line with the list directories.
//!
//! A file is decoded again only when its mtime differs from the cached one,
//! so a pass over an unchanged collection touches nothing but directory
//! listings.

use crate::db::Cache;
use crate::errors::AppResult;
use crate::ical::RecordCodec;
use crate::lists::{FileStat, TodoList};
use crate::models::{Todo, Warning, WarningKind};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ReconcileReport {
    /// Todo files seen on disk.
    pub scanned: usize,
    /// Files read and decoded in this pass.
    pub decoded: usize,
    /// Cache entries dropped because their file is gone or undecodable.
    pub removed: usize,
    pub warnings: Vec<Warning>,
}

pub struct Reconciler<'a> {
    cache: &'a Cache,
    codec: &'a dyn RecordCodec,
}

impl<'a> Reconciler<'a> {
    pub fn new(cache: &'a Cache, codec: &'a dyn RecordCodec) -> Self {
        Self { cache, codec }
    }

    pub fn run(&self, lists: &[TodoList]) -> AppResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let dropped = self.cache.sync_lists(lists)?;
        if dropped > 0 {
            tracing::info!(dropped, "dropped cached lists that are no longer configured");
        }

        for list in lists {
            self.reconcile_list(list, &mut report)?;
        }

        let names: Vec<String> = lists.iter().map(|list| list.name.clone()).collect();
        for file in self.cache.read_only_files(&names)? {
            report.warnings.push(Warning {
                kind: WarningKind::ReadOnly,
                list: file.list,
                filename: Some(file.filename),
                message: format!("{}; todos in this file are read-only", file.reason),
            });
        }

        tracing::debug!(
            scanned = report.scanned,
            decoded = report.decoded,
            removed = report.removed,
            warnings = report.warnings.len(),
            "reconciled collection"
        );
        Ok(report)
    }

    fn reconcile_list(&self, list: &TodoList, report: &mut ReconcileReport) -> AppResult<()> {
        let files = match list.files() {
            Ok(files) => files,
            Err(error) => {
                tracing::warn!(list = %list.name, path = %list.path.to_string_lossy(), error = %error, "cannot read list");
                report.warnings.push(Warning {
                    kind: WarningKind::ListUnreadable,
                    list: list.name.clone(),
                    filename: None,
                    message: format!("{}; its todos are left out of this listing", error),
                });
                return Ok(());
            }
        };
        let cached = self.cache.cached_files(&list.name)?;
        let mut present: HashSet<&str> = HashSet::new();

        for stat in &files {
            report.scanned += 1;
            present.insert(stat.filename.as_str());
            if cached.get(&stat.filename) == Some(&stat.mtime) {
                continue;
            }

            report.decoded += 1;
            match self.load(list, stat) {
                Ok(records) => self.cache.put(list, &stat.filename, stat.mtime, &records)?,
                Err(error) => {
                    tracing::warn!(list = %list.name, file = %stat.filename, error = %error, "cannot decode todo file");
                    report.warnings.push(Warning {
                        kind: WarningKind::DecodeFailed,
                        list: list.name.clone(),
                        filename: Some(stat.filename.clone()),
                        message: error.to_string(),
                    });
                    if cached.contains_key(&stat.filename) {
                        self.cache.remove(&list.name, &stat.filename)?;
                        report.removed += 1;
                    }
                }
            }
        }

        for filename in cached.keys().filter(|name| !present.contains(name.as_str())) {
            self.cache.remove(&list.name, filename)?;
            report.removed += 1;
        }
        Ok(())
    }

    fn load(&self, list: &TodoList, stat: &FileStat) -> AppResult<Vec<Todo>> {
        let bytes = fs::read(list.file_path(&stat.filename))?;
        let mut records = self.codec.decode(&bytes)?;
        for todo in records.iter_mut().filter(|todo| todo.uid.is_empty()) {
            todo.uid = uid_from_filename(&stat.filename);
        }
        Ok(records)
    }
}

/// Stand-in uid for records written without one.
pub(crate) fn uid_from_filename(filename: &str) -> String {
    Path::new(filename)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(filename)
        .to_string()
}
