use crate::errors::{AppError, AppResult};
use crate::models::{Warning, WarningKind};
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

const TODO_EXTENSION: &str = "ics";

/// One directory of todo files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct TodoList {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub filename: String,
    pub mtime: i64,
}

impl TodoList {
    pub fn new(name: &str, path: &Path) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_path_buf(),
        }
    }

    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.path.join(filename)
    }

    /// Todo files currently in the directory, sorted by name.
    pub fn files(&self) -> AppResult<Vec<FileStat>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let path = entry.path();
            if !is_todo_file(&path) {
                continue;
            }
            let Some(filename) = path.file_name().and_then(|value| value.to_str()) else {
                tracing::warn!(path = %path.to_string_lossy(), "skipping file with non UTF-8 name");
                continue;
            };
            match file_mtime(&path) {
                Ok(mtime) => files.push(FileStat {
                    filename: filename.to_string(),
                    mtime,
                }),
                // Removed between listing and stat.
                Err(AppError::Io(error)) => {
                    tracing::debug!(path = %path.to_string_lossy(), error = %error, "file vanished during scan");
                }
                Err(error) => return Err(error),
            }
        }
        files.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(files)
    }
}

fn is_todo_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|value| value.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(true);
    !hidden
        && path.is_file()
        && path
            .extension()
            .and_then(|value| value.to_str())
            .map(|ext| ext.eq_ignore_ascii_case(TODO_EXTENSION))
            .unwrap_or(false)
}

/// Modification time in nanoseconds since the Unix epoch.
pub fn file_mtime(path: &Path) -> AppResult<i64> {
    let modified = fs::metadata(path)?.modified()?;
    let nanos = modified
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or(0);
    Ok(i64::try_from(nanos).unwrap_or(i64::MAX))
}

#[derive(Debug, Default)]
pub struct Discovery {
    pub lists: Vec<TodoList>,
    pub warnings: Vec<Warning>,
}

/// Finds lists: every non-hidden subdirectory of every root. A name already
/// taken by an earlier root is skipped.
pub fn discover(roots: &[PathBuf]) -> Discovery {
    let mut discovery = Discovery::default();
    let mut seen: HashSet<String> = HashSet::new();

    for root in roots {
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!(root = %root.to_string_lossy(), error = %error, "cannot read list root");
                discovery.warnings.push(Warning {
                    kind: WarningKind::ListUnreadable,
                    list: root.to_string_lossy().to_string(),
                    filename: None,
                    message: format!("cannot read directory: {}", error),
                });
                continue;
            }
        };

        let mut found: Vec<TodoList> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .filter_map(|path| {
                let name = path.file_name()?.to_str()?.to_string();
                (!name.starts_with('.')).then(|| TodoList::new(&name, &path))
            })
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));

        for list in found {
            if !seen.insert(list.name.clone()) {
                tracing::warn!(list = %list.name, path = %list.path.to_string_lossy(), "duplicate list name; skipping");
                discovery.warnings.push(Warning {
                    kind: WarningKind::DuplicateList,
                    list: list.name.clone(),
                    filename: None,
                    message: format!("another list is already named {}; ignoring {}", list.name, list.path.to_string_lossy()),
                });
                continue;
            }
            discovery.lists.push(list);
        }
    }

    discovery
}

/// Glob-like description of the roots, used in "no lists" messages.
pub fn describe_roots(roots: &[PathBuf]) -> String {
    roots
        .iter()
        .map(|root| format!("{}/*", root.to_string_lossy().trim_end_matches('/')))
        .collect::<Vec<_>>()
        .join(", ")
}
