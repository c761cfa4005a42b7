use crate::errors::{AppError, AppResult};
use crate::normalize::SortSpec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CACHE_DIR_NAME: &str = "todo-vdir";
const CACHE_FILE_NAME: &str = "cache.sqlite3";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "snake_case")]
pub struct Settings {
    /// Directories whose subdirectories are the lists.
    pub paths: Vec<PathBuf>,
    pub cache_path: Option<PathBuf>,
    pub default_list: Option<String>,
    /// Hours from creation until a new todo is due. Zero disables it.
    pub default_due: Option<u32>,
    /// Only show todos that have started by the end of today.
    pub today: bool,
    pub default_sort: Option<String>,
    pub reverse: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            cache_path: None,
            default_list: None,
            default_due: None,
            today: false,
            default_sort: None,
            reverse: true,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = fs::read_to_string(path).map_err(|error| {
            AppError::Config(format!("cannot read {}: {}", path.to_string_lossy(), error))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> AppResult<Self> {
        let mut settings: Settings = serde_yaml::from_str(raw)?;
        settings.paths = settings.paths.iter().map(|path| expand_home(path)).collect();
        settings.cache_path = settings.cache_path.as_deref().map(expand_home);
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> AppResult<()> {
        if self.paths.is_empty() {
            return Err(AppError::Config("\"paths\" must name at least one directory".to_string()));
        }
        if let Some(spec) = self.default_sort.as_deref() {
            SortSpec::parse(spec, self.reverse)
                .map_err(|error| AppError::Config(format!("invalid default_sort: {}", error)))?;
        }
        Ok(())
    }

    /// Where the index lives: `cache_path`, or the user cache directory.
    pub fn resolved_cache_path(&self) -> AppResult<PathBuf> {
        if let Some(path) = &self.cache_path {
            return Ok(path.clone());
        }
        dirs::cache_dir()
            .map(|dir| dir.join(CACHE_DIR_NAME).join(CACHE_FILE_NAME))
            .ok_or_else(|| AppError::Config("no user cache directory; set \"cache_path\"".to_string()))
    }

    pub fn default_due_hours(&self) -> Option<i64> {
        self.default_due.filter(|hours| *hours > 0).map(i64::from)
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let settings = Settings::from_yaml("paths: [/srv/calendars]\n").expect("settings");
        assert_eq!(settings.paths, vec![PathBuf::from("/srv/calendars")]);
        assert!(settings.reverse);
        assert!(!settings.today);
        assert_eq!(settings.default_due_hours(), None);
    }

    #[test]
    fn zero_default_due_means_none() {
        let settings = Settings::from_yaml("paths: [/a]\ndefault_due: 0\n").expect("settings");
        assert_eq!(settings.default_due_hours(), None);
        let settings = Settings::from_yaml("paths: [/a]\ndefault_due: 24\n").expect("settings");
        assert_eq!(settings.default_due_hours(), Some(24));
    }

    #[test]
    fn rejects_unknown_keys_and_missing_paths() {
        let error = Settings::from_yaml("paths: [/a]\ncolour: true\n").expect_err("unknown key");
        assert!(matches!(error, AppError::Config(_)));
        let error = Settings::from_yaml("default_list: work\n").expect_err("no paths");
        assert!(error.to_string().contains("paths"));
    }

    #[test]
    fn rejects_bad_default_sort() {
        let error = Settings::from_yaml("paths: [/a]\ndefault_sort: due,hats\n").expect_err("bad sort");
        assert!(error.to_string().contains("hats"));
    }

    #[test]
    fn explicit_cache_path_wins() {
        let settings = Settings::from_yaml("paths: [/a]\ncache_path: /tmp/todos.db\n").expect("settings");
        assert_eq!(
            settings.resolved_cache_path().expect("cache path"),
            PathBuf::from("/tmp/todos.db")
        );
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        fs::write(&path, "paths:\n  - /a\n  - /b\ndefault_list: work\nreverse: false\n").expect("write");
        let settings = Settings::load(&path).expect("load");
        assert_eq!(settings.paths.len(), 2);
        assert_eq!(settings.default_list.as_deref(), Some("work"));
        assert!(!settings.reverse);

        let missing = Settings::load(&dir.path().join("nope.yaml")).expect_err("missing");
        assert!(matches!(missing, AppError::Config(_)));
    }
}
