//! Entry point tying settings, discovered lists, the cache and the codec
//! together.

use crate::db::Cache;
use crate::errors::{AppError, AppResult};
use crate::ical::{IcalCodec, RecordCodec};
use crate::lists::{describe_roots, discover, TodoList};
use crate::models::Warning;
use crate::query::{QueryEngine, QueryOptions, QueryResult};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::settings::Settings;
use crate::store::TodoStore;
use std::path::Path;

/// An open collection. The cache connection lives as long as this value.
pub struct Collection {
    settings: Settings,
    lists: Vec<TodoList>,
    cache: Cache,
    codec: Box<dyn RecordCodec>,
    discovery_warnings: Vec<Warning>,
}

impl Collection {
    pub fn open(settings: Settings) -> AppResult<Self> {
        Self::open_with_codec(settings, Box::new(IcalCodec))
    }

    pub fn open_with_codec(settings: Settings, codec: Box<dyn RecordCodec>) -> AppResult<Self> {
        let discovery = discover(&settings.paths);
        if discovery.lists.is_empty() {
            return Err(AppError::NoListsFound(describe_roots(&settings.paths)));
        }
        let cache = Cache::open(&settings.resolved_cache_path()?)?;
        tracing::info!(
            lists = discovery.lists.len(),
            cache = %cache.path().to_string_lossy(),
            "opened collection"
        );
        Ok(Self {
            settings,
            lists: discovery.lists,
            cache,
            codec,
            discovery_warnings: discovery.warnings,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn lists(&self) -> &[TodoList] {
        &self.lists
    }

    pub fn list(&self, name: &str) -> AppResult<&TodoList> {
        self.lists
            .iter()
            .find(|list| list.name == name)
            .ok_or_else(|| AppError::UnknownList(name.to_string()))
    }

    pub fn cache_path(&self) -> &Path {
        self.cache.path()
    }

    pub fn query(&self) -> QueryEngine<'_> {
        QueryEngine::new(
            &self.settings,
            &self.cache,
            &self.lists,
            self.codec.as_ref(),
            &self.discovery_warnings,
        )
    }

    pub fn todos(&self, options: &QueryOptions) -> AppResult<QueryResult> {
        self.query().todos(options)
    }

    pub fn store(&self) -> TodoStore<'_> {
        TodoStore::new(&self.settings, &self.cache, &self.lists, self.codec.as_ref())
    }

    pub fn reconcile(&self) -> AppResult<ReconcileReport> {
        Reconciler::new(&self.cache, self.codec.as_ref()).run(&self.lists)
    }

    /// Empties the cache; the next listing rebuilds it from the files.
    pub fn flush(&self) -> AppResult<()> {
        self.cache.clear()?;
        tracing::info!(cache = %self.cache.path().to_string_lossy(), "flushed cache");
        Ok(())
    }
}
