//! A todo collection stored as iCalendar files, one directory per list, with
//! a SQLite index that is reconciled against the files before every listing.

pub mod collection;
pub mod db;
pub mod errors;
pub mod ical;
pub mod lists;
pub mod logging;
pub mod models;
pub mod normalize;
pub mod query;
pub mod reconcile;
pub mod settings;
pub mod store;

pub use crate::collection::Collection;
pub use crate::db::{Bound, Cache, DateBound, DateField, TodoFilter};
pub use crate::errors::{AppError, AppResult};
pub use crate::ical::{IcalCodec, RecordCodec};
pub use crate::lists::TodoList;
pub use crate::models::{FileState, Timestamp, Todo, TodoChanges, TodoStatus, Warning, WarningKind};
pub use crate::normalize::{SortField, SortSpec, DEFAULT_SORT};
pub use crate::query::{DateFilter, QueryEngine, QueryOptions, QueryResult};
pub use crate::reconcile::{ReconcileReport, Reconciler};
pub use crate::settings::Settings;
pub use crate::store::TodoStore;
