//! Docket core: actions, pragmas, capability flags, documents, descriptions,
//! status codes and stats documents shared by every docket crate.

pub mod action;
pub mod clock;
pub mod context;
pub mod document;
pub mod options;
pub mod schema;
pub mod stats;
pub mod status;

pub use action::Action;
pub use clock::{ClockSource, ManualClock, SystemClock};
pub use context::ContextId;
pub use document::{build_kind, Document, DocumentQueryResult, INITIAL_VERSION};
pub use options::{Pragmas, ServiceOptions};
pub use schema::{
    DescriptionError, DocumentDescription, FieldDef, FieldType, ServiceCapabilities,
    ValidationResult,
};
pub use stats::{latency_stat, request_count_stat, ServiceStat, ServiceStats, STATS_SUFFIX};
pub use status::{ServiceErrorResponse, StatusCode};
