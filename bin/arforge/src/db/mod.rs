//! Database layer.
//!
//! Records go through [`arforge_core::RecordStore`]; the default implementation
//! is [`sqlite::SqliteRecordStore`].

pub mod sqlite;

use arforge_core::PipelineError;

pub(crate) fn storage_error(e: sqlx::Error) -> PipelineError {
    PipelineError::Storage(e.to_string())
}
