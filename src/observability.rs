//! Structured logging for merge tasks.
//!
//! All events go through `tracing` with target [`MERGE_TARGET`] and carry an
//! `event` field (snake_case) plus a `component` field naming the subsystem
//! (`merge_task`, `merge_engine`, `merge_apply`, `mem_catalog`). The crate never
//! installs a subscriber; embedding applications decide where events go.

/// Target for all merge log events.
pub(crate) const MERGE_TARGET: &str = "tonbo_merge";

/// Info-level event.
///
/// ```ignore
/// log_info!(
///     component = "merge_task",
///     event = "merge_done",
///     task = %task.name(),
///     created = created.len(),
/// );
/// ```
macro_rules! log_info {
    ($($field:tt)*) => {
        ::tracing::info!(target: $crate::observability::MERGE_TARGET, $($field)*)
    };
}

/// Debug-level event.
macro_rules! log_debug {
    ($($field:tt)*) => {
        ::tracing::debug!(target: $crate::observability::MERGE_TARGET, $($field)*)
    };
}

/// Warn-level event.
macro_rules! log_warn {
    ($($field:tt)*) => {
        ::tracing::warn!(target: $crate::observability::MERGE_TARGET, $($field)*)
    };
}

/// Error-level event.
macro_rules! log_error {
    ($($field:tt)*) => {
        ::tracing::error!(target: $crate::observability::MERGE_TARGET, $($field)*)
    };
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
