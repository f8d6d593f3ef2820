//! Helpers for staying under SQLite's bound-parameter limit.

/// Parameters a single statement may bind.
///
/// SQLite builds older than 3.32 cap this at 999; stay under that regardless
/// of the bundled version.
pub const SQLITE_MAX_PARAMS: usize = 999;

/// Rows per multi-row `INSERT` when each row binds `columns` parameters.
pub fn rows_per_insert(columns: usize) -> usize {
    (SQLITE_MAX_PARAMS / columns.max(1)).max(1)
}

/// Chunks `rows` so that each multi-row insert stays under the limit.
pub fn chunk_for_insert<T>(rows: &[T], columns: usize) -> impl Iterator<Item = &[T]> {
    rows.chunks(rows_per_insert(columns))
}
