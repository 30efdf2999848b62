use std::fmt::{self, Write};

/// The separator between the segments of a cache key.
const SEPARATOR: char = ':';

/// A builder for colon-delimited cache keys.
///
/// Every key starts with the table it describes, followed by the segments describing the query,
/// for example `users:id:42` or `users:count:team_id:7`. Segments are not escaped, so distinct
/// queries whose segments contain colons may end up with the same key.
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    key: String,
}

impl CacheKeyBuilder {
    /// Starts a key for rows of `table`.
    pub fn new(table: &str) -> Self {
        Self {
            key: table.to_owned(),
        }
    }

    /// Appends a segment.
    pub fn segment(mut self, segment: impl fmt::Display) -> Self {
        // writing into a `String` cannot fail
        write!(self.key, "{SEPARATOR}{segment}").ok();
        self
    }

    /// Finalize the key.
    pub fn build(self) -> String {
        self.key
    }
}

/// Key of a single row looked up by `column`.
pub fn row_key(table: &str, column: &str, value: &str) -> String {
    CacheKeyBuilder::new(table)
        .segment(column)
        .segment(value)
        .build()
}

/// Key of the number of rows matching `column`.
pub fn count_key(table: &str, column: &str, value: &str) -> String {
    CacheKeyBuilder::new(table)
        .segment("count")
        .segment(column)
        .segment(value)
        .build()
}

/// Key of all rows of `table`.
pub fn all_key(table: &str) -> String {
    CacheKeyBuilder::new(table).segment("all").build()
}

/// Key of the rows matching `column`, optionally limited.
pub fn list_key(table: &str, column: &str, value: &str, limit: Option<u64>) -> String {
    let builder = CacheKeyBuilder::new(table)
        .segment("list")
        .segment(column)
        .segment(value);
    match limit {
        Some(limit) => builder.segment("limit").segment(limit).build(),
        None => builder.build(),
    }
}
