use std::fmt;

/// A parameterized SQL statement.
///
/// The statement uses MySQL syntax: identifiers are quoted with backticks and values are bound
/// to `?` placeholders, in the order of [`params`](Self::params).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    sql: String,
    params: Vec<String>,
}

impl Query {
    /// Starts a `SELECT` of rows from `table`.
    pub fn select(table: &str) -> Select<'_> {
        Select {
            table,
            projection: Projection::Columns(&[]),
            filter: None,
            limit: None,
        }
    }

    /// Starts a `SELECT COUNT(*) AS count` over `table`.
    pub fn count(table: &str) -> Select<'_> {
        Select {
            table,
            projection: Projection::Count,
            filter: None,
            limit: None,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

#[derive(Debug, Clone, Copy)]
enum Projection<'a> {
    /// The given columns, or all of them if empty.
    Columns(&'a [&'a str]),
    Count,
}

/// A builder for `SELECT` [`Query`]s.
#[derive(Debug, Clone, Copy)]
pub struct Select<'a> {
    table: &'a str,
    projection: Projection<'a>,
    filter: Option<(&'a str, &'a str)>,
    limit: Option<u64>,
}

impl<'a> Select<'a> {
    /// Restricts the selected columns. An empty list selects all columns.
    pub fn columns(mut self, columns: &'a [&'a str]) -> Self {
        if let Projection::Columns(_) = self.projection {
            self.projection = Projection::Columns(columns);
        }
        self
    }

    /// Only selects rows where `column` equals `value`.
    pub fn filter(mut self, column: &'a str, value: &'a str) -> Self {
        self.filter = Some((column, value));
        self
    }

    /// Selects at most `limit` rows.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn build(self) -> Query {
        let mut sql = String::from("SELECT ");
        let mut params = Vec::new();

        match self.projection {
            Projection::Columns([]) => sql.push('*'),
            Projection::Columns(columns) => {
                for (i, column) in columns.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(", ");
                    }
                    push_ident(&mut sql, column);
                }
            }
            Projection::Count => sql.push_str("COUNT(*) AS `count`"),
        }

        sql.push_str(" FROM ");
        push_ident(&mut sql, self.table);

        if let Some((column, value)) = self.filter {
            sql.push_str(" WHERE ");
            push_ident(&mut sql, column);
            sql.push_str(" = ?");
            params.push(value.to_owned());
        }

        if let Some(limit) = self.limit {
            sql.push_str(" LIMIT ");
            sql.push_str(&limit.to_string());
        }

        Query { sql, params }
    }
}

/// Appends `ident` quoted with backticks, doubling any backticks it contains.
fn push_ident(sql: &mut String, ident: &str) {
    sql.push('`');
    for c in ident.chars() {
        if c == '`' {
            sql.push('`');
        }
        sql.push(c);
    }
    sql.push('`');
}
