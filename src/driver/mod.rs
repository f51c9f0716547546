//! Uniform record-set interface over the SQL drivers. The store composes
//! plain SQL text; drivers hand results back as rows of text columns, and
//! all numeric conversion happens on the caller's side.

use std::ops::ControlFlow;

use crate::error::{Result, StoreError};

pub mod mem;
#[cfg(feature = "postgres")]
pub mod pg;

/// One live database session. Connections are owned by the pool and are not
/// shared between threads concurrently.
pub trait DbConnection: Send {
    /// Executes one SQL statement, returning the full result set.
    fn exec(&mut self, sql: &str) -> Result<Recordset>;

    /// Whether the session is still usable.
    fn connected(&mut self) -> bool;
}

/// Opens a connection for the given URI. `postgres://…` (or a leading `/`)
/// selects the PostgreSQL driver, `mem://…` the in-memory engine.
pub fn connect(uri: &str) -> Result<Box<dyn DbConnection>> {
    if let Some(rest) = uri.strip_prefix("mem://") {
        return Ok(Box::new(mem::MemConnection::open(rest)));
    }
    if uri.starts_with("postgres") || uri.starts_with('/') {
        #[cfg(feature = "postgres")]
        {
            let normalized = if uri.starts_with('/') {
                format!("postgres://{uri}")
            } else {
                uri.to_string()
            };
            return Ok(Box::new(pg::PgConnection::open(&normalized)?));
        }
        #[cfg(not(feature = "postgres"))]
        return Err(StoreError::Unsupported(
            "built without the postgres feature",
        ));
    }
    if uri.starts_with("odbc://") {
        return Err(StoreError::Unsupported("no ODBC bindings are linked"));
    }
    Err(StoreError::Connect(format!("unknown database URI: {uri}")))
}

/// A fully materialized query result: column names plus rows of optional
/// text values (`None` encodes SQL NULL).
#[derive(Debug, Default, Clone)]
pub struct Recordset {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl Recordset {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        Self { columns, rows }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn first(&self) -> Option<RecordRow<'_>> {
        (!self.rows.is_empty()).then_some(RecordRow { set: self, index: 0 })
    }

    pub fn iter(&self) -> impl Iterator<Item = RecordRow<'_>> {
        (0..self.rows.len()).map(move |index| RecordRow { set: self, index })
    }

    /// Visits each row until the callback breaks.
    pub fn for_each_row<F>(&self, mut f: F)
    where
        F: FnMut(RecordRow<'_>) -> ControlFlow<()>,
    {
        for index in 0..self.rows.len() {
            if f(RecordRow { set: self, index }).is_break() {
                break;
            }
        }
    }
}

/// Borrowed view of one row.
#[derive(Debug, Clone, Copy)]
pub struct RecordRow<'a> {
    set: &'a Recordset,
    index: usize,
}

impl<'a> RecordRow<'a> {
    /// The text value of a column; `None` when NULL or not selected.
    pub fn get(&self, column: &str) -> Option<&'a str> {
        let pos = self.set.columns.iter().position(|c| c == column)?;
        self.set.rows[self.index][pos].as_deref()
    }

    /// Visits each (column, value) pair until the callback breaks.
    pub fn for_each_column<F>(&self, mut f: F)
    where
        F: FnMut(&str, Option<&str>) -> ControlFlow<()>,
    {
        for (pos, col) in self.set.columns.iter().enumerate() {
            if f(col, self.set.rows[self.index][pos].as_deref()).is_break() {
                break;
            }
        }
    }

    pub(crate) fn require(&self, column: &str) -> Result<&'a str> {
        self.get(column)
            .ok_or_else(|| StoreError::Schema(format!("column {column} is missing or NULL")))
    }

    pub(crate) fn parse_u64(&self, column: &str) -> Result<u64> {
        self.require(column)?
            .parse::<u64>()
            .map_err(|_| StoreError::Schema(format!("column {column} is not an integer")))
    }

    pub(crate) fn parse_f64_or(&self, column: &str, default: f64) -> Result<f64> {
        match self.get(column) {
            None => Ok(default),
            Some(text) => text
                .parse::<f64>()
                .map_err(|_| StoreError::Schema(format!("column {column} is not a float"))),
        }
    }
}
