//! In-memory implementation of the driver contract. Understands exactly the
//! statement shapes the store composes (simple CREATE/INSERT/UPDATE/DELETE/
//! SELECT with conjunctive filters, array containment and `ORDER BY … DESC
//! LIMIT 1`), enforces primary-key, unique and foreign-key constraints, and
//! hands results back as text rows like a server in simple-query mode.
//!
//! Databases are process-global and keyed by the URI tail, so every
//! connection to `mem://name` shares one state. Transactions are accepted
//! and ignored; each statement is individually atomic under the engine
//! lock.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::codec::parse_u64_array;
use crate::driver::{DbConnection, Recordset};
use crate::error::{Result, StoreError};

static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<MemDb>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<String, Arc<MemDb>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Drops the named database, so a URI can be reused from a clean slate.
pub fn reset(name: &str) {
    registry().lock().remove(name);
}

pub struct MemConnection {
    db: Arc<MemDb>,
}

impl MemConnection {
    pub fn open(name: &str) -> Self {
        let db = registry()
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemDb::default()))
            .clone();
        Self { db }
    }
}

impl DbConnection for MemConnection {
    fn exec(&mut self, sql: &str) -> Result<Recordset> {
        self.db.exec(sql)
    }

    fn connected(&mut self) -> bool {
        true
    }
}

#[derive(Default)]
struct MemDb {
    inner: Mutex<DbState>,
}

#[derive(Default)]
struct DbState {
    tables: HashMap<String, Table>,
}

struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
    /// Column-index groups under a uniqueness constraint. Groups with a
    /// NULL member are exempt, matching server behavior.
    uniques: Vec<Vec<usize>>,
    /// (local column, referenced table, referenced column)
    foreign_keys: Vec<(usize, String, String)>,
}

impl Table {
    fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| StoreError::Sql(format!("no such column: {name}")))
    }
}

impl MemDb {
    fn exec(&self, sql: &str) -> Result<Recordset> {
        let stmt = sql.trim().trim_end_matches(';').trim();
        if stmt.is_empty() {
            return Ok(Recordset::empty());
        }
        let head = first_word(stmt).to_ascii_uppercase();
        let mut state = self.inner.lock();
        match head.as_str() {
            "CREATE" => state.create(stmt),
            "INSERT" => state.insert(stmt),
            "UPDATE" => state.update(stmt),
            "DELETE" => state.delete(stmt),
            "SELECT" => state.select(stmt),
            "ALTER" => state.alter(stmt),
            "BEGIN" | "COMMIT" | "ROLLBACK" | "VACUUM" => Ok(Recordset::empty()),
            _ => Err(StoreError::Sql(format!("unrecognized statement: {stmt}"))),
        }
    }
}

impl DbState {
    fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| StoreError::Sql(format!("no such table: {name}")))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| StoreError::Sql(format!("no such table: {name}")))
    }

    fn create(&mut self, stmt: &str) -> Result<Recordset> {
        let upper = stmt.to_ascii_uppercase();
        if upper.starts_with("CREATE INDEX") {
            return Ok(Recordset::empty());
        }
        let rest = stmt["CREATE TABLE".len()..].trim_start();
        let open = rest
            .find('(')
            .ok_or_else(|| StoreError::Sql("CREATE TABLE without column list".into()))?;
        let name = normalize_ident(rest[..open].trim());
        if self.tables.contains_key(&name) {
            return Err(StoreError::Sql(format!("table {name} already exists")));
        }
        let body = rest[open + 1..]
            .trim_end()
            .strip_suffix(')')
            .ok_or_else(|| StoreError::Sql("unterminated column list".into()))?;

        let mut columns = Vec::new();
        let mut uniques: Vec<Vec<String>> = Vec::new();
        let mut foreign_keys: Vec<(String, String, String)> = Vec::new();
        for def in split_top_level(body, ",") {
            let def = def.trim();
            if def.is_empty() {
                continue;
            }
            let def_upper = def.to_ascii_uppercase();
            if def_upper.starts_with("UNIQUE") {
                let inner = paren_body(def)?;
                uniques.push(
                    split_top_level(inner, ",")
                        .iter()
                        .map(|c| normalize_ident(c))
                        .collect(),
                );
                continue;
            }
            let col = normalize_ident(first_word(def));
            if def_upper.contains("PRIMARY KEY") || def_upper.contains(" UNIQUE") {
                uniques.push(vec![col.clone()]);
            }
            if let Some(pos) = def_upper.find("REFERENCES") {
                let target = def[pos + "REFERENCES".len()..].trim();
                let open = target
                    .find('(')
                    .ok_or_else(|| StoreError::Sql("REFERENCES without column".into()))?;
                let ref_table = normalize_ident(target[..open].trim());
                let ref_col = normalize_ident(paren_body(target)?);
                foreign_keys.push((col.clone(), ref_table, ref_col));
            }
            columns.push(col);
        }

        let uniques = uniques
            .into_iter()
            .map(|group| {
                group
                    .iter()
                    .map(|c| {
                        columns
                            .iter()
                            .position(|x| x == c)
                            .ok_or_else(|| StoreError::Sql(format!("unique on unknown column {c}")))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;
        let foreign_keys = foreign_keys
            .into_iter()
            .map(|(col, t, rc)| {
                let idx = columns
                    .iter()
                    .position(|x| *x == col)
                    .ok_or_else(|| StoreError::Sql(format!("fk on unknown column {col}")))?;
                Ok((idx, t, rc))
            })
            .collect::<Result<Vec<_>>>()?;

        self.tables.insert(
            name,
            Table {
                columns,
                rows: Vec::new(),
                uniques,
                foreign_keys,
            },
        );
        Ok(Recordset::empty())
    }

    fn insert(&mut self, stmt: &str) -> Result<Recordset> {
        let rest = stmt["INSERT INTO".len()..].trim_start();
        let open = rest
            .find('(')
            .ok_or_else(|| StoreError::Sql("INSERT without column list".into()))?;
        let name = normalize_ident(rest[..open].trim());
        let after = &rest[open..];
        let close = matching_paren(after)?;
        let cols: Vec<String> = split_top_level(&after[1..close], ",")
            .iter()
            .map(|c| normalize_ident(c))
            .collect();
        let tail = after[close + 1..].trim_start();
        let tail_upper = tail.to_ascii_uppercase();
        if !tail_upper.starts_with("VALUES") {
            return Err(StoreError::Sql("INSERT without VALUES".into()));
        }
        let vals_part = tail["VALUES".len()..].trim_start();
        let close = matching_paren(vals_part)?;
        let vals: Vec<String> = split_top_level(&vals_part[1..close], ",")
            .iter()
            .map(|v| decode_scalar(v.trim()))
            .collect::<Result<Vec<_>>>()?;
        if cols.len() != vals.len() {
            return Err(StoreError::Sql("column/value arity mismatch".into()));
        }

        // Resolve the row shape before borrowing other tables for FK checks.
        let (row, uniques, foreign_keys) = {
            let table = self.table(&name)?;
            let mut row: Vec<Option<String>> = vec![None; table.columns.len()];
            for (col, val) in cols.iter().zip(vals.into_iter()) {
                let idx = table.column_index(col)?;
                row[idx] = Some(val);
            }
            (row, table.uniques.clone(), table.foreign_keys.clone())
        };

        for (idx, ref_table, ref_col) in &foreign_keys {
            let Some(val) = row[*idx].as_deref() else {
                continue;
            };
            let target = self.table(ref_table)?;
            let rc = target.column_index(ref_col)?;
            let present = target
                .rows
                .iter()
                .any(|r| r[rc].as_deref().is_some_and(|v| text_eq(v, val)));
            if !present {
                return Err(StoreError::Sql(format!(
                    "foreign key violation: {name}.{} = {val} has no match in {ref_table}",
                    self.table(&name)?.columns[*idx]
                )));
            }
        }

        let table = self.table_mut(&name)?;
        for group in &uniques {
            if group.iter().any(|&i| row[i].is_none()) {
                continue;
            }
            let clash = table.rows.iter().any(|r| {
                group
                    .iter()
                    .all(|&i| matches!((&r[i], &row[i]), (Some(a), Some(b)) if text_eq(a, b)))
            });
            if clash {
                return Err(StoreError::Sql(format!(
                    "duplicate key violates unique constraint on {name}"
                )));
            }
        }
        table.rows.push(row);
        Ok(Recordset::empty())
    }

    fn update(&mut self, stmt: &str) -> Result<Recordset> {
        let rest = stmt["UPDATE".len()..].trim_start();
        let set_pos = find_top_level(rest, " SET ")
            .ok_or_else(|| StoreError::Sql("UPDATE without SET".into()))?;
        let name = normalize_ident(rest[..set_pos].trim());
        let after_set = &rest[set_pos + " SET ".len()..];
        let (assign_part, where_part) = match find_top_level(after_set, " WHERE ") {
            Some(pos) => (
                &after_set[..pos],
                Some(&after_set[pos + " WHERE ".len()..]),
            ),
            None => (after_set, None),
        };
        let mut assignments = Vec::new();
        for piece in split_top_level(assign_part, ",") {
            let eq = piece
                .find('=')
                .ok_or_else(|| StoreError::Sql("malformed assignment".into()))?;
            let col = normalize_ident(piece[..eq].trim());
            let val = decode_scalar(piece[eq + 1..].trim())?;
            assignments.push((col, val));
        }
        let conds = match where_part {
            Some(w) => parse_conditions(w)?,
            None => Vec::new(),
        };
        let table = self.table_mut(&name)?;
        let assignments = assignments
            .into_iter()
            .map(|(c, v)| Ok((table.column_index(&c)?, v)))
            .collect::<Result<Vec<_>>>()?;
        let conds = bind_conditions(table, &conds)?;
        for row in table.rows.iter_mut() {
            if conds.iter().all(|c| c.matches(row)) {
                for (idx, val) in &assignments {
                    row[*idx] = Some(val.clone());
                }
            }
        }
        Ok(Recordset::empty())
    }

    fn delete(&mut self, stmt: &str) -> Result<Recordset> {
        let rest = stmt["DELETE FROM".len()..].trim_start();
        let (name, conds) = match find_top_level(rest, " WHERE ") {
            Some(pos) => (
                normalize_ident(rest[..pos].trim()),
                parse_conditions(&rest[pos + " WHERE ".len()..])?,
            ),
            None => (normalize_ident(rest.trim()), Vec::new()),
        };
        let table = self.table_mut(&name)?;
        let conds = bind_conditions(table, &conds)?;
        table.rows.retain(|row| !conds.iter().all(|c| c.matches(row)));
        Ok(Recordset::empty())
    }

    fn select(&mut self, stmt: &str) -> Result<Recordset> {
        let rest = stmt["SELECT".len()..].trim_start();
        let from_pos = find_top_level(rest, " FROM ")
            .ok_or_else(|| StoreError::Sql("SELECT without FROM".into()))?;
        let projection = rest[..from_pos].trim();
        let mut tail = rest[from_pos + " FROM ".len()..].trim();

        let mut order_desc: Option<String> = None;
        let mut limit_one = false;
        if let Some(pos) = find_top_level(tail, " ORDER BY ") {
            let order = tail[pos + " ORDER BY ".len()..].trim();
            let order_upper = order.to_ascii_uppercase();
            let col_end = order.find(' ').unwrap_or(order.len());
            order_desc = Some(normalize_ident(&order[..col_end]));
            if !order_upper.contains("DESC") {
                return Err(StoreError::Sql("only descending order is supported".into()));
            }
            limit_one = order_upper.contains("LIMIT 1");
            tail = tail[..pos].trim();
        }

        let (name, conds) = match find_top_level(tail, " WHERE ") {
            Some(pos) => (
                normalize_ident(tail[..pos].trim()),
                parse_conditions(&tail[pos + " WHERE ".len()..])?,
            ),
            None => (normalize_ident(tail), Vec::new()),
        };

        let table = self.table(&name)?;
        let conds = bind_conditions(table, &conds)?;

        let out_cols: Vec<usize> = if projection == "*" {
            (0..table.columns.len()).collect()
        } else {
            split_top_level(projection, ",")
                .iter()
                .map(|c| table.column_index(&normalize_ident(c)))
                .collect::<Result<Vec<_>>>()?
        };

        let mut hits: Vec<&Vec<Option<String>>> = table
            .rows
            .iter()
            .filter(|row| conds.iter().all(|c| c.matches(row)))
            .collect();

        if let Some(order_col) = order_desc {
            let idx = table.column_index(&order_col)?;
            hits.sort_by_key(|row| {
                std::cmp::Reverse(
                    row[idx]
                        .as_deref()
                        .and_then(|v| v.parse::<i64>().ok())
                        .unwrap_or(i64::MIN),
                )
            });
            if limit_one {
                hits.truncate(1);
            }
        }

        let columns: Vec<String> = out_cols
            .iter()
            .map(|&i| table.columns[i].clone())
            .collect();
        let rows: Vec<Vec<Option<String>>> = hits
            .into_iter()
            .map(|row| out_cols.iter().map(|&i| row[i].clone()).collect())
            .collect();
        Ok(Recordset::new(columns, rows))
    }

    fn alter(&mut self, stmt: &str) -> Result<Recordset> {
        let rest = stmt["ALTER TABLE".len()..].trim_start();
        let pos = find_top_level(rest, " RENAME TO ")
            .ok_or_else(|| StoreError::Sql("unsupported ALTER".into()))?;
        let from = normalize_ident(rest[..pos].trim());
        let to = normalize_ident(rest[pos + " RENAME TO ".len()..].trim());
        if self.tables.contains_key(&to) {
            return Err(StoreError::Sql(format!("table {to} already exists")));
        }
        let table = self
            .tables
            .remove(&from)
            .ok_or_else(|| StoreError::Sql(format!("no such table: {from}")))?;
        self.tables.insert(to, table);
        Ok(Recordset::empty())
    }
}

enum Cond {
    Eq(usize, String),
    Gt(usize, u64),
    Le(usize, u64),
    Contains(usize, u64),
}

impl Cond {
    fn matches(&self, row: &[Option<String>]) -> bool {
        match self {
            Cond::Eq(idx, want) => row[*idx].as_deref().is_some_and(|v| text_eq(v, want)),
            Cond::Gt(idx, n) => row[*idx]
                .as_deref()
                .and_then(|v| v.parse::<u64>().ok())
                .is_some_and(|v| v > *n),
            Cond::Le(idx, n) => row[*idx]
                .as_deref()
                .and_then(|v| v.parse::<u64>().ok())
                .is_some_and(|v| v <= *n),
            Cond::Contains(idx, n) => row[*idx]
                .as_deref()
                .and_then(|v| parse_u64_array(v).ok())
                .is_some_and(|ids| ids.contains(n)),
        }
    }
}

/// Parsed-but-unbound condition: (column, operator, decoded rhs).
struct RawCond {
    column: String,
    op: RawOp,
    rhs: String,
}

enum RawOp {
    Eq,
    Gt,
    Le,
    Contains,
}

fn parse_conditions(text: &str) -> Result<Vec<RawCond>> {
    let mut out = Vec::new();
    for piece in split_on_keyword(text, " AND ") {
        let piece = piece.trim();
        // The column part is a bare identifier, so the first operator
        // character marks the split even when the rhs is quoted text.
        let bytes = piece.as_bytes();
        let mut found = None;
        for (i, &b) in bytes.iter().enumerate() {
            let (op, len) = match b {
                b'@' if bytes.get(i + 1) == Some(&b'>') => (RawOp::Contains, 2),
                b'<' if bytes.get(i + 1) == Some(&b'=') => (RawOp::Le, 2),
                b'>' => (RawOp::Gt, 1),
                b'=' => (RawOp::Eq, 1),
                _ => continue,
            };
            found = Some((i, op, len));
            break;
        }
        let Some((pos, op, len)) = found else {
            return Err(StoreError::Sql(format!("malformed condition: {piece}")));
        };
        let column = normalize_ident(piece[..pos].trim());
        let rhs_text = piece[pos + len..].trim();
        let rhs = match op {
            RawOp::Contains => {
                // `ARRAY[CAST(<n> AS BIGINT)]`: pull the id out.
                let digits: String = rhs_text
                    .chars()
                    .skip_while(|c| !c.is_ascii_digit())
                    .take_while(|c| c.is_ascii_digit())
                    .collect();
                if digits.is_empty() {
                    return Err(StoreError::Sql("malformed containment test".into()));
                }
                digits
            }
            _ => decode_scalar(rhs_text)?,
        };
        out.push(RawCond { column, op, rhs });
    }
    Ok(out)
}

fn bind_conditions(table: &Table, raw: &[RawCond]) -> Result<Vec<Cond>> {
    raw.iter()
        .map(|c| {
            let idx = table.column_index(&c.column)?;
            Ok(match c.op {
                RawOp::Eq => Cond::Eq(idx, c.rhs.clone()),
                RawOp::Gt => Cond::Gt(idx, parse_num(&c.rhs)?),
                RawOp::Le => Cond::Le(idx, parse_num(&c.rhs)?),
                RawOp::Contains => Cond::Contains(idx, parse_num(&c.rhs)?),
            })
        })
        .collect()
}

fn parse_num(text: &str) -> Result<u64> {
    text.parse::<u64>()
        .map_err(|_| StoreError::Sql(format!("expected an integer, got {text:?}")))
}

/// Text comparison with numeric tolerance, so `07` would still match `7`.
fn text_eq(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x == y,
        _ => false,
    }
}

fn first_word(s: &str) -> &str {
    s.split_whitespace().next().unwrap_or("")
}

fn normalize_ident(s: &str) -> String {
    s.trim().trim_matches('"').to_ascii_lowercase()
}

fn paren_body(s: &str) -> Result<&str> {
    let open = s
        .find('(')
        .ok_or_else(|| StoreError::Sql("expected parenthesized list".into()))?;
    let close = s
        .rfind(')')
        .ok_or_else(|| StoreError::Sql("unterminated parenthesized list".into()))?;
    Ok(&s[open + 1..close])
}

/// Index of the ')' matching the '(' the text starts with.
fn matching_paren(s: &str) -> Result<usize> {
    let bytes = s.as_bytes();
    if bytes.first() != Some(&b'(') {
        return Err(StoreError::Sql("expected '('".into()));
    }
    let mut depth = 0usize;
    let mut iter = TokenIter::new(s);
    while let Some((i, kind)) = iter.next_significant() {
        match kind {
            Sig::Open => depth += 1,
            Sig::Close => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i);
                }
            }
        }
    }
    Err(StoreError::Sql("unbalanced parentheses".into()))
}

enum Sig {
    Open,
    Close,
}

/// Walks a statement, skipping quoted regions, and reports parens.
struct TokenIter<'a> {
    s: &'a str,
    pos: usize,
}

impl<'a> TokenIter<'a> {
    fn new(s: &'a str) -> Self {
        Self { s, pos: 0 }
    }

    /// Advances past quoted literals; returns the next paren with its index.
    fn next_significant(&mut self) -> Option<(usize, Sig)> {
        let bytes = self.s.as_bytes();
        while self.pos < bytes.len() {
            let i = self.pos;
            match bytes[i] {
                b'\'' => self.pos = skip_single_quoted(self.s, i),
                b'$' => self.pos = skip_dollar_quoted(self.s, i),
                b'(' => {
                    self.pos += 1;
                    return Some((i, Sig::Open));
                }
                b')' => {
                    self.pos += 1;
                    return Some((i, Sig::Close));
                }
                _ => self.pos += 1,
            }
        }
        None
    }
}

/// Returns the index just past a single-quoted literal starting at `start`,
/// honoring doubled-quote escapes. Falls back to one past the quote when the
/// literal is unterminated.
fn skip_single_quoted(s: &str, start: usize) -> usize {
    let bytes = s.as_bytes();
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == b'\'' {
            if bytes.get(i + 1) == Some(&b'\'') {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// Returns the index just past a dollar-quoted literal starting at `start`.
/// If no valid tag opens here, steps past the '$' alone.
fn skip_dollar_quoted(s: &str, start: usize) -> usize {
    let rest = &s[start + 1..];
    let Some(tag_end) = rest.find('$') else {
        return start + 1;
    };
    let tag = &rest[..tag_end];
    if !tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return start + 1;
    }
    let full = &s[start..start + tag.len() + 2];
    match s[start + full.len()..].find(full) {
        Some(pos) => start + full.len() + pos + full.len(),
        None => start + 1,
    }
}

/// Splits on a separator occurring outside quotes and parentheses. The
/// separator match is case-insensitive.
fn split_top_level(s: &str, sep: &str) -> Vec<String> {
    split_points(s, sep)
        .into_iter()
        .map(|(a, b)| s[a..b].to_string())
        .collect()
}

fn split_on_keyword(s: &str, sep: &str) -> Vec<String> {
    split_top_level(s, sep)
}

fn find_top_level(s: &str, sep: &str) -> Option<usize> {
    let pts = split_points(s, sep);
    if pts.len() < 2 {
        None
    } else {
        Some(pts[0].1)
    }
}

fn split_points(s: &str, sep: &str) -> Vec<(usize, usize)> {
    let bytes = s.as_bytes();
    let sep_bytes = sep.as_bytes();
    let sep_len = sep_bytes.len();
    let mut depth = 0usize;
    let mut out = Vec::new();
    let mut seg_start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                i = skip_single_quoted(s, i);
                continue;
            }
            b'$' => {
                i = skip_dollar_quoted(s, i);
                continue;
            }
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            _ => {
                if depth == 0
                    && i + sep_len <= bytes.len()
                    && bytes[i..i + sep_len].eq_ignore_ascii_case(sep_bytes)
                {
                    out.push((seg_start, i));
                    i += sep_len;
                    seg_start = i;
                    continue;
                }
            }
        }
        i += 1;
    }
    out.push((seg_start, bytes.len()));
    out
}

/// Decodes one scalar token: single-quoted text (doubled-quote escapes),
/// dollar-quoted text, or a bare literal.
fn decode_scalar(tok: &str) -> Result<String> {
    let tok = tok.trim();
    if let Some(body) = tok.strip_prefix('\'') {
        let body = body
            .strip_suffix('\'')
            .ok_or_else(|| StoreError::Sql(format!("unterminated string: {tok}")))?;
        return Ok(body.replace("''", "'"));
    }
    if tok.starts_with('$') {
        let end = skip_dollar_quoted(tok, 0);
        if end == tok.len() {
            let rest = &tok[1..];
            if let Some(tag_end) = rest.find('$') {
                let tag_len = tag_end + 2;
                return Ok(tok[tag_len..tok.len() - tag_len].to_string());
            }
        }
        return Err(StoreError::Sql(format!("malformed dollar quoting: {tok}")));
    }
    Ok(tok.to_string())
}
