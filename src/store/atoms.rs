//! Atom store and load paths. Stores run bottom-up over an explicit work
//! list; loads resolve children iteratively, creating any atoms the local
//! buffer does not know yet.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::Ordering;

use tracing::{debug, info};

use super::StoreInner;
use crate::codec::{dollar_quote, id_array_literal};
use crate::driver::{RecordRow, Recordset};
use crate::error::{Result, StoreError};
use crate::model::{AtomId, AtomTable, Handle, TruthValue, TypeCode, NOTYPE};

/// The unique index on (type, name) caps how long a stored name can be.
pub(crate) const MAX_NODE_NAME_BYTES: usize = 2700;
/// The unique index on (type, outgoing) caps the child count likewise.
pub(crate) const MAX_LINK_ARITY: usize = 330;

/// A decoded atom row: ids instead of handles, pending child resolution.
pub(crate) struct PseudoAtom {
    pub id: AtomId,
    pub type_code: TypeCode,
    pub name: Option<String>,
    pub outgoing: Vec<AtomId>,
    pub tv: TruthValue,
}

/// Accumulates column/value pairs and renders either an INSERT or an
/// UPDATE, so both paths share one composition site.
pub(crate) struct SqlRow {
    table: &'static str,
    update: bool,
    cols: String,
    vals: String,
}

impl SqlRow {
    pub(crate) fn insert(table: &'static str) -> Self {
        Self {
            table,
            update: false,
            cols: String::new(),
            vals: String::new(),
        }
    }

    pub(crate) fn update(table: &'static str) -> Self {
        Self {
            table,
            update: true,
            cols: String::new(),
            vals: String::new(),
        }
    }

    /// `value` must already be rendered as a SQL literal.
    pub(crate) fn push(&mut self, col: &str, value: impl Display) {
        if self.update {
            if !self.cols.is_empty() {
                self.cols.push_str(", ");
            }
            self.cols.push_str(col);
            self.cols.push_str(" = ");
            self.cols.push_str(&value.to_string());
        } else {
            if !self.cols.is_empty() {
                self.cols.push_str(", ");
                self.vals.push_str(", ");
            }
            self.cols.push_str(col);
            self.vals.push_str(&value.to_string());
        }
    }

    pub(crate) fn render(self, key_col: &str, key: AtomId) -> String {
        if self.update {
            format!(
                "UPDATE {} SET {} WHERE {key_col} = {key};",
                self.table, self.cols
            )
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({});",
                self.table, self.cols, self.vals
            )
        }
    }

    pub(crate) fn render_insert(self) -> String {
        format!(
            "INSERT INTO {} ({}) VALUES ({});",
            self.table, self.cols, self.vals
        )
    }
}

/// Whether a failed statement reports the space foreign-key violation, the
/// only failure the insert path recovers from locally. Matches both the
/// server's wording ("violates foreign key constraint \"atoms_space_fkey\"")
/// and the in-memory engine's.
fn is_unknown_space_error(err: &StoreError) -> bool {
    match err {
        StoreError::Sql(text) => {
            let text = text.to_ascii_lowercase();
            text.contains("foreign key") && text.contains("space")
        }
        _ => false,
    }
}

fn push_tv(row: &mut SqlRow, tv: &TruthValue) {
    let (mean, confidence, count) = tv.columns();
    row.push("tv_type", tv.tag());
    row.push("stv_mean", crate::codec::fmt_f64(mean));
    row.push("stv_confidence", crate::codec::fmt_f64(confidence));
    if let Some(count) = count {
        row.push("stv_count", crate::codec::fmt_f64(count));
    }
}

impl StoreInner {
    /// Stores an atom and everything below it, children first so every link
    /// row references existing child rows. Returns the atom's height.
    pub(crate) fn do_store_atom(&self, h: &Handle) -> Result<u16> {
        self.store_tree(h, true)
    }

    /// Stores an atom's row tree without touching attached values. Used to
    /// satisfy the row references a valuation needs.
    pub(crate) fn store_skeleton(&self, h: &Handle) -> Result<()> {
        self.store_tree(h, false).map(|_| ())
    }

    fn store_tree(&self, h: &Handle, with_values: bool) -> Result<u16> {
        let mut heights: HashMap<Handle, u16> = HashMap::new();
        let mut stack: Vec<(Handle, bool)> = vec![(h.clone(), false)];
        while let Some((x, expanded)) = stack.pop() {
            if heights.contains_key(&x) {
                continue;
            }
            if x.is_node() || expanded {
                let height = if x.is_node() {
                    0
                } else {
                    1 + x
                        .outgoing()
                        .iter()
                        .map(|c| heights.get(c).copied().unwrap_or(0))
                        .max()
                        .unwrap_or(0)
                };
                self.store_single(&x, height)?;
                if with_values {
                    self.store_atom_values(&x)?;
                }
                heights.insert(x, height);
            } else {
                stack.push((x.clone(), true));
                for child in x.outgoing() {
                    if !heights.contains_key(child) {
                        stack.push((child.clone(), false));
                    }
                }
            }
        }
        heights
            .get(h)
            .copied()
            .ok_or_else(|| StoreError::Integrity("store traversal missed the root".into()))
    }

    /// Stores exactly one atom row (not its children, not its values).
    /// First-ever stores INSERT under the creation gate; later stores
    /// UPDATE only the truth value.
    pub(crate) fn store_single(&self, h: &Handle, height: u16) -> Result<()> {
        if let Some(name) = h.name() {
            if name.len() > MAX_NODE_NAME_BYTES {
                return Err(StoreError::SizeLimit(format!(
                    "node name is {} bytes, limit {MAX_NODE_NAME_BYTES}",
                    name.len()
                )));
            }
        }
        if h.arity() > MAX_LINK_ARITY {
            return Err(StoreError::SizeLimit(format!(
                "link arity is {}, limit {MAX_LINK_ARITY}",
                h.arity()
            )));
        }

        // Resolve before taking a session, so the common path holds one
        // connection at a time.
        let id = self.resolve_eid(h)?;
        let mut session = self.pool.session();
        self.ensure_typemap(&mut session)?;
        let ticket = self.gate.begin(id);
        let update = ticket.is_none();

        let mut row = if update {
            SqlRow::update("Atoms")
        } else {
            SqlRow::insert("Atoms")
        };
        if !update {
            // Type, name and outgoing are immutable once stored, so they
            // are written on the first store only.
            row.push("uuid", id);
            row.push("space", self.space.id());
            row.push("type", self.typemap.to_db(h.type_code())?);
            row.push("height", height);
            match h.name() {
                Some(name) => row.push("name", dollar_quote(name)),
                None => row.push("outgoing", id_array_literal(&self.outgoing_ids(h)?)),
            }
        }
        push_tv(&mut row, &h.tv());
        let sql = row.render("uuid", id);

        if let Err(first) = session.exec(&sql) {
            // An insert whose space has not been persisted yet is the one
            // failure recovered from locally: store the space tree and
            // retry once. Everything else surfaces immediately.
            if update || !is_unknown_space_error(&first) {
                return Err(first);
            }
            debug!(id, error = %first, "store.atom.retry_space");
            self.store_space_tree(&mut session)?;
            session.exec(&sql)?;
        }

        if let Some(ticket) = ticket {
            ticket.complete();
        }
        let c = &self.counters;
        match (h.is_node(), update) {
            (true, false) => c.node_inserts.fetch_add(1, Ordering::Relaxed),
            (true, true) => c.node_updates.fetch_add(1, Ordering::Relaxed),
            (false, false) => c.link_inserts.fetch_add(1, Ordering::Relaxed),
            (false, true) => c.link_updates.fetch_add(1, Ordering::Relaxed),
        };
        c.stores.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn decode_pseudo(&self, row: &RecordRow<'_>) -> Result<PseudoAtom> {
        let id = row.parse_u64("uuid")?;
        let db_type = row
            .require("type")?
            .parse::<u16>()
            .map_err(|_| StoreError::Schema("type column is not a code".into()))?;
        let type_code = self.typemap.to_runtime(db_type);
        if type_code == NOTYPE {
            return Err(StoreError::TypeMap(format!(
                "row {id} has type {:?} unknown to this process",
                self.typemap.db_name(db_type).unwrap_or_default()
            )));
        }
        let name = row.get("name").map(str::to_string);
        let outgoing = match row.get("outgoing") {
            Some(text) => crate::codec::parse_u64_array(text)?,
            None => Vec::new(),
        };
        let tag = row
            .require("tv_type")?
            .parse::<u16>()
            .map_err(|_| StoreError::Schema("tv_type column is not a tag".into()))?;
        let mean = row.parse_f64_or("stv_mean", 0.0)?;
        let confidence = row.parse_f64_or("stv_confidence", 0.0)?;
        let count = row.parse_f64_or("stv_count", 0.0)?;
        let tv = TruthValue::from_columns(tag, mean, confidence, count)
            .ok_or_else(|| StoreError::Schema(format!("row {id} has truth-value tag {tag}")))?;
        Ok(PseudoAtom {
            id,
            type_code,
            name,
            outgoing,
            tv,
        })
    }

    fn rows_to_pseudos(&self, rows: &Recordset) -> Result<Vec<PseudoAtom>> {
        rows.iter().map(|row| self.decode_pseudo(&row)).collect()
    }

    /// The row for one id, decoded but with unresolved children.
    pub(crate) fn fetch_pseudo(&self, id: AtomId) -> Result<Option<PseudoAtom>> {
        let mut session = self.pool.session();
        self.ensure_typemap(&mut session)?;
        let rows = session.exec(&format!("SELECT * FROM Atoms WHERE uuid = {id};"))?;
        match rows.first() {
            Some(row) => Ok(Some(self.decode_pseudo(&row)?)),
            None => Ok(None),
        }
    }

    /// Turns a decoded row into a live handle, resolving children through
    /// the id buffer and, on misses, through further single-row fetches.
    /// Runs on an explicit stack: link depth is data, not recursion budget.
    pub(crate) fn materialize(&self, pseudo: PseudoAtom) -> Result<Handle> {
        enum Step {
            Descend(AtomId),
            Complete,
        }

        struct Frame {
            pseudo: PseudoAtom,
            resolved: Vec<Handle>,
        }

        let mut stack = vec![Frame {
            pseudo,
            resolved: Vec::new(),
        }];
        let mut finished: Option<Handle> = None;
        while let Some(frame) = stack.last_mut() {
            if let Some(h) = finished.take() {
                frame.resolved.push(h);
            }
            let step = if frame.pseudo.name.is_some() {
                Step::Complete
            } else if frame.resolved.len() < frame.pseudo.outgoing.len() {
                let child = frame.pseudo.outgoing[frame.resolved.len()];
                match self.idmap.lookup_id(child) {
                    Some(h) => {
                        frame.resolved.push(h);
                        continue;
                    }
                    None => Step::Descend(child),
                }
            } else {
                Step::Complete
            };
            match step {
                Step::Descend(child) => {
                    let p = self.fetch_pseudo(child)?.ok_or_else(|| {
                        StoreError::Integrity(format!("link child row {child} is missing"))
                    })?;
                    stack.push(Frame {
                        pseudo: p,
                        resolved: Vec::new(),
                    });
                }
                Step::Complete => {
                    let frame = match stack.pop() {
                        Some(f) => f,
                        None => break,
                    };
                    finished = Some(self.intern_pseudo(frame.pseudo, frame.resolved));
                }
            }
        }
        finished.ok_or_else(|| StoreError::Integrity("empty resolution".into()))
    }

    /// Binds a decoded atom into the id buffer, reusing the already-bound
    /// handle (and its truth value) when the id is known.
    fn intern_pseudo(&self, pseudo: PseudoAtom, resolved: Vec<Handle>) -> Handle {
        let fresh = match &pseudo.name {
            Some(name) => Handle::node(pseudo.type_code, name.clone()),
            None => Handle::link(pseudo.type_code, resolved),
        };
        fresh.set_tv(pseudo.tv);
        let handle = self.idmap.bind(&fresh, pseudo.id);
        self.gate.note_known(pseudo.id);
        self.counters.loads.fetch_add(1, Ordering::Relaxed);
        handle
    }

    pub(crate) fn get_node(&self, type_code: TypeCode, name: &str) -> Result<Option<Handle>> {
        let mut session = self.pool.session();
        self.ensure_typemap(&mut session)?;
        self.counters.get_nodes.fetch_add(1, Ordering::Relaxed);
        let db_type = self.typemap.to_db(type_code)?;
        let rows = session.exec(&format!(
            "SELECT * FROM Atoms WHERE type = {db_type} AND name = {};",
            dollar_quote(name)
        ))?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let pseudo = self.decode_pseudo(&row)?;
        let tv = pseudo.tv;
        let handle = self.intern_pseudo(pseudo, Vec::new());
        handle.set_tv(tv);
        self.counters.got_nodes.fetch_add(1, Ordering::Relaxed);
        drop(session);
        self.fetch_atom_values(&handle)?;
        Ok(Some(handle))
    }

    pub(crate) fn get_link(
        &self,
        type_code: TypeCode,
        outgoing: &[Handle],
    ) -> Result<Option<Handle>> {
        let mut session = self.pool.session();
        self.ensure_typemap(&mut session)?;
        self.counters.get_links.fetch_add(1, Ordering::Relaxed);
        let db_type = self.typemap.to_db(type_code)?;
        let ids = outgoing
            .iter()
            .map(|c| self.resolve_eid(c))
            .collect::<Result<Vec<_>>>()?;
        let rows = session.exec(&format!(
            "SELECT * FROM Atoms WHERE type = {db_type} AND outgoing = {};",
            id_array_literal(&ids)
        ))?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let pseudo = self.decode_pseudo(&row)?;
        let tv = pseudo.tv;
        let handle = self.intern_pseudo(pseudo, outgoing.to_vec());
        handle.set_tv(tv);
        self.counters.got_links.fetch_add(1, Ordering::Relaxed);
        drop(session);
        self.fetch_atom_values(&handle)?;
        Ok(Some(handle))
    }

    pub(crate) fn incoming_set(&self, h: &Handle) -> Result<Vec<Handle>> {
        let id = self.resolve_eid(h)?;
        let mut session = self.pool.session();
        self.ensure_typemap(&mut session)?;
        self.counters.inset_fetches.fetch_add(1, Ordering::Relaxed);
        let rows = session.exec(&format!(
            "SELECT * FROM Atoms WHERE outgoing @> ARRAY[CAST({id} AS BIGINT)];"
        ))?;
        let pseudos = self.rows_to_pseudos(&rows)?;
        drop(session);
        let mut out = Vec::with_capacity(pseudos.len());
        for pseudo in pseudos {
            out.push(self.materialize(pseudo)?);
        }
        self.counters
            .inset_atoms
            .fetch_add(out.len() as u64, Ordering::Relaxed);
        Ok(out)
    }

    /// Loads everything, one height layer at a time so children always
    /// precede the links that use them, chunking ids to bound per-query
    /// memory.
    pub(crate) fn load_all(&self, table: &dyn AtomTable) -> Result<u64> {
        let mut session = self.pool.session();
        self.ensure_typemap(&mut session)?;
        let max_id = super::schema::max_observed_id(&mut session)?;
        self.idmap.reserve_upto(max_id);
        let max_height = super::schema::max_observed_height(&mut session)?;
        debug!(max_id, max_height, "store.load.begin");

        let mut total = 0u64;
        for height in 0..=max_height {
            let at_start = total;
            let mut start = 0u64;
            while start < max_id {
                let end = start.saturating_add(self.load_chunk);
                let rows = session.exec(&format!(
                    "SELECT * FROM Atoms WHERE height = {height} AND \
                     uuid > {start} AND uuid <= {end};"
                ))?;
                let pseudos = self.rows_to_pseudos(&rows)?;
                for pseudo in pseudos {
                    let handle = self.materialize(pseudo)?;
                    table.add(handle);
                    total += 1;
                }
                start = end;
            }
            debug!(height, loaded = total - at_start, "store.load.height_done");
        }
        table.barrier();
        info!(total, "store.load.done");
        Ok(total)
    }

    /// Type-filtered bulk load with load-if-not-exists semantics: rows
    /// whose id is already resolved locally are skipped, so a merge cannot
    /// clobber their truth values.
    pub(crate) fn load_type(&self, table: &dyn AtomTable, type_code: TypeCode) -> Result<u64> {
        let mut session = self.pool.session();
        self.ensure_typemap(&mut session)?;
        let db_type = self.typemap.to_db(type_code)?;
        let max_id = super::schema::max_observed_id(&mut session)?;
        self.idmap.reserve_upto(max_id);
        let max_height = super::schema::max_observed_height(&mut session)?;

        let mut total = 0u64;
        for height in 0..=max_height {
            let mut start = 0u64;
            while start < max_id {
                let end = start.saturating_add(self.load_chunk);
                let rows = session.exec(&format!(
                    "SELECT * FROM Atoms WHERE type = {db_type} AND height = {height} AND \
                     uuid > {start} AND uuid <= {end};"
                ))?;
                let pseudos = self.rows_to_pseudos(&rows)?;
                for pseudo in pseudos {
                    if self.idmap.lookup_id(pseudo.id).is_some() {
                        continue;
                    }
                    let handle = self.materialize(pseudo)?;
                    table.add(handle);
                    total += 1;
                }
                start = end;
            }
        }
        table.barrier();
        debug!(total, type_code, "store.load.type_done");
        Ok(total)
    }

    /// Stores every atom the container yields, then asks the server to
    /// refresh its planner statistics.
    pub(crate) fn store_all(&self, table: &dyn AtomTable) -> Result<u64> {
        {
            let mut session = self.pool.session();
            self.ensure_typemap(&mut session)?;
            self.store_space_tree(&mut session)?;
        }
        let mut count = 0u64;
        let mut failure: Option<StoreError> = None;
        table.for_each(&mut |h| {
            if failure.is_some() {
                return;
            }
            match self.do_store_atom(h) {
                Ok(_) => count += 1,
                Err(err) => failure = Some(err),
            }
        });
        if let Some(err) = failure {
            return Err(err);
        }
        self.pool.session().exec("VACUUM ANALYZE Atoms;")?;
        info!(count, "store.store_all.done");
        Ok(count)
    }
}
