//! The persistence engine: insert-or-update storage of atoms under a
//! per-id creation gate, recursive loads, value persistence and the
//! asynchronous write-back path.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::codec::{dollar_quote, id_array_literal};
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::idmap::IdMap;
use crate::model::{
    AtomId, AtomTable, Handle, Space, TypeCode, TypeRegistry, Value, ValueId, NULL_ATOM_ID,
};
use crate::pool::{ConnectionPool, Session};
use crate::queue::WriteQueue;
use crate::typemap::TypeMap;

mod atoms;
mod schema;
mod stats;
#[cfg(test)]
mod tests;
mod values;

pub use stats::StatsSnapshot;

/// Whether a store call runs in the caller's thread or goes through the
/// write-back queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Immediate,
    Queued,
}

/// Handle to an open store. Cheap to clone; all operations are safe to call
/// from any thread.
#[derive(Clone)]
pub struct AtomStore {
    inner: Arc<StoreInner>,
    queue: Arc<WriteQueue<Handle>>,
}

pub(crate) struct StoreInner {
    pool: ConnectionPool,
    registry: Arc<TypeRegistry>,
    space: Arc<Space>,
    idmap: IdMap,
    typemap: TypeMap,
    gate: CreationGate,
    known_spaces: Mutex<HashSet<u64>>,
    next_vuid: AtomicU64,
    primed: AtomicBool,
    prime_mu: Mutex<()>,
    load_chunk: u64,
    counters: stats::Counters,
}

impl AtomStore {
    /// Connects the pool and starts the write-back workers. The schema must
    /// already exist (see [`AtomStore::create_tables`]) before the first
    /// store or load.
    pub fn open(uri: &str, registry: Arc<TypeRegistry>, config: StoreConfig) -> Result<AtomStore> {
        let pool_size = config.effective_pool_size();
        let pool = ConnectionPool::connect(uri, pool_size)?;
        let inner = Arc::new(StoreInner {
            pool,
            registry,
            space: config.space.clone(),
            idmap: IdMap::new(),
            typemap: TypeMap::new(),
            gate: CreationGate::new(),
            known_spaces: Mutex::new(HashSet::new()),
            next_vuid: AtomicU64::new(1),
            primed: AtomicBool::new(false),
            prime_mu: Mutex::new(()),
            load_chunk: config.load_chunk.max(1),
            counters: stats::Counters::default(),
        });
        let worker_inner = inner.clone();
        let queue = WriteQueue::spawn(
            "atom-writeback",
            config.writeback_workers,
            Arc::new(move |h: &Handle| worker_inner.do_store_atom(h).map(|_| ())),
        )?;
        info!(
            pool = pool_size,
            workers = config.writeback_workers,
            "store.open"
        );
        Ok(AtomStore {
            inner,
            queue: Arc::new(queue),
        })
    }

    /// Whether a usable connection exists. May block while the pool is
    /// fully checked out.
    pub fn connected(&self) -> bool {
        self.inner.pool.session().connected()
    }

    /// Stores an atom, its children and its attached values. `Queued` only
    /// enqueues; call [`AtomStore::flush`] to wait for completion.
    pub fn store_atom(&self, h: &Handle, mode: WriteMode) -> Result<()> {
        self.inner.ensure_primed()?;
        match mode {
            WriteMode::Immediate => self.inner.do_store_atom(h).map(|_| ()),
            WriteMode::Queued => {
                self.queue.enqueue(h.clone());
                Ok(())
            }
        }
    }

    /// Drains the write-back queue: returns once every enqueued store has
    /// fully completed.
    pub fn flush(&self) {
        self.queue.barrier();
    }

    pub fn get_atom(&self, id: AtomId) -> Result<Option<Handle>> {
        self.inner.ensure_primed()?;
        match self.inner.fetch_pseudo(id)? {
            Some(p) => Ok(Some(self.inner.materialize(p)?)),
            None => Ok(None),
        }
    }

    pub fn get_node(&self, type_code: TypeCode, name: &str) -> Result<Option<Handle>> {
        self.inner.ensure_primed()?;
        self.inner.get_node(type_code, name)
    }

    pub fn get_link(&self, type_code: TypeCode, outgoing: &[Handle]) -> Result<Option<Handle>> {
        self.inner.ensure_primed()?;
        self.inner.get_link(type_code, outgoing)
    }

    /// All links whose outgoing set contains this atom.
    pub fn incoming_set(&self, h: &Handle) -> Result<Vec<Handle>> {
        self.inner.ensure_primed()?;
        self.inner.incoming_set(h)
    }

    /// Loads every stored atom into the container, bottom layer first.
    pub fn load_all(&self, table: &dyn AtomTable) -> Result<u64> {
        self.inner.ensure_primed()?;
        self.inner.load_all(table)
    }

    /// Like [`AtomStore::load_all`] but restricted to one type, skipping
    /// atoms already resolved locally so their truth values survive.
    pub fn load_type(&self, table: &dyn AtomTable, type_code: TypeCode) -> Result<u64> {
        self.inner.ensure_primed()?;
        self.inner.load_type(table, type_code)
    }

    /// Stores every atom the container yields.
    pub fn store_all(&self, table: &dyn AtomTable) -> Result<u64> {
        self.inner.ensure_primed()?;
        self.inner.store_all(table)
    }

    pub fn store_value(&self, value: &Value) -> Result<ValueId> {
        self.inner.ensure_primed()?;
        let mut session = self.inner.pool.session();
        self.inner.store_value_in(&mut session, value)
    }

    pub fn get_value(&self, vuid: ValueId) -> Result<Option<Value>> {
        self.inner.ensure_primed()?;
        let mut session = self.inner.pool.session();
        self.inner.get_value_in(&mut session, vuid)
    }

    /// Deletes a value row and, recursively, every row its list structure
    /// references.
    pub fn delete_value(&self, vuid: ValueId) -> Result<()> {
        self.inner.ensure_primed()?;
        let mut session = self.inner.pool.session();
        self.inner.delete_value_in(&mut session, vuid)
    }

    /// Sets the value stored under `(key, atom)`, replacing any previous
    /// one atomically.
    pub fn store_valuation(&self, key: &Handle, atom: &Handle, value: &Value) -> Result<()> {
        self.inner.ensure_primed()?;
        self.inner.store_valuation(key, atom, value)
    }

    pub fn get_valuation(&self, key: &Handle, atom: &Handle) -> Result<Option<Value>> {
        self.inner.ensure_primed()?;
        self.inner.get_valuation(key, atom)
    }

    pub fn delete_valuation(&self, key: &Handle, atom: &Handle) -> Result<()> {
        self.inner.ensure_primed()?;
        self.inner.delete_valuation(key, atom)
    }

    /// Creates the five relations and seeds the root spaces.
    pub fn create_tables(&self) -> Result<()> {
        self.inner.create_tables()
    }

    /// Renames every relation to a `_backup` sibling. Destructive
    /// maintenance primitive.
    pub fn rename_tables(&self) -> Result<()> {
        self.inner.rename_tables()
    }

    /// Deletes all stored data and reseeds the root spaces. Destructive
    /// maintenance primitive.
    pub fn erase_data(&self) -> Result<()> {
        self.inner.erase_data()
    }

    /// Drops the local binding for an atom. The stored row is unaffected.
    pub fn evict(&self, h: &Handle) {
        self.inner.idmap.remove(h);
    }

    /// The locally bound id for an atom, if any. Does not touch the
    /// database.
    pub fn atom_id(&self, h: &Handle) -> Option<AtomId> {
        self.inner.idmap.lookup_handle(h)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner
            .counters
            .snapshot(&self.inner, self.queue.snapshot())
    }
}

impl StoreInner {
    /// One-time recovery of identifier state from the database: pushes the
    /// fresh-id watermark past every stored id, recovers the value-id
    /// counter, and notes every stored atom id so later stores update
    /// instead of insert.
    fn ensure_primed(&self) -> Result<()> {
        if self.primed.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.prime_mu.lock();
        if self.primed.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut session = self.pool.session();
        let max_id = schema::max_observed_id(&mut session)?;
        self.idmap.reserve_upto(max_id);
        let max_vuid = schema::max_observed_vuid(&mut session)?;
        self.next_vuid.store(max_vuid + 1, Ordering::SeqCst);

        let mut start = 0u64;
        while start < max_id {
            let end = start.saturating_add(self.load_chunk);
            let rows = session.exec(&format!(
                "SELECT uuid FROM Atoms WHERE uuid > {start} AND uuid <= {end};"
            ))?;
            let mut ids = Vec::with_capacity(rows.len());
            for row in rows.iter() {
                ids.push(row.parse_u64("uuid")?);
            }
            self.gate.note_known_many(&ids);
            start = end;
        }

        let rows = session.exec("SELECT space FROM Spaces;")?;
        let mut known = self.known_spaces.lock();
        for row in rows.iter() {
            known.insert(row.parse_u64("space")?);
        }
        drop(known);

        debug!(max_id, max_vuid, "store.primed");
        self.primed.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn ensure_typemap(&self, session: &mut Session<'_>) -> Result<()> {
        self.typemap.ensure_loaded(&self.registry, session)
    }

    /// The stored id for a handle: the local binding if present, else the
    /// id of the matching row, else a fresh provisional id. Children are
    /// resolved before their parents with an explicit work list.
    pub(crate) fn resolve_eid(&self, h: &Handle) -> Result<AtomId> {
        if let Some(id) = self.idmap.lookup_handle(h) {
            return Ok(id);
        }
        // Pre-order walk over the unresolved part; reversed, it yields
        // children before the links that contain them.
        let mut order = Vec::new();
        let mut stack = vec![h.clone()];
        let mut seen = HashSet::new();
        while let Some(x) = stack.pop() {
            if self.idmap.lookup_handle(&x).is_some() || !seen.insert(x.clone()) {
                continue;
            }
            for child in x.outgoing() {
                stack.push(child.clone());
            }
            order.push(x);
        }
        for x in order.iter().rev() {
            if self.idmap.lookup_handle(x).is_some() {
                continue;
            }
            match self.probe_row_id(x)? {
                Some(id) => {
                    self.idmap.bind(x, id);
                    self.gate.note_known(id);
                }
                None => {
                    self.idmap.assign(x, NULL_ATOM_ID);
                }
            }
        }
        self.idmap
            .lookup_handle(h)
            .ok_or_else(|| StoreError::Integrity("handle left unresolved".into()))
    }

    /// Looks the handle's row up by its unique key. Children must already
    /// be resolved.
    fn probe_row_id(&self, h: &Handle) -> Result<Option<AtomId>> {
        let mut session = self.pool.session();
        self.ensure_typemap(&mut session)?;
        let db_type = self.typemap.to_db(h.type_code())?;
        let sql = match h.name() {
            Some(name) => format!(
                "SELECT uuid FROM Atoms WHERE type = {db_type} AND name = {};",
                dollar_quote(name)
            ),
            None => {
                let ids = self.outgoing_ids(h)?;
                format!(
                    "SELECT uuid FROM Atoms WHERE type = {db_type} AND outgoing = {};",
                    id_array_literal(&ids)
                )
            }
        };
        let rows = session.exec(&sql)?;
        match rows.first() {
            Some(row) => Ok(Some(row.parse_u64("uuid")?)),
            None => Ok(None),
        }
    }

    /// The already-resolved ids of a link's children.
    fn outgoing_ids(&self, h: &Handle) -> Result<Vec<AtomId>> {
        h.outgoing()
            .iter()
            .map(|c| {
                self.idmap
                    .lookup_handle(c)
                    .ok_or_else(|| StoreError::Integrity("link child has no id binding".into()))
            })
            .collect()
    }
}

/// Coordination that makes the first store of an id an INSERT and every
/// later one an UPDATE, even under concurrent first-touches. A caller
/// holding a ticket is the only one inserting that id; concurrent callers
/// wait and then proceed in update mode.
pub(crate) struct CreationGate {
    /// Ids some thread is currently inserting. Locked before `known`.
    in_flight: Mutex<HashSet<AtomId>>,
    /// Ids that exist as rows.
    known: Mutex<HashSet<AtomId>>,
    cv: Condvar,
}

impl CreationGate {
    fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashSet::new()),
            known: Mutex::new(HashSet::new()),
            cv: Condvar::new(),
        }
    }

    /// `Some(ticket)`: this id has never been stored, caller must INSERT
    /// and then call [`CreationTicket::complete`]. `None`: the row exists,
    /// use UPDATE.
    pub(crate) fn begin(&self, id: AtomId) -> Option<CreationTicket<'_>> {
        let mut in_flight = self.in_flight.lock();
        loop {
            if self.known.lock().contains(&id) {
                return None;
            }
            if !in_flight.contains(&id) {
                in_flight.insert(id);
                return Some(CreationTicket {
                    gate: self,
                    id,
                    armed: true,
                });
            }
            self.cv.wait(&mut in_flight);
        }
    }

    /// Whether a row for this id exists (as far as this process knows).
    pub(crate) fn is_known(&self, id: AtomId) -> bool {
        let _in_flight = self.in_flight.lock();
        self.known.lock().contains(&id)
    }

    /// Marks a row as existing without going through an insert (loads,
    /// cache priming).
    pub(crate) fn note_known(&self, id: AtomId) {
        let mut in_flight = self.in_flight.lock();
        self.known.lock().insert(id);
        if in_flight.remove(&id) {
            self.cv.notify_all();
        }
    }

    pub(crate) fn note_known_many(&self, ids: &[AtomId]) {
        let _in_flight = self.in_flight.lock();
        let mut known = self.known.lock();
        known.extend(ids.iter().copied());
    }

    pub(crate) fn clear(&self) {
        let mut in_flight = self.in_flight.lock();
        self.known.lock().clear();
        in_flight.clear();
        self.cv.notify_all();
    }
}

pub(crate) struct CreationTicket<'a> {
    gate: &'a CreationGate,
    id: AtomId,
    armed: bool,
}

impl CreationTicket<'_> {
    /// The insert succeeded: the id is known from here on, and waiters
    /// proceed in update mode.
    pub(crate) fn complete(mut self) {
        self.armed = false;
        let mut in_flight = self.gate.in_flight.lock();
        self.gate.known.lock().insert(self.id);
        in_flight.remove(&self.id);
        self.gate.cv.notify_all();
    }
}

impl Drop for CreationTicket<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // The insert failed; let some other caller try again.
        let mut in_flight = self.gate.in_flight.lock();
        in_flight.remove(&self.id);
        self.gate.cv.notify_all();
    }
}
