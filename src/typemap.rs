//! Reconciliation between in-process type codes and the codes stored in the
//! database. Different processes may number the same type name differently,
//! so rows are always written with the database's code and translated on
//! the way in and out.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use std::ops::ControlFlow;
use tracing::debug;

use crate::codec::sql_quote;
use crate::error::{Result, StoreError};
use crate::model::{TypeCode, TypeRegistry, NOTYPE};
use crate::pool::Session;

const TYPEMAP_SZ: usize = 1 << 16;

pub struct TypeMap {
    loaded: AtomicBool,
    mapped: AtomicUsize,
    init: Mutex<()>,
    inner: RwLock<MapInner>,
}

struct MapInner {
    /// runtime code → db code, -1 when unmapped.
    to_db: Vec<i32>,
    /// db code → runtime code, NOTYPE when this process lacks the type.
    to_runtime: Vec<TypeCode>,
    /// db code → stored type name, for diagnostics and slot allocation.
    db_names: Vec<Option<String>>,
}

impl MapInner {
    fn record(&mut self, db_code: u16, name: &str, registry: &TypeRegistry) {
        if let Some(rt) = registry.code_of(name) {
            self.to_db[rt as usize] = db_code as i32;
            self.to_runtime[db_code as usize] = rt;
        }
        self.db_names[db_code as usize] = Some(name.to_string());
    }
}

impl Default for TypeMap {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeMap {
    pub fn new() -> Self {
        Self {
            loaded: AtomicBool::new(false),
            mapped: AtomicUsize::new(0),
            init: Mutex::new(()),
            inner: RwLock::new(MapInner {
                to_db: vec![-1; TYPEMAP_SZ],
                to_runtime: vec![NOTYPE; TYPEMAP_SZ],
                db_names: vec![None; TYPEMAP_SZ],
            }),
        }
    }

    /// Loads the stored concordance on first use and extends it with any
    /// runtime types it does not cover yet. Cheap once loaded; re-entered
    /// only when the registry has grown since.
    pub fn ensure_loaded(&self, registry: &TypeRegistry, session: &mut Session<'_>) -> Result<()> {
        if self.loaded.load(Ordering::Acquire) && self.mapped.load(Ordering::Acquire) == registry.len()
        {
            return Ok(());
        }
        let _guard = self.init.lock();
        if self.loaded.load(Ordering::Acquire) && self.mapped.load(Ordering::Acquire) == registry.len()
        {
            return Ok(());
        }

        let mut inner = self.inner.write();
        if !self.loaded.load(Ordering::Acquire) {
            let rows = session.exec("SELECT * FROM TypeCodes;")?;
            let mut parse_err = None;
            rows.for_each_row(|row| {
                let code = row.get("type").and_then(|v| v.parse::<u16>().ok());
                let name = row.get("typename");
                match (code, name) {
                    (Some(code), Some(name)) => inner.record(code, name, registry),
                    _ => {
                        parse_err = Some(StoreError::Schema(
                            "malformed TypeCodes row".into(),
                        ));
                        return ControlFlow::Break(());
                    }
                }
                ControlFlow::Continue(())
            });
            if let Some(err) = parse_err {
                return Err(err);
            }
        }

        for rt in 0..registry.len() {
            if inner.to_db[rt] >= 0 {
                continue;
            }
            let Some(name) = registry.name_of(rt as TypeCode) else {
                continue;
            };
            // Prefer keeping the runtime's own number; fall back to the
            // lowest free slot when another name already holds it.
            let candidate = if inner.db_names[rt].is_none() {
                rt
            } else {
                (0..TYPEMAP_SZ)
                    .find(|&c| inner.db_names[c].is_none())
                    .ok_or_else(|| StoreError::TypeMap("type table overflow".into()))?
            };
            session.exec(&format!(
                "INSERT INTO TypeCodes (type, typename) VALUES ({candidate}, {});",
                sql_quote(&name)
            ))?;
            inner.record(candidate as u16, &name, registry);
            debug!(db_code = candidate, name = %name, "typemap.assigned");
        }

        self.mapped.store(registry.len(), Ordering::Release);
        self.loaded.store(true, Ordering::Release);
        Ok(())
    }

    /// The database code for a runtime type. Errors for types registered
    /// after the last reconciliation.
    pub fn to_db(&self, rt: TypeCode) -> Result<u16> {
        let inner = self.inner.read();
        let code = inner.to_db[rt as usize];
        if code < 0 {
            return Err(StoreError::TypeMap(format!(
                "runtime type {rt} has no database code"
            )));
        }
        Ok(code as u16)
    }

    /// The runtime code for a database code; `NOTYPE` when unknown here.
    pub fn to_runtime(&self, db_code: u16) -> TypeCode {
        self.inner.read().to_runtime[db_code as usize]
    }

    pub fn db_name(&self, db_code: u16) -> Option<String> {
        self.inner.read().db_names[db_code as usize].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mem;
    use crate::pool::ConnectionPool;

    fn pool(name: &str) -> ConnectionPool {
        mem::reset(name);
        let pool = ConnectionPool::connect(&format!("mem://{name}"), 1).unwrap();
        pool.session()
            .exec("CREATE TABLE TypeCodes (type SMALLINT UNIQUE, typename TEXT UNIQUE);")
            .unwrap();
        pool
    }

    #[test]
    fn fresh_database_takes_runtime_codes() {
        let pool = pool("typemap-fresh");
        let registry = TypeRegistry::new();
        registry.register("Concept");
        registry.register("List");
        let map = TypeMap::new();
        map.ensure_loaded(&registry, &mut pool.session()).unwrap();
        assert_eq!(map.to_db(0).unwrap(), 0);
        assert_eq!(map.to_db(1).unwrap(), 1);
        assert_eq!(map.to_runtime(1), 1);
    }

    #[test]
    fn conflicting_code_moves_to_lowest_free_slot() {
        let pool = pool("typemap-conflict");
        pool.session()
            .exec("INSERT INTO TypeCodes (type, typename) VALUES (1, 'Stranger');")
            .unwrap();
        let registry = TypeRegistry::new();
        registry.register("A"); // 0
        registry.register("B"); // 1, collides with Stranger
        let map = TypeMap::new();
        map.ensure_loaded(&registry, &mut pool.session()).unwrap();
        assert_eq!(map.to_db(0).unwrap(), 0);
        assert_eq!(map.to_db(1).unwrap(), 2);
        // The stranger's slot decodes to NOTYPE here.
        assert_eq!(map.to_runtime(1), NOTYPE);
        assert_eq!(map.db_name(1).as_deref(), Some("Stranger"));
    }

    #[test]
    fn late_registrations_extend_the_map() {
        let pool = pool("typemap-late");
        let registry = TypeRegistry::new();
        registry.register("A");
        let map = TypeMap::new();
        map.ensure_loaded(&registry, &mut pool.session()).unwrap();
        registry.register("B");
        map.ensure_loaded(&registry, &mut pool.session()).unwrap();
        assert_eq!(map.to_db(1).unwrap(), 1);
    }

    #[test]
    fn stored_names_reload_in_a_new_process() {
        let pool = pool("typemap-reload");
        let registry = TypeRegistry::new();
        registry.register("A");
        registry.register("B");
        let first = TypeMap::new();
        first.ensure_loaded(&registry, &mut pool.session()).unwrap();

        // A second process numbers the same names differently.
        let other = TypeRegistry::new();
        other.register("B"); // 0
        other.register("A"); // 1
        let second = TypeMap::new();
        second.ensure_loaded(&other, &mut pool.session()).unwrap();
        assert_eq!(second.to_db(0).unwrap(), 1); // B kept db code 1
        assert_eq!(second.to_db(1).unwrap(), 0); // A kept db code 0
    }
}
