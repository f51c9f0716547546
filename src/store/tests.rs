use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{AtomStore, WriteMode};
use crate::config::StoreConfig;
use crate::driver::mem::{self, MemConnection};
use crate::driver::DbConnection;
use crate::error::StoreError;
use crate::model::{AtomTable, Handle, Space, TruthValue, TypeRegistry, Value};

struct TestTable {
    atoms: Mutex<Vec<Handle>>,
}

impl TestTable {
    fn new() -> Self {
        Self {
            atoms: Mutex::new(Vec::new()),
        }
    }

    fn len(&self) -> usize {
        self.atoms.lock().len()
    }

    fn contains(&self, h: &Handle) -> bool {
        self.atoms.lock().iter().any(|x| x == h)
    }

    fn find(&self, h: &Handle) -> Option<Handle> {
        self.atoms.lock().iter().find(|x| *x == h).cloned()
    }
}

impl AtomTable for TestTable {
    fn add(&self, atom: Handle) {
        let mut atoms = self.atoms.lock();
        if !atoms.contains(&atom) {
            atoms.push(atom);
        }
    }

    fn for_each(&self, f: &mut dyn FnMut(&Handle)) {
        for atom in self.atoms.lock().iter() {
            f(atom);
        }
    }
}

fn registry() -> Arc<TypeRegistry> {
    let reg = TypeRegistry::new();
    reg.register("Concept");
    reg.register("Predicate");
    reg.register("List");
    reg.register("And");
    Arc::new(reg)
}

const CONCEPT: u16 = 0;
const PREDICATE: u16 = 1;
const LIST: u16 = 2;
const AND: u16 = 3;

fn config() -> StoreConfig {
    StoreConfig {
        pool_size: Some(6),
        writeback_workers: 2,
        ..StoreConfig::default()
    }
}

fn open_store(name: &str) -> (AtomStore, Arc<TypeRegistry>) {
    mem::reset(name);
    let reg = registry();
    let store =
        AtomStore::open(&format!("mem://{name}"), reg.clone(), config()).expect("open store");
    store.create_tables().expect("create tables");
    (store, reg)
}

/// A second store over the same database, as a fresh process would see it.
fn reopen_store(name: &str) -> (AtomStore, Arc<TypeRegistry>) {
    let reg = registry();
    let store =
        AtomStore::open(&format!("mem://{name}"), reg.clone(), config()).expect("reopen store");
    (store, reg)
}

fn raw(name: &str) -> MemConnection {
    MemConnection::open(name)
}

fn count_rows(name: &str, sql: &str) -> usize {
    raw(name).exec(sql).expect("raw query").len()
}

#[test]
fn node_round_trip_preserves_fields() {
    let (store, _reg) = open_store("store-s1");
    let hello = Handle::node(CONCEPT, "hello");
    hello.set_tv(TruthValue::Simple {
        mean: 0.5,
        confidence: 0.9,
    });
    store
        .store_atom(&hello, WriteMode::Immediate)
        .expect("store");
    store.evict(&hello);

    let loaded = store
        .get_node(CONCEPT, "hello")
        .expect("load")
        .expect("node exists");
    assert_eq!(loaded.type_code(), CONCEPT);
    assert_eq!(loaded.name(), Some("hello"));
    assert_eq!(
        loaded.tv(),
        TruthValue::Simple {
            mean: 0.5,
            confidence: 0.9
        }
    );
}

#[test]
fn link_round_trip_and_incoming_set() {
    let (store, _reg) = open_store("store-s2");
    let a = Handle::node(CONCEPT, "a");
    let b = Handle::node(CONCEPT, "b");
    let pair = Handle::link(LIST, vec![a.clone(), b.clone()]);
    pair.set_tv(TruthValue::Count {
        mean: 0.1,
        confidence: 0.2,
        count: 17.0,
    });
    store.store_atom(&pair, WriteMode::Immediate).expect("store");

    let incoming = store.incoming_set(&a).expect("incoming");
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0], pair);

    // Query with fresh handles, as a separate consumer would.
    let a2 = Handle::node(CONCEPT, "a");
    let b2 = Handle::node(CONCEPT, "b");
    let loaded = store
        .get_link(LIST, &[a2, b2])
        .expect("get link")
        .expect("link exists");
    assert_eq!(
        loaded.tv(),
        TruthValue::Count {
            mean: 0.1,
            confidence: 0.2,
            count: 17.0
        }
    );
    assert_eq!(loaded.arity(), 2);
}

#[test]
fn stored_ids_are_stable() {
    let (store, _reg) = open_store("store-eid");
    let n = Handle::node(CONCEPT, "stable");
    store.store_atom(&n, WriteMode::Immediate).expect("store");
    let first = store.atom_id(&n).expect("id bound");
    store.store_atom(&n, WriteMode::Immediate).expect("restore");
    assert_eq!(store.atom_id(&n), Some(first));

    store.evict(&n);
    let loaded = store
        .get_node(CONCEPT, "stable")
        .expect("load")
        .expect("exists");
    assert_eq!(store.atom_id(&loaded), Some(first));
}

#[test]
fn valuation_overwrite_keeps_one_row() {
    let (store, _reg) = open_store("store-s3");
    let a = Handle::node(CONCEPT, "a");
    let key = Handle::node(PREDICATE, "K");
    store.store_atom(&a, WriteMode::Immediate).expect("store a");
    store
        .store_atom(&key, WriteMode::Immediate)
        .expect("store key");

    store
        .store_valuation(&key, &a, &Value::Floats(vec![1.0, 2.0, 3.0]))
        .expect("first valuation");
    assert_eq!(
        store.get_valuation(&key, &a).expect("get"),
        Some(Value::Floats(vec![1.0, 2.0, 3.0]))
    );

    store
        .store_valuation(&key, &a, &Value::Strings(vec!["x".into(), "y".into()]))
        .expect("overwrite");
    assert_eq!(
        store.get_valuation(&key, &a).expect("get"),
        Some(Value::Strings(vec!["x".into(), "y".into()]))
    );

    let kid = store.atom_id(&key).expect("key id");
    let aid = store.atom_id(&a).expect("atom id");
    assert_eq!(
        count_rows(
            "store-s3",
            &format!("SELECT * FROM Valuations WHERE key = {kid} AND atom = {aid};")
        ),
        1
    );
}

#[test]
fn nested_value_round_trip_and_cascade_delete() {
    let (store, _reg) = open_store("store-s4");
    let a = Handle::node(CONCEPT, "a");
    let key = Handle::node(PREDICATE, "K");
    store.store_atom(&a, WriteMode::Immediate).expect("store a");
    store
        .store_atom(&key, WriteMode::Immediate)
        .expect("store key");

    let nested = Value::List(vec![
        Value::Floats(vec![1.0]),
        Value::List(vec![Value::Strings(vec!["z".into()])]),
    ]);
    store
        .store_valuation(&key, &a, &nested)
        .expect("store nested");
    assert_eq!(store.get_valuation(&key, &a).expect("get"), Some(nested));

    // The list structure fans out into stored value rows.
    assert_eq!(count_rows("store-s4", "SELECT * FROM \"Values\";"), 3);

    store.delete_valuation(&key, &a).expect("delete");
    assert_eq!(store.get_valuation(&key, &a).expect("get"), None);
    assert_eq!(count_rows("store-s4", "SELECT * FROM \"Values\";"), 0);
}

#[test]
fn delete_value_removes_exactly_the_reachable_rows() {
    let (store, _reg) = open_store("store-value-delete");
    let bystander = store
        .store_value(&Value::Floats(vec![9.0]))
        .expect("bystander");
    let nested = Value::List(vec![
        Value::Strings(vec!["a".into()]),
        Value::List(vec![Value::Floats(vec![1.0]), Value::Floats(vec![2.0])]),
    ]);
    let root = store.store_value(&nested).expect("store nested");
    assert_eq!(store.get_value(root).expect("get"), Some(nested));
    assert_eq!(count_rows("store-value-delete", "SELECT * FROM \"Values\";"), 6);

    store.delete_value(root).expect("delete");
    assert_eq!(count_rows("store-value-delete", "SELECT * FROM \"Values\";"), 1);
    assert_eq!(
        store.get_value(bystander).expect("bystander survives"),
        Some(Value::Floats(vec![9.0]))
    );
}

#[test]
fn concurrent_store_inserts_once() {
    let (store, _reg) = open_store("store-s5");
    let a = Handle::node(CONCEPT, "a");
    let b = Handle::node(CONCEPT, "b");
    store.store_atom(&a, WriteMode::Immediate).expect("store a");
    store.store_atom(&b, WriteMode::Immediate).expect("store b");

    let link = Handle::link(AND, vec![a, b]);
    let mut threads = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let link = link.clone();
        threads.push(thread::spawn(move || {
            store
                .store_atom(&link, WriteMode::Immediate)
                .expect("concurrent store");
        }));
    }
    for t in threads {
        t.join().expect("thread");
    }

    let stats = store.stats();
    assert_eq!(stats.link_inserts, 1);
    assert_eq!(stats.link_updates, 7);

    let id = store.atom_id(&link).expect("link id");
    assert_eq!(
        count_rows("store-s5", &format!("SELECT * FROM Atoms WHERE uuid = {id};")),
        1
    );
    let db_rows = count_rows("store-s5", "SELECT * FROM Atoms;");
    assert_eq!(db_rows, 3);
}

#[test]
fn queued_stores_are_visible_after_flush() {
    let (store, _reg) = open_store("store-queue");
    for i in 0..32 {
        let n = Handle::node(CONCEPT, format!("n{i}"));
        store.store_atom(&n, WriteMode::Queued).expect("enqueue");
    }
    store.flush();
    assert_eq!(count_rows("store-queue", "SELECT * FROM Atoms;"), 32);
    let stats = store.stats();
    assert_eq!(stats.queue.enqueued, 32);
    assert_eq!(stats.queue.pending, 0);
    assert_eq!(stats.queue.busy, 0);
    assert_eq!(stats.queue.failures, 0);
}

#[test]
fn type_codes_reconcile_against_foreign_seed() {
    let name = "store-s6";
    mem::reset(name);
    let reg = Arc::new(TypeRegistry::new());
    reg.register("Alpha"); // 0
    reg.register("Beta"); // 1
    reg.register("Gamma"); // 2
    reg.register("Y"); // 3, will collide with the seeded X
    let store = AtomStore::open(&format!("mem://{name}"), reg.clone(), config()).expect("open");
    store.create_tables().expect("create");
    raw(name)
        .exec("INSERT INTO TypeCodes (type, typename) VALUES (3, 'X');")
        .expect("seed");

    let y = Handle::node(3, "wye");
    store.store_atom(&y, WriteMode::Immediate).expect("store");

    // Y moved off its runtime code; X is still there.
    let codes = raw(name).exec("SELECT * FROM TypeCodes;").expect("codes");
    let mut y_code = None;
    let mut x_code = None;
    for row in codes.iter() {
        match row.get("typename") {
            Some("Y") => y_code = row.get("type").map(str::to_string),
            Some("X") => x_code = row.get("type").map(str::to_string),
            _ => {}
        }
    }
    let y_code: u64 = y_code.expect("Y mapped").parse().expect("numeric");
    assert_ne!(y_code, 3);
    assert_ne!(y_code, 0); // 0 is taken by Alpha
    assert_eq!(x_code.as_deref(), Some("3"));

    // A row carrying the foreign type fails to load, alone.
    raw(name)
        .exec(
            "INSERT INTO Atoms (uuid, space, type, height, name, tv_type, stv_mean, \
             stv_confidence) VALUES (999, 1, 3, 0, $q$stray$q$, 1, 1, 0);",
        )
        .expect("stray row");
    match store.get_atom(999) {
        Err(StoreError::TypeMap(_)) => {}
        other => panic!("expected a type-map failure, got {other:?}"),
    }
    // Other rows still load.
    assert!(store.get_node(3, "wye").expect("load Y").is_some());
}

#[test]
fn unknown_space_is_persisted_and_retried() {
    let name = "store-space";
    mem::reset(name);
    let reg = registry();
    let nursery = Space::child(&Space::root(), 42);
    let cfg = StoreConfig {
        space: nursery,
        ..config()
    };
    let store = AtomStore::open(&format!("mem://{name}"), reg, cfg).expect("open");
    store.create_tables().expect("create");

    let n = Handle::node(CONCEPT, "n");
    store.store_atom(&n, WriteMode::Immediate).expect("store");
    assert_eq!(
        count_rows(name, "SELECT * FROM Spaces WHERE space = 42;"),
        1
    );
    let id = store.atom_id(&n).expect("id");
    let rows = raw(name)
        .exec(&format!("SELECT space FROM Atoms WHERE uuid = {id};"))
        .expect("row");
    assert_eq!(rows.first().expect("row").get("space"), Some("42"));
}

#[test]
fn size_caps_reject_oversized_atoms() {
    let (store, _reg) = open_store("store-caps");
    let long_name = "x".repeat(2701);
    let n = Handle::node(CONCEPT, long_name);
    assert!(matches!(
        store.store_atom(&n, WriteMode::Immediate),
        Err(StoreError::SizeLimit(_))
    ));

    let children: Vec<Handle> = (0..331)
        .map(|i| Handle::node(CONCEPT, format!("c{i}")))
        .collect();
    let wide = Handle::link(LIST, children);
    assert!(matches!(
        store.store_atom(&wide, WriteMode::Immediate),
        Err(StoreError::SizeLimit(_))
    ));
}

#[test]
fn failed_insert_surfaces_and_is_not_counted() {
    let name = "store-insert-fail";
    let (store, _reg) = open_store(name);
    let seed = Handle::node(CONCEPT, "seed");
    store
        .store_atom(&seed, WriteMode::Immediate)
        .expect("store seed");

    // Occupy the next fresh id behind the store's back, so the following
    // insert trips the primary key instead of the space foreign key.
    raw(name)
        .exec(
            "INSERT INTO Atoms (uuid, space, type, height, name, tv_type, stv_mean, \
             stv_confidence) VALUES (2, 1, 0, 0, $q$squatter$q$, 1, 1, 0);",
        )
        .expect("squatter row");

    let n = Handle::node(CONCEPT, "x");
    match store.store_atom(&n, WriteMode::Immediate) {
        Err(StoreError::Sql(_)) => {}
        other => panic!("expected the duplicate-key failure to surface, got {other:?}"),
    }

    // Only the seed's write is on the books; the failed attempt is not.
    let stats = store.stats();
    assert_eq!(stats.node_inserts, 1);
    assert_eq!(stats.stores, 1);
}

#[test]
fn incoming_set_is_complete() {
    let (store, _reg) = open_store("store-incoming");
    let n = Handle::node(CONCEPT, "pivot");
    let mut links = Vec::new();
    for i in 0..5 {
        let other = Handle::node(CONCEPT, format!("o{i}"));
        let l = Handle::link(LIST, vec![n.clone(), other]);
        store.store_atom(&l, WriteMode::Immediate).expect("store");
        links.push(l);
    }
    // A link not containing the pivot.
    let stranger = Handle::link(
        LIST,
        vec![
            Handle::node(CONCEPT, "s1"),
            Handle::node(CONCEPT, "s2"),
        ],
    );
    store
        .store_atom(&stranger, WriteMode::Immediate)
        .expect("store stranger");

    let incoming = store.incoming_set(&n).expect("incoming");
    assert_eq!(incoming.len(), links.len());
    for l in &links {
        assert!(incoming.contains(l));
    }
    let stats = store.stats();
    assert_eq!(stats.incoming_fetches, 1);
    assert_eq!(stats.incoming_atoms, 5);
}

#[test]
fn bulk_store_then_bulk_load_matches() {
    let name = "store-bulk";
    let (store, _reg) = open_store(name);
    let table = TestTable::new();
    let a = Handle::node(CONCEPT, "a");
    a.set_tv(TruthValue::Simple {
        mean: 0.25,
        confidence: 0.5,
    });
    let b = Handle::node(CONCEPT, "b");
    let ab = Handle::link(LIST, vec![a.clone(), b.clone()]);
    let aab = Handle::link(AND, vec![a.clone(), ab.clone()]);
    aab.set_tv(TruthValue::Probabilistic {
        mean: 0.7,
        confidence: 0.8,
        count: 2.0,
    });
    for h in [&a, &b, &ab, &aab] {
        table.add((*h).clone());
    }
    let stored = store.store_all(&table).expect("bulk store");
    assert_eq!(stored, 4);

    let (fresh, _reg2) = reopen_store(name);
    let loaded = TestTable::new();
    let n = fresh.load_all(&loaded).expect("bulk load");
    assert_eq!(n, 4);
    assert_eq!(loaded.len(), 4);
    for h in [&a, &b, &ab, &aab] {
        let got = loaded.find(h).expect("atom loaded");
        assert_eq!(got.tv(), h.tv());
    }
}

#[test]
fn load_type_skips_resolved_atoms() {
    let name = "store-loadtype";
    let (store, _reg) = open_store(name);
    let a = Handle::node(CONCEPT, "a");
    let b = Handle::node(CONCEPT, "b");
    let l = Handle::link(LIST, vec![a.clone(), b.clone()]);
    store.store_atom(&l, WriteMode::Immediate).expect("store");

    let (fresh, _reg2) = reopen_store(name);
    let table = TestTable::new();
    let n = fresh.load_type(&table, CONCEPT).expect("load concepts");
    assert_eq!(n, 2);
    assert!(table.contains(&a));
    assert!(table.contains(&b));
    assert!(!table.contains(&l));

    // Loaded handles keep their local truth value on a second pass.
    let local = table.find(&a).expect("loaded a");
    local.set_tv(TruthValue::Simple {
        mean: 0.123,
        confidence: 0.456,
    });
    let again = TestTable::new();
    let n = fresh.load_type(&again, CONCEPT).expect("reload");
    assert_eq!(n, 0);
    assert_eq!(
        local.tv(),
        TruthValue::Simple {
            mean: 0.123,
            confidence: 0.456
        }
    );
}

#[test]
fn values_follow_node_loads() {
    let (store, _reg) = open_store("store-values-load");
    let a = Handle::node(CONCEPT, "a");
    let key = Handle::node(PREDICATE, "K");
    a.set_value(key.clone(), Value::Floats(vec![3.5, 4.5]));
    store.store_atom(&a, WriteMode::Immediate).expect("store");

    store.evict(&a);
    store.evict(&key);
    let loaded = store
        .get_node(CONCEPT, "a")
        .expect("load")
        .expect("exists");
    assert_eq!(
        loaded.value(&key),
        Some(Value::Floats(vec![3.5, 4.5]))
    );
}

#[test]
fn erase_data_resets_to_a_blank_slate() {
    let (store, _reg) = open_store("store-erase");
    let n = Handle::node(CONCEPT, "n");
    store.store_atom(&n, WriteMode::Immediate).expect("store");
    assert_eq!(count_rows("store-erase", "SELECT * FROM Atoms;"), 1);

    store.erase_data().expect("erase");
    assert_eq!(count_rows("store-erase", "SELECT * FROM Atoms;"), 0);
    assert_eq!(store.get_node(CONCEPT, "n").expect("lookup"), None);

    // Storing again starts over cleanly.
    let n2 = Handle::node(CONCEPT, "n");
    store.store_atom(&n2, WriteMode::Immediate).expect("restore");
    assert_eq!(count_rows("store-erase", "SELECT * FROM Atoms;"), 1);
}

#[test]
fn randomized_round_trips() {
    let name = "store-random";
    let (store, _reg) = open_store(name);
    let mut rng = ChaCha8Rng::seed_from_u64(42);

    fn random_value(rng: &mut ChaCha8Rng, depth: usize) -> Value {
        match if depth == 0 { rng.gen_range(0..2) } else { rng.gen_range(0..3) } {
            0 => Value::Floats((0..rng.gen_range(1..4)).map(|_| rng.gen::<f64>()).collect()),
            1 => Value::Strings(
                (0..rng.gen_range(1..4))
                    .map(|_| format!("s{}", rng.gen::<u32>()))
                    .collect(),
            ),
            _ => Value::List(
                (0..rng.gen_range(1..3))
                    .map(|_| random_value(rng, depth - 1))
                    .collect(),
            ),
        }
    }

    let key = Handle::node(PREDICATE, "K");
    let mut atoms: Vec<Handle> = Vec::new();
    for i in 0..20 {
        let h = if rng.gen_bool(0.5) || atoms.len() < 2 {
            Handle::node(CONCEPT, format!("n{i}"))
        } else {
            let x: Handle = atoms[rng.gen_range(0..atoms.len())].clone();
            let y: Handle = atoms[rng.gen_range(0..atoms.len())].clone();
            Handle::link(LIST, vec![x, y])
        };
        if atoms.contains(&h) {
            continue;
        }
        h.set_tv(TruthValue::Count {
            mean: rng.gen(),
            confidence: rng.gen(),
            count: rng.gen_range(0.0..100.0),
        });
        h.set_value(key.clone(), random_value(&mut rng, 2));
        store.store_atom(&h, WriteMode::Immediate).expect("store");
        atoms.push(h);
    }

    let (fresh, _reg2) = reopen_store(name);
    for h in &atoms {
        let loaded = if let Some(name) = h.name() {
            fresh.get_node(CONCEPT, name).expect("load node")
        } else {
            fresh.get_link(LIST, h.outgoing()).expect("load link")
        }
        .expect("atom exists");
        assert_eq!(loaded.tv(), h.tv(), "truth value survives the round trip");
        assert_eq!(
            loaded.value(&key),
            h.value(&key),
            "attached value survives the round trip"
        );
    }
}

#[test]
fn stats_reflect_activity() {
    let (store, _reg) = open_store("store-stats");
    let a = Handle::node(CONCEPT, "a");
    store.store_atom(&a, WriteMode::Immediate).expect("store");
    store.store_atom(&a, WriteMode::Immediate).expect("update");
    store.evict(&a);
    let _ = store.get_node(CONCEPT, "a").expect("load");
    let _ = store.get_node(CONCEPT, "missing").expect("miss");

    let stats = store.stats();
    assert_eq!(stats.node_inserts, 1);
    assert_eq!(stats.node_updates, 1);
    assert_eq!(stats.get_nodes, 2);
    assert_eq!(stats.got_nodes, 1);
    assert!(stats.stores >= 2);
    assert!(stats.idmap_entries >= 1);
    assert_eq!(stats.pool_idle, stats.pool_capacity);
    let json = stats.to_json().expect("stats serialize");
    assert!(json.contains("node_inserts"));
}
