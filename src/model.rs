use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;

/// Stable 64-bit identifier for a stored atom. Zero is reserved as invalid.
pub type AtomId = u64;
pub const NULL_ATOM_ID: AtomId = 0;

/// Identifier for a free-standing value row.
pub type ValueId = u64;

/// In-process type code. Codes are dense, assigned in registration order.
pub type TypeCode = u16;

/// Sentinel for database rows whose type name this process does not know.
pub const NOTYPE: TypeCode = u16::MAX;

/// Typed payload attachable to an atom under a key atom. Lists nest
/// arbitrarily; leaves are float or string vectors.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Floats(Vec<f64>),
    Strings(Vec<String>),
    List(Vec<Value>),
}

pub(crate) const VALUE_TAG_FLOAT: u16 = 1;
pub(crate) const VALUE_TAG_STRING: u16 = 2;
pub(crate) const VALUE_TAG_LIST: u16 = 3;

impl Value {
    pub(crate) fn tag(&self) -> u16 {
        match self {
            Value::Floats(_) => VALUE_TAG_FLOAT,
            Value::Strings(_) => VALUE_TAG_STRING,
            Value::List(_) => VALUE_TAG_LIST,
        }
    }
}

/// Strength-and-confidence annotation stored inline with each atom row.
///
/// The variant is recorded as a tag byte; the three float columns change
/// meaning with the tag. `Indefinite` packs (lower, upper, confidence_level)
/// into the (mean, count, confidence) slots.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TruthValue {
    Simple { mean: f64, confidence: f64 },
    Count { mean: f64, confidence: f64, count: f64 },
    Probabilistic { mean: f64, confidence: f64, count: f64 },
    Indefinite { lower: f64, upper: f64, confidence_level: f64 },
}

pub(crate) const TV_TAG_SIMPLE: u16 = 1;
pub(crate) const TV_TAG_COUNT: u16 = 2;
pub(crate) const TV_TAG_INDEFINITE: u16 = 3;
pub(crate) const TV_TAG_PROBABILISTIC: u16 = 4;

impl Default for TruthValue {
    fn default() -> Self {
        TruthValue::Simple {
            mean: 1.0,
            confidence: 0.0,
        }
    }
}

impl TruthValue {
    pub(crate) fn tag(&self) -> u16 {
        match self {
            TruthValue::Simple { .. } => TV_TAG_SIMPLE,
            TruthValue::Count { .. } => TV_TAG_COUNT,
            TruthValue::Indefinite { .. } => TV_TAG_INDEFINITE,
            TruthValue::Probabilistic { .. } => TV_TAG_PROBABILISTIC,
        }
    }

    /// Column packing: (stv_mean, stv_confidence, stv_count).
    pub(crate) fn columns(&self) -> (f64, f64, Option<f64>) {
        match *self {
            TruthValue::Simple { mean, confidence } => (mean, confidence, None),
            TruthValue::Count {
                mean,
                confidence,
                count,
            }
            | TruthValue::Probabilistic {
                mean,
                confidence,
                count,
            } => (mean, confidence, Some(count)),
            TruthValue::Indefinite {
                lower,
                upper,
                confidence_level,
            } => (lower, confidence_level, Some(upper)),
        }
    }

    pub(crate) fn from_columns(tag: u16, mean: f64, confidence: f64, count: f64) -> Option<Self> {
        match tag {
            TV_TAG_SIMPLE => Some(TruthValue::Simple { mean, confidence }),
            TV_TAG_COUNT => Some(TruthValue::Count {
                mean,
                confidence,
                count,
            }),
            TV_TAG_PROBABILISTIC => Some(TruthValue::Probabilistic {
                mean,
                confidence,
                count,
            }),
            TV_TAG_INDEFINITE => Some(TruthValue::Indefinite {
                lower: mean,
                upper: count,
                confidence_level: confidence,
            }),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum AtomKind {
    Node { name: String },
    Link { outgoing: Vec<Handle> },
}

/// An atom: a typed node or link. Identity (`Eq`/`Hash`) covers the type and
/// the name or child sequence only; the truth value and the attached value
/// map are interior-mutable and excluded.
#[derive(Debug)]
pub struct Atom {
    type_code: TypeCode,
    kind: AtomKind,
    tv: RwLock<TruthValue>,
    values: RwLock<HashMap<Handle, Value>>,
}

/// Shared reference to an atom. Cheap to clone; equality is structural.
#[derive(Debug, Clone)]
pub struct Handle(Arc<Atom>);

impl Handle {
    pub fn node(type_code: TypeCode, name: impl Into<String>) -> Handle {
        Handle(Arc::new(Atom {
            type_code,
            kind: AtomKind::Node { name: name.into() },
            tv: RwLock::new(TruthValue::default()),
            values: RwLock::new(HashMap::new()),
        }))
    }

    pub fn link(type_code: TypeCode, outgoing: Vec<Handle>) -> Handle {
        Handle(Arc::new(Atom {
            type_code,
            kind: AtomKind::Link { outgoing },
            tv: RwLock::new(TruthValue::default()),
            values: RwLock::new(HashMap::new()),
        }))
    }

    pub fn type_code(&self) -> TypeCode {
        self.0.type_code
    }

    pub fn is_node(&self) -> bool {
        matches!(self.0.kind, AtomKind::Node { .. })
    }

    pub fn name(&self) -> Option<&str> {
        match &self.0.kind {
            AtomKind::Node { name } => Some(name),
            AtomKind::Link { .. } => None,
        }
    }

    pub fn outgoing(&self) -> &[Handle] {
        match &self.0.kind {
            AtomKind::Node { .. } => &[],
            AtomKind::Link { outgoing } => outgoing,
        }
    }

    pub fn arity(&self) -> usize {
        self.outgoing().len()
    }

    /// Distance to the deepest node below this atom: 0 for nodes, one more
    /// than the tallest child for links. Walks with an explicit stack.
    pub fn height(&self) -> u16 {
        let mut max = 0u16;
        let mut stack: Vec<(Handle, u16)> = vec![(self.clone(), 0)];
        while let Some((h, depth)) = stack.pop() {
            if h.is_node() {
                if depth > max {
                    max = depth;
                }
            } else {
                // An empty link still sits one level above "nothing".
                if depth > max {
                    max = depth;
                }
                for child in h.outgoing() {
                    stack.push((child.clone(), depth + 1));
                }
            }
        }
        if self.is_node() {
            0
        } else {
            max.max(1)
        }
    }

    pub fn tv(&self) -> TruthValue {
        *self.0.tv.read()
    }

    pub fn set_tv(&self, tv: TruthValue) {
        *self.0.tv.write() = tv;
    }

    pub fn value(&self, key: &Handle) -> Option<Value> {
        self.0.values.read().get(key).cloned()
    }

    pub fn set_value(&self, key: Handle, value: Value) {
        self.0.values.write().insert(key, value);
    }

    pub fn remove_value(&self, key: &Handle) -> Option<Value> {
        self.0.values.write().remove(key)
    }

    /// Snapshot of the attached value map.
    pub fn values(&self) -> Vec<(Handle, Value)> {
        self.0
            .values
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Handle) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        if self.0.type_code != other.0.type_code {
            return false;
        }
        match (&self.0.kind, &other.0.kind) {
            (AtomKind::Node { name: a }, AtomKind::Node { name: b }) => a == b,
            (AtomKind::Link { outgoing: a }, AtomKind::Link { outgoing: b }) => a == b,
            _ => false,
        }
    }
}

impl Eq for Handle {}

impl Hash for Handle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.type_code.hash(state);
        match &self.0.kind {
            AtomKind::Node { name } => {
                0u8.hash(state);
                name.hash(state);
            }
            AtomKind::Link { outgoing } => {
                1u8.hash(state);
                for child in outgoing {
                    child.hash(state);
                }
            }
        }
    }
}

/// The runtime's own type table, supplied by the embedding container.
/// Registration order defines the in-process codes.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    names: Vec<String>,
    codes: HashMap<String, TypeCode>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a type name, returning its code. Idempotent.
    pub fn register(&self, name: &str) -> TypeCode {
        let mut inner = self.inner.write();
        if let Some(&code) = inner.codes.get(name) {
            return code;
        }
        assert!(
            inner.names.len() < NOTYPE as usize,
            "type registry overflow"
        );
        let code = inner.names.len() as TypeCode;
        inner.names.push(name.to_string());
        inner.codes.insert(name.to_string(), code);
        code
    }

    pub fn code_of(&self, name: &str) -> Option<TypeCode> {
        self.inner.read().codes.get(name).copied()
    }

    pub fn name_of(&self, code: TypeCode) -> Option<String> {
        self.inner.read().names.get(code as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A namespace in the parent-pointer tree of containers. The root has id 1
/// and is its own parent.
#[derive(Debug)]
pub struct Space {
    id: u64,
    parent: Option<Arc<Space>>,
}

impl Space {
    pub fn root() -> Arc<Space> {
        Arc::new(Space { id: 1, parent: None })
    }

    pub fn child(parent: &Arc<Space>, id: u64) -> Arc<Space> {
        Arc::new(Space {
            id,
            parent: Some(parent.clone()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn parent_id(&self) -> u64 {
        self.parent.as_ref().map_or(self.id, |p| p.id)
    }

    /// Ancestors from the root down to this space.
    pub(crate) fn lineage(self: &Arc<Space>) -> Vec<Arc<Space>> {
        let mut chain = Vec::new();
        let mut cur = Some(self.clone());
        while let Some(s) = cur {
            cur = s.parent.clone();
            chain.push(s);
        }
        chain.reverse();
        chain
    }
}

/// Opaque interface to the in-memory hypergraph container used by the bulk
/// load and store paths.
pub trait AtomTable: Send + Sync {
    fn add(&self, atom: Handle);
    fn for_each(&self, f: &mut dyn FnMut(&Handle));
    /// Called after a bulk operation completes; containers that defer
    /// indexing synchronize here.
    fn barrier(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_compare_structurally() {
        let a = Handle::node(3, "apple");
        let b = Handle::node(3, "apple");
        let c = Handle::node(4, "apple");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let l1 = Handle::link(7, vec![a.clone(), c.clone()]);
        let l2 = Handle::link(7, vec![b.clone(), c.clone()]);
        let l3 = Handle::link(7, vec![c, b]);
        assert_eq!(l1, l2);
        assert_ne!(l1, l3);
    }

    #[test]
    fn tv_does_not_affect_identity() {
        let a = Handle::node(1, "x");
        let b = Handle::node(1, "x");
        a.set_tv(TruthValue::Count {
            mean: 0.5,
            confidence: 0.6,
            count: 3.0,
        });
        assert_eq!(a, b);
    }

    #[test]
    fn height_counts_levels() {
        let n = Handle::node(0, "leaf");
        assert_eq!(n.height(), 0);
        let l1 = Handle::link(1, vec![n.clone()]);
        assert_eq!(l1.height(), 1);
        let l2 = Handle::link(1, vec![l1.clone(), n.clone()]);
        assert_eq!(l2.height(), 2);
        let empty = Handle::link(1, vec![]);
        assert_eq!(empty.height(), 1);
    }

    #[test]
    fn registry_assigns_dense_codes() {
        let reg = TypeRegistry::new();
        assert_eq!(reg.register("A"), 0);
        assert_eq!(reg.register("B"), 1);
        assert_eq!(reg.register("A"), 0);
        assert_eq!(reg.code_of("B"), Some(1));
        assert_eq!(reg.name_of(1).as_deref(), Some("B"));
    }

    #[test]
    fn indefinite_tv_round_trips_through_columns() {
        let tv = TruthValue::Indefinite {
            lower: 0.2,
            upper: 0.8,
            confidence_level: 0.9,
        };
        let (mean, conf, count) = tv.columns();
        let back = TruthValue::from_columns(tv.tag(), mean, conf, count.unwrap_or(0.0)).unwrap();
        assert_eq!(tv, back);
    }
}
