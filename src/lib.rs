pub mod codec;
pub mod config;
pub mod driver;
pub mod error;
pub mod idmap;
pub mod model;
pub mod pool;
pub mod queue;
pub mod store;
pub mod typemap;

pub use crate::config::StoreConfig;
pub use crate::error::{Result, StoreError};
pub use crate::model::{
    AtomId, AtomTable, Handle, Space, TruthValue, TypeCode, TypeRegistry, Value, ValueId, NOTYPE,
    NULL_ATOM_ID,
};
pub use crate::store::{AtomStore, StatsSnapshot, WriteMode};
