use std::sync::Arc;

use crate::model::Space;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Connections opened at startup. `None` sizes the pool to
    /// `max(hardware concurrency, 8) + writeback_workers`, so readers and
    /// writers cannot mutually starve.
    pub pool_size: Option<usize>,
    /// Worker threads draining the write-back queue.
    pub writeback_workers: usize,
    /// Ids covered per SELECT during bulk load and cache priming.
    pub load_chunk: u64,
    /// Namespace newly stored atoms are filed under.
    pub space: Arc<Space>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            pool_size: None,
            writeback_workers: 8,
            load_chunk: 12_000,
            space: Space::root(),
        }
    }
}

impl StoreConfig {
    /// Small footprint for tests and tools: two connections, one writer.
    pub fn minimal() -> Self {
        Self {
            pool_size: Some(2),
            writeback_workers: 1,
            ..Self::default()
        }
    }

    pub(crate) fn effective_pool_size(&self) -> usize {
        self.pool_size.unwrap_or_else(|| {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(8);
            cores.max(8) + self.writeback_workers
        })
    }
}
