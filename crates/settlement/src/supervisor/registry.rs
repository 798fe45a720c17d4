//! Registry of live monitor tasks, keyed by order id

use chrono::{DateTime, Utc};
use common::OrderId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{SettlementError, SettlementResult};
use crate::types::MonitorKind;

/// Snapshot of a registered monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorInfo {
    pub order_id: OrderId,
    pub kind: MonitorKind,
    pub started_at: DateTime<Utc>,
}

struct MonitorEntry {
    info: MonitorInfo,
    generation: u64,
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Taken out of the registry; cancelled but possibly still running
pub struct RemovedMonitor {
    pub info: MonitorInfo,
    pub task: JoinHandle<()>,
}

/// At most one entry per order id.
///
/// Every entry carries a generation number so a finishing task only ever
/// removes its own entry, never a successor registered after a retire.
#[derive(Default)]
pub struct MonitorRegistry {
    entries: RwLock<HashMap<OrderId, MonitorEntry>>,
    next_generation: AtomicU64,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a monitor, spawning its task with `spawn` while the slot is
    /// held. Fails with `DuplicateMonitor` if the order already has one.
    pub fn insert_with<F>(
        &self,
        order_id: OrderId,
        kind: MonitorKind,
        token: CancellationToken,
        spawn: F,
    ) -> SettlementResult<u64>
    where
        F: FnOnce(u64) -> JoinHandle<()>,
    {
        let mut entries = self.entries.write();
        if entries.contains_key(&order_id) {
            return Err(SettlementError::DuplicateMonitor(order_id));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let task = spawn(generation);
        entries.insert(
            order_id,
            MonitorEntry {
                info: MonitorInfo {
                    order_id,
                    kind,
                    started_at: Utc::now(),
                },
                generation,
                token,
                task,
            },
        );
        Ok(generation)
    }

    /// Cancel and remove the monitor for an order, if any
    pub fn remove(&self, order_id: OrderId) -> Option<RemovedMonitor> {
        let entry = self.entries.write().remove(&order_id)?;
        entry.token.cancel();
        Some(RemovedMonitor {
            info: entry.info,
            task: entry.task,
        })
    }

    /// Remove the entry only if it still belongs to `generation`
    pub fn remove_if_generation(&self, order_id: OrderId, generation: u64) -> bool {
        let mut entries = self.entries.write();
        match entries.get(&order_id) {
            Some(entry) if entry.generation == generation => {
                entries.remove(&order_id);
                true
            }
            _ => false,
        }
    }

    /// Cancel and remove every monitor
    pub fn drain(&self) -> Vec<RemovedMonitor> {
        self.entries
            .write()
            .drain()
            .map(|(_, entry)| {
                entry.token.cancel();
                RemovedMonitor {
                    info: entry.info,
                    task: entry.task,
                }
            })
            .collect()
    }

    pub fn contains(&self, order_id: OrderId) -> bool {
        self.entries.read().contains_key(&order_id)
    }

    pub fn get(&self, order_id: OrderId) -> Option<MonitorInfo> {
        self.entries.read().get(&order_id).map(|e| e.info.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn order_ids(&self) -> Vec<OrderId> {
        self.entries.read().keys().copied().collect()
    }
}
