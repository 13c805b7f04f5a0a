use std::collections::HashMap;

use tracing::debug;

use crate::AppResult;

use super::{ReplicationSlaveManager, SlaveWriter};

#[derive(Debug)]
struct TableBinding<W> {
    master_table_id: i32,
    writer: Option<W>,
}

/// Per-connection map from master table id to its leased writer.
///
/// Bindings live in an arena of slots that outlives connections: `release_all`
/// returns every lease to the manager and puts the slots on a free list, the
/// next connection served by the same receiver reuses them.
#[derive(Debug)]
pub struct TableBindingRegistry<W> {
    slots: Vec<TableBinding<W>>,
    free_slots: Vec<usize>,
    slot_by_table_id: HashMap<i32, usize>,
    /// ids in first-seen order, released in that order
    table_ids: Vec<i32>,
}

impl<W> Default for TableBindingRegistry<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> TableBindingRegistry<W> {
    pub fn new() -> Self {
        TableBindingRegistry {
            slots: Vec::new(),
            free_slots: Vec::new(),
            slot_by_table_id: HashMap::new(),
            table_ids: Vec::new(),
        }
    }

    pub fn contains(&self, master_table_id: i32) -> bool {
        self.slot_by_table_id.contains_key(&master_table_id)
    }

    pub fn len(&self) -> usize {
        self.table_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table_ids.is_empty()
    }

    /// Total slots ever allocated, bound or free.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn writer_mut(&mut self, master_table_id: i32) -> Option<&mut W> {
        let slot = *self.slot_by_table_id.get(&master_table_id)?;
        self.slots[slot].writer.as_mut()
    }

    fn bind(&mut self, master_table_id: i32, writer: W) -> usize {
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                let binding = &mut self.slots[slot];
                debug_assert!(binding.writer.is_none());
                binding.master_table_id = master_table_id;
                binding.writer = Some(writer);
                slot
            }
            None => {
                self.slots.push(TableBinding {
                    master_table_id,
                    writer: Some(writer),
                });
                self.slots.len() - 1
            }
        };
        self.slot_by_table_id.insert(master_table_id, slot);
        self.table_ids.push(master_table_id);
        slot
    }
}

impl<W: SlaveWriter> TableBindingRegistry<W> {
    /// Returns the cached writer for `master_table_id`, leasing one from
    /// `manager` the first time the id shows up on this connection.
    pub fn resolve<M>(&mut self, master_table_id: i32, manager: &M) -> AppResult<&mut W>
    where
        M: ReplicationSlaveManager<Writer = W>,
    {
        let slot = match self.slot_by_table_id.get(&master_table_id) {
            Some(slot) => *slot,
            None => {
                let writer = manager.get_slave_writer(master_table_id)?;
                debug!("bound slave writer for master table {}", master_table_id);
                self.bind(master_table_id, writer)
            }
        };
        match self.slots[slot].writer.as_mut() {
            Some(writer) => Ok(writer),
            None => Err(crate::AppError::IllegalStateError(format!(
                "binding for master table {} has no writer",
                master_table_id
            ))),
        }
    }

    /// Releases every lease taken since the last call, exactly once each.
    pub fn release_all<M>(&mut self, manager: &M)
    where
        M: ReplicationSlaveManager<Writer = W>,
    {
        for master_table_id in self.table_ids.drain(..) {
            if let Some(slot) = self.slot_by_table_id.remove(&master_table_id) {
                let binding = &mut self.slots[slot];
                if let Some(writer) = binding.writer.take() {
                    manager.release_slave_writer(binding.master_table_id, writer);
                    debug!("released slave writer for master table {}", master_table_id);
                }
                self.free_slots.push(slot);
            }
        }
        self.slot_by_table_id.clear();
    }
}
