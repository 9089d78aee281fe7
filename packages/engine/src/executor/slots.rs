//! Fixed-size slot pool controlling executor concurrency.

use uuid::Uuid;

#[derive(Debug, Clone)]
struct Slot {
    execution_id: Option<Uuid>,
}

/// Bounded set of in-process concurrency tokens. Each slot binds 1:1 to an
/// in-flight execution; binding and releasing are serialised by the
/// executor's lock around the manager.
#[derive(Debug)]
pub struct SlotManager {
    slots: Vec<Slot>,
}

impl SlotManager {
    pub fn new(max_slots: usize) -> Self {
        assert!(max_slots >= 1, "max_slots must be at least 1");
        Self {
            slots: vec![Slot { execution_id: None }; max_slots],
        }
    }

    /// Index of a free slot, if any.
    pub fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|slot| slot.execution_id.is_none())
    }

    /// Bind an execution to a slot. Returns false if the slot is occupied.
    pub fn bind(&mut self, slot: usize, execution_id: Uuid) -> bool {
        match self.slots.get_mut(slot) {
            Some(entry) if entry.execution_id.is_none() => {
                entry.execution_id = Some(execution_id);
                true
            }
            _ => false,
        }
    }

    /// Release whichever slot holds `execution_id`. Returns false when the
    /// execution was not bound (already released or never dispatched).
    pub fn release_execution(&mut self, execution_id: Uuid) -> bool {
        for slot in &mut self.slots {
            if slot.execution_id == Some(execution_id) {
                slot.execution_id = None;
                return true;
            }
        }
        false
    }

    /// Executions currently bound to slots.
    pub fn active_executions(&self) -> Vec<Uuid> {
        self.slots
            .iter()
            .filter_map(|slot| slot.execution_id)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.execution_id.is_some())
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_manager_has_all_slots_free() {
        let manager = SlotManager::new(3);
        assert_eq!(manager.capacity(), 3);
        assert_eq!(manager.active_count(), 0);
        assert!(manager.free_slot().is_some());
    }

    #[test]
    fn binding_fills_slots_until_none_free() {
        let mut manager = SlotManager::new(2);
        let first = manager.free_slot().unwrap();
        assert!(manager.bind(first, Uuid::new_v4()));
        let second = manager.free_slot().unwrap();
        assert!(manager.bind(second, Uuid::new_v4()));
        assert!(manager.free_slot().is_none());
    }

    #[test]
    fn double_bind_on_same_slot_is_rejected() {
        let mut manager = SlotManager::new(1);
        assert!(manager.bind(0, Uuid::new_v4()));
        assert!(!manager.bind(0, Uuid::new_v4()));
    }

    #[test]
    fn release_by_execution_frees_the_slot() {
        let mut manager = SlotManager::new(1);
        let execution_id = Uuid::new_v4();
        manager.bind(0, execution_id);
        assert!(manager.release_execution(execution_id));
        assert!(!manager.release_execution(execution_id));
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn active_executions_lists_bound_ids() {
        let mut manager = SlotManager::new(2);
        let execution_id = Uuid::new_v4();
        manager.bind(0, execution_id);
        assert_eq!(manager.active_executions(), vec![execution_id]);
    }
}
