//! Connection slot allocator
//!
//! A fixed-size slot table. New connections take the lowest free slot;
//! when every slot is busy a uniformly random victim is evicted, matching
//! the behavior controllers expect from small accessories.

/// Where an accepted connection landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotAssignment {
    /// An unoccupied slot was available
    Fresh(usize),
    /// Every slot was busy; this one was force-closed and reused
    Evicted(usize),
}

pub(crate) struct ConnectionPool {
    occupied: Vec<bool>,
}

impl ConnectionPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            occupied: vec![false; capacity],
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.occupied.len()
    }

    /// Claim a slot for a new connection.
    pub(crate) fn assign(&mut self) -> SlotAssignment {
        if let Some(slot) = self.occupied.iter().position(|used| !used) {
            self.occupied[slot] = true;
            return SlotAssignment::Fresh(slot);
        }

        use rand::rngs::OsRng;
        use rand::Rng;
        let victim = OsRng.gen_range(0..self.occupied.len());
        SlotAssignment::Evicted(victim)
    }

    pub(crate) fn release(&mut self, slot: usize) {
        if let Some(entry) = self.occupied.get_mut(slot) {
            *entry = false;
        }
    }

    pub(crate) fn is_occupied(&self, slot: usize) -> bool {
        self.occupied.get(slot).copied().unwrap_or(false)
    }
}
