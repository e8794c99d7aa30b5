// src/slab.rs
use std::collections::HashMap;
use std::os::fd::RawFd;

use crate::conn::Connection;

/// Readiness token reserved for the listening socket.
pub const LISTENER_TOKEN: u64 = u64::MAX;

/// Generation-checked handle to an arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    pub index: u32,
    pub generation: u32,
}

impl ConnId {
    /// Pack into an epoll token: generation in the high half, index in the low.
    #[inline(always)]
    pub fn token(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline(always)]
    pub fn from_token(token: u64) -> Self {
        Self {
            index: token as u32,
            generation: (token >> 32) as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    /// Live and owned by the reactor.
    Idle,
    /// Live and currently with a worker.
    CheckedOut,
}

struct Slot {
    generation: u32,
    /// Next free slot while `Free`, -1 terminates the list.
    next_free: i32,
    fd: RawFd,
    state: SlotState,
    conn: Option<Box<Connection>>,
}

pub struct ConnectionSlab {
    slots: Box<[Slot]>,
    head_free: i32,
    active_count: usize,
    by_fd: HashMap<RawFd, ConnId>,
}

impl ConnectionSlab {
    /// Allocate every Connection once, up front.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(Slot {
                generation: 0,
                next_free: if i == capacity - 1 { -1 } else { (i + 1) as i32 },
                fd: -1,
                state: SlotState::Free,
                conn: Some(Box::new(Connection::new())),
            });
        }

        Self {
            slots: slots.into_boxed_slice(),
            head_free: if capacity == 0 { -1 } else { 0 },
            active_count: 0,
            by_fd: HashMap::with_capacity(capacity),
        }
    }

    /// Claim a free slot for `fd`. Returns `None` when the arena is full.
    #[inline(always)]
    pub fn acquire(&mut self, fd: RawFd) -> Option<ConnId> {
        if self.head_free == -1 {
            return None;
        }

        let index = self.head_free as usize;
        let slot = &mut self.slots[index];
        self.head_free = slot.next_free;

        slot.next_free = -1;
        slot.fd = fd;
        slot.state = SlotState::Idle;

        let id = ConnId {
            index: index as u32,
            generation: slot.generation,
        };
        if let Some(conn) = slot.conn.as_deref_mut() {
            conn.init(fd, id.token());
        }
        self.by_fd.insert(fd, id);
        self.active_count += 1;
        Some(id)
    }

    /// Return a live, reactor-owned slot to the free list and invalidate
    /// every outstanding handle to it. Yields the descriptor the caller must
    /// close; `None` for stale handles or slots that are checked out.
    #[inline(always)]
    pub fn release(&mut self, id: ConnId) -> Option<RawFd> {
        let head_free = self.head_free;
        let slot = self.slot_mut(id)?;
        if slot.state != SlotState::Idle {
            return None;
        }

        let fd = slot.fd;
        if let Some(conn) = slot.conn.as_deref_mut() {
            conn.clear();
        }
        slot.fd = -1;
        slot.state = SlotState::Free;
        slot.generation = slot.generation.wrapping_add(1);
        slot.next_free = head_free;

        self.head_free = id.index as i32;
        self.active_count -= 1;
        self.by_fd.remove(&fd);
        Some(fd)
    }

    /// Handle of the live connection on `fd`, if any.
    #[inline(always)]
    pub fn lookup(&self, fd: RawFd) -> Option<ConnId> {
        self.by_fd.get(&fd).copied()
    }

    /// Move the connection out so a worker can own it.
    pub fn checkout(&mut self, id: ConnId) -> Option<Box<Connection>> {
        let slot = self.slot_mut(id)?;
        if slot.state != SlotState::Idle {
            return None;
        }
        let conn = slot.conn.take()?;
        slot.state = SlotState::CheckedOut;
        Some(conn)
    }

    /// Put a checked-out connection back. A handle that no longer matches a
    /// checked-out slot hands the connection back unchanged.
    pub fn checkin(&mut self, id: ConnId, conn: Box<Connection>) -> Result<(), Box<Connection>> {
        let Some(slot) = self.slot_mut(id) else {
            return Err(conn);
        };
        if slot.state != SlotState::CheckedOut {
            return Err(conn);
        }
        slot.conn = Some(conn);
        slot.state = SlotState::Idle;
        Ok(())
    }

    /// The reactor-owned connection behind `id`.
    #[inline(always)]
    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        let slot = self.slot_mut(id)?;
        if slot.state != SlotState::Idle {
            return None;
        }
        slot.conn.as_deref_mut()
    }

    pub fn is_checked_out(&self, id: ConnId) -> bool {
        self.slots
            .get(id.index as usize)
            .is_some_and(|s| s.generation == id.generation && s.state == SlotState::CheckedOut)
    }

    /// Handles of every live connection.
    pub fn live_ids(&self) -> Vec<ConnId> {
        self.by_fd.values().copied().collect()
    }

    #[inline(always)]
    fn slot_mut(&mut self, id: ConnId) -> Option<&mut Slot> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|s| s.generation == id.generation && s.state != SlotState::Free)
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.active_count
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
