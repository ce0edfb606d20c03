//! Descriptor registry
//!
//! Fixed-capacity set of watched descriptors, laid out as a contiguous
//! array of `struct pollfd`-compatible entries so the whole array can be
//! passed to `poll(2)` without copying.
//!
//! Removal is swap-with-last: O(1), but the entry that was last now lives at
//! the removed index. Anyone iterating by index must look at the same index
//! again after a removal.
//!
//! Categories are kept out-of-band in an fd-keyed side table, together with
//! each descriptor's current index, so lookups by fd survive the array
//! churn caused by swap-remove.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::error::RegistryError;
use crate::interest::{Category, Interest};

/// One watched descriptor. Same layout as `struct pollfd`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchedDescriptor {
    fd: RawFd,
    events: i16,
    revents: i16,
}

const _: () = assert!(
    core::mem::size_of::<WatchedDescriptor>() == core::mem::size_of::<libc::pollfd>()
);
const _: () = assert!(
    core::mem::align_of::<WatchedDescriptor>() == core::mem::align_of::<libc::pollfd>()
);

impl WatchedDescriptor {
    fn new(fd: RawFd, interest: Interest) -> Self {
        Self { fd, events: interest.bits(), revents: 0 }
    }

    /// Raw descriptor
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// What the descriptor is watched for
    #[inline]
    pub fn interest(&self) -> Interest {
        Interest::from_bits_truncate(self.events)
    }

    /// What the last poll reported
    #[inline]
    pub fn readiness(&self) -> Interest {
        Interest::from_bits_truncate(self.revents)
    }
}

/// Ownership of a registered OS descriptor.
///
/// An `Owned` descriptor is closed exactly once, when its registry entry is
/// removed. A `Shared` descriptor belongs to someone else (log files belong
/// to the logger) and removal leaves it open.
#[derive(Debug)]
pub enum Descriptor {
    Owned(OwnedFd),
    Shared(RawFd),
}

impl Descriptor {
    /// Raw descriptor number
    #[inline]
    pub fn raw(&self) -> RawFd {
        match self {
            Descriptor::Owned(fd) => fd.as_raw_fd(),
            Descriptor::Shared(fd) => *fd,
        }
    }

    /// Whether removal closes the descriptor
    #[inline]
    pub fn is_owned(&self) -> bool {
        matches!(self, Descriptor::Owned(_))
    }
}

impl From<OwnedFd> for Descriptor {
    fn from(fd: OwnedFd) -> Self {
        Descriptor::Owned(fd)
    }
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    index: usize,
    category: Category,
}

/// Fixed-capacity descriptor registry
pub struct Registry {
    /// Poll array, handed to the kernel as-is
    entries: Vec<WatchedDescriptor>,
    /// Ownership handles, parallel to `entries`
    handles: Vec<Descriptor>,
    /// fd -> (index, category)
    slots: HashMap<RawFd, Slot>,
    capacity: usize,
}

impl Registry {
    /// Create a registry that never holds more than `capacity` descriptors.
    ///
    /// All memory is reserved up front; the registry never grows.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            handles: Vec::with_capacity(capacity),
            slots: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    /// Start watching a descriptor. Returns its index.
    ///
    /// On failure the registry is unchanged and `descriptor` is dropped
    /// (an owned descriptor is therefore closed).
    pub fn register(
        &mut self,
        descriptor: Descriptor,
        category: Category,
        interest: Interest,
    ) -> Result<usize, RegistryError> {
        let fd = descriptor.raw();
        if self.capacity_reached() {
            return Err(RegistryError::CapacityExceeded);
        }
        if self.slots.contains_key(&fd) {
            return Err(RegistryError::AlreadyRegistered(fd));
        }

        let index = self.entries.len();
        self.entries.push(WatchedDescriptor::new(fd, interest));
        self.handles.push(descriptor);
        self.slots.insert(fd, Slot { index, category });
        Ok(index)
    }

    /// Stop watching the descriptor at `index` and release it.
    ///
    /// The last entry is moved into `index`. Returns the removed fd, or
    /// `None` if `index` is out of bounds.
    pub fn remove(&mut self, index: usize) -> Option<RawFd> {
        if index >= self.entries.len() {
            return None;
        }

        let removed = self.entries.swap_remove(index);
        let handle = self.handles.swap_remove(index);
        self.slots.remove(&removed.fd);

        if let Some(moved) = self.entries.get(index) {
            if let Some(slot) = self.slots.get_mut(&moved.fd) {
                slot.index = index;
            }
        }

        // Owned descriptors close here, exactly once.
        drop(handle);
        Some(removed.fd)
    }

    /// Remove by descriptor. Returns the index it occupied.
    pub fn remove_fd(&mut self, fd: RawFd) -> Option<usize> {
        let index = self.index_of(fd)?;
        self.remove(index);
        Some(index)
    }

    /// Add write interest to an existing entry
    #[inline]
    pub fn arm_write(&mut self, index: usize) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.events |= Interest::WRITABLE.bits();
        }
    }

    /// Replace the interest mask of an existing entry
    #[inline]
    pub fn set_interest(&mut self, index: usize, interest: Interest) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.events = interest.bits();
        }
    }

    /// Interest mask at `index`
    #[inline]
    pub fn interest(&self, index: usize) -> Interest {
        self.entries[index].interest()
    }

    /// Readiness reported by the last poll at `index`
    #[inline]
    pub fn readiness(&self, index: usize) -> Interest {
        self.entries[index].readiness()
    }

    /// Descriptor at `index`
    #[inline]
    pub fn descriptor(&self, index: usize) -> RawFd {
        self.entries[index].fd
    }

    /// Category of the descriptor at `index`
    pub fn category(&self, index: usize) -> Category {
        self.slots[&self.entries[index].fd].category
    }

    /// Category of a registered descriptor
    pub fn category_of(&self, fd: RawFd) -> Option<Category> {
        self.slots.get(&fd).map(|slot| slot.category)
    }

    /// Current index of a registered descriptor
    #[inline]
    pub fn index_of(&self, fd: RawFd) -> Option<usize> {
        self.slots.get(&fd).map(|slot| slot.index)
    }

    /// Whether `fd` is watched
    #[inline]
    pub fn contains(&self, fd: RawFd) -> bool {
        self.slots.contains_key(&fd)
    }

    /// Number of watched descriptors
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is watched
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fixed capacity
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `register` would fail with `CapacityExceeded`
    #[inline]
    pub fn capacity_reached(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Number of watched descriptors of a category
    pub fn count(&self, category: Category) -> usize {
        self.slots.values().filter(|slot| slot.category == category).count()
    }

    /// Forget all readiness reported by the last poll
    pub fn clear_readiness(&mut self) {
        for entry in &mut self.entries {
            entry.revents = 0;
        }
    }

    /// Overwrite the readiness at `index`. The kernel fills this in on
    /// every poll; the reactor clears an entry once it has handled it.
    pub fn set_readiness(&mut self, index: usize, readiness: Interest) {
        self.entries[index].revents = readiness.bits();
    }

    /// The entry array as `struct pollfd`s, for `poll(2)`
    pub fn as_pollfds_mut(&mut self) -> &mut [libc::pollfd] {
        let len = self.entries.len();
        let ptr = self.entries.as_mut_ptr() as *mut libc::pollfd;
        // Safety: WatchedDescriptor is repr(C) with the exact field types,
        // order, size and alignment of `struct pollfd` (asserted above).
        unsafe { core::slice::from_raw_parts_mut(ptr, len) }
    }

    /// Iterate `(index, entry, category)`
    pub fn iter(&self) -> impl Iterator<Item = (usize, &WatchedDescriptor, Category)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(move |(i, entry)| (i, entry, self.slots[&entry.fd].category))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    fn shared(fd: RawFd) -> Descriptor {
        Descriptor::Shared(fd)
    }

    fn fds(reg: &Registry) -> Vec<RawFd> {
        let mut v: Vec<RawFd> = (0..reg.len()).map(|i| reg.descriptor(i)).collect();
        v.sort();
        v
    }

    #[test]
    fn test_register_until_capacity() {
        let mut reg = Registry::with_capacity(3);
        for fd in 100..103 {
            reg.register(shared(fd), Category::ClientSocket, Interest::READABLE)
                .unwrap();
            assert!(reg.len() <= reg.capacity());
        }
        assert!(reg.capacity_reached());

        let before = fds(&reg);
        let err = reg
            .register(shared(200), Category::ClientSocket, Interest::READABLE)
            .unwrap_err();
        assert_eq!(err, RegistryError::CapacityExceeded);
        assert_eq!(fds(&reg), before);
        assert!(!reg.contains(200));
    }

    #[test]
    fn test_capacity_invariant_under_churn() {
        let mut reg = Registry::with_capacity(4);
        let mut next = 10;
        for round in 0..50 {
            if round % 3 == 2 && !reg.is_empty() {
                reg.remove(round % reg.len());
            } else {
                let _ = reg.register(shared(next), Category::Pipe, Interest::READABLE);
                next += 1;
            }
            assert!(reg.len() <= reg.capacity());
            assert_eq!(reg.slots.len(), reg.len());
        }
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut reg = Registry::with_capacity(4);
        reg.register(shared(5), Category::RegularFile, Interest::WRITABLE)
            .unwrap();
        let err = reg
            .register(shared(5), Category::RegularFile, Interest::WRITABLE)
            .unwrap_err();
        assert_eq!(err, RegistryError::AlreadyRegistered(5));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_swap_remove_moves_last_into_slot() {
        let mut reg = Registry::with_capacity(8);
        for fd in [10, 11, 12, 13] {
            reg.register(shared(fd), Category::ClientSocket, Interest::READABLE)
                .unwrap();
        }
        reg.register(shared(14), Category::Pipe, Interest::WRITABLE)
            .unwrap();

        assert_eq!(reg.remove(1), Some(11));
        assert_eq!(reg.len(), 4);
        assert_eq!(reg.descriptor(1), 14);
        assert_eq!(reg.index_of(14), Some(1));
        assert_eq!(reg.category(1), Category::Pipe);
        assert_eq!(reg.interest(1), Interest::WRITABLE);
        assert_eq!(fds(&reg), vec![10, 12, 13, 14]);
        assert!(!reg.contains(11));
    }

    #[test]
    fn test_remove_last_and_out_of_bounds() {
        let mut reg = Registry::with_capacity(2);
        reg.register(shared(1), Category::Listener, Interest::READABLE)
            .unwrap();
        reg.register(shared(2), Category::ClientSocket, Interest::READABLE)
            .unwrap();
        assert_eq!(reg.remove(1), Some(2));
        assert_eq!(reg.index_of(1), Some(0));
        assert_eq!(reg.remove(5), None);
        assert_eq!(reg.remove_fd(1), Some(0));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_arm_write_keeps_read_interest() {
        let mut reg = Registry::with_capacity(1);
        let i = reg
            .register(shared(9), Category::ClientSocket, Interest::READABLE)
            .unwrap();
        reg.arm_write(i);
        assert_eq!(reg.interest(i), Interest::READABLE | Interest::WRITABLE);
        reg.arm_write(i);
        assert_eq!(reg.interest(i), Interest::READABLE | Interest::WRITABLE);
        reg.set_interest(i, Interest::WRITABLE);
        assert_eq!(reg.interest(i), Interest::WRITABLE);
    }

    #[test]
    fn test_readiness_roundtrip_and_clear() {
        let mut reg = Registry::with_capacity(2);
        let i = reg
            .register(shared(3), Category::Pipe, Interest::READABLE)
            .unwrap();
        assert!(reg.readiness(i).is_idle());
        reg.set_readiness(i, Interest::READABLE | Interest::HUNGUP);
        assert!(reg.readiness(i).contains(Interest::READABLE));
        assert_eq!(reg.as_pollfds_mut()[i].revents, libc::POLLIN | libc::POLLHUP);
        reg.clear_readiness();
        assert!(reg.readiness(i).is_idle());
    }

    #[test]
    fn test_owned_descriptor_closed_on_remove() {
        let (ours, mut peer) = UnixStream::pair().unwrap();
        let fd = ours.as_raw_fd();
        let mut reg = Registry::with_capacity(2);
        reg.register(
            Descriptor::Owned(OwnedFd::from(ours)),
            Category::ClientSocket,
            Interest::READABLE,
        )
        .unwrap();
        assert_eq!(reg.remove_fd(fd), Some(0));

        // Peer sees EOF once our end is closed.
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_shared_descriptor_left_open() {
        let (mut ours, mut peer) = UnixStream::pair().unwrap();
        let mut reg = Registry::with_capacity(2);
        reg.register(shared(ours.as_raw_fd()), Category::RegularFile, Interest::WRITABLE)
            .unwrap();
        reg.remove(0);

        ours.write_all(b"x").unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).unwrap(), 1);
    }

    #[test]
    fn test_count_by_category() {
        let mut reg = Registry::with_capacity(4);
        reg.register(shared(1), Category::Listener, Interest::READABLE).unwrap();
        reg.register(shared(2), Category::ClientSocket, Interest::READABLE).unwrap();
        reg.register(shared(3), Category::ClientSocket, Interest::READABLE).unwrap();
        assert_eq!(reg.count(Category::ClientSocket), 2);
        assert_eq!(reg.count(Category::Pipe), 0);
        assert_eq!(reg.category_of(1), Some(Category::Listener));
        assert_eq!(reg.iter().count(), 3);
    }
}
