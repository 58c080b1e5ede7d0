use crate::context::SingleIssuerRing;
use crate::utils::sys::get_page_size;
use bytes::Bytes;
use io_uring::types::BufRingEntry;
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::RefCell;
use std::fmt;
use std::io;
use std::ptr::NonNull;
use std::rc::Weak;
use std::sync::atomic::{AtomicU16, Ordering};
use tracing::{debug, warn};

/// Kernel limit on the number of entries in a provided buffer ring.
pub(crate) const MAX_RING_ENTRIES: u16 = 1 << 15;

/// Buffer id, the index of a slot in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bid(u16);

impl Bid {
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    #[inline(always)]
    pub const fn val(self) -> u16 {
        self.0
    }

    #[inline(always)]
    const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Bid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferPoolError {
    #[error("unknown buffer id {0}")]
    InvalidBid(Bid),

    #[error("buffer {0} is already claimed")]
    AlreadyClaimed(Bid),

    #[error("buffer {0} is not claimed")]
    NotClaimed(Bid),

    #[error("kernel filled {len} bytes in buffer {bid} of {buf_size} bytes")]
    TooLarge { bid: Bid, len: usize, buf_size: usize },

    #[error("read of {requested} bytes at offset {cursor} past the {filled} bytes of buffer {bid}")]
    OutOfRange {
        bid: Bid,
        cursor: usize,
        requested: usize,
        filled: usize,
    },

    #[error("buffer pool was released")]
    Released,
}

/// Buffer pool settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolConfig {
    /// Size in bytes of every slot.
    pub buf_size: usize,
    /// Slots allocated when the pool is created.
    pub initial_entries: u16,
    /// Upper bound on slots, `expand_buffer` stops there.
    pub max_entries: u16,
    /// Buffer group id the pool is registered under.
    pub bgid: u16,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            buf_size: 4096,
            initial_entries: 64,
            max_entries: 256,
            bgid: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Published in the ring, the kernel may write into it.
    Available,
    /// Handed to a task by a completion, being drained.
    Claimed,
}

struct Slot {
    data: Box<[u8]>,
    cursor: usize,
    filled: usize,
    state: SlotState,
}

/// Fixed-size buffers registered with the kernel as a provided buffer ring,
/// used by multishot receive so the kernel picks an idle slot itself.
///
/// The control ring is sized for `max_entries` up front. Slots are appended
/// lazily by [`BufferPool::expand_buffer`] and each one keeps a stable heap
/// address for the lifetime of the pool.
pub struct BufferPool {
    // Control ring, shared with the kernel.
    ring_ptr: NonNull<BufRingEntry>,
    ring_layout: Layout,
    tail_addr: NonNull<AtomicU16>,
    mask: u16,

    bgid: u16,
    buf_size: usize,
    max_entries: u16,
    slots: Vec<Slot>,
    registered: bool,
}

impl BufferPool {
    /// Allocates the control ring and the initial slots. Nothing is shared
    /// with the kernel until [`BufferPool::register`].
    pub(crate) fn try_new(cfg: &BufferPoolConfig) -> io::Result<Self> {
        let ring_entries = cfg.max_entries.max(1).next_power_of_two();
        let (ring_ptr, ring_layout) = Self::alloc_control_ring(ring_entries)?;

        let tail_addr = unsafe {
            NonNull::new_unchecked(BufRingEntry::tail(ring_ptr.as_ptr()) as *mut AtomicU16)
        };

        let mut pool = Self {
            ring_ptr,
            ring_layout,
            tail_addr,
            mask: ring_entries - 1,
            bgid: cfg.bgid,
            buf_size: cfg.buf_size,
            max_entries: cfg.max_entries,
            slots: Vec::with_capacity(cfg.initial_entries as usize),
            registered: false,
        };

        for _ in 0..cfg.initial_entries.min(cfg.max_entries) {
            pool.expand_buffer();
        }

        Ok(pool)
    }

    pub(crate) fn register(&mut self, ring: &SingleIssuerRing) -> io::Result<()> {
        let ring_entries = self.mask + 1;

        // SAFETY: the control ring is page aligned, sized for `ring_entries`
        // and outlives the registration.
        unsafe {
            ring.submitter().register_buf_ring_with_flags(
                self.ring_ptr.as_ptr() as u64,
                ring_entries,
                self.bgid,
                0,
            )?;
        }

        self.registered = true;
        Ok(())
    }

    pub(crate) fn unregister(&mut self, ring: &SingleIssuerRing) {
        if !std::mem::take(&mut self.registered) {
            return;
        }

        if let Err(e) = ring.submitter().unregister_buf_ring(self.bgid) {
            warn!(bgid = self.bgid, error = %e, "failed to unregister buffer ring");
        }
    }

    pub fn bgid(&self) -> u16 {
        self.bgid
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Number of allocated slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn max_entries(&self) -> u16 {
        self.max_entries
    }

    /// Slots the kernel can currently pick.
    pub fn available(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state == SlotState::Available)
            .count()
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Appends one slot and publishes it to the kernel.
    ///
    /// Returns `false`, logging a warning, once the pool holds
    /// `max_entries` slots. No allocation happens in that case.
    pub fn expand_buffer(&mut self) -> bool {
        if self.slots.len() >= self.max_entries as usize {
            warn!(
                bgid = self.bgid,
                max_entries = self.max_entries,
                "buffer pool at capacity, not expanding"
            );
            return false;
        }

        let bid = Bid::new(self.slots.len() as u16);
        self.slots.push(Slot {
            data: vec![0; self.buf_size].into_boxed_slice(),
            cursor: 0,
            filled: 0,
            state: SlotState::Available,
        });
        self.publish(bid);

        debug!(bgid = self.bgid, bid = bid.val(), "buffer pool expanded");
        true
    }

    /// Hands slot `bid` to a task after the kernel wrote `len` bytes into it.
    pub(crate) fn claim(&mut self, bid: Bid, len: usize) -> Result<(), BufferPoolError> {
        let buf_size = self.buf_size;
        let slot = self.slot_mut(bid)?;

        if slot.state == SlotState::Claimed {
            return Err(BufferPoolError::AlreadyClaimed(bid));
        }

        if len > buf_size {
            return Err(BufferPoolError::TooLarge { bid, len, buf_size });
        }

        slot.state = SlotState::Claimed;
        slot.cursor = 0;
        slot.filled = len;

        Ok(())
    }

    /// Returns the next `length` bytes of slot `bid`, starting at its cursor,
    /// and advances the cursor.
    pub fn read_data(&mut self, bid: Bid, length: usize) -> Result<Bytes, BufferPoolError> {
        let slot = self.claimed_slot_mut(bid)?;

        let Some(end) = slot.cursor.checked_add(length).filter(|&end| end <= slot.filled) else {
            return Err(BufferPoolError::OutOfRange {
                bid,
                cursor: slot.cursor,
                requested: length,
                filled: slot.filled,
            });
        };

        let data = Bytes::copy_from_slice(&slot.data[slot.cursor..end]);
        slot.cursor = end;

        Ok(data)
    }

    /// Bytes of slot `bid` not read yet.
    pub fn remaining(&self, bid: Bid) -> Result<usize, BufferPoolError> {
        let slot = self
            .slots
            .get(bid.index())
            .ok_or(BufferPoolError::InvalidBid(bid))?;

        match slot.state {
            SlotState::Claimed => Ok(slot.filled - slot.cursor),
            SlotState::Available => Err(BufferPoolError::NotClaimed(bid)),
        }
    }

    /// Returns slot `bid` to the kernel: resets its cursor and republishes it
    /// in the ring.
    pub fn mark_used(&mut self, bid: Bid) -> Result<(), BufferPoolError> {
        let slot = self.claimed_slot_mut(bid)?;
        slot.cursor = 0;
        slot.filled = 0;
        slot.state = SlotState::Available;

        self.publish(bid);
        Ok(())
    }
}

// Private helpers.
impl BufferPool {
    fn slot_mut(&mut self, bid: Bid) -> Result<&mut Slot, BufferPoolError> {
        self.slots
            .get_mut(bid.index())
            .ok_or(BufferPoolError::InvalidBid(bid))
    }

    fn claimed_slot_mut(&mut self, bid: Bid) -> Result<&mut Slot, BufferPoolError> {
        let slot = self.slot_mut(bid)?;
        match slot.state {
            SlotState::Claimed => Ok(slot),
            SlotState::Available => Err(BufferPoolError::NotClaimed(bid)),
        }
    }

    fn publish(&mut self, bid: Bid) {
        let tail = self.tail();
        let idx = (tail & self.mask) as usize;

        let slot = &mut self.slots[bid.index()];
        unsafe {
            let entry = self.ring_ptr.as_ptr().add(idx);
            (*entry).set_addr(slot.data.as_mut_ptr() as u64);
            (*entry).set_len(self.buf_size as u32);
            (*entry).set_bid(bid.val());
        }

        // Release: the entry must be visible before the kernel sees the tail.
        unsafe {
            self.tail_addr.as_ref().store(tail.wrapping_add(1), Ordering::Release);
        }
    }

    fn tail(&self) -> u16 {
        // Relaxed is fine, we are the only writer.
        unsafe { self.tail_addr.as_ref().load(Ordering::Relaxed) }
    }

    fn alloc_control_ring(entries: u16) -> io::Result<(NonNull<BufRingEntry>, Layout)> {
        let entry_size = std::mem::size_of::<BufRingEntry>();
        let layout = Layout::from_size_align(
            entry_size * entries as usize,
            get_page_size(), // The kernel requires a page-aligned ring.
        )
        .map_err(io::Error::other)?;

        let ptr = NonNull::new(unsafe { alloc_zeroed(layout).cast() })
            .ok_or_else(|| io::Error::other("OOM: failed to alloc buffer control ring"))?;

        Ok((ptr, layout))
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        debug_assert!(
            !self.registered,
            "buffer pool dropped while still registered with the kernel"
        );

        unsafe { dealloc(self.ring_ptr.as_ptr().cast(), self.ring_layout) };
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("bgid", &self.bgid)
            .field("buf_size", &self.buf_size)
            .field("len", &self.len())
            .field("available", &self.available())
            .field("max_entries", &self.max_entries)
            .field("registered", &self.registered)
            .finish()
    }
}

/// A pool slot holding data received by the kernel.
///
/// The slot is marked used, and handed back to the kernel, when this value
/// is dropped.
pub struct PooledBuf {
    pool: Weak<RefCell<BufferPool>>,
    bid: Bid,
    len: usize,
}

impl PooledBuf {
    pub(crate) fn new(pool: Weak<RefCell<BufferPool>>, bid: Bid, len: usize) -> Self {
        Self { pool, bid, len }
    }

    pub fn bid(&self) -> Bid {
        self.bid
    }

    /// Bytes written by the kernel.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads the next `length` bytes and advances the slot cursor.
    pub fn read_data(&self, length: usize) -> Result<Bytes, BufferPoolError> {
        let pool = self.pool.upgrade().ok_or(BufferPoolError::Released)?;
        let mut pool = pool.borrow_mut();
        pool.read_data(self.bid, length)
    }

    /// Reads everything not read yet.
    pub fn to_bytes(&self) -> Result<Bytes, BufferPoolError> {
        let pool = self.pool.upgrade().ok_or(BufferPoolError::Released)?;
        let mut pool = pool.borrow_mut();
        let remaining = pool.remaining(self.bid)?;
        pool.read_data(self.bid, remaining)
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };

        match pool.try_borrow_mut() {
            Ok(mut pool) => {
                if let Err(e) = pool.mark_used(self.bid) {
                    warn!(bid = self.bid.val(), error = %e, "failed to recycle buffer");
                }
            }
            Err(_) => warn!(bid = self.bid.val(), "buffer pool busy, slot not recycled"),
        }
    }
}

impl fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuf")
            .field("bid", &self.bid)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::rc::Rc;

    fn cfg(initial_entries: u16, max_entries: u16) -> BufferPoolConfig {
        BufferPoolConfig {
            buf_size: 64,
            initial_entries,
            max_entries,
            bgid: 0,
        }
    }

    // Simulates the kernel writing into a slot it picked.
    fn kernel_write(pool: &mut BufferPool, bid: Bid, data: &[u8]) {
        pool.slots[bid.index()].data[..data.len()].copy_from_slice(data);
        pool.claim(bid, data.len()).unwrap();
    }

    #[rstest]
    #[case::empty(0, 4)]
    #[case::partial(2, 4)]
    #[case::full(4, 4)]
    fn test_expand_stops_at_max(#[case] initial: u16, #[case] max: u16) -> io::Result<()> {
        let mut pool = BufferPool::try_new(&cfg(initial, max))?;
        assert_eq!(pool.len(), initial as usize);

        let missing = (max - initial) as usize;
        let grown = (0..=missing).filter(|_| pool.expand_buffer()).count();

        assert_eq!(grown, missing);
        assert_eq!(pool.len(), max as usize);
        assert!(!pool.expand_buffer());
        assert_eq!(pool.len(), max as usize);
        Ok(())
    }

    #[test]
    fn test_publish_advances_tail() -> io::Result<()> {
        let mut pool = BufferPool::try_new(&cfg(3, 8))?;
        assert_eq!(pool.tail(), 3);

        kernel_write(&mut pool, Bid::new(1), b"abc");
        pool.mark_used(Bid::new(1)).unwrap();
        assert_eq!(pool.tail(), 4);
        Ok(())
    }

    #[test]
    fn test_read_data_advances_cursor() -> io::Result<()> {
        let mut pool = BufferPool::try_new(&cfg(2, 2))?;
        let bid = Bid::new(0);
        kernel_write(&mut pool, bid, b"hello world");

        assert_eq!(pool.available(), 1);
        assert_eq!(pool.read_data(bid, 5).unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(pool.remaining(bid).unwrap(), 6);
        assert_eq!(pool.read_data(bid, 6).unwrap(), Bytes::from_static(b" world"));

        assert_eq!(
            pool.read_data(bid, 1),
            Err(BufferPoolError::OutOfRange {
                bid,
                cursor: 11,
                requested: 1,
                filled: 11
            })
        );
        Ok(())
    }

    #[test]
    fn test_read_data_huge_length_is_out_of_range() -> io::Result<()> {
        let mut pool = BufferPool::try_new(&cfg(1, 1))?;
        let bid = Bid::new(0);
        kernel_write(&mut pool, bid, b"abcd");

        assert_eq!(pool.read_data(bid, 1).unwrap(), Bytes::from_static(b"a"));
        assert_eq!(
            pool.read_data(bid, usize::MAX),
            Err(BufferPoolError::OutOfRange {
                bid,
                cursor: 1,
                requested: usize::MAX,
                filled: 4
            })
        );
        assert_eq!(pool.remaining(bid).unwrap(), 3);
        Ok(())
    }

    #[test]
    fn test_slot_must_be_marked_used_before_reuse() -> io::Result<()> {
        let mut pool = BufferPool::try_new(&cfg(1, 1))?;
        let bid = Bid::new(0);

        assert_eq!(pool.read_data(bid, 1), Err(BufferPoolError::NotClaimed(bid)));
        assert_eq!(pool.mark_used(bid), Err(BufferPoolError::NotClaimed(bid)));

        kernel_write(&mut pool, bid, b"x");
        assert_eq!(pool.claim(bid, 1), Err(BufferPoolError::AlreadyClaimed(bid)));

        pool.mark_used(bid).unwrap();
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.remaining(bid), Err(BufferPoolError::NotClaimed(bid)));
        Ok(())
    }

    #[test]
    fn test_claim_rejects_bad_input() -> io::Result<()> {
        let mut pool = BufferPool::try_new(&cfg(1, 1))?;

        assert_eq!(
            pool.claim(Bid::new(9), 1),
            Err(BufferPoolError::InvalidBid(Bid::new(9)))
        );
        assert_eq!(
            pool.claim(Bid::new(0), 65),
            Err(BufferPoolError::TooLarge {
                bid: Bid::new(0),
                len: 65,
                buf_size: 64
            })
        );
        Ok(())
    }

    #[test]
    fn test_pooled_buf_recycles_on_drop() -> io::Result<()> {
        let pool = Rc::new(RefCell::new(BufferPool::try_new(&cfg(1, 1))?));
        let bid = Bid::new(0);
        kernel_write(&mut pool.borrow_mut(), bid, b"ping");

        let buf = PooledBuf::new(Rc::downgrade(&pool), bid, 4);
        assert_eq!(buf.read_data(2).unwrap(), Bytes::from_static(b"pi"));
        assert_eq!(buf.to_bytes().unwrap(), Bytes::from_static(b"ng"));
        assert_eq!(pool.borrow().available(), 0);

        drop(buf);
        assert_eq!(pool.borrow().available(), 1);
        Ok(())
    }

    #[test]
    fn test_pooled_buf_outliving_pool() -> io::Result<()> {
        let pool = Rc::new(RefCell::new(BufferPool::try_new(&cfg(1, 1))?));
        let buf = PooledBuf::new(Rc::downgrade(&pool), Bid::new(0), 0);
        drop(pool);

        assert_eq!(buf.read_data(0), Err(BufferPoolError::Released));
        Ok(())
    }
}
