//! The CAN network interface: a single-threaded cooperative scheduler
//! multiplexing frame reception, timer expiry and frame transmission among
//! the protocol services of a node.
//!
//! Services register *receivers* (keyed by CAN identifier and frame format)
//! and *timers* (one-shot or periodic) carrying a caller-chosen token. The
//! owning node advances the clock with [`CanNet::set_time`], drains due
//! timers with [`CanNet::pop_expired`] and resolves receivers for an
//! incoming frame with [`CanNet::matches`], dispatching each token to the
//! service that owns it. Outbound frames are handed to the driver through
//! the installed send hook; this layer never buffers.

use crate::CanOpenError;
use crate::frame::{CAN_MASK_BID, CAN_MASK_EID, CanFrame};
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, BinaryHeap};
use alloc::vec::Vec;
use core::cmp::Reverse;

/// Handle of a timer record owned by a [`CanNet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(usize);

/// Handle of a receiver record owned by a [`CanNet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvHandle(usize);

/// The key under which receivers are indexed: the masked CAN identifier and
/// whether it is an extended (29-bit) identifier.
pub type RecvKey = (u32, bool);

/// A timer that became due, yielded by [`CanNet::pop_expired`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired<T> {
    /// The token the timer was created with.
    pub token: T,
    /// The deadline that elapsed (not the current time).
    pub deadline: u64,
}

/// The send hook installed by the driver.
pub type SendFn = dyn FnMut(&CanFrame) -> Result<(), CanOpenError>;

struct TimerSlot<T> {
    token: T,
    /// Bumped on every stop so that stale heap entries are discarded.
    generation: u32,
    armed: bool,
    deadline: u64,
    period: Option<u64>,
}

struct RecvSlot<T> {
    token: T,
    bound: Option<RecvKey>,
}

#[derive(PartialEq, Eq)]
struct HeapEntry {
    deadline: u64,
    /// Insertion order; breaks deadline ties first-inserted-first.
    seq: u64,
    slot: usize,
    generation: u32,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The CAN network interface. Generic over the token type `T` that
/// identifies the owner of each timer and receiver.
pub struct CanNet<T> {
    time: u64,
    timers: Vec<Option<TimerSlot<T>>>,
    free_timers: Vec<usize>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    seq: u64,
    recvs: Vec<Option<RecvSlot<T>>>,
    free_recvs: Vec<usize>,
    index: BTreeMap<RecvKey, Vec<RecvHandle>>,
    send_fn: Option<Box<SendFn>>,
}

impl<T: Copy> CanNet<T> {
    pub fn new() -> Self {
        Self {
            time: 0,
            timers: Vec::new(),
            free_timers: Vec::new(),
            heap: BinaryHeap::new(),
            seq: 0,
            recvs: Vec::new(),
            free_recvs: Vec::new(),
            index: BTreeMap::new(),
            send_fn: None,
        }
    }

    // --- Clock ---

    /// Returns the current time in microseconds.
    pub fn time(&self) -> u64 {
        self.time
    }

    /// Sets the current time.
    ///
    /// Timers whose deadline is at or before the new time become due and are
    /// yielded by [`CanNet::pop_expired`] in deadline order (ties broken by
    /// insertion order). The caller must keep the clock monotonically
    /// non-decreasing.
    pub fn set_time(&mut self, now_us: u64) {
        self.time = now_us;
    }

    /// Pops the next due timer, if any.
    ///
    /// A periodic timer is re-armed with its deadline advanced by its period
    /// *before* it is yielded, so the dispatched service may stop or restart
    /// it freely.
    pub fn pop_expired(&mut self) -> Option<Expired<T>> {
        loop {
            let Reverse(head) = self.heap.peek()?;
            if head.deadline > self.time {
                return None;
            }
            let Reverse(entry) = self.heap.pop().expect("peeked entry");
            let seq = self.next_seq();
            let Some(slot) = self.timers.get_mut(entry.slot).and_then(Option::as_mut) else {
                continue;
            };
            if slot.generation != entry.generation || !slot.armed {
                // Stale entry of a stopped or restarted timer.
                continue;
            }
            let token = slot.token;
            let deadline = entry.deadline;
            if let Some(period) = slot.period {
                slot.deadline = deadline.saturating_add(period);
                self.heap.push(Reverse(HeapEntry {
                    deadline: slot.deadline,
                    seq,
                    slot: entry.slot,
                    generation: slot.generation,
                }));
            } else {
                slot.armed = false;
            }
            return Some(Expired { token, deadline });
        }
    }

    /// Returns the deadline of the earliest armed timer, in microseconds.
    ///
    /// Drivers use this to sleep until the next time [`CanNet::set_time`]
    /// needs to be called.
    pub fn next_deadline(&self) -> Option<u64> {
        // Skip stale heap entries without disturbing the heap.
        self.heap
            .iter()
            .filter_map(|Reverse(e)| {
                let slot = self.timers.get(e.slot)?.as_ref()?;
                (slot.armed && slot.generation == e.generation && slot.deadline == e.deadline)
                    .then_some(e.deadline)
            })
            .min()
    }

    // --- Timers ---

    /// Creates a timer owned by the service identified by `token`. The timer
    /// is initially stopped.
    pub fn timer_create(&mut self, token: T) -> TimerHandle {
        let slot = TimerSlot {
            token,
            generation: 0,
            armed: false,
            deadline: 0,
            period: None,
        };
        match self.free_timers.pop() {
            Some(i) => {
                self.timers[i] = Some(slot);
                TimerHandle(i)
            }
            None => {
                self.timers.push(Some(slot));
                TimerHandle(self.timers.len() - 1)
            }
        }
    }

    /// Arms a timer to fire at the absolute time `start_us`, and every
    /// `period_us` thereafter if a period is given. Restarting an armed
    /// timer re-schedules it.
    pub fn timer_start(&mut self, handle: TimerHandle, start_us: u64, period_us: Option<u64>) {
        let seq = self.next_seq();
        let Some(slot) = self.timers.get_mut(handle.0).and_then(Option::as_mut) else {
            return;
        };
        slot.generation = slot.generation.wrapping_add(1);
        slot.armed = true;
        slot.deadline = start_us;
        slot.period = period_us;
        self.heap.push(Reverse(HeapEntry {
            deadline: start_us,
            seq,
            slot: handle.0,
            generation: slot.generation,
        }));
    }

    /// Arms a one-shot timer `timeout_us` from the current time.
    pub fn timer_after(&mut self, handle: TimerHandle, timeout_us: u64) {
        let deadline = self.time.saturating_add(timeout_us);
        self.timer_start(handle, deadline, None);
    }

    /// Stops a timer. Stopping a stopped timer is a no-op.
    pub fn timer_stop(&mut self, handle: TimerHandle) {
        if let Some(slot) = self.timers.get_mut(handle.0).and_then(Option::as_mut) {
            slot.generation = slot.generation.wrapping_add(1);
            slot.armed = false;
        }
    }

    /// Destroys a timer, releasing its record.
    pub fn timer_destroy(&mut self, handle: TimerHandle) {
        if let Some(slot) = self.timers.get_mut(handle.0) {
            if slot.take().is_some() {
                self.free_timers.push(handle.0);
            }
        }
    }

    // --- Receivers ---

    /// Creates a receiver owned by the service identified by `token`. The
    /// receiver is initially unbound.
    pub fn recv_create(&mut self, token: T) -> RecvHandle {
        let slot = RecvSlot { token, bound: None };
        match self.free_recvs.pop() {
            Some(i) => {
                self.recvs[i] = Some(slot);
                RecvHandle(i)
            }
            None => {
                self.recvs.push(Some(slot));
                RecvHandle(self.recvs.len() - 1)
            }
        }
    }

    /// Binds a receiver to a CAN identifier. Starting a started receiver
    /// re-binds it.
    pub fn recv_start(&mut self, handle: RecvHandle, id: u32, extended: bool) {
        self.recv_stop(handle);
        let mask = if extended { CAN_MASK_EID } else { CAN_MASK_BID };
        let key = (id & mask, extended);
        if let Some(slot) = self.recvs.get_mut(handle.0).and_then(Option::as_mut) {
            slot.bound = Some(key);
            self.index.entry(key).or_default().push(handle);
        }
    }

    /// Unbinds a receiver. Stopping an unstarted receiver is a no-op.
    pub fn recv_stop(&mut self, handle: RecvHandle) {
        let Some(slot) = self.recvs.get_mut(handle.0).and_then(Option::as_mut) else {
            return;
        };
        let Some(key) = slot.bound.take() else {
            return;
        };
        if let Some(list) = self.index.get_mut(&key) {
            list.retain(|&h| h != handle);
            if list.is_empty() {
                self.index.remove(&key);
            }
        }
    }

    /// Destroys a receiver, releasing its record.
    pub fn recv_destroy(&mut self, handle: RecvHandle) {
        self.recv_stop(handle);
        if let Some(slot) = self.recvs.get_mut(handle.0) {
            if slot.take().is_some() {
                self.free_recvs.push(handle.0);
            }
        }
    }

    /// Resolves the receivers registered for `frame`, most recently
    /// registered first.
    ///
    /// The returned handles are a snapshot: a dispatched service may start or
    /// stop receivers, so the caller must re-validate each handle with
    /// [`CanNet::recv_token`] before dispatching to it.
    pub fn matches(&self, frame: &CanFrame) -> Vec<RecvHandle> {
        let key = frame.recv_key();
        match self.index.get(&key) {
            Some(list) => list.iter().rev().copied().collect(),
            None => Vec::new(),
        }
    }

    /// Returns the token of `handle` if the receiver is still bound to the
    /// key it matched under.
    pub fn recv_token(&self, handle: RecvHandle, frame: &CanFrame) -> Option<T> {
        let slot = self.recvs.get(handle.0)?.as_ref()?;
        (slot.bound == Some(frame.recv_key())).then_some(slot.token)
    }

    // --- Egress ---

    /// Installs the driver's send hook.
    pub fn set_send_fn(&mut self, f: Box<SendFn>) {
        self.send_fn = Some(f);
    }

    /// Hands a frame to the driver. The result of the send hook is
    /// propagated verbatim; no buffering happens at this layer.
    pub fn send(&mut self, frame: &CanFrame) -> Result<(), CanOpenError> {
        match &mut self.send_fn {
            Some(f) => f(frame),
            None => Err(CanOpenError::NoDriver),
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }
}

impl<T: Copy> Default for CanNet<T> {
    fn default() -> Self {
        Self::new()
    }
}
