//! Per-shard weighted fair scheduler.
//!
//! A fair queue lets multiple request producers queue work that is served
//! proportionally to their classes' shares. Each priority class keeps its
//! own FIFO and an accumulated-cost counter scaled by `1/shares`; the class
//! with the smallest accumulated cost runs next, so higher shares mean
//! slower accumulation and more service.
//!
//! Classes that return from idle are not rewarded with unbounded catch-up:
//! on the empty-to-nonempty transition the accumulator is clamped to at most
//! `tau` behind the busiest class seen so far, bounding how long a newcomer
//! may monopolise the device.
//!
//! Capacity comes from the shared [`FairGroup`]. Grabbing is optimistic: the
//! group always hands out a tail position, and when that position is past
//! the replenishment head the queue parks the request in a single pending
//! reservation and retries on the next dispatch. Requests cheaper than the
//! outstanding reservation may take it over; more expensive ones wait their
//! turn.

use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

use shoal_core::{ClassId, IoTicket};
use tracing::debug;

use crate::fair_group::{Capacity, FairGroup, SignedCapacity, FIXED_POINT_FACTOR};

/// Default fairness decay window, in microseconds.
pub const DEFAULT_TAU_US: u64 = 5_000;

/// Configuration for a fair queue.
#[derive(Debug, Clone)]
pub struct FairQueueConfig {
    /// Human-readable label used in logs.
    pub label: String,

    /// Fairness decay window in microseconds: how much idle credit a class
    /// may redeem when it becomes active again.
    pub tau_us: u64,
}

impl FairQueueConfig {
    /// Creates a configuration for testing.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            label: "test".to_string(),
            tau_us: DEFAULT_TAU_US,
        }
    }
}

impl Default for FairQueueConfig {
    fn default() -> Self {
        Self {
            label: String::new(),
            tau_us: DEFAULT_TAU_US,
        }
    }
}

/// Handle to a queued entry, returned by [`FairQueue::queue`].
///
/// The handle stays valid until the entry is dispatched or cancelled;
/// using it afterwards refers to nothing (or, if the storage slot has been
/// reused, to a different entry) and is a caller error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(u32);

/// Per-class metrics in capacity-token units (seconds of device time).
#[derive(Debug, Clone, Copy)]
pub struct ClassMetrics {
    /// Cumulative device time consumed by this class. Monotone; an
    /// increment rate of one per second means full utilisation.
    pub consumption: f64,

    /// Consumed device time adjusted for class shares and idling
    /// preemption.
    pub adjusted_consumption: f64,
}

/// Queue-wide accounting counters.
#[derive(Debug, Clone, Copy)]
pub struct FairQueueStats {
    /// Number of requests waiting in class FIFOs.
    pub requests_queued: u32,
    /// Number of requests dispatched but not yet finished.
    pub requests_executing: u32,
    /// Resources (weight, size) waiting in class FIFOs.
    pub resources_queued: IoTicket,
    /// Resources (weight, size) dispatched but not yet finished.
    pub resources_executing: IoTicket,
}

/// Outcome of trying to reserve capacity for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GrabResult {
    /// Capacity reserved; the entry may dispatch now.
    Grabbed,
    /// The group is out of capacity; a reservation was parked.
    Pending,
    /// The outstanding reservation does not fit this entry.
    CantPreempt,
}

/// An outstanding promise from the group: dispatching resumes once the head
/// rover crosses `head`. `cap` is what the reservation holds, so a switch to
/// a cheaper head-of-line can return the surplus.
#[derive(Debug, Clone, Copy)]
struct Pending {
    head: Capacity,
    cap: Capacity,
}

/// Storage slot for one queued entry.
#[derive(Debug)]
struct Slot<T> {
    ticket: IoTicket,
    payload: Option<T>,
    cancelled: bool,
}

/// State of one priority class.
#[derive(Debug)]
struct PriorityClass {
    shares: u32,

    /// Accumulated cost, scaled by `1/shares` and clamped on idle return.
    accumulated: SignedCapacity,

    /// Raw cost consumed, unscaled. For observability only.
    pure_accumulated: Capacity,

    /// FIFO of entry slot indices.
    queue: VecDeque<u32>,

    /// Whether a handle for this class is in the heap.
    queued: bool,

    /// Whether the class is eligible to run.
    plugged: bool,
}

impl PriorityClass {
    fn new(shares: u32) -> Self {
        Self {
            shares: shares.max(1),
            accumulated: 0,
            pure_accumulated: 0,
            queue: VecDeque::new(),
            queued: false,
            plugged: true,
        }
    }

    fn update_shares(&mut self, shares: u32) {
        self.shares = shares.max(1);
    }
}

/// Heap handle: a snapshot of a class's accumulated cost taken when the
/// class was pushed. A class's accumulator only changes while its handle is
/// out of the heap, so snapshots stay accurate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ClassHandle {
    accumulated: SignedCapacity,
    id: ClassId,
}

impl Ord for ClassHandle {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: the smallest accumulated cost sits on top of the
        // (max-)heap. Ties go to the lower class id.
        other
            .accumulated
            .cmp(&self.accumulated)
            .then_with(|| other.id.get().cmp(&self.id.get()))
    }
}

impl PartialOrd for ClassHandle {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The per-shard weighted fair scheduler.
///
/// One fair queue exists per device per shard; all queues of one device
/// share a [`FairGroup`]. The queue is single-threaded and cooperative: no
/// operation suspends and no locks are held across the dispatch callback.
///
/// `T` is the caller's opaque request payload, handed back through the
/// dispatch callback together with the ticket it was queued with.
pub struct FairQueue<T> {
    config: FairQueueConfig,
    group: Arc<FairGroup>,

    /// This queue's record of the group's last replenishment, batching
    /// clock reads.
    group_replenish_us: u64,

    resources_executing: IoTicket,
    resources_queued: IoTicket,
    requests_executing: u32,
    requests_queued: u32,

    handles: BinaryHeap<ClassHandle>,
    classes: Vec<Option<PriorityClass>>,

    /// Largest accumulated cost seen at dispatch; newcomers fast-forward
    /// to at most `tau` behind this.
    last_accumulated: SignedCapacity,

    pending: Option<Pending>,

    slots: Vec<Option<Slot<T>>>,
    free_slots: Vec<u32>,
}

impl<T> FairQueue<T> {
    /// Creates a fair queue attached to `group`.
    ///
    /// # Arguments
    ///
    /// * `group` - The shared capacity group of this queue's device.
    /// * `config` - Queue configuration.
    /// * `now_us` - Current time in microseconds.
    #[must_use]
    pub fn new(group: Arc<FairGroup>, config: FairQueueConfig, now_us: u64) -> Self {
        Self {
            config,
            group,
            group_replenish_us: now_us,
            resources_executing: IoTicket::default(),
            resources_queued: IoTicket::default(),
            requests_executing: 0,
            requests_queued: 0,
            handles: BinaryHeap::new(),
            classes: Vec::new(),
            last_accumulated: 0,
            pending: None,
            slots: Vec::new(),
            free_slots: Vec::new(),
        }
    }

    /// Returns the queue label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.config.label
    }

    /// Registers a priority class with the given number of shares.
    ///
    /// Ids are small dense integers; the queue grows its class table to
    /// `id + 1`. Zero shares are bumped to one.
    ///
    /// # Panics
    ///
    /// Panics if `id` is already registered.
    pub fn register_priority_class(&mut self, id: ClassId, shares: u32) {
        if id.index() >= self.classes.len() {
            self.classes.resize_with(id.index() + 1, || None);
        }
        assert!(
            self.classes[id.index()].is_none(),
            "class id is already registered"
        );
        self.classes[id.index()] = Some(PriorityClass::new(shares));
        debug!(label = %self.config.label, class = %id, shares, "registered priority class");
    }

    /// Unregisters a priority class and releases its slot.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not registered or the class still has queued
    /// requests that were not cancelled.
    pub fn unregister_priority_class(&mut self, id: ClassId) {
        let pc = self.classes[id.index()]
            .take()
            .expect("unregistering an unknown class");
        for idx in pc.queue {
            let slot = self.slots[idx as usize]
                .take()
                .expect("queued slot is live");
            assert!(slot.cancelled, "unregistering a class with queued requests");
            self.free_slots.push(idx);
        }
        if pc.queued {
            self.handles.retain(|h| h.id != id);
        }
        debug!(label = %self.config.label, class = %id, "unregistered priority class");
    }

    /// Updates the shares of a class; takes effect on its next cost
    /// accumulation.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not registered.
    pub fn update_shares_for_class(&mut self, id: ClassId, shares: u32) {
        self.classes[id.index()]
            .as_mut()
            .expect("updating shares of an unknown class")
            .update_shares(shares);
    }

    /// Marks a class eligible to run again.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not registered or the class is already plugged.
    pub fn plug_class(&mut self, id: ClassId) {
        let pc = self.classes[id.index()]
            .as_mut()
            .expect("plugging an unknown class");
        assert!(!pc.plugged, "class is already plugged");
        debug_assert!(!pc.queued);
        pc.plugged = true;
        if !pc.queue.is_empty() {
            self.push_priority_class_from_idle(id);
        }
    }

    /// Suspends a class: it is removed from scheduling even if it has
    /// queued requests, until plugged again.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not registered or the class is not plugged.
    pub fn unplug_class(&mut self, id: ClassId) {
        let pc = self.classes[id.index()]
            .as_mut()
            .expect("unplugging an unknown class");
        assert!(pc.plugged, "class is not plugged");
        pc.plugged = false;
        if pc.queued {
            pc.queued = false;
            self.handles.retain(|h| h.id != id);
        }
    }

    /// Queues a request on class `id` and returns its handle.
    ///
    /// The caller must eventually call [`Self::notify_request_finished`]
    /// with the same ticket once the dispatched request completes,
    /// regardless of success or failure.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not registered.
    pub fn queue(&mut self, id: ClassId, ticket: IoTicket, payload: T) -> EntryId {
        let slot_idx = self.alloc_slot(ticket, payload);
        {
            let pc = self.classes[id.index()]
                .as_ref()
                .expect("queueing on an unregistered class");
            if pc.plugged {
                self.push_priority_class_from_idle(id);
            }
        }
        let pc = self.classes[id.index()]
            .as_mut()
            .expect("queueing on an unregistered class");
        pc.queue.push_back(slot_idx);
        self.resources_queued += ticket;
        self.requests_queued += 1;
        EntryId(slot_idx)
    }

    /// Notifies that one dispatched request finished, returning its
    /// capacity to the group.
    ///
    /// `ticket` must be the ticket the request was queued with.
    pub fn notify_request_finished(&mut self, ticket: IoTicket) {
        self.resources_executing -= ticket;
        self.requests_executing -= 1;
        self.group.release_capacity(self.group.ticket_capacity(ticket));
    }

    /// Cancels a queued request, returning its payload.
    ///
    /// Completes in O(1): the entry's ticket stops counting immediately and
    /// the storage is reclaimed lazily. Returns `None` if the entry was
    /// already dispatched or cancelled.
    pub fn notify_request_cancelled(&mut self, id: EntryId) -> Option<T> {
        let slot = self.slots.get_mut(id.0 as usize)?.as_mut()?;
        if slot.cancelled {
            return None;
        }
        slot.cancelled = true;
        self.resources_queued -= slot.ticket;
        slot.ticket = IoTicket::default();
        self.requests_queued -= 1;
        slot.payload.take()
    }

    /// Dispatches ready requests through `cb` until the heap drains, the
    /// group denies capacity, or this shard's per-round budget is spent.
    ///
    /// The callback receives the entry's ticket and payload; the caller is
    /// expected to submit the I/O and later report completion via
    /// [`Self::notify_request_finished`].
    pub fn dispatch_requests<F>(&mut self, now_us: u64, mut cb: F)
    where
        F: FnMut(IoTicket, T),
    {
        let budget = self.group.per_shard_budget();
        let mut dispatched: Capacity = 0;
        let mut preempt: Vec<ClassId> = Vec::new();

        while dispatched < budget {
            let Some(&top) = self.handles.peek() else { break };
            let cid = top.id;
            self.reap_cancelled_front(cid);

            let pc = self.classes[cid.index()]
                .as_mut()
                .expect("a queued handle refers to a registered class");
            if pc.queue.is_empty() {
                pc.queued = false;
                self.handles.pop();
                continue;
            }
            let front = *pc.queue.front().expect("queue is nonempty");
            let ticket = self.slots[front as usize]
                .as_ref()
                .expect("queued slot is live")
                .ticket;

            match self.grab_capacity(ticket, now_us) {
                GrabResult::Pending => break,
                GrabResult::CantPreempt => {
                    self.handles.pop();
                    self.classes[cid.index()]
                        .as_mut()
                        .expect("a queued handle refers to a registered class")
                        .queued = false;
                    preempt.push(cid);
                }
                GrabResult::Grabbed => {
                    let cap = self.group.ticket_capacity(ticket);
                    self.handles.pop();

                    let pc = self.classes[cid.index()]
                        .as_mut()
                        .expect("a queued handle refers to a registered class");
                    pc.queued = false;
                    self.last_accumulated = self.last_accumulated.max(pc.accumulated);
                    pc.queue.pop_front();
                    let shares = pc.shares;
                    let accumulated = pc.accumulated;

                    self.resources_executing += ticket;
                    self.resources_queued -= ticket;
                    self.requests_executing += 1;
                    self.requests_queued -= 1;

                    // A small request against large shares can round to zero
                    // cost, which would let the class show no progress and
                    // monopolise the queue.
                    #[allow(clippy::cast_possible_wrap)] // Bounded by the bucket depth.
                    let req_cost = ((cap / Capacity::from(shares)).max(1)) as SignedCapacity;
                    if accumulated >= SignedCapacity::MAX - req_cost {
                        self.renormalize(accumulated);
                    }
                    let pc = self.classes[cid.index()]
                        .as_mut()
                        .expect("a queued handle refers to a registered class");
                    pc.accumulated += req_cost;
                    pc.pure_accumulated += cap;
                    let requeue = pc.plugged && !pc.queue.is_empty();

                    let slot = self.slots[front as usize]
                        .take()
                        .expect("queued slot is live");
                    self.free_slots.push(front);
                    let payload = slot.payload.expect("live entry has a payload");

                    dispatched += cap;
                    cb(ticket, payload);

                    if requeue {
                        self.push_priority_class(cid);
                    }
                }
            }
        }

        for cid in preempt {
            self.push_priority_class(cid);
        }
    }

    /// Returns when the reactor should poll again for the outstanding
    /// pending reservation, or `None` when nothing is pending.
    ///
    /// The estimate assumes replenishment alone will cover the deficiency;
    /// capacity released by completing requests may clear it earlier.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // Wait is bounded by the bucket depth.
    pub fn next_pending_aio(&self, now_us: u64) -> Option<u64> {
        let p = self.pending?;
        let over = self.group.capacity_deficiency(p.head);
        let wait_ms = self.group.capacity_duration(over);
        Some(now_us + (wait_ms * 1000.0) as u64)
    }

    /// Resources (weight, size) currently waiting in class FIFOs.
    #[must_use]
    pub const fn resources_currently_waiting(&self) -> IoTicket {
        self.resources_queued
    }

    /// Resources (weight, size) currently dispatched and executing.
    #[must_use]
    pub const fn resources_currently_executing(&self) -> IoTicket {
        self.resources_executing
    }

    /// Number of requests currently waiting in class FIFOs.
    #[must_use]
    pub const fn requests_currently_waiting(&self) -> u32 {
        self.requests_queued
    }

    /// Number of requests currently dispatched and executing.
    #[must_use]
    pub const fn requests_currently_executing(&self) -> u32 {
        self.requests_executing
    }

    /// Returns the queue-wide accounting counters.
    #[must_use]
    pub const fn stats(&self) -> FairQueueStats {
        FairQueueStats {
            requests_queued: self.requests_queued,
            requests_executing: self.requests_executing,
            resources_queued: self.resources_queued,
            resources_executing: self.resources_executing,
        }
    }

    /// Returns per-class consumption metrics.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not registered.
    #[must_use]
    #[allow(clippy::cast_sign_loss)] // The accumulator never goes negative.
    pub fn class_metrics(&self, id: ClassId) -> ClassMetrics {
        let pc = self.classes[id.index()]
            .as_ref()
            .expect("reading metrics of an unknown class");
        ClassMetrics {
            consumption: FairGroup::capacity_tokens(pc.pure_accumulated),
            adjusted_consumption: FairGroup::capacity_tokens(pc.accumulated.max(0) as Capacity),
        }
    }

    fn alloc_slot(&mut self, ticket: IoTicket, payload: T) -> u32 {
        let slot = Slot {
            ticket,
            payload: Some(payload),
            cancelled: false,
        };
        if let Some(idx) = self.free_slots.pop() {
            self.slots[idx as usize] = Some(slot);
            idx
        } else {
            let idx = u32::try_from(self.slots.len()).expect("entry arena exceeds u32 indices");
            self.slots.push(Some(slot));
            idx
        }
    }

    /// Drops cancelled entries from the front of a class FIFO.
    fn reap_cancelled_front(&mut self, cid: ClassId) {
        let Some(pc) = self.classes[cid.index()].as_mut() else {
            return;
        };
        while let Some(&idx) = pc.queue.front() {
            let slot = self.slots[idx as usize]
                .as_ref()
                .expect("queued slot is live");
            if !slot.cancelled {
                break;
            }
            pc.queue.pop_front();
            self.slots[idx as usize] = None;
            self.free_slots.push(idx);
        }
    }

    fn push_priority_class(&mut self, cid: ClassId) {
        let pc = self.classes[cid.index()]
            .as_mut()
            .expect("pushing an unknown class");
        debug_assert!(pc.plugged && !pc.queued);
        pc.queued = true;
        let handle = ClassHandle {
            accumulated: pc.accumulated,
            id: cid,
        };
        self.handles.push(handle);
    }

    /// Inserts a class that was idle, clamping its accumulator so the
    /// newcomer cannot monopolise the device for more than `tau`.
    #[allow(clippy::cast_possible_truncation)] // The deviation fits well below 2^63.
    fn push_priority_class_from_idle(&mut self, cid: ClassId) {
        let last_accumulated = self.last_accumulated;
        #[allow(clippy::cast_precision_loss)]
        let tau_ms = self.config.tau_us as f64 / 1000.0;
        let pc = self.classes[cid.index()]
            .as_mut()
            .expect("pushing an unknown class");
        if pc.queued {
            return;
        }
        // How many capacity units the class could accumulate per tick with
        // its current shares, scaled up to tau.
        let max_deviation = (FIXED_POINT_FACTOR / f64::from(pc.shares) * tau_ms) as SignedCapacity;
        pc.accumulated = pc.accumulated.max(last_accumulated - max_deviation);
        pc.queued = true;
        let handle = ClassHandle {
            accumulated: pc.accumulated,
            id: cid,
        };
        self.handles.push(handle);
    }

    fn grab_capacity(&mut self, ticket: IoTicket, now_us: u64) -> GrabResult {
        if let Some(p) = self.pending {
            return self.grab_pending_capacity(p, ticket, now_us);
        }

        let cap = self.group.ticket_capacity(ticket);
        let since = self.group.grab_capacity(cap);
        let want_head = since.wrapping_add(cap);
        if self.group.capacity_deficiency(want_head) > 0 {
            self.pending = Some(Pending {
                head: want_head,
                cap,
            });
            return GrabResult::Pending;
        }

        GrabResult::Grabbed
    }

    fn grab_pending_capacity(&mut self, p: Pending, ticket: IoTicket, now_us: u64) -> GrabResult {
        let mut local_ts = self.group_replenish_us;
        self.group.maybe_replenish_capacity(&mut local_ts, now_us);
        self.group_replenish_us = local_ts;

        let cap = self.group.ticket_capacity(ticket);
        if cap > p.cap {
            // The reservation is too small for this request.
            return GrabResult::CantPreempt;
        }

        if self.group.capacity_deficiency(p.head) > 0 {
            return if cap == p.cap {
                GrabResult::Pending
            } else {
                GrabResult::CantPreempt
            };
        }

        if cap < p.cap {
            // Switched to a cheaper head-of-line; hand the surplus back.
            self.group.release_capacity(p.cap - cap);
        }
        self.pending = None;
        GrabResult::Grabbed
    }

    /// Shifts every accumulator down so the next addition stays in range,
    /// preserving the relative order of queued classes.
    fn renormalize(&mut self, pivot: SignedCapacity) {
        for pc in self.classes.iter_mut().flatten() {
            if pc.queued {
                pc.accumulated -= pivot;
            } else {
                pc.accumulated = 0;
            }
        }
        self.last_accumulated = 0;
        let old = std::mem::take(&mut self.handles);
        self.handles = old
            .into_iter()
            .map(|h| ClassHandle {
                accumulated: self.classes[h.id.index()]
                    .as_ref()
                    .expect("a queued handle refers to a registered class")
                    .accumulated,
                id: h.id,
            })
            .collect();
    }

    #[cfg(test)]
    fn force_accumulated(&mut self, id: ClassId, value: SignedCapacity) {
        let pc = self.classes[id.index()].as_mut().unwrap();
        assert!(!pc.queued, "only idle classes can be forced");
        pc.accumulated = value;
    }
}
