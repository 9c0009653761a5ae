//! Deferred calls: work that runs later in the context of a chosen thread.
//!
//! Every scheduled call owns a slot in the queue's table and is represented on
//! the platform side by an [`ApcTicket`]. The ticket is the only handle able to
//! finish the slot and it is consumed by value, so a call either runs its
//! routine (through [`ApcTicket::deliver`]) or its cleanup (through
//! [`ApcTicket::rundown`] / [`ApcTicket::cancel`]), never both and never twice.
//!
//! Slot life cycle:
//!
//! ```text
//! Pending -> Running -> Completed -> freed     privileged routine
//! Pending -> Completed -> freed                unprivileged routine
//! Pending -> Cancelled -> freed                cancelled, run down or rejected
//! ```
//!
//! Freeing bumps the slot generation, so a stale [`CallKey`] never matches a
//! later call reusing the same index.

use std::{
    fmt,
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use thiserror::Error;

use crate::{
    event::Tid,
    platform::{Address, Platform, PlatformError, RejectedApc},
};

const DRAIN_POLL: Duration = Duration::from_millis(10);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeferredError {
    #[error("queue is shutting down")]
    TooLate,
    #[error("insufficient resources to track the call")]
    InsufficientResources,
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// Identifies a scheduled call. Keys are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallKey {
    index: u32,
    generation: u32,
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    Privileged,
    Unprivileged,
}

/// Personality the unprivileged routine runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Personality {
    #[default]
    Native,
    Wow64,
}

/// Passed to privileged routines and cleanups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallArgs {
    pub thread: Tid,
    pub key: CallKey,
}

/// A user-mode routine, handed back to the platform when delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserRoutine {
    pub entry: Address,
    pub context: Address,
    pub arg1: u64,
    pub arg2: u64,
}

pub type PrivilegedRoutine = Box<dyn FnOnce(CallArgs) + Send>;
pub type CleanupRoutine = Box<dyn FnOnce(CallArgs) + Send>;

pub enum Routine {
    Privileged(PrivilegedRoutine),
    Unprivileged(UserRoutine),
}

impl Routine {
    pub fn mode(&self) -> ExecutionMode {
        match self {
            Routine::Privileged(_) => ExecutionMode::Privileged,
            Routine::Unprivileged(_) => ExecutionMode::Unprivileged,
        }
    }
}

impl fmt::Debug for Routine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Routine::Privileged(_) => f.write_str("Privileged(..)"),
            Routine::Unprivileged(user) => f.debug_tuple("Unprivileged").field(user).finish(),
        }
    }
}

/// Description of a call to schedule.
pub struct DeferredCall {
    pub thread: Tid,
    pub personality: Personality,
    pub routine: Routine,
    /// Runs instead of the routine when the call is cancelled or the thread
    /// exits before delivery.
    pub cleanup: Option<CleanupRoutine>,
}

impl DeferredCall {
    pub fn privileged<F>(thread: Tid, routine: F) -> Self
    where
        F: FnOnce(CallArgs) + Send + 'static,
    {
        Self {
            thread,
            personality: Personality::Native,
            routine: Routine::Privileged(Box::new(routine)),
            cleanup: None,
        }
    }

    pub fn unprivileged(thread: Tid, personality: Personality, routine: UserRoutine) -> Self {
        Self {
            thread,
            personality,
            routine: Routine::Unprivileged(routine),
            cleanup: None,
        }
    }

    pub fn with_cleanup<F>(mut self, cleanup: F) -> Self
    where
        F: FnOnce(CallArgs) + Send + 'static,
    {
        self.cleanup = Some(Box::new(cleanup));
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.routine.mode()
    }
}

/// Observable state of a live call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Pending,
    Running,
}

/// What the platform must do after delivering a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The privileged routine ran to completion.
    Completed,
    /// Hand control to this user-mode routine.
    Transfer(UserRoutine),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    /// Pending calls unlinked from their thread, their cleanup ran.
    pub cancelled: usize,
    /// Calls already in flight that teardown had to wait for.
    pub awaited: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub scheduled: u64,
    pub executed: u64,
    pub cancelled: u64,
    pub rundown: u64,
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    scheduled: AtomicU64,
    executed: AtomicU64,
    cancelled: AtomicU64,
    rundown: AtomicU64,
    rejected: AtomicU64,
}

struct Slot {
    generation: u32,
    state: Option<(CallState, Tid)>,
}

#[derive(Default)]
struct SlotTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    closing: bool,
}

impl SlotTable {
    fn insert(&mut self, thread: Tid) -> Result<CallKey, DeferredError> {
        if self.closing {
            return Err(DeferredError::TooLate);
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(self.slots.len())
                    .map_err(|_| DeferredError::InsufficientResources)?;
                // Both vectors grow here so freeing a slot never allocates.
                self.slots
                    .try_reserve(1)
                    .map_err(|_| DeferredError::InsufficientResources)?;
                self.free
                    .try_reserve(self.slots.len() + 1)
                    .map_err(|_| DeferredError::InsufficientResources)?;
                self.slots.push(Slot {
                    generation: 0,
                    state: None,
                });
                index
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.state = Some((CallState::Pending, thread));
        self.live += 1;
        Ok(CallKey {
            index,
            generation: slot.generation,
        })
    }

    fn slot_mut(&mut self, key: CallKey) -> Option<&mut Slot> {
        self.slots
            .get_mut(key.index as usize)
            .filter(|slot| slot.generation == key.generation && slot.state.is_some())
    }

    fn state(&self, key: CallKey) -> Option<CallState> {
        self.slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.state.map(|(state, _)| state))
    }

    fn start(&mut self, key: CallKey) {
        match self.slot_mut(key).and_then(|slot| slot.state.as_mut()) {
            Some((state, _)) if *state == CallState::Pending => *state = CallState::Running,
            _ => panic!("call {key} delivered while not pending"),
        }
    }

    fn free(&mut self, key: CallKey) {
        let Some(slot) = self.slot_mut(key) else {
            panic!("call {key} freed twice");
        };
        slot.state = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.live -= 1;
    }

    fn pending(&self) -> Vec<(CallKey, Tid)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot.state {
                Some((CallState::Pending, thread)) => Some((
                    CallKey {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    thread,
                )),
                _ => None,
            })
            .collect()
    }
}

struct Shared {
    table: Mutex<SlotTable>,
    drained: Condvar,
    counters: Counters,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SlotTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn free(&self, key: CallKey) {
        let mut table = self.lock();
        table.free(key);
        if table.live == 0 {
            self.drained.notify_all();
        }
    }
}

/// Frees the slot once the privileged routine returns or unwinds.
struct FreeOnDrop<'a> {
    shared: &'a Shared,
    key: CallKey,
}

impl Drop for FreeOnDrop<'_> {
    fn drop(&mut self) {
        self.shared.free(self.key);
    }
}

/// Platform side of a scheduled call.
///
/// Dropping a ticket without consuming it behaves like [`ApcTicket::rundown`].
pub struct ApcTicket {
    shared: Arc<Shared>,
    key: CallKey,
    thread: Tid,
    personality: Personality,
    mode: ExecutionMode,
    call: Option<(Routine, Option<CleanupRoutine>)>,
}

impl ApcTicket {
    pub fn key(&self) -> CallKey {
        self.key
    }

    pub fn thread(&self) -> Tid {
        self.thread
    }

    pub fn personality(&self) -> Personality {
        self.personality
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    fn args(&self) -> CallArgs {
        CallArgs {
            thread: self.thread,
            key: self.key,
        }
    }

    /// Runs the call on the target thread.
    ///
    /// A privileged routine runs here with its slot still registered; an
    /// unprivileged one has its slot freed before control is handed back to
    /// the platform.
    pub fn deliver(mut self) -> Delivery {
        let args = self.args();
        let Some((routine, _cleanup)) = self.call.take() else {
            return Delivery::Completed;
        };
        let shared = self.shared.clone();
        shared.counters.executed.fetch_add(1, Ordering::Relaxed);
        match routine {
            Routine::Privileged(routine) => {
                shared.lock().start(self.key);
                let _guard = FreeOnDrop {
                    shared: &shared,
                    key: self.key,
                };
                routine(args);
                Delivery::Completed
            }
            Routine::Unprivileged(user) => {
                shared.free(self.key);
                Delivery::Transfer(user)
            }
        }
    }

    /// The target thread exited before the call was delivered.
    pub fn rundown(mut self) {
        self.abandon();
    }

    /// The call was unlinked before delivery.
    pub fn cancel(mut self) {
        if self.call.is_some() {
            self.shared.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            self.finish(true);
        }
    }

    /// The platform refused the ticket: drop the call without running
    /// anything.
    fn discard(mut self) {
        if self.call.is_some() {
            self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
            self.finish(false);
        }
    }

    fn abandon(&mut self) {
        if self.call.is_some() {
            self.shared.counters.rundown.fetch_add(1, Ordering::Relaxed);
            self.finish(true);
        }
    }

    fn finish(&mut self, run_cleanup: bool) {
        let args = self.args();
        if let Some((routine, cleanup)) = self.call.take() {
            // The routine is dropped before the slot is freed so captured
            // resources are gone once teardown observes an empty table.
            drop(routine);
            if let Some(cleanup) = cleanup.filter(|_| run_cleanup) {
                let _guard = FreeOnDrop {
                    shared: &self.shared,
                    key: self.key,
                };
                cleanup(args);
            } else {
                self.shared.free(self.key);
            }
        }
    }
}

impl Drop for ApcTicket {
    fn drop(&mut self) {
        self.abandon();
    }
}

impl fmt::Debug for ApcTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApcTicket")
            .field("key", &self.key)
            .field("thread", &self.thread)
            .field("personality", &self.personality)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// Cloneable handle scheduling calls on a [`DeferredCallQueue`].
///
/// Handles stay usable after the queue is shut down, every schedule then fails
/// with [`DeferredError::TooLate`].
#[derive(Clone)]
pub struct QueueHandle {
    shared: Arc<Shared>,
    platform: Arc<dyn Platform>,
}

impl QueueHandle {
    pub fn schedule(&self, call: DeferredCall) -> Result<CallKey, DeferredError> {
        let DeferredCall {
            thread,
            personality,
            mut routine,
            cleanup,
        } = call;

        if let (Personality::Wow64, Routine::Unprivileged(user)) = (personality, &mut routine) {
            let (entry, context) = self
                .platform
                .wrap_wow64_routine(user.entry, user.context)?;
            user.entry = entry;
            user.context = context;
        }

        let mode = routine.mode();
        let key = self.shared.lock().insert(thread)?;
        self.shared.counters.scheduled.fetch_add(1, Ordering::Relaxed);
        let ticket = ApcTicket {
            shared: self.shared.clone(),
            key,
            thread,
            personality,
            mode,
            call: Some((routine, cleanup)),
        };

        log::trace!("scheduling {mode:?} call {key} on thread {thread}");
        match self.platform.queue_apc(ticket) {
            Ok(()) => Ok(key),
            Err(RejectedApc { ticket, error }) => {
                ticket.discard();
                Err(error.into())
            }
        }
    }

    pub fn state(&self, key: CallKey) -> Option<CallState> {
        self.shared.lock().state(key)
    }

    /// Calls scheduled and not yet freed.
    pub fn pending(&self) -> usize {
        self.shared.lock().live
    }

    pub fn stats(&self) -> QueueStats {
        let counters = &self.shared.counters;
        QueueStats {
            scheduled: counters.scheduled.load(Ordering::Relaxed),
            executed: counters.executed.load(Ordering::Relaxed),
            cancelled: counters.cancelled.load(Ordering::Relaxed),
            rundown: counters.rundown.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Owner of a set of deferred calls. Dropping it runs [`shutdown`].
///
/// [`shutdown`]: DeferredCallQueue::shutdown
pub struct DeferredCallQueue {
    handle: QueueHandle,
}

impl DeferredCallQueue {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            handle: QueueHandle {
                shared: Arc::new(Shared {
                    table: Mutex::new(SlotTable::default()),
                    drained: Condvar::new(),
                    counters: Counters::default(),
                }),
                platform,
            },
        }
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    pub fn schedule(&self, call: DeferredCall) -> Result<CallKey, DeferredError> {
        self.handle.schedule(call)
    }

    pub fn state(&self, key: CallKey) -> Option<CallState> {
        self.handle.state(key)
    }

    pub fn pending(&self) -> usize {
        self.handle.pending()
    }

    pub fn stats(&self) -> QueueStats {
        self.handle.stats()
    }

    /// Refuses new calls, cancels the pending ones and waits for the calls
    /// already in flight.
    ///
    /// Pending calls the platform could not unlink yet, because their ticket
    /// was still on its way to the thread queue, are retried on every poll.
    ///
    /// Must not be called from inside one of this queue's privileged routines.
    pub fn shutdown(&self) -> ShutdownReport {
        let shared = &self.handle.shared;
        let pending = {
            let mut table = shared.lock();
            table.closing = true;
            table.pending()
        };

        let mut report = ShutdownReport {
            cancelled: self.cancel_all(pending),
            awaited: 0,
        };
        let first_pass = report.cancelled;

        let mut table = shared.lock();
        let in_flight = table.live;
        while table.live > 0 {
            log::debug!("waiting for {} deferred calls in flight", table.live);
            table = shared
                .drained
                .wait_timeout(table, DRAIN_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            let pending = table.pending();
            if !pending.is_empty() {
                drop(table);
                report.cancelled += self.cancel_all(pending);
                table = shared.lock();
            }
        }
        report.awaited = in_flight - (report.cancelled - first_pass);
        report
    }

    fn cancel_all(&self, pending: Vec<(CallKey, Tid)>) -> usize {
        let mut cancelled = 0;
        for (key, thread) in pending {
            if let Some(ticket) = self.handle.platform.cancel_apc(thread, key) {
                ticket.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }
}

impl Drop for DeferredCallQueue {
    fn drop(&mut self) {
        let report = self.shutdown();
        if report != ShutdownReport::default() {
            log::debug!(
                "deferred queue dropped: {} cancelled, {} awaited",
                report.cancelled,
                report.awaited
            );
        }
    }
}
