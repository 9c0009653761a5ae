//! In-memory [`Platform`] used by tests and by trace replay.
//!
//! APCs are kept in per-thread FIFO queues and only run when the owner of the
//! simulation calls [`SimulatedPlatform::deliver_all`], sections and views are
//! plain byte buffers, and user-mode transfers are recorded instead of
//! executed.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
};

use crate::{
    deferred::{ApcTicket, CallKey, Delivery, ExecutionMode, Personality, UserRoutine},
    event::{Pid, Tid},
};

use super::{
    Address, MappedRegion, OsVersion, PAGE_SIZE, Platform, PlatformError, RejectedApc,
    SectionHandle, page_align,
};

/// Offset of every export when synthetic exports are enabled.
pub const SYNTHETIC_EXPORT_OFFSET: Address = 0x1_2340;

const VIEW_BASE: Address = 0x7ff0_0000;

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    WrapWow64,
    CreateSection,
    MapSection,
    WriteView,
    QueueApc(ExecutionMode),
}

/// Control handed to user mode by a delivered unprivileged call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserTransfer {
    pub thread: Tid,
    pub personality: Personality,
    pub routine: UserRoutine,
    /// Content of the mapped view `routine.context` points to, if any.
    pub context_bytes: Option<Vec<u8>>,
}

struct State {
    protected: HashSet<Pid>,
    wow64: HashSet<Pid>,
    os_version: OsVersion,
    current_thread: Tid,
    exports: HashMap<(Address, String), Address>,
    synthetic_exports: bool,
    fail_points: HashSet<FailPoint>,
    apcs: HashMap<Tid, VecDeque<ApcTicket>>,
    sections: HashMap<SectionHandle, usize>,
    views: HashMap<Address, Vec<u8>>,
    next_handle: u64,
    next_base: Address,
    transfers: Vec<UserTransfer>,
    wrapped: Vec<(Address, Address)>,
}

/// Parks `queue_apc` callers while held.
#[derive(Default)]
struct QueueGate {
    held: bool,
    parked: usize,
}

pub struct SimulatedPlatform {
    state: Mutex<State>,
    gate: Mutex<QueueGate>,
    gate_opened: Condvar,
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPlatform {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                protected: HashSet::new(),
                wow64: HashSet::new(),
                os_version: OsVersion::WINDOWS_10,
                current_thread: Tid::from_raw(4),
                exports: HashMap::new(),
                synthetic_exports: false,
                fail_points: HashSet::new(),
                apcs: HashMap::new(),
                sections: HashMap::new(),
                views: HashMap::new(),
                next_handle: 4,
                next_base: VIEW_BASE,
                transfers: Vec::new(),
                wrapped: Vec::new(),
            }),
            gate: Mutex::new(QueueGate::default()),
            gate_opened: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Encoding applied to wow64 routines, mirroring the way the wow64 layer
    /// tags them.
    pub const fn wow64_encode(entry: Address) -> Address {
        entry.wrapping_neg().wrapping_shl(2)
    }

    pub fn set_protected(&self, pid: Pid) {
        self.lock().protected.insert(pid);
    }

    pub fn set_wow64(&self, pid: Pid) {
        self.lock().wow64.insert(pid);
    }

    pub fn set_os_version(&self, version: OsVersion) {
        self.lock().os_version = version;
    }

    pub fn set_current_thread(&self, tid: Tid) {
        self.lock().current_thread = tid;
    }

    pub fn add_export(&self, image_base: Address, name: &str, address: Address) {
        self.lock()
            .exports
            .insert((image_base, name.to_string()), address);
    }

    /// Resolves every export name to `image_base + SYNTHETIC_EXPORT_OFFSET`.
    pub fn enable_synthetic_exports(&self) {
        self.lock().synthetic_exports = true;
    }

    pub fn fail_on(&self, point: FailPoint) {
        self.lock().fail_points.insert(point);
    }

    pub fn clear_failures(&self) {
        self.lock().fail_points.clear();
    }

    /// Blocks every `queue_apc` call until [`SimulatedPlatform::open_queue`].
    pub fn hold_queue(&self) {
        self.lock_gate().held = true;
    }

    pub fn open_queue(&self) {
        self.lock_gate().held = false;
        self.gate_opened.notify_all();
    }

    /// Callers currently blocked in `queue_apc`.
    pub fn parked_queuers(&self) -> usize {
        self.lock_gate().parked
    }

    fn lock_gate(&self) -> MutexGuard<'_, QueueGate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pass_gate(&self) {
        let mut gate = self.lock_gate();
        if gate.held {
            gate.parked += 1;
            gate = self
                .gate_opened
                .wait_while(gate, |gate| gate.held)
                .unwrap_or_else(PoisonError::into_inner);
            gate.parked -= 1;
        }
    }

    /// Delivers every APC queued on `tid`, including the ones queued while
    /// delivering. Returns how many were delivered.
    pub fn deliver_all(&self, tid: Tid) -> usize {
        let mut delivered = 0;
        loop {
            let Some(ticket) = self.lock().apcs.get_mut(&tid).and_then(VecDeque::pop_front) else {
                break;
            };
            let personality = ticket.personality();
            delivered += 1;
            if let Delivery::Transfer(routine) = ticket.deliver() {
                let mut state = self.lock();
                let context_bytes = state.views.get(&routine.context).cloned();
                log::trace!(
                    "thread {tid} transferring to {:#x}({:#x})",
                    routine.entry,
                    routine.context
                );
                state.transfers.push(UserTransfer {
                    thread: tid,
                    personality,
                    routine,
                    context_bytes,
                });
            }
        }
        delivered
    }

    /// Simulates the exit of `tid`: its undelivered APCs are run down.
    pub fn rundown_thread(&self, tid: Tid) -> usize {
        let queued = self.lock().apcs.remove(&tid).unwrap_or_default();
        let count = queued.len();
        queued.into_iter().for_each(ApcTicket::rundown);
        count
    }

    pub fn pending_apcs(&self, tid: Tid) -> usize {
        self.lock().apcs.get(&tid).map_or(0, VecDeque::len)
    }

    pub fn transfers(&self) -> Vec<UserTransfer> {
        self.lock().transfers.clone()
    }

    /// `(entry, context)` pairs passed to [`Platform::wrap_wow64_routine`].
    pub fn wrapped_routines(&self) -> Vec<(Address, Address)> {
        self.lock().wrapped.clone()
    }

    pub fn open_sections(&self) -> usize {
        self.lock().sections.len()
    }

    pub fn mapped_views(&self) -> usize {
        self.lock().views.len()
    }

    pub fn view_bytes(&self, base: Address) -> Option<Vec<u8>> {
        self.lock().views.get(&base).cloned()
    }

    fn check(state: &State, point: FailPoint) -> Result<(), PlatformError> {
        if state.fail_points.contains(&point) {
            log::debug!("simulated failure of {point:?}");
            Err(PlatformError::InsufficientResources)
        } else {
            Ok(())
        }
    }
}

impl Platform for SimulatedPlatform {
    fn is_protected(&self, pid: Pid) -> bool {
        self.lock().protected.contains(&pid)
    }

    fn is_wow64(&self, pid: Pid) -> bool {
        self.lock().wow64.contains(&pid)
    }

    fn os_version(&self) -> OsVersion {
        self.lock().os_version
    }

    fn current_thread(&self) -> Tid {
        self.lock().current_thread
    }

    fn resolve_export(&self, image_base: Address, name: &str) -> Option<Address> {
        let state = self.lock();
        state
            .exports
            .get(&(image_base, name.to_string()))
            .copied()
            .or_else(|| {
                state
                    .synthetic_exports
                    .then(|| image_base.wrapping_add(SYNTHETIC_EXPORT_OFFSET))
            })
    }

    fn queue_apc(&self, ticket: ApcTicket) -> Result<(), RejectedApc> {
        self.pass_gate();
        let mut state = self.lock();
        if let Err(error) = Self::check(&state, FailPoint::QueueApc(ticket.mode())) {
            drop(state);
            return Err(RejectedApc { ticket, error });
        }
        state.apcs.entry(ticket.thread()).or_default().push_back(ticket);
        Ok(())
    }

    fn cancel_apc(&self, thread: Tid, key: CallKey) -> Option<ApcTicket> {
        let mut state = self.lock();
        let queue = state.apcs.get_mut(&thread)?;
        let position = queue.iter().position(|ticket| ticket.key() == key)?;
        queue.remove(position)
    }

    fn wrap_wow64_routine(
        &self,
        entry: Address,
        context: Address,
    ) -> Result<(Address, Address), PlatformError> {
        let mut state = self.lock();
        Self::check(&state, FailPoint::WrapWow64)?;
        state.wrapped.push((entry, context));
        Ok((Self::wow64_encode(entry), context))
    }

    fn create_section(&self, size: usize) -> Result<SectionHandle, PlatformError> {
        let mut state = self.lock();
        Self::check(&state, FailPoint::CreateSection)?;
        let handle = SectionHandle::from_raw(state.next_handle);
        state.next_handle += 4;
        state.sections.insert(handle, size);
        Ok(handle)
    }

    fn map_section(&self, section: SectionHandle) -> Result<MappedRegion, PlatformError> {
        let mut state = self.lock();
        Self::check(&state, FailPoint::MapSection)?;
        let size = *state
            .sections
            .get(&section)
            .ok_or(PlatformError::Status {
                call: "map_section",
                status: 0xC000_0008,
            })?;
        let base = state.next_base;
        let span = page_align(size).ok_or(PlatformError::InsufficientResources)?;
        state.next_base += (span + PAGE_SIZE) as Address;
        state.views.insert(base, vec![0; size]);
        Ok(MappedRegion { base, size })
    }

    fn write_view(
        &self,
        view: MappedRegion,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), PlatformError> {
        let mut state = self.lock();
        Self::check(&state, FailPoint::WriteView)?;
        let violation = PlatformError::AccessViolation {
            offset,
            len: bytes.len(),
        };
        let buffer = state.views.get_mut(&view.base).ok_or(violation.clone())?;
        let target = offset
            .checked_add(bytes.len())
            .and_then(|end| buffer.get_mut(offset..end))
            .ok_or(violation)?;
        target.copy_from_slice(bytes);
        Ok(())
    }

    fn unmap_view(&self, view: MappedRegion) {
        if self.lock().views.remove(&view.base).is_none() {
            log::warn!("unmapping unknown view at {:#x}", view.base);
        }
    }

    fn close_section(&self, section: SectionHandle) {
        if self.lock().sections.remove(&section).is_none() {
            log::warn!("closing unknown section {section:?}");
        }
    }
}
