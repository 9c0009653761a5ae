//! Cross-context hop moving the injection into the target process.
//!
//! The image-load notification runs on the loading thread of the target. From
//! there a privileged deferred call maps a shared section holding the library
//! path and queues the loader routine as a user-mode call on the same thread.

use std::sync::Arc;

use kestrel_core::{
    deferred::{CallKey, DeferredCall, DeferredError, Personality, QueueHandle, UserRoutine},
    event::{Pid, Tid},
    platform::{Address, MappedRegion, Platform, PlatformError, Section, page_align},
};
use thiserror::Error;
use widestring::U16String;

use crate::table::InjectionRecord;

/// Owned copy of what the hop needs from an injection record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionTarget {
    pub pid: Pid,
    pub loader_routine: Address,
    pub dll_path: U16String,
    pub personality: Personality,
}

impl InjectionTarget {
    /// `None` when the loader routine was never resolved.
    pub fn from_record(record: InjectionRecord) -> Option<Self> {
        Some(Self {
            pid: record.pid,
            loader_routine: record.loader_routine?,
            dll_path: record.dll_path,
            personality: record.personality,
        })
    }
}

#[derive(Error, Debug)]
pub enum HopError {
    #[error("library path too long")]
    PathTooLong,
    #[error("mapping library path: {0}")]
    Platform(#[from] PlatformError),
    #[error("queueing loader routine: {0}")]
    Deferred(#[from] DeferredError),
}

/// Schedules the privileged half of the hop on the current thread.
pub fn start(
    queue: &QueueHandle,
    platform: &Arc<dyn Platform>,
    target: InjectionTarget,
) -> Result<CallKey, DeferredError> {
    let thread = platform.current_thread();
    let pid = target.pid;
    let hop_queue = queue.clone();
    let hop_platform = platform.clone();

    let call = DeferredCall::privileged(thread, move |args| {
        match map_and_queue(&hop_queue, hop_platform.as_ref(), &target, args.thread) {
            Ok((key, view)) => log::debug!(
                "process {} loading {} through call {key}, path at {:#x}",
                target.pid,
                target.dll_path.to_string_lossy(),
                view.base
            ),
            Err(HopError::Deferred(DeferredError::TooLate)) => {
                log::debug!("process {} not injected: shutting down", target.pid)
            }
            Err(err) => log::warn!("process {} not injected: {err}", target.pid),
        }
    })
    .with_cleanup(move |_| log::debug!("injection of process {pid} cancelled"));

    queue.schedule(call)
}

/// Privileged half of the hop. Every acquired resource is released on failure.
fn map_and_queue(
    queue: &QueueHandle,
    platform: &dyn Platform,
    target: &InjectionTarget,
    thread: Tid,
) -> Result<(CallKey, MappedRegion), HopError> {
    let path = nul_terminated_le(&target.dll_path)?;
    let size = page_align(path.len()).ok_or(HopError::PathTooLong)?;

    let section = Section::create(platform, size)?;
    let view = section.map()?;
    view.write(0, &path)?;

    let key = queue.schedule(DeferredCall::unprivileged(
        thread,
        target.personality,
        UserRoutine {
            entry: target.loader_routine,
            context: view.region().base,
            arg1: 0,
            arg2: 0,
        },
    ))?;

    // The view now belongs to the target, only the handle is ours to close.
    let region = view.release();
    drop(section);
    Ok((key, region))
}

fn nul_terminated_le(path: &U16String) -> Result<Vec<u8>, HopError> {
    let len = path
        .len()
        .checked_add(1)
        .and_then(|units| units.checked_mul(2))
        .ok_or(HopError::PathTooLong)?;
    let mut bytes = Vec::new();
    bytes
        .try_reserve_exact(len)
        .map_err(|_| HopError::Platform(PlatformError::InsufficientResources))?;
    bytes.extend(
        path.as_slice()
            .iter()
            .chain(std::iter::once(&0))
            .flat_map(|unit| unit.to_le_bytes()),
    );
    Ok(bytes)
}
