use std::{fmt, time::SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{EnumDiscriminants, EnumString};
use thiserror::Error;
use widestring::{U16Str, U16String};

/// Process identifier as handed over by the notification sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pid(u32);

impl Pid {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tid(u32);

impl Tid {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Instruction set a process image was built for.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive, serialize_all = "lowercase")]
pub enum Architecture {
    X86,
    X64,
    Arm64,
}

/// Placement of a freshly mapped image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageInfo {
    pub base: u64,
    pub size: u64,
    pub is_kernel: bool,
}

impl fmt::Display for ImageInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ base: {:#x}, size: {:#x}, is_kernel: {} }}",
            self.base, self.size, self.is_kernel
        )
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventError {
    #[error("insufficient resources to build {0} event")]
    InsufficientResources(EventId),
}

/// Immutable snapshot of a system occurrence.
///
/// Events can only be obtained through the factory functions, so every field
/// is populated before any consumer sees it and nothing can change it while it
/// is broadcast.
///
/// The [`Payload::UmHookMessage`] variant borrows the caller-owned message
/// buffer: it lives exactly as long as the dispatch call and consumers that
/// need the bytes afterwards must copy them.
#[derive(Debug, Clone)]
pub struct Event<'a> {
    pub(crate) timestamp: SystemTime,
    pub(crate) payload: Payload<'a>,
}

#[derive(Debug, Clone, EnumDiscriminants)]
#[strum_discriminants(derive(Hash, EnumString, strum::Display))]
#[strum_discriminants(name(EventId))]
pub enum Payload<'a> {
    ProcessCreate {
        pid: Pid,
        parent_pid: Pid,
        architecture: Architecture,
        process_path: U16String,
    },
    ProcessTerminate {
        pid: Pid,
    },
    ImageLoad {
        pid: Pid,
        image_path: U16String,
        image: ImageInfo,
    },
    ThreadCreate {
        pid: Pid,
        tid: Tid,
    },
    ThreadTerminate {
        pid: Pid,
        tid: Tid,
    },
    UmHookMessage {
        message: &'a [u8],
    },
}

impl Event<'static> {
    pub fn process_create(
        pid: Pid,
        parent_pid: Pid,
        architecture: Architecture,
        process_path: &[u16],
    ) -> Result<Self, EventError> {
        let process_path = copy_wide(process_path, EventId::ProcessCreate)?;
        Ok(Self::now(Payload::ProcessCreate {
            pid,
            parent_pid,
            architecture,
            process_path,
        }))
    }

    pub fn process_terminate(pid: Pid) -> Self {
        Self::now(Payload::ProcessTerminate { pid })
    }

    pub fn image_load(pid: Pid, image_path: &[u16], image: ImageInfo) -> Result<Self, EventError> {
        let image_path = copy_wide(image_path, EventId::ImageLoad)?;
        Ok(Self::now(Payload::ImageLoad {
            pid,
            image_path,
            image,
        }))
    }

    pub fn thread_create(pid: Pid, tid: Tid) -> Self {
        Self::now(Payload::ThreadCreate { pid, tid })
    }

    pub fn thread_terminate(pid: Pid, tid: Tid) -> Self {
        Self::now(Payload::ThreadTerminate { pid, tid })
    }
}

impl<'a> Event<'a> {
    /// Wraps a user-mode hook message without copying it.
    pub fn um_hook_message(message: &'a [u8]) -> Self {
        Self::now(Payload::UmHookMessage { message })
    }

    fn now(payload: Payload<'a>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            payload,
        }
    }

    pub fn id(&self) -> EventId {
        EventId::from(&self.payload)
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn payload(&self) -> &Payload<'a> {
        &self.payload
    }

    /// Process the event refers to. Hook messages are not bound to one.
    pub fn pid(&self) -> Option<Pid> {
        match self.payload {
            Payload::ProcessCreate { pid, .. }
            | Payload::ProcessTerminate { pid }
            | Payload::ImageLoad { pid, .. }
            | Payload::ThreadCreate { pid, .. }
            | Payload::ThreadTerminate { pid, .. } => Some(pid),
            Payload::UmHookMessage { .. } => None,
        }
    }

    pub fn process_path(&self) -> Option<&U16Str> {
        match &self.payload {
            Payload::ProcessCreate { process_path, .. } => Some(process_path.as_ustr()),
            _ => None,
        }
    }

    pub fn image_path(&self) -> Option<&U16Str> {
        match &self.payload {
            Payload::ImageLoad { image_path, .. } => Some(image_path.as_ustr()),
            _ => None,
        }
    }
}

/// Copies a variable-length wide string into owned storage without aborting
/// on allocation failure.
fn copy_wide(units: &[u16], id: EventId) -> Result<U16String, EventError> {
    let mut owned = Vec::new();
    owned
        .try_reserve_exact(units.len())
        .map_err(|_| EventError::InsufficientResources(id))?;
    owned.extend_from_slice(units);
    Ok(U16String::from_vec(owned))
}

impl fmt::Display for Event<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = DateTime::<Utc>::from(self.timestamp).format("%Y-%m-%dT%TZ");
        let id = self.id();
        let payload = &self.payload;
        match self.pid() {
            Some(pid) if f.alternate() => {
                write!(f, "[{time} \x1b[1;30;46mEVENT\x1b[0m {pid}] [{id}] {payload}")
            }
            Some(pid) => write!(f, "[{time} EVENT {pid}] [{id}] {payload}"),
            None if f.alternate() => write!(f, "[{time} \x1b[1;30;46mEVENT\x1b[0m] [{id}] {payload}"),
            None => write!(f, "[{time} EVENT] [{id}] {payload}"),
        }
    }
}

impl fmt::Display for Payload<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::ProcessCreate { pid: _, parent_pid, architecture, process_path } => write!(f, "Process Create {{ parent_pid: {parent_pid}, architecture: {architecture}, process_path: {} }}", process_path.to_string_lossy()),
            Payload::ProcessTerminate { pid: _ } => write!(f, "Process Terminate"),
            Payload::ImageLoad { pid: _, image_path, image } => write!(f, "Image Load {{ image_path: {}, image: {image} }}", image_path.to_string_lossy()),
            Payload::ThreadCreate { pid: _, tid } => write!(f, "Thread Create {{ tid: {tid} }}"),
            Payload::ThreadTerminate { pid: _, tid } => write!(f, "Thread Terminate {{ tid: {tid} }}"),
            Payload::UmHookMessage { message } => write!(f, "Um Hook Message {{ len: {} }}", message.len()),
        }
    }
}
