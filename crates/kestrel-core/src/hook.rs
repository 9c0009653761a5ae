//! Wire format of the messages sent by the user-mode hooks.
//!
//! Every message starts with a 16-byte little-endian header:
//!
//! | offset | field                | value                         |
//! |--------|----------------------|-------------------------------|
//! | 0      | `provider_signature` | [`HOOK_PROVIDER_SIGNATURE`]   |
//! | 4      | `request_type`       | [`UM_HOOK_REQUEST_TYPE`]      |
//! | 8      | `reserved`           | 0                             |
//! | 12     | `buffer_length`      | bytes following the header    |
//!
//! followed by a `u64` tag selecting the payload layout.

use thiserror::Error;
use uguid::Guid;
use widestring::U16String;

pub const HOOK_PROVIDER_SIGNATURE: u32 = u32::from_le_bytes(*b"KSTL");
pub const UM_HOOK_REQUEST_TYPE: u32 = 1;
pub const HEADER_SIZE: usize = 16;

/// Wide characters in the port name buffer.
pub const PORT_NAME_LEN: usize = 260;
pub const RPC_BUFFER_SIZE: usize = 512;

const TAG_SIZE: usize = 8;
const TAG_PORT_CONNECTED: u64 = 0;
const TAG_RPC_MESSAGE: u64 = 1;

const PORT_CONNECTED_SIZE: usize = PORT_NAME_LEN * 2 + 8;
const RPC_MESSAGE_SIZE: usize = 16 + 8 + 8 + RPC_BUFFER_SIZE;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    #[error("message truncated: {needed} bytes needed, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("unknown provider signature {0:#010x}")]
    BadSignature(u32),
    #[error("unexpected request type {0}")]
    BadRequestType(u32),
    #[error("reserved header field set to {0:#x}")]
    ReservedNotZero(u32),
    #[error("declared length {declared} exceeds the {available} bytes received")]
    LengthOutOfBounds { declared: usize, available: usize },
    #[error("unknown message tag {0}")]
    UnknownTag(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookHeader {
    pub provider_signature: u32,
    pub request_type: u32,
    pub reserved: u32,
    pub buffer_length: u32,
}

impl HookHeader {
    /// Validates the header of `data`. Nothing past the header is read.
    pub fn parse(data: &[u8]) -> Result<Self, HookError> {
        let header = HookHeader {
            provider_signature: read_u32(data, 0)?,
            request_type: read_u32(data, 4)?,
            reserved: read_u32(data, 8)?,
            buffer_length: read_u32(data, 12)?,
        };
        if header.provider_signature != HOOK_PROVIDER_SIGNATURE {
            return Err(HookError::BadSignature(header.provider_signature));
        }
        if header.request_type != UM_HOOK_REQUEST_TYPE {
            return Err(HookError::BadRequestType(header.request_type));
        }
        if header.reserved != 0 {
            return Err(HookError::ReservedNotZero(header.reserved));
        }
        let available = data.len() - HEADER_SIZE;
        if header.buffer_length as usize > available {
            return Err(HookError::LengthOutOfBounds {
                declared: header.buffer_length as usize,
                available,
            });
        }
        Ok(header)
    }
}

/// A decoded hook message, borrowing from the received buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookMessage<'a> {
    PortConnected {
        port_name: U16String,
        port_handle: u64,
    },
    RpcMessage {
        interface_id: Guid,
        procedure_number: u64,
        transfer_syntax_flag: u64,
        buffer: &'a [u8; RPC_BUFFER_SIZE],
    },
}

impl<'a> HookMessage<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, HookError> {
        let header = HookHeader::parse(data)?;
        let body = &data[HEADER_SIZE..HEADER_SIZE + header.buffer_length as usize];
        let tag = read_u64(body, 0)?;
        let payload = &body[TAG_SIZE..];

        match tag {
            TAG_PORT_CONNECTED => {
                ensure_len(payload, PORT_CONNECTED_SIZE)?;
                let port_name: Vec<u16> = payload[..PORT_NAME_LEN * 2]
                    .chunks_exact(2)
                    .map(|unit| u16::from_le_bytes([unit[0], unit[1]]))
                    .take_while(|unit| *unit != 0)
                    .collect();
                Ok(HookMessage::PortConnected {
                    port_name: U16String::from_vec(port_name),
                    port_handle: read_u64(payload, PORT_NAME_LEN * 2)?,
                })
            }
            TAG_RPC_MESSAGE => {
                ensure_len(payload, RPC_MESSAGE_SIZE)?;
                let guid: [u8; 16] = slice_at(payload, 0)?;
                let buffer = payload
                    .get(32..32 + RPC_BUFFER_SIZE)
                    .and_then(|buffer| buffer.try_into().ok())
                    .ok_or(HookError::Truncated {
                        needed: RPC_MESSAGE_SIZE,
                        available: payload.len(),
                    })?;
                Ok(HookMessage::RpcMessage {
                    interface_id: Guid::from_bytes(guid),
                    procedure_number: read_u64(payload, 16)?,
                    transfer_syntax_flag: read_u64(payload, 24)?,
                    buffer,
                })
            }
            tag => Err(HookError::UnknownTag(tag)),
        }
    }
}

fn ensure_len(data: &[u8], needed: usize) -> Result<(), HookError> {
    if data.len() < needed {
        Err(HookError::Truncated {
            needed,
            available: data.len(),
        })
    } else {
        Ok(())
    }
}

fn slice_at<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], HookError> {
    data.get(offset..offset + N)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(HookError::Truncated {
            needed: offset + N,
            available: data.len(),
        })
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, HookError> {
    slice_at(data, offset).map(u32::from_le_bytes)
}

fn read_u64(data: &[u8], offset: usize) -> Result<u64, HookError> {
    slice_at(data, offset).map(u64::from_le_bytes)
}

/// Payloads are fixed size, so the declared length always fits the header.
fn encode<const N: usize>(tag: u64, payload: &[u8; N]) -> Vec<u8> {
    const { assert!(TAG_SIZE + N <= u32::MAX as usize) };
    let buffer_length = (TAG_SIZE + N) as u32;
    let mut message = Vec::with_capacity(HEADER_SIZE + TAG_SIZE + N);
    message.extend_from_slice(&HOOK_PROVIDER_SIGNATURE.to_le_bytes());
    message.extend_from_slice(&UM_HOOK_REQUEST_TYPE.to_le_bytes());
    message.extend_from_slice(&0u32.to_le_bytes());
    message.extend_from_slice(&buffer_length.to_le_bytes());
    message.extend_from_slice(&tag.to_le_bytes());
    message.extend_from_slice(payload);
    message
}

/// Builds a port-connected message. Names longer than the wire buffer are
/// truncated, keeping room for the terminator.
pub fn encode_port_connected(port_name: &[u16], port_handle: u64) -> Vec<u8> {
    let mut payload = [0u8; PORT_CONNECTED_SIZE];
    for (unit, out) in port_name
        .iter()
        .take(PORT_NAME_LEN - 1)
        .zip(payload.chunks_exact_mut(2))
    {
        out.copy_from_slice(&unit.to_le_bytes());
    }
    payload[PORT_NAME_LEN * 2..].copy_from_slice(&port_handle.to_le_bytes());
    encode(TAG_PORT_CONNECTED, &payload)
}

/// Builds an RPC message. `buffer` is zero padded or truncated to
/// [`RPC_BUFFER_SIZE`].
pub fn encode_rpc_message(
    interface_id: Guid,
    procedure_number: u64,
    transfer_syntax_flag: u64,
    buffer: &[u8],
) -> Vec<u8> {
    let mut payload = [0u8; RPC_MESSAGE_SIZE];
    payload[..16].copy_from_slice(&interface_id.to_bytes());
    payload[16..24].copy_from_slice(&procedure_number.to_le_bytes());
    payload[24..32].copy_from_slice(&transfer_syntax_flag.to_le_bytes());
    let copied = buffer.len().min(RPC_BUFFER_SIZE);
    payload[32..32 + copied].copy_from_slice(&buffer[..copied]);
    encode(TAG_RPC_MESSAGE, &payload)
}
