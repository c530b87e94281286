//! Wire format shared by both ends of a buffer handoff session.
//!
//! Every control message archives to exactly [`MESSAGE_SIZE`] bytes and every
//! [`BufferDescriptor`] to exactly [`DESCRIPTOR_SIZE`] bytes, so a reader always
//! knows how much to pull off the control socket or out of the mailbox.

use std::error::Error;
use std::fmt::Display;

use rkyv::api::high::{to_bytes_in, HighSerializer};
use rkyv::rancor::{fail, Fallible};
use rkyv::ser::allocator::ArenaHandle;
use rkyv::ser::{Positional, Writer};
use rkyv::{Archive, Deserialize, Serialize};
use thiserror::Error;

pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum number of planes a single buffer may carry.
pub const MAX_PLANES: usize = 4;

/// Marks a token slot that does not correspond to an exported plane.
pub const UNUSED_TOKEN: i32 = -1;

/// Descriptor field value meaning "no timestamp".
pub const NO_TIMESTAMP: u64 = u64::MAX;

pub const MESSAGE_SIZE: usize = std::mem::size_of::<ArchivedControlMessage>();

pub const DESCRIPTOR_SIZE: usize = std::mem::size_of::<ArchivedBufferDescriptor>();

#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum ControlMessage {
    /// Followed on the stream by `len` bytes naming the mailbox.
    ShmPath { len: u32 },
    /// A fresh descriptor with this generation sits in the mailbox.
    BufferNew { generation: u64 },
    BufferReceived,
    BufferRelease { tokens: [i32; MAX_PLANES] },
    CloseClient,
}

impl ControlMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::ShmPath { .. } => "SHM_PATH",
            ControlMessage::BufferNew { .. } => "BUFFER_NEW",
            ControlMessage::BufferReceived => "BUFFER_RECEIVED",
            ControlMessage::BufferRelease { .. } => "BUFFER_RELEASE",
            ControlMessage::CloseClient => "CLOSE_CLIENT",
        }
    }
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[rkyv(derive(Debug))]
pub struct PlaneInfo {
    pub size: u32,
    pub stride: u32,
    pub offset: u32,
    pub format: u32,
}

#[derive(Archive, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct BufferDescriptor {
    pub generation: u64,
    pub plane_count: u32,
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub pts_ns: u64,
    pub duration_ns: u64,
    pub planes: [PlaneInfo; MAX_PLANES],
    pub tokens: [i32; MAX_PLANES],
}

impl Default for BufferDescriptor {
    fn default() -> Self {
        BufferDescriptor {
            generation: 0,
            plane_count: 0,
            width: 0,
            height: 0,
            format: 0,
            pts_ns: NO_TIMESTAMP,
            duration_ns: NO_TIMESTAMP,
            planes: [PlaneInfo::default(); MAX_PLANES],
            tokens: [UNUSED_TOKEN; MAX_PLANES],
        }
    }
}

impl BufferDescriptor {
    /// Plane metadata for the planes actually in use.
    pub fn active_planes(&self) -> &[PlaneInfo] {
        let count = (self.plane_count as usize).min(MAX_PLANES);
        &self.planes[..count]
    }

    pub fn token_tuple(&self) -> TokenTuple {
        TokenTuple(self.tokens)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.plane_count == 0 || self.plane_count as usize > MAX_PLANES {
            return Err(ProtocolError::InvalidPlaneCount(self.plane_count));
        }
        Ok(())
    }
}

/// The handle tokens identifying one lent buffer, compared by exact equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenTuple(pub [i32; MAX_PLANES]);

impl TokenTuple {
    pub fn from_tokens(tokens: &[i32]) -> Self {
        let mut tuple = [UNUSED_TOKEN; MAX_PLANES];
        for (slot, token) in tuple.iter_mut().zip(tokens) {
            *slot = *token;
        }
        TokenTuple(tuple)
    }

    pub fn as_array(&self) -> [i32; MAX_PLANES] {
        self.0
    }
}

impl Display for TokenTuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let used: Vec<String> = self
            .0
            .iter()
            .filter(|t| **t != UNUSED_TOKEN)
            .map(|t| t.to_string())
            .collect();
        write!(f, "[{}]", used.join(","))
    }
}

/// Packs a four character code such as `b"NV12"` little-endian.
pub const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32) | (code[1] as u32) << 8 | (code[2] as u32) << 16 | (code[3] as u32) << 24
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    #[error("archived length {actual} does not match fixed size {expected}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("invalid plane count {0}")]
    InvalidPlaneCount(u32),

    #[error("archive error: {0}")]
    Archive(#[from] rkyv::rancor::Error),
}

/// A message-sized, suitably aligned byte buffer.
#[repr(C, align(16))]
pub struct MessageFrame(pub [u8; MESSAGE_SIZE]);

impl MessageFrame {
    pub fn zeroed() -> Self {
        MessageFrame([0u8; MESSAGE_SIZE])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// A descriptor-sized, suitably aligned byte buffer.
#[repr(C, align(16))]
pub struct DescriptorFrame(pub [u8; DESCRIPTOR_SIZE]);

impl DescriptorFrame {
    pub fn zeroed() -> Self {
        DescriptorFrame([0u8; DESCRIPTOR_SIZE])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

pub fn encode_message(message: &ControlMessage) -> Result<MessageFrame, ProtocolError> {
    let length = compute_length(message)?;
    if length != MESSAGE_SIZE {
        return Err(ProtocolError::SizeMismatch {
            expected: MESSAGE_SIZE,
            actual: length,
        });
    }
    let mut frame = MessageFrame::zeroed();
    serialize_to_buf(message, &mut frame.0)?;
    Ok(frame)
}

pub fn decode_frame(frame: &MessageFrame) -> Result<ControlMessage, ProtocolError> {
    let archived = rkyv::access::<ArchivedControlMessage, rkyv::rancor::Error>(&frame.0)?;
    Ok(rkyv::deserialize::<ControlMessage, rkyv::rancor::Error>(archived)?)
}

/// Decodes a message from exactly [`MESSAGE_SIZE`] bytes.
pub fn decode_message(bytes: &[u8]) -> Result<ControlMessage, ProtocolError> {
    if bytes.len() != MESSAGE_SIZE {
        return Err(ProtocolError::ShortRead {
            expected: MESSAGE_SIZE,
            actual: bytes.len(),
        });
    }
    let mut frame = MessageFrame::zeroed();
    frame.0.copy_from_slice(bytes);
    decode_frame(&frame)
}

pub fn encode_descriptor(descriptor: &BufferDescriptor) -> Result<DescriptorFrame, ProtocolError> {
    let length = compute_length(descriptor)?;
    if length != DESCRIPTOR_SIZE {
        return Err(ProtocolError::SizeMismatch {
            expected: DESCRIPTOR_SIZE,
            actual: length,
        });
    }
    let mut frame = DescriptorFrame::zeroed();
    serialize_to_buf(descriptor, &mut frame.0)?;
    Ok(frame)
}

pub fn decode_descriptor(frame: &DescriptorFrame) -> Result<BufferDescriptor, ProtocolError> {
    let archived = rkyv::access::<ArchivedBufferDescriptor, rkyv::rancor::Error>(&frame.0)?;
    let descriptor = rkyv::deserialize::<BufferDescriptor, rkyv::rancor::Error>(archived)?;
    descriptor.validate()?;
    Ok(descriptor)
}

pub struct CountingWriter {
    write_count: usize,
    total_bytes: usize,
}

impl CountingWriter {
    pub fn new() -> Self {
        Self {
            write_count: 0,
            total_bytes: 0,
        }
    }

    pub fn write_count(&self) -> usize {
        self.write_count
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }
}

impl Default for CountingWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Fallible for CountingWriter {
    type Error = rkyv::rancor::Error;
}

impl Positional for CountingWriter {
    fn pos(&self) -> usize {
        self.total_bytes
    }
}

impl Writer<rkyv::rancor::Error> for CountingWriter {
    fn write(&mut self, bytes: &[u8]) -> Result<(), rkyv::rancor::Error> {
        self.write_count += 1;
        self.total_bytes += bytes.len();
        Ok(())
    }
}

pub struct SliceWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> SliceWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn written(&self) -> usize {
        self.pos
    }
}

impl<'a> Fallible for SliceWriter<'a> {
    type Error = rkyv::rancor::Error;
}

impl<'a> Positional for SliceWriter<'a> {
    fn pos(&self) -> usize {
        self.pos
    }
}

#[derive(Debug)]
pub struct OutOfSpaceError;

impl Display for OutOfSpaceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "not enough space in the buffer",)
    }
}

impl Error for OutOfSpaceError {}

impl<'a> Writer<rkyv::rancor::Error> for SliceWriter<'a> {
    fn write(&mut self, bytes: &[u8]) -> Result<(), rkyv::rancor::Error> {
        if self.pos + bytes.len() > self.buf.len() {
            fail!(OutOfSpaceError);
        }
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        Ok(())
    }
}

/// Serializes `value` into the front of `buf`.
///
/// `buf` must be at least `compute_length(value)` bytes and aligned for the
/// archived type.
///
/// # Errors
/// Returns `rkyv::rancor::Error` if the buffer is too small or serialization fails.
pub fn serialize_to_buf<'b, T>(value: &T, buf: &'b mut [u8]) -> Result<(), rkyv::rancor::Error>
where
    T: for<'a> Serialize<HighSerializer<SliceWriter<'b>, ArenaHandle<'a>, rkyv::rancor::Error>>,
{
    let writer = SliceWriter::new(buf);
    let _ = to_bytes_in(value, writer)?;
    Ok(())
}

pub fn compute_length<'a, T>(value: &'a T) -> Result<usize, rkyv::rancor::Error>
where
    T: for<'b> Serialize<HighSerializer<CountingWriter, ArenaHandle<'b>, rkyv::rancor::Error>>,
{
    let writer = CountingWriter::new();
    let w = to_bytes_in(value, writer)?;
    Ok(w.total_bytes())
}
