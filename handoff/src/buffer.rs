use protocol::{BufferDescriptor, PlaneInfo, MAX_PLANES, NO_TIMESTAMP, UNUSED_TOKEN};
use shmem::{ImportedRegion, SharedMemory};
use std::fs::File;
use std::os::fd::OwnedFd;

use crate::{HandoffError, Result};

/// One memory region of a [`MediaBuffer`] together with its layout.
pub struct Plane {
    memory: SharedMemory,
    info: PlaneInfo,
}

impl Plane {
    /// A plane spanning the whole region.
    pub fn new(memory: SharedMemory, stride: u32, format: u32) -> Result<Self> {
        let size = u32::try_from(memory.size()).map_err(|_| HandoffError::InvalidPlaneLayout {
            offset: 0,
            size: memory.size(),
            available: u32::MAX as usize,
        })?;
        Self::with_layout(
            memory,
            PlaneInfo {
                size,
                stride,
                offset: 0,
                format,
            },
        )
    }

    /// A plane occupying `info.size` bytes at `info.offset` within the region.
    pub fn with_layout(memory: SharedMemory, info: PlaneInfo) -> Result<Self> {
        let end = info.offset as usize + info.size as usize;
        if info.size == 0 || end > memory.size() {
            return Err(HandoffError::InvalidPlaneLayout {
                offset: info.offset as usize,
                size: info.size as usize,
                available: memory.size(),
            });
        }
        Ok(Plane { memory, info })
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut SharedMemory {
        &mut self.memory
    }

    pub fn info(&self) -> PlaneInfo {
        self.info
    }

    /// Bytes a peer has to map to reach the end of this plane.
    pub fn mapped_len(&self) -> usize {
        self.info.offset as usize + self.info.size as usize
    }

    pub fn data(&self) -> &[u8] {
        let start = self.info.offset as usize;
        &self.memory.as_slice()[start..start + self.info.size as usize]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let start = self.info.offset as usize;
        let end = start + self.info.size as usize;
        &mut self.memory.as_mut_slice()[start..end]
    }
}

/// A frame owned by the producer. Shared with the session as an `Arc` so the
/// session can keep it alive while the consumer holds it.
pub struct MediaBuffer {
    planes: Vec<Plane>,
    width: u32,
    height: u32,
    format: u32,
    pts_ns: Option<u64>,
    duration_ns: Option<u64>,
}

impl MediaBuffer {
    pub fn new(planes: Vec<Plane>, width: u32, height: u32, format: u32) -> Result<Self> {
        if planes.is_empty() || planes.len() > MAX_PLANES {
            return Err(HandoffError::InvalidPlaneCount(planes.len()));
        }
        Ok(MediaBuffer {
            planes,
            width,
            height,
            format,
            pts_ns: None,
            duration_ns: None,
        })
    }

    pub fn with_timing(mut self, pts_ns: Option<u64>, duration_ns: Option<u64>) -> Self {
        self.pts_ns = pts_ns;
        self.duration_ns = duration_ns;
        self
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn plane_mut(&mut self, index: usize) -> Option<&mut Plane> {
        self.planes.get_mut(index)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> u32 {
        self.format
    }

    pub fn pts_ns(&self) -> Option<u64> {
        self.pts_ns
    }

    pub fn duration_ns(&self) -> Option<u64> {
        self.duration_ns
    }

    pub(crate) fn descriptor(&self, generation: u64, tokens: &[i32]) -> BufferDescriptor {
        let mut descriptor = BufferDescriptor {
            generation,
            plane_count: self.planes.len() as u32,
            width: self.width,
            height: self.height,
            format: self.format,
            pts_ns: self.pts_ns.unwrap_or(NO_TIMESTAMP),
            duration_ns: self.duration_ns.unwrap_or(NO_TIMESTAMP),
            ..Default::default()
        };
        for (i, plane) in self.planes.iter().enumerate() {
            descriptor.planes[i] = plane.info;
            descriptor.tokens[i] = tokens.get(i).copied().unwrap_or(UNUSED_TOKEN);
        }
        descriptor
    }
}

/// Turns a local plane into a token a peer process can import.
pub trait Exporter: Send + Sync {
    fn export(&self, plane: &Plane) -> Result<i32>;
}

/// Exports a plane as its memfd descriptor number. The peer reaches it
/// through `/proc/<pid>/fd`, so the number stays valid only while the plane
/// is alive.
#[derive(Debug, Default, Clone, Copy)]
pub struct FdExporter;

impl Exporter for FdExporter {
    fn export(&self, plane: &Plane) -> Result<i32> {
        Ok(plane.memory().raw_fd())
    }
}

/// The process on the other end of the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerProcess {
    pub pid: i32,
}

/// Maps a token exported by a peer into this process.
pub trait Importer: Send + Sync {
    fn import(&self, peer: &PeerProcess, token: i32, len: usize) -> Result<ImportedRegion>;
}

/// Counterpart of [`FdExporter`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcFdImporter;

impl Importer for ProcFdImporter {
    fn import(&self, peer: &PeerProcess, token: i32, len: usize) -> Result<ImportedRegion> {
        let path = format!("/proc/{}/fd/{}", peer.pid, token);
        let file = File::open(&path).map_err(|e| HandoffError::Import {
            token,
            reason: format!("{}: {}", path, e),
        })?;

        ImportedRegion::map_readonly(OwnedFd::from(file), len).map_err(|e| HandoffError::Import {
            token,
            reason: e.to_string(),
        })
    }
}
