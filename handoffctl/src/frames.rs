use handoff::{MediaBuffer, Plane};
use protocol::fourcc;
use shmem::SharedMemory;

pub const GREY: u32 = fourcc(b"GREY");

/// A single-plane grey frame whose rows are shifted by `index`, so
/// consecutive frames checksum differently.
pub fn synthetic_frame(width: u32, height: u32, index: u64) -> handoff::Result<MediaBuffer> {
    let size = (width as usize * height as usize).max(1);
    let mut memory = SharedMemory::new(size)?;

    let stride = width.max(1) as usize;
    for (row, line) in memory.as_mut_slice().chunks_mut(stride).enumerate() {
        for (col, byte) in line.iter_mut().enumerate() {
            *byte = (row as u64 + col as u64 + index) as u8;
        }
    }

    let plane = Plane::new(memory, width, GREY)?;
    MediaBuffer::new(vec![plane], width, height, GREY)
}

/// CRC-32 (IEEE) of `data`, logged per plane on both ends.
pub fn checksum(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}
