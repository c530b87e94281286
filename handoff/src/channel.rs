use nix::errno::Errno;
use nix::sys::socket::{recv, sendmsg, MsgFlags};
use protocol::{decode_frame, encode_message, ControlMessage, MessageFrame, ProtocolError};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;

use crate::Result;

/// Mailbox names longer than this are rejected before reading them.
pub(crate) const MAX_SHM_PATH_LEN: usize = 255;

pub(crate) fn send_message(stream: &UnixStream, message: &ControlMessage) -> Result<()> {
    let frame = encode_message(message)?;
    send_bytes(stream, frame.as_bytes())
}

pub(crate) fn send_bytes(stream: &UnixStream, bytes: &[u8]) -> Result<()> {
    let mut sent = 0;
    while sent < bytes.len() {
        let iov = [std::io::IoSlice::new(&bytes[sent..])];
        match sendmsg::<()>(stream.as_raw_fd(), &iov, &[], MsgFlags::MSG_NOSIGNAL, None) {
            Ok(n) => sent += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Reads one fixed-size message. `Ok(None)` means the peer closed the stream
/// cleanly on a message boundary; a partial message is a protocol error.
pub(crate) fn read_message(stream: &UnixStream) -> Result<Option<ControlMessage>> {
    let mut frame = MessageFrame::zeroed();
    let filled = read_full(stream, frame.as_mut_bytes())?;

    if filled == 0 {
        return Ok(None);
    }
    if filled < protocol::MESSAGE_SIZE {
        return Err(ProtocolError::ShortRead {
            expected: protocol::MESSAGE_SIZE,
            actual: filled,
        }
        .into());
    }
    Ok(Some(decode_frame(&frame)?))
}

pub(crate) fn read_exact(stream: &UnixStream, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let filled = read_full(stream, &mut buf)?;
    if filled < len {
        return Err(ProtocolError::ShortRead {
            expected: len,
            actual: filled,
        }
        .into());
    }
    Ok(buf)
}

fn read_full(stream: &UnixStream, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match recv(stream.as_raw_fd(), &mut buf[filled..], MsgFlags::empty()) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
