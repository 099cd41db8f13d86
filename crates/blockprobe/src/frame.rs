// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! One-shot status frame sent from the forked child to the parent
//!
//! The protocol is that the child writes either nothing (it died before
//! reaching the pipe) or exactly one frame. Sender and receiver are the
//! same binary on either side of a fork, so a fixed little-endian layout
//! is all the ABI that is needed; the frame is still encoded explicitly
//! into a zero-initialised byte buffer rather than written out of a
//! struct, so no uninitialised padding ever reaches the pipe.
//!
//! Everything in this module is callable from the child after fork: the
//! encode path works in fixed-size stack buffers and never allocates.

use std::borrow::Cow;
use std::fmt;
use std::os::fd::{AsRawFd, OwnedFd};

use nix::errno::Errno;
use nix::unistd;

use crate::error::{ProbeError, ProbeResult};

/// Capacity of the status message field, terminating NUL included
pub(crate) const STATUS_MESSAGE_CAPACITY: usize = 1024;

const STATUS_CODE_OFFSET: usize = 0;
const MESSAGE_OFFSET: usize = 4;
const CODE_ADDRESS_OFFSET: usize = MESSAGE_OFFSET + STATUS_MESSAGE_CAPACITY;

/// Total size of one encoded frame on the pipe
pub(crate) const FRAME_LEN: usize = CODE_ADDRESS_OFFSET + 8;

/// Outcome class carried in a frame; the closed set shared with
/// [`crate::error::ProbeError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusCode {
    Ok,
    InvalidArgument,
    Internal,
}

impl StatusCode {
    fn from_wire(raw: u32) -> Self {
        match raw {
            0 => Self::Ok,
            1 => Self::InvalidArgument,
            // A discriminant we never sent means the frame is damaged;
            // surface it as an internal failure rather than guessing.
            _ => Self::Internal,
        }
    }

    fn to_wire(self) -> u32 {
        match self {
            Self::Ok => 0,
            Self::InvalidArgument => 1,
            Self::Internal => 2,
        }
    }
}

/// The data communicated from the child to the parent.
///
/// If `status_code` is not [`StatusCode::Ok`], `code_address` is
/// meaningless and only the message is valid.
#[derive(Clone)]
pub(crate) struct PipedData {
    pub(crate) status_code: StatusCode,
    pub(crate) status_message: [u8; STATUS_MESSAGE_CAPACITY],
    pub(crate) code_address: u64,
}

impl fmt::Debug for PipedData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipedData")
            .field("status_code", &self.status_code)
            .field("message", &self.message())
            .field("code_address", &self.code_address)
            .finish()
    }
}

impl PipedData {
    /// A success frame carrying the address the code was mapped at
    pub(crate) fn ok(code_address: u64) -> Self {
        Self {
            status_code: StatusCode::Ok,
            status_message: [0; STATUS_MESSAGE_CAPACITY],
            code_address,
        }
    }

    /// A failure frame. The message is truncated to capacity minus one so
    /// a terminating NUL always survives.
    pub(crate) fn status(status_code: StatusCode, message: &[u8]) -> Self {
        let mut status_message = [0u8; STATUS_MESSAGE_CAPACITY];
        let len = message.len().min(STATUS_MESSAGE_CAPACITY - 1);
        status_message[..len].copy_from_slice(&message[..len]);
        Self {
            status_code,
            status_message,
            code_address: 0,
        }
    }

    /// The message up to its NUL terminator
    pub(crate) fn message(&self) -> Cow<'_, str> {
        let end = self
            .status_message
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(STATUS_MESSAGE_CAPACITY);
        String::from_utf8_lossy(&self.status_message[..end])
    }

    fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0u8; FRAME_LEN];
        buf[STATUS_CODE_OFFSET..STATUS_CODE_OFFSET + 4]
            .copy_from_slice(&self.status_code.to_wire().to_le_bytes());
        buf[MESSAGE_OFFSET..MESSAGE_OFFSET + STATUS_MESSAGE_CAPACITY]
            .copy_from_slice(&self.status_message);
        buf[CODE_ADDRESS_OFFSET..CODE_ADDRESS_OFFSET + 8]
            .copy_from_slice(&self.code_address.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; FRAME_LEN]) -> Self {
        let mut raw_code = [0u8; 4];
        raw_code.copy_from_slice(&buf[STATUS_CODE_OFFSET..STATUS_CODE_OFFSET + 4]);
        let mut status_message = [0u8; STATUS_MESSAGE_CAPACITY];
        status_message.copy_from_slice(&buf[MESSAGE_OFFSET..MESSAGE_OFFSET + STATUS_MESSAGE_CAPACITY]);
        let mut raw_address = [0u8; 8];
        raw_address.copy_from_slice(&buf[CODE_ADDRESS_OFFSET..CODE_ADDRESS_OFFSET + 8]);
        Self {
            status_code: StatusCode::from_wire(u32::from_le_bytes(raw_code)),
            status_message,
            code_address: u64::from_le_bytes(raw_address),
        }
    }
}

/// Fixed-capacity sink for building a status message without allocating.
///
/// Overflow is truncated silently; the last byte is reserved so the
/// message stays NUL-terminated when copied into a frame.
pub(crate) struct MessageBuf {
    buf: [u8; STATUS_MESSAGE_CAPACITY],
    len: usize,
}

impl MessageBuf {
    pub(crate) const fn new() -> Self {
        Self {
            buf: [0; STATUS_MESSAGE_CAPACITY],
            len: 0,
        }
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl fmt::Write for MessageBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = STATUS_MESSAGE_CAPACITY - 1 - self.len;
        let take = room.min(s.len());
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

// EWOULDBLOCK aliases EAGAIN on Linux, so two checks cover all three
// retryable codes.
fn is_retryable(err: Errno) -> bool {
    err == Errno::EINTR || err == Errno::EAGAIN
}

/// Write one frame to `fd`, resuming short writes, then close it.
///
/// Called from the child after fork: no allocation on any path.
pub(crate) fn write_frame(fd: OwnedFd, frame: &PipedData) -> ProbeResult<()> {
    let buf = frame.encode();
    let mut offset = 0;
    while offset < buf.len() {
        match unistd::write(&fd, &buf[offset..]) {
            Ok(written) => offset += written,
            Err(err) if is_retryable(err) => continue,
            Err(err) => return Err(ProbeError::os("failed to write to pipe", err)),
        }
    }
    // fd drops here, closing the write end on success.
    Ok(())
}

/// Read one full frame from `fd`, resuming short reads, then close it.
///
/// End-of-file before a whole frame arrived means the child died before
/// writing; that is an internal error, not a truncated success.
pub(crate) fn read_frame(fd: OwnedFd) -> ProbeResult<PipedData> {
    let mut buf = [0u8; FRAME_LEN];
    let mut offset = 0;
    while offset < FRAME_LEN {
        match unistd::read(fd.as_raw_fd(), &mut buf[offset..]) {
            Ok(0) => break,
            Ok(read) => offset += read,
            Err(err) if is_retryable(err) => continue,
            Err(err) => return Err(ProbeError::os("failed to read from pipe", err)),
        }
    }
    if offset != FRAME_LEN {
        return Err(ProbeError::internal(format!(
            "read less than expected from pipe (expected {FRAME_LEN}B, got {offset}B)"
        )));
    }
    Ok(PipedData::decode(&buf))
}
