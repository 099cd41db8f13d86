// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The forked child: map memory, install the trampoline, jump into it
//!
//! Everything here runs between `fork` and the jump into the mapped
//! block, under two standing constraints:
//!
//! - **No heap allocation.** The parent process may hold its allocator
//!   lock on another thread at the moment of fork, and the lock never
//!   gets released in the child. Status messages are built in a
//!   fixed-capacity stack buffer and errors travel as static strings
//!   plus formatted values, never as `String`.
//! - **No libc helpers after the copy starts.** The block's previously
//!   discovered addresses get mapped at fixed locations that can shadow
//!   anything, so the final copy uses the raw `rep movsb` primitive and
//!   the jump is a bare function-pointer call.
//!
//! mmap/munmap go through `libc` directly with `MAP_FAILED` checks; the
//! ptrace and signal calls are thin `nix` wrappers.

use std::fmt::{self, Write as _};
use std::mem;
use std::os::fd::OwnedFd;
use std::process;

use libc::{c_void, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};

use crate::addrs::AccessedAddrs;
use crate::frame::{write_frame, MessageBuf, PipedData, StatusCode};
use crate::rawcopy::{copy_bytes, fill_probe_pattern};
use crate::regs::X64Regs;
use crate::trampoline;

/// A region whose contents the probe pattern resolves to. Reads of
/// pattern-filled blocks see the pointer value `0x0000_0008_0000_0008`,
/// which lands here; the region must be unmapped so dereferencing it
/// faults and gets recorded like any other access.
const PATTERN_TARGET_ADDRESS: u64 = 0x8_0000_0000;
const PATTERN_TARGET_LEN: usize = 0x10000;

/// Run one trial in the forked child. Never returns: control either
/// jumps into the mapped block (whose epilogue kills the process) or
/// aborts after reporting a status frame.
pub(crate) fn run(block: &[u8], pipe_write: OwnedFd, addrs: &AccessedAddrs) -> ! {
    // Make sure the parent is attached before doing anything it might
    // want to observe.
    if let Err(err) = ptrace::traceme() {
        abort_with(
            pipe_write,
            StatusCode::Internal,
            format_args!("ptrace(TRACEME) failed: {err}"),
        );
    }
    let _ = signal::raise(Signal::SIGSTOP);

    // Best effort: failure just means reads of the pattern value may go
    // unobserved, which is not worth aborting over.
    unsafe {
        libc::munmap(PATTERN_TARGET_ADDRESS as *mut c_void, PATTERN_TARGET_LEN);
    }

    // Re-map every address earlier trials discovered, at exactly the
    // address it was observed at.
    for &accessed_location in &addrs.accessed_blocks {
        let wanted = accessed_location as *mut c_void;
        let mapped = unsafe {
            libc::mmap(
                wanted,
                addrs.block_size,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mapped == MAP_FAILED {
            abort_with(
                pipe_write,
                StatusCode::Internal,
                format_args!(
                    "mapping previously discovered address {accessed_location:#x} failed: {}",
                    Errno::last()
                ),
            );
        }
        if mapped != wanted {
            // The kernel moved us. This happens when the address was
            // computed from registers and is not valid to map, which
            // different register values may fix; the distinct status code
            // is the driver's retry signal.
            abort_with(
                pipe_write,
                StatusCode::InvalidArgument,
                format_args!(
                    "couldn't map previously discovered address {accessed_location:#x} at its \
                     requested location"
                ),
            );
        }
        unsafe { fill_probe_pattern(mapped as *mut u8, addrs.block_size) };
    }

    let before_block = trampoline::before_block_code();
    let after_block = trampoline::after_block_code();
    let total_len = trampoline::mapped_len(block.len());

    let mut desired_code_location = addrs.code_location;
    if desired_code_location == 0 {
        desired_code_location = trampoline::DEFAULT_CODE_LOCATION;
    }

    // Unlike the re-mapped blocks above, drift here is fine: the frame
    // tells the parent where the code actually landed.
    let mapped = unsafe {
        libc::mmap(
            desired_code_location as *mut c_void,
            total_len,
            PROT_WRITE | PROT_EXEC,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if mapped == MAP_FAILED {
        abort_with(
            pipe_write,
            StatusCode::Internal,
            format_args!("mapping code region failed: {}", Errno::last()),
        );
    }

    let frame = PipedData::ok(mapped as u64);
    if write_frame(pipe_write, &frame).is_err() {
        process::abort();
    }

    // From here on, nothing but the raw byte mover and the jump itself.
    unsafe {
        let code = mapped as *mut u8;
        copy_bytes(code, before_block.as_ptr(), before_block.len());
        copy_bytes(code.add(before_block.len()), block.as_ptr(), block.len());
        copy_bytes(
            code.add(before_block.len() + block.len()),
            after_block.as_ptr(),
            after_block.len(),
        );

        let entry: extern "C" fn(*const X64Regs) -> ! = mem::transmute(mapped);
        entry(&addrs.initial_regs)
    }
}

/// Report a failure frame on the pipe, then abort so the parent sees a
/// signal stop. Write errors are ignored: aborting is the only recourse
/// left either way, and the parent will report the dead pipe.
fn abort_with(pipe_write: OwnedFd, status_code: StatusCode, message: fmt::Arguments<'_>) -> ! {
    let mut buf = MessageBuf::new();
    let _ = buf.write_fmt(message);
    let frame = PipedData::status(status_code, buf.as_bytes());
    let _ = write_frame(pipe_write, &frame);
    process::abort();
}
