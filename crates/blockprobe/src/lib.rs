//! Empirical discovery of the memory a basic block accesses
//!
//! Given an arbitrary sequence of raw x86-64 machine-code bytes, this
//! crate finds the set of memory addresses the code reads or writes when
//! executed with a chosen initial register state. The result feeds
//! tooling that must supply plausible memory contents so the block can
//! later be re-executed or modelled without crashing.
//!
//! # How it works
//!
//! Every trial forks a child process. The child asks to be traced, maps
//! every address discovered so far (filled with a recognisable pattern),
//! maps a write+execute region, installs a trampoline —
//! `[prologue][block][epilogue]` — reports the mapping address over a
//! pipe, and jumps in. The prologue loads the sixteen general-purpose
//! registers from a record supplied by the parent; the epilogue
//! terminates the child cleanly.
//!
//! The parent watches the child through ptrace. A SIGSEGV stop means the
//! block touched unmapped memory: the fault address is read from the
//! signal information, bucketed to its page, and recorded. A SIGABRT
//! stop means the block ran to completion. Either way the child is
//! killed and reaped, and the next trial maps one more page than the
//! last. The loop terminates when a trial discovers nothing new.
//!
//! SIGFPE stops are treated as fixable: arithmetic faults usually mean
//! an unlucky register seed (a zero divisor, say), so the driver wipes
//! its discoveries, randomises the registers, and starts over, giving up
//! after [`MAX_FIXABLE_RETRIES`] failed trials.
//!
//! # Limitations
//!
//! - Accesses that land in memory that happens to be mapped already
//!   never fault and are never observed.
//! - A block that loops forever hangs the caller; there is no watchdog.
//! - The block is assumed to come from a trusted assembler pipeline.
//!   This is an observation harness, not a security sandbox.
//!
//! # Example
//!
//! ```no_run
//! // mov rax, [rdi + 0x50000000]
//! let block = [0x48, 0x8b, 0x87, 0x00, 0x00, 0x00, 0x50];
//! let addrs = blockprobe::find_accessed_addrs(&block)?;
//! for accessed in &addrs.accessed_blocks {
//!     println!("block touches page {accessed:#x}");
//! }
//! # Ok::<(), blockprobe::ProbeError>(())
//! ```

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
compile_error!("blockprobe drives ptrace and raw x86-64 code; only x86-64 Linux is supported");

mod addrs;
mod child;
mod error;
mod find;
mod frame;
mod parent;
mod rawcopy;
mod regs;
pub mod trampoline;

pub use addrs::AccessedAddrs;
pub use error::{ProbeError, ProbeResult};
pub use find::{find_accessed_addrs, find_accessed_addrs_with_rng, MAX_FIXABLE_RETRIES};
pub use regs::{X64Regs, INITIAL_REG_VALUE};
