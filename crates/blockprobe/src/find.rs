//! The convergence driver and public entry point
//!
//! Each trial forks a child that maps everything discovered so far and
//! runs the block; the parent records at most one new fault address per
//! trial. Re-running until a trial discovers nothing reaches a fixed
//! point: by then every address the block faults on (given these
//! registers) has been observed. Fixable failures restart discovery
//! under freshly randomised registers, because a new register set can
//! select entirely different addresses.

use rand::Rng;

use nix::unistd::{self, ForkResult};

use crate::addrs::AccessedAddrs;
use crate::child;
use crate::error::{ProbeError, ProbeResult};
use crate::parent;
use crate::regs::X64Regs;

/// How many trials may end in a fixable failure before the block is
/// declared unrunnable. Strictly: the run aborts when the trial counter
/// has passed this value at the moment a fixable failure arrives.
pub const MAX_FIXABLE_RETRIES: u32 = 100;

/// Discover the memory addresses `block` reads or writes when executed.
///
/// `block` is raw x86-64 machine code, treated as an opaque byte string;
/// an empty block is fine and simply falls through to the epilogue. On
/// success the returned record holds the address the code was mapped at,
/// the page-aligned addresses the block faulted on in discovery order,
/// and the register state those observations were made under.
///
/// Addresses that happen to hit already-mapped memory never fault and so
/// are never observed; this is a known limitation. A block that loops
/// forever will hang the caller — there is no watchdog.
pub fn find_accessed_addrs(block: &[u8]) -> ProbeResult<AccessedAddrs> {
    find_accessed_addrs_with_rng(block, &mut rand::thread_rng())
}

/// [`find_accessed_addrs`] with a caller-supplied source of register
/// randomness, so runs can be reproduced.
pub fn find_accessed_addrs_with_rng<R: Rng + ?Sized>(
    block: &[u8],
    rng: &mut R,
) -> ProbeResult<AccessedAddrs> {
    let block_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    let mut accessed_addrs = AccessedAddrs::new(block_size);

    let mut trials: u32 = 0;
    loop {
        let blocks_before_trial = accessed_addrs.accessed_blocks.len();
        let outcome = run_trial(block, &mut accessed_addrs);
        trials += 1;

        match outcome {
            Ok(()) => {
                if accessed_addrs.accessed_blocks.len() == blocks_before_trial {
                    break;
                }
            }
            Err(err) if err.is_fixable() => {
                if trials > MAX_FIXABLE_RETRIES {
                    return Err(err);
                }
                // The next register set may select entirely different
                // addresses, so everything discovered under the old one
                // is stale.
                accessed_addrs.accessed_blocks.clear();
                accessed_addrs.initial_regs = X64Regs::randomised(rng);
                log::debug!("fixable failure on trial {trials}, randomising registers: {err}");
            }
            Err(err) => return Err(err),
        }
    }

    log::debug!(
        "converged after {trials} trials with {} accessed blocks at code location {:#x}",
        accessed_addrs.accessed_blocks.len(),
        accessed_addrs.code_location,
    );
    Ok(accessed_addrs)
}

/// Fork and run one trial. The child half never returns.
fn run_trial(block: &[u8], accessed_addrs: &mut AccessedAddrs) -> ProbeResult<()> {
    let (pipe_read, pipe_write) = unistd::pipe()
        .map_err(|err| ProbeError::os("failed to open pipe for child process", err))?;

    // Safety: the child calls nothing that can touch the allocator or
    // any other lock a parent thread might hold across the fork; see the
    // constraints documented in [`crate::child`].
    match unsafe { unistd::fork() }.map_err(|err| ProbeError::os("failed to fork", err))? {
        ForkResult::Child => {
            // The child only writes.
            drop(pipe_read);
            child::run(block, pipe_write, accessed_addrs)
        }
        ForkResult::Parent { child } => {
            // The parent only reads.
            drop(pipe_write);
            parent::supervise(child, pipe_read, accessed_addrs)
        }
    }
}
