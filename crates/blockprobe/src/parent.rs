//! The supervising parent: wait on the child, classify its stop, record
//! fault addresses
//!
//! One trial from the parent's side is a small ptrace state machine:
//! wait for the child's self-raised SIGSTOP, resume it, wait for the
//! outcome stop, classify. Whatever happens, the child is killed with
//! SIGKILL and reaped before this module returns — a detached child
//! would be resumed and its pending SIGSEGV would reach the terminal,
//! where it reads as a crash even though faulting is this tool's normal
//! operation. Only after the child is gone is the pipe read; the frame
//! carries the authoritative code address.

use std::os::fd::OwnedFd;

use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::addrs::AccessedAddrs;
use crate::error::{ProbeError, ProbeResult};
use crate::frame::{read_frame, StatusCode};

/// What a stop signal tells us about the trial, one variant per signal
/// the child can plausibly stop with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopClass {
    /// SIGSEGV: the block touched unmapped memory, which is the event we
    /// exist to observe
    PageFault,
    /// SIGABRT: the epilogue ran, so the block completed without faulting
    Finished,
    /// SIGFPE: an arithmetic fault, fixable with different register values
    ArithmeticFault,
    /// SIGBUS: an alignment or device-style fault the probe cannot fix
    BusError,
    /// Anything else
    Unexpected,
}

pub(crate) fn classify_stop(signal: Signal) -> StopClass {
    match signal {
        Signal::SIGSEGV => StopClass::PageFault,
        Signal::SIGABRT => StopClass::Finished,
        Signal::SIGFPE => StopClass::ArithmeticFault,
        Signal::SIGBUS => StopClass::BusError,
        _ => StopClass::Unexpected,
    }
}

/// Supervise one trial: drive the child to its outcome stop, fold any
/// fault address into `accessed_addrs`, then kill, reap, and read the
/// child's status frame.
pub(crate) fn supervise(
    child: Pid,
    pipe_read: OwnedFd,
    accessed_addrs: &mut AccessedAddrs,
) -> ProbeResult<()> {
    let outcome = watch_child(child, accessed_addrs);

    // Kill unconditionally, even on success, then reap so no zombie
    // lingers. The trial outcome is reported ahead of a kill failure:
    // when the child already terminated (and the wait above reaped it),
    // the kill fails with ESRCH but the interesting error is the
    // termination itself.
    let kill_result = signal::kill(child, Signal::SIGKILL);
    let _ = waitpid(child, None);

    outcome?;
    kill_result.map_err(|err| ProbeError::os("failed to kill child process", err))?;

    let frame = read_frame(pipe_read)?;
    match frame.status_code {
        StatusCode::Ok => {
            // Keep using the same address in later trials so the blocks
            // discovered so far stay meaningful.
            accessed_addrs.code_location = frame.code_address;
            Ok(())
        }
        StatusCode::InvalidArgument => Err(ProbeError::invalid_argument(frame.message())),
        StatusCode::Internal => Err(ProbeError::internal(frame.message())),
    }
}

fn watch_child(child: Pid, accessed_addrs: &mut AccessedAddrs) -> ProbeResult<()> {
    let status = waitpid(child, None).map_err(|err| ProbeError::os("waitpid failed", err))?;
    if !matches!(status, WaitStatus::Stopped(..)) {
        return Err(ProbeError::internal(format!(
            "child terminated with an unexpected status: {status:?}"
        )));
    }

    // The child is stopped on its self-raised SIGSTOP and we are
    // attached. No ptrace options are set, so this first stop exists
    // purely to order "parent attached" before "block runs".
    ptrace::cont(child, None).map_err(|err| ProbeError::os("ptrace(CONT) failed", err))?;

    let status = waitpid(child, None).map_err(|err| ProbeError::os("waitpid failed", err))?;
    let WaitStatus::Stopped(_, stop_signal) = status else {
        return Err(ProbeError::internal(format!(
            "child terminated with an unexpected status: {status:?}"
        )));
    };

    match classify_stop(stop_signal) {
        StopClass::PageFault => {
            let siginfo = ptrace::getsiginfo(child)
                .map_err(|err| ProbeError::os("ptrace(GETSIGINFO) failed", err))?;
            let fault_address = unsafe { siginfo.si_addr() } as u64;
            if accessed_addrs.record_access(fault_address) {
                log::debug!(
                    "child faulted on new block {:#x} (fault address {fault_address:#x})",
                    accessed_addrs.accessed_blocks.last().copied().unwrap_or(0),
                );
            }
            Ok(())
        }
        StopClass::Finished => Ok(()),
        StopClass::ArithmeticFault => {
            log::debug!("child stopped with {stop_signal}; retrying with fresh registers");
            Err(ProbeError::invalid_argument("floating point exception"))
        }
        StopClass::BusError => {
            let siginfo = ptrace::getsiginfo(child)
                .map_err(|err| ProbeError::os("ptrace(GETSIGINFO) failed", err))?;
            let registers = ptrace::getregs(child)
                .map_err(|err| ProbeError::os("ptrace(GETREGS) failed", err))?;
            let fault_address = unsafe { siginfo.si_addr() } as u64;
            Err(ProbeError::internal(format!(
                "child stopped with unexpected signal {stop_signal}, fault address \
                 {fault_address:#x}\n{}",
                dump_regs(&registers)
            )))
        }
        StopClass::Unexpected => {
            let registers = ptrace::getregs(child)
                .map_err(|err| ProbeError::os("ptrace(GETREGS) failed", err))?;
            Err(ProbeError::internal(format!(
                "child stopped with unexpected signal {stop_signal}\n{}",
                dump_regs(&registers)
            )))
        }
    }
}

/// Registers at the moment of an unexplained stop, for the error message
fn dump_regs(regs: &libc::user_regs_struct) -> String {
    format!(
        "\trsp={:016x} rbp={:016x} rip={:016x}\n\
         \trax={:016x} rbx={:016x} rcx={:016x}\n\
         \trdx={:016x} rsi={:016x} rdi={:016x}\n\
         \t r8={:016x}  r9={:016x} r10={:016x}\n\
         \tr11={:016x} r12={:016x} r13={:016x}\n\
         \tr14={:016x} r15={:016x}",
        regs.rsp,
        regs.rbp,
        regs.rip,
        regs.rax,
        regs.rbx,
        regs.rcx,
        regs.rdx,
        regs.rsi,
        regs.rdi,
        regs.r8,
        regs.r9,
        regs.r10,
        regs.r11,
        regs.r12,
        regs.r13,
        regs.r14,
        regs.r15,
    )
}

#[cfg(test)]
mod tests {
    use nix::sys::signal::Signal;

    use super::{classify_stop, dump_regs, StopClass};

    #[test]
    fn test_signal_classification() {
        assert_eq!(classify_stop(Signal::SIGSEGV), StopClass::PageFault);
        assert_eq!(classify_stop(Signal::SIGABRT), StopClass::Finished);
        assert_eq!(classify_stop(Signal::SIGFPE), StopClass::ArithmeticFault);
        assert_eq!(classify_stop(Signal::SIGBUS), StopClass::BusError);
        assert_eq!(classify_stop(Signal::SIGILL), StopClass::Unexpected);
        assert_eq!(classify_stop(Signal::SIGTRAP), StopClass::Unexpected);
        assert_eq!(classify_stop(Signal::SIGSTOP), StopClass::Unexpected);
    }

    #[test]
    fn test_dump_regs_includes_every_gpr() {
        let mut regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
        regs.rip = 0x2b00_0000_0000;
        regs.rax = 0x15000;
        let dump = dump_regs(&regs);
        assert!(dump.contains("rip=00002b0000000000"), "got: {dump}");
        assert!(dump.contains("rax=0000000000015000"), "got: {dump}");
        for name in ["rsp", "rbp", "r8", "r15"] {
            assert!(dump.contains(&format!("{name}=")), "missing {name}: {dump}");
        }
    }
}
