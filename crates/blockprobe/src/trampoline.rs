// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Machine code wrapped around the caller's block
//!
//! The trampoline mapped into the child is `[prologue][block][epilogue]`,
//! contiguous and executable. The prologue loads the sixteen GPRs from
//! the [`crate::regs::X64Regs`] record whose pointer arrives in rdi (the
//! first integer argument under the SysV ABI) and falls through into the
//! block. The epilogue terminates the process by raising SIGABRT through
//! raw syscalls; it must not touch libc, which may sit in memory the
//! block has already trampled, and must not return.
//!
//! The bytes are kept pre-assembled so the child has nothing to compute
//! after fork.

/// Where the trampoline is mapped when the caller has no preference.
///
/// The middle of a large normally-empty range, so rip-relative addressing
/// inside the block is likely to hit unmapped memory, which is exactly
/// what we want to observe. If the kernel refuses the hint we accept
/// whatever it returns instead.
pub const DEFAULT_CODE_LOCATION: u64 = 0x2b00_0000_0000;

// mov r64, [rdi + disp8] for each slot of X64Regs, in field order except
// rdi itself, which is loaded last because it holds the record pointer
// while the others load. disp8 values are the field offsets; the tests
// below check them against the actual struct layout.
const PROLOGUE: [u8; 64] = [
    0x48, 0x8b, 0x47, 0x00, // mov rax, [rdi + 0x00]
    0x48, 0x8b, 0x5f, 0x08, // mov rbx, [rdi + 0x08]
    0x48, 0x8b, 0x4f, 0x10, // mov rcx, [rdi + 0x10]
    0x48, 0x8b, 0x57, 0x18, // mov rdx, [rdi + 0x18]
    0x48, 0x8b, 0x77, 0x20, // mov rsi, [rdi + 0x20]
    0x48, 0x8b, 0x67, 0x30, // mov rsp, [rdi + 0x30]
    0x48, 0x8b, 0x6f, 0x38, // mov rbp, [rdi + 0x38]
    0x4c, 0x8b, 0x47, 0x40, // mov r8,  [rdi + 0x40]
    0x4c, 0x8b, 0x4f, 0x48, // mov r9,  [rdi + 0x48]
    0x4c, 0x8b, 0x57, 0x50, // mov r10, [rdi + 0x50]
    0x4c, 0x8b, 0x5f, 0x58, // mov r11, [rdi + 0x58]
    0x4c, 0x8b, 0x67, 0x60, // mov r12, [rdi + 0x60]
    0x4c, 0x8b, 0x6f, 0x68, // mov r13, [rdi + 0x68]
    0x4c, 0x8b, 0x77, 0x70, // mov r14, [rdi + 0x70]
    0x4c, 0x8b, 0x7f, 0x78, // mov r15, [rdi + 0x78]
    0x48, 0x8b, 0x7f, 0x28, // mov rdi, [rdi + 0x28]
];

// getpid(); kill(pid, SIGABRT). Signal delivery does not depend on the
// (by now meaningless) user stack because SIGABRT's default disposition
// terminates the process in the kernel. ud2 is unreachable unless the
// kill syscall itself fails.
const EPILOGUE: [u8; 23] = [
    0xb8, 0x27, 0x00, 0x00, 0x00, // mov eax, 39 (getpid)
    0x0f, 0x05, // syscall
    0x89, 0xc7, // mov edi, eax
    0xbe, 0x06, 0x00, 0x00, 0x00, // mov esi, 6 (SIGABRT)
    0xb8, 0x3e, 0x00, 0x00, 0x00, // mov eax, 62 (kill)
    0x0f, 0x05, // syscall
    0x0f, 0x0b, // ud2
];

/// Code placed before the caller's block: load the sixteen GPRs from the
/// record pointed to by rdi, then fall through.
pub fn before_block_code() -> &'static [u8] {
    &PROLOGUE
}

/// Code placed after the caller's block: raise SIGABRT without returning.
pub fn after_block_code() -> &'static [u8] {
    &EPILOGUE
}

/// Total mapping size for a trampoline wrapping `block_len` bytes of code
pub(crate) fn mapped_len(block_len: usize) -> usize {
    PROLOGUE.len() + block_len + EPILOGUE.len()
}

#[cfg(test)]
mod tests {
    use std::mem::offset_of;

    use super::{after_block_code, before_block_code, mapped_len, DEFAULT_CODE_LOCATION};
    use crate::regs::X64Regs;

    #[test]
    fn test_prologue_is_sixteen_loads() {
        let code = before_block_code();
        assert_eq!(code.len() % 4, 0);
        assert_eq!(code.len() / 4, 16);
        for instruction in code.chunks(4) {
            // Every instruction is REX.W (0x48) or REX.WR (0x4c) + mov.
            assert!(instruction[0] == 0x48 || instruction[0] == 0x4c);
            assert_eq!(instruction[1], 0x8b);
        }
    }

    #[test]
    fn test_prologue_displacements_match_record_layout() {
        let code = before_block_code();
        let expected = [
            offset_of!(X64Regs, rax),
            offset_of!(X64Regs, rbx),
            offset_of!(X64Regs, rcx),
            offset_of!(X64Regs, rdx),
            offset_of!(X64Regs, rsi),
            offset_of!(X64Regs, rsp),
            offset_of!(X64Regs, rbp),
            offset_of!(X64Regs, r8),
            offset_of!(X64Regs, r9),
            offset_of!(X64Regs, r10),
            offset_of!(X64Regs, r11),
            offset_of!(X64Regs, r12),
            offset_of!(X64Regs, r13),
            offset_of!(X64Regs, r14),
            offset_of!(X64Regs, r15),
            offset_of!(X64Regs, rdi),
        ];
        for (instruction, offset) in code.chunks(4).zip(expected) {
            assert_eq!(instruction[3] as usize, offset);
        }
    }

    #[test]
    fn test_prologue_loads_rdi_last() {
        let code = before_block_code();
        let last = &code[code.len() - 4..];
        // ModRM 0x7f: mod=01 reg=rdi rm=rdi.
        assert_eq!(last, &[0x48, 0x8b, 0x7f, 0x28]);
    }

    #[test]
    fn test_epilogue_raises_sigabrt_and_cannot_fall_off() {
        let code = after_block_code();
        // kill is the last syscall issued...
        assert_eq!(&code[14..19], &[0xb8, 0x3e, 0x00, 0x00, 0x00]);
        // ...and the stream ends in ud2 so control cannot run off the end.
        assert_eq!(&code[code.len() - 2..], &[0x0f, 0x0b]);
    }

    #[test]
    fn test_mapped_len_sums_all_three_parts() {
        assert_eq!(
            mapped_len(7),
            before_block_code().len() + 7 + after_block_code().len()
        );
    }

    #[test]
    fn test_default_code_location_is_nonzero() {
        assert_ne!(DEFAULT_CODE_LOCATION, 0);
    }
}
