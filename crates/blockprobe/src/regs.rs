//! Initial register state loaded before entering a block
//!
//! The prologue reads this record through the pointer it receives in rdi,
//! so the layout is part of the trampoline contract: `#[repr(C)]`, one
//! 64-bit slot per general-purpose register, in the order below. The
//! prologue hard-codes these offsets (see [`crate::trampoline`]).

use rand::Rng;

/// The value every register starts at on the first trial.
///
/// Chosen to be almost the lowest address that is able to be mapped: low
/// enough that a register multiplied or added to another register still
/// lands in reachable memory, with room below for the small negative
/// displacements that are common in address computations.
pub const INITIAL_REG_VALUE: u64 = 0x15000;

/// The candidate values the randomiser draws from: zero, a low address,
/// and a high address. Affine combinations of these are likely to land
/// on mappable low memory.
const RANDOM_REG_VALUES: [u64; 3] = [0, 0x15000, 0x1000000];

/// The sixteen general-purpose x86-64 integer registers.
///
/// Field order is the trampoline ABI; do not reorder. rdi is listed with
/// the rest but the prologue loads it last, since it holds the pointer
/// to this record while the others are loaded.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X64Regs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl X64Regs {
    /// All sixteen registers set to the same value
    pub fn uniform(value: u64) -> Self {
        Self {
            rax: value,
            rbx: value,
            rcx: value,
            rdx: value,
            rsi: value,
            rdi: value,
            rsp: value,
            rbp: value,
            r8: value,
            r9: value,
            r10: value,
            r11: value,
            r12: value,
            r13: value,
            r14: value,
            r15: value,
        }
    }

    /// Each register independently drawn from [`RANDOM_REG_VALUES`]
    pub(crate) fn randomised<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut draw = || RANDOM_REG_VALUES[rng.gen_range(0..RANDOM_REG_VALUES.len())];
        Self {
            rax: draw(),
            rbx: draw(),
            rcx: draw(),
            rdx: draw(),
            rsi: draw(),
            rdi: draw(),
            rsp: draw(),
            rbp: draw(),
            r8: draw(),
            r9: draw(),
            r10: draw(),
            r11: draw(),
            r12: draw(),
            r13: draw(),
            r14: draw(),
            r15: draw(),
        }
    }
}

impl Default for X64Regs {
    fn default() -> Self {
        Self::uniform(INITIAL_REG_VALUE)
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::{X64Regs, INITIAL_REG_VALUE, RANDOM_REG_VALUES};

    #[test]
    fn test_uniform_sets_every_register() {
        let regs = X64Regs::uniform(0x42);
        assert_eq!(regs.rax, 0x42);
        assert_eq!(regs.rdi, 0x42);
        assert_eq!(regs.rsp, 0x42);
        assert_eq!(regs.r15, 0x42);
    }

    #[test]
    fn test_default_uses_initial_value() {
        assert_eq!(X64Regs::default(), X64Regs::uniform(INITIAL_REG_VALUE));
    }

    #[test]
    fn test_randomised_only_draws_from_candidate_set() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let regs = X64Regs::randomised(&mut rng);
            for value in [
                regs.rax, regs.rbx, regs.rcx, regs.rdx, regs.rsi, regs.rdi, regs.rsp, regs.rbp,
                regs.r8, regs.r9, regs.r10, regs.r11, regs.r12, regs.r13, regs.r14, regs.r15,
            ] {
                assert!(RANDOM_REG_VALUES.contains(&value), "unexpected value {value:#x}");
            }
        }
    }

    #[test]
    fn test_randomised_is_deterministic_for_a_seed() {
        let a = X64Regs::randomised(&mut StdRng::seed_from_u64(9));
        let b = X64Regs::randomised(&mut StdRng::seed_from_u64(9));
        assert_eq!(a, b);
    }
}
