//! # Typed x86 (32-bit) Control Registers
//!
//! Bitfield models of the control registers the memory-management core needs,
//! plus the [`Mmu`] trait that abstracts access to them. Paging code never
//! touches a register directly; it goes through an [`Mmu`] implementation so
//! that hosted tests can substitute a software model of the CPU.
//!
//! The inline-assembly implementation ([`X86Mmu`]) and the port-I/O helpers
//! ([`port`]) are gated behind the `asm` feature — they only make sense when
//! the crate is compiled for the machine it drives.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod cr0;
mod cr3;

#[cfg(feature = "asm")]
pub mod port;

pub use cr0::Cr0;
pub use cr3::Cr3;

use kernel_addresses::VirtAddr;

/// Access to the address-translation state of the CPU.
///
/// Reads are side-effect free. Writes change which memory the CPU can see and
/// are therefore `unsafe`: the caller must guarantee that the code executing
/// after the write (including any fault handlers) remains mapped.
pub trait Mmu {
    fn read_cr0(&self) -> Cr0;

    /// # Safety
    /// Toggling CR0.PG switches address translation on or off for all
    /// subsequent accesses. The active page directory must identity-map the
    /// executing code when the bit is set.
    unsafe fn write_cr0(&mut self, cr0: Cr0);

    /// The faulting linear address of the most recent page fault.
    fn read_cr2(&self) -> VirtAddr;

    fn read_cr3(&self) -> Cr3;

    /// # Safety
    /// Loading CR3 activates a different page directory and flushes non-global
    /// TLB entries. The target directory must map the executing code.
    unsafe fn write_cr3(&mut self, cr3: Cr3);
}

/// The real CPU, accessed through `mov`s to and from the control registers.
#[cfg(feature = "asm")]
#[derive(Default)]
pub struct X86Mmu;

#[cfg(feature = "asm")]
impl Mmu for X86Mmu {
    fn read_cr0(&self) -> Cr0 {
        let cr0: u32;
        unsafe {
            core::arch::asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
        }
        Cr0::from_bits(cr0)
    }

    unsafe fn write_cr0(&mut self, cr0: Cr0) {
        unsafe {
            core::arch::asm!("mov cr0, {}", in(reg) cr0.into_bits(), options(nostack, preserves_flags));
        }
    }

    fn read_cr2(&self) -> VirtAddr {
        let cr2: u32;
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) cr2, options(nomem, nostack, preserves_flags));
        }
        VirtAddr::new(cr2)
    }

    fn read_cr3(&self) -> Cr3 {
        let cr3: u32;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Cr3::from_bits(cr3)
    }

    unsafe fn write_cr3(&mut self, cr3: Cr3) {
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3.into_bits(), options(nostack, preserves_flags));
        }
    }
}
