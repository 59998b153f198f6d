//! # Two-Level Virtual Memory
//!
//! x86 32-bit protected-mode paging for one address space: a page directory,
//! dynamically allocated page tables, and demand population of data frames on
//! first touch.
//!
//! ## Virtual address walk
//!
//! A 32-bit virtual address splits into three fields:
//!
//! ```text
//! | 31‒22  | 21‒12  | 11‒0   |
//! |   PD   |   PT   | Offset |
//! ```
//!
//! The CPU uses the first two as indices into two levels of tables, each one
//! frame of 1024 four-byte entries:
//!
//! ```text
//!  PD  →  PT  →  Physical Frame
//!  │       │
//!  │       └───► PTE (Page Table Entry)     → maps one 4 KiB page
//!  └───────────► PDE (Page Directory Entry) → points at one PT
//! ```
//!
//! ## The self-map
//!
//! Slot 1023 of every directory points back at the directory itself. Once
//! such a directory is loaded, the hardware walk makes the paging structures
//! addressable at fixed virtual locations:
//!
//! - the directory appears at [`DIRECTORY_WINDOW`] (`0xFFFF_F000`): the walk
//!   resolves PD 1023 → the directory (as "page table") → entry 1023 → the
//!   directory again (as "data page");
//! - the page table serving directory slot `d` appears at
//!   [`TABLE_WINDOW_BASE`]` | (d << 12)`: PD 1023 → the directory → entry `d`
//!   → that page table as the "data page".
//!
//! This is what lets the fault handler edit any page table without keeping a
//! reverse map, at the price of the top 4 MiB of the address space.
//!
//! ## The [`TableView`] seam
//!
//! All table access goes through a [`TableView`], which turns a frame number
//! into a typed `&mut` table. Three views exist:
//!
//! - [`IdentityView`] — physical address used as pointer; valid while paging
//!   is off and for identity-mapped kernel memory afterwards;
//! - [`SelfMapView`] — the fixed windows described above; valid once the
//!   directory is loaded and paging is on;
//! - test views over a simulated frame arena, which is how the whole crate is
//!   exercised on a hosted target.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod entry;
mod fault;
mod paging;
mod table;

pub use entry::PageEntry;
pub use fault::{FaultRecord, PageFaultErrorCode};
pub use paging::{
    MAX_VM_POOLS, PageTable, PagingSystem, VmWindow, enable_paging,
};
pub use table::{ENTRIES, PageDirectory, PageTableFrame};

use kernel_addresses::{Frame, VirtAddr};
use kernel_frames::FramePoolError;

/// Directory slot reserved for the self-map.
pub const SELF_MAP_SLOT: usize = 1023;

/// Virtual address at which the loaded directory reads itself.
pub const DIRECTORY_WINDOW: VirtAddr = VirtAddr::new(0xFFFF_F000);

/// Base of the 4 MiB window exposing all page tables; the table for
/// directory slot `d` sits at `TABLE_WINDOW_BASE | (d << 12)`.
pub const TABLE_WINDOW_BASE: VirtAddr = VirtAddr::new(0xFFC0_0000);

/// Access to paging structures stored in physical frames.
///
/// The returned references alias the frame's memory; callers keep them short
/// lived and never hold two views of the same frame at once.
pub trait TableView {
    /// Borrow the page directory stored in `directory`.
    ///
    /// # Safety
    /// `directory` must hold a page directory reachable through this view,
    /// and no other reference to that frame may be live.
    unsafe fn directory<'a>(&self, directory: Frame) -> &'a mut PageDirectory;

    /// Borrow the page table serving directory slot `slot`, stored in
    /// `table`.
    ///
    /// # Safety
    /// `table` must hold the page table that the loaded directory's entry
    /// `slot` points at, and no other reference to that frame may be live.
    unsafe fn table<'a>(&self, slot: usize, table: Frame) -> &'a mut PageTableFrame;
}

/// Physical addresses used as pointers.
///
/// Correct while CR0.PG is clear, and for frames inside the identity-mapped
/// shared region afterwards. This is the view a page-table constructor uses:
/// the frames of a directory under construction are not yet reachable
/// through any self-map.
#[derive(Default)]
pub struct IdentityView;

impl TableView for IdentityView {
    unsafe fn directory<'a>(&self, directory: Frame) -> &'a mut PageDirectory {
        unsafe { &mut *(directory.base().as_u32() as usize as *mut PageDirectory) }
    }

    unsafe fn table<'a>(&self, _slot: usize, table: Frame) -> &'a mut PageTableFrame {
        unsafe { &mut *(table.base().as_u32() as usize as *mut PageTableFrame) }
    }
}

/// The hardware self-map windows.
///
/// Only valid once the directory with its slot-1023 self-entry has been
/// loaded and paging is enabled; the frame arguments are redundant then (the
/// walk finds the frames), and are only sanity-checked in debug builds
/// against CR3-relative expectations by callers.
#[derive(Default)]
pub struct SelfMapView;

impl TableView for SelfMapView {
    unsafe fn directory<'a>(&self, _directory: Frame) -> &'a mut PageDirectory {
        unsafe { &mut *(DIRECTORY_WINDOW.as_u32() as usize as *mut PageDirectory) }
    }

    unsafe fn table<'a>(&self, slot: usize, _table: Frame) -> &'a mut PageTableFrame {
        let window = TABLE_WINDOW_BASE.as_u32() | ((slot as u32) << 12);
        unsafe { &mut *(window as usize as *mut PageTableFrame) }
    }
}

/// Errors from page-table construction and bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PagingError {
    /// The funding frame pool could not supply a frame.
    #[error(transparent)]
    Frames(#[from] FramePoolError),

    /// No slot left for another virtual pool registration.
    #[error("every virtual pool registration slot is taken")]
    PoolTableFull,
}

/// Errors from the page-fault handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FaultError {
    /// The fault was a protection violation, not a non-present page; this
    /// handler does not service those.
    #[error("protection violation at {0}; only non-present faults are serviced")]
    ProtectionViolation(VirtAddr),

    /// Pools are registered and none of them claims the faulting address.
    #[error("fault at {0} lies outside every registered virtual pool")]
    IllegitimateAddress(VirtAddr),

    /// No frame left to back the page or its table.
    #[error(transparent)]
    Frames(#[from] FramePoolError),
}
