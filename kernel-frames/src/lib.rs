//! # Contiguous Physical Frame Pools
//!
//! Management of bands of equally sized (4 KiB) physical frames with support
//! for **contiguous** multi-frame allocation. This is the bottom layer of the
//! memory system: the page-table code and every device that needs physical
//! memory draws frames from here.
//!
//! ## State bitmap
//!
//! Each pool tracks its band with two bits per frame, four cells per byte,
//! big-endian within the byte (cell 0 occupies bits 7–6):
//!
//! | Bits | State | Meaning |
//! |------|-------|---------|
//! | `00` | FREE | Available for allocation. |
//! | `01` | HEAD | First frame of an allocated run. |
//! | `11` | ALLOCATED | Interior frame of an allocated run. |
//! | `10` | INACCESSIBLE | Reserved (kernel image, info frames); never allocated, never freed. |
//!
//! Distinguishing the head of a run from its interior is what lets
//! [`FramePools::release_frames`] recover the extent of an allocation from a
//! single frame number: free the head, then keep freeing while cells read
//! ALLOCATED.
//!
//! ## Pool registry
//!
//! Several pools coexist (typically one for DMA-safe kernel memory below
//! 16 MiB and one for process memory above it). Release requests carry only a
//! frame number, so [`FramePools`] owns every pool and routes each release to
//! the pool whose band contains the frame.
//!
//! ## Metadata placement
//!
//! A pool's bitmap lives in physical frames as well: either in the first
//! frame of the managed band itself (which is then marked as used at
//! construction), or in frames of *another* pool that the caller has reserved
//! beforehand via [`FramePools::mark_inaccessible`]. The constructor takes
//! the storage location as a raw pointer; translating the metadata frame
//! number to a usable pointer is the caller's concern (identity-mapped on the
//! machine, an arena in tests).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod bitmap;
mod pool;
mod registry;

pub use bitmap::CellState;
pub use pool::{FramePool, InfoPlacement, needed_info_frames};
pub use registry::{FramePools, PoolId};

use kernel_addresses::Frame;

/// Errors reported by frame-pool operations.
///
/// All of these are recoverable: the failed operation leaves the pool
/// unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FramePoolError {
    /// No run of the requested length exists in the pool.
    #[error("no run of {0} contiguous free frames")]
    OutOfFrames(u32),

    /// A release targeted a frame whose cell is not HEAD.
    #[error("frame {0} is not the head of an allocated sequence")]
    NotHeadOfSequence(Frame),

    /// A release targeted a frame outside every registered band.
    #[error("frame {0} is not managed by any registered pool")]
    FrameNotInAnyPool(Frame),

    /// Zero-length allocations are rejected.
    #[error("cannot allocate a run of zero frames")]
    ZeroFrames,

    /// `mark_inaccessible` targeted frames outside the pool's band.
    #[error("frames {base}..+{count} fall outside the managed band")]
    OutOfBand { base: Frame, count: u32 },

    /// `mark_inaccessible` targeted frames that are not all FREE.
    #[error("frame {0} is already in use and cannot be marked inaccessible")]
    NotFree(Frame),
}

/// Errors detected when constructing a pool. These indicate a broken boot
/// plan rather than a runtime condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolGeometryError {
    /// The band length must fill whole bitmap bytes.
    #[error("band of {0} frames is not a multiple of 4")]
    UnalignedBand(u32),

    /// In-band metadata occupies exactly one frame, which caps the band at
    /// the number of cells one frame of bitmap can describe.
    #[error("band of {0} frames does not fit an in-band single-frame bitmap")]
    BandTooLarge(u32),
}
