use core::ptr::NonNull;

use kernel_addresses::{Frame, PAGE_SIZE};
use log::{debug, error};

use crate::bitmap::{Bitmap, CellState};
use crate::{FramePoolError, PoolGeometryError};

/// Where a pool keeps its bitmap.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InfoPlacement {
    /// In the first frame of the managed band itself. The frame is marked as
    /// used (HEAD) at construction so it is never handed out.
    InBand,
    /// In `n_info_frames` frames starting at `info_frame`, which belong to
    /// another pool and were reserved there beforehand.
    External { info_frame: Frame, n_info_frames: u32 },
}

/// Number of bitmap frames needed to manage a band of `n_frames`.
///
/// One frame of bitmap holds `4096 * 4` cells at two bits each.
#[must_use]
pub const fn needed_info_frames(n_frames: u32) -> u32 {
    n_frames.div_ceil(PAGE_SIZE * Bitmap::CELLS_PER_BYTE)
}

/// One contiguous band of physical frames and its allocation state.
///
/// Constructed through [`FramePools::create`](crate::FramePools::create),
/// which also enters the pool into the process-wide registry.
pub struct FramePool {
    base: Frame,
    n_frames: u32,
    n_free: u32,
    info: InfoPlacement,
    bitmap: Bitmap,
}

impl FramePool {
    /// Establish a pool over `[base, base + n_frames)` with its bitmap in
    /// `storage`.
    ///
    /// Every cell starts FREE; with [`InfoPlacement::InBand`] the first cell
    /// is then marked HEAD since the bitmap itself occupies that frame.
    ///
    /// # Errors
    /// - [`PoolGeometryError::UnalignedBand`] if `n_frames` is not a multiple
    ///   of 4 (the band must fill whole bitmap bytes).
    /// - [`PoolGeometryError::BandTooLarge`] if in-band metadata cannot
    ///   describe the band within its single frame.
    ///
    /// # Safety
    /// `storage` must point to the memory of the metadata frame(s): at least
    /// `n_frames / 4` writable bytes, valid and exclusive to this pool for
    /// its whole lifetime.
    pub(crate) unsafe fn new(
        base: Frame,
        n_frames: u32,
        info: InfoPlacement,
        storage: NonNull<u8>,
    ) -> Result<Self, PoolGeometryError> {
        if n_frames % Bitmap::CELLS_PER_BYTE != 0 {
            return Err(PoolGeometryError::UnalignedBand(n_frames));
        }
        if matches!(info, InfoPlacement::InBand)
            && n_frames > PAGE_SIZE * Bitmap::CELLS_PER_BYTE
        {
            return Err(PoolGeometryError::BandTooLarge(n_frames));
        }

        let mut bitmap = unsafe { Bitmap::new_zeroed(storage, n_frames) };
        let mut n_free = n_frames;
        if matches!(info, InfoPlacement::InBand) {
            bitmap.set(0, CellState::Head);
            n_free -= 1;
        }

        debug!("frame pool initialized: base={base}, {n_frames} frames, {n_free} free");
        Ok(Self { base, n_frames, n_free, info, bitmap })
    }

    /// First frame of the managed band.
    #[must_use]
    pub const fn base(&self) -> Frame {
        self.base
    }

    /// Length of the managed band.
    #[must_use]
    pub const fn n_frames(&self) -> u32 {
        self.n_frames
    }

    /// Count of FREE cells.
    #[must_use]
    pub const fn n_free_frames(&self) -> u32 {
        self.n_free
    }

    /// Where this pool keeps its bitmap.
    #[must_use]
    pub const fn info_placement(&self) -> InfoPlacement {
        self.info
    }

    /// `true` iff `frame` lies within the managed band.
    #[must_use]
    pub fn contains(&self, frame: Frame) -> bool {
        self.base <= frame && frame.number() < self.base.number() + self.n_frames
    }

    /// The recorded state of `frame`, or `None` outside the band.
    ///
    /// Exposed for diagnostics and property checks; allocation state should
    /// normally be observed through the operations themselves.
    #[must_use]
    pub fn cell_state(&self, frame: Frame) -> Option<CellState> {
        self.contains(frame)
            .then(|| self.bitmap.get(frame.number() - self.base.number()))
    }

    /// Allocate a run of `n` contiguous frames and return its head.
    ///
    /// Scans cells in ascending order for the first run of at least `n` FREE
    /// cells; any obstacle restarts the run at the next cell. On success the
    /// first cell becomes HEAD and the rest ALLOCATED. Failure leaves the
    /// pool untouched.
    ///
    /// # Errors
    /// - [`FramePoolError::ZeroFrames`] for `n == 0`.
    /// - [`FramePoolError::OutOfFrames`] when no run is long enough.
    pub fn get_frames(&mut self, n: u32) -> Result<Frame, FramePoolError> {
        if n == 0 {
            return Err(FramePoolError::ZeroFrames);
        }

        let mut run_start = 0;
        let mut run_len = 0;
        for cell in 0..self.n_frames {
            if self.bitmap.get(cell) == CellState::Free {
                if run_len == 0 {
                    run_start = cell;
                }
                run_len += 1;
                if run_len == n {
                    break;
                }
            } else {
                run_len = 0;
            }
        }
        if run_len < n {
            error!("frame pool at {}: no free run of {n} frames", self.base);
            return Err(FramePoolError::OutOfFrames(n));
        }

        self.bitmap.set(run_start, CellState::Head);
        for cell in run_start + 1..run_start + n {
            self.bitmap.set(cell, CellState::Allocated);
        }
        self.n_free -= n;

        Ok(self.base + run_start)
    }

    /// Reserve `[base, base + n)` as permanently inaccessible.
    ///
    /// The first cell becomes HEAD and the remaining `n - 1` INACCESSIBLE;
    /// no searching is involved. Used by the bootstrapper to carve out the
    /// kernel image and externally placed info frames before any allocation.
    ///
    /// The targeted cells must all be FREE; marking anything else would
    /// corrupt the free-frame count, so the call fails without mutation
    /// instead.
    ///
    /// # Errors
    /// - [`FramePoolError::ZeroFrames`] for `n == 0`.
    /// - [`FramePoolError::OutOfBand`] if the range leaves the band.
    /// - [`FramePoolError::NotFree`] if any targeted cell is already in use.
    pub fn mark_inaccessible(&mut self, base: Frame, n: u32) -> Result<(), FramePoolError> {
        if n == 0 {
            return Err(FramePoolError::ZeroFrames);
        }
        if !self.contains(base) || base.number() + n > self.base.number() + self.n_frames {
            return Err(FramePoolError::OutOfBand { base, count: n });
        }

        let first = base.number() - self.base.number();
        for cell in first..first + n {
            if self.bitmap.get(cell) != CellState::Free {
                error!("frame pool at {}: frame {} not free, refusing to reserve", self.base, self.base + cell);
                return Err(FramePoolError::NotFree(self.base + cell));
            }
        }

        self.bitmap.set(first, CellState::Head);
        for cell in first + 1..first + n {
            self.bitmap.set(cell, CellState::Inaccessible);
        }
        self.n_free -= n;

        debug!("frame pool at {}: reserved {n} frames starting at {base}", self.base);
        Ok(())
    }

    /// Release the run headed by `head`, returning how many frames were
    /// freed.
    ///
    /// The head cell is freed first, then the walk continues while cells
    /// read ALLOCATED, stopping at FREE, HEAD, INACCESSIBLE, or the end of
    /// the band. A non-HEAD target aborts without mutation.
    pub(crate) fn release_run(&mut self, head: Frame) -> Result<u32, FramePoolError> {
        let first = head.number() - self.base.number();
        if self.bitmap.get(first) != CellState::Head {
            error!("frame pool at {}: frame {head} is not head of a sequence", self.base);
            return Err(FramePoolError::NotHeadOfSequence(head));
        }

        self.bitmap.set(first, CellState::Free);
        let mut freed = 1;
        for cell in first + 1..self.n_frames {
            if self.bitmap.get(cell) != CellState::Allocated {
                break;
            }
            self.bitmap.set(cell, CellState::Free);
            freed += 1;
        }
        self.n_free += freed;

        debug!("frame pool at {}: released {freed} frames starting at {head}", self.base);
        Ok(freed)
    }
}
