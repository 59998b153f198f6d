use alloc::vec::Vec;
use core::ptr::NonNull;

use kernel_addresses::Frame;
use log::error;

use crate::pool::{FramePool, InfoPlacement};
use crate::{FramePoolError, PoolGeometryError};

/// Stable handle to a pool registered in [`FramePools`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PoolId(usize);

/// The process-wide collection of frame pools.
///
/// Pools are created through the registry and owned by it; allocation goes to
/// a pool by [`PoolId`], while releases are routed to the owning pool by
/// frame-number range. Pool creation happens during bootstrap, before any
/// concurrency, so the registry itself needs no locking.
#[derive(Default)]
pub struct FramePools {
    pools: Vec<FramePool>,
}

impl FramePools {
    #[must_use]
    pub const fn new() -> Self {
        Self { pools: Vec::new() }
    }

    /// Construct a pool over `[base, base + n_frames)` and register it.
    ///
    /// The band must fill whole bitmap bytes, and an in-band bitmap must fit
    /// its single frame. With [`InfoPlacement::External`] the caller must
    /// already have reserved the info frames in their owning pool via
    /// [`Self::mark_inaccessible`].
    ///
    /// # Errors
    /// Propagates [`PoolGeometryError`] from construction.
    ///
    /// # Safety
    /// `storage` must point to the memory of the metadata frame(s): at least
    /// `n_frames / 4` writable bytes, valid and exclusive to the new pool for
    /// the registry's lifetime.
    pub unsafe fn create(
        &mut self,
        base: Frame,
        n_frames: u32,
        info: InfoPlacement,
        storage: NonNull<u8>,
    ) -> Result<PoolId, PoolGeometryError> {
        let pool = unsafe { FramePool::new(base, n_frames, info, storage)? };
        self.pools.push(pool);
        Ok(PoolId(self.pools.len() - 1))
    }

    /// Borrow a registered pool.
    #[must_use]
    pub fn pool(&self, id: PoolId) -> &FramePool {
        &self.pools[id.0]
    }

    /// Allocate `n` contiguous frames from the pool `id`.
    ///
    /// # Errors
    /// See [`FramePool::get_frames`].
    pub fn get_frames(&mut self, id: PoolId, n: u32) -> Result<Frame, FramePoolError> {
        self.pools[id.0].get_frames(n)
    }

    /// Reserve `[base, base + n)` in the pool `id` as permanently
    /// inaccessible.
    ///
    /// # Errors
    /// See [`FramePool::mark_inaccessible`].
    pub fn mark_inaccessible(
        &mut self,
        id: PoolId,
        base: Frame,
        n: u32,
    ) -> Result<(), FramePoolError> {
        self.pools[id.0].mark_inaccessible(base, n)
    }

    /// Release the allocated run headed by `head`, whichever pool owns it.
    ///
    /// Returns the number of frames freed.
    ///
    /// # Errors
    /// - [`FramePoolError::FrameNotInAnyPool`] if no registered band contains
    ///   `head`.
    /// - [`FramePoolError::NotHeadOfSequence`] if the owning pool's cell for
    ///   `head` is not HEAD; nothing is mutated.
    pub fn release_frames(&mut self, head: Frame) -> Result<u32, FramePoolError> {
        let Some(pool) = self.pools.iter_mut().find(|p| p.contains(head)) else {
            error!("release of frame {head}: not in any registered pool");
            return Err(FramePoolError::FrameNotInAnyPool(head));
        };
        pool.release_run(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CellState;

    struct Storage(Vec<Box<[u8]>>);

    impl Storage {
        fn new() -> Self {
            Self(Vec::new())
        }

        fn for_frames(&mut self, n_frames: u32) -> NonNull<u8> {
            self.0.push(vec![0u8; n_frames.div_ceil(4) as usize].into_boxed_slice());
            NonNull::new(self.0.last_mut().unwrap().as_mut_ptr()).unwrap()
        }
    }

    fn two_pools(storage: &mut Storage) -> (FramePools, PoolId, PoolId) {
        let mut pools = FramePools::new();
        let info = InfoPlacement::External { info_frame: Frame::new(1), n_info_frames: 1 };
        let low = storage.for_frames(16);
        let high = storage.for_frames(32);
        let low = unsafe { pools.create(Frame::new(0), 16, info, low) }.unwrap();
        let high = unsafe { pools.create(Frame::new(1024), 32, info, high) }.unwrap();
        (pools, low, high)
    }

    #[test]
    fn release_routes_to_the_owning_pool() {
        let mut storage = Storage::new();
        let (mut pools, low, high) = two_pools(&mut storage);

        let a = pools.get_frames(low, 2).unwrap();
        let b = pools.get_frames(high, 2).unwrap();
        assert_eq!(a, Frame::new(0));
        assert_eq!(b, Frame::new(1024));

        assert_eq!(pools.release_frames(b).unwrap(), 2);

        // Only the high pool changed.
        assert_eq!(pools.pool(high).n_free_frames(), 32);
        assert_eq!(pools.pool(low).n_free_frames(), 14);
        assert_eq!(pools.pool(low).cell_state(a), Some(CellState::Head));
    }

    #[test]
    fn release_outside_every_band_fails() {
        let mut storage = Storage::new();
        let (mut pools, _, _) = two_pools(&mut storage);
        assert_eq!(
            pools.release_frames(Frame::new(500)),
            Err(FramePoolError::FrameNotInAnyPool(Frame::new(500)))
        );
    }

    #[test]
    fn frames_between_bands_belong_to_nobody() {
        let mut storage = Storage::new();
        let (pools, low, high) = two_pools(&mut storage);
        assert!(pools.pool(low).contains(Frame::new(15)));
        assert!(!pools.pool(low).contains(Frame::new(16)));
        assert!(pools.pool(high).contains(Frame::new(1055)));
        assert!(!pools.pool(high).contains(Frame::new(1056)));
    }
}
