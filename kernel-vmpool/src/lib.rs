//! # Virtual-Memory Pools
//!
//! A per-address-space allocator that carves one contiguous virtual window
//! into byte-sized regions. Allocation hands out *addresses only*; no frame
//! is touched until the owner actually accesses the region, at which point
//! the page-fault handler backs the touched page on demand.
//!
//! ## The descriptor page bootstraps itself
//!
//! The pool keeps its region descriptors in the **first page of its own
//! window**. That page is as demand-paged as everything else: the very first
//! descriptor store faults, and the fault is legitimate precisely because the
//! pool registered its window with the page table at construction. Region 0
//! therefore starts one page into the window, and the pool's first
//! allocation returns `base + 4096`.
//!
//! ## Region layout
//!
//! Descriptors are kept in insertion order with no free list and no
//! coalescing: each new region starts where the previous one ends. Releasing
//! a region frees its pages and closes the descriptor gap by shifting the
//! tail left.
//!
//! ## The [`RegionMemory`] / [`VmContext`] seam
//!
//! The pool never dereferences its window directly; descriptor loads and
//! stores go through [`RegionMemory`], and releasing pages through
//! [`VmContext`]. On the machine both are provided by [`ActiveSpace`], which
//! wraps the loaded page table and dereferences descriptor slots raw — the
//! MMU does the demand paging. Hosted tests substitute a software machine
//! that walks the simulated page table and services misses through the real
//! fault handler, with observable fault counts.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

use kernel_addresses::{PAGE_SIZE, VirtAddr, align_up};
use kernel_frames::FramePools;
use kernel_registers::Mmu;
use kernel_vmem::{PageTable, PagingError, TableView, VmWindow};
use log::{debug, error};

/// One allocated region: the raw `(base, size)` pair as it sits in the
/// descriptor page.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Region {
    pub base: u32,
    pub size: u32,
}

impl Region {
    /// One past the last address of the region.
    #[must_use]
    pub const fn end(&self) -> u32 {
        self.base + self.size
    }
}

/// Descriptor capacity of the metadata page.
pub const MAX_REGIONS: u32 = PAGE_SIZE / size_of::<Region>() as u32;

/// Access to the pool's descriptor page through its virtual addresses.
///
/// `slot` is always `base + k * size_of::<Region>()` for some
/// `k < MAX_REGIONS`; the first access to the page is expected to miss and
/// be serviced by demand paging.
pub trait RegionMemory {
    fn load(&mut self, slot: VirtAddr) -> Region;
    fn store(&mut self, slot: VirtAddr, region: Region);
}

/// What releasing a region needs from the address space, on top of
/// descriptor access.
pub trait VmContext: RegionMemory {
    /// Unmap one page, returning its frame to the owning pool. A page that
    /// was never touched has no frame and unmaps to nothing; failures are
    /// logged, not propagated — the release keeps going.
    fn free_page(&mut self, page: VirtAddr);

    /// Reload the directory so stale translations are flushed.
    fn reload_directory(&mut self);
}

/// The loaded address space, as a [`VmContext`].
///
/// Descriptor slots are plain pointer accesses — the MMU demand-pages the
/// metadata frame on first touch, exactly like any other pool memory.
pub struct ActiveSpace<'a, V: TableView, X: Mmu> {
    page_table: &'a mut PageTable,
    pools: &'a mut FramePools,
    view: &'a V,
    mmu: &'a mut X,
}

impl<'a, V: TableView, X: Mmu> ActiveSpace<'a, V, X> {
    /// # Safety
    /// `page_table` must be the currently loaded address space with paging
    /// enabled, and `view` must reach its live structures: descriptor
    /// accesses dereference pool virtual addresses directly and rely on the
    /// fault handler backing them.
    pub unsafe fn new(
        page_table: &'a mut PageTable,
        pools: &'a mut FramePools,
        view: &'a V,
        mmu: &'a mut X,
    ) -> Self {
        Self { page_table, pools, view, mmu }
    }
}

impl<V: TableView, X: Mmu> RegionMemory for ActiveSpace<'_, V, X> {
    fn load(&mut self, slot: VirtAddr) -> Region {
        // SAFETY: `new` requires this space to be loaded; the access faults
        // into the demand pager at most once.
        unsafe { core::ptr::read_volatile(slot.as_u32() as usize as *const Region) }
    }

    fn store(&mut self, slot: VirtAddr, region: Region) {
        // SAFETY: as in `load`.
        unsafe {
            core::ptr::write_volatile(slot.as_u32() as usize as *mut Region, region);
        }
    }
}

impl<V: TableView, X: Mmu> VmContext for ActiveSpace<'_, V, X> {
    fn free_page(&mut self, page: VirtAddr) {
        if let Err(e) = self.page_table.free_page(self.pools, self.view, self.mmu, page) {
            error!("failed to free page at {page}: {e}");
        }
    }

    fn reload_directory(&mut self) {
        // SAFETY: reloading the already-active directory.
        unsafe {
            self.page_table.load(self.mmu);
        }
    }
}

/// A pool of virtual memory carved from `[base, base + size)`.
pub struct VmPool {
    base: VirtAddr,
    size: u32,
    region_no: u32,
}

impl VmPool {
    /// Create a pool over `[base, base + size)` and register its window with
    /// `page_table` so that faults inside it are legitimate.
    ///
    /// `base` must be page-aligned and the window at least two pages (one
    /// for the descriptors, one to hand out).
    ///
    /// # Errors
    /// Fails if the page table has no registration slot left.
    pub fn new(base: VirtAddr, size: u32, page_table: &mut PageTable) -> Result<Self, PagingError> {
        debug_assert!(base.page_offset() == 0);
        debug_assert!(size >= 2 * PAGE_SIZE);
        page_table.register_pool(VmWindow::new(base, size))?;
        debug!("virtual pool constructed at {base}, {size} bytes");
        Ok(Self { base, size, region_no: 0 })
    }

    /// Base of the pool's window.
    #[must_use]
    pub const fn base_address(&self) -> VirtAddr {
        self.base
    }

    /// Number of live regions.
    #[must_use]
    pub const fn region_count(&self) -> u32 {
        self.region_no
    }

    /// Virtual address of descriptor slot `k` in the metadata page.
    fn slot(&self, k: u32) -> VirtAddr {
        self.base + k * size_of::<Region>() as u32
    }

    /// Reserve `bytes` of virtual memory and return the region's base.
    ///
    /// Sizes round up to whole pages. The first allocation claims page 0 for
    /// the descriptors and returns `base + 4096`; every later region starts
    /// where the previous one ends. No backing frame is allocated here —
    /// first touch does that.
    ///
    /// Returns `None` for zero bytes and for requests that would run past
    /// the end of the window.
    ///
    /// # Panics
    /// When the descriptor page is full (`MAX_REGIONS` live regions); a pool
    /// with 512 outstanding regions is a kernel bug, not a runtime
    /// condition.
    pub fn allocate(&mut self, mem: &mut impl RegionMemory, bytes: u32) -> Option<VirtAddr> {
        if bytes == 0 {
            return None;
        }
        assert!(self.region_no < MAX_REGIONS, "virtual pool region table full");

        let rounded = align_up(bytes, PAGE_SIZE);
        let base = if self.region_no == 0 {
            // Page 0 holds the descriptors.
            self.base + PAGE_SIZE
        } else {
            let prev = mem.load(self.slot(self.region_no - 1));
            VirtAddr::new(prev.end())
        };

        if base.as_u32() - self.base.as_u32() + rounded > self.size {
            error!("virtual pool at {}: no room for {bytes} more bytes", self.base);
            return None;
        }

        mem.store(self.slot(self.region_no), Region { base: base.as_u32(), size: rounded });
        self.region_no += 1;

        debug!("allocated {rounded} bytes of virtual memory at {base}");
        Some(base)
    }

    /// Release the region starting at `start`.
    ///
    /// Every page of the region is unmapped through
    /// [`VmContext::free_page`], which returns touched frames to their pool;
    /// pages that were never touched have no frame and unmap to nothing.
    /// The descriptor tail shifts left to close the gap, and the directory
    /// is reloaded to drop stale translations.
    ///
    /// # Panics
    /// When `start` matches no live region; releasing an address the pool
    /// never handed out is a kernel bug.
    pub fn release(&mut self, ctx: &mut impl VmContext, start: VirtAddr) {
        let found = (0..self.region_no).find(|&k| ctx.load(self.slot(k)).base == start.as_u32());
        let Some(index) = found else {
            panic!("virtual pool at {}: no region starts at {start}", self.base);
        };

        let region = ctx.load(self.slot(index));
        for page in 0..region.size / PAGE_SIZE {
            ctx.free_page(VirtAddr::new(region.base + page * PAGE_SIZE));
        }

        for k in index..self.region_no - 1 {
            let next = ctx.load(self.slot(k + 1));
            ctx.store(self.slot(k), next);
        }
        self.region_no -= 1;

        ctx.reload_directory();

        debug!("released region at {start} ({} bytes)", region.size);
    }

    /// `true` iff `addr` lies inside this pool's window.
    ///
    /// This is the legitimacy predicate the fault handler applies (through
    /// the registered window) before servicing a fault.
    #[must_use]
    pub fn is_legitimate(&self, addr: VirtAddr) -> bool {
        addr >= self.base && addr.as_u32() - self.base.as_u32() < self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Descriptor storage over a hash map, with no paging behind it: enough
    /// to exercise the region arithmetic. The demand-paged path runs in the
    /// integration tests.
    #[derive(Default)]
    struct FlatMemory {
        slots: std::collections::HashMap<u32, Region>,
        freed_pages: Vec<VirtAddr>,
        reloads: u32,
    }

    impl RegionMemory for FlatMemory {
        fn load(&mut self, slot: VirtAddr) -> Region {
            self.slots[&slot.as_u32()]
        }

        fn store(&mut self, slot: VirtAddr, region: Region) {
            self.slots.insert(slot.as_u32(), region);
        }
    }

    impl VmContext for FlatMemory {
        fn free_page(&mut self, page: VirtAddr) {
            self.freed_pages.push(page);
        }

        fn reload_directory(&mut self) {
            self.reloads += 1;
        }
    }

    const BASE: VirtAddr = VirtAddr::new(0x4000_0000);

    fn pool_of(size: u32) -> (VmPool, FlatMemory) {
        let mut rig = paging_rig::Rig::new();
        let mut pt = rig.page_table();
        let pool = VmPool::new(BASE, size, &mut pt).unwrap();
        (pool, FlatMemory::default())
    }

    #[test]
    fn zero_byte_requests_allocate_nothing() {
        let (mut pool, mut mem) = pool_of(16 * PAGE_SIZE);
        assert_eq!(pool.allocate(&mut mem, 0), None);
        assert_eq!(pool.region_count(), 0);
    }

    #[test]
    fn first_allocation_skips_the_descriptor_page() {
        let (mut pool, mut mem) = pool_of(16 * PAGE_SIZE);
        assert_eq!(pool.allocate(&mut mem, PAGE_SIZE), Some(BASE + PAGE_SIZE));
        assert_eq!(
            mem.load(pool.slot(0)),
            Region { base: BASE.as_u32() + PAGE_SIZE, size: PAGE_SIZE }
        );
    }

    #[test]
    fn regions_are_adjacent_and_page_rounded() {
        let (mut pool, mut mem) = pool_of(64 * PAGE_SIZE);
        let a = pool.allocate(&mut mem, 100).unwrap();
        let b = pool.allocate(&mut mem, PAGE_SIZE + 1).unwrap();
        let c = pool.allocate(&mut mem, 3 * PAGE_SIZE).unwrap();

        assert_eq!(a, BASE + PAGE_SIZE);
        assert_eq!(b, a + PAGE_SIZE); // 100 bytes rounded to one page
        assert_eq!(c, b + 2 * PAGE_SIZE); // PAGE_SIZE + 1 rounded to two

        // Region ends stay inside the window.
        let last = mem.load(pool.slot(2));
        assert!(last.end() <= BASE.as_u32() + 64 * PAGE_SIZE);
    }

    #[test]
    fn allocation_stops_at_the_window_end() {
        let (mut pool, mut mem) = pool_of(4 * PAGE_SIZE);
        // One page goes to descriptors, three remain.
        assert!(pool.allocate(&mut mem, 2 * PAGE_SIZE).is_some());
        assert_eq!(pool.allocate(&mut mem, 2 * PAGE_SIZE), None);
        assert!(pool.allocate(&mut mem, PAGE_SIZE).is_some());
        assert_eq!(pool.region_count(), 2);
    }

    #[test]
    fn release_frees_every_page_and_shifts_the_tail() {
        let (mut pool, mut mem) = pool_of(64 * PAGE_SIZE);
        let a = pool.allocate(&mut mem, 2 * PAGE_SIZE).unwrap();
        let b = pool.allocate(&mut mem, PAGE_SIZE).unwrap();
        let c = pool.allocate(&mut mem, PAGE_SIZE).unwrap();

        pool.release(&mut mem, a);

        assert_eq!(mem.freed_pages, vec![a, a + PAGE_SIZE]);
        assert_eq!(mem.reloads, 1);
        assert_eq!(pool.region_count(), 2);

        // The survivors moved down one slot, order preserved.
        assert_eq!(mem.load(pool.slot(0)).base, b.as_u32());
        assert_eq!(mem.load(pool.slot(1)).base, c.as_u32());

        // The next allocation continues after the last survivor.
        assert_eq!(pool.allocate(&mut mem, PAGE_SIZE), Some(c + PAGE_SIZE));
    }

    #[test]
    #[should_panic(expected = "no region starts at")]
    fn releasing_an_unknown_address_is_fatal() {
        let (mut pool, mut mem) = pool_of(16 * PAGE_SIZE);
        pool.allocate(&mut mem, PAGE_SIZE).unwrap();
        pool.release(&mut mem, BASE + 2 * PAGE_SIZE);
    }

    #[test]
    fn legitimacy_is_the_window_range() {
        let (pool, _) = pool_of(16 * PAGE_SIZE);
        assert!(pool.is_legitimate(BASE));
        assert!(pool.is_legitimate(BASE + 16 * PAGE_SIZE - 1));
        assert!(!pool.is_legitimate(BASE + 16 * PAGE_SIZE));
        assert!(!pool.is_legitimate(VirtAddr::new(BASE.as_u32() - 1)));
    }

    /// Minimal paging environment for the window registration above; the
    /// full machine lives in `tests/demand_paging.rs`.
    mod paging_rig {
        use core::ptr::NonNull;
        use kernel_addresses::Frame;
        use kernel_frames::{FramePools, InfoPlacement};
        use kernel_registers::{Cr0, Cr3, Mmu};
        use kernel_vmem::{PageDirectory, PageTable, PageTableFrame, PagingSystem, TableView};

        #[repr(C, align(4096))]
        struct RawFrame([u8; 4096]);

        pub(super) struct Rig {
            frames: Vec<RawFrame>,
            pools: FramePools,
            system: PagingSystem,
            mmu: SimMmu,
            _bitmap: Box<[u8]>,
        }

        struct SimMmu {
            cr0: Cr0,
            cr2: kernel_addresses::VirtAddr,
            cr3: Cr3,
        }

        impl Default for SimMmu {
            fn default() -> Self {
                Self { cr0: Cr0::new(), cr2: kernel_addresses::VirtAddr::new(0), cr3: Cr3::new() }
            }
        }

        impl Mmu for SimMmu {
            fn read_cr0(&self) -> Cr0 {
                self.cr0
            }
            unsafe fn write_cr0(&mut self, cr0: Cr0) {
                self.cr0 = cr0;
            }
            fn read_cr2(&self) -> kernel_addresses::VirtAddr {
                self.cr2
            }
            fn read_cr3(&self) -> Cr3 {
                self.cr3
            }
            unsafe fn write_cr3(&mut self, cr3: Cr3) {
                self.cr3 = cr3;
            }
        }

        struct View<'p>(&'p [RawFrame]);

        impl TableView for View<'_> {
            #[allow(invalid_reference_casting)]
            unsafe fn directory<'a>(&self, directory: Frame) -> &'a mut PageDirectory {
                let p = &self.0[directory.number() as usize] as *const RawFrame as *mut PageDirectory;
                unsafe { &mut *p }
            }
            #[allow(invalid_reference_casting)]
            unsafe fn table<'a>(&self, _slot: usize, table: Frame) -> &'a mut PageTableFrame {
                let p = &self.0[table.number() as usize] as *const RawFrame as *mut PageTableFrame;
                unsafe { &mut *p }
            }
        }

        impl Rig {
            pub(super) fn new() -> Self {
                let mut frames = Vec::new();
                for _ in 0..8 {
                    frames.push(RawFrame([0; 4096]));
                }
                let mut bitmap = vec![0u8; 2].into_boxed_slice();
                let mut pools = FramePools::new();
                let info = InfoPlacement::External { info_frame: Frame::new(0), n_info_frames: 1 };
                let id = unsafe {
                    pools.create(Frame::new(0), 8, info, NonNull::new(bitmap.as_mut_ptr()).unwrap())
                }
                .unwrap();
                let system = PagingSystem::new(id, id, 4096);
                Rig { frames, pools, system, mmu: SimMmu::default(), _bitmap: bitmap }
            }

            pub(super) fn page_table(&mut self) -> PageTable {
                let view = View(&self.frames);
                PageTable::new(&self.system, &mut self.pools, &view, &self.mmu).unwrap()
            }
        }
    }
}
