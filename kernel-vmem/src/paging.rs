use kernel_addresses::{Frame, PAGE_SIZE, PhysAddr, VirtAddr};
use kernel_frames::{FramePools, PoolId};
use kernel_registers::{Cr3, Mmu};
use log::{debug, error, info};

use crate::entry::PageEntry;
use crate::fault::FaultRecord;
use crate::{FaultError, PagingError, SELF_MAP_SLOT, TableView};

/// Registration capacity for virtual pools per address space.
pub const MAX_VM_POOLS: usize = 8;

/// The virtual window of a registered pool: the data the fault handler needs
/// to judge legitimacy.
///
/// Registering the window itself — rather than a reference back to the pool —
/// is what keeps the page table and the pools from owning each other: the
/// legitimacy predicate is a pure range check.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VmWindow {
    base: VirtAddr,
    size: u32,
}

impl VmWindow {
    #[must_use]
    pub const fn new(base: VirtAddr, size: u32) -> Self {
        Self { base, size }
    }

    /// `true` iff `addr` lies inside the window.
    #[must_use]
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.base && addr.as_u32() - self.base.as_u32() < self.size
    }
}

/// The process-wide paging configuration: which pool funds what, and how much
/// low memory every address space maps one-to-one.
///
/// Whether paging is enabled is read from CR0 and the loaded directory from
/// CR3; only the configuration itself lives here, threaded through calls
/// rather than sitting in globals.
pub struct PagingSystem {
    kernel_pool: PoolId,
    process_pool: PoolId,
    shared_size: u32,
}

impl PagingSystem {
    /// Capture the paging configuration. Does not enable paging.
    ///
    /// `shared_size` is the size in bytes of the identity-mapped kernel
    /// region (page-aligned, at most 4 MiB so it fits one page table).
    #[must_use]
    pub fn new(kernel_pool: PoolId, process_pool: PoolId, shared_size: u32) -> Self {
        debug_assert!(shared_size % PAGE_SIZE == 0);
        debug_assert!(shared_size / PAGE_SIZE <= crate::ENTRIES as u32);
        info!("paging system initialized, {shared_size} bytes shared");
        Self { kernel_pool, process_pool, shared_size }
    }

    /// The pool that funds page tables while paging is still off.
    #[must_use]
    pub const fn kernel_pool(&self) -> PoolId {
        self.kernel_pool
    }

    /// The pool that funds page tables and data frames once paging is on.
    #[must_use]
    pub const fn process_pool(&self) -> PoolId {
        self.process_pool
    }

    /// Size in bytes of the identity-mapped region.
    #[must_use]
    pub const fn shared_size(&self) -> u32 {
        self.shared_size
    }
}

/// Turn translation on by setting CR0.PG.
///
/// From here on, every table and data access goes through the loaded
/// directory — including the self-map windows.
///
/// # Safety
/// A directory whose identity-mapped region covers the executing code must
/// have been loaded.
pub unsafe fn enable_paging(mmu: &mut impl Mmu) {
    let cr0 = mmu.read_cr0().with_pg_paging(true);
    unsafe {
        mmu.write_cr0(cr0);
    }
    info!("paging enabled");
}

/// One address space: a page directory, its dynamically allocated page
/// tables, and the registered virtual pools used to judge fault legitimacy.
pub struct PageTable {
    directory: Frame,
    windows: [Option<VmWindow>; MAX_VM_POOLS],
    n_windows: usize,
}

impl PageTable {
    /// Build a fresh address space.
    ///
    /// Funds the directory and the shared page table from the kernel pool
    /// while CR0.PG is clear, from the process pool afterwards. The first
    /// `shared_size / 4096` pages are identity-mapped present+writable
    /// through directory slot 0; every other slot is scrubbed non-present;
    /// slot 1023 becomes the self-map.
    ///
    /// `view` must reach the two freshly allocated frames — identity access
    /// is the usual choice, since a directory under construction is not
    /// reachable through any self-map yet.
    ///
    /// # Errors
    /// Fails if the funding pool cannot supply the two frames.
    pub fn new<V: TableView>(
        system: &PagingSystem,
        pools: &mut FramePools,
        view: &V,
        mmu: &impl Mmu,
    ) -> Result<Self, PagingError> {
        let fund = if mmu.read_cr0().pg_paging() {
            system.process_pool()
        } else {
            system.kernel_pool()
        };
        let directory = pools.get_frames(fund, 1)?;
        let shared_table = pools.get_frames(fund, 1)?;

        // SAFETY: both frames were just allocated exclusively for this
        // address space and the caller guarantees the view reaches them.
        let dir = unsafe { view.directory(directory) };
        dir.fill(PageEntry::scrubbed());

        let table = unsafe { view.table(0, shared_table) };
        table.fill(PageEntry::new());
        for page in 0..(system.shared_size() / PAGE_SIZE) as usize {
            table.set(page, PageEntry::present_rw(Frame::new(page as u32)));
        }

        dir.set(0, PageEntry::present_rw(shared_table));
        dir.set(SELF_MAP_SLOT, PageEntry::present_rw(directory));

        debug!("constructed page table, directory in frame {directory}");
        Ok(Self {
            directory,
            windows: [None; MAX_VM_POOLS],
            n_windows: 0,
        })
    }

    /// The frame holding this space's page directory.
    #[must_use]
    pub const fn directory(&self) -> Frame {
        self.directory
    }

    /// Install this directory as the active address space.
    ///
    /// # Safety
    /// The directory must map the executing code (trivially true while
    /// paging is still off).
    pub unsafe fn load(&self, mmu: &mut impl Mmu) {
        unsafe {
            mmu.write_cr3(Cr3::from_directory(self.directory));
        }
        debug!("loaded page table, directory in frame {}", self.directory);
    }

    /// Record a virtual pool's window for fault legitimacy checks.
    ///
    /// # Errors
    /// Fails when all [`MAX_VM_POOLS`] slots are taken.
    pub fn register_pool(&mut self, window: VmWindow) -> Result<(), PagingError> {
        if self.n_windows == MAX_VM_POOLS {
            error!("cannot register virtual pool: table full");
            return Err(PagingError::PoolTableFull);
        }
        self.windows[self.n_windows] = Some(window);
        self.n_windows += 1;
        debug!("registered virtual pool window #{}", self.n_windows - 1);
        Ok(())
    }

    /// `true` iff no pool is registered or some registered window contains
    /// `addr`.
    fn is_legitimate(&self, addr: VirtAddr) -> bool {
        self.n_windows == 0
            || self.windows[..self.n_windows]
                .iter()
                .flatten()
                .any(|w| w.contains(addr))
    }

    /// Service a page fault by backing the touched page with a frame.
    ///
    /// Only non-present faults are handled. The faulting address comes from
    /// CR2; once registered pools exist, it must lie inside one of their
    /// windows — an address outside every window is rejected, not serviced.
    ///
    /// If the covering page table already exists, only a data frame is
    /// allocated. Otherwise a table frame is allocated first, its PDE
    /// installed present+writable and all of its entries filled with the
    /// non-present fresh value before the data frame goes in.
    ///
    /// The handler runs between yield points and must not fault itself: it
    /// touches only the directory and tables (reachable through `view`) and
    /// the pool bitmaps.
    ///
    /// # Errors
    /// - [`FaultError::ProtectionViolation`] for present-page faults.
    /// - [`FaultError::IllegitimateAddress`] for faults outside every
    ///   registered window.
    /// - [`FaultError::Frames`] when the process pool is exhausted.
    pub fn handle_fault<V: TableView>(
        &mut self,
        system: &PagingSystem,
        pools: &mut FramePools,
        view: &V,
        mmu: &impl Mmu,
        record: &FaultRecord,
    ) -> Result<(), FaultError> {
        let addr = mmu.read_cr2();
        debug_assert_eq!(
            mmu.read_cr3().directory(),
            self.directory,
            "fault delivered to a page table that is not loaded"
        );

        if record.error_code.present() {
            error!("page fault at {addr}: {}", record.error_code.explain());
            return Err(FaultError::ProtectionViolation(addr));
        }
        if !self.is_legitimate(addr) {
            error!("page fault at {addr} outside every registered pool");
            return Err(FaultError::IllegitimateAddress(addr));
        }

        let pd_slot = addr.directory_index();
        let pt_slot = addr.table_index();

        // SAFETY: the directory frame belongs to this address space; the
        // caller guarantees the view reaches the live paging structures.
        let dir = unsafe { view.directory(self.directory) };
        let pde = dir.get(pd_slot);
        let table = if pde.present() {
            // SAFETY: the PDE names the table serving this slot.
            unsafe { view.table(pd_slot, pde.frame()) }
        } else {
            let table_frame = pools.get_frames(system.process_pool(), 1)?;
            dir.set(pd_slot, PageEntry::present_rw(table_frame));
            // SAFETY: freshly allocated, now linked into this slot.
            let table = unsafe { view.table(pd_slot, table_frame) };
            table.fill(PageEntry::fresh());
            table
        };

        let data_frame = pools.get_frames(system.process_pool(), 1)?;
        table.set(pt_slot, PageEntry::present_rw(data_frame));

        debug!("handled page fault at {addr}: frame {data_frame} installed");
        Ok(())
    }

    /// Unmap the page containing `page` and return its frame to the owning
    /// pool.
    ///
    /// A page that was never touched has no frame; that case is a quiet
    /// no-op (`Ok(false)`). Otherwise the frame is released through the
    /// registry, the PTE scrubbed to the non-present value, and the
    /// directory reloaded to flush the stale translation. The page table
    /// itself stays allocated even if this emptied it; reclaiming empty
    /// tables is left to a future sweep.
    ///
    /// # Errors
    /// Propagates registry errors for the released frame.
    pub fn free_page<V: TableView>(
        &mut self,
        pools: &mut FramePools,
        view: &V,
        mmu: &mut impl Mmu,
        page: VirtAddr,
    ) -> Result<bool, PagingError> {
        let pd_slot = page.directory_index();
        let pt_slot = page.table_index();

        // SAFETY: as in `handle_fault`.
        let dir = unsafe { view.directory(self.directory) };
        let pde = dir.get(pd_slot);
        if !pde.present() {
            return Ok(false);
        }
        // SAFETY: the PDE names the table serving this slot.
        let table = unsafe { view.table(pd_slot, pde.frame()) };
        let pte = table.get(pt_slot);
        if !pte.present() {
            return Ok(false);
        }

        pools.release_frames(pte.frame())?;
        table.set(pt_slot, PageEntry::scrubbed());

        // Reload the directory; the CR3 write flushes the TLB.
        let cr3 = mmu.read_cr3();
        // SAFETY: reloading the already-active directory.
        unsafe {
            mmu.write_cr3(cr3);
        }

        debug!("freed page at {page}");
        Ok(true)
    }

    /// Software page walk: the physical address `va` maps to, if any.
    ///
    /// Used by hosted tests and the simulated machine; it is also the
    /// ground truth for the self-map contract, since the windows are plain
    /// virtual addresses like any other.
    #[must_use]
    pub fn translate<V: TableView>(&self, view: &V, va: VirtAddr) -> Option<PhysAddr> {
        // SAFETY: read-only traversal of this space's structures.
        let dir = unsafe { view.directory(self.directory) };
        let pde = dir.get(va.directory_index());
        if !pde.present() {
            return None;
        }
        // SAFETY: the PDE names the table serving this slot.
        let table = unsafe { view.table(va.directory_index(), pde.frame()) };
        let pte = table.get(va.table_index());
        if !pte.present() {
            return None;
        }
        Some(pte.frame().base() + va.page_offset())
    }
}
