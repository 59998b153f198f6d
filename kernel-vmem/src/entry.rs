use bitfield_struct::bitfield;
use kernel_addresses::Frame;

/// A single 32-bit paging entry in its raw bitfield form.
///
/// In two-level 32-bit paging, PDEs and PTEs share one layout: permission
/// bits in the low word, the backing frame number in bits 31–12. The type
/// models the common superset; `large_page` is only meaningful in a PDE (and
/// this kernel never sets it), `dirty` only in a leaf PTE.
///
/// ### Bit layout
///
/// | Bits  | Name | Meaning |
/// |-------|------|---------|
/// | 0     | `P`  | Entry is valid; clear raises a non-present fault on access |
/// | 1     | `RW` | Writable if set |
/// | 2     | `US` | User-mode accessible if set |
/// | 3     | `PWT`| Write-through caching |
/// | 4     | `PCD`| Disable caching |
/// | 5     | `A`  | Accessed (set by the CPU) |
/// | 6     | `D`  | Dirty (leaf only, set by the CPU) |
/// | 7     | `PS` | 4 MiB page flag (PDE only; unused here) |
/// | 8     | `G`  | Global translation (leaf only) |
/// | 9–11  | OS   | Available to the OS |
/// | 12–31 |`addr`| Physical frame number |
///
/// ### Canonical values
///
/// Three raw encodings recur throughout the kernel and have named
/// constructors: `frame | 3` (present + writable) for every installed
/// mapping, `0x2` (non-present + writable) as the scrub value for empty
/// directory slots and freed pages, and `0x4` (non-present + user) as the
/// fill for the entries of a freshly created page table.
#[bitfield(u32)]
pub struct PageEntry {
    /// Present (P, bit 0). Clear means any access through this entry raises
    /// a non-present page fault — which is how demand paging is triggered.
    pub present: bool,

    /// Writable (RW, bit 1). Clear makes the page read-only (subject to
    /// CR0.WP in supervisor mode).
    pub writable: bool,

    /// User/Supervisor (US, bit 2). Set allows CPL 3 access.
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU on first access through the
    /// entry; software may clear it for usage tracking.
    pub accessed: bool,

    /// Dirty (D, bit 6) — leaf only. Set by the CPU on first write.
    pub dirty: bool,

    /// Page Size (PS, bit 7). A PDE with PS=1 maps a 4 MiB page directly;
    /// this kernel always walks two levels and leaves it clear.
    pub large_page: bool,

    /// Global (G, bit 8) — leaf only. Survives CR3 reloads when CR4.PGE is
    /// on.
    pub global_translation: bool,

    /// OS-available bits 9–11; hardware ignores them.
    #[bits(3)]
    pub os_available: u8,

    /// Physical frame number (bits 31–12 of the mapped address).
    #[bits(20)]
    frame_no: u32,
}

impl PageEntry {
    /// The frame this entry maps or points at.
    #[inline]
    #[must_use]
    pub const fn frame(&self) -> Frame {
        Frame::new(self.frame_no())
    }

    /// Replace the frame this entry maps or points at.
    #[inline]
    pub const fn set_frame(&mut self, frame: Frame) {
        self.set_frame_no(frame.number());
    }

    /// A present + writable supervisor mapping of `frame` (`frame | 3`):
    /// the encoding of every installed PDE and PTE.
    #[inline]
    #[must_use]
    pub const fn present_rw(frame: Frame) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_frame_no(frame.number())
    }

    /// The non-present scrub value (`0x2`) written into empty directory
    /// slots and into PTEs whose frame has been freed.
    #[inline]
    #[must_use]
    pub const fn scrubbed() -> Self {
        Self::new().with_writable(true)
    }

    /// The fill value (`0x4`) for every entry of a freshly created page
    /// table: non-present, with only the user bit set.
    #[inline]
    #[must_use]
    pub const fn fresh() -> Self {
        Self::new().with_user_access(true)
    }
}
