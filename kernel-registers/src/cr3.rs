use bitfield_struct::bitfield;
use kernel_addresses::{Frame, PhysAddr};

/// CR3 — Page-Directory Base Register (32-bit paging, no PAE).
///
/// Holds the physical base address of the page directory and cache-control
/// flags for directory walks. The base is stored shifted right by 12; the
/// directory must be 4 KiB-aligned.
#[bitfield(u32)]
pub struct Cr3 {
    /// Bits 0–2 — Reserved (must be 0).
    #[bits(3, default = 0)]
    _reserved0: u8,

    /// Bit 3 — PWT: Page-level Write-Through for directory accesses.
    pub pwt: bool,

    /// Bit 4 — PCD: Page-level Cache Disable for directory accesses.
    pub pcd: bool,

    /// Bits 5–11 — Reserved (must be 0 when written).
    #[bits(7, default = 0)]
    _reserved1: u8,

    /// Bits 12–31 — Page-directory physical base >> 12.
    #[bits(20)]
    directory_base_4k: u32,
}

impl Cr3 {
    /// Build a CR3 value pointing at the directory stored in `frame`.
    #[must_use]
    pub const fn from_directory(frame: Frame) -> Self {
        Self::new().with_directory_base_4k(frame.number())
    }

    /// The frame holding the active page directory.
    #[must_use]
    pub const fn directory(&self) -> Frame {
        Frame::new(self.directory_base_4k())
    }

    /// The full physical address of the active page directory.
    #[must_use]
    pub const fn directory_phys(&self) -> PhysAddr {
        self.directory().base()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_base_round_trips() {
        let cr3 = Cr3::from_directory(Frame::new(0x1234));
        assert_eq!(cr3.into_bits(), 0x1234 << 12);
        assert_eq!(cr3.directory().number(), 0x1234);
        assert_eq!(cr3.directory_phys().as_u32(), 0x1234 << 12);
    }

    #[test]
    fn flags_do_not_disturb_the_base() {
        let cr3 = Cr3::from_directory(Frame::new(1)).with_pcd(true).with_pwt(true);
        assert_eq!(cr3.directory().number(), 1);
        assert_eq!(cr3.into_bits() & 0xFFF, 0b11000);
    }
}
