use bitfield_struct::bitfield;

/// Page-fault error code as pushed by the CPU (x86, #PF).
///
/// Each bit describes the condition that caused the fault; the handler only
/// acts on `present`, but the rest makes diagnostics readable.
#[bitfield(u32)]
pub struct PageFaultErrorCode {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read. 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor access. 1 = user-mode access.
    pub user: bool, // bit 2

    /// 1 = a reserved bit was set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch.
    pub instruction_fetch: bool, // bit 4

    #[bits(27)]
    __: u32,
}

impl PageFaultErrorCode {
    /// One-line classification for fault logs.
    #[must_use]
    pub fn explain(&self) -> &'static str {
        if !self.present() {
            "non-present page (unmapped, candidate for demand paging)"
        } else if self.write() {
            "write access to a protected page"
        } else {
            "read access to a protected page"
        }
    }
}

/// What the CPU trap glue delivers to the fault handler.
///
/// The glue saves the register window, picks the error code off the stack and
/// calls [`PageTable::handle_fault`](crate::PageTable::handle_fault) on the
/// currently loaded page table; the faulting address itself comes from CR2.
#[derive(Debug, Copy, Clone)]
pub struct FaultRecord {
    pub error_code: PageFaultErrorCode,
}

impl FaultRecord {
    #[must_use]
    pub const fn new(error_code: PageFaultErrorCode) -> Self {
        Self { error_code }
    }

    /// A record for a plain non-present read fault (the demand-paging case).
    #[must_use]
    pub const fn non_present() -> Self {
        Self::new(PageFaultErrorCode::new())
    }
}
