//! The page fault error code pushed by the CPU.

use bitfield_struct::bitfield;
use core::fmt;

/// Error code of exception 14, as pushed on the stack by the CPU.
#[bitfield(u32)]
#[derive(Eq, PartialEq)]
pub struct PageFaultCode {
    /// Set: protection violation on a present page. Clear: page not present.
    pub present: bool,
    /// The faulting access was a write.
    pub write: bool,
    /// The fault originated at CPL 3.
    pub user: bool,
    /// A reserved bit was set in a paging structure.
    pub reserved_write: bool,
    /// The fault was an instruction fetch.
    pub instruction_fetch: bool,
    /// A protection-key violation.
    pub protection_key: bool,
    /// A shadow-stack access violation.
    pub shadow_stack: bool,
    #[bits(8)]
    __: u8,
    /// The fault occurred inside an SGX enclave.
    pub sgx: bool,
    #[bits(16)]
    __2: u16,
}

impl PageFaultCode {
    /// The pattern the copy-on-write path resolves: a write that was denied
    /// on a present page.
    #[must_use]
    pub const fn is_cow_candidate(self) -> bool {
        self.present() && self.write()
    }

    /// Human-readable rendering for fault diagnostics.
    #[must_use]
    pub const fn explain(self) -> PageFaultExplanation {
        PageFaultExplanation(self)
    }
}

/// Display adapter for [`PageFaultCode::explain`].
pub struct PageFaultExplanation(PageFaultCode);

impl fmt::Display for PageFaultExplanation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.0;
        let access = if code.instruction_fetch() {
            "instruction fetch"
        } else if code.write() {
            "write"
        } else {
            "read"
        };
        let origin = if code.user() { "user" } else { "kernel" };
        let cause = if code.reserved_write() {
            "reserved bit set in paging structures"
        } else if code.present() {
            "protection violation"
        } else {
            "page not present"
        };
        write!(f, "{access} from {origin} mode: {cause}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_hardware_bits() {
        // 0b111: present, write, user.
        let code = PageFaultCode::from(0b111);
        assert!(code.present());
        assert!(code.write());
        assert!(code.user());
        assert!(!code.instruction_fetch());
        assert!(code.is_cow_candidate());

        let read_miss = PageFaultCode::from(0b100);
        assert!(!read_miss.is_cow_candidate());
    }

    #[test]
    fn explains_the_interesting_cases() {
        let cow = PageFaultCode::from(0b011);
        assert_eq!(
            cow.explain().to_string(),
            "write from kernel mode: protection violation"
        );
        let miss = PageFaultCode::from(0b100);
        assert_eq!(
            miss.explain().to_string(),
            "read from user mode: page not present"
        );
    }
}
