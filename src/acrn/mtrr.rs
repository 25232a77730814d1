//! Guest RAM Cache Types
//!
//! ACRN leaves the guest MTRRs with an uncached default type. Every RAM range published from the
//! E820 map is programmed write-back, the same way firmware on real hardware would.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
#[cfg(test)]
use mockall::automock;
use patina_mtrr::{Mtrr, create_mtrr_lib, error::MtrrError, mtrr::MtrrLib, structs::MtrrMemoryCacheType};

/// Programs the memory type of guest RAM ranges.
#[cfg_attr(test, automock)]
pub trait MemoryCaching {
    /// False when the processor exposes no MTRRs.
    fn is_supported(&self) -> bool;

    /// Makes `base..base + length` write-back cacheable.
    fn set_write_back(&mut self, base: u64, length: u64) -> Result<(), MtrrError>;
}

/// MTRR programming through the MSRs of the boot processor.
impl MemoryCaching for MtrrLib {
    fn is_supported(&self) -> bool {
        Mtrr::is_supported(self)
    }

    fn set_write_back(&mut self, base: u64, length: u64) -> Result<(), MtrrError> {
        self.set_memory_attribute(base, length, MtrrMemoryCacheType::WriteBack)
    }
}

/// MTRR access for the boot processor with every variable MTRR available.
pub fn boot_processor_mtrrs() -> MtrrLib {
    create_mtrr_lib(0)
}
