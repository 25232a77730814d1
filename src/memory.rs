//! Guest Physical Memory Access
//!
//! Hypervisors hand data to the firmware by placing it at fixed guest physical addresses. Everything
//! that reads such data goes through [`PhysicalMemory`] so it can be exercised against a host buffer.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!

/// Read-only view of guest physical memory.
pub trait PhysicalMemory {
    /// Returns `length` bytes starting at `address`, or `None` if the range is not readable.
    fn bytes(&self, address: u64, length: usize) -> Option<&[u8]>;
}

/// Physical memory that is identity mapped into the current address space.
///
/// This is the case for both the pre-DXE phase and the DXE phase on x64 Patina platforms.
#[derive(Debug)]
pub struct IdentityMapped {
    _private: (),
}

impl IdentityMapped {
    /// Creates an accessor for identity-mapped physical memory.
    ///
    /// ## Safety
    ///
    /// Every range later passed to [`PhysicalMemory::bytes`] must be mapped, readable, and not mutated
    /// for the lifetime of the returned slice.
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl PhysicalMemory for IdentityMapped {
    fn bytes(&self, address: u64, length: usize) -> Option<&[u8]> {
        if address == 0 || address.checked_add(length as u64).is_none() {
            return None;
        }
        // SAFETY: the constructor contract makes the caller responsible for the range being mapped.
        Some(unsafe { core::slice::from_raw_parts(address as usize as *const u8, length) })
    }
}
