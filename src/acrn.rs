//! ACRN Platform Support
//!
//! The ACRN device model places an E820-style memory map at a fixed guest physical address and
//! builds the ACPI tables itself; the guest gets a local APIC that supports TSC-deadline mode.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
pub mod acpi;
pub mod e820;
pub mod hob;
pub mod mtrr;
pub mod timer;

/// Host bridge device ID reported by the ACRN device model.
pub const ACRN_HOSTBRIDGE_DEVICE_ID: u16 = 0x1275;

/// I/O base the ACRN device model assigns to the ACPI PM register block.
pub const ACRN_PMBASE_VALUE: u16 = 0x400;

/// Offset of the PM timer within the PM register block.
pub const PM_TIMER_OFFSET: u16 = 0x08;
