//! Intel GVT-g Graphics Output
//!
//! A GVT-g mediated GPU exposes a small interface page in BAR0 through which the guest asks the
//! host for a pre-configured framebuffer. The driver binds to such a device, performs that
//! handshake and publishes a single-mode Graphics Output Protocol over the framebuffer.
//!
//! The Platform GOP Policy protocol hands the Video BIOS Table to whatever consumes it.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
pub mod blt;
pub mod component;
pub mod driver;
pub mod gop;
pub mod interface;
pub mod pci;
pub mod policy;

/// Driver Binding Protocol version of the GVT-g driver.
pub const GVT_DRIVER_VERSION: u32 = 0x10;

/// Tunables for the GVT-g Graphics Output driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GvtGopConfig {
    /// Version reported through the Driver Binding Protocol.
    pub driver_version: u32,
    /// Horizontal resolution of the only mode.
    pub horizontal_resolution: u32,
    /// Vertical resolution of the only mode.
    pub vertical_resolution: u32,
}

impl Default for GvtGopConfig {
    fn default() -> Self {
        Self { driver_version: GVT_DRIVER_VERSION, horizontal_resolution: 1024, vertical_resolution: 768 }
    }
}
