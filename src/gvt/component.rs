//! GVT-g Components
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::boxed::Box;

use patina::{
    boot_services::StandardBootServices,
    component::{component, params::Config},
    error::Result,
};

use super::{
    GvtGopConfig,
    driver::{GvtDriver, install_driver_binding},
    pci::PciIoMmio,
    policy::install_gop_policy,
};
use crate::error::status_to_error;

/// Registers the GVT-g Graphics Output driver with the driver model.
#[derive(Default)]
pub struct GvtGop;

#[component]
impl GvtGop {
    /// Creates a new instance.
    pub fn new() -> Self {
        Self
    }

    fn entry_point(self, config: Config<GvtGopConfig>, boot_services: StandardBootServices) -> Result<()> {
        let services: &'static StandardBootServices = Box::leak(Box::new(boot_services));
        let driver = Box::leak(GvtDriver::<StandardBootServices, PciIoMmio>::new(services, *config));
        install_driver_binding(services, driver).map_err(|status| {
            log::error!("Failed to install the GVT-g driver binding: {:?}", status);
            status_to_error(status)
        })?;
        Ok(())
    }
}

/// Publishes the Platform GOP Policy protocol, serving the VBT found in the firmware volumes.
#[derive(Default)]
pub struct PlatformGopPolicy;

#[component]
impl PlatformGopPolicy {
    /// Creates a new instance.
    pub fn new() -> Self {
        Self
    }

    fn entry_point(self, boot_services: StandardBootServices) -> Result<()> {
        let services: &'static StandardBootServices = Box::leak(Box::new(boot_services));
        let handle = install_gop_policy(services).map_err(status_to_error)?;
        log::debug!("Platform GOP Policy installed on {:?}", handle);
        Ok(())
    }
}
