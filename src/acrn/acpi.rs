//! ACRN ACPI Platform Component
//!
//! The ACRN device model builds the guest ACPI tables in the same shape Xen does, so the tables
//! are installed by the shared hypervisor walker in [`crate::acpi`].
//!
//! The tables land in the patina ACPI table service. Hypervisor tables are variable-length byte
//! blobs, so they go through the `EFI_ACPI_TABLE_PROTOCOL` interface that
//! [`patina_acpi::component::AcpiComponent`] installs next to [`AcpiTableManager`].
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use patina::{
    boot_services::StandardBootServices,
    component::{component, service::Service},
    error::{EfiError, Result},
};
use patina_acpi::service::AcpiTableManager;

use crate::{
    acpi::{AcpiTableInstaller, AcpiTableProtocol, ProtocolInstaller, install_hypervisor_tables},
    boot_services::PlatformBootServices,
    error::status_to_error,
    memory::{IdentityMapped, PhysicalMemory},
};

/// Installs the ACPI tables built by the ACRN device model.
#[derive(Default)]
pub struct AcrnAcpiPlatform;

#[component]
impl AcrnAcpiPlatform {
    /// Creates a new instance.
    pub fn new() -> Self {
        Self
    }

    fn entry_point(self, acpi: Service<AcpiTableManager>, boot_services: StandardBootServices) -> Result<()> {
        let protocol = locate_acpi_table_protocol(&boot_services)?;
        // SAFETY: LocateProtocol returned an interface for the ACPI Table protocol GUID.
        let mut installer = unsafe { ProtocolInstaller::new(protocol) };
        // SAFETY: the legacy BIOS area and the ACRN table region are identity mapped during DXE.
        let memory = unsafe { IdentityMapped::new() };
        install_acrn_tables(&memory, &mut installer)?;
        log::debug!("ACPI table service now holds {} tables", acpi.iter_tables().len());
        Ok(())
    }
}

fn locate_acpi_table_protocol<B: PlatformBootServices + ?Sized>(boot_services: &B) -> Result<*mut AcpiTableProtocol> {
    let protocol = boot_services.locate_protocol(&AcpiTableProtocol::GUID).map_err(|status| {
        log::error!("ACPI Table protocol not found: {:?}", status);
        status_to_error(status)
    })?;
    if protocol.is_null() {
        return Err(EfiError::NotFound);
    }
    Ok(protocol as *mut AcpiTableProtocol)
}

/// Installs the ACRN tables found in `memory` through `installer`.
pub fn install_acrn_tables<M, I>(memory: &M, installer: &mut I) -> Result<()>
where
    M: PhysicalMemory + ?Sized,
    I: AcpiTableInstaller + ?Sized,
{
    log::info!("Installing ACRN ACPI tables");
    let installed = install_hypervisor_tables(memory, installer).inspect_err(|error| {
        log::error!("Failed to install ACRN ACPI tables: {:?}", error);
    })?;
    log::debug!("ACRN provided {} ACPI tables", installed);
    Ok(())
}
