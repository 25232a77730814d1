//! Hypervisor-Built ACPI Tables
//!
//! Some hypervisors (Xen, ACRN) build the complete set of ACPI tables themselves and leave an RSDP
//! in the legacy BIOS area. The firmware does not generate tables of its own on those platforms; it
//! walks the hypervisor's tables and reinstalls each one through the ACPI Table protocol, which
//! rebuilds the RSDT/XSDT it publishes to the OS.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use core::{ffi::c_void, mem};

use patina::error::EfiError;
use r_efi::efi;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::little_endian::{U32, U64},
};

use crate::memory::PhysicalMemory;

/// Start of the legacy BIOS area searched for the RSDP.
pub const RSDP_SCAN_START: u64 = 0x000E_0000;
/// End (exclusive) of the legacy BIOS area searched for the RSDP.
pub const RSDP_SCAN_END: u64 = 0x0010_0000;

const RSDP_SIGNATURE: &[u8; 8] = b"RSD PTR ";
const RSDP_V1_LENGTH: usize = 20;
const FADT_SIGNATURE: &[u8; 4] = b"FACP";

// FADT field offsets, ACPI 6.5 table 5.9.
const FADT_FIRMWARE_CTRL_OFFSET: usize = 36;
const FADT_DSDT_OFFSET: usize = 40;
const FADT_X_FIRMWARE_CTRL_OFFSET: usize = 132;
const FADT_X_DSDT_OFFSET: usize = 140;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcpiError {
    /// No valid RSDP in the scanned range.
    RsdpNotFound,
    /// A table pointer leads to unreadable memory or a nonsensical length.
    InvalidTable(u64),
    /// The root table references no tables.
    NotFound,
    /// The ACPI Table protocol rejected a table.
    Install(efi::Status),
}

impl From<AcpiError> for EfiError {
    fn from(value: AcpiError) -> Self {
        match value {
            AcpiError::RsdpNotFound | AcpiError::NotFound => EfiError::NotFound,
            AcpiError::InvalidTable(_) => EfiError::VolumeCorrupted,
            AcpiError::Install(status) => crate::error::status_to_error(status),
        }
    }
}

/// Root System Description Pointer, ACPI 2.0+ layout.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy, Debug)]
pub struct Rsdp {
    pub signature: [u8; 8],
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub revision: u8,
    pub rsdt_address: U32,
    pub length: U32,
    pub xsdt_address: U64,
    pub extended_checksum: u8,
    pub reserved: [u8; 3],
}

/// Common header of every system description table.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy, Debug)]
pub struct SdtHeader {
    pub signature: [u8; 4],
    pub length: U32,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_revision: U32,
    pub creator_id: U32,
    pub creator_revision: U32,
}

/// Installs one ACPI table.
pub trait AcpiTableInstaller {
    /// Installs a copy of `table`, returning the key the protocol assigned to it.
    fn install_table(&mut self, table: &[u8]) -> Result<usize, efi::Status>;
}

/// `EFI_ACPI_TABLE_PROTOCOL`.
#[repr(C)]
pub struct AcpiTableProtocol {
    pub install_acpi_table: extern "efiapi" fn(*mut AcpiTableProtocol, *const c_void, usize, *mut usize) -> efi::Status,
    pub uninstall_acpi_table: extern "efiapi" fn(*mut AcpiTableProtocol, usize) -> efi::Status,
}

impl AcpiTableProtocol {
    pub const GUID: efi::Guid =
        efi::Guid::from_fields(0xffe06bdd, 0x6107, 0x46a6, 0x7b, 0xb2, &[0x5a, 0x9c, 0x7e, 0xc5, 0x27, 0x5c]);
}

/// [`AcpiTableInstaller`] over an located ACPI Table protocol instance.
pub struct ProtocolInstaller {
    protocol: *mut AcpiTableProtocol,
}

impl ProtocolInstaller {
    /// ## Safety
    ///
    /// `protocol` must point at a live `EFI_ACPI_TABLE_PROTOCOL`.
    pub unsafe fn new(protocol: *mut AcpiTableProtocol) -> Self {
        Self { protocol }
    }
}

impl AcpiTableInstaller for ProtocolInstaller {
    fn install_table(&mut self, table: &[u8]) -> Result<usize, efi::Status> {
        let mut key = 0;
        // SAFETY: the constructor contract guarantees a live protocol; the protocol copies `table`.
        let status = unsafe {
            ((*self.protocol).install_acpi_table)(self.protocol, table.as_ptr() as *const c_void, table.len(), &mut key)
        };
        if status.is_error() { Err(status) } else { Ok(key) }
    }
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

fn rsdp_at<M: PhysicalMemory + ?Sized>(memory: &M, address: u64) -> Option<&Rsdp> {
    let v1 = memory.bytes(address, RSDP_V1_LENGTH)?;
    if &v1[..8] != RSDP_SIGNATURE || checksum(v1) != 0 {
        return None;
    }
    let rsdp = Rsdp::ref_from_bytes(memory.bytes(address, mem::size_of::<Rsdp>())?).ok()?;
    if rsdp.revision < 2 {
        return Some(rsdp);
    }
    // Revision 2+ adds a length and a checksum over the extended structure.
    let length = rsdp.length.get() as usize;
    if length < mem::size_of::<Rsdp>() || checksum(memory.bytes(address, length)?) != 0 {
        return None;
    }
    Some(rsdp)
}

/// Scans `start..end` on 16-byte boundaries for a valid RSDP and returns its address.
pub fn find_rsdp<M: PhysicalMemory + ?Sized>(memory: &M, start: u64, end: u64) -> Option<u64> {
    (start..end).step_by(16).find(|&address| rsdp_at(memory, address).is_some())
}

/// Reads the complete table whose header is at `address`.
fn read_table<M: PhysicalMemory + ?Sized>(memory: &M, address: u64) -> Result<&[u8], AcpiError> {
    // Signature and length are common to every table, FACS included.
    let prefix = memory.bytes(address, 8).ok_or(AcpiError::InvalidTable(address))?;
    let length = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]) as usize;
    if length < 8 {
        return Err(AcpiError::InvalidTable(address));
    }
    memory.bytes(address, length).ok_or(AcpiError::InvalidTable(address))
}

fn read_u32(table: &[u8], offset: usize) -> Option<u64> {
    table.get(offset..offset + 4).map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64)
}

fn read_u64(table: &[u8], offset: usize) -> Option<u64> {
    let bytes: [u8; 8] = table.get(offset..offset + 8)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

/// Prefers the 64-bit address when present and non-zero.
fn fadt_pointer(fadt: &[u8], legacy_offset: usize, extended_offset: usize) -> Option<u64> {
    read_u64(fadt, extended_offset)
        .filter(|&address| address != 0)
        .or_else(|| read_u32(fadt, legacy_offset))
        .filter(|&address| address != 0)
}

fn install<I: AcpiTableInstaller + ?Sized>(installer: &mut I, address: u64, table: &[u8]) -> Result<(), AcpiError> {
    log::debug!(
        "Installing ACPI table {} at {:#x} ({} bytes)",
        core::str::from_utf8(&table[..4]).unwrap_or("????"),
        address,
        table.len()
    );
    installer.install_table(table).map(|_| ()).map_err(|status| {
        log::error!("ACPI table at {:#x} was rejected: {:?}", address, status);
        AcpiError::Install(status)
    })
}

/// Reinstalls every table reachable from the hypervisor's RSDP, returning how many were installed.
///
/// The XSDT is used when the RSDP is revision 2 or later and names one; otherwise the RSDT. The
/// FACS and DSDT are not listed in either root table; they are taken from the FADT and installed
/// after the listed tables.
pub fn install_hypervisor_tables<M, I>(memory: &M, installer: &mut I) -> Result<usize, AcpiError>
where
    M: PhysicalMemory + ?Sized,
    I: AcpiTableInstaller + ?Sized,
{
    let rsdp_address = find_rsdp(memory, RSDP_SCAN_START, RSDP_SCAN_END).ok_or(AcpiError::RsdpNotFound)?;
    let rsdp = rsdp_at(memory, rsdp_address).ok_or(AcpiError::RsdpNotFound)?;
    let rsdt_address = rsdp.rsdt_address.get() as u64;
    let xsdt_address = if rsdp.revision >= 2 { rsdp.xsdt_address.get() } else { 0 };
    log::info!("Found hypervisor RSDP at {:#x}, revision {}", rsdp_address, rsdp.revision);

    let (root_address, entry_size) = if xsdt_address != 0 { (xsdt_address, 8) } else { (rsdt_address, 4) };
    if root_address == 0 {
        return Err(AcpiError::NotFound);
    }
    let root = read_table(memory, root_address)?;
    let entries = root.get(mem::size_of::<SdtHeader>()..).ok_or(AcpiError::InvalidTable(root_address))?;

    let mut installed = 0;
    let mut facs = None;
    let mut dsdt = None;
    for entry in entries.chunks_exact(entry_size) {
        let address = if entry_size == 8 { read_u64(entry, 0) } else { read_u32(entry, 0) }.unwrap_or(0);
        if address == 0 {
            continue;
        }
        let table = read_table(memory, address)?;
        install(installer, address, table)?;
        installed += 1;

        if &table[..4] == FADT_SIGNATURE {
            facs = fadt_pointer(table, FADT_FIRMWARE_CTRL_OFFSET, FADT_X_FIRMWARE_CTRL_OFFSET);
            dsdt = fadt_pointer(table, FADT_DSDT_OFFSET, FADT_X_DSDT_OFFSET);
        }
    }

    for address in [facs, dsdt].into_iter().flatten() {
        let table = read_table(memory, address)?;
        install(installer, address, table)?;
        installed += 1;
    }

    if installed == 0 {
        log::warn!("Hypervisor root table at {:#x} lists no tables", root_address);
        return Err(AcpiError::NotFound);
    }
    log::info!("Installed {} hypervisor ACPI tables", installed);
    Ok(installed)
}
