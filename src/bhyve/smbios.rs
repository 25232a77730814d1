//! bhyve SMBIOS Tables
//!
//! bhyve places a 32-bit SMBIOS entry point somewhere in `0xF0000..0xFFFFF` on a 16-byte boundary.
//! The structures it points at are handed one by one to the SMBIOS service, which builds the
//! SMBIOS 3.x table the OS eventually sees.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use core::mem;

use patina::{
    component::{component, service::Service},
    error::{EfiError, Result},
};
use patina_smbios::service::Smbios;
use r_efi::efi;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::little_endian::{U16, U32},
};

use crate::{
    error::status_to_error,
    memory::{IdentityMapped, PhysicalMemory},
};

pub const BHYVE_SMBIOS_PHYSICAL_ADDRESS: u64 = 0x000F_0000;
pub const BHYVE_SMBIOS_PHYSICAL_END: u64 = 0x000F_FFFF;

/// Structure type that terminates the structure table.
pub const SMBIOS_TYPE_END_OF_TABLE: u8 = 127;

const ANCHOR: &[u8; 4] = b"_SM_";
const INTERMEDIATE_ANCHOR: &[u8; 5] = b"_DMI_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmbiosError {
    /// No valid entry point in the scanned range.
    EntryPointNotFound,
    /// The structure table is not readable at the advertised address.
    TableUnreadable,
    /// The SMBIOS service rejected a structure.
    Add(efi::Status),
}

impl From<SmbiosError> for EfiError {
    fn from(value: SmbiosError) -> Self {
        match value {
            SmbiosError::EntryPointNotFound => EfiError::NotFound,
            SmbiosError::TableUnreadable => EfiError::VolumeCorrupted,
            SmbiosError::Add(status) => status_to_error(status),
        }
    }
}

/// SMBIOS 2.x (32-bit) entry point structure.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy, Debug)]
pub struct EntryPoint {
    pub anchor: [u8; 4],
    pub checksum: u8,
    pub entry_point_length: u8,
    pub major_version: u8,
    pub minor_version: u8,
    pub max_structure_size: U16,
    pub entry_point_revision: u8,
    pub formatted_area: [u8; 5],
    pub intermediate_anchor: [u8; 5],
    pub intermediate_checksum: u8,
    pub table_length: U16,
    pub table_address: U32,
    pub number_of_structures: U16,
    pub bcd_revision: u8,
}

/// Header shared by every SMBIOS structure.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy, Debug)]
pub struct StructureHeader {
    pub structure_type: u8,
    pub length: u8,
    pub handle: U16,
}

fn entry_point_at<M: PhysicalMemory + ?Sized>(memory: &M, address: u64) -> Option<&EntryPoint> {
    let entry_point = EntryPoint::ref_from_bytes(memory.bytes(address, mem::size_of::<EntryPoint>())?).ok()?;
    if &entry_point.anchor != ANCHOR || &entry_point.intermediate_anchor != INTERMEDIATE_ANCHOR {
        return None;
    }
    let checksummed = memory.bytes(address, entry_point.entry_point_length as usize)?;
    let sum = checksummed.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte));
    (sum == 0).then_some(entry_point)
}

/// Scans the bhyve SMBIOS window for a valid entry point and returns it with its address.
pub fn find_entry_point<M: PhysicalMemory + ?Sized>(memory: &M) -> Option<(u64, &EntryPoint)> {
    (BHYVE_SMBIOS_PHYSICAL_ADDRESS..BHYVE_SMBIOS_PHYSICAL_END)
        .step_by(0x10)
        .find_map(|address| entry_point_at(memory, address).map(|entry_point| (address, entry_point)))
}

/// Iterator over the structures of an SMBIOS structure table.
///
/// Each item is one complete structure: the formatted area followed by its string set, including
/// the double-NUL terminator. Iteration ends before the end-of-table structure, at the end of the
/// table, or at the first structure that does not fit.
#[derive(Debug, Clone)]
pub struct SmbiosRecords<'a> {
    remaining: &'a [u8],
}

impl<'a> SmbiosRecords<'a> {
    pub fn new(table: &'a [u8]) -> Self {
        Self { remaining: table }
    }

    /// Reads the structure table named by `entry_point`.
    pub fn from_entry_point<M: PhysicalMemory + ?Sized>(
        memory: &'a M,
        entry_point: &EntryPoint,
    ) -> core::result::Result<Self, SmbiosError> {
        let table = memory
            .bytes(entry_point.table_address.get() as u64, entry_point.table_length.get() as usize)
            .ok_or(SmbiosError::TableUnreadable)?;
        Ok(Self::new(table))
    }
}

impl<'a> Iterator for SmbiosRecords<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let (header, _) = StructureHeader::ref_from_prefix(self.remaining).ok()?;
        let formatted_length = header.length as usize;
        if header.structure_type == SMBIOS_TYPE_END_OF_TABLE || formatted_length < mem::size_of::<StructureHeader>() {
            return None;
        }

        let strings = self.remaining.get(formatted_length..)?;
        let string_set_length = strings.windows(2).position(|pair| pair == [0, 0])? + 2;
        let (record, rest) = self.remaining.split_at(formatted_length + string_set_length);
        self.remaining = rest;
        Some(record)
    }
}

/// Consumer of raw SMBIOS structures.
pub trait SmbiosRecordSink {
    /// Adds `record`, returning the handle it was assigned.
    fn add_record(&mut self, record: &[u8]) -> core::result::Result<u16, efi::Status>;
}

impl<T: Smbios + ?Sized> SmbiosRecordSink for &T {
    fn add_record(&mut self, record: &[u8]) -> core::result::Result<u16, efi::Status> {
        self.add_from_bytes(None, record).map_err(efi::Status::from)
    }
}

/// Adds every structure of the bhyve SMBIOS table to `sink`, returning how many were added.
pub fn install_bhyve_structures<M, S>(memory: &M, sink: &mut S) -> core::result::Result<usize, SmbiosError>
where
    M: PhysicalMemory + ?Sized,
    S: SmbiosRecordSink + ?Sized,
{
    let (address, entry_point) = find_entry_point(memory).ok_or(SmbiosError::EntryPointNotFound)?;
    log::info!(
        "Found bhyve SMBIOS {}.{} entry point at {:#x}, table at {:#x}",
        entry_point.major_version,
        entry_point.minor_version,
        address,
        entry_point.table_address.get()
    );

    let mut added = 0;
    for record in SmbiosRecords::from_entry_point(memory, entry_point)? {
        let handle = sink.add_record(record).map_err(|status| {
            log::error!("SMBIOS type {} structure was rejected: {:?}", record[0], status);
            SmbiosError::Add(status)
        })?;
        log::trace!("  Type {} - Handle 0x{:04X}", record[0], handle);
        added += 1;
    }
    Ok(added)
}

/// Republishes the SMBIOS tables bhyve provides.
#[derive(Default)]
pub struct BhyveSmbiosPlatform;

#[component]
impl BhyveSmbiosPlatform {
    /// Creates a new instance.
    pub fn new() -> Self {
        Self
    }

    fn entry_point(self, smbios: Service<dyn Smbios>) -> Result<()> {
        log::debug!("=== bhyve SMBIOS Platform Component ===");
        // SAFETY: the legacy BIOS area and the bhyve table are identity mapped during DXE.
        let memory = unsafe { IdentityMapped::new() };
        publish_bhyve_tables(*smbios, &memory)
    }
}

/// Copies the bhyve structures into `smbios` and publishes the resulting table.
///
/// A guest without SMBIOS tables is not an error; nothing is published in that case.
fn publish_bhyve_tables<M: PhysicalMemory + ?Sized>(smbios: &dyn Smbios, memory: &M) -> Result<()> {
    let (major, minor) = smbios.version();
    log::trace!("SMBIOS Version: {}.{}", major, minor);

    match install_bhyve_structures(memory, &mut &*smbios) {
        Ok(added) => log::info!("Added {} bhyve SMBIOS structures", added),
        Err(SmbiosError::EntryPointNotFound) => {
            log::warn!("bhyve SMBIOS tables not found");
            return Ok(());
        }
        Err(error) => return Err(error.into()),
    }

    let (table_addr, entry_point_addr) = smbios.publish_table().map_err(|e| {
        log::error!("Failed to publish SMBIOS table: {:?}", e);
        e
    })?;
    log::debug!("SMBIOS table published successfully");
    log::debug!("  Entry Point: 0x{:X}", entry_point_addr);
    log::debug!("  Table Data: 0x{:X}", table_addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec::Vec;

    use mockall::Sequence;
    use patina_smbios::{error::SmbiosError as ServiceError, service::MockSmbios};

    use super::*;
    use crate::memory::fake::FakeMemory;

    const TABLE_ADDRESS: u64 = 0x000F_1000;

    fn structure(structure_type: u8, handle: u16, formatted: &[u8], strings: &[&str]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.push(structure_type);
        bytes.push((mem::size_of::<StructureHeader>() + formatted.len()) as u8);
        bytes.extend_from_slice(&handle.to_le_bytes());
        bytes.extend_from_slice(formatted);
        if strings.is_empty() {
            bytes.extend_from_slice(&[0, 0]);
        } else {
            for string in strings {
                bytes.extend_from_slice(string.as_bytes());
                bytes.push(0);
            }
            bytes.push(0);
        }
        bytes
    }

    fn bhyve_table() -> Vec<u8> {
        let mut table = Vec::new();
        table.extend(structure(0, 0, &[1, 2, 0x00, 0xF0, 3, 0], &["BHYVE", "14.0", "10/17/2014"]));
        table.extend(structure(1, 1, &[1, 2, 3, 4], &["FreeBSD", "BHYVE", "1.0", "None"]));
        table.extend(structure(32, 2, &[0; 6], &[]));
        table.extend(structure(SMBIOS_TYPE_END_OF_TABLE, 3, &[], &[]));
        table
    }

    fn entry_point(table_length: usize) -> Vec<u8> {
        let mut entry_point = EntryPoint {
            anchor: *ANCHOR,
            checksum: 0,
            entry_point_length: mem::size_of::<EntryPoint>() as u8,
            major_version: 2,
            minor_version: 8,
            max_structure_size: 64.into(),
            entry_point_revision: 0,
            formatted_area: [0; 5],
            intermediate_anchor: *INTERMEDIATE_ANCHOR,
            intermediate_checksum: 0,
            table_length: (table_length as u16).into(),
            table_address: (TABLE_ADDRESS as u32).into(),
            number_of_structures: 4.into(),
            bcd_revision: 0x28,
        }
        .as_bytes()
        .to_vec();
        let sum = entry_point.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte));
        entry_point[4] = 0u8.wrapping_sub(sum);
        entry_point
    }

    fn bhyve_memory(entry_point_offset: usize) -> FakeMemory {
        let table = bhyve_table();
        let mut memory = FakeMemory::new();
        memory.zeroed(BHYVE_SMBIOS_PHYSICAL_ADDRESS, 0x1000);
        let entry_point = entry_point(table.len());
        memory.region_mut(BHYVE_SMBIOS_PHYSICAL_ADDRESS)[entry_point_offset..][..entry_point.len()]
            .copy_from_slice(&entry_point);
        memory.place(TABLE_ADDRESS, &table);
        memory
    }

    #[derive(Default)]
    struct Recorder {
        types: Vec<u8>,
        lengths: Vec<usize>,
    }

    impl SmbiosRecordSink for Recorder {
        fn add_record(&mut self, record: &[u8]) -> core::result::Result<u16, efi::Status> {
            self.types.push(record[0]);
            self.lengths.push(record.len());
            Ok(self.types.len() as u16)
        }
    }

    #[test]
    fn entry_point_is_31_bytes() {
        assert_eq!(mem::size_of::<EntryPoint>(), 0x1F);
    }

    #[test]
    fn finds_entry_point_on_paragraph_boundary() {
        let memory = bhyve_memory(0x40);
        let (address, entry_point) = find_entry_point(&memory).unwrap();
        assert_eq!(address, BHYVE_SMBIOS_PHYSICAL_ADDRESS + 0x40);
        assert_eq!(entry_point.table_address.get() as u64, TABLE_ADDRESS);
    }

    #[test]
    fn rejects_bad_checksum_and_missing_intermediate_anchor() {
        let mut memory = bhyve_memory(0x40);
        memory.region_mut(BHYVE_SMBIOS_PHYSICAL_ADDRESS)[0x40 + 4] ^= 0xFF;
        assert!(find_entry_point(&memory).is_none());

        let mut memory = bhyve_memory(0x40);
        memory.region_mut(BHYVE_SMBIOS_PHYSICAL_ADDRESS)[0x40 + 0x10] = b'X';
        assert!(find_entry_point(&memory).is_none());
    }

    #[test]
    fn records_include_string_sets_and_stop_at_end_of_table() {
        let table = bhyve_table();
        let records: Vec<_> = SmbiosRecords::new(&table).collect();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0][0], 0);
        assert_eq!(records[0].len(), 10 + "BHYVE\014.0\010/17/2014\0\0".len());
        assert!(records[1].ends_with(b"None\0\0"));
        assert_eq!(records[2], structure(32, 2, &[0; 6], &[]).as_slice());
    }

    #[test]
    fn records_stop_at_a_structure_without_terminator() {
        let mut table = structure(1, 1, &[1, 2, 3, 4], &["FreeBSD"]);
        table.truncate(table.len() - 1);
        assert_eq!(SmbiosRecords::new(&table).count(), 0);
    }

    #[test]
    fn install_adds_every_structure_but_the_end_marker() {
        let memory = bhyve_memory(0x200);
        let mut recorder = Recorder::default();

        assert_eq!(install_bhyve_structures(&memory, &mut recorder), Ok(3));
        assert_eq!(recorder.types, [0, 1, 32]);
    }

    fn smbios_3_9() -> MockSmbios {
        let mut smbios = MockSmbios::new();
        smbios.expect_version().return_const((3u8, 9u8));
        smbios
    }

    #[test]
    fn service_receives_each_structure_then_publishes() {
        let memory = bhyve_memory(0x40);
        let mut smbios = smbios_3_9();
        let mut sequence = Sequence::new();
        for (handle, structure_type) in [0u8, 1, 32].into_iter().enumerate() {
            smbios
                .expect_add_from_bytes()
                .withf(move |producer, record| producer.is_none() && record[0] == structure_type)
                .times(1)
                .in_sequence(&mut sequence)
                .returning(move |_, _| Ok(handle as u16));
        }
        smbios.expect_publish_table().times(1).in_sequence(&mut sequence).returning(|| Ok((0x7F00_0000, 0x7F00_1000)));

        assert_eq!(publish_bhyve_tables(&smbios, &memory), Ok(()));
    }

    #[test]
    fn absent_tables_are_not_an_error() {
        let mut memory = FakeMemory::new();
        memory.zeroed(BHYVE_SMBIOS_PHYSICAL_ADDRESS, 0x1_0000);
        let mut smbios = smbios_3_9();
        smbios.expect_add_from_bytes().never();
        smbios.expect_publish_table().never();

        assert_eq!(publish_bhyve_tables(&smbios, &memory), Ok(()));
    }

    #[test]
    fn rejected_structure_is_not_published() {
        let memory = bhyve_memory(0x40);
        let mut smbios = smbios_3_9();
        smbios.expect_add_from_bytes().returning(|_, _| Err(ServiceError::HandleExhausted));
        smbios.expect_publish_table().never();

        assert_eq!(publish_bhyve_tables(&smbios, &memory), Err(EfiError::OutOfResources));
    }
}
