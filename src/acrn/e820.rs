//! ACRN E820 Memory Map
//!
//! The ACRN device model publishes the guest memory layout as a small table at
//! [`ACRN_E820_PHYSICAL_ADDRESS`]:
//!
//! ```text
//! +---------------------+------------------+------------------------------+
//! | signature [u8; 4]   | entry count: u32 | entries: [E820Entry; count]  |
//! +---------------------+------------------+------------------------------+
//! ```
//!
//! Only the first three signature bytes (`"820"`) are meaningful. Entries are the classic
//! 20-byte `(base, length, type)` triples.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use core::{fmt, mem};

use patina::error::EfiError;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::little_endian::{U32, U64},
};

use crate::{
    acrn::{hob::ResourcePublisher, mtrr::MemoryCaching},
    memory::PhysicalMemory,
};

/// Guest physical address of the ACRN E820 table.
pub const ACRN_E820_PHYSICAL_ADDRESS: u64 = 0x000E_F000;

const E820_SIGNATURE: &[u8; 3] = b"820";
const BASE_4GB: u64 = 0x1_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum E820Error {
    InvalidSignature,
    Empty,
    Truncated,
    NotFound,
}

impl From<E820Error> for EfiError {
    fn from(value: E820Error) -> Self {
        match value {
            E820Error::InvalidSignature | E820Error::Empty => EfiError::Unsupported,
            E820Error::Truncated => EfiError::VolumeCorrupted,
            E820Error::NotFound => EfiError::NotFound,
        }
    }
}

/// Address range type of an E820 entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum E820Type {
    Memory,
    Reserved,
    Acpi,
    Nvs,
    Unusable,
    Other(u32),
}

impl From<u32> for E820Type {
    fn from(value: u32) -> Self {
        match value {
            1 => E820Type::Memory,
            2 => E820Type::Reserved,
            3 => E820Type::Acpi,
            4 => E820Type::Nvs,
            5 => E820Type::Unusable,
            other => E820Type::Other(other),
        }
    }
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
struct E820Header {
    signature: [u8; 4],
    entry_count: U32,
}

/// A single E820 entry as laid out by the hypervisor.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Clone, Copy)]
pub struct E820Entry {
    base_address: U64,
    length: U64,
    memory_type: U32,
}

impl E820Entry {
    pub fn new(base_address: u64, length: u64, memory_type: u32) -> Self {
        Self { base_address: base_address.into(), length: length.into(), memory_type: memory_type.into() }
    }

    pub fn base_address(&self) -> u64 {
        self.base_address.get()
    }

    pub fn length(&self) -> u64 {
        self.length.get()
    }

    /// Exclusive end of the range, saturating at the top of the address space.
    pub fn end(&self) -> u64 {
        self.base_address().saturating_add(self.length())
    }

    pub fn memory_type(&self) -> E820Type {
        self.memory_type.get().into()
    }

    /// True for the reserved window above 4 GiB that ACRN uses as the 64-bit PCI host aperture.
    fn is_pci64_aperture(&self) -> bool {
        self.base_address() >= BASE_4GB && self.memory_type() == E820Type::Reserved
    }
}

impl fmt::Debug for E820Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("E820Entry")
            .field("base", &format_args!("{:#x}", self.base_address()))
            .field("length", &format_args!("{:#x}", self.length()))
            .field("type", &self.memory_type())
            .finish()
    }
}

/// The 64-bit PCI host aperture carved out of the E820 map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciAperture {
    pub base: u64,
    pub size: u64,
}

/// Memory layout facts derived from the E820 map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct E820Summary {
    /// Top of RAM below 4 GiB.
    pub low_memory_size: u64,
    /// Bytes of RAM at or above 4 GiB.
    pub high_memory_size: u64,
    /// First address past the highest entry, when it lies at or above 4 GiB.
    pub first_non_address: Option<u64>,
    pub pci64_aperture: Option<PciAperture>,
}

/// A validated view of the ACRN E820 table.
#[derive(Debug, Clone, Copy)]
pub struct AcrnE820Map<'a> {
    entries: &'a [E820Entry],
}

impl<'a> AcrnE820Map<'a> {
    /// Validates and wraps a buffer holding the E820 header followed by its entries.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, E820Error> {
        let (header, rest) = E820Header::ref_from_prefix(bytes).map_err(|_| E820Error::Truncated)?;
        let count = Self::validate_header(header)?;
        let (entries, _) =
            <[E820Entry]>::ref_from_prefix_with_elems(rest, count).map_err(|_| E820Error::Truncated)?;
        Ok(Self { entries })
    }

    /// Reads the E820 table at `address` out of guest memory.
    pub fn from_memory<M: PhysicalMemory + ?Sized>(memory: &'a M, address: u64) -> Result<Self, E820Error> {
        let header_bytes = memory.bytes(address, mem::size_of::<E820Header>()).ok_or(E820Error::Truncated)?;
        let header = E820Header::ref_from_bytes(header_bytes).map_err(|_| E820Error::Truncated)?;
        let count = Self::validate_header(header)?;

        let length = count
            .checked_mul(mem::size_of::<E820Entry>())
            .and_then(|entries| entries.checked_add(mem::size_of::<E820Header>()))
            .ok_or(E820Error::Truncated)?;
        Self::parse(memory.bytes(address, length).ok_or(E820Error::Truncated)?)
    }

    fn validate_header(header: &E820Header) -> Result<usize, E820Error> {
        if &header.signature[..3] != E820_SIGNATURE {
            return Err(E820Error::InvalidSignature);
        }
        match header.entry_count.get() {
            0 => Err(E820Error::Empty),
            count => Ok(count as usize),
        }
    }

    pub fn entries(&self) -> &'a [E820Entry] {
        self.entries
    }

    /// Returns the first address past the highest entry if that address is at or above 4 GiB.
    pub fn first_non_address(&self) -> Result<u64, E820Error> {
        let highest = self.entries.iter().map(E820Entry::end).max().ok_or(E820Error::Empty)?;
        if highest >= BASE_4GB { Ok(highest) } else { Err(E820Error::NotFound) }
    }

    /// Finds the 64-bit PCI host aperture: the first reserved entry based at or above 4 GiB.
    pub fn pci_mmio64_aperture(&self) -> Result<PciAperture, E820Error> {
        self.entries
            .iter()
            .find(|entry| entry.is_pci64_aperture())
            .map(|entry| PciAperture { base: entry.base_address(), size: entry.length() })
            .ok_or(E820Error::NotFound)
    }

    /// Top of RAM below 4 GiB, measured from address zero.
    pub fn low_memory_size(&self) -> u64 {
        self.ram()
            .filter(|entry| entry.base_address() < BASE_4GB)
            .map(|entry| entry.end().min(BASE_4GB))
            .max()
            .unwrap_or(0)
    }

    /// Total RAM at or above 4 GiB, including the part of an entry that straddles the boundary.
    pub fn high_memory_size(&self) -> u64 {
        self.ram()
            .filter(|entry| entry.end() > BASE_4GB)
            .map(|entry| entry.end() - entry.base_address().max(BASE_4GB))
            .sum()
    }

    pub fn summary(&self) -> E820Summary {
        E820Summary {
            low_memory_size: self.low_memory_size(),
            high_memory_size: self.high_memory_size(),
            first_non_address: self.first_non_address().ok(),
            pci64_aperture: self.pci_mmio64_aperture().ok(),
        }
    }

    /// Publishes one resource descriptor per RAM range and per high reserved (PCI aperture) range,
    /// and makes each RAM range write-back cacheable when the processor has MTRRs.
    ///
    /// Every other range type is left out of the resource map. Returns the number of descriptors
    /// handed to `publisher`.
    pub fn publish_ram_regions<P, C>(&self, publisher: &mut P, caching: &mut C) -> usize
    where
        P: ResourcePublisher + ?Sized,
        C: MemoryCaching + ?Sized,
    {
        let mtrr_supported = caching.is_supported();
        let mut published = 0;
        for entry in self.entries {
            if entry.is_pci64_aperture() {
                // The PCI host bridge does not add this window to the GCD on its own.
                log::debug!("E820 64-bit PCI aperture {:#x}..{:#x}", entry.base_address(), entry.end());
                publisher.add_io_memory(entry.base_address(), entry.length());
            } else if entry.memory_type() == E820Type::Memory {
                log::debug!("E820 RAM {:#x}..{:#x}", entry.base_address(), entry.end());
                publisher.add_memory(entry.base_address(), entry.length());
                if mtrr_supported {
                    if let Err(error) = caching.set_write_back(entry.base_address(), entry.length()) {
                        log::warn!("Unable to make {:?} write-back: {:?}", entry, error);
                    }
                }
            } else {
                log::trace!("E820 skipping {:?}", entry);
                continue;
            }
            published += 1;
        }
        published
    }

    fn ram(&self) -> impl Iterator<Item = &'a E820Entry> + 'a {
        self.entries.iter().filter(|entry| entry.memory_type() == E820Type::Memory)
    }
}

/// Reads the ACRN memory map from its fixed address and publishes the guest RAM layout.
pub fn publish_acrn_memory<M, P, C>(mem: &M, publisher: &mut P, caching: &mut C) -> Result<E820Summary, E820Error>
where
    M: PhysicalMemory + ?Sized,
    P: ResourcePublisher + ?Sized,
    C: MemoryCaching + ?Sized,
{
    let map = AcrnE820Map::from_memory(mem, ACRN_E820_PHYSICAL_ADDRESS)?;
    log::info!("Using memory map provided by ACRN");

    let published = map.publish_ram_regions(publisher, caching);
    let summary = map.summary();
    log::info!(
        "ACRN E820: {} entries, {} resources, low {:#x}, high {:#x}",
        map.entries().len(),
        published,
        summary.low_memory_size,
        summary.high_memory_size
    );
    Ok(summary)
}
