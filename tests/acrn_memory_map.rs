//! Publishes an ACRN E820 table into a HOB list and reads the resource map back.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use hypervisor_resources::{
    acrn::{
        e820::{ACRN_E820_PHYSICAL_ADDRESS, E820Entry, E820Error, publish_acrn_memory},
        hob::{
            EFI_RESOURCE_MEMORY_MAPPED_IO, EFI_RESOURCE_SYSTEM_MEMORY, HobListBuilder, MMIO_ATTRIBUTES,
            SYSTEM_MEMORY_ATTRIBUTES, resource_descriptors,
        },
        mtrr::MemoryCaching,
    },
    memory::PhysicalMemory,
};
use patina_mtrr::error::MtrrError;
use zerocopy::IntoBytes;

#[derive(Default)]
struct WriteBackRanges(Vec<(u64, u64)>);

impl MemoryCaching for WriteBackRanges {
    fn is_supported(&self) -> bool {
        true
    }

    fn set_write_back(&mut self, base: u64, length: u64) -> Result<(), MtrrError> {
        self.0.push((base, length));
        Ok(())
    }
}

struct GuestPage {
    base: u64,
    bytes: Vec<u8>,
}

impl PhysicalMemory for GuestPage {
    fn bytes(&self, address: u64, length: usize) -> Option<&[u8]> {
        let offset = usize::try_from(address.checked_sub(self.base)?).ok()?;
        self.bytes.get(offset..offset.checked_add(length)?)
    }
}

fn e820_page(entries: &[(u64, u64, u32)]) -> GuestPage {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(b"820\0");
    bytes.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for &(base, length, kind) in entries {
        bytes.extend_from_slice(E820Entry::new(base, length, kind).as_bytes());
    }
    bytes.resize(0x1000, 0);
    GuestPage { base: ACRN_E820_PHYSICAL_ADDRESS, bytes }
}

#[test]
fn acrn_e820_becomes_resource_descriptors() {
    let page = e820_page(&[
        (0x0, 0xA_0000, 1),
        (0xA_0000, 0x6_0000, 2),
        (0x10_0000, 0x3FF0_0000, 1),
        (0x4000_0000, 0x10_0000, 4),
        (0x1_0000_0000, 0x4000_0000, 1),
        (0x40_0000_0000, 0x40_0000_0000, 2),
    ]);

    let mut builder = HobListBuilder::new();
    let mut write_back = WriteBackRanges::default();
    let summary = publish_acrn_memory(&page, &mut builder, &mut write_back).unwrap();
    let hob_list = builder.finish();

    let hobs = hob_list.hob_list();
    let resources: Vec<_> = resource_descriptors(&hobs)
        .map(|r| (r.resource_type, r.resource_attribute, r.physical_start, r.resource_length))
        .collect();
    assert_eq!(
        resources,
        vec![
            (EFI_RESOURCE_SYSTEM_MEMORY, SYSTEM_MEMORY_ATTRIBUTES, 0x0, 0xA_0000),
            (EFI_RESOURCE_SYSTEM_MEMORY, SYSTEM_MEMORY_ATTRIBUTES, 0x10_0000, 0x3FF0_0000),
            (EFI_RESOURCE_SYSTEM_MEMORY, SYSTEM_MEMORY_ATTRIBUTES, 0x1_0000_0000, 0x4000_0000),
            (EFI_RESOURCE_MEMORY_MAPPED_IO, MMIO_ATTRIBUTES, 0x40_0000_0000, 0x40_0000_0000),
        ]
    );

    assert_eq!(summary.low_memory_size, 0x4000_0000);
    assert_eq!(summary.high_memory_size, 0x4000_0000);
    assert_eq!(summary.first_non_address, Some(0x80_0000_0000));
    assert_eq!(write_back.0, [(0x0, 0xA_0000), (0x10_0000, 0x3FF0_0000), (0x1_0000_0000, 0x4000_0000)]);
}

#[test]
fn missing_e820_publishes_nothing() {
    let page = GuestPage { base: ACRN_E820_PHYSICAL_ADDRESS, bytes: vec![0; 0x1000] };
    let mut builder = HobListBuilder::new();
    let mut write_back = WriteBackRanges::default();

    assert_eq!(publish_acrn_memory(&page, &mut builder, &mut write_back).err(), Some(E820Error::InvalidSignature));
    assert_eq!(resource_descriptors(&builder.finish().hob_list()).count(), 0);
    assert!(write_back.0.is_empty());
}
