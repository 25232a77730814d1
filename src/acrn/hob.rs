//! Resource Descriptor HOBs
//!
//! The pre-DXE phase tells the DXE core about guest memory through PI resource descriptor HOBs.
//! [`HobListBuilder`] lays those descriptors out as a HOB list; [`resource_descriptors`] reads
//! them back through [`patina::pi::hob::HobList`], the same walker the DXE core uses.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::vec::Vec;
use core::{ffi::c_void, mem, slice};

use patina::{
    BinaryGuid,
    pi::hob::{
        self, EFI_RESOURCE_ATTRIBUTE_UNCACHEABLE, EFI_RESOURCE_ATTRIBUTE_WRITE_BACK_CACHEABLE,
        EFI_RESOURCE_ATTRIBUTE_WRITE_COMBINEABLE, EFI_RESOURCE_ATTRIBUTE_WRITE_THROUGH_CACHEABLE, Hob, HobList,
        ResourceDescriptor, header,
    },
};

pub use patina::pi::hob::{EFI_RESOURCE_MEMORY_MAPPED_IO, EFI_RESOURCE_SYSTEM_MEMORY};

/// Attributes of tested, fully cacheable guest RAM.
pub const SYSTEM_MEMORY_ATTRIBUTES: u32 = hob::TESTED_MEMORY_ATTRIBUTES
    | EFI_RESOURCE_ATTRIBUTE_UNCACHEABLE
    | EFI_RESOURCE_ATTRIBUTE_WRITE_COMBINEABLE
    | EFI_RESOURCE_ATTRIBUTE_WRITE_THROUGH_CACHEABLE
    | EFI_RESOURCE_ATTRIBUTE_WRITE_BACK_CACHEABLE;

/// Attributes of an uncached MMIO window.
pub const MMIO_ATTRIBUTES: u32 = hob::TESTED_MEMORY_ATTRIBUTES | EFI_RESOURCE_ATTRIBUTE_UNCACHEABLE;

const END_OF_HOB_LIST: header::Hob =
    header::Hob { r#type: hob::END_OF_HOB_LIST, length: mem::size_of::<header::Hob>() as u16, reserved: 0 };

/// Sink for the memory ranges discovered before DXE.
pub trait ResourcePublisher {
    /// Publishes a range of system memory.
    fn add_memory(&mut self, base: u64, length: u64);

    /// Publishes a range of memory-mapped I/O.
    fn add_io_memory(&mut self, base: u64, length: u64);
}

/// A resource descriptor HOB with no owner.
pub fn resource_descriptor(
    resource_type: u32,
    resource_attribute: u32,
    physical_start: u64,
    resource_length: u64,
) -> ResourceDescriptor {
    ResourceDescriptor {
        header: header::Hob {
            r#type: hob::RESOURCE_DESCRIPTOR,
            length: mem::size_of::<ResourceDescriptor>() as u16,
            reserved: 0,
        },
        owner: BinaryGuid::from_fields(0, 0, 0, 0, 0, &[0; 6]),
        resource_type,
        resource_attribute,
        physical_start,
        resource_length,
    }
}

/// Accumulates resource descriptor HOBs.
#[derive(Debug, Default)]
pub struct HobListBuilder {
    resources: Vec<ResourceDescriptor>,
}

impl HobListBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_resource(&mut self, descriptor: ResourceDescriptor) {
        self.resources.push(descriptor);
    }

    pub fn resources(&self) -> &[ResourceDescriptor] {
        &self.resources
    }

    /// Lays the descriptors out back to back and terminates them with an end-of-HOB-list HOB.
    pub fn finish(self) -> PiHobList {
        let length = self.resources.len() * mem::size_of::<ResourceDescriptor>() + mem::size_of::<header::Hob>();
        let mut bytes = Vec::with_capacity(length);
        for descriptor in &self.resources {
            bytes.extend_from_slice(hob_bytes(descriptor));
        }
        bytes.extend_from_slice(hob_bytes(&END_OF_HOB_LIST));

        // HOBs are 8-byte aligned; both HOB sizes are multiples of 8.
        let words = bytes.chunks_exact(mem::size_of::<u64>()).map(|word| {
            let mut value = [0u8; 8];
            value.copy_from_slice(word);
            u64::from_ne_bytes(value)
        });
        PiHobList { words: words.collect() }
    }
}

impl ResourcePublisher for HobListBuilder {
    fn add_memory(&mut self, base: u64, length: u64) {
        self.add_resource(resource_descriptor(EFI_RESOURCE_SYSTEM_MEMORY, SYSTEM_MEMORY_ATTRIBUTES, base, length));
    }

    fn add_io_memory(&mut self, base: u64, length: u64) {
        self.add_resource(resource_descriptor(EFI_RESOURCE_MEMORY_MAPPED_IO, MMIO_ATTRIBUTES, base, length));
    }
}

fn hob_bytes<T: Copy>(hob: &T) -> &[u8] {
    // SAFETY: only called with the padding-free `repr(C)` HOB structures above.
    unsafe { slice::from_raw_parts(hob as *const T as *const u8, mem::size_of::<T>()) }
}

/// An owned, terminated HOB list.
#[derive(Debug)]
pub struct PiHobList {
    words: Vec<u64>,
}

impl PiHobList {
    pub fn as_ptr(&self) -> *const c_void {
        self.words.as_ptr() as *const c_void
    }

    pub fn len(&self) -> usize {
        self.words.len() * mem::size_of::<u64>()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Parses the list the way the DXE core does at hand-off.
    pub fn hob_list(&self) -> HobList<'_> {
        let mut list = HobList::new();
        list.discover_hobs(self.as_ptr());
        list
    }
}

/// Iterates the resource descriptors of `hob_list`, skipping every other HOB type.
pub fn resource_descriptors<'a>(hob_list: &'a HobList<'a>) -> impl Iterator<Item = ResourceDescriptor> + 'a {
    hob_list.iter().filter_map(|hob| match hob {
        Hob::ResourceDescriptor(descriptor) => Some(**descriptor),
        _ => None,
    })
}
