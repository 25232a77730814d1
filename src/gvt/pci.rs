//! PCI I/O Protocol Access
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use core::ffi::c_void;

use r_efi::efi;

use super::interface::GvtMmio;

/// `EFI_PCI_IO_PROTOCOL_WIDTH`
pub type PciIoWidth = u32;
pub const PCI_IO_WIDTH_UINT32: PciIoWidth = 2;

pub const GVT_MMIO_BAR: u8 = 0;

pub type PciIoMemFn = extern "efiapi" fn(
    this: *mut PciIoProtocol,
    width: PciIoWidth,
    bar_index: u8,
    offset: u64,
    count: usize,
    buffer: *mut c_void,
) -> efi::Status;

pub type PciIoConfigFn = extern "efiapi" fn(
    this: *mut PciIoProtocol,
    width: PciIoWidth,
    offset: u32,
    count: usize,
    buffer: *mut c_void,
) -> efi::Status;

#[repr(C)]
pub struct PciIoMemAccess {
    pub read: PciIoMemFn,
    pub write: PciIoMemFn,
}

#[repr(C)]
pub struct PciIoConfigAccess {
    pub read: PciIoConfigFn,
    pub write: PciIoConfigFn,
}

#[repr(C)]
pub struct PciIoIoAccess {
    pub read: *const c_void,
    pub write: *const c_void,
}

/// `EFI_PCI_IO_PROTOCOL`. Only the members this driver calls are typed.
#[repr(C)]
pub struct PciIoProtocol {
    pub poll_mem: *const c_void,
    pub poll_io: *const c_void,
    pub mem: PciIoMemAccess,
    pub io: PciIoIoAccess,
    pub pci: PciIoConfigAccess,
    pub copy_mem: *const c_void,
    pub map: *const c_void,
    pub unmap: *const c_void,
    pub allocate_buffer: *const c_void,
    pub free_buffer: *const c_void,
    pub flush: *const c_void,
    pub get_location: *const c_void,
    pub attributes: *const c_void,
    pub get_bar_attributes: *const c_void,
    pub set_bar_attributes: *const c_void,
    pub rom_size: u64,
    pub rom_image: *mut c_void,
}

impl PciIoProtocol {
    pub const GUID: efi::Guid =
        efi::Guid::from_fields(0x4cf5b200, 0x68b8, 0x4ca5, 0x9e, 0xec, &[0xb2, 0x3e, 0x3f, 0x50, 0x02, 0x9a]);
}

/// GVT-g register access through an opened PCI I/O protocol instance.
pub struct PciIoMmio {
    protocol: *mut PciIoProtocol,
}

impl PciIoMmio {
    /// ## Safety
    ///
    /// `protocol` must point at a PCI I/O protocol instance that stays open while this value lives.
    pub unsafe fn new(protocol: *mut PciIoProtocol) -> Self {
        Self { protocol }
    }

    fn protocol(&self) -> &PciIoProtocol {
        // SAFETY: guaranteed by the constructor contract.
        unsafe { &*self.protocol }
    }
}

impl GvtMmio for PciIoMmio {
    fn read_config32(&self, offset: u32) -> Result<u32, efi::Status> {
        let mut value = 0u32;
        let status =
            (self.protocol().pci.read)(self.protocol, PCI_IO_WIDTH_UINT32, offset, 1, &mut value as *mut u32 as *mut c_void);
        if status.is_error() { Err(status) } else { Ok(value) }
    }

    fn read_mmio32(&self, offset: u64) -> Result<u32, efi::Status> {
        let mut value = 0u32;
        let status = (self.protocol().mem.read)(
            self.protocol,
            PCI_IO_WIDTH_UINT32,
            GVT_MMIO_BAR,
            offset,
            1,
            &mut value as *mut u32 as *mut c_void,
        );
        if status.is_error() { Err(status) } else { Ok(value) }
    }

    fn write_mmio32(&self, offset: u64, value: u32) -> Result<(), efi::Status> {
        let mut value = value;
        let status = (self.protocol().mem.write)(
            self.protocol,
            PCI_IO_WIDTH_UINT32,
            GVT_MMIO_BAR,
            offset,
            1,
            &mut value as *mut u32 as *mut c_void,
        );
        if status.is_error() { Err(status) } else { Ok(()) }
    }
}

/// Builds register access from the interface pointer returned when opening the PCI I/O protocol.
pub trait PciBinding: GvtMmio + Sized {
    /// ## Safety
    ///
    /// `interface` must be the PCI I/O protocol interface of an open controller, valid until the
    /// returned value is dropped.
    unsafe fn bind(interface: *mut c_void) -> Self;
}

impl PciBinding for PciIoMmio {
    unsafe fn bind(interface: *mut c_void) -> Self {
        // SAFETY: forwarded from the caller.
        unsafe { Self::new(interface as *mut PciIoProtocol) }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::ptr;
    use std::{boxed::Box, collections::BTreeMap, sync::Mutex};

    use super::*;

    static BAR0: Mutex<BTreeMap<u64, u32>> = Mutex::new(BTreeMap::new());

    extern "efiapi" fn mem_read(
        _this: *mut PciIoProtocol,
        width: PciIoWidth,
        bar_index: u8,
        offset: u64,
        _count: usize,
        buffer: *mut c_void,
    ) -> efi::Status {
        if width != PCI_IO_WIDTH_UINT32 || bar_index != GVT_MMIO_BAR {
            return efi::Status::INVALID_PARAMETER;
        }
        let value = BAR0.lock().unwrap().get(&offset).copied().unwrap_or(0);
        unsafe { (buffer as *mut u32).write(value) };
        efi::Status::SUCCESS
    }

    extern "efiapi" fn mem_write(
        _this: *mut PciIoProtocol,
        _width: PciIoWidth,
        _bar_index: u8,
        offset: u64,
        _count: usize,
        buffer: *mut c_void,
    ) -> efi::Status {
        BAR0.lock().unwrap().insert(offset, unsafe { (buffer as *const u32).read() });
        efi::Status::SUCCESS
    }

    extern "efiapi" fn config_read(
        _this: *mut PciIoProtocol,
        _width: PciIoWidth,
        offset: u32,
        _count: usize,
        buffer: *mut c_void,
    ) -> efi::Status {
        if offset != 0 {
            return efi::Status::DEVICE_ERROR;
        }
        unsafe { (buffer as *mut u32).write(0x5912_8086) };
        efi::Status::SUCCESS
    }

    fn protocol() -> Box<PciIoProtocol> {
        Box::new(PciIoProtocol {
            poll_mem: ptr::null(),
            poll_io: ptr::null(),
            mem: PciIoMemAccess { read: mem_read, write: mem_write },
            io: PciIoIoAccess { read: ptr::null(), write: ptr::null() },
            pci: PciIoConfigAccess { read: config_read, write: config_read },
            copy_mem: ptr::null(),
            map: ptr::null(),
            unmap: ptr::null(),
            allocate_buffer: ptr::null(),
            free_buffer: ptr::null(),
            flush: ptr::null(),
            get_location: ptr::null(),
            attributes: ptr::null(),
            get_bar_attributes: ptr::null(),
            set_bar_attributes: ptr::null(),
            rom_size: 0,
            rom_image: ptr::null_mut(),
        })
    }

    #[test]
    fn mmio_goes_through_bar0() {
        let mut protocol = protocol();
        let mmio = unsafe { PciIoMmio::bind(protocol.as_mut() as *mut PciIoProtocol as *mut c_void) };

        mmio.write_mmio32(0x78818, 8).unwrap();
        assert_eq!(mmio.read_mmio32(0x78818), Ok(8));
        assert_eq!(mmio.read_mmio32(0x78000), Ok(0));
    }

    #[test]
    fn config_errors_are_propagated() {
        let mut protocol = protocol();
        let mmio = unsafe { PciIoMmio::new(protocol.as_mut()) };

        assert_eq!(mmio.read_config32(0), Ok(0x5912_8086));
        assert_eq!(mmio.read_config32(8), Err(efi::Status::DEVICE_ERROR));
    }
}
