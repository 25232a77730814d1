//! Platform GOP Policy
//!
//! Graphics drivers that need the Video BIOS Table get it through the Platform GOP Policy
//! protocol. The VBT ships as the RAW section of a dedicated firmware file. Firmware volumes can
//! be dispatched after the protocol is installed, so a miss is retried on the next request; the
//! first hit is kept.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::{boxed::Box, vec::Vec};
use core::{ffi::c_void, ptr};

use patina::pi::{fw_fs::ffs::section::raw_type, protocols::firmware_volume};
use r_efi::efi;
use spin::{Mutex, Once};

use crate::boot_services::PlatformBootServices;

/// Firmware file carrying the Video BIOS Table.
pub const VBT_ROM_FILE_GUID: efi::Guid =
    efi::Guid::from_fields(0x1647b4f3, 0x3e8a, 0x4fef, 0x81, 0xc8, &[0x32, 0x8e, 0xd6, 0x47, 0xab, 0x1a]);

pub const PLATFORM_GOP_POLICY_PROTOCOL_REVISION_01: u32 = 0x01;

pub type LidStatus = u32;
pub const LID_CLOSED: LidStatus = 0;
pub const LID_OPEN: LidStatus = 1;

pub type GetPlatformLidStatus = extern "efiapi" fn(current_lid_status: *mut LidStatus) -> efi::Status;
pub type GetVbtData = extern "efiapi" fn(vbt_address: *mut efi::PhysicalAddress, vbt_size: *mut u32) -> efi::Status;

#[repr(C)]
pub struct PlatformGopPolicyProtocol {
    pub revision: u32,
    pub get_platform_lid_status: GetPlatformLidStatus,
    pub get_vbt_data: GetVbtData,
}

impl PlatformGopPolicyProtocol {
    pub const GUID: efi::Guid =
        efi::Guid::from_fields(0xec2e931b, 0x3281, 0x48a5, 0x81, 0x07, &[0xdf, 0x8a, 0x8b, 0xed, 0x3c, 0x5d]);

    pub fn new() -> Self {
        Self {
            revision: PLATFORM_GOP_POLICY_PROTOCOL_REVISION_01,
            get_platform_lid_status: get_platform_lid_status,
            get_vbt_data: get_vbt_data,
        }
    }
}

impl Default for PlatformGopPolicyProtocol {
    fn default() -> Self {
        Self::new()
    }
}

/// Location of the Video BIOS Table in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vbt {
    pub address: efi::PhysicalAddress,
    pub size: u32,
}

/// Source of firmware file sections.
pub trait SectionReader {
    /// Returns the address and size of the first RAW section of `file`.
    fn read_raw_section(&self, file: &efi::Guid) -> Result<(u64, usize), efi::Status>;
}

/// A firmware volume reached through its FV2 protocol.
pub struct Fv2Volume {
    protocol: *const firmware_volume::Protocol,
}

impl Fv2Volume {
    /// ## Safety
    ///
    /// `protocol` must point at a Firmware Volume2 protocol instance.
    pub unsafe fn new(protocol: *const firmware_volume::Protocol) -> Self {
        Self { protocol }
    }
}

impl SectionReader for Fv2Volume {
    fn read_raw_section(&self, file: &efi::Guid) -> Result<(u64, usize), efi::Status> {
        let mut buffer: *mut c_void = ptr::null_mut();
        let mut size = 0usize;
        let mut authentication_status = 0u32;
        // SAFETY: guaranteed by the constructor contract.
        let read_section = unsafe { (*self.protocol).read_section };
        let status =
            read_section(self.protocol, file, raw_type::RAW, 0, &mut buffer, &mut size, &mut authentication_status);
        if status.is_error() {
            return Err(status);
        }
        if buffer.is_null() {
            return Err(efi::Status::NOT_FOUND);
        }
        Ok((buffer as u64, size))
    }
}

/// Returns the first VBT found across `volumes`.
pub fn find_vbt<R: SectionReader>(volumes: &[R]) -> Option<Vbt> {
    volumes.iter().find_map(|volume| match volume.read_raw_section(&VBT_ROM_FILE_GUID) {
        Ok((address, size)) => match u32::try_from(size) {
            Ok(size) => Some(Vbt { address, size }),
            Err(_) => {
                log::warn!("Ignoring VBT of {:#x} bytes", size);
                None
            }
        },
        Err(_) => None,
    })
}

/// Searches every firmware volume in the handle database for the VBT.
pub fn locate_vbt<S: PlatformBootServices + ?Sized>(services: &S) -> Option<Vbt> {
    let handles = services
        .locate_handles(&firmware_volume::PROTOCOL_GUID)
        .inspect_err(|status| log::warn!("No firmware volumes to search for the VBT: {:?}", status))
        .ok()?;
    let volumes: Vec<Fv2Volume> = handles
        .iter()
        .filter_map(|handle| services.handle_protocol(*handle, &firmware_volume::PROTOCOL_GUID).ok())
        .filter(|protocol| !protocol.is_null())
        // SAFETY: the interfaces were installed for the FV2 protocol GUID.
        .map(|protocol| unsafe { Fv2Volume::new(protocol as *const firmware_volume::Protocol) })
        .collect();
    let vbt = find_vbt(&volumes);
    match vbt {
        Some(vbt) => log::info!("VBT at {:#x}, {} bytes", vbt.address, vbt.size),
        None => log::warn!("VBT not found in {} firmware volumes", volumes.len()),
    }
    vbt
}

type VbtLocator = Box<dyn Fn() -> Option<Vbt> + Send + Sync>;

/// Remembers the first VBT `locate` finds; until then every request searches again.
pub struct VbtCache<F> {
    found: Mutex<Option<Vbt>>,
    locate: F,
}

impl<F: Fn() -> Option<Vbt>> VbtCache<F> {
    pub const fn new(locate: F) -> Self {
        Self { found: Mutex::new(None), locate }
    }

    pub fn get(&self) -> Option<Vbt> {
        let mut found = self.found.lock();
        if found.is_none() {
            *found = (self.locate)();
        }
        *found
    }
}

static VBT: Once<VbtCache<VbtLocator>> = Once::new();

/// Installs the policy protocol on a new handle. The VBT is searched for through `services` when a
/// graphics driver first asks for it.
pub fn install_gop_policy<S: PlatformBootServices + Sync>(services: &'static S) -> Result<efi::Handle, efi::Status> {
    VBT.call_once(|| VbtCache::new(Box::new(move || locate_vbt(services))));
    let protocol = Box::leak(Box::new(PlatformGopPolicyProtocol::new()));
    services.install_protocol(
        None,
        &PlatformGopPolicyProtocol::GUID,
        protocol as *mut PlatformGopPolicyProtocol as *mut c_void,
    )
}

extern "efiapi" fn get_platform_lid_status(_current_lid_status: *mut LidStatus) -> efi::Status {
    efi::Status::UNSUPPORTED
}

extern "efiapi" fn get_vbt_data(vbt_address: *mut efi::PhysicalAddress, vbt_size: *mut u32) -> efi::Status {
    report_vbt(VBT.get().and_then(|cache| cache.get()), vbt_address, vbt_size)
}

fn report_vbt(vbt: Option<Vbt>, vbt_address: *mut efi::PhysicalAddress, vbt_size: *mut u32) -> efi::Status {
    if vbt_address.is_null() || vbt_size.is_null() {
        return efi::Status::INVALID_PARAMETER;
    }
    let Some(vbt) = vbt else {
        return efi::Status::NOT_FOUND;
    };
    // SAFETY: both pointers were checked for null above.
    unsafe {
        vbt_address.write(vbt.address);
        vbt_size.write(vbt.size);
    }
    efi::Status::SUCCESS
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::vec;

    use super::*;
    use crate::boot_services::MockPlatformBootServices;

    static VBT_BLOB: [u8; 16] = *b"$VBT SKYLAKE    ";

    struct FakeVolume(Result<(u64, usize), efi::Status>);

    impl SectionReader for FakeVolume {
        fn read_raw_section(&self, file: &efi::Guid) -> Result<(u64, usize), efi::Status> {
            assert_eq!(*file, VBT_ROM_FILE_GUID);
            self.0
        }
    }

    #[test]
    fn first_volume_with_the_file_wins() {
        let volumes = [
            FakeVolume(Err(efi::Status::NOT_FOUND)),
            FakeVolume(Ok((0x1000, 0x200))),
            FakeVolume(Ok((0x2000, 0x300))),
        ];
        assert_eq!(find_vbt(&volumes), Some(Vbt { address: 0x1000, size: 0x200 }));
        assert_eq!(find_vbt(&volumes[..1]), None);
        assert_eq!(find_vbt::<FakeVolume>(&[]), None);
    }

    extern "efiapi" fn missing_section(
        _this: *const firmware_volume::Protocol,
        _name_guid: *const efi::Guid,
        _section_type: u8,
        _section_instance: usize,
        _buffer: *mut *mut c_void,
        _buffer_size: *mut usize,
        _authentication_status: *mut u32,
    ) -> efi::Status {
        efi::Status::NOT_FOUND
    }

    extern "efiapi" fn vbt_section(
        _this: *const firmware_volume::Protocol,
        name_guid: *const efi::Guid,
        section_type: u8,
        section_instance: usize,
        buffer: *mut *mut c_void,
        buffer_size: *mut usize,
        _authentication_status: *mut u32,
    ) -> efi::Status {
        if unsafe { *name_guid } != VBT_ROM_FILE_GUID || section_type != raw_type::RAW || section_instance != 0 {
            return efi::Status::NOT_FOUND;
        }
        unsafe {
            buffer.write(VBT_BLOB.as_ptr() as *mut c_void);
            buffer_size.write(VBT_BLOB.len());
        }
        efi::Status::SUCCESS
    }

    fn volume(read_section: firmware_volume::ReadSection) -> usize {
        extern "efiapi" fn volume_attributes(_: *const firmware_volume::Protocol, _: *mut u64) -> efi::Status {
            efi::Status::UNSUPPORTED
        }
        extern "efiapi" fn read_file(
            _: *const firmware_volume::Protocol,
            _: *const efi::Guid,
            _: *mut *mut c_void,
            _: *mut usize,
            _: *mut u8,
            _: *mut u32,
            _: *mut u32,
        ) -> efi::Status {
            efi::Status::UNSUPPORTED
        }
        extern "efiapi" fn write_file(
            _: *const firmware_volume::Protocol,
            _: u32,
            _: firmware_volume::EfiFvWritePolicy,
            _: *mut firmware_volume::EfiFvWriteFileData,
        ) -> efi::Status {
            efi::Status::UNSUPPORTED
        }
        extern "efiapi" fn get_next_file(
            _: *const firmware_volume::Protocol,
            _: *mut c_void,
            _: *mut u8,
            _: *mut efi::Guid,
            _: *mut u32,
            _: *mut usize,
        ) -> efi::Status {
            efi::Status::UNSUPPORTED
        }
        extern "efiapi" fn get_info(
            _: *const firmware_volume::Protocol,
            _: *const efi::Guid,
            _: *mut usize,
            _: *mut c_void,
        ) -> efi::Status {
            efi::Status::UNSUPPORTED
        }
        extern "efiapi" fn set_info(
            _: *const firmware_volume::Protocol,
            _: *const efi::Guid,
            _: usize,
            _: *const c_void,
        ) -> efi::Status {
            efi::Status::UNSUPPORTED
        }

        Box::leak(Box::new(firmware_volume::Protocol {
            get_volume_attributes: volume_attributes,
            set_volume_attributes: volume_attributes,
            read_file,
            read_section,
            write_file,
            get_next_file,
            key_size: 8,
            parent_handle: ptr::null_mut(),
            get_info,
            set_info,
        })) as *const firmware_volume::Protocol as usize
    }

    #[test]
    fn locate_vbt_reads_the_raw_section_of_each_volume() {
        let volumes = [volume(missing_section), volume(vbt_section)];
        let mut services = MockPlatformBootServices::new();
        services
            .expect_locate_handles()
            .withf(|guid| *guid == *firmware_volume::PROTOCOL_GUID)
            .returning(|_| Ok(vec![1 as efi::Handle, 2 as efi::Handle]));
        services
            .expect_handle_protocol()
            .returning(move |handle, _| Ok(volumes[handle as usize - 1] as *mut c_void));

        let vbt = locate_vbt(&services);
        assert_eq!(vbt, Some(Vbt { address: VBT_BLOB.as_ptr() as u64, size: 16 }));
    }

    #[test]
    fn locate_vbt_without_volumes_finds_nothing() {
        let mut services = MockPlatformBootServices::new();
        services.expect_locate_handles().returning(|_| Err(efi::Status::NOT_FOUND));
        assert_eq!(locate_vbt(&services), None);
    }

    #[test]
    fn vbt_data_reports_address_and_size() {
        let (mut address, mut size) = (0u64, 0u32);
        let vbt = Some(Vbt { address: 0xFFC0_0000, size: 0x1800 });

        assert_eq!(report_vbt(vbt, &mut address, &mut size), efi::Status::SUCCESS);
        assert_eq!((address, size), (0xFFC0_0000, 0x1800));
        assert_eq!(report_vbt(None, &mut address, &mut size), efi::Status::NOT_FOUND);
        assert_eq!(report_vbt(vbt, ptr::null_mut(), &mut size), efi::Status::INVALID_PARAMETER);
        assert_eq!(report_vbt(vbt, &mut address, ptr::null_mut()), efi::Status::INVALID_PARAMETER);
    }

    #[test]
    fn vbt_miss_is_retried_and_hit_is_kept() {
        let lookups = AtomicUsize::new(0);
        let cache = VbtCache::new(|| match lookups.fetch_add(1, Ordering::SeqCst) {
            0 => None,
            _ => Some(Vbt { address: 0xFFC0_0000, size: 0x1800 }),
        });

        assert_eq!(cache.get(), None);
        assert_eq!(cache.get(), Some(Vbt { address: 0xFFC0_0000, size: 0x1800 }));
        assert_eq!(cache.get(), Some(Vbt { address: 0xFFC0_0000, size: 0x1800 }));
        assert_eq!(lookups.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn policy_protocol_is_installed_on_a_new_handle() {
        let mut services = MockPlatformBootServices::new();
        services
            .expect_install_protocol()
            .withf(|handle, guid, _| handle.is_none() && *guid == PlatformGopPolicyProtocol::GUID)
            .returning(|_, _, interface| {
                let protocol = unsafe { &*(interface as *const PlatformGopPolicyProtocol) };
                assert_eq!(protocol.revision, PLATFORM_GOP_POLICY_PROTOCOL_REVISION_01);
                let mut lid = LID_OPEN;
                assert_eq!((protocol.get_platform_lid_status)(&mut lid), efi::Status::UNSUPPORTED);
                Ok(0x4000 as efi::Handle)
            });
        // Firmware volumes are searched on each request until the VBT turns up.
        services.expect_locate_handles().returning(|_| Err(efi::Status::NOT_FOUND));

        let handle = install_gop_policy(Box::leak(Box::new(services))).unwrap();
        assert_eq!(handle as usize, 0x4000);

        let (mut address, mut size) = (0u64, 0u32);
        assert_eq!(get_vbt_data(&mut address, &mut size), efi::Status::NOT_FOUND);
        assert_eq!(get_vbt_data(&mut address, &mut size), efi::Status::NOT_FOUND);
    }
}
