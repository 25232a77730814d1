//! Boot Services Seam
//!
//! The drivers in this crate need a small slice of the UEFI boot services: TPL control, protocol
//! installation and lookup, driver-model open/close, and pool memory. [`PlatformBootServices`]
//! names that slice so the driver logic can be exercised with a mock, and is implemented for
//! Patina's [`StandardBootServices`].
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::vec::Vec;
use core::ffi::c_void;

use patina::{
    boot_services::{BootServices, StandardBootServices, protocol_handler::HandleSearchType, tpl::Tpl},
    efi_types::EfiMemoryType,
};
use r_efi::efi;

#[cfg(test)]
use mockall::automock;

/// Boot services used by the hypervisor platform drivers.
#[cfg_attr(test, automock)]
pub trait PlatformBootServices {
    /// Raises the task priority level, returning the previous level.
    fn raise_tpl(&self, tpl: efi::Tpl) -> efi::Tpl;

    /// Restores a task priority level previously returned by [`Self::raise_tpl`].
    fn restore_tpl(&self, tpl: efi::Tpl);

    /// Installs `interface` for `protocol` on `handle`, or on a new handle when `handle` is `None`.
    fn install_protocol(
        &self,
        handle: Option<efi::Handle>,
        protocol: &'static efi::Guid,
        interface: *mut c_void,
    ) -> Result<efi::Handle, efi::Status>;

    fn uninstall_protocol(
        &self,
        handle: efi::Handle,
        protocol: &'static efi::Guid,
        interface: *mut c_void,
    ) -> Result<(), efi::Status>;

    /// Opens `protocol` on `controller` with `EFI_OPEN_PROTOCOL_BY_DRIVER` semantics.
    fn open_protocol_by_driver(
        &self,
        controller: efi::Handle,
        protocol: &'static efi::Guid,
        agent: efi::Handle,
    ) -> Result<*mut c_void, efi::Status>;

    fn close_protocol(
        &self,
        controller: efi::Handle,
        protocol: &'static efi::Guid,
        agent: efi::Handle,
    ) -> Result<(), efi::Status>;

    fn handle_protocol(&self, handle: efi::Handle, protocol: &'static efi::Guid) -> Result<*mut c_void, efi::Status>;

    /// Returns the first interface installed for `protocol`.
    fn locate_protocol(&self, protocol: &'static efi::Guid) -> Result<*mut c_void, efi::Status>;

    /// Returns every handle that supports `protocol`.
    fn locate_handles(&self, protocol: &'static efi::Guid) -> Result<Vec<efi::Handle>, efi::Status>;

    /// Allocates boot services data pool memory that callers may release with `FreePool`.
    fn allocate_pool(&self, size: usize) -> Result<*mut u8, efi::Status>;
}

/// Restores the captured TPL when dropped.
pub struct TplGuard<'a, S: PlatformBootServices + ?Sized> {
    services: &'a S,
    previous: efi::Tpl,
}

impl<'a, S: PlatformBootServices + ?Sized> TplGuard<'a, S> {
    /// Raises to `tpl` until the returned guard goes out of scope.
    pub fn raise(services: &'a S, tpl: efi::Tpl) -> Self {
        let previous = services.raise_tpl(tpl);
        Self { services, previous }
    }
}

impl<S: PlatformBootServices + ?Sized> Drop for TplGuard<'_, S> {
    fn drop(&mut self) {
        self.services.restore_tpl(self.previous);
    }
}

impl PlatformBootServices for StandardBootServices {
    fn raise_tpl(&self, tpl: efi::Tpl) -> efi::Tpl {
        BootServices::raise_tpl(self, Tpl(tpl)).0
    }

    fn restore_tpl(&self, tpl: efi::Tpl) {
        BootServices::restore_tpl(self, Tpl(tpl))
    }

    fn install_protocol(
        &self,
        handle: Option<efi::Handle>,
        protocol: &'static efi::Guid,
        interface: *mut c_void,
    ) -> Result<efi::Handle, efi::Status> {
        // SAFETY: callers hand in interfaces laid out for `protocol` that live for the rest of boot.
        unsafe { self.install_protocol_interface_unchecked(handle, protocol, interface) }
    }

    fn uninstall_protocol(
        &self,
        handle: efi::Handle,
        protocol: &'static efi::Guid,
        interface: *mut c_void,
    ) -> Result<(), efi::Status> {
        // SAFETY: the interface pointer is the one previously installed for `protocol`.
        unsafe { self.uninstall_protocol_interface_unchecked(handle, protocol, interface) }
    }

    fn open_protocol_by_driver(
        &self,
        controller: efi::Handle,
        protocol: &'static efi::Guid,
        agent: efi::Handle,
    ) -> Result<*mut c_void, efi::Status> {
        // SAFETY: the returned pointer is only interpreted as the interface type of `protocol`.
        unsafe {
            self.open_protocol_unchecked(
                controller,
                protocol,
                agent,
                controller,
                efi::OPEN_PROTOCOL_BY_DRIVER,
            )
        }
    }

    fn close_protocol(
        &self,
        controller: efi::Handle,
        protocol: &'static efi::Guid,
        agent: efi::Handle,
    ) -> Result<(), efi::Status> {
        BootServices::close_protocol(self, controller, protocol, agent, controller)
    }

    fn handle_protocol(&self, handle: efi::Handle, protocol: &'static efi::Guid) -> Result<*mut c_void, efi::Status> {
        // SAFETY: the returned pointer is only interpreted as the interface type of `protocol`.
        unsafe { self.handle_protocol_unchecked(handle, protocol) }
    }

    fn locate_protocol(&self, protocol: &'static efi::Guid) -> Result<*mut c_void, efi::Status> {
        // SAFETY: the returned pointer is only interpreted as the interface type of `protocol`.
        unsafe { self.locate_protocol_unchecked(protocol, core::ptr::null_mut()) }
    }

    fn locate_handles(&self, protocol: &'static efi::Guid) -> Result<Vec<efi::Handle>, efi::Status> {
        self.locate_handle_buffer(HandleSearchType::ByProtocol(protocol)).map(|handles| handles.to_vec())
    }

    fn allocate_pool(&self, size: usize) -> Result<*mut u8, efi::Status> {
        BootServices::allocate_pool(self, EfiMemoryType::BootServicesData, size)
    }
}
