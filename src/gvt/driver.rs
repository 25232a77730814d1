//! GVT-g Driver Binding
//!
//! The driver manages at most one GVT-g device. Starting it installs the Graphics Output
//! Protocol on the controller, asks the host for a framebuffer and selects the only mode; any
//! failure along the way leaves the controller as it was found.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::boxed::Box;
use core::{ffi::c_void, ptr};

use r_efi::{
    efi,
    protocols::{device_path, driver_binding, graphics_output},
};
use spin::Mutex;

use super::{
    GvtGopConfig,
    gop::GopInstance,
    interface::{detect, request_gop_setup},
    pci::{PciBinding, PciIoProtocol},
};
use crate::boot_services::{PlatformBootServices, TplGuard};

struct Started<S: PlatformBootServices + 'static, M> {
    controller: efi::Handle,
    gop: Box<GopInstance<S>>,
    _mmio: M,
}

/// Driver Binding Protocol instance of the GVT-g driver.
#[repr(C)]
pub struct GvtDriver<S: PlatformBootServices + 'static, M: PciBinding> {
    binding: driver_binding::Protocol,
    services: &'static S,
    config: GvtGopConfig,
    started: Mutex<Option<Started<S, M>>>,
}

impl<S: PlatformBootServices + 'static, M: PciBinding> GvtDriver<S, M> {
    pub fn new(services: &'static S, config: GvtGopConfig) -> Box<Self> {
        Box::new(Self {
            binding: driver_binding::Protocol {
                supported: supported_thunk::<S, M>,
                start: start_thunk::<S, M>,
                stop: stop_thunk::<S, M>,
                version: config.driver_version,
                image_handle: ptr::null_mut(),
                driver_binding_handle: ptr::null_mut(),
            },
            services,
            config,
            started: Mutex::new(None),
        })
    }

    pub fn binding(&mut self) -> *mut driver_binding::Protocol {
        &mut self.binding
    }

    pub fn is_started(&self) -> bool {
        self.started.lock().is_some()
    }

    fn agent(&self) -> efi::Handle {
        self.binding.driver_binding_handle
    }

    fn close_pci_io(&self, controller: efi::Handle) {
        if let Err(status) = self.services.close_protocol(controller, &PciIoProtocol::GUID, self.agent()) {
            log::warn!("Failed to close PCI I/O on {:?}: {:?}", controller, status);
        }
    }

    /// Checks whether `controller` is a GVT-g device offering a framebuffer.
    pub fn supported(&self, controller: efi::Handle) -> Result<(), efi::Status> {
        let interface = self.services.open_protocol_by_driver(controller, &PciIoProtocol::GUID, self.agent())?;
        let detected = {
            // SAFETY: the interface was just opened for PCI I/O and is closed after this block.
            let mmio = unsafe { M::bind(interface) };
            detect(&mmio).map(|_| ()).map_err(efi::Status::from)
        };
        self.close_pci_io(controller);
        detected
    }

    /// Binds to `controller` and produces the Graphics Output Protocol on it.
    pub fn start(&self, controller: efi::Handle) -> Result<(), efi::Status> {
        // Declared ahead of the lock so the lock is released before the TPL drops back.
        let _tpl = TplGuard::raise(self.services, efi::TPL_CALLBACK);
        let mut started = self.started.lock();
        if started.is_some() {
            log::info!("GVT-g GOP already started");
            return Ok(());
        }

        let interface = self.services.open_protocol_by_driver(controller, &PciIoProtocol::GUID, self.agent())?;
        // SAFETY: the interface stays open until the instance is stopped or start unwinds.
        let mmio = unsafe { M::bind(interface) };

        let mut gop = GopInstance::new(self.services, &self.config);
        let protocol = gop.protocol() as *mut c_void;
        if let Err(status) = self.services.install_protocol(Some(controller), &graphics_output::PROTOCOL_GUID, protocol)
        {
            log::error!("Failed to install GOP on {:?}: {:?}", controller, status);
            self.close_pci_io(controller);
            return Err(status);
        }

        let ready = request_gop_setup(&mmio)
            .and_then(|info| gop.attach(&info))
            .map_err(efi::Status::from)
            .and_then(|()| gop.set_mode(0));
        if let Err(status) = ready {
            log::error!("GVT-g GOP setup failed: {:?}", status);
            if let Err(error) = self.services.uninstall_protocol(controller, &graphics_output::PROTOCOL_GUID, protocol) {
                log::warn!("Failed to uninstall GOP: {:?}", error);
            }
            self.close_pci_io(controller);
            return Err(status);
        }

        log::info!("GVT-g GOP started on {:?}, framebuffer {:#x}", controller, gop.frame_buffer_base());
        *started = Some(Started { controller, gop, _mmio: mmio });
        Ok(())
    }

    /// Removes the Graphics Output Protocol from `controller` and releases it.
    pub fn stop(&self, controller: efi::Handle) -> Result<(), efi::Status> {
        let _tpl = TplGuard::raise(self.services, efi::TPL_CALLBACK);
        let mut started = self.started.lock();
        let Some(instance) = started.as_mut() else {
            return Ok(());
        };
        if instance.controller != controller {
            log::warn!("GVT-g GOP is not started on {:?}", controller);
            return Ok(());
        }

        let protocol = instance.gop.protocol() as *mut c_void;
        self.services.uninstall_protocol(controller, &graphics_output::PROTOCOL_GUID, protocol)?;
        self.close_pci_io(controller);
        *started = None;
        log::info!("GVT-g GOP stopped on {:?}", controller);
        Ok(())
    }

    /// ## Safety
    ///
    /// `binding` must be null or point at the `binding` field of a live [`GvtDriver`].
    unsafe fn from_binding<'a>(binding: *mut driver_binding::Protocol) -> Option<&'a Self> {
        // SAFETY: `binding` is the first field of the `repr(C)` driver.
        unsafe { (binding as *const Self).as_ref() }
    }
}

/// Installs the Driver Binding Protocol of `driver` on a new handle.
pub fn install_driver_binding<S: PlatformBootServices + 'static, M: PciBinding>(
    services: &S,
    driver: &'static mut GvtDriver<S, M>,
) -> Result<efi::Handle, efi::Status> {
    let handle = services.install_protocol(None, &driver_binding::PROTOCOL_GUID, driver.binding() as *mut c_void)?;
    driver.binding.image_handle = handle;
    driver.binding.driver_binding_handle = handle;
    log::info!("GVT-g driver binding {:#x} installed on {:?}", driver.binding.version, handle);
    Ok(handle)
}

fn to_status(result: Result<(), efi::Status>) -> efi::Status {
    result.err().unwrap_or(efi::Status::SUCCESS)
}

extern "efiapi" fn supported_thunk<S: PlatformBootServices + 'static, M: PciBinding>(
    this: *mut driver_binding::Protocol,
    controller: efi::Handle,
    _remaining_device_path: *mut device_path::Protocol,
) -> efi::Status {
    // SAFETY: the DXE core only calls through the binding that was installed.
    match unsafe { GvtDriver::<S, M>::from_binding(this) } {
        Some(driver) => to_status(driver.supported(controller)),
        None => efi::Status::INVALID_PARAMETER,
    }
}

extern "efiapi" fn start_thunk<S: PlatformBootServices + 'static, M: PciBinding>(
    this: *mut driver_binding::Protocol,
    controller: efi::Handle,
    _remaining_device_path: *mut device_path::Protocol,
) -> efi::Status {
    // SAFETY: the DXE core only calls through the binding that was installed.
    match unsafe { GvtDriver::<S, M>::from_binding(this) } {
        Some(driver) => to_status(driver.start(controller)),
        None => efi::Status::INVALID_PARAMETER,
    }
}

extern "efiapi" fn stop_thunk<S: PlatformBootServices + 'static, M: PciBinding>(
    this: *mut driver_binding::Protocol,
    controller: efi::Handle,
    _number_of_children: usize,
    _child_handle_buffer: *mut efi::Handle,
) -> efi::Status {
    // SAFETY: the DXE core only calls through the binding that was installed.
    match unsafe { GvtDriver::<S, M>::from_binding(this) } {
        Some(driver) => to_status(driver.stop(controller)),
        None => efi::Status::INVALID_PARAMETER,
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use mockall::predicate::eq;

    use super::*;
    use crate::{
        boot_services::MockPlatformBootServices,
        gvt::interface::{GvtGopInfo, GvtMmio, VGT_CAPS_GOP_SUPPORT, fake::FakeGvt},
    };

    const CONTROLLER: usize = 0x1000;
    const BINDING_HANDLE: usize = 0x2000;

    struct FakeBinding(&'static FakeGvt);

    impl GvtMmio for FakeBinding {
        fn read_config32(&self, offset: u32) -> Result<u32, efi::Status> {
            self.0.read_config32(offset)
        }

        fn read_mmio32(&self, offset: u64) -> Result<u32, efi::Status> {
            self.0.read_mmio32(offset)
        }

        fn write_mmio32(&self, offset: u64, value: u32) -> Result<(), efi::Status> {
            self.0.write_mmio32(offset, value)
        }
    }

    impl PciBinding for FakeBinding {
        unsafe fn bind(interface: *mut c_void) -> Self {
            Self(unsafe { &*(interface as *const FakeGvt) })
        }
    }

    type Driver = GvtDriver<MockPlatformBootServices, FakeBinding>;

    fn controller() -> efi::Handle {
        CONTROLLER as efi::Handle
    }

    fn device(info: Option<GvtGopInfo>) -> usize {
        Box::leak(Box::new(FakeGvt::new(VGT_CAPS_GOP_SUPPORT, info))) as *const FakeGvt as usize
    }

    fn framebuffer() -> GvtGopInfo {
        GvtGopInfo::new(0x8000_0000, 1024, 768, 4096, 32, 4096 * 768)
    }

    struct Counters {
        closes: Arc<AtomicUsize>,
        uninstalls: Arc<AtomicUsize>,
    }

    fn services(device: usize, install: Result<(), efi::Status>) -> (MockPlatformBootServices, Counters) {
        services_on_restore(device, install, |_| ())
    }

    fn services_on_restore(
        device: usize,
        install: Result<(), efi::Status>,
        on_restore: impl FnMut(efi::Tpl) + Send + 'static,
    ) -> (MockPlatformBootServices, Counters) {
        let counters = Counters { closes: Arc::new(AtomicUsize::new(0)), uninstalls: Arc::new(AtomicUsize::new(0)) };
        let mut services = MockPlatformBootServices::new();
        services.expect_raise_tpl().with(eq(efi::TPL_CALLBACK)).returning(|_| efi::TPL_APPLICATION);
        services.expect_restore_tpl().returning(on_restore);
        services
            .expect_open_protocol_by_driver()
            .withf(|controller, guid, agent| {
                *controller as usize == CONTROLLER && *guid == PciIoProtocol::GUID && *agent as usize == BINDING_HANDLE
            })
            .returning(move |_, _, _| Ok(device as *mut c_void));
        let closes = counters.closes.clone();
        services.expect_close_protocol().returning(move |_, _, _| {
            closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        services
            .expect_install_protocol()
            .withf(|handle, guid, _| {
                handle.map(|h| h as usize) == Some(CONTROLLER) && *guid == graphics_output::PROTOCOL_GUID
            })
            .returning(move |handle, _, _| install.map(|()| handle.unwrap_or(ptr::null_mut())));
        let uninstalls = counters.uninstalls.clone();
        services.expect_uninstall_protocol().returning(move |_, _, _| {
            uninstalls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (services, counters)
    }

    fn driver(services: MockPlatformBootServices) -> Box<Driver> {
        let mut driver = Driver::new(Box::leak(Box::new(services)), GvtGopConfig::default());
        driver.binding.driver_binding_handle = BINDING_HANDLE as efi::Handle;
        driver
    }

    #[test]
    fn supported_detects_and_closes() {
        let (services, counters) = services(device(None), Ok(()));
        let mut driver = driver(services);
        let binding = driver.binding();

        let status = unsafe { ((*binding).supported)(binding, controller(), ptr::null_mut()) };
        assert_eq!(status, efi::Status::SUCCESS);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn supported_rejects_devices_without_gop() {
        let device = Box::leak(Box::new(FakeGvt::new(0, None))) as *const FakeGvt as usize;
        let (services, counters) = services(device, Ok(()));
        let driver = driver(services);

        assert_eq!(driver.supported(controller()), Err(efi::Status::UNSUPPORTED));
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn supported_passes_open_failures_through() {
        let mut services = MockPlatformBootServices::new();
        services.expect_open_protocol_by_driver().returning(|_, _, _| Err(efi::Status::ACCESS_DENIED));
        services.expect_close_protocol().never();
        let driver = driver(services);

        assert_eq!(driver.supported(controller()), Err(efi::Status::ACCESS_DENIED));
    }

    #[test]
    fn start_publishes_a_gop_in_mode_zero() {
        let device = device(Some(framebuffer()));
        let (services, counters) = services(device, Ok(()));
        let mut driver = driver(services);
        let binding = driver.binding();

        let status = unsafe { ((*binding).start)(binding, controller(), ptr::null_mut()) };
        assert_eq!(status, efi::Status::SUCCESS);
        assert!(driver.is_started());
        {
            let started = driver.started.lock();
            let instance = started.as_ref().unwrap();
            assert_eq!(instance.gop.current_mode(), 0);
            assert_eq!(instance.gop.frame_buffer_base(), 0x8000_0000);
        }
        assert_eq!(counters.closes.load(Ordering::SeqCst), 0);

        // A second start keeps the existing instance.
        assert_eq!(driver.start(controller()), Ok(()));
        let fake = unsafe { &*(device as *const FakeGvt) };
        assert_eq!(fake.writes.borrow().len(), 1);
    }

    #[test]
    fn start_unwinds_when_the_host_gives_no_framebuffer() {
        let (services, counters) = services(device(None), Ok(()));
        let driver = driver(services);

        assert_eq!(driver.start(controller()), Err(efi::Status::DEVICE_ERROR));
        assert!(!driver.is_started());
        assert_eq!(counters.uninstalls.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn start_unwinds_when_install_fails() {
        let (services, counters) = services(device(Some(framebuffer())), Err(efi::Status::OUT_OF_RESOURCES));
        let driver = driver(services);

        assert_eq!(driver.start(controller()), Err(efi::Status::OUT_OF_RESOURCES));
        assert!(!driver.is_started());
        assert_eq!(counters.uninstalls.load(Ordering::SeqCst), 0);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_releases_the_instance() {
        let (services, counters) = services(device(Some(framebuffer())), Ok(()));
        let mut driver = driver(services);
        let binding = driver.binding();

        assert_eq!(unsafe { ((*binding).stop)(binding, controller(), 0, ptr::null_mut()) }, efi::Status::SUCCESS);
        assert_eq!(counters.uninstalls.load(Ordering::SeqCst), 0);

        driver.start(controller()).unwrap();
        assert_eq!(unsafe { ((*binding).stop)(binding, controller(), 0, ptr::null_mut()) }, efi::Status::SUCCESS);
        assert!(!driver.is_started());
        assert_eq!(counters.uninstalls.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lock_is_released_before_the_tpl_is_restored() {
        let driver_address = Arc::new(AtomicUsize::new(0));
        let restores = Arc::new(AtomicUsize::new(0));
        let (services, _counters) = {
            let driver_address = driver_address.clone();
            let restores = restores.clone();
            services_on_restore(device(Some(framebuffer())), Ok(()), move |tpl| {
                assert_eq!(tpl, efi::TPL_APPLICATION);
                let driver = unsafe { &*(driver_address.load(Ordering::SeqCst) as *const Driver) };
                assert!(driver.started.try_lock().is_some());
                restores.fetch_add(1, Ordering::SeqCst);
            })
        };
        let driver = driver(services);
        driver_address.store(&*driver as *const Driver as usize, Ordering::SeqCst);

        driver.start(controller()).unwrap();
        driver.start(controller()).unwrap();
        driver.stop(controller()).unwrap();
        assert_eq!(restores.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn binding_is_installed_on_a_new_handle() {
        let mut services = MockPlatformBootServices::new();
        services
            .expect_install_protocol()
            .withf(|handle, guid, _| handle.is_none() && *guid == driver_binding::PROTOCOL_GUID)
            .returning(|_, _, _| Ok(0x3000 as efi::Handle));
        let services: &'static MockPlatformBootServices = Box::leak(Box::new(services));
        let driver = Box::into_raw(Driver::new(services, GvtGopConfig::default()));

        let handle = install_driver_binding(services, unsafe { &mut *driver }).unwrap();
        let binding = unsafe { &(*driver).binding };
        assert_eq!(handle as usize, 0x3000);
        assert_eq!(binding.driver_binding_handle as usize, 0x3000);
        assert_eq!(binding.image_handle as usize, 0x3000);
        assert_eq!(binding.version, 0x10);
    }
}
