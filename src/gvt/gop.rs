//! GVT-g Graphics Output Protocol
//!
//! [`GopInstance`] embeds the protocol, its mode structure and the mode information, in that
//! order, so the `efiapi` functions recover the instance from the protocol pointer they are
//! called with.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::boxed::Box;
use core::{mem::size_of, ptr};

use r_efi::{efi, protocols::graphics_output};

use super::{
    GvtGopConfig,
    blt::{self, BltError, BltOperation, BltRequest, FrameBuffer},
    interface::{GvtError, GvtGopInfo},
};
use crate::boot_services::{PlatformBootServices, TplGuard};

pub const GVT_GOP_MAX_MODE: u32 = 1;

/// Reported as the current mode until [`GopInstance::set_mode`] succeeds.
pub const INVALID_MODE_NUMBER: u32 = 0xffff;

const BYTES_PER_PIXEL: u32 = 4;

fn mode_information(config: &GvtGopConfig) -> graphics_output::ModeInformation {
    graphics_output::ModeInformation {
        version: 0,
        horizontal_resolution: config.horizontal_resolution,
        vertical_resolution: config.vertical_resolution,
        pixel_format: graphics_output::PIXEL_BLUE_GREEN_RED_RESERVED_8_BIT_PER_COLOR,
        pixel_information: graphics_output::PixelBitmask {
            red_mask: 0,
            green_mask: 0,
            blue_mask: 0,
            reserved_mask: 0,
        },
        pixels_per_scan_line: config.horizontal_resolution,
    }
}

/// Graphics Output Protocol over the framebuffer of a GVT-g device.
#[repr(C)]
pub struct GopInstance<S: PlatformBootServices + 'static> {
    protocol: graphics_output::Protocol,
    mode: graphics_output::Mode,
    info: graphics_output::ModeInformation,
    services: &'static S,
}

impl<S: PlatformBootServices + 'static> GopInstance<S> {
    pub fn new(services: &'static S, config: &GvtGopConfig) -> Box<Self> {
        let mut instance = Box::new(Self {
            protocol: graphics_output::Protocol {
                query_mode: query_mode_thunk::<S>,
                set_mode: set_mode_thunk::<S>,
                blt: blt_thunk::<S>,
                mode: ptr::null_mut(),
            },
            mode: graphics_output::Mode {
                max_mode: GVT_GOP_MAX_MODE,
                mode: INVALID_MODE_NUMBER,
                info: ptr::null_mut(),
                size_of_info: size_of::<graphics_output::ModeInformation>(),
                frame_buffer_base: 0,
                frame_buffer_size: 0,
            },
            info: mode_information(config),
            services,
        });
        instance.mode.info = &mut instance.info;
        instance.protocol.mode = &mut instance.mode;
        instance
    }

    pub fn protocol(&mut self) -> *mut graphics_output::Protocol {
        &mut self.protocol
    }

    pub fn current_mode(&self) -> u32 {
        self.mode.mode
    }

    pub fn frame_buffer_base(&self) -> u64 {
        self.mode.frame_buffer_base
    }

    /// Points the mode at the framebuffer the host set up.
    ///
    /// The framebuffer has to cover the fixed mode; its pitch becomes the scan line length.
    pub fn attach(&mut self, info: &GvtGopInfo) -> Result<(), GvtError> {
        info.validate()?;
        if info.width.get() < self.info.horizontal_resolution || info.height.get() < self.info.vertical_resolution {
            log::error!(
                "GVT-g framebuffer {}x{} is smaller than the {}x{} mode",
                info.width.get(),
                info.height.get(),
                self.info.horizontal_resolution,
                self.info.vertical_resolution
            );
            return Err(GvtError::InvalidGopInfo);
        }
        self.attach_region(info.fb_base.get() as u64, info.size.get() as usize, info.pitch.get() / BYTES_PER_PIXEL);
        Ok(())
    }

    pub(crate) fn attach_region(&mut self, base: u64, size: usize, pixels_per_scan_line: u32) {
        self.mode.frame_buffer_base = base;
        self.mode.frame_buffer_size = size;
        self.info.pixels_per_scan_line = pixels_per_scan_line;
    }

    /// Returns a pool allocated copy of the information for `mode_number`.
    pub fn query_mode(&self, mode_number: u32) -> Result<(*mut graphics_output::ModeInformation, usize), efi::Status> {
        if mode_number >= self.mode.max_mode {
            return Err(efi::Status::INVALID_PARAMETER);
        }
        let size = size_of::<graphics_output::ModeInformation>();
        let info = self.services.allocate_pool(size)? as *mut graphics_output::ModeInformation;
        if info.is_null() {
            return Err(efi::Status::OUT_OF_RESOURCES);
        }
        // SAFETY: the pool buffer is `size` bytes and pool memory is suitably aligned.
        unsafe { info.write(mode_information_copy(&self.info)) };
        log::trace!("GVT-g mode {}: {}x{}", mode_number, self.info.horizontal_resolution, self.info.vertical_resolution);
        Ok((info, size))
    }

    /// Selects `mode_number`, which can only be the single fixed mode.
    pub fn set_mode(&mut self, mode_number: u32) -> Result<(), efi::Status> {
        if mode_number >= self.mode.max_mode {
            return Err(efi::Status::UNSUPPORTED);
        }
        log::debug!("GVT-g set mode {}", mode_number);
        self.mode.mode = mode_number;
        Ok(())
    }

    /// ## Safety
    ///
    /// `buffer` must be null or valid for the pixels [`BltRequest::buffer_len`] reports for
    /// `request`.
    pub unsafe fn blt(&mut self, buffer: *mut graphics_output::BltPixel, request: &BltRequest) -> Result<(), efi::Status> {
        if self.mode.frame_buffer_base == 0 {
            return Err(efi::Status::DEVICE_ERROR);
        }
        let length = request.buffer_len()?;
        if length > 0 && buffer.is_null() {
            return Err(efi::Status::INVALID_PARAMETER);
        }

        // SAFETY: the framebuffer region was handed out by the host and covers `frame_buffer_size`.
        let pixels = unsafe {
            core::slice::from_raw_parts_mut(
                self.mode.frame_buffer_base as usize as *mut u32,
                self.mode.frame_buffer_size / BYTES_PER_PIXEL as usize,
            )
        };
        let mut frame_buffer = FrameBuffer::new(
            pixels,
            self.info.horizontal_resolution as usize,
            self.info.vertical_resolution as usize,
            self.info.pixels_per_scan_line as usize,
        )?;
        let buffer: &mut [u32] = if length == 0 {
            &mut []
        } else {
            // SAFETY: guaranteed by the caller; a BLT pixel is four bytes.
            unsafe { core::slice::from_raw_parts_mut(buffer as *mut u32, length) }
        };

        let _tpl = TplGuard::raise(self.services, efi::TPL_NOTIFY);
        blt::blt(&mut frame_buffer, buffer, request).map_err(efi::Status::from)
    }

    /// ## Safety
    ///
    /// `protocol` must be null or point at the `protocol` field of a live [`GopInstance`].
    unsafe fn from_protocol<'a>(protocol: *mut graphics_output::Protocol) -> Option<&'a mut Self> {
        // SAFETY: `protocol` is the first field of the `repr(C)` instance.
        unsafe { (protocol as *mut Self).as_mut() }
    }
}

fn mode_information_copy(info: &graphics_output::ModeInformation) -> graphics_output::ModeInformation {
    graphics_output::ModeInformation {
        version: info.version,
        horizontal_resolution: info.horizontal_resolution,
        vertical_resolution: info.vertical_resolution,
        pixel_format: info.pixel_format,
        pixel_information: graphics_output::PixelBitmask {
            red_mask: info.pixel_information.red_mask,
            green_mask: info.pixel_information.green_mask,
            blue_mask: info.pixel_information.blue_mask,
            reserved_mask: info.pixel_information.reserved_mask,
        },
        pixels_per_scan_line: info.pixels_per_scan_line,
    }
}

fn to_status(result: Result<(), efi::Status>) -> efi::Status {
    result.err().unwrap_or(efi::Status::SUCCESS)
}

extern "efiapi" fn query_mode_thunk<S: PlatformBootServices + 'static>(
    this: *mut graphics_output::Protocol,
    mode_number: u32,
    size_of_info: *mut usize,
    info: *mut *mut graphics_output::ModeInformation,
) -> efi::Status {
    if size_of_info.is_null() || info.is_null() {
        return efi::Status::INVALID_PARAMETER;
    }
    // SAFETY: consumers only call through the protocol pointer that was installed.
    let Some(instance) = (unsafe { GopInstance::<S>::from_protocol(this) }) else {
        return efi::Status::INVALID_PARAMETER;
    };
    match instance.query_mode(mode_number) {
        Ok((mode_info, size)) => {
            // SAFETY: both output pointers were checked for null above.
            unsafe {
                size_of_info.write(size);
                info.write(mode_info);
            }
            efi::Status::SUCCESS
        }
        Err(status) => status,
    }
}

extern "efiapi" fn set_mode_thunk<S: PlatformBootServices + 'static>(
    this: *mut graphics_output::Protocol,
    mode_number: u32,
) -> efi::Status {
    // SAFETY: consumers only call through the protocol pointer that was installed.
    match unsafe { GopInstance::<S>::from_protocol(this) } {
        Some(instance) => to_status(instance.set_mode(mode_number)),
        None => efi::Status::INVALID_PARAMETER,
    }
}

#[allow(clippy::too_many_arguments)]
extern "efiapi" fn blt_thunk<S: PlatformBootServices + 'static>(
    this: *mut graphics_output::Protocol,
    blt_buffer: *mut graphics_output::BltPixel,
    blt_operation: graphics_output::BltOperation,
    source_x: usize,
    source_y: usize,
    destination_x: usize,
    destination_y: usize,
    width: usize,
    height: usize,
    delta: usize,
) -> efi::Status {
    // SAFETY: consumers only call through the protocol pointer that was installed.
    let Some(instance) = (unsafe { GopInstance::<S>::from_protocol(this) }) else {
        return efi::Status::INVALID_PARAMETER;
    };
    let Some(operation) = BltOperation::from_raw(blt_operation) else {
        return BltError::InvalidOperation(blt_operation).into();
    };
    let request = BltRequest { operation, source_x, source_y, destination_x, destination_y, width, height, delta };
    // SAFETY: UEFI requires the BLT buffer to cover the rectangle described by the request.
    to_status(unsafe { instance.blt(blt_buffer, &request) })
}
