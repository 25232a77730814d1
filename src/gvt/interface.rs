//! GVT-g Interface Page
//!
//! The mediated device reserves a page of BAR0 at [`VGT_IF_BASE`] for guest/host communication.
//! It starts with a [`GvtIfHeader`] identifying the device, carries a guest-to-vGPU (G2V)
//! notification register, and a [`GvtGopInfo`] block the host fills in once the guest asks for
//! a framebuffer.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use core::mem::size_of;

use patina::error::EfiError;
use r_efi::efi;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout,
    byteorder::little_endian::{U16, U32, U64},
};

use crate::error::status_to_error;

/// `"vGTvGTvG"`
pub const VGT_MAGIC: u64 = 0x4776_5447_7654_4776;
pub const VGT_IF_BASE: u64 = 0x78000;
pub const VGT_G2V_OFFSET: u64 = 0x818;
pub const VGT_GOP_OFFSET: u64 = 0x860;
pub const VGT_G2V_GOP_SETUP: u32 = 0x8;
pub const VGT_CAPS_GOP_SUPPORT: u32 = 1 << 5;

pub const INTEL_VENDOR_ID: u16 = 0x8086;
pub const PCI_CLASS_DISPLAY: u8 = 0x03;

const PCI_VENDOR_ID_OFFSET: u32 = 0x00;
const PCI_REVISION_ID_OFFSET: u32 = 0x08;

/// The only framebuffer depth the host hands out.
pub const GVT_GOP_BPP: u32 = 32;

/// Register access to a GVT-g device.
pub trait GvtMmio {
    /// Reads a dword of PCI configuration space.
    fn read_config32(&self, offset: u32) -> Result<u32, efi::Status>;

    /// Reads a dword at `offset` in BAR0.
    fn read_mmio32(&self, offset: u64) -> Result<u32, efi::Status>;

    /// Writes a dword at `offset` in BAR0.
    fn write_mmio32(&self, offset: u64, value: u32) -> Result<(), efi::Status>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GvtError {
    /// The device is not an Intel display controller.
    NotDisplayDevice,
    /// The interface page does not carry [`VGT_MAGIC`].
    BadMagic(u64),
    /// The host does not advertise [`VGT_CAPS_GOP_SUPPORT`].
    NoGopSupport,
    /// Register access failed.
    Mmio(efi::Status),
    /// The host answered the framebuffer request with an unusable description.
    InvalidGopInfo,
}

impl From<GvtError> for efi::Status {
    fn from(value: GvtError) -> Self {
        match value {
            GvtError::NotDisplayDevice | GvtError::BadMagic(_) | GvtError::NoGopSupport => efi::Status::UNSUPPORTED,
            GvtError::Mmio(status) => status,
            GvtError::InvalidGopInfo => efi::Status::DEVICE_ERROR,
        }
    }
}

impl From<GvtError> for EfiError {
    fn from(value: GvtError) -> Self {
        status_to_error(value.into())
    }
}

/// Header at the start of the interface page.
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug)]
pub struct GvtIfHeader {
    pub magic: U64,
    pub version_major: U16,
    pub version_minor: U16,
    pub vgt_id: U32,
    pub vgt_caps: U32,
}

/// Framebuffer the host set up in answer to [`VGT_G2V_GOP_SETUP`].
#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Clone, Copy, Debug, PartialEq, Eq)]
pub struct GvtGopInfo {
    pub fb_base: U32,
    pub width: U32,
    pub height: U32,
    /// Bytes per scan line.
    pub pitch: U32,
    pub bpp: U32,
    /// Bytes.
    pub size: U32,
}

impl GvtGopInfo {
    pub fn new(fb_base: u32, width: u32, height: u32, pitch: u32, bpp: u32, size: u32) -> Self {
        Self {
            fb_base: fb_base.into(),
            width: width.into(),
            height: height.into(),
            pitch: pitch.into(),
            bpp: bpp.into(),
            size: size.into(),
        }
    }

    /// Checks that the description is a usable 32-bpp linear framebuffer.
    pub fn validate(&self) -> Result<(), GvtError> {
        let (width, height, pitch) = (self.width.get() as u64, self.height.get() as u64, self.pitch.get() as u64);
        if self.fb_base.get() == 0 || width == 0 || height == 0 || self.bpp.get() != GVT_GOP_BPP {
            return Err(GvtError::InvalidGopInfo);
        }
        if pitch % 4 != 0 || pitch < width * 4 || (self.size.get() as u64) < pitch * height {
            return Err(GvtError::InvalidGopInfo);
        }
        Ok(())
    }
}

const MAX_BLOCK: usize = 32;

fn read_block<T: FromBytes, M: GvtMmio + ?Sized>(mmio: &M, offset: u64) -> Result<T, GvtError> {
    let length = size_of::<T>();
    if length > MAX_BLOCK || length % 4 != 0 {
        return Err(GvtError::Mmio(efi::Status::BAD_BUFFER_SIZE));
    }
    let mut bytes = [0u8; MAX_BLOCK];
    for (index, chunk) in bytes[..length].chunks_exact_mut(4).enumerate() {
        let value = mmio.read_mmio32(VGT_IF_BASE + offset + (index * 4) as u64).map_err(GvtError::Mmio)?;
        chunk.copy_from_slice(&value.to_le_bytes());
    }
    T::read_from_bytes(&bytes[..length]).map_err(|_| GvtError::Mmio(efi::Status::BAD_BUFFER_SIZE))
}

/// Identifies a GVT-g device that can provide a framebuffer.
pub fn detect<M: GvtMmio + ?Sized>(mmio: &M) -> Result<GvtIfHeader, GvtError> {
    let vendor = mmio.read_config32(PCI_VENDOR_ID_OFFSET).map_err(GvtError::Mmio)? as u16;
    let class = (mmio.read_config32(PCI_REVISION_ID_OFFSET).map_err(GvtError::Mmio)? >> 24) as u8;
    if vendor != INTEL_VENDOR_ID || class != PCI_CLASS_DISPLAY {
        return Err(GvtError::NotDisplayDevice);
    }

    let header: GvtIfHeader = read_block(mmio, 0)?;
    if header.magic.get() != VGT_MAGIC {
        return Err(GvtError::BadMagic(header.magic.get()));
    }
    if header.vgt_caps.get() & VGT_CAPS_GOP_SUPPORT == 0 {
        log::info!("GVT-g {} does not support GOP", header.vgt_id.get());
        return Err(GvtError::NoGopSupport);
    }

    log::info!(
        "GVT-g {} interface {}.{}, caps {:#x}",
        header.vgt_id.get(),
        header.version_major.get(),
        header.version_minor.get(),
        header.vgt_caps.get()
    );
    Ok(header)
}

/// Asks the host for a framebuffer and returns its validated description.
pub fn request_gop_setup<M: GvtMmio + ?Sized>(mmio: &M) -> Result<GvtGopInfo, GvtError> {
    mmio.write_mmio32(VGT_IF_BASE + VGT_G2V_OFFSET, VGT_G2V_GOP_SETUP).map_err(GvtError::Mmio)?;

    let info: GvtGopInfo = read_block(mmio, VGT_GOP_OFFSET)?;
    log::debug!(
        "GVT-g framebuffer {:#x}: {}x{} pitch {} bpp {} size {:#x}",
        info.fb_base.get(),
        info.width.get(),
        info.height.get(),
        info.pitch.get(),
        info.bpp.get(),
        info.size.get()
    );
    info.validate().inspect_err(|_| log::error!("GVT-g host returned an unusable framebuffer"))?;
    Ok(info)
}
