//! Framebuffer Block Transfer
//!
//! Implements the four Graphics Output BLT operations over a linear 32-bpp framebuffer. Pixels are
//! handled as `u32` values, which is the layout of both `EFI_GRAPHICS_OUTPUT_BLT_PIXEL` and a
//! BGRX framebuffer.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use r_efi::efi;

const BYTES_PER_PIXEL: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BltOperation {
    /// Fill a framebuffer rectangle with the first pixel of the BLT buffer.
    VideoFill,
    /// Copy a framebuffer rectangle into the BLT buffer.
    VideoToBuffer,
    /// Copy a BLT buffer rectangle into the framebuffer.
    BufferToVideo,
    /// Copy a framebuffer rectangle to another spot of the framebuffer.
    VideoToVideo,
}

impl BltOperation {
    /// Decodes an `EFI_GRAPHICS_OUTPUT_BLT_OPERATION`.
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::VideoFill),
            1 => Some(Self::VideoToBuffer),
            2 => Some(Self::BufferToVideo),
            3 => Some(Self::VideoToVideo),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BltError {
    InvalidOperation(u32),
    EmptyRectangle,
    /// The rectangle does not fit the framebuffer.
    OutOfBounds,
    /// `Delta` is not a whole number of pixels.
    InvalidDelta(usize),
    BufferTooSmall,
    /// The framebuffer description is inconsistent.
    InvalidFrameBuffer,
}

impl From<BltError> for efi::Status {
    fn from(_: BltError) -> Self {
        efi::Status::INVALID_PARAMETER
    }
}

/// A framebuffer of `height` scan lines of `stride` pixels, of which `width` are visible.
pub struct FrameBuffer<'a> {
    pixels: &'a mut [u32],
    width: usize,
    height: usize,
    stride: usize,
}

impl<'a> FrameBuffer<'a> {
    pub fn new(pixels: &'a mut [u32], width: usize, height: usize, stride: usize) -> Result<Self, BltError> {
        let required = stride.checked_mul(height).ok_or(BltError::InvalidFrameBuffer)?;
        if stride < width || pixels.len() < required {
            return Err(BltError::InvalidFrameBuffer);
        }
        Ok(Self { pixels, width, height, stride })
    }

    fn check(&self, x: usize, y: usize, width: usize, height: usize) -> Result<(), BltError> {
        let right = x.checked_add(width).ok_or(BltError::OutOfBounds)?;
        let bottom = y.checked_add(height).ok_or(BltError::OutOfBounds)?;
        if right > self.width || bottom > self.height {
            return Err(BltError::OutOfBounds);
        }
        Ok(())
    }

    fn row(&self, x: usize, y: usize) -> usize {
        y * self.stride + x
    }
}

/// Arguments of a single `Blt()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BltRequest {
    pub operation: BltOperation,
    pub source_x: usize,
    pub source_y: usize,
    pub destination_x: usize,
    pub destination_y: usize,
    pub width: usize,
    pub height: usize,
    /// Bytes per row of the BLT buffer; zero means `width` pixels.
    pub delta: usize,
}

impl BltRequest {
    fn buffer_stride(&self) -> Result<usize, BltError> {
        if self.delta == 0 {
            return Ok(self.width);
        }
        if self.delta % BYTES_PER_PIXEL != 0 {
            return Err(BltError::InvalidDelta(self.delta));
        }
        Ok(self.delta / BYTES_PER_PIXEL)
    }

    /// Number of pixels the BLT buffer must hold for this request.
    pub fn buffer_len(&self) -> Result<usize, BltError> {
        if self.width == 0 || self.height == 0 {
            return Err(BltError::EmptyRectangle);
        }
        let (x, y) = match self.operation {
            BltOperation::VideoFill => return Ok(1),
            BltOperation::VideoToVideo => return Ok(0),
            BltOperation::VideoToBuffer => (self.destination_x, self.destination_y),
            BltOperation::BufferToVideo => (self.source_x, self.source_y),
        };
        let stride = self.buffer_stride()?;
        y.checked_add(self.height - 1)
            .and_then(|last| last.checked_mul(stride))
            .and_then(|rows| rows.checked_add(x))
            .and_then(|start| start.checked_add(self.width))
            .ok_or(BltError::BufferTooSmall)
    }
}

/// Performs `request` against `frame_buffer`, reading or writing `buffer` as the operation requires.
pub fn blt(frame_buffer: &mut FrameBuffer<'_>, buffer: &mut [u32], request: &BltRequest) -> Result<(), BltError> {
    if buffer.len() < request.buffer_len()? {
        return Err(BltError::BufferTooSmall);
    }
    let (width, height) = (request.width, request.height);

    match request.operation {
        BltOperation::VideoFill => {
            frame_buffer.check(request.destination_x, request.destination_y, width, height)?;
            let color = buffer[0];
            for row in 0..height {
                let start = frame_buffer.row(request.destination_x, request.destination_y + row);
                frame_buffer.pixels[start..start + width].fill(color);
            }
        }
        BltOperation::VideoToBuffer => {
            frame_buffer.check(request.source_x, request.source_y, width, height)?;
            let stride = request.buffer_stride()?;
            for row in 0..height {
                let source = frame_buffer.row(request.source_x, request.source_y + row);
                let destination = (request.destination_y + row) * stride + request.destination_x;
                buffer[destination..destination + width].copy_from_slice(&frame_buffer.pixels[source..source + width]);
            }
        }
        BltOperation::BufferToVideo => {
            frame_buffer.check(request.destination_x, request.destination_y, width, height)?;
            let stride = request.buffer_stride()?;
            for row in 0..height {
                let source = (request.source_y + row) * stride + request.source_x;
                let destination = frame_buffer.row(request.destination_x, request.destination_y + row);
                frame_buffer.pixels[destination..destination + width].copy_from_slice(&buffer[source..source + width]);
            }
        }
        BltOperation::VideoToVideo => {
            frame_buffer.check(request.source_x, request.source_y, width, height)?;
            frame_buffer.check(request.destination_x, request.destination_y, width, height)?;
            // Moving down copies bottom-up so source rows are read before they are overwritten.
            if request.destination_y > request.source_y {
                for row in (0..height).rev() {
                    move_row(frame_buffer, request, row);
                }
            } else {
                for row in 0..height {
                    move_row(frame_buffer, request, row);
                }
            }
        }
    }
    Ok(())
}

fn move_row(frame_buffer: &mut FrameBuffer<'_>, request: &BltRequest, row: usize) {
    let source = frame_buffer.row(request.source_x, request.source_y + row);
    let destination = frame_buffer.row(request.destination_x, request.destination_y + row);
    frame_buffer.pixels.copy_within(source..source + request.width, destination);
}
