//! Error Conversions
//!
//! Modules report failures with their own error enums. Component entry points speak
//! [`EfiError`] and `efiapi` protocol functions speak [`efi::Status`].
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use patina::error::EfiError;
use r_efi::efi;

/// Maps a status returned by a boot service or protocol call onto the component error type.
pub fn status_to_error(status: efi::Status) -> EfiError {
    match status {
        efi::Status::INVALID_PARAMETER => EfiError::InvalidParameter,
        efi::Status::UNSUPPORTED => EfiError::Unsupported,
        efi::Status::NOT_FOUND => EfiError::NotFound,
        efi::Status::OUT_OF_RESOURCES => EfiError::OutOfResources,
        efi::Status::ALREADY_STARTED => EfiError::AlreadyStarted,
        efi::Status::NOT_STARTED => EfiError::NotStarted,
        efi::Status::BUFFER_TOO_SMALL => EfiError::BufferTooSmall,
        efi::Status::VOLUME_CORRUPTED => EfiError::VolumeCorrupted,
        _ => EfiError::DeviceError,
    }
}
