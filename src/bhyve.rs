//! bhyve Platform Support
//!
//! bhyve's userspace leaves SMBIOS 2.x tables in the legacy BIOS area for the firmware to pick up.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
pub mod smbios;
