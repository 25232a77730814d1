//! Hypervisor Platform Resources
//!
//! Platform support shared by the ACRN and bhyve Patina binaries, plus the Intel GVT-g graphics
//! driver that either platform can carry.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod acpi;
pub mod acrn;
pub mod bhyve;
pub mod boot_services;
pub mod error;
pub mod gvt;
pub mod memory;
