//! DXE Core X64 Binary for bhyve guests.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
#![cfg(all(target_os = "uefi", feature = "x64"))]
#![no_std]
#![no_main]

use core::{ffi::c_void, panic::PanicInfo};
use hypervisor_resources::{acrn::timer::tsc, bhyve::smbios::BhyveSmbiosPlatform};
use patina::{log::Format, serial::uart::Uart16550};
use patina_adv_logger::{component::AdvancedLoggerComponent, logger::AdvancedLogger};
use patina_dxe_core::*;
use patina_ffs_extractors::CompositeSectionExtractor;
use patina_stacktrace::StackTrace;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    log::error!("{}", info);

    if let Err(err) = unsafe { StackTrace::dump() } {
        log::error!("StackTrace: {}", err);
    }

    if patina_debugger::enabled() {
        patina_debugger::breakpoint();
    }

    loop {}
}

static LOGGER: AdvancedLogger<Uart16550> = AdvancedLogger::new(
    Format::Standard,
    &[
        ("allocations", log::LevelFilter::Off),
        ("efi_memory_map", log::LevelFilter::Off),
        ("gcd_measure", log::LevelFilter::Off),
        ("goblin", log::LevelFilter::Off),
    ],
    log::LevelFilter::Info,
    Uart16550::Io { base: 0x3F8 },
);

/// bhyve's LPC bridge places the PM1 block at 0x400.
const PM_TIMER_PORT: u16 = 0x408;
const _ENABLE_DEBUGGER: bool = cfg!(feature = "enable_debugger");

#[cfg(feature = "build_debugger")]
static DEBUGGER: patina_debugger::PatinaDebugger<Uart16550> =
    patina_debugger::PatinaDebugger::new(Uart16550::Io { base: 0x2F8 })
        .with_force_enable(_ENABLE_DEBUGGER)
        .with_log_policy(patina_debugger::DebuggerLoggingPolicy::FullLogging);

struct Bhyve;

// Default `MemoryInfo` implementation is sufficient for bhyve.
impl MemoryInfo for Bhyve {}

impl CpuInfo for Bhyve {
    fn perf_timer_frequency() -> Option<u64> {
        // SAFETY: bhyve always decodes the PM timer at PM_TIMER_PORT.
        Some(unsafe { tsc::calibrate_tsc_frequency(PM_TIMER_PORT) })
    }
}

impl ComponentInfo for Bhyve {
    fn configs(_add: Add<Config>) {}

    fn components(mut add: Add<Component>) {
        add.component(AdvancedLoggerComponent::<Uart16550>::new(&LOGGER));
        add.component(patina_smbios::component::SmbiosProvider::new(3, 9));
        add.component(BhyveSmbiosPlatform::new());
    }
}

impl PlatformInfo for Bhyve {
    type CpuInfo = Self;
    type MemoryInfo = Self;
    type ComponentInfo = Self;
    type Extractor = CompositeSectionExtractor;
}

static CORE: Core<Bhyve> = Core::new(CompositeSectionExtractor::new());

#[cfg_attr(target_os = "uefi", unsafe(export_name = "efi_main"))]
pub extern "efiapi" fn _start(physical_hob_list: *const c_void) -> ! {
    log::set_logger(&LOGGER).map(|()| log::set_max_level(log::LevelFilter::Trace)).unwrap();
    // SAFETY: the HOB list pointer is handed to the entry point by the pre-DXE phase.
    unsafe {
        LOGGER.init(physical_hob_list).unwrap();
    }

    #[cfg(feature = "build_debugger")]
    patina_debugger::set_debugger(&DEBUGGER);

    log::info!("bhyve DXE Core Platform Binary v{}", env!("CARGO_PKG_VERSION"));
    CORE.entry_point(physical_hob_list)
}
