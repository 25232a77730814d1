//! ACRN LAPIC Timer
//!
//! ACRN guests have no 8254 or HPET worth using, so the timer tick comes from the local APIC in
//! TSC-deadline mode. Each tick re-arms the deadline one period ahead of the current TSC.
//!
//! The Timer Architectural Protocol functions and the interrupt handler are `efiapi` callbacks
//! without a context argument of their own; they reach the timer through [`TimerInstance`], whose
//! first field is the protocol structure handed out to the DXE core.
//!
//! The protocol layouts come from [`patina::pi::protocols::timer`] and
//! [`patina::pi::protocols::cpu_arch`]. Their `register_handler` takes a non-null notify function,
//! so unregistration is only reachable through [`ArchTimer::register_handler`].
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::boxed::Box;
use core::{
    ffi::c_void,
    ptr,
    sync::atomic::{AtomicPtr, AtomicU64, Ordering},
};

use patina::pi::protocols::{cpu_arch, timer as timer_arch};
use r_efi::efi;

use crate::{
    acrn::{ACRN_PMBASE_VALUE, PM_TIMER_OFFSET},
    boot_services::{PlatformBootServices, TplGuard},
};

#[cfg(feature = "x64")]
pub mod component;
pub mod local_apic;
pub mod tsc;

use local_apic::{
    LocalApic, LvtTimer, SpuriousVector, TIMER_MODE_TSC_DEADLINE, XAPIC_EOI_OFFSET, XAPIC_LVT_TIMER_OFFSET,
    XAPIC_SPURIOUS_VECTOR_OFFSET,
};

/// Called on every timer tick with the time elapsed since the previous one, in 100 ns units.
pub type TimerNotify = timer_arch::EfiTimerNotify;

/// Timer periods are expressed in 100 ns units.
const PERIODS_PER_SECOND: u128 = 10_000_000;

/// Tunables for the ACRN LAPIC timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcrnTimerConfig {
    /// Interrupt vector the LVT timer delivers.
    pub vector: u8,
    /// Period programmed at start of day, in 100 ns units.
    pub default_period: u64,
    /// Fixed TSC frequency. When `None` the TSC is calibrated against the PM timer.
    pub tsc_frequency_hz: Option<u64>,
    /// I/O port of the ACPI PM timer used for calibration.
    pub pm_timer_port: u16,
}

impl Default for AcrnTimerConfig {
    fn default() -> Self {
        Self {
            vector: 64,
            default_period: 1_000_000,
            tsc_frequency_hz: None,
            pm_timer_port: ACRN_PMBASE_VALUE + PM_TIMER_OFFSET,
        }
    }
}

/// Operations behind the Timer Architectural Protocol.
pub trait ArchTimer {
    fn register_handler(&self, notify: Option<TimerNotify>) -> Result<(), efi::Status>;
    fn set_timer_period(&self, period: u64);
    fn timer_period(&self) -> u64;
    fn generate_soft_interrupt(&self) -> Result<(), efi::Status>;
    /// Services one timer interrupt.
    fn tick(&self);
}

/// Local APIC timer in TSC-deadline mode.
pub struct ApicTimer<A: LocalApic, S: PlatformBootServices> {
    apic: A,
    boot_services: S,
    vector: u8,
    tsc_frequency: u64,
    notify: spin::Mutex<Option<TimerNotify>>,
    period: AtomicU64,
}

impl<A: LocalApic, S: PlatformBootServices> ApicTimer<A, S> {
    pub fn new(apic: A, boot_services: S, vector: u8, tsc_frequency: u64) -> Self {
        Self { apic, boot_services, vector, tsc_frequency, notify: spin::Mutex::new(None), period: AtomicU64::new(0) }
    }

    /// Software-enables the local APIC and leaves the timer programmed for TSC-deadline mode, masked.
    pub fn initialize(&self) -> Result<(), efi::Status> {
        if !self.apic.supports_tsc_deadline() {
            log::error!("LAPIC TSC-deadline mode is not supported");
            return Err(efi::Status::DEVICE_ERROR);
        }

        let svr = SpuriousVector::from_bits(self.apic.read_register(XAPIC_SPURIOUS_VECTOR_OFFSET));
        if !svr.software_enable() {
            self.apic.write_register(XAPIC_SPURIOUS_VECTOR_OFFSET, svr.with_software_enable(true).into_bits());
        }

        let lvt = LvtTimer::from_bits(self.apic.read_register(XAPIC_LVT_TIMER_OFFSET))
            .with_timer_mode(TIMER_MODE_TSC_DEADLINE)
            .with_mask(true)
            .with_vector(self.vector);
        self.apic.write_register(XAPIC_LVT_TIMER_OFFSET, lvt.into_bits());
        Ok(())
    }

    pub fn tsc_frequency(&self) -> u64 {
        self.tsc_frequency
    }

    /// TSC value one `period` from now.
    fn deadline(&self, period: u64) -> u64 {
        let ticks = (self.tsc_frequency as u128 * period as u128) / PERIODS_PER_SECOND;
        self.apic.read_tsc().saturating_add(u64::try_from(ticks).unwrap_or(u64::MAX))
    }

    fn set_masked(&self, masked: bool) {
        let lvt = LvtTimer::from_bits(self.apic.read_register(XAPIC_LVT_TIMER_OFFSET));
        self.apic.write_register(XAPIC_LVT_TIMER_OFFSET, lvt.with_mask(masked).into_bits());
    }

    fn interrupt_enabled(&self) -> bool {
        !LvtTimer::from_bits(self.apic.read_register(XAPIC_LVT_TIMER_OFFSET)).mask()
    }

    fn notify(&self, period: u64) {
        let notify = *self.notify.lock();
        if let Some(notify) = notify {
            notify(period);
        }
    }
}

impl<A: LocalApic, S: PlatformBootServices> ArchTimer for ApicTimer<A, S> {
    fn register_handler(&self, notify: Option<TimerNotify>) -> Result<(), efi::Status> {
        let _tpl = TplGuard::raise(&self.boot_services, efi::TPL_HIGH_LEVEL);
        let mut registered = self.notify.lock();
        match (notify, registered.is_some()) {
            (None, false) => Err(efi::Status::INVALID_PARAMETER),
            (Some(_), true) => Err(efi::Status::ALREADY_STARTED),
            _ => {
                *registered = notify;
                Ok(())
            }
        }
    }

    fn set_timer_period(&self, period: u64) {
        let _tpl = TplGuard::raise(&self.boot_services, efi::TPL_HIGH_LEVEL);

        self.set_masked(true);
        self.apic.write_tsc_deadline(0);
        if period != 0 {
            let deadline = self.deadline(period);
            self.set_masked(false);
            self.apic.write_tsc_deadline(deadline);
        }
        self.period.store(period, Ordering::SeqCst);
        log::trace!("LAPIC timer period set to {}", period);
    }

    fn timer_period(&self) -> u64 {
        self.period.load(Ordering::SeqCst)
    }

    fn generate_soft_interrupt(&self) -> Result<(), efi::Status> {
        let _tpl = TplGuard::raise(&self.boot_services, efi::TPL_HIGH_LEVEL);
        if !self.interrupt_enabled() {
            return Err(efi::Status::UNSUPPORTED);
        }
        self.notify(self.timer_period());
        Ok(())
    }

    fn tick(&self) {
        // The DXE core takes locks that raise to TPL_HIGH_LEVEL from inside the notify function.
        let _tpl = TplGuard::raise(&self.boot_services, efi::TPL_HIGH_LEVEL);

        self.apic.write_register(XAPIC_EOI_OFFSET, 0);
        let period = self.timer_period();
        let deadline = if period != 0 { self.deadline(period) } else { 0 };
        self.apic.write_tsc_deadline(deadline);
        self.notify(period);
    }
}

/// The published Timer Architectural Protocol together with the timer it drives.
#[repr(C)]
pub struct TimerInstance {
    protocol: timer_arch::Protocol,
    timer: Box<dyn ArchTimer>,
}

impl TimerInstance {
    pub fn new(timer: Box<dyn ArchTimer>) -> Box<Self> {
        Box::new(Self {
            protocol: timer_arch::Protocol {
                register_handler: register_handler_thunk,
                set_timer_period: set_timer_period_thunk,
                get_timer_period: get_timer_period_thunk,
                generate_soft_interrupt: generate_soft_interrupt_thunk,
            },
            timer,
        })
    }

    pub fn protocol(&mut self) -> *mut timer_arch::Protocol {
        &mut self.protocol
    }

    /// ## Safety
    ///
    /// `protocol` must be null or point at the `protocol` field of a live [`TimerInstance`].
    unsafe fn from_protocol<'a>(protocol: *mut timer_arch::Protocol) -> Option<&'a TimerInstance> {
        // SAFETY: `protocol` is the first field of the `repr(C)` instance.
        unsafe { (protocol as *const TimerInstance).as_ref() }
    }
}

fn to_status(result: Result<(), efi::Status>) -> efi::Status {
    result.err().unwrap_or(efi::Status::SUCCESS)
}

extern "efiapi" fn register_handler_thunk(this: *mut timer_arch::Protocol, notify: TimerNotify) -> efi::Status {
    // SAFETY: the DXE core only calls through the protocol pointer that was installed.
    match unsafe { TimerInstance::from_protocol(this) } {
        Some(instance) => to_status(instance.timer.register_handler(Some(notify))),
        None => efi::Status::INVALID_PARAMETER,
    }
}

extern "efiapi" fn set_timer_period_thunk(this: *mut timer_arch::Protocol, period: u64) -> efi::Status {
    // SAFETY: the DXE core only calls through the protocol pointer that was installed.
    match unsafe { TimerInstance::from_protocol(this) } {
        Some(instance) => {
            instance.timer.set_timer_period(period);
            efi::Status::SUCCESS
        }
        None => efi::Status::INVALID_PARAMETER,
    }
}

extern "efiapi" fn get_timer_period_thunk(this: *mut timer_arch::Protocol, period: *mut u64) -> efi::Status {
    // SAFETY: the DXE core only calls through the protocol pointer that was installed.
    let Some(instance) = (unsafe { TimerInstance::from_protocol(this) }) else {
        return efi::Status::INVALID_PARAMETER;
    };
    if period.is_null() {
        return efi::Status::INVALID_PARAMETER;
    }
    // SAFETY: checked for null above; the caller owns the output location.
    unsafe { period.write(instance.timer.timer_period()) };
    efi::Status::SUCCESS
}

extern "efiapi" fn generate_soft_interrupt_thunk(this: *mut timer_arch::Protocol) -> efi::Status {
    // SAFETY: the DXE core only calls through the protocol pointer that was installed.
    match unsafe { TimerInstance::from_protocol(this) } {
        Some(instance) => to_status(instance.timer.generate_soft_interrupt()),
        None => efi::Status::INVALID_PARAMETER,
    }
}

/// The instance whose timer services the LAPIC timer vector.
static ACTIVE_TIMER: AtomicPtr<TimerInstance> = AtomicPtr::new(ptr::null_mut());

extern "efiapi" fn timer_interrupt_handler(
    _interrupt_type: cpu_arch::EfiExceptionType,
    _system_context: cpu_arch::EfiSystemContext,
) {
    let instance = ACTIVE_TIMER.load(Ordering::SeqCst);
    // SAFETY: only leaked, never freed, instances are stored in ACTIVE_TIMER.
    if let Some(instance) = unsafe { instance.as_ref() } {
        instance.timer.tick();
    }
}

/// Hooks `timer` to `vector` through the CPU Architectural Protocol, starts it at
/// `default_period`, and installs the Timer Architectural Protocol on a new handle.
pub fn install_timer_protocol<B: PlatformBootServices + ?Sized>(
    boot_services: &B,
    timer: Box<dyn ArchTimer>,
    vector: u8,
    default_period: u64,
) -> Result<efi::Handle, efi::Status> {
    if boot_services.locate_protocol(&timer_arch::PROTOCOL_GUID).is_ok() {
        log::error!("A Timer Architectural Protocol is already installed");
        return Err(efi::Status::ALREADY_STARTED);
    }

    let cpu = boot_services.locate_protocol(&cpu_arch::PROTOCOL_GUID).inspect_err(|status| {
        log::error!("CPU Architectural Protocol not found: {:?}", status);
    })? as *const cpu_arch::Protocol;
    if cpu.is_null() {
        return Err(efi::Status::NOT_FOUND);
    }

    // The handler is inert until ACTIVE_TIMER is set and the LVT is unmasked by the first period.
    // SAFETY: `cpu` was returned by LocateProtocol for the CPU Architectural Protocol GUID.
    let status = unsafe {
        ((*cpu).register_interrupt_handler)(cpu, vector as cpu_arch::EfiExceptionType, timer_interrupt_handler)
    };
    if status.is_error() {
        log::error!("Unable to register the LAPIC timer interrupt handler: {:?}", status);
        return Err(efi::Status::DEVICE_ERROR);
    }

    let instance = Box::leak(TimerInstance::new(timer));
    ACTIVE_TIMER.store(instance, Ordering::SeqCst);
    instance.timer.set_timer_period(default_period);

    boot_services.install_protocol(None, &timer_arch::PROTOCOL_GUID, instance.protocol() as *mut c_void)
}
