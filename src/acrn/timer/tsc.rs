//! TSC Frequency
//!
//! The deadline timer counts in TSC ticks, so the TSC frequency has to be known. ACRN does not
//! report it; it is measured against the ACPI PM timer instead.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!

/// Frequency of the ACPI PM timer.
pub const ACPI_TIMER_FREQUENCY: u64 = 3_579_545;

/// 24-bit PM timers wrap at this mask; 32-bit timers do not reach it within a calibration window.
const PM_TIMER_MASK: u32 = 0x00FF_FFFF;

/// Calibration window, expressed as a fraction of a second (1/20 s = 50 ms).
const CALIBRATION_DIVISOR: u64 = 20;

/// Source of PM timer and TSC readings used for calibration.
pub trait CalibrationClock {
    fn read_pm_timer(&mut self) -> u32;
    fn read_tsc(&mut self) -> u64;
}

/// Measures the TSC frequency in Hz across roughly 50 ms of PM timer ticks.
pub fn measure_tsc_frequency<C: CalibrationClock + ?Sized>(clock: &mut C) -> u64 {
    // Wait for a PM timer edge to avoid a partial first interval.
    let first = clock.read_pm_timer();
    let mut start_pm = clock.read_pm_timer();
    while start_pm == first {
        start_pm = clock.read_pm_timer();
    }
    let start_tsc = clock.read_tsc();

    let target_ticks = (ACPI_TIMER_FREQUENCY / CALIBRATION_DIVISOR) as u32;
    let mut delta_pm;
    loop {
        delta_pm = clock.read_pm_timer().wrapping_sub(start_pm) & PM_TIMER_MASK;
        if delta_pm >= target_ticks {
            break;
        }
    }
    let delta_tsc = clock.read_tsc().wrapping_sub(start_tsc);

    // Hz = tsc ticks * (pm ticks per second) / pm ticks
    ((delta_tsc as u128 * ACPI_TIMER_FREQUENCY as u128) / delta_pm as u128) as u64
}

#[cfg(feature = "x64")]
struct PortClock {
    pm_timer: x86_64::instructions::port::Port<u32>,
}

#[cfg(feature = "x64")]
impl CalibrationClock for PortClock {
    fn read_pm_timer(&mut self) -> u32 {
        // SAFETY: the port was supplied by the caller of `calibrate_tsc_frequency`.
        unsafe { self.pm_timer.read() }
    }

    fn read_tsc(&mut self) -> u64 {
        // SAFETY: RDTSC has no side effects.
        unsafe { core::arch::x86_64::_rdtsc() }
    }
}

/// Calibrates the TSC against the PM timer at `pm_timer_port`.
///
/// ## Safety
///
/// `pm_timer_port` must be the I/O port of a running ACPI PM timer.
#[cfg(feature = "x64")]
pub unsafe fn calibrate_tsc_frequency(pm_timer_port: u16) -> u64 {
    let mut clock = PortClock { pm_timer: x86_64::instructions::port::Port::new(pm_timer_port) };
    let frequency = measure_tsc_frequency(&mut clock);
    log::info!("TSC frequency calibrated at {} Hz", frequency);
    frequency
}
