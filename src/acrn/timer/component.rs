//! ACRN LAPIC Timer Component
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::boxed::Box;

use patina::{
    boot_services::StandardBootServices,
    component::{component, params::Config},
    error::Result,
};

use super::{AcrnTimerConfig, ApicTimer, install_timer_protocol, local_apic::X86LocalApic, tsc};
use crate::error::status_to_error;

/// Produces the Timer Architectural Protocol from the local APIC in TSC-deadline mode.
#[derive(Default)]
pub struct AcrnLapicTimer;

#[component]
impl AcrnLapicTimer {
    /// Creates a new instance.
    pub fn new() -> Self {
        Self
    }

    fn entry_point(self, config: Config<AcrnTimerConfig>, boot_services: StandardBootServices) -> Result<()> {
        log::info!("Initializing LAPIC Timer Driver");

        let tsc_frequency = match config.tsc_frequency_hz {
            Some(frequency) => frequency,
            // SAFETY: the ACRN device model always decodes the PM timer at the configured port.
            None => unsafe { tsc::calibrate_tsc_frequency(config.pm_timer_port) },
        };

        // SAFETY: DXE runs in ring 0 with the local APIC page identity mapped.
        let apic = unsafe { X86LocalApic::new() };
        let timer = ApicTimer::new(apic, boot_services.clone(), config.vector, tsc_frequency);
        timer.initialize().map_err(status_to_error)?;

        let handle = install_timer_protocol(&boot_services, Box::new(timer), config.vector, config.default_period)
            .map_err(|status| {
                log::error!("Failed to install the LAPIC timer: {:?}", status);
                status_to_error(status)
            })?;
        log::debug!("LAPIC timer installed on handle {:?}, vector {}", handle, config.vector);
        Ok(())
    }
}
