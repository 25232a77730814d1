//! Local APIC Access
//!
//! The timer only touches a handful of local APIC registers. They are addressed by their xAPIC
//! MMIO offset; in x2APIC mode the same offset selects MSR `0x800 + (offset >> 4)`.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use bitfield_struct::bitfield;

#[cfg(test)]
use mockall::automock;

pub const XAPIC_EOI_OFFSET: u32 = 0xB0;
pub const XAPIC_SPURIOUS_VECTOR_OFFSET: u32 = 0xF0;
pub const XAPIC_LVT_TIMER_OFFSET: u32 = 0x320;

pub const MSR_IA32_APIC_BASE: u32 = 0x1B;
pub const MSR_IA32_TSC_DEADLINE: u32 = 0x6E0;
pub const X2APIC_MSR_BASE_ADDRESS: u32 = 0x800;

/// LVT timer mode that arms the timer through `IA32_TSC_DEADLINE`.
pub const TIMER_MODE_TSC_DEADLINE: u8 = 2;

/// Local vector table timer register.
#[bitfield(u32)]
pub struct LvtTimer {
    pub vector: u8,
    #[bits(4)]
    __: u8,
    pub delivery_status: bool,
    #[bits(3)]
    __: u8,
    pub mask: bool,
    #[bits(2)]
    pub timer_mode: u8,
    #[bits(13)]
    __: u16,
}

/// Spurious interrupt vector register.
#[bitfield(u32)]
pub struct SpuriousVector {
    pub vector: u8,
    pub software_enable: bool,
    pub focus_processor_checking: bool,
    #[bits(2)]
    __: u8,
    pub eoi_broadcast_suppression: bool,
    #[bits(19)]
    __: u32,
}

/// The local APIC of the boot processor.
#[cfg_attr(test, automock)]
pub trait LocalApic {
    /// True when CPUID.01H:ECX.TSC_Deadline\[bit 24\] is set.
    fn supports_tsc_deadline(&self) -> bool;

    fn read_register(&self, offset: u32) -> u32;

    fn write_register(&self, offset: u32, value: u32);

    fn read_tsc(&self) -> u64;

    /// Writes `IA32_TSC_DEADLINE`. Zero disarms the timer.
    fn write_tsc_deadline(&self, deadline: u64);
}

#[cfg(feature = "x64")]
pub use hardware::X86LocalApic;

#[cfg(feature = "x64")]
mod hardware {
    use core::{
        arch::x86_64 as arch,
        sync::atomic::{Ordering, fence},
    };

    use x86_64::registers::model_specific::Msr;

    use super::{LocalApic, MSR_IA32_APIC_BASE, MSR_IA32_TSC_DEADLINE, X2APIC_MSR_BASE_ADDRESS};

    const APIC_BASE_X2APIC_ENABLE: u64 = 1 << 10;
    const APIC_BASE_ADDRESS_MASK: u64 = 0xFFFF_F000;
    const CPUID_ECX_TSC_DEADLINE: u32 = 1 << 24;

    /// Local APIC of the executing processor, in whichever of xAPIC or x2APIC mode it runs.
    #[derive(Debug)]
    pub struct X86LocalApic {
        _private: (),
    }

    impl X86LocalApic {
        /// ## Safety
        ///
        /// The caller must be running in ring 0 with the local APIC MMIO page identity mapped.
        pub const unsafe fn new() -> Self {
            Self { _private: () }
        }

        fn apic_base(&self) -> u64 {
            // SAFETY: IA32_APIC_BASE is architectural on every processor with a local APIC.
            unsafe { Msr::new(MSR_IA32_APIC_BASE).read() }
        }

        fn x2apic_msr(offset: u32) -> Msr {
            Msr::new(X2APIC_MSR_BASE_ADDRESS + (offset >> 4))
        }
    }

    impl LocalApic for X86LocalApic {
        fn supports_tsc_deadline(&self) -> bool {
            // SAFETY: CPUID leaf 1 is always available in long mode.
            let leaf = unsafe { arch::__cpuid(0x01) };
            leaf.ecx & CPUID_ECX_TSC_DEADLINE != 0
        }

        fn read_register(&self, offset: u32) -> u32 {
            let base = self.apic_base();
            if base & APIC_BASE_X2APIC_ENABLE != 0 {
                // SAFETY: offsets handed in name x2APIC-accessible registers.
                unsafe { Self::x2apic_msr(offset).read() as u32 }
            } else {
                let register = ((base & APIC_BASE_ADDRESS_MASK) + offset as u64) as *const u32;
                // SAFETY: the xAPIC page is identity mapped per the constructor contract.
                unsafe { register.read_volatile() }
            }
        }

        fn write_register(&self, offset: u32, value: u32) {
            let base = self.apic_base();
            if base & APIC_BASE_X2APIC_ENABLE != 0 {
                // WRMSR to x2APIC registers is not serializing.
                fence(Ordering::SeqCst);
                // SAFETY: offsets handed in name x2APIC-accessible registers.
                unsafe { Self::x2apic_msr(offset).write(value as u64) }
            } else {
                let register = ((base & APIC_BASE_ADDRESS_MASK) + offset as u64) as *mut u32;
                // SAFETY: the xAPIC page is identity mapped per the constructor contract.
                unsafe { register.write_volatile(value) }
            }
        }

        fn read_tsc(&self) -> u64 {
            // SAFETY: RDTSC has no side effects.
            unsafe { arch::_rdtsc() }
        }

        fn write_tsc_deadline(&self, deadline: u64) {
            fence(Ordering::SeqCst);
            // SAFETY: the caller checked TSC-deadline support before arming the timer.
            unsafe { Msr::new(MSR_IA32_TSC_DEADLINE).write(deadline) }
        }
    }
}
