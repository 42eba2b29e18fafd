// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Monotonic time from the CPU performance counters.
//!
//! Counter 1 is the kernel's: it runs in elapsed-time mode, one count per
//! CPU cycle (5 ns at 200 MHz), from `init` until shutdown. The hardware
//! counter is 48 bits wide, which wraps after about 16 days; reads extend
//! it to 64 bits by noticing when the raw value goes backwards. Counter 2
//! is left to applications for profiling.

use abi::KernError;

use crate::arch;
use crate::err::KernResult;
use crate::regs;
use crate::time::Timestamp;

/// Nanoseconds per count in CPU-clock mode.
pub const NS_PER_CPU_COUNT: u64 = 5;
/// External bus period; bus-ratio mode ticks at a 24th of it.
pub const BUS_PERIOD_NS: u64 = 10;

const KERNEL_COUNTER: usize = 0;
const FREE_COUNTER: usize = 1;

/// What a performance counter counts time in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ClockType {
    Cpu,
    BusRatio,
}

/// Converts a count to nanoseconds for a counter of the given type.
pub fn counts_to_ns(counts: u64, clock: ClockType) -> u64 {
    match clock {
        ClockType::Cpu => counts.saturating_mul(NS_PER_CPU_COUNT),
        ClockType::BusRatio => {
            (u128::from(counts) * u128::from(BUS_PERIOD_NS) / 24) as u64
        }
    }
}

#[derive(Debug)]
pub struct Clock {
    last_raw: u64,
    high: u64,
    free_mode: u8,
    free_clock: ClockType,
}

impl Clock {
    pub const fn new() -> Self {
        Self {
            last_raw: 0,
            high: 0,
            free_mode: regs::PMCR_ELAPSED_TIME_MODE,
            free_clock: ClockType::Cpu,
        }
    }

    /// Clears and starts the kernel counter.
    pub fn init(&mut self) {
        arch::perf_control(KERNEL_COUNTER, 0);
        arch::perf_control(KERNEL_COUNTER, regs::PMCR_CLR);
        arch::perf_control(
            KERNEL_COUNTER,
            regs::pmcr_word(regs::PMCR_ELAPSED_TIME_MODE, false),
        );
        self.last_raw = 0;
        self.high = 0;
    }

    pub fn shutdown(&mut self) {
        arch::perf_control(KERNEL_COUNTER, 0);
        arch::perf_control(FREE_COUNTER, 0);
    }

    /// Raw kernel counter extended to 64 bits.
    pub fn counts(&mut self) -> u64 {
        let raw = arch::perf_read(KERNEL_COUNTER);
        if raw < self.last_raw {
            self.high += regs::PMCTR_MASK + 1;
        }
        self.last_raw = raw;
        self.high | raw
    }

    pub fn ns64(&mut self) -> u64 {
        let c = self.counts();
        self.ns_from(c)
    }

    pub fn us64(&mut self) -> u64 {
        self.ns64() / 1_000
    }

    pub fn ms64(&mut self) -> u64 {
        self.ns64() / 1_000_000
    }

    pub fn now(&mut self) -> Timestamp {
        Timestamp::from(self.ns64())
    }

    /// Nanoseconds for `counts` of the kernel counter.
    pub fn ns_from(&self, counts: u64) -> u64 {
        counts_to_ns(counts, ClockType::Cpu)
    }

    /// Selects what the free counter counts; it is left stopped.
    pub fn free_counter_config(&mut self, mode: u8, clock: ClockType) -> KernResult<()> {
        if u16::from(mode) & !regs::PMCR_PMM_MASK != 0 || mode == 0 {
            return Err(KernError::InvalidArgument);
        }
        self.free_mode = mode;
        self.free_clock = clock;
        arch::perf_control(FREE_COUNTER, self.free_word() & !regs::PMCR_RUN);
        Ok(())
    }

    pub fn free_counter_start(&mut self) {
        arch::perf_control(FREE_COUNTER, self.free_word());
    }

    pub fn free_counter_stop(&mut self) {
        arch::perf_control(FREE_COUNTER, self.free_word() & !regs::PMCR_RUN);
    }

    /// Zeroes the free counter without changing whether it runs.
    pub fn free_counter_clear(&mut self) {
        let running = arch::pmcr_regs().pmcr2.get() & regs::PMCR_RUN;
        let word = (self.free_word() & !regs::PMCR_RUN) | running;
        arch::perf_control(FREE_COUNTER, word | regs::PMCR_CLR);
    }

    pub fn free_counter_read(&self) -> u64 {
        arch::perf_read(FREE_COUNTER)
    }

    /// The free counter as nanoseconds, when it counts elapsed time.
    pub fn free_counter_ns(&self) -> Option<u64> {
        (self.free_mode == regs::PMCR_ELAPSED_TIME_MODE)
            .then(|| counts_to_ns(self.free_counter_read(), self.free_clock))
    }

    fn free_word(&self) -> u16 {
        regs::pmcr_word(self.free_mode, self.free_clock == ClockType::BusRatio)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn counts_are_five_ns() {
        let mut c = Clock::new();
        c.init();
        arch::set_cycles_per_read(0);
        let t0 = c.ns64();
        arch::advance_ns(1_000);
        assert_eq!(c.ns64() - t0, 1_000);
        assert_eq!(c.ns_from(200), 1_000);
    }

    #[test]
    fn bus_ratio_conversion() {
        assert_eq!(counts_to_ns(24, ClockType::BusRatio), 10);
        assert_eq!(counts_to_ns(12, ClockType::BusRatio), 5);
    }

    #[test]
    fn wrap_is_extended() {
        let mut c = Clock::new();
        c.init();
        arch::preset_counter(0, regs::PMCTR_MASK - 30);
        let before = c.counts();
        let after = c.counts();
        assert!(after > before);
        assert!(after > regs::PMCTR_MASK);
    }

    #[test]
    fn free_counter_in_ratio_mode() {
        let mut c = Clock::new();
        c.init();
        c.free_counter_config(regs::PMCR_ELAPSED_TIME_MODE, ClockType::BusRatio)
            .unwrap();
        assert_eq!(c.free_counter_read(), 0);
        c.free_counter_start();
        arch::set_cycles_per_read(0);
        arch::advance_ns(500);
        assert_eq!(c.free_counter_ns(), Some(500));
        c.free_counter_stop();
        c.free_counter_clear();
        assert_eq!(c.free_counter_read(), 0);
        assert_eq!(
            c.free_counter_config(0x40, ClockType::Cpu),
            Err(KernError::InvalidArgument)
        );
    }

    proptest! {
        #[test]
        fn ns64_is_monotonic(
            start in 0u64..regs::PMCTR_MASK,
            steps in proptest::collection::vec(0u64..1_000_000, 1..32),
        ) {
            let mut c = Clock::new();
            c.init();
            arch::preset_counter(0, start);
            let mut last = c.ns64();
            for s in steps {
                arch::advance_ns(s);
                let t = c.ns64();
                prop_assert!(last <= t);
                last = t;
            }
        }
    }
}
