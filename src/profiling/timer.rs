//! Cycle counting for per-call profiling.
//!
//! On x86-64 the counter is the TSC read with `rdtscp`, fenced by `lfence`
//! on both sides of the timed region. Elsewhere an `Instant`-based
//! pseudo-cycle count (3 cycles per ns) keeps the units comparable.

use std::sync::OnceLock;

/// Current cycle counter value.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn read_cycles() -> u64 {
    let lo: u32;
    let hi: u32;
    // SAFETY: rdtscp is unprivileged on every x86-64 OS we target; the aux
    // value in ecx is discarded.
    unsafe {
        core::arch::asm!(
            "rdtscp",
            out("eax") lo,
            out("edx") hi,
            out("ecx") _,
            options(nostack, nomem),
        );
    }
    ((hi as u64) << 32) | lo as u64
}

/// Keep earlier instructions out of the timed region.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn serialize() {
    // SAFETY: lfence has no operands and no side effects beyond ordering.
    unsafe { core::arch::asm!("lfence", options(nostack, nomem)) };
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn read_cycles() -> u64 {
    static EPOCH: OnceLock<std::time::Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(std::time::Instant::now);
    (epoch.elapsed().as_nanos() as u64).wrapping_mul(3)
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn serialize() {}

static CYCLES_PER_SEC: OnceLock<u64> = OnceLock::new();

/// Counter frequency in Hz, measured once per process.
pub fn cycles_per_sec() -> u64 {
    *CYCLES_PER_SEC.get_or_init(measure_frequency)
}

/// Convert a cycle count to milliseconds.
pub fn cycles_to_ms(cycles: u64) -> f64 {
    cycles as f64 * 1e3 / cycles_per_sec() as f64
}

fn measure_frequency() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        if let Some(hz) = cpuid_tsc_hz() {
            return hz;
        }
    }
    let c0 = read_cycles();
    let t0 = std::time::Instant::now();
    std::thread::sleep(std::time::Duration::from_millis(10));
    let cycles = read_cycles().wrapping_sub(c0);
    let secs = t0.elapsed().as_secs_f64();
    if secs > 0.0 && cycles > 0 {
        (cycles as f64 / secs) as u64
    } else {
        3_000_000_000
    }
}

/// TSC frequency from CPUID leaf 0x15 (crystal × ratio), if reported.
#[cfg(target_arch = "x86_64")]
fn cpuid_tsc_hz() -> Option<u64> {
    let max_leaf = core::arch::x86_64::__cpuid(0).eax;
    if max_leaf < 0x15 {
        return None;
    }
    let leaf = core::arch::x86_64::__cpuid(0x15);
    let (denom, numer, crystal) = (leaf.eax as u64, leaf.ebx as u64, leaf.ecx as u64);
    if denom == 0 || numer == 0 || crystal == 0 {
        return None;
    }
    Some(crystal * numer / denom)
}

/// A started cycle measurement.
#[derive(Debug, Clone, Copy)]
pub struct CycleTimer {
    start: u64,
}

impl CycleTimer {
    #[inline(always)]
    pub fn start() -> Self {
        serialize();
        Self { start: read_cycles() }
    }

    /// Cycles since [`start`](Self::start). Never zero, so every timed call
    /// contributes to the cycle totals.
    #[inline(always)]
    pub fn elapsed(&self) -> u64 {
        let now = read_cycles();
        serialize();
        now.wrapping_sub(self.start).max(1)
    }
}
