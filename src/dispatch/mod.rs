//! CPU feature detection and the per-signature dispatch state machine.
//!
//! ```text
//! Unprofiled ─call─► Profiling ─thresholds met─► Candidate ─compile ok─► Compiled
//!                                                  │  ▲                    │
//!                             transient failure ───┘  └──── evicted ───────┘
//!                                                  │
//!                     unsupported / invalid / too many failures
//!                                                  ▼
//!                                        PermanentFallback(reason)
//! ```

pub mod hw_info;

pub use hw_info::{detect_features, CpuFeatures};

use std::collections::HashMap;

use serde::Serialize;

use crate::types::{JitError, KernelSignature};

/// Why a signature stopped trying to compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FallbackReason {
    UnsupportedCpu,
    InvalidShape,
    OutOfExecutableMemory,
    CodeGenOverflow,
    MemoryProtection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SignatureState {
    /// Never called.
    Unprofiled,
    /// Called, below the profiler thresholds.
    Profiling,
    /// Hot; the next cache miss compiles.
    Candidate,
    /// A kernel is resident in the cache.
    Compiled,
    /// Always runs the fallback.
    PermanentFallback(FallbackReason),
}

impl SignatureState {
    pub fn is_compiled(self) -> bool {
        matches!(self, SignatureState::Compiled)
    }
}

#[derive(Debug, Clone, Copy)]
struct Record {
    state: SignatureState,
    failures: u32,
}

/// State for every signature seen by one context.
#[derive(Debug)]
pub struct DispatchTable {
    records: HashMap<KernelSignature, Record>,
    max_failures: u32,
}

impl DispatchTable {
    /// `max_failures` consecutive transient compile failures park a
    /// signature in `PermanentFallback`.
    pub fn new(max_failures: u32) -> Self {
        Self { records: HashMap::new(), max_failures: max_failures.max(1) }
    }

    pub fn state(&self, sig: &KernelSignature) -> SignatureState {
        self.records.get(sig).map_or(SignatureState::Unprofiled, |r| r.state)
    }

    /// Consecutive transient failures since the last success.
    pub fn failures(&self, sig: &KernelSignature) -> u32 {
        self.records.get(sig).map_or(0, |r| r.failures)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&KernelSignature, SignatureState)> {
        self.records.iter().map(|(s, r)| (s, r.state))
    }

    /// Number of signatures currently in `state`.
    pub fn count(&self, state: SignatureState) -> usize {
        self.records.values().filter(|r| r.state == state).count()
    }

    fn set(&mut self, sig: &KernelSignature, state: SignatureState) {
        let record = self
            .records
            .entry(*sig)
            .or_insert(Record { state: SignatureState::Unprofiled, failures: 0 });
        if record.state != state {
            log::debug!("dispatch: {sig} {:?} -> {state:?}", record.state);
            record.state = state;
        }
    }

    /// A call to `sig` was counted; `candidate` is the profiler's verdict.
    pub fn on_call(&mut self, sig: &KernelSignature, candidate: bool) -> SignatureState {
        match self.state(sig) {
            SignatureState::Unprofiled | SignatureState::Profiling => {
                let next = if candidate { SignatureState::Candidate } else { SignatureState::Profiling };
                self.set(sig, next);
                next
            }
            s => s,
        }
    }

    /// Force `sig` to Candidate (explicit compile requests).
    pub fn promote(&mut self, sig: &KernelSignature) {
        if !matches!(self.state(sig), SignatureState::Compiled | SignatureState::PermanentFallback(_)) {
            self.set(sig, SignatureState::Candidate);
        }
    }

    pub fn on_compiled(&mut self, sig: &KernelSignature) {
        self.set(sig, SignatureState::Compiled);
        if let Some(r) = self.records.get_mut(sig) {
            r.failures = 0;
        }
    }

    /// Classify a compile failure and return the resulting state.
    pub fn on_compile_failed(&mut self, sig: &KernelSignature, err: &JitError) -> SignatureState {
        let reason = if err.is_transient() {
            let max = self.max_failures;
            let record = self
                .records
                .entry(*sig)
                .or_insert(Record { state: SignatureState::Candidate, failures: 0 });
            record.failures += 1;
            if record.failures < max {
                log::warn!("dispatch: compiling {sig} failed ({err}), attempt {}/{max}", record.failures);
                None
            } else if matches!(err, JitError::OutOfExecutableMemory { .. }) {
                Some(FallbackReason::OutOfExecutableMemory)
            } else {
                Some(FallbackReason::CodeGenOverflow)
            }
        } else {
            Some(match err {
                JitError::UnsupportedCpu { .. } => FallbackReason::UnsupportedCpu,
                JitError::InvalidShape { .. } => FallbackReason::InvalidShape,
                _ => FallbackReason::MemoryProtection,
            })
        };
        let next = match reason {
            Some(reason) => {
                log::warn!("dispatch: {sig} falls back permanently: {err}");
                SignatureState::PermanentFallback(reason)
            }
            None => SignatureState::Candidate,
        };
        self.set(sig, next);
        next
    }

    /// The kernel for `sig` is no longer resident.
    pub fn on_evicted(&mut self, sig: &KernelSignature) {
        if self.state(sig).is_compiled() {
            self.set(sig, SignatureState::Candidate);
        }
    }

    /// Drop everything known about `sig`; its next call starts over as
    /// `Unprofiled`. Returns whether a record existed.
    pub fn forget(&mut self, sig: &KernelSignature) -> bool {
        let removed = self.records.remove(sig);
        if let Some(record) = removed {
            log::debug!("dispatch: forgot {sig} ({:?})", record.state);
        }
        removed.is_some()
    }

    /// Every resident kernel is gone (cache cleared).
    pub fn on_cache_cleared(&mut self) {
        for record in self.records.values_mut() {
            if record.state == SignatureState::Compiled {
                record.state = SignatureState::Candidate;
            }
        }
    }

    /// Executable memory was reclaimed: signatures parked for lack of it
    /// may compile again. Returns how many were revived.
    pub fn revive_out_of_memory(&mut self) -> usize {
        let mut revived = 0;
        for record in self.records.values_mut() {
            if record.state == SignatureState::PermanentFallback(FallbackReason::OutOfExecutableMemory) {
                record.state = SignatureState::Candidate;
                record.failures = 0;
                revived += 1;
            }
        }
        revived
    }
}
