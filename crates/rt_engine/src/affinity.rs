//! Component G: CPU affinity and engine/thread lifecycle helpers (spec
//! §4.G).
//!
//! Engines are assigned CPUs round-robin, skipping the core the primordial
//! (launching) thread is already pinned to, matching the original's
//! "don't double up on the CPU the caller is already using" placement.
//! Real OS-level pinning goes through `core_affinity`, the crate the
//! broader example pack reaches for when it needs this (the teacher's own
//! `vc_os`/`vc_task` stack has no affinity primitive; nothing here pretends
//! otherwise).

use crate::error::{Result, RuntimeError};
use crate::ids::EngineId;

/// Computes the CPU index engine `id` should be pinned to, skipping
/// `primordial_cpu` and wrapping around the available core list.
pub(crate) fn cpu_for_engine(id: EngineId, available: &[usize], primordial_cpu: usize) -> Option<usize> {
    if available.is_empty() {
        return None;
    }
    let others: Vec<usize> = available.iter().copied().filter(|&cpu| cpu != primordial_cpu).collect();
    let pool = if others.is_empty() { available } else { &others };
    pool.get(id.index() % pool.len()).copied()
}

#[cfg(feature = "affinity")]
pub(crate) fn pin_current_thread(id: EngineId, primordial_cpu: usize) -> Result<()> {
    let Some(core_ids) = core_affinity::get_core_ids() else {
        tracing::debug!(engine = %id, "no core affinity information available on this platform; skipping pinning");
        return Ok(());
    };
    let available: Vec<usize> = core_ids.iter().map(|c| c.id).collect();
    let Some(cpu) = cpu_for_engine(id, &available, primordial_cpu) else {
        return Ok(());
    };
    let target = core_affinity::CoreId { id: cpu };
    if core_affinity::set_for_current(target) {
        Ok(())
    } else {
        Err(RuntimeError::PinningFailed { engine: id, cpu })
    }
}

#[cfg(not(feature = "affinity"))]
pub(crate) fn pin_current_thread(_id: EngineId, _primordial_cpu: usize) -> Result<()> {
    Ok(())
}

/// Pins the calling (primordial) thread to the first CPU the platform
/// reports, returning that CPU's index (spec §6, `pin_primordial_thread()`).
///
/// Engine placement (see [`cpu_for_engine`]) skips whichever CPU this
/// returns, matching §4.G: "subsequent engines are pinned to a round-robin
/// CPU index that skips the primordial CPU". Pinning failure demotes to a
/// warning and reports CPU `0` rather than propagating a hard error. The
/// logical assignment is retained even when the OS call itself fails (spec
/// §7, "Pinning failure ... Warn once, disable pinning, continue").
#[cfg(feature = "affinity")]
pub fn pin_primordial_thread() -> usize {
    let Some(core_ids) = core_affinity::get_core_ids() else {
        tracing::debug!("no core affinity information available on this platform; primordial thread left unpinned");
        return 0;
    };
    let Some(first) = core_ids.first() else {
        return 0;
    };
    if !core_affinity::set_for_current(*first) {
        tracing::warn!(cpu = first.id, "failed to pin primordial thread, continuing unpinned");
    }
    first.id
}

#[cfg(not(feature = "affinity"))]
pub fn pin_primordial_thread() -> usize {
    0
}

/// Pins the calling engine thread to its assigned CPU (spec §6, `pin_thread()
/// -> cpu_id`), returning the CPU index whether or not the underlying OS
/// call actually succeeded (spec §7: pinning failure demotes to a warning,
/// never a hard error). Called once by [`crate::init_runtime`] from inside
/// each freshly spawned engine thread; not meant to be called from outside
/// the engine it pins (an `EngineId` can only be obtained from the runtime
/// itself, e.g. via [`crate::Handle::engine_id`]).
pub(crate) fn pin_thread(id: EngineId, primordial_cpu: usize) -> usize {
    match pin_current_thread(id, primordial_cpu) {
        Ok(()) => {}
        Err(err) => tracing::warn!(engine = %id, error = %err, "failed to pin thread, continuing unpinned"),
    }
    #[cfg(feature = "affinity")]
    {
        if let Some(core_ids) = core_affinity::get_core_ids() {
            let available: Vec<usize> = core_ids.iter().map(|c| c.id).collect();
            return cpu_for_engine(id, &available, primordial_cpu).unwrap_or(primordial_cpu);
        }
    }
    primordial_cpu
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robins_across_non_primordial_cpus() {
        let available = vec![0, 1, 2, 3];
        assert_eq!(cpu_for_engine(EngineId::new(0), &available, 0), Some(1));
        assert_eq!(cpu_for_engine(EngineId::new(1), &available, 0), Some(2));
        assert_eq!(cpu_for_engine(EngineId::new(2), &available, 0), Some(3));
        assert_eq!(cpu_for_engine(EngineId::new(3), &available, 0), Some(1));
    }

    #[test]
    fn falls_back_to_full_list_if_only_the_primordial_cpu_exists() {
        let available = vec![0];
        assert_eq!(cpu_for_engine(EngineId::new(0), &available, 0), Some(0));
    }

    #[test]
    fn empty_cpu_list_yields_no_assignment() {
        let available: Vec<usize> = vec![];
        assert_eq!(cpu_for_engine(EngineId::new(0), &available, 0), None);
    }
}
