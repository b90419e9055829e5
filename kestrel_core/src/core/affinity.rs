//! CPU affinity helpers for reactor threads.
//!
//! A process may host multiple independent reactors on different threads for
//! horizontal scaling. Pinning each reactor thread to its own core eliminates
//! scheduler migration and keeps the packet arena hot in that core's cache.

use crate::error::{KestrelError, KestrelResult};

/// Pin the current thread to a specific CPU core.
///
/// # Arguments
/// * `core_index` - The CPU core index to pin to (0-indexed)
///
/// # Example
/// ```rust,no_run
/// use kestrel_core::pin_thread_to_core;
///
/// // Pin the reactor thread to CPU core 2
/// pin_thread_to_core(2).expect("failed to pin thread");
/// ```
pub fn pin_thread_to_core(core_index: usize) -> KestrelResult<()> {
    let cores = core_affinity::get_core_ids()
        .ok_or_else(|| KestrelError::invalid_input("cannot enumerate CPU cores"))?;

    let target = cores
        .into_iter()
        .find(|c| c.id == core_index)
        .ok_or_else(|| {
            KestrelError::invalid_input(format!("CPU core {} does not exist", core_index))
        })?;

    if core_affinity::set_for_current(target) {
        Ok(())
    } else {
        log::warn!("failed to pin thread to core {}", core_index);
        Err(KestrelError::last_os_error())
    }
}
