//! DeviceResolver: the set of multipath device paths the
//! command layer restricts every `lvm` invocation to, via `--devices`.
//!
//! vdsm keeps this as a module-level `_lvminfo.cache.devicesMonitor` (a
//! subclass living alongside `LVMCache`) that refreshes itself lazily and
//! is invalidated whenever multipath reconfigures devices
//! (lvm.py:228-260, `invalidate_devices`).

use crate::collaborators::MultipathDeviceEnumerator;
use std::sync::{Arc, Mutex};

struct DeviceState {
    paths: Vec<String>,
    dirty: bool,
}

/// Caches the device filter behind a dirty flag so repeated `current()`
/// calls within the same reload round don't re-invoke the enumerator.
pub struct DeviceResolver {
    enumerator: Arc<dyn MultipathDeviceEnumerator>,
    state: Mutex<DeviceState>,
}

impl DeviceResolver {
    pub fn new(enumerator: Arc<dyn MultipathDeviceEnumerator>) -> Self {
        DeviceResolver {
            enumerator,
            state: Mutex::new(DeviceState {
                paths: Vec::new(),
                dirty: true,
            }),
        }
    }

    /// Returns the current device filter, re-querying the collaborator
    /// only if this is the first call or [`Self::invalidate`] was called
    /// since the last one.
    pub fn current(&self) -> Vec<String> {
        let mut state = self.state.lock().unwrap();
        if state.dirty {
            match self.enumerator.current_device_paths() {
                Ok(paths) => {
                    state.paths = paths;
                    state.dirty = false;
                }
                Err(e) => {
                    // Keep the stale filter rather than poison the cache on
                    // a transient enumerator failure.
                    log::warn!("failed to refresh multipath device list: {e}");
                }
            }
        }
        state.paths.clone()
    }

    /// Marks the filter dirty so the next [`Self::current`] re-queries.
    /// Called after any operation that can change multipath's view of the
    /// world (pv create/remove, device add/remove) — vdsm's
    /// `invalidate_devices` (lvm.py:1765-1767).
    pub fn invalidate(&self) {
        self.state.lock().unwrap().dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::FakeDeviceEnumerator;

    #[test]
    fn current_queries_once_until_invalidated() {
        let fake = Arc::new(FakeDeviceEnumerator::default());
        *fake.paths.lock().unwrap() = vec!["/dev/mapper/mpatha".into()];
        let resolver = DeviceResolver::new(fake.clone());

        assert_eq!(resolver.current(), vec!["/dev/mapper/mpatha".to_string()]);
        assert_eq!(resolver.current(), vec!["/dev/mapper/mpatha".to_string()]);
        assert_eq!(*fake.calls.lock().unwrap(), 1);

        resolver.invalidate();
        *fake.paths.lock().unwrap() = vec!["/dev/mapper/mpathb".into()];
        assert_eq!(resolver.current(), vec!["/dev/mapper/mpathb".to_string()]);
        assert_eq!(*fake.calls.lock().unwrap(), 2);
    }
}
