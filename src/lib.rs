//! In-process LVM metadata cache: one process-wide source of truth for
//! PV/VG/LV state, backed by the `lvm`-family command-line tools.
//!
//! Construct one [`LvmCache`] and share it (it's `Clone`, every field is
//! an `Arc`) rather than reaching for a singleton — the previous design
//! this crate replaces kept its state behind a module-level global,
//! which made it impossible to run two independently-configured caches
//! in one process (e.g. in tests). See `DESIGN.md` for the full
//! rationale.

pub mod cache;
pub mod collaborators;
pub mod command;
pub mod config;
pub mod devices;
pub mod error;
pub mod mutation;
pub mod parser;
pub mod reload;
pub mod stats;
pub mod store;
pub mod types;

use cache::CacheFacade;
use collaborators::{
    BlockSizeProbe, DeviceMapperAdmin, LvDeviceNodeProbe, LvmCommandExecutor,
    MultipathDeviceEnumerator, OwnershipAdmin, ProcessInfoLookup, SystemLvmExecutor,
};
use command::CommandRunner;
use devices::DeviceResolver;
use error::CacheError;
use mutation::MutationAPI;
use reload::ReloadEngine;
use std::sync::Arc;
use store::EntityStore;

/// Everything needed to construct an [`LvmCache`] beyond the fixed
/// command/executor wiring: the handful of settings [`config::Config`]
/// loads from disk, plus the real-system collaborators that have no
/// generic stdlib equivalent (device-mapper, process lookup, block
/// sizes, ownership).
pub struct LvmCacheBuilder {
    executor: Arc<dyn LvmCommandExecutor>,
    device_enumerator: Arc<dyn MultipathDeviceEnumerator>,
    dm_admin: Arc<dyn DeviceMapperAdmin>,
    proc_lookup: Arc<dyn ProcessInfoLookup>,
    block_probe: Arc<dyn BlockSizeProbe>,
    ownership: Arc<dyn OwnershipAdmin>,
    device_probe: Arc<dyn LvDeviceNodeProbe>,
    max_commands: u32,
    use_polld: bool,
    cache_lvs: bool,
    owner_user: String,
    owner_group: String,
}

impl LvmCacheBuilder {
    pub fn new(
        device_enumerator: Arc<dyn MultipathDeviceEnumerator>,
        dm_admin: Arc<dyn DeviceMapperAdmin>,
        proc_lookup: Arc<dyn ProcessInfoLookup>,
        block_probe: Arc<dyn BlockSizeProbe>,
        ownership: Arc<dyn OwnershipAdmin>,
        device_probe: Arc<dyn LvDeviceNodeProbe>,
    ) -> Self {
        LvmCacheBuilder {
            executor: Arc::new(SystemLvmExecutor::default()),
            device_enumerator,
            dm_admin,
            proc_lookup,
            block_probe,
            ownership,
            device_probe,
            max_commands: command::DEFAULT_MAX_COMMANDS,
            use_polld: true,
            cache_lvs: false,
            owner_user: "vdsm".to_string(),
            owner_group: "kvm".to_string(),
        }
    }

    pub fn with_config(mut self, config: &config::Config) -> Self {
        self.max_commands = config.max_commands;
        self.use_polld = config.use_polld;
        self.cache_lvs = config.cache_lvs;
        self.owner_user = config.owner_user.clone();
        self.owner_group = config.owner_group.clone();
        self
    }

    pub fn build(self) -> LvmCache {
        let devices = Arc::new(DeviceResolver::new(self.device_enumerator));
        let runner = Arc::new(CommandRunner::new(
            self.executor,
            devices,
            self.max_commands,
            self.use_polld,
        ));
        let store = Arc::new(EntityStore::new());
        let reload = Arc::new(ReloadEngine::new(runner.clone(), store.clone()));
        let cache = Arc::new(CacheFacade::new(store.clone(), reload.clone(), self.cache_lvs));
        let mutation = Arc::new(MutationAPI::new(
            runner,
            store,
            reload.clone(),
            self.dm_admin,
            self.proc_lookup,
            self.block_probe,
            self.ownership,
            self.device_probe,
            self.owner_user,
            self.owner_group,
        ));
        LvmCache { cache, mutation, reload }
    }
}

/// The cache's public handle: a read side ([`CacheFacade`]) and a write
/// side ([`MutationAPI`]) sharing one [`EntityStore`]. Cheap to clone —
/// every field is an `Arc` over the same underlying state.
#[derive(Clone)]
pub struct LvmCache {
    cache: Arc<CacheFacade>,
    mutation: Arc<MutationAPI>,
    reload: Arc<ReloadEngine>,
}

impl LvmCache {
    pub fn reads(&self) -> &CacheFacade {
        &self.cache
    }

    pub fn mutations(&self) -> &MutationAPI {
        &self.mutation
    }

    /// Primes the cache with a full PV/VG load, leaving LVs to load
    /// lazily on first access. Call once at process start.
    pub fn bootstrap(&self) -> Result<(), CacheError> {
        self.reload.reload_all_pvs()?;
        self.reload.reload_all_vgs()?;
        Ok(())
    }

    /// Like [`Self::bootstrap`], but also loads every LV up front and
    /// deactivates any that `is_prepared` reports as no longer needed by
    /// a running VM (vdsm's `bootstrap(skiplvs=...)`, lvm.py via
    /// `hsm.py`'s startup path). `is_prepared` is given `"vg/lv"` and
    /// decides whether that LV should stay active.
    pub fn bootstrap_and_deactivate_unused(
        &self,
        is_prepared: impl Fn(&str) -> bool,
    ) -> Result<(), CacheError> {
        self.reload.reload_all_pvs()?;
        self.reload.reload_all_vgs()?;
        self.reload.reload_all_lvs()?;

        for vg in self.cache.get_all_vgs()? {
            let active_lvs: Vec<String> = self
                .cache
                .get_all_lvs(&vg.name)?
                .into_iter()
                .filter(|lv| lv.active())
                .map(|lv| lv.name)
                .collect();
            let to_deactivate: Vec<String> = active_lvs
                .into_iter()
                .filter(|lv| !is_prepared(&format!("{}/{}", vg.name, lv)))
                .collect();
            if !to_deactivate.is_empty() {
                self.mutation.deactivate_lvs(&vg.name, &to_deactivate)?;
            }
        }
        Ok(())
    }
}
