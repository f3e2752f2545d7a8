//! CacheFacade: the public read surface wired on top of
//! [`crate::store::EntityStore`] and [`crate::reload::ReloadEngine`].
//!
//! One method per vdsm getter (`getPv`/`getAllPvs`/`getPvs`/`getVg`/
//! `getVgs`/`getAllVgs`/`getLv`/`getAllLvs`, lvm.py:727-921), each
//! recording a hit or a miss the same way vdsm's `@_update_stats`
//! decorator does (lvm.py:192-204).

use crate::error::CacheError;
use crate::reload::ReloadEngine;
use crate::stats::{Stats, StatsSnapshot};
use crate::store::EntityStore;
use crate::types::{LogicalVolume, PhysicalVolume, VolumeGroup};
use std::sync::Arc;

pub struct CacheFacade {
    store: Arc<EntityStore>,
    reload: Arc<ReloadEngine>,
    stats: Stats,
    /// Construction-time switch: when `false` (the default), `getAllLvs`
    /// never answers from the per-VG cache without revalidating first.
    cache_lvs: bool,
}

impl CacheFacade {
    pub fn new(store: Arc<EntityStore>, reload: Arc<ReloadEngine>, cache_lvs: bool) -> Self {
        CacheFacade { store, reload, stats: Stats::new(), cache_lvs }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn clear_stats(&self) {
        self.stats.clear();
    }

    fn record(&self, was_stale: bool) {
        if was_stale {
            self.stats.miss();
        } else {
            self.stats.hit();
        }
    }

    // --- PVs -------------------------------------------------------------

    pub fn get_pv(&self, name: &str) -> Result<PhysicalVolume, CacheError> {
        let was_stale = self.store.get_pv(name).map(|e| e.is_stale()).unwrap_or(true);
        self.reload.ensure_pv(name)?;
        self.record(was_stale);
        self.store
            .get_pv(name)
            .ok_or_else(|| CacheError::inaccessible_phys_dev(name.to_string()))?
            .fresh_or(|n| CacheError::inaccessible_phys_dev(n.to_string()))
            .map(|v| v.clone())
    }

    pub fn get_all_pvs(&self) -> Result<Vec<PhysicalVolume>, CacheError> {
        let was_stale = self.store.pv_stale();
        if was_stale {
            self.reload.reload_all_pvs()?;
        } else {
            // Reload only the subset that's individually stale, as a
            // single batch.
            let stale_names: Vec<String> = self
                .store
                .all_pvs()
                .into_iter()
                .filter(|e| e.is_stale())
                .map(|e| e.name().to_string())
                .collect();
            if !stale_names.is_empty() {
                self.reload.reload_pvs(&stale_names)?;
            }
        }
        self.record(was_stale);
        Ok(self
            .store
            .all_pvs()
            .into_iter()
            .filter_map(|e| e.fresh_or(|n| CacheError::inaccessible_phys_dev(n.to_string())).ok().cloned())
            .collect())
    }

    /// Fetches exactly the named PVs, reloading any that are missing or
    /// stale in one batched call (vdsm's `getPvs`, lvm.py:744-755).
    pub fn get_pvs(&self, names: &[String]) -> Result<Vec<PhysicalVolume>, CacheError> {
        let to_reload: Vec<String> = names
            .iter()
            .filter(|n| self.store.get_pv(n).map(|e| e.is_stale()).unwrap_or(true))
            .cloned()
            .collect();
        let any_stale = !to_reload.is_empty();
        self.reload.reload_pvs(&to_reload)?;
        self.record(any_stale);

        names
            .iter()
            .map(|n| {
                self.store
                    .get_pv(n)
                    .ok_or_else(|| CacheError::inaccessible_phys_dev(n.clone()))?
                    .fresh_or(|n| CacheError::inaccessible_phys_dev(n.to_string()))
                    .map(|v| v.clone())
            })
            .collect()
    }

    // --- VGs -------------------------------------------------------------

    pub fn get_vg(&self, name: &str) -> Result<VolumeGroup, CacheError> {
        let was_stale = self.store.get_vg(name).map(|e| e.is_stale()).unwrap_or(true);
        self.reload.ensure_vg(name)?;
        self.record(was_stale);
        self.store
            .get_vg(name)
            .ok_or_else(|| CacheError::vg_does_not_exist(name.to_string()))?
            .fresh_or(|n| CacheError::vg_does_not_exist(n.to_string()))
            .map(|v| v.clone())
    }

    /// Unlike [`Self::get_pvs`], vdsm's `getVGs` bypasses the cache
    /// entirely and always issues a fresh `vgs` call for the requested
    /// names (lvm.py:826-844).
    pub fn get_vgs(&self, names: &[String]) -> Result<Vec<VolumeGroup>, CacheError> {
        self.reload.reload_vgs(names)?;
        self.stats.miss();
        names
            .iter()
            .map(|n| {
                self.store
                    .get_vg(n)
                    .ok_or_else(|| CacheError::vg_does_not_exist(n.clone()))?
                    .fresh_or(|n| CacheError::vg_does_not_exist(n.to_string()))
                    .map(|v| v.clone())
            })
            .collect()
    }

    pub fn get_all_vgs(&self) -> Result<Vec<VolumeGroup>, CacheError> {
        let was_stale = self.store.vg_stale();
        if was_stale {
            self.reload.reload_all_vgs()?;
        } else {
            let stale_names: Vec<String> = self
                .store
                .all_vgs()
                .into_iter()
                .filter(|e| e.is_stale())
                .map(|e| e.name().to_string())
                .collect();
            if !stale_names.is_empty() {
                self.reload.reload_vgs(&stale_names)?;
            }
        }
        self.record(was_stale);
        Ok(self
            .store
            .all_vgs()
            .into_iter()
            .filter_map(|e| e.fresh_or(|n| CacheError::vg_does_not_exist(n.to_string())).ok().cloned())
            .collect())
    }

    pub fn get_vg_by_uuid(&self, uuid: &str) -> Result<VolumeGroup, CacheError> {
        let vgs = self.get_all_vgs()?;
        vgs.into_iter()
            .find(|vg| vg.uuid == uuid)
            .ok_or_else(|| CacheError::vg_does_not_exist_by_uuid(uuid.to_string()))
    }

    /// The single metadata PV of a VG (vdsm's `getVgMetadataPv`,
    /// lvm.py:1746-1748).
    pub fn vg_metadata_pv(&self, vg_name: &str) -> Result<PhysicalVolume, CacheError> {
        let vg = self.get_vg(vg_name)?;
        let candidates: Vec<PhysicalVolume> = self
            .get_pvs(&vg.pv_name)?
            .into_iter()
            .filter(|pv| pv.is_metadata_pv())
            .collect();
        if candidates.len() != 1 {
            return Err(crate::error::InvariantError::UnexpectedVolumeGroupMetadata {
                vg: vg_name.to_string(),
                found: candidates.len(),
            }
            .into());
        }
        Ok(candidates.into_iter().next().unwrap())
    }

    // --- LVs -------------------------------------------------------------

    pub fn get_lv(&self, vg: &str, lv: &str) -> Result<LogicalVolume, CacheError> {
        let was_stale = self.store.get_lv(vg, lv).map(|e| e.is_stale()).unwrap_or(true);
        self.reload.ensure_lv(vg, lv)?;
        self.record(was_stale);
        let vg_owned = vg.to_string();
        self.store
            .get_lv(vg, lv)
            .ok_or_else(|| CacheError::lv_does_not_exist(vg.to_string(), lv.to_string()))?
            .fresh_or(move |n| CacheError::lv_does_not_exist(vg_owned.clone(), n.to_string()))
            .map(|v| v.clone())
    }

    /// `getAllLvs` never surfaces Stale/Unreadable entries, and reloads
    /// whenever `cache_lvs` is off, the VG isn't marked fresh,
    /// or any of its LVs are individually stale.
    pub fn get_all_lvs(&self, vg: &str) -> Result<Vec<LogicalVolume>, CacheError> {
        let any_stale = self.store.lvs_in_vg(vg).iter().any(|e| e.is_stale());
        let was_stale = !self.cache_lvs || self.store.lvs_need_reload(vg) || any_stale;
        if was_stale {
            self.reload.reload_lvs_in_vg(vg)?;
        }
        self.record(was_stale);
        Ok(self
            .store
            .lvs_in_vg(vg)
            .into_iter()
            .filter_map(|e| e.fresh_or(|n| CacheError::lv_does_not_exist(vg.to_string(), n.to_string())).ok().cloned())
            .collect())
    }

    /// LVs across the whole VG carrying `tag` (vdsm's `lvsByTag`,
    /// lvm.py:1792-1795).
    pub fn lvs_by_tag(&self, vg: &str, tag: &str) -> Result<Vec<LogicalVolume>, CacheError> {
        Ok(self
            .get_all_lvs(vg)?
            .into_iter()
            .filter(|lv| lv.tags.iter().any(|t| t == tag))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::{FakeDeviceEnumerator, FakeExecutor};
    use crate::command::CommandRunner;
    use crate::devices::DeviceResolver;

    fn facade() -> (CacheFacade, Arc<FakeExecutor>) {
        let executor = Arc::new(FakeExecutor::new());
        let devices = Arc::new(DeviceResolver::new(Arc::new(FakeDeviceEnumerator::default())));
        let runner = Arc::new(CommandRunner::new(executor.clone(), devices, 4, true));
        let store = Arc::new(EntityStore::new());
        let reload = Arc::new(ReloadEngine::new(runner, store.clone()));
        (CacheFacade::new(store, reload, false), executor)
    }

    #[test]
    fn get_pv_counts_as_miss_then_hit() {
        let (cache, executor) = facade();
        executor.push_ok(vec!["uuid1|/dev/sda1|1000|vg0|vguuid|0|10|2|2|1000|2".to_string()]);
        cache.get_pv("/dev/sda1").unwrap();
        assert_eq!(cache.stats().misses, 1);

        cache.get_pv("/dev/sda1").unwrap();
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(executor.call_count(), 1);
    }

    #[test]
    fn get_all_pvs_loads_once_then_serves_from_cache() {
        let (cache, executor) = facade();
        executor.push_ok(vec!["uuid1|/dev/sda1|1000|vg0|vguuid|0|10|2|2|1000|2".to_string()]);
        let first = cache.get_all_pvs().unwrap();
        assert_eq!(first.len(), 1);

        let second = cache.get_all_pvs().unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(executor.call_count(), 1);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    /// Bulk skip: zero subprocess invocations when nothing is stale.
    #[test]
    fn get_all_pvs_issues_no_command_when_nothing_is_stale() {
        let (cache, executor) = facade();
        executor.push_ok(vec!["uuid1|/dev/sda1|1000|vg0|vguuid|0|10|2|2|1000|2".to_string()]);
        cache.get_all_pvs().unwrap();
        assert_eq!(executor.call_count(), 1);

        cache.get_all_pvs().unwrap();
        assert_eq!(executor.call_count(), 1);
    }

    #[test]
    fn get_vgs_always_misses_even_when_fresh() {
        let (cache, executor) = facade();
        executor.push_ok(vec![
            "uuid1|vg0|wz--n-|1000|500|4|10|5||100|50|2|1|/dev/sda".to_string(),
        ]);
        cache.get_vgs(&["vg0".to_string()]).unwrap();
        executor.push_ok(vec![
            "uuid1|vg0|wz--n-|1000|500|4|10|5||100|50|2|1|/dev/sda".to_string(),
        ]);
        cache.get_vgs(&["vg0".to_string()]).unwrap();

        assert_eq!(executor.call_count(), 2);
        assert_eq!(cache.stats().misses, 2);
    }

    #[test]
    fn get_vg_raises_does_not_exist_not_inaccessible_phys_dev() {
        let (cache, executor) = facade();
        executor.push_err(crate::error::LvmCommandError {
            cmd: vec!["vgs".into()],
            rc: 5,
            stdout: vec![],
            stderr: "not found".into(),
        });
        let err = cache.get_vg("missing").unwrap_err();
        assert!(matches!(err, CacheError::VolumeGroupDoesNotExist(..)));
    }

    #[test]
    fn get_lv_raises_logical_volume_does_not_exist() {
        let (cache, executor) = facade();
        executor.push_err(crate::error::LvmCommandError {
            cmd: vec!["lvs".into()],
            rc: 5,
            stdout: vec![],
            stderr: "not found".into(),
        });
        let err = cache.get_lv("vg0", "lv0").unwrap_err();
        assert!(matches!(err, CacheError::LogicalVolumeDoesNotExist { .. }));
    }

    #[test]
    fn vg_metadata_pv_requires_exactly_one_candidate() {
        let (cache, executor) = facade();
        executor.push_ok(vec![
            "uuid1|vg0|wz--n-|1000|500|4|10|5||100|50|2|1|/dev/sda".to_string(),
        ]);
        executor.push_ok(vec!["uuid2|/dev/sda|1000|vg0|uuid1|0|10|2|2|1000|1".to_string()]);

        let err = cache.vg_metadata_pv("vg0").unwrap_err();
        assert!(matches!(
            err,
            CacheError::Invariant(crate::error::InvariantError::UnexpectedVolumeGroupMetadata { .. })
        ));
    }

    #[test]
    fn get_all_lvs_without_cache_lvs_always_reloads() {
        let (cache, executor) = facade();
        executor.push_ok(vec!["uuid1|lv0|vg0|-wi-a-----|1000|0|/dev/sda(0)|".to_string()]);
        cache.get_all_lvs("vg0").unwrap();
        executor.push_ok(vec!["uuid1|lv0|vg0|-wi-a-----|1000|0|/dev/sda(0)|".to_string()]);
        cache.get_all_lvs("vg0").unwrap();
        assert_eq!(executor.call_count(), 2);
    }
}
