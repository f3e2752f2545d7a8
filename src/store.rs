//! EntityStore: the three PV/VG/LV maps plus the
//! freshlv/stalepv/stalevg bookkeeping that decides whether a getter can
//! answer from cache or must call into [`crate::reload`] first.
//!
//! Mirrors vdsm's `LVMCache.__init__` state (lvm.py:228-260): `_pvs`,
//! `_vgs`, `_lvs` dicts, `_stalepv`/`_stalevg` flags and `_lvs_to_reload`.
//! All of it lives behind a single lock — vdsm's `self._lock` — since
//! the cross-entity invalidation rules in `mutation.rs` need to touch
//! more than one map atomically.

use crate::types::{Entry, LogicalVolume, Named, PhysicalVolume, VolumeGroup};
use std::collections::HashMap;
use std::sync::Mutex;

struct StoreState {
    pvs: HashMap<String, Entry<PhysicalVolume>>,
    vgs: HashMap<String, Entry<VolumeGroup>>,
    lvs: HashMap<(String, String), Entry<LogicalVolume>>,
    /// True once every PV has been loaded at least once; until then a
    /// full reload is needed rather than a partial one (vdsm's
    /// `_stalepv`, default `True`).
    stale_pv: bool,
    stale_vg: bool,
    /// VG names whose LVs need a reload even though the VG itself is
    /// fresh (vdsm's `_lvs_to_reload`, a per-VG flag checked by
    /// `_lvs_needs_reload`, lvm.py:654-659).
    lvs_to_reload: HashMap<String, bool>,
}

pub struct EntityStore {
    state: Mutex<StoreState>,
}

impl Default for EntityStore {
    fn default() -> Self {
        EntityStore::new()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        EntityStore {
            state: Mutex::new(StoreState {
                pvs: HashMap::new(),
                vgs: HashMap::new(),
                lvs: HashMap::new(),
                stale_pv: true,
                stale_vg: true,
                lvs_to_reload: HashMap::new(),
            }),
        }
    }

    // --- PVs ---------------------------------------------------------

    pub fn pv_stale(&self) -> bool {
        self.state.lock().unwrap().stale_pv
    }

    pub fn set_pv_stale(&self, stale: bool) {
        self.state.lock().unwrap().stale_pv = stale;
    }

    pub fn get_pv(&self, name: &str) -> Option<Entry<PhysicalVolume>> {
        self.state.lock().unwrap().pvs.get(name).cloned()
    }

    pub fn all_pvs(&self) -> Vec<Entry<PhysicalVolume>> {
        self.state.lock().unwrap().pvs.values().cloned().collect()
    }

    /// Snapshot of every known PV name, taken under the lock
    /// "implicit iteration over current maps must snapshot keys first").
    pub fn all_pv_names(&self) -> Vec<String> {
        self.state.lock().unwrap().pvs.keys().cloned().collect()
    }

    pub fn upsert_pv(&self, pv: PhysicalVolume) {
        let mut state = self.state.lock().unwrap();
        state.pvs.insert(pv.name.clone(), Entry::Fresh(pv));
    }

    pub fn mark_pv_stale(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .pvs
            .insert(name.to_string(), Entry::Stale { name: name.to_string() });
    }

    pub fn mark_pv_unreadable(&self, name: &str) {
        self.state.lock().unwrap().pvs.insert(
            name.to_string(),
            Entry::Unreadable { name: name.to_string() },
        );
    }

    pub fn remove_pv(&self, name: &str) {
        self.state.lock().unwrap().pvs.remove(name);
    }

    pub fn replace_all_pvs(&self, pvs: Vec<PhysicalVolume>) {
        let mut state = self.state.lock().unwrap();
        state.pvs = pvs
            .into_iter()
            .map(|pv| (pv.name.clone(), Entry::Fresh(pv)))
            .collect();
        state.stale_pv = false;
    }

    pub fn invalidate_all_pvs(&self) {
        let mut state = self.state.lock().unwrap();
        for entry in state.pvs.values_mut() {
            let name = entry.name_owned();
            *entry = Entry::Stale { name };
        }
        state.stale_pv = true;
    }

    // --- VGs -----------------------------------------------------------

    pub fn vg_stale(&self) -> bool {
        self.state.lock().unwrap().stale_vg
    }

    pub fn set_vg_stale(&self, stale: bool) {
        self.state.lock().unwrap().stale_vg = stale;
    }

    pub fn get_vg(&self, name: &str) -> Option<Entry<VolumeGroup>> {
        self.state.lock().unwrap().vgs.get(name).cloned()
    }

    pub fn all_vgs(&self) -> Vec<Entry<VolumeGroup>> {
        self.state.lock().unwrap().vgs.values().cloned().collect()
    }

    pub fn all_vg_names(&self) -> Vec<String> {
        self.state.lock().unwrap().vgs.keys().cloned().collect()
    }

    pub fn upsert_vg(&self, vg: VolumeGroup) {
        let mut state = self.state.lock().unwrap();
        state.vgs.insert(vg.name.clone(), Entry::Fresh(vg));
    }

    pub fn mark_vg_stale(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .vgs
            .insert(name.to_string(), Entry::Stale { name: name.to_string() });
    }

    pub fn mark_vg_unreadable(&self, name: &str) {
        self.state.lock().unwrap().vgs.insert(
            name.to_string(),
            Entry::Unreadable { name: name.to_string() },
        );
    }

    pub fn remove_vg(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.vgs.remove(name);
        state.lvs_to_reload.remove(name);
    }

    pub fn invalidate_all_vgs(&self) {
        let mut state = self.state.lock().unwrap();
        for entry in state.vgs.values_mut() {
            let name = entry.name_owned();
            *entry = Entry::Stale { name };
        }
        state.stale_vg = true;
    }

    // --- LVs -------------------------------------------------------------

    pub fn lvs_need_reload(&self, vg: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .lvs_to_reload
            .get(vg)
            .copied()
            .unwrap_or(true)
    }

    pub fn set_lvs_need_reload(&self, vg: &str, needs: bool) {
        self.state
            .lock()
            .unwrap()
            .lvs_to_reload
            .insert(vg.to_string(), needs);
    }

    pub fn get_lv(&self, vg: &str, lv: &str) -> Option<Entry<LogicalVolume>> {
        self.state
            .lock()
            .unwrap()
            .lvs
            .get(&(vg.to_string(), lv.to_string()))
            .cloned()
    }

    pub fn lvs_in_vg(&self, vg: &str) -> Vec<Entry<LogicalVolume>> {
        self.state
            .lock()
            .unwrap()
            .lvs
            .iter()
            .filter(|((v, _), _)| v == vg)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn upsert_lv(&self, lv: LogicalVolume) {
        let mut state = self.state.lock().unwrap();
        let key = (lv.vg_name.clone(), lv.name.clone());
        state.lvs.insert(key, Entry::Fresh(lv));
    }

    pub fn mark_lv_stale(&self, vg: &str, lv: &str) {
        self.state.lock().unwrap().lvs.insert(
            (vg.to_string(), lv.to_string()),
            Entry::Stale { name: lv.to_string() },
        );
    }

    pub fn mark_lv_unreadable(&self, vg: &str, lv: &str) {
        self.state.lock().unwrap().lvs.insert(
            (vg.to_string(), lv.to_string()),
            Entry::Unreadable { name: lv.to_string() },
        );
    }

    pub fn remove_lv(&self, vg: &str, lv: &str) {
        self.state
            .lock()
            .unwrap()
            .lvs
            .remove(&(vg.to_string(), lv.to_string()));
    }

    /// Drops every LV belonging to `vg`, e.g. after the VG itself is
    /// removed (vdsm's `_removelvs`, lvm.py:718-724).
    pub fn remove_lvs_in_vg(&self, vg: &str) {
        self.state.lock().unwrap().lvs.retain(|(v, _), _| v != vg);
    }

    pub fn invalidate_lvs_in_vg(&self, vg: &str) {
        let mut state = self.state.lock().unwrap();
        let keys: Vec<(String, String)> = state
            .lvs
            .keys()
            .filter(|(v, _)| v == vg)
            .cloned()
            .collect();
        for key in keys {
            let name = key.1.clone();
            state.lvs.insert(key, Entry::Stale { name });
        }
        state.lvs_to_reload.insert(vg.to_string(), true);
    }

    pub fn invalidate_all_lvs(&self) {
        let mut state = self.state.lock().unwrap();
        let keys: Vec<(String, String)> = state.lvs.keys().cloned().collect();
        for key in keys {
            let name = key.1.clone();
            state.lvs.insert(key, Entry::Stale { name });
        }
        let vgs: Vec<String> = state.lvs_to_reload.keys().cloned().collect();
        for vg in vgs {
            state.lvs_to_reload.insert(vg, true);
        }
    }

    /// Atomically replaces the whole LV map, used by the bootstrap-only
    /// full LV reload. Per-VG reload
    /// flags are left to the caller, who repopulates them from the VG
    /// names actually seen in the new data.
    pub fn clear_lvs(&self) {
        self.state.lock().unwrap().lvs.clear();
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.pvs.clear();
        state.vgs.clear();
        state.lvs.clear();
        state.lvs_to_reload.clear();
        state.stale_pv = true;
        state.stale_vg = true;
    }
}

trait EntryNameOwned {
    fn name_owned(&self) -> String;
}

impl<T: Named> EntryNameOwned for Entry<T> {
    fn name_owned(&self) -> String {
        match self {
            Entry::Fresh(v) => v.name().to_string(),
            Entry::Stale { name } | Entry::Unreadable { name } => name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LvAttr, VgAttr};

    fn pv(name: &str) -> PhysicalVolume {
        PhysicalVolume {
            uuid: "u".into(),
            name: name.into(),
            size: 0,
            vg_name: "vg0".into(),
            vg_uuid: "vgu".into(),
            pe_start: 0,
            pe_count: 0,
            pe_alloc_count: 0,
            mda_count: 2,
            dev_size: 0,
            mda_used_count: 2,
        }
    }

    fn vg(name: &str) -> VolumeGroup {
        VolumeGroup {
            uuid: "u".into(),
            name: name.into(),
            attr: VgAttr {
                permission: 'w',
                resizeable: 'z',
                exported: '-',
                partial: '-',
                allocation: 'n',
                clustered: '-',
            },
            size: 0,
            free: 0,
            extent_size: 0,
            extent_count: 0,
            free_count: 0,
            tags: vec![],
            vg_mda_size: 0,
            vg_mda_free: 0,
            lv_count: 0,
            pv_count: 0,
            pv_name: vec![],
        }
    }

    fn lv(vg_name: &str, name: &str) -> LogicalVolume {
        LogicalVolume {
            uuid: "u".into(),
            name: name.into(),
            vg_name: vg_name.into(),
            attr: LvAttr {
                voltype: '-',
                permission: 'w',
                allocations: 'i',
                fixedminor: '-',
                state: 'a',
                devopen: '-',
                target: '-',
                zero: '-',
            },
            size: 0,
            seg_start_pe: 0,
            devices: "/dev/sda(0)".into(),
            tags: vec![],
        }
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let store = EntityStore::new();
        store.upsert_pv(pv("/dev/sda1"));
        let got = store.get_pv("/dev/sda1").unwrap();
        assert!(matches!(got, Entry::Fresh(_)));
    }

    #[test]
    fn invalidate_all_pvs_marks_every_entry_stale_but_keeps_name() {
        let store = EntityStore::new();
        store.upsert_pv(pv("/dev/sda1"));
        store.set_pv_stale(false);
        store.invalidate_all_pvs();

        let got = store.get_pv("/dev/sda1").unwrap();
        assert!(got.is_stale());
        assert_eq!(got.name(), "/dev/sda1");
        assert!(store.pv_stale());
    }

    #[test]
    fn remove_vg_also_clears_its_reload_flag() {
        let store = EntityStore::new();
        store.upsert_vg(vg("vg0"));
        store.set_lvs_need_reload("vg0", false);
        store.remove_vg("vg0");
        assert!(store.get_vg("vg0").is_none());
        assert!(store.lvs_need_reload("vg0"));
    }

    #[test]
    fn remove_lvs_in_vg_drops_only_that_vgs_lvs() {
        let store = EntityStore::new();
        store.upsert_lv(lv("vg0", "lv0"));
        store.upsert_lv(lv("vg1", "lv1"));
        store.remove_lvs_in_vg("vg0");

        assert!(store.get_lv("vg0", "lv0").is_none());
        assert!(store.get_lv("vg1", "lv1").is_some());
    }

    #[test]
    fn invalidate_lvs_in_vg_sets_reload_flag() {
        let store = EntityStore::new();
        store.upsert_lv(lv("vg0", "lv0"));
        store.set_lvs_need_reload("vg0", false);
        store.invalidate_lvs_in_vg("vg0");

        assert!(store.lvs_need_reload("vg0"));
        assert!(store.get_lv("vg0", "lv0").unwrap().is_stale());
    }

    #[test]
    fn clear_resets_staleness_flags() {
        let store = EntityStore::new();
        store.set_pv_stale(false);
        store.set_vg_stale(false);
        store.clear();
        assert!(store.pv_stale());
        assert!(store.vg_stale());
    }
}
