//! ReloadEngine: turns `EntityStore` staleness into calls
//! through `CommandRunner` + `parser`, and writes the results back.
//!
//! Names and structure follow vdsm's `_reloadpvs`/`_reloadvgs`/
//! `_reloadlvs` trio (lvm.py:398-420, 567-594, 680-702) closely enough
//! that each public method here documents which vdsm function it
//! replaces. Reload failures never surface past this module as a
//! `Result::Err`; they demote the affected entries to `Unreadable` and
//! log once per batch instead.

use crate::command::CommandRunner;
use crate::error::{CacheError, LvmCommandError};
use crate::parser::{self, LV_FIELDS, PV_FIELDS, VG_FIELDS};
use crate::store::EntityStore;
use std::collections::HashSet;
use std::sync::Arc;

const WARN_TRUNCATE: usize = 20;

fn report_argv(tool: &str, fields: &str, names: &[String]) -> Vec<String> {
    let mut cmd = vec![
        tool.to_string(),
        "--config".to_string(),
        "report/ignore_lvmetad_enoent=1".to_string(),
        "--noheadings".to_string(),
        "--units".to_string(),
        "b".to_string(),
        "--nosuffix".to_string(),
        "--separator".to_string(),
        parser::SEPARATOR.to_string(),
        "--ignoreskippedcluster".to_string(),
        "-o".to_string(),
        fields.to_string(),
    ];
    cmd.extend(names.iter().cloned());
    cmd
}

fn log_newly_unreadable(kind: &str, names: &[String]) {
    if names.is_empty() {
        return;
    }
    let shown: Vec<&String> = names.iter().take(WARN_TRUNCATE).collect();
    if names.len() > WARN_TRUNCATE {
        log::warn!("{} became unreadable: {:?} (+{} more)", kind, shown, names.len() - WARN_TRUNCATE);
    } else {
        log::warn!("{} became unreadable: {:?}", kind, shown);
    }
}

pub struct ReloadEngine {
    runner: Arc<CommandRunner>,
    store: Arc<EntityStore>,
}

impl ReloadEngine {
    pub fn new(runner: Arc<CommandRunner>, store: Arc<EntityStore>) -> Self {
        ReloadEngine { runner, store }
    }

    // --- PVs ---------------------------------------------------------

    /// Full PV reload: used when the cache has never loaded PVs or was
    /// globally invalidated (vdsm's `_reloadpvs` with `pvNames=None`,
    /// lvm.py:398-420).
    pub fn reload_all_pvs(&self) -> Result<(), CacheError> {
        self.reload_pvs_inner(&[])
    }

    /// Reload exactly the named PVs, preserving everything else in the
    /// store (vdsm's `_update_stale_pvs_locked`, lvm.py:366-397). Also
    /// used as the single-PV reload path when `names` has one element
    /// (vdsm's `_reloadpvs([name])`).
    pub fn reload_pvs(&self, names: &[String]) -> Result<(), CacheError> {
        if names.is_empty() {
            return Ok(());
        }
        self.reload_pvs_inner(names)
    }

    pub fn ensure_pv(&self, name: &str) -> Result<(), CacheError> {
        match self.store.get_pv(name) {
            Some(e) if !e.is_stale() => Ok(()),
            _ => self.reload_pvs(&[name.to_string()]),
        }
    }

    fn reload_pvs_inner(&self, names: &[String]) -> Result<(), CacheError> {
        let full = names.is_empty();
        match self.runner.run(report_argv("pvs", PV_FIELDS, names), true) {
            Ok(lines) => {
                let pvs = parser::parse_pv_lines(&lines)?;
                let mut seen: HashSet<String> = HashSet::new();
                for pv in pvs {
                    seen.insert(pv.name.clone());
                    self.store.upsert_pv(pv);
                }
                // updatePvsLocked: remove any name from the
                // requested set (or all known PVs, for a full reload) that
                // the tool did not report back.
                let targets: Vec<String> = if full { self.store.all_pv_names() } else { names.to_vec() };
                for name in &targets {
                    if !seen.contains(name) {
                        self.store.remove_pv(name);
                    }
                }
                if full {
                    self.store.set_pv_stale(false);
                }
                Ok(())
            }
            Err(_) => {
                self.mark_stale_pvs_unreadable(names);
                Ok(())
            }
        }
    }

    /// markStaleEntriesUnreadableLocked for PVs: demotes
    /// only entries that are *already present and stale* to `Unreadable`;
    /// `stalepv` is left untouched so a full reload is still attempted
    /// next time.
    fn mark_stale_pvs_unreadable(&self, names: &[String]) {
        let targets: Vec<String> = if names.is_empty() { self.store.all_pv_names() } else { names.to_vec() };
        let mut newly_unreadable = Vec::new();
        for name in &targets {
            if let Some(entry) = self.store.get_pv(name) {
                if entry.is_stale() {
                    self.store.mark_pv_unreadable(name);
                    newly_unreadable.push(name.clone());
                }
            }
        }
        log_newly_unreadable("pvs", &newly_unreadable);
    }

    // --- VGs -----------------------------------------------------------

    pub fn reload_all_vgs(&self) -> Result<(), CacheError> {
        self.reload_vgs_inner(&[])
    }

    /// Reload the named VGs (vdsm's `_reloadvgs`, lvm.py:567-594). `vgs`
    /// can emit useful rows even on a non-zero exit (e.g. one VG in the
    /// batch is unreachable but the rest report fine), so on any stdout
    /// at all we still parse and apply it (see DESIGN.md for the
    /// rationale).
    pub fn reload_vgs(&self, names: &[String]) -> Result<(), CacheError> {
        if names.is_empty() {
            return Ok(());
        }
        self.reload_vgs_inner(names)
    }

    pub fn ensure_vg(&self, name: &str) -> Result<(), CacheError> {
        match self.store.get_vg(name) {
            Some(e) if !e.is_stale() => Ok(()),
            _ => self.reload_single_vg(name),
        }
    }

    /// Reload exactly one named VG, trusting no output from a failed
    /// `vgs <name>` call (vdsm's `_reload_single_vg`, lvm.py:528-540):
    /// unlike the batch path, a non-zero exit here never gets to upsert
    /// anything, even if it happened to print some stdout — the request
    /// was for one VG, so a partial/garbled report about it is no report
    /// at all. A stale-and-now-unreachable entry is demoted to
    /// `Unreadable`, which is what `get_vg` turns into a not-found error.
    fn reload_single_vg(&self, name: &str) -> Result<(), CacheError> {
        let names = [name.to_string()];
        match self.runner.run(report_argv("vgs", VG_FIELDS, &names), true) {
            Ok(lines) => {
                let vgs = parser::parse_vg_lines(&lines)?;
                match vgs.into_iter().find(|vg| vg.name == name) {
                    Some(vg) => self.store.upsert_vg(vg),
                    None => self.demote_single_vg_if_known(name),
                }
                Ok(())
            }
            Err(_) => {
                self.demote_single_vg_if_known(name);
                Ok(())
            }
        }
    }

    fn demote_single_vg_if_known(&self, name: &str) {
        match self.store.get_vg(name) {
            Some(entry) if entry.is_stale() => {
                self.store.mark_vg_unreadable(name);
                log_newly_unreadable("vgs", &[name.to_string()]);
            }
            None => {
                self.store.mark_vg_unreadable(name);
                log_newly_unreadable("vgs", &[name.to_string()]);
            }
            _ => {}
        }
    }

    fn reload_vgs_inner(&self, names: &[String]) -> Result<(), CacheError> {
        let full = names.is_empty();
        let (lines, had_error): (Vec<String>, bool) =
            match self.runner.run(report_argv("vgs", VG_FIELDS, names), true) {
                Ok(lines) => (lines, false),
                Err(LvmCommandError { stdout, .. }) if !stdout.is_empty() => (stdout, true),
                Err(_) => {
                    self.mark_stale_vgs_unreadable(names);
                    return Ok(());
                }
            };

        let vgs = parser::parse_vg_lines(&lines)?;
        let mut seen: HashSet<String> = HashSet::new();
        for vg in vgs {
            seen.insert(vg.name.clone());
            self.store.upsert_vg(vg);
        }

        let targets: Vec<String> = if full { self.store.all_vg_names() } else { names.to_vec() };
        let mut newly_unreadable = Vec::new();
        for name in &targets {
            if seen.contains(name) {
                continue;
            }
            if had_error {
                // Only demote what was already known-and-stale; never
                // invent an Unreadable entry the store never asked about.
                if let Some(entry) = self.store.get_vg(name) {
                    if entry.is_stale() {
                        self.store.mark_vg_unreadable(name);
                        newly_unreadable.push(name.clone());
                    }
                } else if !full {
                    // An explicitly requested name the store has never
                    // seen: still worth surfacing as Unreadable so the
                    // caller gets a NotFound instead of a silent miss.
                    self.store.mark_vg_unreadable(name);
                    newly_unreadable.push(name.clone());
                }
            } else if full {
                self.store.remove_vg(name);
            } else {
                self.store.mark_vg_unreadable(name);
                newly_unreadable.push(name.clone());
            }
        }
        log_newly_unreadable("vgs", &newly_unreadable);

        // stalevg only clears once a reload completed with no error at all
        // ("stalevg remains true" after a partial
        // failure).
        if full && !had_error {
            self.store.set_vg_stale(false);
        }
        Ok(())
    }

    fn mark_stale_vgs_unreadable(&self, names: &[String]) {
        let targets: Vec<String> = if names.is_empty() { self.store.all_vg_names() } else { names.to_vec() };
        let mut newly_unreadable = Vec::new();
        for name in &targets {
            if let Some(entry) = self.store.get_vg(name) {
                if entry.is_stale() {
                    self.store.mark_vg_unreadable(name);
                    newly_unreadable.push(name.clone());
                }
            }
        }
        log_newly_unreadable("vgs", &newly_unreadable);
    }

    // --- LVs -------------------------------------------------------------

    /// Loads every LV in the system; used at bootstrap only (vdsm's
    /// `_loadAllLvs`, lvm.py:704-712). Replaces the whole LV map
    /// atomically and rebuilds the per-VG freshness bookkeeping from the
    /// set of VG names actually seen.
    pub fn reload_all_lvs(&self) -> Result<(), CacheError> {
        let lines = self.runner.run(report_argv("lvs", LV_FIELDS, &[]), true)?;
        let lvs = parser::parse_lv_lines(&lines)?;
        self.store.clear_lvs();
        let mut vgs_seen: HashSet<String> = HashSet::new();
        for lv in lvs {
            vgs_seen.insert(lv.vg_name.clone());
            self.store.upsert_lv(lv);
        }
        for vg in vgs_seen {
            self.store.set_lvs_need_reload(&vg, false);
        }
        Ok(())
    }

    /// Reload every LV belonging to `vg` (vdsm's `_reloadlvs` scoped to a
    /// single VG, lvm.py:680-702). A tool failure demotes only the LVs of
    /// `vg` that are already stale to `Unreadable`, and leaves the
    /// per-VG reload flag set so the next access tries again.
    pub fn reload_lvs_in_vg(&self, vg: &str) -> Result<(), CacheError> {
        match self.runner.run(report_argv("lvs", LV_FIELDS, &[vg.to_string()]), true) {
            Ok(lines) => {
                let lvs = parser::parse_lv_lines(&lines)?;
                let mut seen: HashSet<String> = HashSet::new();
                for lv in lvs {
                    seen.insert(lv.name.clone());
                    self.store.upsert_lv(lv);
                }
                for entry in self.store.lvs_in_vg(vg) {
                    if !seen.contains(entry.name()) {
                        self.store.remove_lv(vg, entry.name());
                    }
                }
                self.store.set_lvs_need_reload(vg, false);
                Ok(())
            }
            Err(_) => {
                let mut newly_unreadable = Vec::new();
                for entry in self.store.lvs_in_vg(vg) {
                    if entry.is_stale() {
                        self.store.mark_lv_unreadable(vg, entry.name());
                        newly_unreadable.push(format!("{vg}/{}", entry.name()));
                    }
                }
                log_newly_unreadable("lvs", &newly_unreadable);
                Ok(())
            }
        }
    }

    pub fn ensure_lvs_in_vg(&self, vg: &str) -> Result<(), CacheError> {
        if self.store.lvs_need_reload(vg) {
            self.reload_lvs_in_vg(vg)
        } else {
            Ok(())
        }
    }

    pub fn ensure_lv(&self, vg: &str, lv: &str) -> Result<(), CacheError> {
        match self.store.get_lv(vg, lv) {
            Some(e) if !e.is_stale() => Ok(()),
            _ => self.reload_lvs_in_vg(vg),
        }
    }
}
