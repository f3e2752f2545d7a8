//! MutationAPI: every write path into the volumes this
//! cache tracks, plus the invalidation matrix that keeps `EntityStore`
//! honest afterward.
//!
//! Each wrapper below documents which vdsm `lvm.py` function it replaces.
//! The general shape, repeated throughout: run the tool, map a failure to
//! one `MutationError` variant, and invalidate the affected store entries
//! on every path — success or failure — the same way vdsm's `finally:
//! _lvminfo._invalidate*(...)` blocks do.

use crate::collaborators::{BlockSizeProbe, DeviceMapperAdmin, LvDeviceNodeProbe, OwnershipAdmin, ProcessInfoLookup};
use crate::command::{argv, CommandRunner};
use crate::error::{CacheError, LvmCommandError, MutationError, ValidationError};
use crate::reload::ReloadEngine;
use crate::store::EntityStore;
use crate::types::Entry;
use std::collections::HashSet;
use std::sync::Arc;

/// `sc.VG_EXTENT_SIZE // MiB` in vdsm: the fixed physical extent size every
/// VG this cache creates is given (lvm.py:1287).
pub const VG_EXTENT_SIZE_MB: u64 = 128;

/// Logical block sizes this crate's VGs may be built on (vdsm's
/// `sc.SUPPORTED_BLOCKSIZE`, lvm.py:1433).
const SUPPORTED_BLOCKSIZES: [u64; 2] = [512, 4096];

const MIB: u64 = 1024 * 1024;

fn lv_path(vg: &str, lv: &str) -> String {
    format!("/dev/{vg}/{lv}")
}

/// `utils.round(size_mb * MiB, extent_size) // extent_size` (lvm.py:1545,
/// 1603): a caller-supplied size in mebibytes, rounded up to a whole
/// number of the VG's extents.
fn extents_for_size_mb(size_mb: u64, extent_size: u64) -> u64 {
    if extent_size == 0 {
        return 0;
    }
    let bytes = size_mb * MIB;
    (bytes + extent_size - 1) / extent_size
}

/// vdsm's `getLvDmName` (lvm.py:1061-1062): the device-mapper name LVM
/// gives an LV, with the vg name's dashes doubled.
fn dm_name(vg: &str, lv: &str) -> String {
    format!("{}-{}", vg.replace('-', "--"), lv)
}

fn reject_overlapping_tags(target: &str, add: &[String], delete: &[String]) -> Result<(), CacheError> {
    let add_set: HashSet<&String> = add.iter().collect();
    let overlap: Vec<String> = delete.iter().filter(|t| add_set.contains(t)).cloned().collect();
    if overlap.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::DuplicateTag { target: target.to_string(), tags: overlap }.into())
    }
}

/// `_checkpvsblksize` (lvm.py:1428-1446): every candidate PV must share one
/// logical block size from [`SUPPORTED_BLOCKSIZES`], and its physical
/// sector size must be at least as large as its logical one.
fn check_pv_block_sizes(
    probe: &dyn BlockSizeProbe,
    devices: &[String],
    vg_block_size: Option<u64>,
) -> Result<(), CacheError> {
    let mut expected = vg_block_size;
    for device in devices {
        let (logical, physical) = probe.block_sizes(device)?;
        if !SUPPORTED_BLOCKSIZES.contains(&logical) || physical < logical {
            return Err(ValidationError::DeviceBlockSizeMismatch {
                device: device.clone(),
                logical,
                physical,
            }
            .into());
        }
        let expected = *expected.get_or_insert(logical);
        if logical != expected {
            return Err(ValidationError::VolumeGroupBlockSizeMismatch {
                device: device.clone(),
                device_size: logical,
                vg_size: expected,
            }
            .into());
        }
    }
    Ok(())
}

pub struct MutationAPI {
    runner: Arc<CommandRunner>,
    store: Arc<EntityStore>,
    reload: Arc<ReloadEngine>,
    dm_admin: Arc<dyn DeviceMapperAdmin>,
    proc_lookup: Arc<dyn ProcessInfoLookup>,
    block_probe: Arc<dyn BlockSizeProbe>,
    ownership: Arc<dyn OwnershipAdmin>,
    device_probe: Arc<dyn LvDeviceNodeProbe>,
    owner_user: String,
    owner_group: String,
}

impl MutationAPI {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runner: Arc<CommandRunner>,
        store: Arc<EntityStore>,
        reload: Arc<ReloadEngine>,
        dm_admin: Arc<dyn DeviceMapperAdmin>,
        proc_lookup: Arc<dyn ProcessInfoLookup>,
        block_probe: Arc<dyn BlockSizeProbe>,
        ownership: Arc<dyn OwnershipAdmin>,
        device_probe: Arc<dyn LvDeviceNodeProbe>,
        owner_user: impl Into<String>,
        owner_group: impl Into<String>,
    ) -> Self {
        MutationAPI {
            runner,
            store,
            reload,
            dm_admin,
            proc_lookup,
            block_probe,
            ownership,
            device_probe,
            owner_user: owner_user.into(),
            owner_group: owner_group.into(),
        }
    }

    fn vg_block_size(&self, vg: &str) -> Option<u64> {
        match self.store.get_vg(vg) {
            Some(Entry::Fresh(v)) => v.pv_name.first().and_then(|pv| self.block_probe.block_sizes(pv).ok()).map(|(l, _)| l),
            _ => None,
        }
    }

    fn vg_pv_names(&self, vg: &str) -> Vec<String> {
        match self.store.get_vg(vg) {
            Some(Entry::Fresh(v)) => v.pv_name.clone(),
            _ => Vec::new(),
        }
    }

    /// vdsm's `_isLVActive` (lvm.py:1712-1717): active/inactive is
    /// decided by whether the device-node link exists, not by whatever
    /// the cache currently holds for the LV's state attribute.
    fn is_lv_active(&self, vg: &str, lv: &str) -> bool {
        self.device_probe.exists(&lv_path(vg, lv))
    }

    /// The VG's extent size in bytes, reloading the VG once if the cache
    /// doesn't already have it fresh.
    fn vg_extent_size(&self, vg: &str) -> Result<u64, CacheError> {
        if let Some(Entry::Fresh(v)) = self.store.get_vg(vg) {
            return Ok(v.extent_size);
        }
        self.reload.ensure_vg(vg)?;
        match self.store.get_vg(vg) {
            Some(Entry::Fresh(v)) => Ok(v.extent_size),
            _ => Err(CacheError::vg_does_not_exist(vg.to_string())),
        }
    }

    // --- Volume groups ---------------------------------------------------

    /// vdsm's `createVG` (lvm.py:1280-1299).
    pub fn create_vg(&self, vg: &str, devices: &[String], initial_tag: Option<&str>) -> Result<(), CacheError> {
        let pvs: Vec<String> = devices.iter().map(|d| argv::fqpvname(d)).collect();
        check_pv_block_sizes(self.block_probe.as_ref(), &pvs, None)?;

        self.init_pvs(&pvs, false)?;

        let mut cmd = vec![
            "vgcreate".to_string(),
            "--physicalextentsize".to_string(),
            format!("{VG_EXTENT_SIZE_MB}m"),
        ];
        if let Some(tag) = initial_tag {
            cmd.push("--addtag".to_string());
            cmd.push(tag.to_string());
        }
        cmd.push(vg.to_string());
        cmd.extend(pvs.iter().cloned());

        match self.runner.run(cmd, false) {
            Ok(_) => {
                for pv in &pvs {
                    self.store.mark_pv_stale(pv);
                }
                self.store.mark_vg_stale(vg);
                Ok(())
            }
            Err(source) => Err(MutationError::VolumeGroupCreate { vg: vg.to_string(), source }.into()),
        }
    }

    /// `_initpvs`/`_createpv` (lvm.py:1031-1046, 1358-1371): always
    /// invalidates the touched PVs, success or failure.
    fn init_pvs(&self, pvs: &[String], test: bool) -> Result<Vec<String>, CacheError> {
        let result = self.runner.run(argv::pvcreate(pvs, test), false);
        for pv in pvs {
            self.store.mark_pv_stale(pv);
        }
        result.map_err(|source| {
            CacheError::Mutation(MutationError::PhysDevInitializationError {
                devices: pvs.to_vec(),
                source,
            })
        })
    }

    /// vdsm's `removeVG` (lvm.py:1302-1322): deactivates first, removes
    /// with `--force`, reloads the VG's PVs on either outcome.
    pub fn remove_vg(&self, vg: &str) -> Result<(), CacheError> {
        self.deactivate_vg(vg);
        let result = self.runner.run(argv::vgremove(vg), false);
        let pvs = self.vg_pv_names(vg);
        for pv in &pvs {
            self.store.mark_pv_stale(pv);
        }
        match result {
            Ok(_) => {
                self.store.remove_vg(vg);
                self.store.remove_lvs_in_vg(vg);
                Ok(())
            }
            Err(source) => {
                // vgremove failed: reintroduce the vg into the cache.
                self.store.mark_vg_stale(vg);
                Err(MutationError::VolumeGroupRemove { vg: vg.to_string(), source }.into())
            }
        }
    }

    /// Looks the VG up by uuid across cached entries and removes it if
    /// found; a no-op otherwise (vdsm's `removeVGbyUUID`, lvm.py:1325-1328).
    pub fn remove_vg_by_uuid(&self, uuid: &str) -> Result<(), CacheError> {
        let name = self.store.all_vgs().into_iter().find_map(|e| match e {
            Entry::Fresh(vg) if vg.uuid == uuid => Some(vg.name),
            _ => None,
        });
        match name {
            Some(vg) => self.remove_vg(&vg),
            None => Ok(()),
        }
    }

    /// vdsm's `extendVG` (lvm.py:1331-1349).
    pub fn extend_vg(&self, vg: &str, devices: &[String], force: bool) -> Result<(), CacheError> {
        let pvs: Vec<String> = devices.iter().map(|d| argv::fqpvname(d)).collect();
        check_pv_block_sizes(self.block_probe.as_ref(), &pvs, self.vg_block_size(vg))?;

        if force {
            for dev in &pvs {
                let _ = self.dm_admin.remove_mappings_holding(dev);
            }
        }
        self.init_pvs(&pvs, false)?;

        match self.runner.run(argv::vgextend(vg, &pvs), false) {
            Ok(_) => {
                for pv in &pvs {
                    self.store.mark_pv_stale(pv);
                }
                self.store.mark_vg_stale(vg);
                Ok(())
            }
            Err(source) => Err(MutationError::VolumeGroupExtend { vg: vg.to_string(), source }.into()),
        }
    }

    /// vdsm's `reduceVG` (lvm.py:1373-1384).
    pub fn reduce_vg(&self, vg: &str, device: &str) -> Result<(), CacheError> {
        let pv = argv::fqpvname(device);
        match self.runner.run(argv::vgreduce(vg, &[pv.clone()]), false) {
            Ok(_) => {
                self.store.mark_pv_stale(&pv);
                self.store.mark_vg_stale(vg);
                Ok(())
            }
            Err(source) => Err(MutationError::VolumeGroupReduce { vg: vg.to_string(), source }.into()),
        }
    }

    /// vdsm's `chkVG` (lvm.py:1386-1393): both the VG and its LVs are
    /// invalidated on failure and the original error is propagated.
    pub fn vgck(&self, vg: &str) -> Result<(), CacheError> {
        match self.runner.run(argv::vgck(vg), false) {
            Ok(_) => Ok(()),
            Err(source) => {
                self.store.mark_vg_stale(vg);
                self.store.invalidate_lvs_in_vg(vg);
                Err(CacheError::ToolFailure(source))
            }
        }
    }

    /// vdsm's `deactivateVG` (lvm.py:1396-1412). Never returns an error —
    /// the caller (typically `removeVG`) doesn't care about a VG it's about
    /// to tear down, so a deactivate failure is logged and, since the
    /// storage may already be unreachable, any leftover device-mapper
    /// mappings for the VG are cleaned up directly.
    pub fn deactivate_vg(&self, vg: &str) {
        let result = self.runner.run(argv::vgchange_availability(vg, false), false);
        self.store.invalidate_lvs_in_vg(vg);
        if let Err(e) = result {
            log::info!("error deactivating vg {vg}: {e}");
            self.remove_vg_mapping(vg);
        }
    }

    /// vdsm's `_removeVgMapping` (lvm.py:1065-1082).
    fn remove_vg_mapping(&self, vg: &str) {
        let prefix = dm_name(vg, "");
        let mappings = match self.dm_admin.list_mapped_devices() {
            Ok(m) => m,
            Err(e) => {
                log::error!("could not list device-mapper mappings while cleaning up vg {vg}: {e}");
                return;
            }
        };
        for mapping in mappings {
            if !mapping.starts_with(&prefix) {
                continue;
            }
            if let Err(e) = self.dm_admin.remove_mapping(&mapping) {
                log::error!("removing vg mapping {mapping} failed: {e}");
            }
        }
    }

    /// vdsm's `changeVGTags`/`replaceVGTag` (lvm.py:1720-1746).
    pub fn replace_vg_tags(&self, vg: &str, add: &[String], delete: &[String]) -> Result<(), CacheError> {
        reject_overlapping_tags(vg, add, delete)?;
        let result = self.runner.run(argv::vgchange_tags(vg, add, delete), false);
        self.store.mark_vg_stale(vg);
        result.map_err(|source| MutationError::VolumeGroupReplaceTag { vg: vg.to_string(), source }.into())
    }

    // --- Physical volumes --------------------------------------------------

    /// vdsm's `testPVCreate` (lvm.py:1147-1171): a dry run that never
    /// touches the cache. Returns `(unused, used)` device partitions based
    /// on which device paths the failed command's stderr mentions.
    pub fn test_pv_create(&self, devices: &[String]) -> (Vec<String>, Vec<String>) {
        let pvs: Vec<String> = devices.iter().map(|d| argv::fqpvname(d)).collect();
        match self.runner.run(argv::pvcreate(&pvs, true), false) {
            Ok(_) => (devices.to_vec(), Vec::new()),
            Err(e) => {
                let mut unused = Vec::new();
                let mut used = Vec::new();
                for (device, pv) in devices.iter().zip(pvs.iter()) {
                    if e.stderr.contains(pv.as_str()) {
                        used.push(device.clone());
                    } else {
                        unused.push(device.clone());
                    }
                }
                (unused, used)
            }
        }
    }

    /// vdsm's `resizePV` (lvm.py:1174-1190).
    pub fn resize_pv(&self, vg: &str, guid: &str) -> Result<(), CacheError> {
        let pv = argv::fqpvname(guid);
        match self.runner.run(argv::pvresize(&pv), false) {
            Ok(_) => {
                self.store.mark_pv_stale(&pv);
                self.store.mark_vg_stale(vg);
                Ok(())
            }
            Err(source) => Err(MutationError::CouldNotResizePhysicalVolume { pv, source }.into()),
        }
    }

    /// vdsm's `movePV` (lvm.py:1193-1229): skips the move entirely when the
    /// PV has no allocated extents, and invalidates the PV, the VG, and
    /// every LV in the VG regardless of outcome. Runs with the polld
    /// variant disabled (lvmpolld mishandles concurrent pvmove, see
    /// vdsm BZ#1949059).
    pub fn move_pv(&self, vg: &str, src_device: &str, dst_devices: &[String]) -> Result<(), CacheError> {
        let pv = argv::fqpvname(src_device);
        self.store.mark_pv_stale(&pv);
        self.reload.ensure_pv(&pv)?;

        if let Some(Entry::Fresh(info)) = self.store.get_pv(&pv) {
            if info.pe_alloc_count == 0 {
                log::info!("no data to move on pv {pv} (vg {vg}), considering as successful");
                return Ok(());
            }
        }

        let dsts: Vec<String> = dst_devices.iter().map(|d| argv::fqpvname(d)).collect();
        let result = self.runner.run_no_polld(argv::pvmove(&pv, dsts.first().map(|s| s.as_str())), false);

        self.store.mark_pv_stale(&pv);
        self.store.invalidate_lvs_in_vg(vg);
        self.store.mark_vg_stale(vg);

        result
            .map(|_| ())
            .map_err(|source| MutationError::CouldNotMovePVData { pv, source }.into())
    }

    // --- Logical volumes -----------------------------------------------

    /// vdsm's `createLV` (lvm.py:1463-1502). `size_mb` is rounded up to a
    /// whole number of the VG's extents before it ever reaches `lvcreate`.
    #[allow(clippy::too_many_arguments)]
    pub fn create_lv(
        &self,
        vg: &str,
        lv: &str,
        size_mb: u64,
        tags: &[String],
        mirrors: u32,
        activate: bool,
    ) -> Result<(), CacheError> {
        let extent_size = self.vg_extent_size(vg)?;
        let extents = extents_for_size_mb(size_mb, extent_size);
        match self.runner.run(argv::lvcreate(vg, lv, extents, tags, mirrors), false) {
            Ok(_) => {
                self.store.mark_vg_stale(vg);
                self.store.mark_lv_stale(vg, lv);
                if activate {
                    let path = lv_path(vg, lv);
                    if let Err(e) = self.ownership.chown(&path, &self.owner_user, &self.owner_group) {
                        log::warn!("could not change ownership of {path}: {e}");
                    }
                } else {
                    let _ = self.runner.run(argv::lvchange_availability(vg, lv, false), false);
                    self.store.mark_lv_stale(vg, lv);
                }
                Ok(())
            }
            Err(source) => Err(MutationError::LogicalVolumeCreate { vg: vg.to_string(), lv: lv.to_string(), source }.into()),
        }
    }

    /// vdsm's `removeLVs` (lvm.py:1505-1530).
    pub fn remove_lvs(&self, vg: &str, lvs: &[String]) -> Result<(), CacheError> {
        match self.runner.run(argv::lvremove(vg, lvs), false) {
            Ok(_) => {
                for lv in lvs {
                    self.store.remove_lv(vg, lv);
                }
                self.store.mark_vg_stale(vg);
                Ok(())
            }
            Err(source) => {
                for lv in lvs {
                    self.store.mark_lv_stale(vg, lv);
                }
                Err(MutationError::LogicalVolumeRemove { vg: vg.to_string(), lvs: lvs.to_vec(), source }.into())
            }
        }
    }

    /// Current size of a cached LV/VG in extents, used by `extend_lv`/
    /// `reduce_lv`'s no-op pre-checks. Returns `None` if either is
    /// currently stale/unreadable/absent.
    fn lv_vg_extents(&self, vg: &str, lv: &str) -> Option<(u64, u64, u64)> {
        let vg_rec = match self.store.get_vg(vg) {
            Some(Entry::Fresh(v)) => v,
            _ => return None,
        };
        let lv_rec = match self.store.get_lv(vg, lv) {
            Some(Entry::Fresh(l)) => l,
            _ => return None,
        };
        if vg_rec.extent_size == 0 {
            return None;
        }
        Some((lv_rec.size / vg_rec.extent_size, vg_rec.extent_size, vg_rec.free_count))
    }

    /// vdsm's `extendLV` (lvm.py:1533-1582): skips the call entirely when
    /// the cache already shows the LV at or above the requested size, and
    /// on failure reloads both the VG and LV to tell a genuine size
    /// shortfall (`VolumeGroupSizeError`) from some other tool failure.
    /// `size_mb` is rounded up to the VG's extent size the same way
    /// `create_lv` does.
    pub fn extend_lv(&self, vg: &str, lv: &str, size_mb: u64) -> Result<(), CacheError> {
        let extent_size = self.vg_extent_size(vg)?;
        let requested_extents = extents_for_size_mb(size_mb, extent_size);

        if let Some((lv_extents, _, _)) = self.lv_vg_extents(vg, lv) {
            if lv_extents >= requested_extents {
                return Ok(());
            }
        }

        match self.runner.run(argv::lvextend(vg, lv, requested_extents), false) {
            Ok(_) => {
                self.store.mark_vg_stale(vg);
                self.store.mark_lv_stale(vg, lv);
                Ok(())
            }
            Err(source) => {
                self.store.mark_vg_stale(vg);
                self.store.mark_lv_stale(vg, lv);
                self.reload.reload_vgs(&[vg.to_string()])?;
                self.reload.reload_lvs_in_vg(vg)?;

                if let Some((lv_extents, _, free_extents)) = self.lv_vg_extents(vg, lv) {
                    if lv_extents >= requested_extents {
                        return Ok(());
                    }
                    let needed = requested_extents - lv_extents;
                    if free_extents < needed {
                        return Err(MutationError::VolumeGroupSizeError {
                            vg: vg.to_string(),
                            lv: lv.to_string(),
                            free: free_extents,
                            needed,
                        }
                        .into());
                    }
                }
                Err(MutationError::LogicalVolumeExtend { vg: vg.to_string(), lv: lv.to_string(), source }.into())
            }
        }
    }

    /// vdsm's `reduceLV` (lvm.py:1585-1613): same no-op pre-check, reusing
    /// `LogicalVolumeExtend` for failures the way vdsm itself does (it has
    /// no dedicated reduce-error variant either). `size_mb` is rounded up
    /// to the VG's extent size the same way `create_lv` does.
    pub fn reduce_lv(&self, vg: &str, lv: &str, size_mb: u64) -> Result<(), CacheError> {
        let extent_size = self.vg_extent_size(vg)?;
        let requested_extents = extents_for_size_mb(size_mb, extent_size);

        if let Some((lv_extents, _, _)) = self.lv_vg_extents(vg, lv) {
            if lv_extents <= requested_extents {
                return Ok(());
            }
        }

        match self.runner.run(argv::lvreduce(vg, lv, requested_extents), false) {
            Ok(_) => {
                self.store.mark_vg_stale(vg);
                self.store.mark_lv_stale(vg, lv);
                Ok(())
            }
            Err(source) => {
                self.reload.reload_vgs(&[vg.to_string()])?;
                self.reload.reload_lvs_in_vg(vg)?;
                if let Some((lv_extents, _, _)) = self.lv_vg_extents(vg, lv) {
                    if lv_extents <= requested_extents {
                        return Ok(());
                    }
                }
                Err(MutationError::LogicalVolumeExtend { vg: vg.to_string(), lv: lv.to_string(), source }.into())
            }
        }
    }

    /// vdsm's `refreshLVs`/`_refreshLVs` (lvm.py:1653-1668).
    pub fn refresh_lvs(&self, vg: &str, lvs: &[String]) -> Result<(), CacheError> {
        let result = self.runner.run(argv::lvchange_refresh(vg, lvs), false);
        for lv in lvs {
            self.store.mark_lv_stale(vg, lv);
        }
        result.map_err(|source| MutationError::LogicalVolumeRefresh { vg: vg.to_string(), lvs: lvs.to_vec(), source }.into())
    }

    /// vdsm's `changeLVsTags` (lvm.py:1671-1691): invalidates the named LVs
    /// on every path, matching `changelv`'s `try/finally`.
    pub fn replace_lv_tags(&self, vg: &str, lvs: &[String], add: &[String], delete: &[String]) -> Result<(), CacheError> {
        reject_overlapping_tags(&format!("{vg}/{lvs:?}"), add, delete)?;
        let result = self.runner.run(argv::lvchange_tags(vg, &lvs[0], add, delete), false);
        for lv in lvs {
            self.store.mark_lv_stale(vg, lv);
        }
        result.map_err(|source| MutationError::LogicalVolumeReplaceTag { vg: vg.to_string(), lvs: lvs.to_vec(), source }.into())
    }

    /// vdsm's `setrwLV` (lvm.py:1769-1782): tolerates a failure if the LV
    /// already reflects the requested permission (BZ#654691).
    pub fn set_rw_lv(&self, vg: &str, lv: &str, writeable: bool) -> Result<(), CacheError> {
        let result = self.runner.run(argv::lvchange_permission(vg, lv, writeable), false);
        self.store.mark_lv_stale(vg, lv);
        match result {
            Ok(_) => Ok(()),
            Err(source) => {
                self.reload.reload_lvs_in_vg(vg)?;
                if matches!(self.store.get_lv(vg, lv), Some(Entry::Fresh(l)) if l.writeable() == writeable) {
                    return Ok(());
                }
                Err(MutationError::CannotSetRWLogicalVolume { vg: vg.to_string(), lv: lv.to_string(), source }.into())
            }
        }
    }

    /// vdsm's `activateLVs` (lvm.py:1616-1639): already-active LVs are
    /// refreshed rather than re-activated; inactive ones are turned on.
    pub fn activate_lvs(&self, vg: &str, lvs: &[String], refresh: bool) -> Result<(), CacheError> {
        let (active, inactive): (Vec<String>, Vec<String>) =
            lvs.iter().cloned().partition(|lv| self.is_lv_active(vg, lv));

        if refresh && !active.is_empty() {
            self.refresh_lvs(vg, &active)?;
        }

        if !inactive.is_empty() {
            match self.runner.run(argv::lvchange_availability_many(vg, &inactive, true), false) {
                Ok(_) => {
                    for lv in &inactive {
                        self.store.mark_lv_stale(vg, lv);
                    }
                }
                Err(source) => {
                    for lv in &inactive {
                        self.store.mark_lv_stale(vg, lv);
                    }
                    return Err(MutationError::CannotActivateLogicalVolumes {
                        vg: vg.to_string(),
                        lvs: inactive,
                        source,
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// vdsm's `deactivateLVs`/`_setLVAvailability` (lvm.py:1642-1650,
    /// 1104-1119): skips LVs already inactive, and downgrades an "in use"
    /// failure to a logged warning naming the holding processes instead of
    /// a hard error. The affected LVs are invalidated on every path.
    pub fn deactivate_lvs(&self, vg: &str, lvs: &[String]) -> Result<(), CacheError> {
        let to_deactivate: Vec<String> = lvs.iter().cloned().filter(|lv| self.is_lv_active(vg, lv)).collect();
        if to_deactivate.is_empty() {
            return Ok(());
        }

        let result = self.runner.run(argv::lvchange_availability_many(vg, &to_deactivate, false), false);
        for lv in &to_deactivate {
            self.store.mark_lv_stale(vg, lv);
        }

        match result {
            Ok(_) => Ok(()),
            Err(source) => {
                if source.lv_in_use() {
                    let users: Vec<_> = to_deactivate
                        .iter()
                        .flat_map(|lv| self.proc_lookup.proc_info(&lv_path(vg, lv)))
                        .collect();
                    log::warn!("cannot deactivate lvs vg={vg} lvs={to_deactivate:?} users={users:?}: {source}");
                    Ok(())
                } else {
                    Err(MutationError::CannotDeactivateLogicalVolume {
                        vg: vg.to_string(),
                        lvs: to_deactivate,
                        source,
                    }
                    .into())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::{
        FakeBlockSizeProbe, FakeDeviceEnumerator, FakeDeviceMapperAdmin, FakeExecutor,
        FakeLvDeviceNodeProbe, FakeOwnershipAdmin, FakeProcessInfoLookup,
    };
    use crate::devices::DeviceResolver;
    use crate::types::{LogicalVolume, LvAttr, VgAttr, VolumeGroup};

    fn api(executor: Arc<FakeExecutor>, store: Arc<EntityStore>) -> MutationAPI {
        api_with_active(executor, store, &[])
    }

    fn api_with_active(executor: Arc<FakeExecutor>, store: Arc<EntityStore>, active: &[&str]) -> MutationAPI {
        let devices = Arc::new(DeviceResolver::new(Arc::new(FakeDeviceEnumerator::default())));
        let runner = Arc::new(CommandRunner::new(executor, devices, 4, true));
        let reload = Arc::new(ReloadEngine::new(runner.clone(), store.clone()));
        let device_probe = FakeLvDeviceNodeProbe::with_present(active.iter().map(|s| s.to_string()));
        MutationAPI::new(
            runner,
            store,
            reload,
            Arc::new(FakeDeviceMapperAdmin::default()),
            Arc::new(FakeProcessInfoLookup::default()),
            Arc::new(FakeBlockSizeProbe { sizes: (512, 512) }),
            Arc::new(FakeOwnershipAdmin::default()),
            Arc::new(device_probe),
            "vdsm",
            "kvm",
        )
    }

    fn vg(name: &str, extent_size: u64, free_count: u64) -> VolumeGroup {
        VolumeGroup {
            uuid: "u".into(),
            name: name.into(),
            attr: VgAttr { permission: 'w', resizeable: 'z', exported: '-', partial: '-', allocation: 'n', clustered: '-' },
            size: 0,
            free: 0,
            extent_size,
            extent_count: 0,
            free_count,
            tags: vec![],
            vg_mda_size: 0,
            vg_mda_free: 0,
            lv_count: 0,
            pv_count: 0,
            pv_name: vec!["/dev/sda".to_string()],
        }
    }

    fn lv(vg_name: &str, name: &str, size: u64, state: char) -> LogicalVolume {
        LogicalVolume {
            uuid: "u".into(),
            name: name.into(),
            vg_name: vg_name.into(),
            attr: LvAttr { voltype: '-', permission: 'w', allocations: 'i', fixedminor: '-', state, devopen: '-', target: '-', zero: '-' },
            size,
            seg_start_pe: 0,
            devices: "/dev/sda(0)".into(),
            tags: vec![],
        }
    }

    #[test]
    fn create_vg_marks_pvs_and_vg_stale_on_success() {
        let executor = Arc::new(FakeExecutor::new());
        executor.push_ok(vec![]);
        executor.push_ok(vec![]);
        let store = Arc::new(EntityStore::new());
        let api = api(executor, store.clone());

        api.create_vg("vg0", &["/dev/sda".to_string()], Some("INIT")).unwrap();
        assert!(store.get_pv("/dev/sda").unwrap().is_stale());
        assert!(store.get_vg("vg0").unwrap().is_stale());
    }

    #[test]
    fn create_vg_raises_volume_group_create_on_failure() {
        let executor = Arc::new(FakeExecutor::new());
        executor.push_ok(vec![]);
        executor.push_err(LvmCommandError { cmd: vec!["vgcreate".into()], rc: 5, stdout: vec![], stderr: "fail".into() });
        let store = Arc::new(EntityStore::new());
        let api = api(executor, store);

        let err = api.create_vg("vg0", &["/dev/sda".to_string()], None).unwrap_err();
        assert!(matches!(err, CacheError::Mutation(MutationError::VolumeGroupCreate { .. })));
    }

    #[test]
    fn remove_vg_clears_store_on_success() {
        let executor = Arc::new(FakeExecutor::new());
        executor.push_ok(vec![]); // deactivate
        executor.push_ok(vec![]); // vgremove
        let store = Arc::new(EntityStore::new());
        store.upsert_vg(vg("vg0", 4, 10));
        store.upsert_lv(lv("vg0", "lv0", 8, 'a'));
        let api = api(executor, store.clone());

        api.remove_vg("vg0").unwrap();
        assert!(store.get_vg("vg0").is_none());
        assert!(store.get_lv("vg0", "lv0").is_none());
    }

    #[test]
    fn create_lv_rounds_requested_mib_up_to_the_vg_extent_size() {
        let executor = Arc::new(FakeExecutor::new());
        executor.push_ok(vec![]);
        let store = Arc::new(EntityStore::new());
        store.upsert_vg(vg("vg0", VG_EXTENT_SIZE_MB * MIB, 10));
        let api = api(executor.clone(), store);

        // 128 MiB requested against a 128 MiB extent size rounds up to
        // exactly one extent, not 128 of them.
        api.create_lv("vg0", "lv0", VG_EXTENT_SIZE_MB, &[], 0, true).unwrap();

        let calls = executor.calls.lock().unwrap();
        let argv = &calls[0].0;
        let extents_pos = argv.iter().position(|a| a == "--extents").unwrap();
        assert_eq!(argv[extents_pos + 1], "1");
    }

    #[test]
    fn extend_lv_is_a_noop_when_already_large_enough() {
        let executor = Arc::new(FakeExecutor::new());
        let store = Arc::new(EntityStore::new());
        store.upsert_vg(vg("vg0", MIB, 10));
        store.upsert_lv(lv("vg0", "lv0", 10 * MIB, 'a'));
        let api = api(executor.clone(), store);

        // requested size is in MiB; at one extent per MiB this lines up
        // 1:1 with the LV's already-allocated extent count.
        api.extend_lv("vg0", "lv0", 10).unwrap();
        assert_eq!(executor.call_count(), 0);
    }

    #[test]
    fn extend_lv_failure_reports_size_error_when_free_extents_insufficient() {
        let executor = Arc::new(FakeExecutor::new());
        executor.push_err(LvmCommandError { cmd: vec!["lvextend".into()], rc: 5, stdout: vec![], stderr: "insufficient".into() });
        executor.push_ok(vec!["uuid|vg0|wz--n-|1000|500|1048576|10|1||100|50|1|1|/dev/sda".to_string()]);
        executor.push_ok(vec![format!("uuid|lv0|vg0|-wi-a-----|{}|0|/dev/sda(0)|", 8 * MIB)]);
        let store = Arc::new(EntityStore::new());
        store.upsert_vg(vg("vg0", MIB, 1));
        store.upsert_lv(lv("vg0", "lv0", 2 * MIB, 'a'));
        let api = api(executor, store);

        let err = api.extend_lv("vg0", "lv0", 20).unwrap_err();
        assert!(matches!(err, CacheError::Mutation(MutationError::VolumeGroupSizeError { .. })));
    }

    #[test]
    fn deactivate_lvs_swallows_in_use_failure_as_warning() {
        let executor = Arc::new(FakeExecutor::new());
        executor.push_err(LvmCommandError { cmd: vec!["lvchange".into()], rc: 5, stdout: vec![], stderr: "Logical volume vg0/lv0 in use.".into() });
        let store = Arc::new(EntityStore::new());
        store.upsert_lv(lv("vg0", "lv0", 8, 'a'));
        let api = api_with_active(executor, store.clone(), &["/dev/vg0/lv0"]);

        api.deactivate_lvs("vg0", &["lv0".to_string()]).unwrap();
        assert!(store.get_lv("vg0", "lv0").unwrap().is_stale());
    }

    #[test]
    fn deactivate_lvs_raises_on_unrelated_failure() {
        let executor = Arc::new(FakeExecutor::new());
        executor.push_err(LvmCommandError { cmd: vec!["lvchange".into()], rc: 5, stdout: vec![], stderr: "Volume group not found".into() });
        let store = Arc::new(EntityStore::new());
        store.upsert_lv(lv("vg0", "lv0", 8, 'a'));
        let api = api_with_active(executor, store, &["/dev/vg0/lv0"]);

        let err = api.deactivate_lvs("vg0", &["lv0".to_string()]).unwrap_err();
        assert!(matches!(err, CacheError::Mutation(MutationError::CannotDeactivateLogicalVolume { .. })));
    }

    #[test]
    fn deactivate_lvs_skips_already_inactive_lvs() {
        let executor = Arc::new(FakeExecutor::new());
        let store = Arc::new(EntityStore::new());
        store.upsert_lv(lv("vg0", "lv0", 8, '-'));
        let api = api(executor.clone(), store);

        api.deactivate_lvs("vg0", &["lv0".to_string()]).unwrap();
        assert_eq!(executor.call_count(), 0);
    }

    #[test]
    fn replace_lv_tags_rejects_overlapping_add_and_delete() {
        let executor = Arc::new(FakeExecutor::new());
        let store = Arc::new(EntityStore::new());
        let api = api(executor, store);

        let err = api
            .replace_lv_tags("vg0", &["lv0".to_string()], &["shared".to_string()], &["shared".to_string()])
            .unwrap_err();
        assert!(matches!(err, CacheError::Validation(ValidationError::DuplicateTag { .. })));
    }

    #[test]
    fn move_pv_skips_when_no_allocated_extents() {
        let executor = Arc::new(FakeExecutor::new());
        executor.push_ok(vec!["uuid1|/dev/mapper/a|1000|vg0|vguuid|0|10|0|2|1000|2".to_string()]);
        let store = Arc::new(EntityStore::new());
        let api = api(executor.clone(), store);

        api.move_pv("vg0", "/dev/mapper/a", &[]).unwrap();
        assert_eq!(executor.call_count(), 1);
    }

    #[test]
    fn test_pv_create_partitions_used_and_unused_devices() {
        let executor = Arc::new(FakeExecutor::new());
        executor.push_err(LvmCommandError {
            cmd: vec!["pvcreate".into()],
            rc: 5,
            stdout: vec![],
            stderr: "Can't initialize physical volume \"/dev/mapper/b\" of volume group \"vg0\"".into(),
        });
        let store = Arc::new(EntityStore::new());
        let api = api(executor, store);

        let (unused, used) = api.test_pv_create(&["a".to_string(), "b".to_string()]);
        assert_eq!(unused, vec!["a".to_string()]);
        assert_eq!(used, vec!["b".to_string()]);
    }
}
