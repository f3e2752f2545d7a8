//! PV / VG / LV records and the Fresh/Stale/Unreadable cache-entry states.
//!
//! Field names follow vdsm's `PV_FIELDS`/`VG_FIELDS`/`LV_FIELDS` tuples
//! (lvm.py:55-64) so the parser in [`crate::parser`] can build these
//! directly off the `pvs`/`vgs`/`lvs` column order.

use crate::error::CacheError;

/// `pvs -o uuid,name,size,vg_name,vg_uuid,pe_start,pe_count,pe_alloc_count,mda_count,dev_size,mda_used_count`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalVolume {
    pub uuid: String,
    pub name: String,
    pub size: u64,
    pub vg_name: String,
    pub vg_uuid: String,
    pub pe_start: u64,
    pub pe_count: u64,
    pub pe_alloc_count: u64,
    pub mda_count: u32,
    pub dev_size: u64,
    pub mda_used_count: u32,
}

impl PhysicalVolume {
    /// Basename of `name`, e.g. `/dev/mapper/foo` -> `foo`.
    pub fn guid(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    /// True when both of this PV's metadata areas are in use. vdsm creates
    /// two metadata areas on every PV of a new VG but only enables them on
    /// one; that PV is the one `createVG` later re-enables via
    /// `pvchange --metadataignore n` (lvm.py:101-108, 1048-1059).
    pub fn is_metadata_pv(&self) -> bool {
        self.mda_used_count == 2
    }
}

/// The six single-character flags packed into `vgs`' `attr` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VgAttr {
    pub permission: char,
    pub resizeable: char,
    pub exported: char,
    pub partial: char,
    pub allocation: char,
    pub clustered: char,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VgPartialState {
    Ok,
    Partial,
}

/// `vgs -o uuid,name,attr,size,free,extent_size,extent_count,free_count,tags,vg_mda_size,vg_mda_free,lv_count,pv_count,pv_name`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeGroup {
    pub uuid: String,
    pub name: String,
    pub attr: VgAttr,
    pub size: u64,
    pub free: u64,
    pub extent_size: u64,
    pub extent_count: u64,
    pub free_count: u64,
    pub tags: Vec<String>,
    pub vg_mda_size: u64,
    pub vg_mda_free: u64,
    pub lv_count: u32,
    pub pv_count: u32,
    pub pv_name: Vec<String>,
}

impl VolumeGroup {
    pub fn writeable(&self) -> bool {
        self.attr.permission == 'w'
    }

    pub fn partial_state(&self) -> VgPartialState {
        if self.attr.partial == '-' {
            VgPartialState::Ok
        } else {
            VgPartialState::Partial
        }
    }

    /// `pv_count` should equal `len(pv_name)`; a mismatch is logged by the
    /// caller but never rejected (see DESIGN.md).
    pub fn pv_count_matches(&self) -> bool {
        self.pv_count as usize == self.pv_name.len()
    }
}

/// The eight single-character flags packed into `lvs`' `attr` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LvAttr {
    pub voltype: char,
    pub permission: char,
    pub allocations: char,
    pub fixedminor: char,
    pub state: char,
    pub devopen: char,
    pub target: char,
    pub zero: char,
}

/// `lvs -o uuid,name,vg_name,attr,size,seg_start_pe,devices,tags`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalVolume {
    pub uuid: String,
    pub name: String,
    pub vg_name: String,
    pub attr: LvAttr,
    pub size: u64,
    pub seg_start_pe: u64,
    pub devices: String,
    pub tags: Vec<String>,
}

impl LogicalVolume {
    pub fn writeable(&self) -> bool {
        self.attr.permission == 'w'
    }

    pub fn opened(&self) -> bool {
        self.attr.devopen == 'o'
    }

    pub fn active(&self) -> bool {
        self.attr.state == 'a'
    }

    /// The PE range of the LV's first segment, e.g. `"/dev/sda(0)"` ->
    /// `("/dev/sda", "0")`, matching vdsm's `getFirstExt` (lvm.py:1750-1751).
    pub fn first_extent(&self) -> Option<(&str, &str)> {
        let trimmed = self.devices.trim_end_matches(')');
        let (dev, pe) = trimmed.split_once('(')?;
        Some((dev, pe))
    }
}

/// A cache slot: a fully parsed record, a "needs reload" placeholder, or a
/// "reload attempted and failed" placeholder
/// §9 Design Notes: "tagged-union, not dynamic dispatch").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry<T> {
    Fresh(T),
    Stale { name: String },
    Unreadable { name: String },
}

impl<T> Entry<T> {
    pub fn is_stale(&self) -> bool {
        !matches!(self, Entry::Fresh(_))
    }

    pub fn name(&self) -> &str
    where
        T: Named,
    {
        match self {
            Entry::Fresh(v) => v.name(),
            Entry::Stale { name } | Entry::Unreadable { name } => name,
        }
    }

    /// Access the fully parsed record, or build a caller-specified error from
    /// the placeholder's name. Mirrors vdsm's `Unreadable.__getattr__` raising
    /// `AttributeError` on any attribute access other than `name` (lvm.py:
    /// 175-184) — here expressed as a typed `Result` instead of an
    /// attribute-access hook, since Rust has no such mechanism. Takes the
    /// error constructor rather than hardcoding one so PV/VG/LV entries can
    /// each raise their own `NotFound` variant.
    pub fn fresh_or(&self, not_found: impl FnOnce(&str) -> CacheError) -> Result<&T, CacheError> {
        match self {
            Entry::Fresh(v) => Ok(v),
            Entry::Stale { name } | Entry::Unreadable { name } => Err(not_found(name)),
        }
    }
}

/// Lets [`Entry::name`] work uniformly across PV/VG/LV records.
pub trait Named {
    fn name(&self) -> &str;
}

impl Named for PhysicalVolume {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for VolumeGroup {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Named for LogicalVolume {
    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pv(name: &str, mda_used: u32) -> PhysicalVolume {
        PhysicalVolume {
            uuid: "u".into(),
            name: name.into(),
            size: 0,
            vg_name: "vg".into(),
            vg_uuid: "vgu".into(),
            pe_start: 0,
            pe_count: 0,
            pe_alloc_count: 0,
            mda_count: 2,
            dev_size: 0,
            mda_used_count: mda_used,
        }
    }

    #[test]
    fn guid_is_basename() {
        assert_eq!(pv("/dev/mapper/foo", 0).guid(), "foo");
    }

    #[test]
    fn metadata_pv_requires_two_used_mdas() {
        assert!(pv("/dev/mapper/foo", 2).is_metadata_pv());
        assert!(!pv("/dev/mapper/foo", 1).is_metadata_pv());
    }

    #[test]
    fn entry_fresh_access_fails_on_stale_and_unreadable() {
        let not_found = |name: &str| CacheError::inaccessible_phys_dev(name.to_string());

        let fresh: Entry<PhysicalVolume> = Entry::Fresh(pv("/dev/mapper/foo", 2));
        assert!(fresh.fresh_or(not_found).is_ok());
        assert!(!fresh.is_stale());

        let stale: Entry<PhysicalVolume> = Entry::Stale { name: "foo".into() };
        assert!(stale.fresh_or(not_found).is_err());
        assert!(stale.is_stale());

        let unreadable: Entry<PhysicalVolume> = Entry::Unreadable { name: "foo".into() };
        assert!(unreadable.fresh_or(not_found).is_err());
        assert!(unreadable.is_stale());
    }

    #[test]
    fn first_extent_parses_device_and_pe() {
        let lv = LogicalVolume {
            uuid: "u".into(),
            name: "lv".into(),
            vg_name: "vg".into(),
            attr: LvAttr {
                voltype: '-',
                permission: 'w',
                allocations: 'i',
                fixedminor: '-',
                state: 'a',
                devopen: 'o',
                target: '-',
                zero: '-',
            },
            size: 0,
            seg_start_pe: 0,
            devices: "/dev/sda(0)".into(),
            tags: vec![],
        };
        assert_eq!(lv.first_extent(), Some(("/dev/sda", "0")));
    }
}
