//! Converts `pvs`/`vgs`/`lvs` tool output into PV/VG/LV records.
//!
//! Mirrors vdsm's `_updatepvs_locked`/`_updatevgs_locked`/`_updatelvs_locked`
//! parsing halves (lvm.py:331-365, 455-504, 582-615), minus the cache
//! mutation itself — parsing is pure here, [`crate::reload::ReloadEngine`]
//! does the merging.

use crate::error::{CacheError, InvariantError};
use crate::types::{LogicalVolume, LvAttr, PhysicalVolume, VgAttr, VolumeGroup};

pub const SEPARATOR: char = '|';
/// Returned by `pvs`/`vgs` in place of a PV name the tool could not
/// resolve (e.g. a missing multipath device). Such rows are dropped.
pub const UNKNOWN: &str = "[unknown]";

pub const PV_FIELDS_LEN: usize = 11;
pub const VG_FIELDS_LEN: usize = 14;
pub const LV_FIELDS_LEN: usize = 8;

/// `pvs --noheadings --units b --nosuffix --separator | --ignoreskippedcluster -o <PV_FIELDS>`
pub const PV_FIELDS: &str = "pv_uuid,pv_name,pv_size,vg_name,vg_uuid,pe_start,pv_pe_count,\
pv_pe_alloc_count,pv_mda_count,dev_size,pv_mda_used_count";
pub const VG_FIELDS: &str = "vg_uuid,vg_name,vg_attr,vg_size,vg_free,vg_extent_size,\
vg_extent_count,vg_free_count,vg_tags,vg_mda_size,vg_mda_free,lv_count,pv_count,pv_name";
pub const LV_FIELDS: &str =
    "lv_uuid,lv_name,vg_name,lv_attr,lv_size,seg_start_pe,devices,lv_tags";

fn split_fields<'a>(line: &'a str) -> Vec<&'a str> {
    line.split(SEPARATOR).map(|f| f.trim()).collect()
}

fn split_tags(raw: &str) -> Vec<String> {
    if raw.is_empty() {
        Vec::new()
    } else {
        raw.split(',').map(|t| t.to_string()).collect()
    }
}

fn parse_u64(field: &str, command: &'static str, line: &str) -> Result<u64, CacheError> {
    field
        .parse()
        .map_err(|_| InvariantError::InvalidOutputLine { command, line: line.to_string() }.into())
}

fn parse_u32(field: &str, command: &'static str, line: &str) -> Result<u32, CacheError> {
    field
        .parse()
        .map_err(|_| InvariantError::InvalidOutputLine { command, line: line.to_string() }.into())
}

fn attr_char(attr: &str, index: usize, command: &'static str, line: &str) -> Result<char, CacheError> {
    attr.chars()
        .nth(index)
        .ok_or_else(|| InvariantError::InvalidOutputLine { command, line: line.to_string() }.into())
}

fn parse_vg_attr(attr: &str, line: &str) -> Result<VgAttr, CacheError> {
    Ok(VgAttr {
        permission: attr_char(attr, 0, "vgs", line)?,
        resizeable: attr_char(attr, 1, "vgs", line)?,
        exported: attr_char(attr, 2, "vgs", line)?,
        partial: attr_char(attr, 3, "vgs", line)?,
        allocation: attr_char(attr, 4, "vgs", line)?,
        clustered: attr_char(attr, 5, "vgs", line)?,
    })
}

fn parse_lv_attr(attr: &str, line: &str) -> Result<LvAttr, CacheError> {
    Ok(LvAttr {
        voltype: attr_char(attr, 0, "lvs", line)?,
        permission: attr_char(attr, 1, "lvs", line)?,
        allocations: attr_char(attr, 2, "lvs", line)?,
        fixedminor: attr_char(attr, 3, "lvs", line)?,
        state: attr_char(attr, 4, "lvs", line)?,
        devopen: attr_char(attr, 5, "lvs", line)?,
        target: attr_char(attr, 6, "lvs", line)?,
        zero: attr_char(attr, 7, "lvs", line)?,
    })
}

/// Parse one `pvs` output line. Returns `Ok(None)` for a `[unknown]` PV
/// name, which vdsm skips with a logged error rather than caching
/// (lvm.py:351-353).
pub fn parse_pv_line(line: &str) -> Result<Option<PhysicalVolume>, CacheError> {
    let fields = split_fields(line);
    if fields.len() != PV_FIELDS_LEN {
        return Err(InvariantError::InvalidOutputLine { command: "pvs", line: line.to_string() }.into());
    }
    let name = fields[1];
    if name == UNKNOWN {
        log::error!("Missing pv: {} in vg: {}", fields[0], fields[3]);
        return Ok(None);
    }
    Ok(Some(PhysicalVolume {
        uuid: fields[0].to_string(),
        name: name.to_string(),
        size: parse_u64(fields[2], "pvs", line)?,
        vg_name: fields[3].to_string(),
        vg_uuid: fields[4].to_string(),
        pe_start: parse_u64(fields[5], "pvs", line)?,
        pe_count: parse_u64(fields[6], "pvs", line)?,
        pe_alloc_count: parse_u64(fields[7], "pvs", line)?,
        mda_count: parse_u32(fields[8], "pvs", line)?,
        dev_size: parse_u64(fields[9], "pvs", line)?,
        mda_used_count: parse_u32(fields[10], "pvs", line)?,
    }))
}

pub fn parse_pv_lines(lines: &[String]) -> Result<Vec<PhysicalVolume>, CacheError> {
    lines.iter().filter_map(|l| parse_pv_line(l).transpose()).collect()
}

/// Parse a full `vgs` output, collapsing rows sharing the same `uuid` into
/// one record whose `pv_name` is the ordered sequence of PV names seen for
/// that uuid (vdsm lvm.py:470-504).
pub fn parse_vg_lines(lines: &[String]) -> Result<Vec<VolumeGroup>, CacheError> {
    // uuid -> (fields up to pv_name, accumulated pv names)
    let mut order: Vec<String> = Vec::new();
    let mut grouped: std::collections::HashMap<String, (Vec<String>, Vec<String>)> =
        std::collections::HashMap::new();

    for line in lines {
        let fields = split_fields(line);
        if fields.len() != VG_FIELDS_LEN {
            return Err(InvariantError::InvalidOutputLine { command: "vgs", line: line.clone() }.into());
        }
        let uuid = fields[0].to_string();
        let pv_name = fields[13];
        if pv_name == UNKNOWN {
            // PV is missing, e.g. device lost or target not connected.
            continue;
        }
        let entry = grouped.entry(uuid.clone()).or_insert_with(|| {
            order.push(uuid.clone());
            (fields.iter().map(|f| f.to_string()).collect(), Vec::new())
        });
        entry.1.push(pv_name.to_string());
    }

    let mut vgs = Vec::with_capacity(order.len());
    for uuid in order {
        let (fields, pv_name) = grouped.remove(&uuid).expect("just inserted");
        let line_repr = fields.join("|");
        let pv_count = parse_u32(&fields[12], "vgs", &line_repr)?;
        if pv_count as usize != pv_name.len() {
            log::error!(
                "vg {} has pv_count {} but pv_names {:?}",
                fields[1],
                pv_count,
                pv_name
            );
        }
        vgs.push(VolumeGroup {
            uuid: fields[0].clone(),
            name: fields[1].clone(),
            attr: parse_vg_attr(&fields[2], &line_repr)?,
            size: parse_u64(&fields[3], "vgs", &line_repr)?,
            free: parse_u64(&fields[4], "vgs", &line_repr)?,
            extent_size: parse_u64(&fields[5], "vgs", &line_repr)?,
            extent_count: parse_u64(&fields[6], "vgs", &line_repr)?,
            free_count: parse_u64(&fields[7], "vgs", &line_repr)?,
            tags: split_tags(&fields[8]),
            vg_mda_size: parse_u64(&fields[9], "vgs", &line_repr)?,
            vg_mda_free: parse_u64(&fields[10], "vgs", &line_repr)?,
            lv_count: parse_u32(&fields[11], "vgs", &line_repr)?,
            pv_count,
            pv_name,
        });
    }
    Ok(vgs)
}

/// Parse one `lvs` output line. Returns `Ok(None)` for a continuation row
/// of a multi-segment LV (`seg_start_pe != "0"`) — only the first extent
/// is retained (vdsm lvm.py:601).
pub fn parse_lv_line(line: &str) -> Result<Option<LogicalVolume>, CacheError> {
    let fields = split_fields(line);
    if fields.len() != LV_FIELDS_LEN {
        return Err(InvariantError::InvalidOutputLine { command: "lvs", line: line.to_string() }.into());
    }
    let seg_start_pe = parse_u64(fields[5], "lvs", line)?;
    if seg_start_pe != 0 {
        return Ok(None);
    }
    Ok(Some(LogicalVolume {
        uuid: fields[0].to_string(),
        name: fields[1].to_string(),
        vg_name: fields[2].to_string(),
        attr: parse_lv_attr(fields[3], line)?,
        size: parse_u64(fields[4], "lvs", line)?,
        seg_start_pe,
        devices: fields[6].to_string(),
        tags: split_tags(fields[7]),
    }))
}

pub fn parse_lv_lines(lines: &[String]) -> Result<Vec<LogicalVolume>, CacheError> {
    lines.iter().filter_map(|l| parse_lv_line(l).transpose()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pv_line(name: &str) -> String {
        format!(
            "uuid1|{}|1000|vg0|vguuid|0|10|2|2|1000|2",
            name
        )
    }

    #[test]
    fn parse_fidelity_trims_and_preserves_fields() {
        let line = "  uuid1 | /dev/mapper/x | 1000 | vg0 | vguuid | 0 | 10 | 2 | 2 | 1000 | 2 ";
        let pv = parse_pv_line(line).unwrap().unwrap();
        assert_eq!(pv.uuid, "uuid1");
        assert_eq!(pv.name, "/dev/mapper/x");
        assert_eq!(pv.size, 1000);
        assert_eq!(pv.mda_used_count, 2);
    }

    #[test]
    fn unknown_pv_name_is_skipped() {
        let line = pv_line(UNKNOWN);
        assert!(parse_pv_line(&line).unwrap().is_none());
    }

    #[test]
    fn wrong_field_count_raises_invalid_output_line() {
        let err = parse_pv_line("only|two").unwrap_err();
        assert!(matches!(err, CacheError::Invariant(InvariantError::InvalidOutputLine { .. })));
    }

    #[test]
    fn vg_rows_sharing_uuid_collapse_into_one_record() {
        let lines = vec![
            "uuid1|vg0|wz--n-|1000|500|4|10|5|tag1,tag2|100|50|2|2|/dev/sda".to_string(),
            "uuid1|vg0|wz--n-|1000|500|4|10|5|tag1,tag2|100|50|2|2|/dev/sdb".to_string(),
        ];
        let vgs = parse_vg_lines(&lines).unwrap();
        assert_eq!(vgs.len(), 1);
        assert_eq!(vgs[0].pv_name, vec!["/dev/sda".to_string(), "/dev/sdb".to_string()]);
        assert_eq!(vgs[0].tags, vec!["tag1".to_string(), "tag2".to_string()]);
        assert!(vgs[0].writeable());
    }

    #[test]
    fn vg_unknown_pv_row_is_dropped() {
        let lines = vec![format!("uuid1|vg0|wz--n-|1000|500|4|10|5||100|50|2|1|{}", UNKNOWN)];
        let vgs = parse_vg_lines(&lines).unwrap();
        assert!(vgs.is_empty());
    }

    #[test]
    fn lv_continuation_rows_are_discarded() {
        let lines = vec![
            "uuid1|lv0|vg0|-wi-a-----|1000|0|/dev/sda(0)|".to_string(),
            "uuid1|lv0|vg0|-wi-a-----|1000|10|/dev/sda(10)|".to_string(),
        ];
        let lvs = parse_lv_lines(&lines).unwrap();
        assert_eq!(lvs.len(), 1);
        assert_eq!(lvs[0].seg_start_pe, 0);
    }

    #[test]
    fn empty_tag_column_yields_empty_sequence() {
        let lines = vec!["uuid1|lv0|vg0|-wi-a-----|1000|0|/dev/sda(0)|".to_string()];
        let lvs = parse_lv_lines(&lines).unwrap();
        assert!(lvs[0].tags.is_empty());
    }
}
