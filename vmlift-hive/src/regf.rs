//! REGF on-disk format: parse and serialize.
//!
//! Layout of a primary hive file:
//!
//! | Region | Contents                                         |
//! |--------|--------------------------------------------------|
//! | 0x0000 | Base block: `regf` magic, sequences, root offset |
//! | 0x1000 | First hive bin (`hbin`), 4 KiB aligned           |
//! | …      | Further hive bins                                |
//!
//! Each bin holds cells: a little-endian `i32` size (negative when
//! allocated) followed by the record. Key records are `nk`, values `vk`,
//! subkey indexes `lf`/`lh`/`li`/`ri`, security descriptors `sk`. All
//! cell references are offsets relative to the start of the bins area.
//!
//! The serializer emits a fresh file from the node tree: one shared `sk`
//! record, `lh` subkey lists, and inline storage for value data of four
//! bytes or less (the `0x8000_0000` length bit).

use std::collections::HashMap;

use crate::value::{RegType, RegValue, from_utf16le, utf16le_of};
use crate::{Error, Hive, Node, Result};

/// Base block length; the first hive bin starts here.
const BASE_BLOCK: usize = 0x1000;
/// Hive bin granularity.
const HBIN: usize = 0x1000;
/// Hive bin header length.
const HBIN_HEADER: usize = 0x20;
/// "No cell" sentinel offset.
const NONE_OFF: u32 = 0xFFFF_FFFF;
/// Above this many data bytes Windows switches to `db` big-data cells.
const BIG_DATA_THRESHOLD: usize = 16344;

/// Minimal self-relative security descriptor (revision 1, SE_SELF_RELATIVE,
/// no owner/group/SACL/DACL). Every written key shares one `sk` with this.
const DEFAULT_SD: [u8; 20] = [
    0x01, 0x00, 0x00, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parses a complete hive image.
pub(crate) fn parse(data: &[u8]) -> Result<Hive> {
    if data.len() < BASE_BLOCK + HBIN_HEADER || &data[0..4] != b"regf" {
        return Err(Error::BadBaseBlock);
    }
    let sequence = le32(data, 4);
    let root_off = le32(data, 36);
    let filename = from_utf16le(&data[48..112]);

    let bins = &data[BASE_BLOCK..];
    let mut nodes = Vec::new();
    parse_nk(bins, root_off, None, &mut nodes)?;
    Ok(Hive::from_parts(nodes, filename, sequence))
}

/// Returns the payload of the cell at `off` (size field excluded).
fn cell(bins: &[u8], off: u32) -> Result<&[u8]> {
    let start = off as usize;
    if start + 4 > bins.len() {
        return Err(Error::BadCellOffset(off));
    }
    let size = i32::from_le_bytes([bins[start], bins[start + 1], bins[start + 2], bins[start + 3]]);
    let len = size.unsigned_abs() as usize;
    if len < 4 || start + len > bins.len() {
        return Err(Error::BadCellOffset(off));
    }
    Ok(&bins[start + 4..start + len])
}

/// Parses the `nk` record at `off` and, recursively, its values and
/// subkeys. Returns the new node's arena index.
fn parse_nk(bins: &[u8], off: u32, parent: Option<usize>, nodes: &mut Vec<Node>) -> Result<usize> {
    let rec = cell(bins, off)?;
    if rec.len() < 76 || &rec[0..2] != b"nk" {
        return Err(Error::BadSignature {
            expected: "nk",
            offset: off,
        });
    }
    let flags = le16(rec, 2);
    let timestamp = le64(rec, 4);
    let n_subkeys = le32(rec, 20);
    let subkey_list = le32(rec, 28);
    let n_values = le32(rec, 36);
    let value_list = le32(rec, 40);
    let name_len = le16(rec, 72) as usize;
    if 76 + name_len > rec.len() {
        return Err(Error::BadCellOffset(off));
    }
    let name_raw = &rec[76..76 + name_len];
    let name = if flags & 0x20 != 0 {
        // Compressed: Latin-1 single bytes.
        name_raw.iter().map(|&b| b as char).collect()
    } else {
        from_utf16le(name_raw)
    };

    let idx = nodes.len();
    nodes.push(Node {
        name,
        parent,
        children: Vec::new(),
        values: Vec::new(),
        timestamp,
        deleted: false,
    });

    if n_values > 0 && value_list != NONE_OFF {
        let list = cell(bins, value_list)?;
        for i in 0..n_values as usize {
            if (i + 1) * 4 > list.len() {
                return Err(Error::BadCellOffset(value_list));
            }
            let vk_off = le32(list, i * 4);
            let (vname, value) = parse_vk(bins, vk_off)?;
            nodes[idx].values.push((vname, value));
        }
    }

    if n_subkeys > 0 && subkey_list != NONE_OFF {
        parse_subkey_list(bins, subkey_list, idx, nodes)?;
    }
    if let Some(p) = parent {
        nodes[p].children.push(idx);
    }
    Ok(idx)
}

/// Parses an `lf`/`lh`/`li`/`ri` subkey index rooted at `off`.
fn parse_subkey_list(bins: &[u8], off: u32, parent: usize, nodes: &mut Vec<Node>) -> Result<()> {
    let rec = cell(bins, off)?;
    if rec.len() < 4 {
        return Err(Error::BadCellOffset(off));
    }
    let count = le16(rec, 2) as usize;
    match &rec[0..2] {
        b"lf" | b"lh" => {
            for i in 0..count {
                let entry = le32(rec, 4 + i * 8);
                parse_nk(bins, entry, Some(parent), nodes)?;
            }
            Ok(())
        }
        b"li" => {
            for i in 0..count {
                let entry = le32(rec, 4 + i * 4);
                parse_nk(bins, entry, Some(parent), nodes)?;
            }
            Ok(())
        }
        b"ri" => {
            for i in 0..count {
                let sublist = le32(rec, 4 + i * 4);
                parse_subkey_list(bins, sublist, parent, nodes)?;
            }
            Ok(())
        }
        _ => Err(Error::BadSignature {
            expected: "lf/lh/li/ri",
            offset: off,
        }),
    }
}

/// Parses the `vk` record at `off` into `(name, value)`.
fn parse_vk(bins: &[u8], off: u32) -> Result<(String, RegValue)> {
    let rec = cell(bins, off)?;
    if rec.len() < 20 || &rec[0..2] != b"vk" {
        return Err(Error::BadSignature {
            expected: "vk",
            offset: off,
        });
    }
    let name_len = le16(rec, 2) as usize;
    let data_len_raw = le32(rec, 4);
    let data_off = le32(rec, 8);
    let vtype = le32(rec, 12);
    let flags = le16(rec, 16);

    let name = if name_len == 0 {
        String::new()
    } else if 20 + name_len > rec.len() {
        return Err(Error::BadCellOffset(off));
    } else if flags & 1 != 0 {
        rec[20..20 + name_len].iter().map(|&b| b as char).collect()
    } else {
        from_utf16le(&rec[20..20 + name_len])
    };

    let inline = data_len_raw & 0x8000_0000 != 0;
    let data_len = (data_len_raw & 0x7FFF_FFFF) as usize;
    let data = if inline {
        // Up to four bytes stored directly in the offset field.
        rec[8..8 + data_len.min(4)].to_vec()
    } else if data_len == 0 {
        Vec::new()
    } else {
        let raw = cell(bins, data_off)?;
        if data_len > raw.len() {
            // Longer than its cell: stored via a db big-data record.
            return Err(Error::BigData);
        }
        raw[..data_len].to_vec()
    };

    Ok((
        name,
        RegValue {
            vtype: RegType::from_raw(vtype),
            data,
        },
    ))
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

/// A cell planned for output: its future payload is rendered late, once
/// all offsets are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CellId {
    /// Shared security record.
    Sk,
    /// Key record for node `n`.
    Nk(usize),
    /// Value-offset list for node `n`.
    ValList(usize),
    /// `vk` record for value `v` of node `n`.
    Vk(usize, usize),
    /// Data cell for value `v` of node `n`.
    Data(usize, usize),
    /// Subkey index (`lh`) for node `n`.
    SubList(usize),
}

/// Serializes the hive node tree into a complete REGF image.
pub(crate) fn serialize(hive: &Hive) -> Vec<u8> {
    // Live nodes in preorder; index 0 (root) is always live.
    let mut order = Vec::new();
    preorder(hive, 0, &mut order);

    // Plan cells and their payload sizes.
    let mut plan: Vec<(CellId, usize)> = vec![(CellId::Sk, 20 + DEFAULT_SD.len())];
    for &n in &order {
        let node = hive.node(n);
        plan.push((CellId::Nk(n), 76 + key_name_len(&node.name)));
        if !node.values.is_empty() {
            plan.push((CellId::ValList(n), node.values.len() * 4));
            for (vi, (vname, value)) in node.values.iter().enumerate() {
                plan.push((CellId::Vk(n, vi), 20 + key_name_len(vname)));
                if value.data.len() > 4 {
                    plan.push((CellId::Data(n, vi), value.data.len()));
                }
            }
        }
        if live_children(hive, n).count() > 0 {
            plan.push((CellId::SubList(n), 4 + live_children(hive, n).count() * 8));
        }
    }

    // Lay out cells into hive bins. Offsets are relative to bins start.
    let mut offsets: HashMap<CellId, u32> = HashMap::new();
    let mut hbins: Vec<usize> = Vec::new(); // size of each bin
    let mut cur_bin_start = 0usize;
    let mut cur_bin_size = HBIN;
    let mut cur = HBIN_HEADER;
    for &(id, payload) in &plan {
        let cell_size = align8(4 + payload);
        if cur + cell_size > cur_bin_size {
            if hbins.is_empty() && cur == HBIN_HEADER {
                // First cell larger than one bin: grow the bin instead.
                cur_bin_size = align_up(HBIN_HEADER + cell_size, HBIN);
            } else {
                hbins.push(cur_bin_size);
                cur_bin_start += cur_bin_size;
                cur_bin_size = align_up(HBIN_HEADER + cell_size, HBIN);
                cur = HBIN_HEADER;
            }
        }
        offsets.insert(id, (cur_bin_start + cur) as u32);
        cur += cell_size;
    }
    hbins.push(cur_bin_size);
    let bins_total: usize = hbins.iter().sum();

    // Render the bins area.
    let mut bins = vec![0u8; bins_total];
    let mut bin_off = 0usize;
    for &size in &hbins {
        bins[bin_off..bin_off + 4].copy_from_slice(b"hbin");
        put32(&mut bins, bin_off + 4, bin_off as u32);
        put32(&mut bins, bin_off + 8, size as u32);
        bin_off += size;
    }

    let mut last_end_per_bin: HashMap<usize, usize> = HashMap::new();
    for &(id, payload) in &plan {
        let off = offsets[&id] as usize;
        let cell_size = align8(4 + payload);
        put32(&mut bins, off, (cell_size as i32).wrapping_neg() as u32);
        let body = render_cell(hive, id, &offsets, &order);
        bins[off + 4..off + 4 + body.len()].copy_from_slice(&body);
        // Track where the allocated region of each bin ends.
        let bin_start = bin_start_of(&hbins, off);
        let end = last_end_per_bin.entry(bin_start).or_insert(HBIN_HEADER);
        *end = (*end).max(off - bin_start + cell_size);
    }

    // Terminate each bin's free tail with one positive (free) cell.
    let mut start = 0usize;
    for &size in &hbins {
        let used = last_end_per_bin.get(&start).copied().unwrap_or(HBIN_HEADER);
        if used < size {
            put32(&mut bins, start + used, (size - used) as u32);
        }
        start += size;
    }

    // Base block.
    let mut out = vec![0u8; BASE_BLOCK];
    out[0..4].copy_from_slice(b"regf");
    put32(&mut out, 4, hive.sequence());
    put32(&mut out, 8, hive.sequence());
    put32(&mut out, 20, 1); // major
    put32(&mut out, 24, 5); // minor
    put32(&mut out, 28, 0); // file type: primary
    put32(&mut out, 32, 1); // format: direct memory load
    put32(&mut out, 36, offsets[&CellId::Nk(0)]);
    put32(&mut out, 40, bins_total as u32);
    put32(&mut out, 44, 1); // clustering factor
    let fname = utf16le_of(hive.filename());
    let n = fname.len().min(64);
    out[48..48 + n].copy_from_slice(&fname[..n]);
    let mut sum = 0u32;
    for i in (0..0x1FC).step_by(4) {
        sum ^= le32(&out, i);
    }
    if sum == 0xFFFF_FFFF {
        sum = 0xFFFF_FFFE;
    } else if sum == 0 {
        sum = 1;
    }
    put32(&mut out, 0x1FC, sum);

    out.extend_from_slice(&bins);
    out
}

/// Renders one cell body (without the size field).
fn render_cell(
    hive: &Hive,
    id: CellId,
    offsets: &HashMap<CellId, u32>,
    order: &[usize],
) -> Vec<u8> {
    match id {
        CellId::Sk => {
            let mut b = vec![0u8; 20 + DEFAULT_SD.len()];
            b[0..2].copy_from_slice(b"sk");
            let self_off = offsets[&CellId::Sk];
            put32(&mut b, 4, self_off); // flink
            put32(&mut b, 8, self_off); // blink
            put32(&mut b, 12, order.len() as u32); // refcount
            put32(&mut b, 16, DEFAULT_SD.len() as u32);
            b[20..].copy_from_slice(&DEFAULT_SD);
            b
        }
        CellId::Nk(n) => render_nk(hive, n, offsets),
        CellId::ValList(n) => {
            let node = hive.node(n);
            let mut b = vec![0u8; node.values.len() * 4];
            for vi in 0..node.values.len() {
                put32(&mut b, vi * 4, offsets[&CellId::Vk(n, vi)]);
            }
            b
        }
        CellId::Vk(n, vi) => render_vk(hive, n, vi, offsets),
        CellId::Data(n, vi) => hive.node(n).values[vi].1.data.clone(),
        CellId::SubList(n) => {
            let children: Vec<usize> = live_children(hive, n).collect();
            let mut b = vec![0u8; 4 + children.len() * 8];
            b[0..2].copy_from_slice(b"lh");
            put16(&mut b, 2, children.len() as u16);
            for (i, &c) in children.iter().enumerate() {
                put32(&mut b, 4 + i * 8, offsets[&CellId::Nk(c)]);
                put32(&mut b, 8 + i * 8, lh_hash(&hive.node(c).name));
            }
            b
        }
    }
}

/// Renders an `nk` record.
fn render_nk(hive: &Hive, n: usize, offsets: &HashMap<CellId, u32>) -> Vec<u8> {
    let node = hive.node(n);
    let ascii = node.name.is_ascii();
    let name: Vec<u8> = if ascii {
        node.name.bytes().collect()
    } else {
        utf16le_of(&node.name)
    };

    let mut b = vec![0u8; 76 + name.len()];
    b[0..2].copy_from_slice(b"nk");
    let mut flags = 0u16;
    if ascii {
        flags |= 0x20;
    }
    if n == 0 {
        flags |= 0x04; // hive entry root key
    }
    put16(&mut b, 2, flags);
    put64(&mut b, 4, node.timestamp);
    put32(&mut b, 16, node.parent.map_or(NONE_OFF, |p| offsets[&CellId::Nk(p)]));

    let children: Vec<usize> = live_children(hive, n).collect();
    put32(&mut b, 20, children.len() as u32);
    put32(
        &mut b,
        28,
        if children.is_empty() {
            NONE_OFF
        } else {
            offsets[&CellId::SubList(n)]
        },
    );
    put32(&mut b, 32, NONE_OFF); // volatile subkey list
    put32(&mut b, 36, node.values.len() as u32);
    put32(
        &mut b,
        40,
        if node.values.is_empty() {
            NONE_OFF
        } else {
            offsets[&CellId::ValList(n)]
        },
    );
    put32(&mut b, 44, offsets[&CellId::Sk]);
    put32(&mut b, 48, NONE_OFF); // class name

    // Allocation hints (byte lengths as UTF-16).
    let max_sub = children
        .iter()
        .map(|&c| hive.node(c).name.chars().count() * 2)
        .max()
        .unwrap_or(0);
    let max_vname = node
        .values
        .iter()
        .map(|(vn, _)| vn.chars().count() * 2)
        .max()
        .unwrap_or(0);
    let max_vdata = node.values.iter().map(|(_, v)| v.data.len()).max().unwrap_or(0);
    put32(&mut b, 52, max_sub as u32);
    put32(&mut b, 56, 0);
    put32(&mut b, 60, max_vname as u32);
    put32(&mut b, 64, max_vdata as u32);

    put16(&mut b, 72, name.len() as u16);
    put16(&mut b, 74, 0); // class length
    b[76..].copy_from_slice(&name);
    b
}

/// Renders a `vk` record.
fn render_vk(hive: &Hive, n: usize, vi: usize, offsets: &HashMap<CellId, u32>) -> Vec<u8> {
    let (vname, value) = &hive.node(n).values[vi];
    let ascii = vname.is_ascii();
    let name: Vec<u8> = if ascii {
        vname.bytes().collect()
    } else {
        utf16le_of(vname)
    };

    let mut b = vec![0u8; 20 + name.len()];
    b[0..2].copy_from_slice(b"vk");
    put16(&mut b, 2, name.len() as u16);
    if value.data.len() <= 4 {
        put32(&mut b, 4, value.data.len() as u32 | 0x8000_0000);
        b[8..8 + value.data.len()].copy_from_slice(&value.data);
    } else {
        debug_assert!(value.data.len() < BIG_DATA_THRESHOLD);
        put32(&mut b, 4, value.data.len() as u32);
        put32(&mut b, 8, offsets[&CellId::Data(n, vi)]);
    }
    put32(&mut b, 12, value.vtype.to_raw());
    if ascii && !name.is_empty() {
        put16(&mut b, 16, 1);
    }
    b[20..].copy_from_slice(&name);
    b
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Collects live node indices in preorder starting at `n`.
fn preorder(hive: &Hive, n: usize, out: &mut Vec<usize>) {
    out.push(n);
    for c in live_children(hive, n) {
        preorder(hive, c, out);
    }
}

/// Iterates the non-deleted children of node `n`.
fn live_children(hive: &Hive, n: usize) -> impl Iterator<Item = usize> + '_ {
    hive.node(n)
        .children
        .iter()
        .copied()
        .filter(move |&c| !hive.nodes()[c].deleted)
}

/// Stored byte length of a key or value name (ASCII compressed or UTF-16LE).
fn key_name_len(name: &str) -> usize {
    if name.is_ascii() {
        name.len()
    } else {
        name.chars().count() * 2
    }
}

/// `lh` list hash: `h = h*37 + uppercase(c)` over the key name.
fn lh_hash(name: &str) -> u32 {
    let mut h: u32 = 0;
    for c in name.to_uppercase().chars() {
        h = h.wrapping_mul(37).wrapping_add(c as u32);
    }
    h
}

/// Finds the start offset of the bin containing `off`.
fn bin_start_of(hbins: &[usize], off: usize) -> usize {
    let mut start = 0;
    for &size in hbins {
        if off < start + size {
            return start;
        }
        start += size;
    }
    start
}

fn le16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn le32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn le64(b: &[u8], off: usize) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(a)
}

fn put16(b: &mut [u8], off: usize, v: u16) {
    b[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(b: &mut [u8], off: usize, v: u32) {
    b[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put64(b: &mut [u8], off: usize, v: u64) {
    b[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Rounds a cell size up to the 8-byte cell granularity.
const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Rounds up to a multiple of `to`.
const fn align_up(n: usize, to: usize) -> usize {
    n.div_ceil(to) * to
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample() -> Hive {
        let mut hive = Hive::create("SYSTEM");
        let svc = hive.ensure_path(r"ControlSet001\Services\viostor").unwrap();
        hive.set_value(svc, "Type", RegValue::dword(1));
        hive.set_value(svc, "Start", RegValue::dword(0));
        hive.set_value(svc, "Group", RegValue::sz("SCSI miniport"));
        hive.set_value(
            svc,
            "ImagePath",
            RegValue::expand_sz(r"system32\drivers\viostor.sys"),
        );
        let class = hive
            .ensure_path(r"ControlSet001\Control\Class\{4d36e967-e325-11ce-bfc1-08002be10318}")
            .unwrap();
        hive.set_value(
            class,
            "LowerFilters",
            RegValue::multi_sz(&["PartMgr", "prl_strg"]),
        );
        hive
    }

    #[test]
    fn round_trip_preserves_tree_and_values() {
        let hive = sample();
        let bytes = hive.to_bytes();
        let back = Hive::from_bytes(&bytes).unwrap();

        let svc = back
            .lookup(back.root(), r"ControlSet001\Services\viostor")
            .unwrap();
        assert_eq!(back.value(svc, "Start").unwrap().as_dword(), Some(0));
        assert_eq!(
            back.value(svc, "Group").unwrap().as_string().unwrap(),
            "SCSI miniport"
        );
        assert_eq!(
            back.value(svc, "ImagePath").unwrap().as_string().unwrap(),
            r"system32\drivers\viostor.sys"
        );

        let class = back
            .lookup(
                back.root(),
                r"ControlSet001\Control\Class\{4d36e967-e325-11ce-bfc1-08002be10318}",
            )
            .unwrap();
        assert_eq!(
            back.value(class, "LowerFilters").unwrap().as_multi_sz().unwrap(),
            vec!["PartMgr", "prl_strg"]
        );
    }

    #[test]
    fn round_trip_preserves_raw_value_bytes() {
        let mut hive = sample();
        let key = hive.ensure_path("Raw").unwrap();
        let blob: Vec<u8> = (0u16..600).map(|i| (i % 251) as u8).collect();
        hive.set_value(key, "Blob", RegValue::binary(&blob));
        hive.set_value(key, "Tiny", RegValue::binary(&[0xAB, 0xCD]));

        let back = Hive::from_bytes(&hive.to_bytes()).unwrap();
        let key = back.lookup(back.root(), "Raw").unwrap();
        assert_eq!(back.value(key, "Blob").unwrap().data, blob);
        assert_eq!(back.value(key, "Tiny").unwrap().data, vec![0xAB, 0xCD]);
    }

    #[test]
    fn deleted_keys_are_not_serialized() {
        let mut hive = sample();
        let svc = hive.lookup(hive.root(), r"ControlSet001\Services\viostor").unwrap();
        hive.delete_key(svc);

        let back = Hive::from_bytes(&hive.to_bytes()).unwrap();
        assert!(back.lookup(back.root(), r"ControlSet001\Services\viostor").is_err());
        assert!(back.lookup(back.root(), r"ControlSet001\Services").is_ok());
    }

    #[test]
    fn base_block_checksum_and_magic() {
        let bytes = sample().to_bytes();
        assert_eq!(&bytes[0..4], b"regf");
        let mut sum = 0u32;
        for i in (0..0x1FC).step_by(4) {
            sum ^= le32(&bytes, i);
        }
        assert_eq!(sum, le32(&bytes, 0x1FC));
        // First hive bin directly after the base block.
        assert_eq!(&bytes[0x1000..0x1004], b"hbin");
    }

    #[test]
    fn many_keys_span_multiple_bins() {
        let mut hive = Hive::create("BIG");
        for i in 0..400 {
            let key = hive.ensure_path(&format!("Key{i:04}")).unwrap();
            hive.set_value(key, "Payload", RegValue::binary(&[0x55; 64]));
        }
        let bytes = hive.to_bytes();
        assert!(bytes.len() > 0x1000 + 0x1000, "expected more than one hbin");

        let back = Hive::from_bytes(&bytes).unwrap();
        assert_eq!(back.children(back.root()).len(), 400);
        let k = back.lookup(back.root(), "Key0399").unwrap();
        assert_eq!(back.value(k, "Payload").unwrap().data, vec![0x55; 64]);
    }
}
