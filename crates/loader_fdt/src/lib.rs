//! In-place sanitization of the flattened device tree handed to a guest.
//!
//! The loader copies the inbound blob next to the main guest's image and
//! then removes the nodes that guest must not see. Removal rewrites a
//! node's whole token span (name, properties, children) with `FDT_NOP`
//! tokens, so every byte outside the removed span stays identical and a
//! repeated filter pass is a no-op. The blob is trusted boot-chain input:
//! beyond the header sanity checks there is no structural validation.
//!
//! Reading the tree for device discovery is a separate concern, handled by
//! the `fdt` parser crate in the loader binary; this crate only exists
//! because filtering has to mutate the token stream, which a read-only
//! parser cannot do.

#![no_std]

#[cfg(test)]
extern crate std;

use thiserror::Error;

pub const FDT_MAGIC: u32 = 0xd00d_feed;

const TOK_BEGIN_NODE: u32 = 0x1;
const TOK_END_NODE: u32 = 0x2;
const TOK_PROP: u32 = 0x3;
const TOK_NOP: u32 = 0x4;
const TOK_END: u32 = 0x9;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FdtError {
    #[error("bad device tree magic {0:#x}")]
    BadMagic(u32),
    #[error("device tree truncated")]
    Truncated,
    #[error("unrecognized structure token {0:#x}")]
    BadToken(u32),
}

/// Self-reported size of the blob, from the header's `totalsize` field.
pub fn total_size(blob: &[u8]) -> Result<usize, FdtError> {
    let magic = read_u32(blob, 0)?;
    if magic != FDT_MAGIC {
        return Err(FdtError::BadMagic(magic));
    }
    Ok(read_u32(blob, 4)? as usize)
}

/// Where the relocated blob goes: the smallest multiple of `align` at or
/// above the end of the main guest's image. The receiving kernel maps the
/// blob through the direct map rooted at its own load address, so the blob
/// has to sit above the image on a large-page boundary.
#[must_use]
pub const fn relocation_target(image_end: u64, align: u64) -> u64 {
    assert!(align.is_power_of_two());
    (image_end + align - 1) & !(align - 1)
}

/// Strip cpu nodes for harts that may not run, recording each stripped
/// hart id in `disabled_mask`. A hart is stripped when its `status` is
/// present and neither `"okay"` nor `"ok"`, or when its id bit is already
/// set in the mask. Returns the number of nodes removed.
pub fn filter_harts(blob: &mut [u8], disabled_mask: &mut u64) -> Result<usize, FdtError> {
    strip_matching(blob, |node| {
        if node.prop_str("device_type") != Some("cpu") {
            return false;
        }
        let Some(id) = node.reg_value() else {
            return false;
        };
        let enabled = match node.prop_str("status") {
            None => true,
            Some(s) => s == "okay" || s == "ok",
        };
        if id >= u64::from(u64::BITS) {
            return !enabled;
        }
        if !enabled || (*disabled_mask >> id) & 1 == 1 {
            *disabled_mask |= 1 << id;
            return true;
        }
        false
    })
}

/// Strip the platform interrupt controller; the first guest keeps it for
/// itself and the second must not claim its MMIO range.
pub fn filter_interrupt_controller(blob: &mut [u8]) -> Result<usize, FdtError> {
    filter_compatible(blob, "riscv,plic0")
}

/// Strip every node whose `compatible` list contains `compat`.
pub fn filter_compatible(blob: &mut [u8], compat: &str) -> Result<usize, FdtError> {
    strip_matching(blob, |node| node.compatible_contains(compat))
}

struct Header {
    off_struct: usize,
    off_strings: usize,
}

impl Header {
    fn parse(blob: &[u8]) -> Result<Self, FdtError> {
        let magic = read_u32(blob, 0)?;
        if magic != FDT_MAGIC {
            return Err(FdtError::BadMagic(magic));
        }
        let total = read_u32(blob, 4)? as usize;
        if total > blob.len() {
            return Err(FdtError::Truncated);
        }
        Ok(Self {
            off_struct: read_u32(blob, 8)? as usize,
            off_strings: read_u32(blob, 12)? as usize,
        })
    }
}

/// A node at the point of decision: name plus property accessors. Child
/// nodes have not been walked yet when the predicate runs; a node matches
/// on its own name and properties only.
struct NodeView<'a> {
    blob: &'a [u8],
    name: &'a str,
    props_off: usize,
    off_strings: usize,
}

impl<'a> NodeView<'a> {
    fn parse(blob: &'a [u8], begin: usize, off_strings: usize) -> Result<Self, FdtError> {
        let name = read_cstr(blob, begin + 4)?;
        Ok(Self {
            blob,
            name,
            props_off: align4(begin + 4 + name.len() + 1),
            off_strings,
        })
    }

    #[allow(dead_code)]
    fn name(&self) -> &'a str {
        self.name
    }

    /// Raw value of the named property, if present on this node.
    fn prop(&self, want: &str) -> Option<&'a [u8]> {
        let mut off = self.props_off;
        loop {
            match read_u32(self.blob, off).ok()? {
                TOK_NOP => off += 4,
                TOK_PROP => {
                    let len = read_u32(self.blob, off + 4).ok()? as usize;
                    let name_off = read_u32(self.blob, off + 8).ok()? as usize;
                    let name = read_cstr(self.blob, self.off_strings + name_off).ok()?;
                    if name == want {
                        return self.blob.get(off + 12..off + 12 + len);
                    }
                    off = align4(off + 12 + len);
                }
                // Properties precede child nodes; anything else ends them.
                _ => return None,
            }
        }
    }

    /// String property value with the trailing NUL removed.
    fn prop_str(&self, want: &str) -> Option<&'a str> {
        let value = self.prop(want)?;
        let bytes = value.strip_suffix(&[0]).unwrap_or(value);
        core::str::from_utf8(bytes).ok()
    }

    /// The `reg` value as a single cell, either 32- or 64-bit wide.
    fn reg_value(&self) -> Option<u64> {
        let value = self.prop("reg")?;
        match value.len() {
            4 => Some(u64::from(u32::from_be_bytes(value.try_into().ok()?))),
            8 => Some(u64::from_be_bytes(value.try_into().ok()?)),
            _ => None,
        }
    }

    /// Whether the NUL-separated `compatible` list contains `want`.
    fn compatible_contains(&self, want: &str) -> bool {
        let Some(value) = self.prop("compatible") else {
            return false;
        };
        value
            .split(|&b| b == 0)
            .any(|entry| entry == want.as_bytes())
    }
}

/// Walk the structure block and NOP out every node the predicate matches,
/// subtree included. Returns the number of nodes removed.
fn strip_matching<F>(blob: &mut [u8], mut matches: F) -> Result<usize, FdtError>
where
    F: FnMut(&NodeView<'_>) -> bool,
{
    let hdr = Header::parse(blob)?;
    let mut off = hdr.off_struct;
    let mut removed = 0;
    loop {
        match read_u32(blob, off)? {
            TOK_NOP | TOK_END_NODE => off += 4,
            TOK_END => return Ok(removed),
            TOK_PROP => off = skip_prop(blob, off)?,
            TOK_BEGIN_NODE => {
                let matched = matches(&NodeView::parse(blob, off, hdr.off_strings)?);
                if matched {
                    let end = skip_node(blob, off)?;
                    nop_out(blob, off, end);
                    removed += 1;
                    off = end;
                } else {
                    // Descend; properties and children are handled by the
                    // outer loop.
                    off = after_name(blob, off)?;
                }
            }
            other => return Err(FdtError::BadToken(other)),
        }
    }
}

/// Offset just past a whole node, from its BEGIN_NODE token.
fn skip_node(blob: &[u8], begin: usize) -> Result<usize, FdtError> {
    let mut off = after_name(blob, begin)?;
    let mut depth = 1usize;
    loop {
        match read_u32(blob, off)? {
            TOK_NOP => off += 4,
            TOK_PROP => off = skip_prop(blob, off)?,
            TOK_BEGIN_NODE => {
                off = after_name(blob, off)?;
                depth += 1;
            }
            TOK_END_NODE => {
                off += 4;
                depth -= 1;
                if depth == 0 {
                    return Ok(off);
                }
            }
            TOK_END => return Err(FdtError::Truncated),
            other => return Err(FdtError::BadToken(other)),
        }
    }
}

fn skip_prop(blob: &[u8], off: usize) -> Result<usize, FdtError> {
    let len = read_u32(blob, off + 4)? as usize;
    let next = align4(off + 12 + len);
    if next > blob.len() {
        return Err(FdtError::Truncated);
    }
    Ok(next)
}

fn after_name(blob: &[u8], begin: usize) -> Result<usize, FdtError> {
    let name = read_cstr(blob, begin + 4)?;
    Ok(align4(begin + 4 + name.len() + 1))
}

fn nop_out(blob: &mut [u8], from: usize, to: usize) {
    let mut off = from;
    while off < to {
        blob[off..off + 4].copy_from_slice(&TOK_NOP.to_be_bytes());
        off += 4;
    }
}

fn read_u32(blob: &[u8], off: usize) -> Result<u32, FdtError> {
    let bytes = blob
        .get(off..off + 4)
        .ok_or(FdtError::Truncated)?
        .try_into()
        .map_err(|_| FdtError::Truncated)?;
    Ok(u32::from_be_bytes(bytes))
}

fn read_cstr(blob: &[u8], off: usize) -> Result<&str, FdtError> {
    let tail = blob.get(off..).ok_or(FdtError::Truncated)?;
    let len = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or(FdtError::Truncated)?;
    core::str::from_utf8(&tail[..len]).map_err(|_| FdtError::Truncated)
}

const fn align4(off: usize) -> usize {
    (off + 3) & !3
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    /// Minimal v17 blob builder for the filter tests.
    struct FdtBuilder {
        structure: Vec<u8>,
        strings: Vec<u8>,
    }

    impl FdtBuilder {
        fn new() -> Self {
            Self {
                structure: Vec::new(),
                strings: Vec::new(),
            }
        }

        fn begin_node(&mut self, name: &str) -> &mut Self {
            self.structure.extend_from_slice(&TOK_BEGIN_NODE.to_be_bytes());
            self.structure.extend_from_slice(name.as_bytes());
            self.structure.push(0);
            self.pad();
            self
        }

        fn end_node(&mut self) -> &mut Self {
            self.structure.extend_from_slice(&TOK_END_NODE.to_be_bytes());
            self
        }

        fn prop(&mut self, name: &str, value: &[u8]) -> &mut Self {
            let name_off = self.strings.len() as u32;
            self.strings.extend_from_slice(name.as_bytes());
            self.strings.push(0);

            self.structure.extend_from_slice(&TOK_PROP.to_be_bytes());
            self.structure
                .extend_from_slice(&(value.len() as u32).to_be_bytes());
            self.structure.extend_from_slice(&name_off.to_be_bytes());
            self.structure.extend_from_slice(value);
            self.pad();
            self
        }

        fn prop_str(&mut self, name: &str, value: &str) -> &mut Self {
            let mut bytes = Vec::from(value.as_bytes());
            bytes.push(0);
            self.prop(name, &bytes)
        }

        fn prop_u32(&mut self, name: &str, value: u32) -> &mut Self {
            self.prop(name, &value.to_be_bytes())
        }

        fn prop_empty(&mut self, name: &str) -> &mut Self {
            self.prop(name, &[])
        }

        fn pad(&mut self) {
            while self.structure.len() % 4 != 0 {
                self.structure.push(0);
            }
        }

        fn finish(mut self) -> Vec<u8> {
            self.structure.extend_from_slice(&TOK_END.to_be_bytes());

            const HEADER: usize = 40;
            const RSVMAP: usize = 16;
            let off_struct = HEADER + RSVMAP;
            let off_strings = off_struct + self.structure.len();
            let total = off_strings + self.strings.len();

            let mut blob = Vec::new();
            for field in [
                FDT_MAGIC,
                total as u32,
                off_struct as u32,
                off_strings as u32,
                HEADER as u32,
                17,
                16,
                0,
                self.strings.len() as u32,
                self.structure.len() as u32,
            ] {
                blob.extend_from_slice(&field.to_be_bytes());
            }
            blob.extend_from_slice(&[0; RSVMAP]);
            blob.extend_from_slice(&self.structure);
            blob.extend_from_slice(&self.strings);
            blob
        }
    }

    fn two_cpu_blob() -> Vec<u8> {
        let mut b = FdtBuilder::new();
        b.begin_node("");
        b.begin_node("cpus");
        b.begin_node("cpu@0")
            .prop_str("device_type", "cpu")
            .prop_u32("reg", 0)
            .prop_str("status", "okay");
        b.begin_node("interrupt-controller")
            .prop_str("compatible", "riscv,cpu-intc")
            .end_node();
        b.end_node();
        b.begin_node("cpu@1")
            .prop_str("device_type", "cpu")
            .prop_u32("reg", 1)
            .prop_str("status", "disabled")
            .end_node();
        b.end_node();
        b.begin_node("uart@10000000")
            .prop_str("compatible", "litex,uart0")
            .end_node();
        b.end_node();
        b.finish()
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn test_total_size() {
        let blob = two_cpu_blob();
        assert_eq!(blob.len(), total_size(&blob).unwrap());
    }

    #[test]
    fn test_total_size_rejects_bad_magic() {
        let mut blob = two_cpu_blob();
        blob[0] = 0xff;
        assert_eq!(Err(FdtError::BadMagic(0xff0d_feed)), total_size(&blob));
    }

    #[test]
    fn test_header_rejects_truncated_blob() {
        let blob = two_cpu_blob();
        let mut mask = 0;
        assert_eq!(
            Err(FdtError::Truncated),
            filter_harts(&mut blob.clone()[..20].to_vec(), &mut mask)
        );
    }

    #[test]
    fn test_relocation_rounds_up_to_megapage() {
        const MEGA: u64 = 2 * 1024 * 1024;
        assert_eq!(0, relocation_target(0, MEGA));
        assert_eq!(MEGA, relocation_target(1, MEGA));
        assert_eq!(MEGA, relocation_target(MEGA, MEGA));
        assert_eq!(2 * MEGA, relocation_target(MEGA + 1, MEGA));
        let end = 0x8220_4567u64;
        let out = relocation_target(end, MEGA);
        assert!(out >= end && out % MEGA == 0 && out - end < MEGA);
    }

    #[test]
    fn test_filter_harts_strips_disabled_and_records_mask() {
        let mut blob = two_cpu_blob();
        let mut mask = 0;
        assert_eq!(1, filter_harts(&mut blob, &mut mask).unwrap());
        assert_eq!(0b10, mask);
        assert!(!contains(&blob, b"cpu@1"));
        assert!(contains(&blob, b"cpu@0"));
    }

    #[test]
    fn test_filter_harts_strips_masked_hart() {
        let mut blob = two_cpu_blob();
        let mut mask = 0b01;
        assert_eq!(2, filter_harts(&mut blob, &mut mask).unwrap());
        assert_eq!(0b11, mask);
        assert!(!contains(&blob, b"cpu@0"));
        assert!(!contains(&blob, b"cpu@1"));
    }

    #[test]
    fn test_filter_harts_takes_children_along() {
        let mut blob = two_cpu_blob();
        let mut mask = 0b01;
        filter_harts(&mut blob, &mut mask).unwrap();
        // cpu@0's embedded interrupt controller goes with it.
        assert!(!contains(&blob, b"riscv,cpu-intc"));
    }

    #[test]
    fn test_filter_interrupt_controller() {
        let mut b = FdtBuilder::new();
        b.begin_node("");
        b.begin_node("plic@c000000")
            .prop_str("compatible", "riscv,plic0")
            .prop_empty("interrupt-controller")
            .end_node();
        b.begin_node("uart@10000000")
            .prop_str("compatible", "litex,uart0")
            .end_node();
        b.end_node();
        let mut blob = b.finish();

        assert_eq!(1, filter_interrupt_controller(&mut blob).unwrap());
        assert!(!contains(&blob, b"plic@c000000"));
        assert!(contains(&blob, b"uart@10000000"));
    }

    #[test]
    fn test_filter_compatible_matches_any_list_entry() {
        let mut b = FdtBuilder::new();
        b.begin_node("");
        b.begin_node("clint@2000000")
            .prop("compatible", b"sifive,clint0\0riscv,clint0\0")
            .end_node();
        b.end_node();
        let mut blob = b.finish();

        assert_eq!(1, filter_compatible(&mut blob, "riscv,clint0").unwrap());
        assert!(!contains(&blob, b"clint@2000000"));
    }

    #[test]
    fn test_filter_compatible_ignores_substring_matches() {
        let mut b = FdtBuilder::new();
        b.begin_node("");
        b.begin_node("debug@0")
            .prop_str("compatible", "riscv,debug-013-extended")
            .end_node();
        b.end_node();
        let mut blob = b.finish();

        assert_eq!(0, filter_compatible(&mut blob, "riscv,debug-013").unwrap());
        assert!(contains(&blob, b"debug@0"));
    }

    #[test]
    fn test_filters_are_idempotent() {
        let mut blob = two_cpu_blob();
        let mut mask = 0;
        filter_harts(&mut blob, &mut mask).unwrap();
        let snapshot = blob.clone();
        let mut mask2 = mask;
        assert_eq!(0, filter_harts(&mut blob, &mut mask2).unwrap());
        assert_eq!(mask, mask2);
        assert_eq!(snapshot, blob);
    }

    #[test]
    fn test_filter_is_noop_without_matches() {
        let mut blob = two_cpu_blob();
        let snapshot = blob.clone();
        assert_eq!(0, filter_compatible(&mut blob, "riscv,debug-013").unwrap());
        assert_eq!(snapshot, blob);
    }

    #[test]
    fn test_bytes_outside_removed_span_are_identical() {
        let mut blob = two_cpu_blob();
        let before = blob.clone();

        // Span of cpu@1 in the pristine blob.
        let hdr = Header::parse(&before).unwrap();
        let name_pos = before
            .windows(6)
            .position(|w| w == b"cpu@1\0")
            .unwrap();
        let begin = name_pos - 4;
        assert!(begin >= hdr.off_struct);
        let end = skip_node(&before, begin).unwrap();

        let mut mask = 0;
        filter_harts(&mut blob, &mut mask).unwrap();

        assert_eq!(before[..begin], blob[..begin]);
        assert_eq!(before[end..], blob[end..]);
        for off in (begin..end).step_by(4) {
            assert_eq!(TOK_NOP, read_u32(&blob, off).unwrap());
        }
    }

    #[test]
    fn test_scenario_disabled_hart_and_interrupt_controller() {
        let mut b = FdtBuilder::new();
        b.begin_node("");
        b.begin_node("cpus");
        b.begin_node("cpu@3")
            .prop_str("device_type", "cpu")
            .prop_u32("reg", 3)
            .end_node();
        b.end_node();
        b.begin_node("plic@c000000")
            .prop_str("compatible", "riscv,plic0")
            .prop_empty("interrupt-controller")
            .end_node();
        b.begin_node("memory@80000000")
            .prop_str("device_type", "memory")
            .end_node();
        b.end_node();
        let mut blob = b.finish();

        let mut mask = 1 << 3;
        filter_harts(&mut blob, &mut mask).unwrap();
        filter_interrupt_controller(&mut blob).unwrap();

        assert!(!contains(&blob, b"cpu@3"));
        assert!(!contains(&blob, b"plic@c000000"));
        assert!(contains(&blob, b"memory@80000000"));
        assert_eq!(1 << 3, mask);
    }

    #[test]
    fn test_reg_value_wide_cell() {
        let mut b = FdtBuilder::new();
        b.begin_node("");
        b.begin_node("cpu@2")
            .prop_str("device_type", "cpu")
            .prop("reg", &2u64.to_be_bytes())
            .prop_str("status", "disabled")
            .end_node();
        b.end_node();
        let mut blob = b.finish();

        let mut mask = 0;
        assert_eq!(1, filter_harts(&mut blob, &mut mask).unwrap());
        assert_eq!(0b100, mask);
    }
}
