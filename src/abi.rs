//! ABI Struct Packer
//!
//! An [`AbiStruct`] is an ordered list of named, bit-precise members laid out
//! in one owned byte buffer. The layout is a pure function of the member list
//! and the [`LayoutRules`]; compiled code addresses the same members through
//! [`AbiMember::placement`], so host-side packing and generated loads and
//! stores always agree.

use std::collections::HashMap;
use std::fmt;

use malachite_bigint::BigUint;
use serde::Deserialize;

use crate::emitter::{container_bytes, FieldPlacement, MAX_NATIVE_WIDTH};
use crate::error::{JitError, Result};

/// How members of a record are placed in its buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutRules {
    /// Each member in a power-of-two container aligned to its size; the
    /// record is padded to its largest alignment.
    #[default]
    Natural,
    /// Each member in `ceil(width / 8)` bytes, no padding.
    Packed,
    /// Members packed bit-contiguously.
    BitPacked,
}

/// One member of a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbiMember {
    pub name: String,
    pub width: u32,
    pub bit_offset: u64,
    pub storage_bytes: u32,
    exclusive: bool,
}

impl AbiMember {
    /// Placement of this member relative to the record base.
    pub fn placement(&self) -> FieldPlacement {
        FieldPlacement {
            bit_offset: self.bit_offset,
            width: self.width,
            storage_bytes: self.storage_bytes,
            exclusive: self.exclusive,
        }
    }

    pub fn byte_offset(&self) -> usize {
        (self.bit_offset / 8) as usize
    }
}

/// Size and alignment of a member's container under natural rules.
fn natural_container(width: u32) -> (u64, u64) {
    if width <= MAX_NATIVE_WIDTH {
        let size = container_bytes(width) as u64;
        (size, size)
    } else {
        ((width as u64).div_ceil(64) * 8, 8)
    }
}

fn round_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// Computed layout of a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbiLayout {
    rules: LayoutRules,
    members: Vec<AbiMember>,
    index: HashMap<String, usize>,
    size: usize,
    align: usize,
}

impl AbiLayout {
    pub fn new<S: AsRef<str>>(members: &[(S, u32)], rules: LayoutRules) -> Result<Self> {
        let mut placed = Vec::with_capacity(members.len());
        let mut index = HashMap::with_capacity(members.len());
        let mut cursor_bits = 0u64;
        let mut align = 1u64;

        for (name, width) in members {
            let name = name.as_ref();
            let width = *width;
            if width == 0 {
                return Err(JitError::UnsupportedWidth {
                    what: format!("record member `{}`", name),
                    width: 0,
                });
            }
            if index.insert(name.to_string(), placed.len()).is_some() {
                return Err(JitError::InvalidCircuit(format!("duplicate record member `{}`", name)));
            }

            let bit_offset = match rules {
                LayoutRules::Natural => {
                    let (size, member_align) = natural_container(width);
                    let start = round_up(cursor_bits / 8, member_align);
                    cursor_bits = (start + size) * 8;
                    align = align.max(member_align);
                    start * 8
                }
                LayoutRules::Packed => {
                    let start = cursor_bits;
                    cursor_bits += (width as u64).div_ceil(8) * 8;
                    start
                }
                LayoutRules::BitPacked => {
                    let start = cursor_bits;
                    cursor_bits += width as u64;
                    start
                }
            };

            placed.push(AbiMember {
                name: name.to_string(),
                width,
                bit_offset,
                storage_bytes: width.div_ceil(8),
                exclusive: rules != LayoutRules::BitPacked,
            });
        }

        let size = match rules {
            LayoutRules::Natural => round_up(cursor_bits / 8, align),
            _ => cursor_bits.div_ceil(8),
        };

        Ok(Self {
            rules,
            members: placed,
            index,
            size: size as usize,
            align: align as usize,
        })
    }

    pub fn rules(&self) -> LayoutRules {
        self.rules
    }

    pub fn members(&self) -> &[AbiMember] {
        &self.members
    }

    pub fn member(&self, index: usize) -> Option<&AbiMember> {
        self.members.get(index)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Record size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Member addressing by position or by name.
pub trait MemberKey {
    fn resolve(&self, layout: &AbiLayout) -> Result<usize>;
}

impl MemberKey for usize {
    fn resolve(&self, layout: &AbiLayout) -> Result<usize> {
        if *self < layout.len() {
            Ok(*self)
        } else {
            Err(JitError::UnknownMember(format!("#{}", self)))
        }
    }
}

impl MemberKey for &str {
    fn resolve(&self, layout: &AbiLayout) -> Result<usize> {
        layout.position(self).ok_or_else(|| JitError::UnknownMember(self.to_string()))
    }
}

impl MemberKey for String {
    fn resolve(&self, layout: &AbiLayout) -> Result<usize> {
        self.as_str().resolve(layout)
    }
}

/// A record with its backing buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbiStruct {
    layout: AbiLayout,
    data: Vec<u8>,
}

impl AbiStruct {
    /// Zero-initialised record.
    pub fn new(layout: AbiLayout) -> Self {
        let data = vec![0; layout.size()];
        Self { layout, data }
    }

    pub fn with_members<S: AsRef<str>>(members: &[(S, u32)], rules: LayoutRules) -> Result<Self> {
        Ok(Self::new(AbiLayout::new(members, rules)?))
    }

    pub fn layout(&self) -> &AbiLayout {
        &self.layout
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    /// Write `value`, truncated to the member's width.
    pub fn set_member<K: MemberKey>(&mut self, key: K, value: &BigUint) -> Result<()> {
        let member = &self.layout.members[key.resolve(&self.layout)?];
        let bytes = value.to_bytes_le();
        write_bits(&mut self.data, member.bit_offset, member.width, &bytes);
        Ok(())
    }

    pub fn set_u64<K: MemberKey>(&mut self, key: K, value: u64) -> Result<()> {
        let member = &self.layout.members[key.resolve(&self.layout)?];
        write_bits(&mut self.data, member.bit_offset, member.width, &value.to_le_bytes());
        Ok(())
    }

    /// Write little-endian `bytes`, truncated or zero-extended to the member's width.
    pub fn set_bytes<K: MemberKey>(&mut self, key: K, bytes: &[u8]) -> Result<()> {
        let member = &self.layout.members[key.resolve(&self.layout)?];
        write_bits(&mut self.data, member.bit_offset, member.width, bytes);
        Ok(())
    }

    pub fn get_value<K: MemberKey>(&self, key: K) -> Result<BigUint> {
        let member = &self.layout.members[key.resolve(&self.layout)?];
        Ok(BigUint::from_bytes_le(&read_bits(&self.data, member.bit_offset, member.width)))
    }

    /// Low 64 bits of a member.
    pub fn get_u64<K: MemberKey>(&self, key: K) -> Result<u64> {
        let member = &self.layout.members[key.resolve(&self.layout)?];
        let width = member.width.min(64);
        let bytes = read_bits(&self.data, member.bit_offset, width);
        let mut raw = [0u8; 8];
        raw[..bytes.len()].copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(raw))
    }
}

impl fmt::Display for AbiStruct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, member) in self.layout.members.iter().enumerate() {
            let value = BigUint::from_bytes_le(&read_bits(&self.data, member.bit_offset, member.width));
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}[{}] @{} = {}", member.name, member.width, member.bit_offset, value)?;
        }
        Ok(())
    }
}

// ============================================================================
// Bit copying
// ============================================================================

/// Read `width` bits starting at `bit_offset`, little-endian, as
/// `ceil(width / 8)` bytes.
pub fn read_bits(data: &[u8], bit_offset: u64, width: u32) -> Vec<u8> {
    let nbytes = width.div_ceil(8) as usize;
    let start = (bit_offset / 8) as usize;
    let shift = (bit_offset % 8) as u32;
    let mut out = vec![0u8; nbytes];

    if shift == 0 {
        out.copy_from_slice(&data[start..start + nbytes]);
    } else {
        for (i, byte) in out.iter_mut().enumerate() {
            let lo = data.get(start + i).copied().unwrap_or(0) >> shift;
            let hi = data.get(start + i + 1).copied().unwrap_or(0) << (8 - shift);
            *byte = lo | hi;
        }
    }

    let tail = width % 8;
    if tail != 0 {
        out[nbytes - 1] &= (1u8 << tail) - 1;
    }
    out
}

/// Write the low `width` bits of `value` (little-endian bytes, zero-extended
/// when short) at `bit_offset`, leaving the surrounding bits untouched.
pub fn write_bits(data: &mut [u8], bit_offset: u64, width: u32, value: &[u8]) {
    let start = (bit_offset / 8) as usize;
    let shift = (bit_offset % 8) as u32;
    let nbytes = width.div_ceil(8) as usize;

    if shift == 0 && width % 8 == 0 {
        for i in 0..nbytes {
            data[start + i] = value.get(i).copied().unwrap_or(0);
        }
        return;
    }

    for bit in 0..width as usize {
        let src = value.get(bit / 8).map_or(0, |b| (b >> (bit % 8)) & 1);
        let pos = shift as usize + bit;
        let byte = &mut data[start + pos / 8];
        let mask = 1u8 << (pos % 8);
        if src != 0 {
            *byte |= mask;
        } else {
            *byte &= !mask;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn big(value: u128) -> BigUint {
        BigUint::from_bytes_le(&value.to_le_bytes())
    }

    #[test]
    fn test_natural_layout_offsets() {
        let layout = AbiLayout::new(&[("a", 1), ("b", 32), ("c", 3), ("d", 65)], LayoutRules::Natural).unwrap();
        let offsets: Vec<usize> = layout.members().iter().map(|m| m.byte_offset()).collect();
        assert_eq!(offsets, vec![0, 4, 8, 16]);
        assert_eq!(layout.size(), 32);
        assert_eq!(layout.align(), 16);
    }

    #[test]
    fn test_packed_layout_offsets() {
        let layout = AbiLayout::new(&[("a", 1), ("b", 32), ("c", 3)], LayoutRules::Packed).unwrap();
        let offsets: Vec<usize> = layout.members().iter().map(|m| m.byte_offset()).collect();
        assert_eq!(offsets, vec![0, 1, 5]);
        assert_eq!(layout.size(), 6);
    }

    #[test]
    fn test_bit_packed_layout_offsets() {
        let layout = AbiLayout::new(&[("a", 1), ("b", 12), ("c", 3)], LayoutRules::BitPacked).unwrap();
        let offsets: Vec<u64> = layout.members().iter().map(|m| m.bit_offset).collect();
        assert_eq!(offsets, vec![0, 1, 13]);
        assert_eq!(layout.size(), 2);
        assert!(!layout.members()[1].placement().exclusive);
    }

    #[test]
    fn test_layout_is_deterministic() {
        let members = [("x", 7u32), ("y", 130), ("z", 1)];
        for rules in [LayoutRules::Natural, LayoutRules::Packed, LayoutRules::BitPacked] {
            assert_eq!(AbiLayout::new(&members, rules).unwrap(), AbiLayout::new(&members, rules).unwrap());
        }
    }

    #[test]
    fn test_layout_rejects_bad_members() {
        assert!(AbiLayout::new(&[("a", 0)], LayoutRules::Natural).is_err());
        assert!(AbiLayout::new(&[("a", 1), ("a", 2)], LayoutRules::Natural).is_err());
    }

    #[test]
    fn test_set_member_truncates() {
        let mut record = AbiStruct::with_members(&[("a", 4), ("b", 4)], LayoutRules::BitPacked).unwrap();
        record.set_u64("a", 0xff).unwrap();
        assert_eq!(record.get_u64("a").unwrap(), 0xf);
        assert_eq!(record.get_u64("b").unwrap(), 0);
        assert_eq!(record.data(), &[0x0f]);
    }

    #[test]
    fn test_name_and_index_agree() {
        let mut record = AbiStruct::with_members(&[("a", 9), ("b", 23)], LayoutRules::Natural).unwrap();
        record.set_u64("b", 0x12_3456).unwrap();
        assert_eq!(record.get_value(1usize).unwrap(), record.get_value("b").unwrap());
        record.set_u64(0usize, 0x1ff).unwrap();
        assert_eq!(record.get_u64("a").unwrap(), 0x1ff);
        assert!(matches!(record.get_value("c"), Err(JitError::UnknownMember(_))));
        assert!(record.get_value(2usize).is_err());
    }

    #[test]
    fn test_wide_member() {
        let mut record = AbiStruct::with_members(&[("flag", 1), ("wide", 200)], LayoutRules::BitPacked).unwrap();
        let mut bytes = vec![0xa5u8; 25];
        bytes[24] = 0x81;
        let value = BigUint::from_bytes_le(&bytes);
        record.set_member("wide", &value).unwrap();
        record.set_u64("flag", 1).unwrap();
        assert_eq!(record.get_value("wide").unwrap(), value);
        assert_eq!(record.get_value("wide").unwrap().bits(), 200);
        assert_eq!(record.get_u64("flag").unwrap(), 1);
    }

    #[test]
    fn test_display_lists_members() {
        let mut record = AbiStruct::with_members(&[("a", 8)], LayoutRules::Packed).unwrap();
        record.set_u64("a", 42).unwrap();
        assert_eq!(record.to_string(), "a[8] @0 = 42");
    }

    proptest! {
        #[test]
        fn prop_round_trip_single_member(width in 1u32..=128, raw in any::<u128>()) {
            let value = raw & crate::emitter::low_mask(width);
            for rules in [LayoutRules::Natural, LayoutRules::Packed, LayoutRules::BitPacked] {
                let mut record = AbiStruct::with_members(&[("v", width)], rules).unwrap();
                record.set_member("v", &big(value)).unwrap();
                prop_assert_eq!(record.get_value("v").unwrap(), big(value));
            }
        }

        #[test]
        fn prop_neighbours_untouched(lead in 1u32..=16, width in 1u32..=70, raw in any::<u128>()) {
            let mut record = AbiStruct::with_members(&[("lead", lead), ("v", width), ("tail", 5)], LayoutRules::BitPacked).unwrap();
            record.set_u64("lead", u64::MAX).unwrap();
            record.set_u64("tail", 0x1f).unwrap();
            record.set_member("v", &big(raw)).unwrap();
            prop_assert_eq!(record.get_value("v").unwrap(), big(raw & crate::emitter::low_mask(width)));
            prop_assert_eq!(record.get_u64("lead").unwrap(), (1u64 << lead) - 1);
            prop_assert_eq!(record.get_u64("tail").unwrap(), 0x1f);
        }
    }
}
