//! Declarative attribute decoding and a small message builder.
//!
//! Each message family declares a table mapping attribute ids to the value
//! kind it expects. Unknown ids are skipped, a kind mismatch fails the whole
//! message. This keeps every decoder a data declaration plus a few typed
//! getters instead of a pile of hand-written match arms.

use netlink_packet_utils::DecodeError;
use netlink_packet_utils::nla::NlasIterator;
use netlink_packet_utils::parsers::{parse_u8, parse_u16, parse_u16_be, parse_u32};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttrKind {
    U8,
    U16,
    U32,
    Binary,
    NulString,
    Nested,
}

#[derive(Clone, Copy, Debug)]
pub struct AttrSpec {
    pub id: u16,
    pub kind: AttrKind,
    pub name: &'static str,
}

/// Shorthand for table entries.
pub const fn spec(id: u16, kind: AttrKind, name: &'static str) -> AttrSpec {
    AttrSpec { id, kind, name }
}

fn validate(kind: AttrKind, name: &str, value: &[u8]) -> Result<(), DecodeError> {
    let ok = match kind {
        AttrKind::U8 => value.len() == 1,
        AttrKind::U16 => value.len() == 2,
        AttrKind::U32 => value.len() == 4,
        AttrKind::NulString => value.last() == Some(&0),
        AttrKind::Binary | AttrKind::Nested => true,
    };
    if ok {
        Ok(())
    } else {
        Err(DecodeError::from(format!(
            "attribute {name}: invalid payload length {} for {kind:?}",
            value.len()
        )))
    }
}

/// The decoded slots of one attribute run, indexed by attribute id.
pub struct AttrSet<'a> {
    slots: Vec<Option<&'a [u8]>>,
}

impl<'a> AttrSet<'a> {
    /// Walk the TLV run in `payload` against `schema`. Ids above the highest
    /// schema id or absent from the schema are skipped in user space.
    pub fn parse(payload: &'a [u8], schema: &[AttrSpec]) -> Result<AttrSet<'a>, DecodeError> {
        let max = schema.iter().map(|s| s.id).max().unwrap_or(0);
        let mut slots = vec![None; usize::from(max) + 1];

        for nla in NlasIterator::new(payload) {
            let nla = nla?;
            let id = nla.kind();
            if usize::from(id) >= slots.len() {
                continue;
            }
            let value_len = nla.value_length();
            let buf = nla.into_inner();
            let value = &buf[NLA_HDR_LEN..NLA_HDR_LEN + value_len];
            match schema.iter().find(|s| s.id == id) {
                Some(s) => {
                    validate(s.kind, s.name, value)?;
                    slots[usize::from(id)] = Some(value);
                }
                None => tracing::trace!(id, "skipping unknown attribute"),
            }
        }

        Ok(AttrSet { slots })
    }

    pub fn get(&self, id: u16) -> Option<&'a [u8]> {
        self.slots.get(usize::from(id)).copied().flatten()
    }

    pub fn get_u8(&self, id: u16) -> Option<u8> {
        self.get(id).and_then(|v| parse_u8(v).ok())
    }

    pub fn get_u16(&self, id: u16) -> Option<u16> {
        self.get(id).and_then(|v| parse_u16(v).ok())
    }

    pub fn get_u16_be(&self, id: u16) -> Option<u16> {
        self.get(id).and_then(|v| parse_u16_be(v).ok())
    }

    pub fn get_u32(&self, id: u16) -> Option<u32> {
        self.get(id).and_then(|v| parse_u32(v).ok())
    }

    pub fn get_string(&self, id: u16) -> Option<String> {
        self.get(id).map(|v| {
            let end = v.iter().position(|&b| b == 0).unwrap_or(v.len());
            String::from_utf8_lossy(&v[..end]).into_owned()
        })
    }

    pub fn get_mac(&self, id: u16) -> Option<[u8; 6]> {
        self.get(id).and_then(|v| v.get(..6)).map(|v| {
            let mut mac = [0u8; 6];
            mac.copy_from_slice(v);
            mac
        })
    }
}

const NLA_HDR_LEN: usize = 4;
const NLA_F_NESTED: u16 = 1 << 15;

fn align(len: usize) -> usize {
    (len + 3) & !3
}

/// Append-only netlink message builder: fixed header structs, flat
/// attributes and nested runs, with the nest length patched on close.
#[derive(Default)]
pub struct MsgBuilder {
    buf: Vec<u8>,
}

impl MsgBuilder {
    pub fn new() -> MsgBuilder {
        MsgBuilder::default()
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn attr(&mut self, id: u16, value: &[u8]) -> &mut Self {
        let len = NLA_HDR_LEN + value.len();
        self.buf.extend_from_slice(&(len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&id.to_ne_bytes());
        self.buf.extend_from_slice(value);
        self.buf.resize(align(self.buf.len()), 0);
        self
    }

    pub fn attr_u8(&mut self, id: u16, value: u8) -> &mut Self {
        self.attr(id, &[value])
    }

    pub fn attr_u16(&mut self, id: u16, value: u16) -> &mut Self {
        self.attr(id, &value.to_ne_bytes())
    }

    pub fn attr_u16_be(&mut self, id: u16, value: u16) -> &mut Self {
        self.attr(id, &value.to_be_bytes())
    }

    pub fn attr_u32(&mut self, id: u16, value: u32) -> &mut Self {
        self.attr(id, &value.to_ne_bytes())
    }

    pub fn attr_str(&mut self, id: u16, value: &str) -> &mut Self {
        let mut v = Vec::with_capacity(value.len() + 1);
        v.extend_from_slice(value.as_bytes());
        v.push(0);
        self.attr(id, &v)
    }

    /// Open a nested attribute; returns the offset to pass to `nest_end`.
    pub fn nest_start(&mut self, id: u16) -> usize {
        let start = self.buf.len();
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        self.buf.extend_from_slice(&(id | NLA_F_NESTED).to_ne_bytes());
        start
    }

    pub fn nest_end(&mut self, start: usize) -> &mut Self {
        let len = (self.buf.len() - start) as u16;
        self.buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Bounds-checked native-endian field reads for the fixed structs that lead
/// rtnetlink payloads.
pub fn read_u8(payload: &[u8], off: usize) -> Result<u8, DecodeError> {
    payload
        .get(off)
        .copied()
        .ok_or_else(|| DecodeError::from("truncated fixed header"))
}

pub fn read_u16_ne(payload: &[u8], off: usize) -> Result<u16, DecodeError> {
    payload
        .get(off..off + 2)
        .map(|v| u16::from_ne_bytes(v.try_into().expect("sliced to width")))
        .ok_or_else(|| DecodeError::from("truncated fixed header"))
}

pub fn read_u32_ne(payload: &[u8], off: usize) -> Result<u32, DecodeError> {
    payload
        .get(off..off + 4)
        .map(|v| u32::from_ne_bytes(v.try_into().expect("sliced to width")))
        .ok_or_else(|| DecodeError::from("truncated fixed header"))
}

pub fn read_i32_ne(payload: &[u8], off: usize) -> Result<i32, DecodeError> {
    read_u32_ne(payload, off).map(|v| v as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &[AttrSpec] = &[
        spec(1, AttrKind::U32, "ONE"),
        spec(2, AttrKind::NulString, "TWO"),
        spec(4, AttrKind::Nested, "FOUR"),
    ];

    #[test]
    fn build_and_parse() -> anyhow::Result<()> {
        let mut b = MsgBuilder::new();
        b.attr_u32(1, 0xdead_beef).attr_str(2, "flower");
        let nest = b.nest_start(4);
        b.attr_u16(7, 7);
        b.nest_end(nest);
        let bytes = b.into_bytes();

        let set = AttrSet::parse(&bytes, TABLE)?;
        assert_eq!(set.get_u32(1), Some(0xdead_beef));
        assert_eq!(set.get_string(2).as_deref(), Some("flower"));
        assert!(set.get(4).is_some());
        assert_eq!(set.get(3), None);
        Ok(())
    }

    #[test]
    fn unknown_attributes_are_skipped() -> anyhow::Result<()> {
        let mut b = MsgBuilder::new();
        // id 3 is not in the table, id 9 is beyond its maximum
        b.attr_u32(3, 1).attr_u32(9, 2).attr_u32(1, 3);
        let bytes = b.into_bytes();
        let set = AttrSet::parse(&bytes, TABLE)?;
        assert_eq!(set.get_u32(1), Some(3));
        assert_eq!(set.get(3), None);
        Ok(())
    }

    #[test]
    fn kind_mismatch_is_an_error() {
        let mut b = MsgBuilder::new();
        b.attr_u16(1, 5); // table says U32
        assert!(AttrSet::parse(&b.into_bytes(), TABLE).is_err());
    }

    #[test]
    fn nul_string_must_be_terminated() {
        let mut b = MsgBuilder::new();
        b.attr(2, b"flower"); // no trailing NUL
        assert!(AttrSet::parse(&b.into_bytes(), TABLE).is_err());
    }

    #[test]
    fn attributes_are_padded_to_alignment() {
        let mut b = MsgBuilder::new();
        b.attr(1, &[1, 2, 3, 4]).attr_u8(2, 1);
        assert_eq!(b.len() % 4, 0);
    }
}
