//! The PDO engine: mapping of dictionary entries into process data frames,
//! reception into the dictionary and transmission per the CiA 301
//! transmission-type rules.

mod rpdo;
mod tpdo;

pub use rpdo::Rpdo;
pub use tpdo::Tpdo;

use crate::od::ObjectDictionary;
use crate::sdo::SdoAbort;
use crate::value::Value;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

/// Number of pre-defined PDO channels per direction.
pub const PDO_COUNT: usize = 4;

/// Bit 31 of a PDO COB-ID entry: the PDO is not valid.
pub const COB_PDO_INVALID: u32 = 1 << 31;
/// Bit 30 of a PDO COB-ID entry: RTR is not allowed on this PDO.
pub const COB_PDO_NO_RTR: u32 = 1 << 30;

/// Maximum payload of a classic-frame PDO, in bits.
const PDO_MAX_BITS: usize = 64;

/// Errors reported by the PDO engine to the user's PDO-error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdoError {
    /// The received payload is shorter than the summed mapping length.
    LengthMismatch { expected_bits: usize, got_bits: usize },
    /// A mapped object is missing or refused access.
    MappingError { index: u16, sub_index: u8 },
    /// No PDO arrived within the deadline (event-timer) period.
    Deadline,
}

impl fmt::Display for PdoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PdoError::LengthMismatch {
                expected_bits,
                got_bits,
            } => write!(
                f,
                "PDO length mismatch: mapping needs {} bits, frame carries {}",
                expected_bits, got_bits
            ),
            PdoError::MappingError { index, sub_index } => {
                write!(f, "PDO mapping error at {:#06X}:{:02X}", index, sub_index)
            }
            PdoError::Deadline => write!(f, "PDO deadline elapsed"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for PdoError {}

/// A single PDO mapping entry, packed as a 32-bit value in the mapping
/// parameter objects. (Reference: CiA 301, Section 7.5.2.36)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdoMapEntry {
    /// Dictionary index of the mapped object.
    pub index: u16,
    /// Dictionary sub-index of the mapped object.
    pub sub_index: u8,
    /// Length of the mapped object in bits.
    pub bits: u8,
}

impl PdoMapEntry {
    /// Deserializes an UNSIGNED32 mapping value.
    pub fn from_u32(value: u32) -> Self {
        Self {
            index: (value >> 16) as u16,
            sub_index: (value >> 8) as u8,
            bits: value as u8,
        }
    }

    /// Serializes the entry into its UNSIGNED32 representation.
    pub fn to_u32(&self) -> u32 {
        (u32::from(self.index) << 16) | (u32::from(self.sub_index) << 8) | u32::from(self.bits)
    }
}

/// The mapping table of one PDO, read from object 0x1600+n or 0x1A00+n.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PdoMapping {
    entries: Vec<PdoMapEntry>,
}

impl PdoMapping {
    pub fn new(entries: Vec<PdoMapEntry>) -> Self {
        Self { entries }
    }

    /// Reads the active mapping from the dictionary. Entries beyond the
    /// count in sub-index 0 are ignored.
    pub fn read_from(od: &ObjectDictionary, map_index: u16) -> Self {
        let count = od.read_u8(map_index, 0).unwrap_or(0);
        let mut entries = Vec::new();
        for sub in 1..=count {
            let Some(raw) = od.read_u32(map_index, sub) else {
                break;
            };
            let entry = PdoMapEntry::from_u32(raw);
            if entry.bits == 0 {
                break;
            }
            entries.push(entry);
        }
        Self { entries }
    }

    pub fn entries(&self) -> &[PdoMapEntry] {
        &self.entries
    }

    /// Total mapped length in bits.
    pub fn bit_len(&self) -> usize {
        self.entries.iter().map(|e| usize::from(e.bits)).sum()
    }

    /// Total mapped length in bytes, rounded up.
    pub fn byte_len(&self) -> usize {
        self.bit_len().div_ceil(8)
    }

    /// Packs the mapped dictionary values into a payload, little-endian bit
    /// order.
    pub fn encode(&self, od: &ObjectDictionary) -> Result<Vec<u8>, PdoError> {
        let mut payload = vec![0u8; self.byte_len()];
        let mut offset = 0usize;
        for entry in &self.entries {
            let value = od.read(entry.index, entry.sub_index).map_err(|_| {
                PdoError::MappingError {
                    index: entry.index,
                    sub_index: entry.sub_index,
                }
            })?;
            let bytes = value.to_bytes();
            let raw = le_bytes_to_u64(&bytes);
            insert_bits(&mut payload, offset, usize::from(entry.bits), raw);
            offset += usize::from(entry.bits);
        }
        Ok(payload)
    }

    /// Unpacks a received payload into the mapped dictionary entries,
    /// routing each value through the dictionary's download path. Returns
    /// the entries written.
    pub fn decode_into(
        &self,
        od: &mut ObjectDictionary,
        payload: &[u8],
    ) -> Result<Vec<(u16, u8)>, PdoError> {
        let expected = self.bit_len();
        if payload.len() * 8 < expected {
            return Err(PdoError::LengthMismatch {
                expected_bits: expected,
                got_bits: payload.len() * 8,
            });
        }
        let mut offset = 0usize;
        let mut written = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let bits = usize::from(entry.bits);
            let raw = extract_bits(payload, offset, bits);
            offset += bits;
            let byte_len = bits.div_ceil(8);
            let bytes = &raw.to_le_bytes()[..byte_len];
            od.download(entry.index, entry.sub_index, bytes)
                .map_err(|_| PdoError::MappingError {
                    index: entry.index,
                    sub_index: entry.sub_index,
                })?;
            written.push((entry.index, entry.sub_index));
        }
        Ok(written)
    }
}

/// Extracts `bit_len` bits starting at `bit_offset`, LSB first, as mandated
/// by CiA 301 for PDO payloads.
pub fn extract_bits(data: &[u8], bit_offset: usize, bit_len: usize) -> u64 {
    debug_assert!(bit_len <= 64);
    let mut value = 0u64;
    for i in 0..bit_len {
        let bit = bit_offset + i;
        let byte = bit / 8;
        if byte >= data.len() {
            break;
        }
        if data[byte] & (1 << (bit % 8)) != 0 {
            value |= 1 << i;
        }
    }
    value
}

/// Inserts `bit_len` bits of `value` starting at `bit_offset`, LSB first.
pub fn insert_bits(data: &mut [u8], bit_offset: usize, bit_len: usize, value: u64) {
    debug_assert!(bit_len <= 64);
    for i in 0..bit_len {
        let bit = bit_offset + i;
        let byte = bit / 8;
        if byte >= data.len() {
            break;
        }
        if value & (1 << i) != 0 {
            data[byte] |= 1 << (bit % 8);
        } else {
            data[byte] &= !(1 << (bit % 8));
        }
    }
}

fn le_bytes_to_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(buf)
}

/// Download guard for the PDO communication and mapping parameter objects,
/// installed on the dictionary by the node.
///
/// Enforces that activating a mapping (writing a non-zero count to
/// sub-index 0 of 0x1600..0x17FF / 0x1A00..0x1BFF) does not exceed the
/// classic-frame payload, that every activated entry names a mappable
/// dictionary object, and that mapping entries are only rewritten while the
/// mapping is deactivated.
pub fn mapping_write_guard(
    od: &ObjectDictionary,
    index: u16,
    sub_index: u8,
    value: &Value,
) -> Result<(), SdoAbort> {
    let is_mapping =
        (0x1600..=0x17FF).contains(&index) || (0x1A00..=0x1BFF).contains(&index);
    if !is_mapping {
        return Ok(());
    }
    if sub_index == 0 {
        let Value::Unsigned8(count) = value else {
            return Err(SdoAbort::TypeLengthMismatch);
        };
        let mut total_bits = 0usize;
        for sub in 1..=*count {
            let raw = od
                .read_u32(index, sub)
                .ok_or(SdoAbort::IncompatibleParameter)?;
            let entry = PdoMapEntry::from_u32(raw);
            let mapped = od
                .sub(entry.index, entry.sub_index)
                .map_err(|_| SdoAbort::PdoMappingError)?;
            if !mapped.is_pdo_mapped() {
                return Err(SdoAbort::PdoMappingError);
            }
            total_bits += usize::from(entry.bits);
        }
        if total_bits > PDO_MAX_BITS {
            return Err(SdoAbort::PdoLengthExceeded);
        }
        Ok(())
    } else {
        // Mapping entries may only change while the mapping is deactivated.
        match od.read_u8(index, 0) {
            Some(0) | None => Ok(()),
            Some(_) => Err(SdoAbort::DeviceState),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::od::{Object, SubObject};

    fn mapped_od() -> ObjectDictionary {
        let mut od = ObjectDictionary::new();
        od.insert(Object::var(
            0x6000,
            "Input byte",
            SubObject::new(0, "Input byte", Value::Unsigned8(0xAB)).pdo_mappable(),
        ));
        od.insert(Object::var(
            0x6001,
            "Input word",
            SubObject::new(0, "Input word", Value::Unsigned32(0x1122_3344)).pdo_mappable(),
        ));
        od.insert(Object::var(
            0x6002,
            "Input flag",
            SubObject::new(0, "Input flag", Value::Boolean(true)).pdo_mappable(),
        ));
        od
    }

    #[test]
    fn test_map_entry_roundtrip() {
        let entry = PdoMapEntry {
            index: 0x6000,
            sub_index: 0x01,
            bits: 16,
        };
        assert_eq!(entry.to_u32(), 0x6000_0110);
        assert_eq!(PdoMapEntry::from_u32(0x6000_0110), entry);
    }

    #[test]
    fn test_encode_packs_little_endian() {
        let od = mapped_od();
        let mapping = PdoMapping::new(alloc::vec![
            PdoMapEntry {
                index: 0x6000,
                sub_index: 0,
                bits: 8
            },
            PdoMapEntry {
                index: 0x6001,
                sub_index: 0,
                bits: 32
            },
        ]);
        let payload = mapping.encode(&od).unwrap();
        assert_eq!(payload, alloc::vec![0xAB, 0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    fn test_mapping_roundtrip_preserves_values() {
        let mut od = mapped_od();
        let mapping = PdoMapping::new(alloc::vec![
            PdoMapEntry {
                index: 0x6002,
                sub_index: 0,
                bits: 1
            },
            PdoMapEntry {
                index: 0x6000,
                sub_index: 0,
                bits: 8
            },
            PdoMapEntry {
                index: 0x6001,
                sub_index: 0,
                bits: 32
            },
        ]);
        let payload = mapping.encode(&od).unwrap();
        assert_eq!(payload.len(), mapping.byte_len());
        // Wipe the values, then decode the payload back.
        od.write(0x6002, 0, Value::Boolean(false)).unwrap();
        od.write(0x6000, 0, Value::Unsigned8(0)).unwrap();
        od.write(0x6001, 0, Value::Unsigned32(0)).unwrap();
        mapping.decode_into(&mut od, &payload).unwrap();
        assert_eq!(od.read(0x6002, 0).unwrap(), &Value::Boolean(true));
        assert_eq!(od.read_u8(0x6000, 0), Some(0xAB));
        assert_eq!(od.read_u32(0x6001, 0), Some(0x1122_3344));
    }

    #[test]
    fn test_short_payload_rejected() {
        let mut od = mapped_od();
        let mapping = PdoMapping::new(alloc::vec![PdoMapEntry {
            index: 0x6001,
            sub_index: 0,
            bits: 32
        }]);
        let result = mapping.decode_into(&mut od, &[0x01, 0x02]);
        assert!(matches!(result, Err(PdoError::LengthMismatch { .. })));
    }

    #[test]
    fn test_bit_helpers() {
        let mut buf = [0u8; 2];
        insert_bits(&mut buf, 3, 5, 0b10110);
        insert_bits(&mut buf, 8, 8, 0xFF);
        assert_eq!(extract_bits(&buf, 3, 5), 0b10110);
        assert_eq!(extract_bits(&buf, 8, 8), 0xFF);
        assert_eq!(extract_bits(&buf, 0, 3), 0);
    }

    #[test]
    fn test_mapping_guard_rejects_overlong_mapping() {
        let mut od = mapped_od();
        let mut map = Object::array(0x1A00, "TPDO mapping parameter");
        // Nine 8-bit entries: 72 bits > 64.
        for sub in 1..=9u8 {
            map.insert_sub(SubObject::new(
                sub,
                "Mapping entry",
                Value::Unsigned32(
                    PdoMapEntry {
                        index: 0x6000,
                        sub_index: 0,
                        bits: 8,
                    }
                    .to_u32(),
                ),
            ));
        }
        if let Some(zero) = map.sub_mut(0) {
            zero.set_value_silent(Value::Unsigned8(0));
        }
        od.insert(map);
        assert_eq!(
            mapping_write_guard(&od, 0x1A00, 0, &Value::Unsigned8(8)),
            Ok(())
        );
        assert_eq!(
            mapping_write_guard(&od, 0x1A00, 0, &Value::Unsigned8(9)),
            Err(SdoAbort::PdoLengthExceeded)
        );
    }

    #[test]
    fn test_mapping_guard_rejects_unmappable_object() {
        let mut od = mapped_od();
        od.insert(Object::var(
            0x6100,
            "Unmappable",
            SubObject::new(0, "Unmappable", Value::Unsigned8(0)),
        ));
        let mut map = Object::array(0x1A01, "TPDO mapping parameter");
        map.insert_sub(SubObject::new(
            1,
            "Mapping entry",
            Value::Unsigned32(
                PdoMapEntry {
                    index: 0x6100,
                    sub_index: 0,
                    bits: 8,
                }
                .to_u32(),
            ),
        ));
        if let Some(zero) = map.sub_mut(0) {
            zero.set_value_silent(Value::Unsigned8(0));
        }
        od.insert(map);
        assert_eq!(
            mapping_write_guard(&od, 0x1A01, 0, &Value::Unsigned8(1)),
            Err(SdoAbort::PdoMappingError)
        );
    }

    #[test]
    fn test_mapping_guard_locks_active_mapping() {
        let mut od = mapped_od();
        let mut map = Object::array(0x1600, "RPDO mapping parameter");
        map.insert_sub(SubObject::new(1, "Mapping entry", Value::Unsigned32(0)));
        if let Some(zero) = map.sub_mut(0) {
            zero.set_value_silent(Value::Unsigned8(1));
        }
        od.insert(map);
        assert_eq!(
            mapping_write_guard(&od, 0x1600, 1, &Value::Unsigned32(0x6000_0008)),
            Err(SdoAbort::DeviceState)
        );
    }
}
