//! The concise (binary) DCF form: a 32-bit record count followed by
//! `(index: u16, sub-index: u8, size: u32, value bytes)` records, all
//! little-endian. Used for bulk SDO download (object 0x1F22).
//! (Reference: CiA 302-3)

use alloc::vec::Vec;
use canopen_rs::od::{ObjectDictionary, SubFlags};

/// Builds a concise DCF stream from every sub-object whose parameter value
/// was set by the configuration file (the `PARAMETER_VALUE` flag), in
/// dictionary order.
pub fn concise_dcf(od: &ObjectDictionary) -> Vec<u8> {
    let mut records = 0u32;
    let mut body = Vec::new();
    for object in od.objects() {
        for sub in object.subs() {
            if !sub.sub_flags().contains(SubFlags::PARAMETER_VALUE) {
                continue;
            }
            let bytes = sub.value().to_bytes();
            body.extend_from_slice(&object.index().to_le_bytes());
            body.push(sub.sub_index());
            body.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            body.extend_from_slice(&bytes);
            records += 1;
        }
    }
    let mut stream = Vec::with_capacity(4 + body.len());
    stream.extend_from_slice(&records.to_le_bytes());
    stream.extend_from_slice(&body);
    stream
}

/// Walks a concise DCF stream, yielding its records. Returns `None` when the
/// stream is truncated or the count disagrees with the contents.
pub fn parse_concise_dcf(stream: &[u8]) -> Option<Vec<(u16, u8, Vec<u8>)>> {
    let count = u32::from_le_bytes(stream.get(0..4)?.try_into().ok()?);
    let mut records = Vec::with_capacity(count as usize);
    let mut pos = 4usize;
    for _ in 0..count {
        let head = stream.get(pos..pos + 7)?;
        let index = u16::from_le_bytes([head[0], head[1]]);
        let sub_index = head[2];
        let size = u32::from_le_bytes(head[3..7].try_into().ok()?) as usize;
        let data = stream.get(pos + 7..pos + 7 + size)?.to_vec();
        records.push((index, sub_index, data));
        pos += 7 + size;
    }
    (pos == stream.len()).then_some(records)
}
