//! Parser for CANopen Electronic Data Sheets (EDS) and Device Configuration
//! Files (DCF), producing a populated [`ObjectDictionary`], plus helpers for
//! the concise (binary) DCF form.
//! (Reference: CiA 306)
//!
//! The textual format is INI-like: one section per object (`[1000]`) and
//! per sub-object (`[1018sub1]`), with `ParameterName`, `ObjectType`,
//! `DataType`, `AccessType`, `DefaultValue`, `LowLimit`, `HighLimit` and
//! `PDOMapping` keys. DCF files additionally carry `ParameterValue` and a
//! `[DeviceComissioning]` section. Values may be declared relative to the
//! node-ID as `$NODEID+<offset>`.

#![no_std]

extern crate alloc;

mod concise;

pub use concise::{concise_dcf, parse_concise_dcf};

use alloc::borrow::ToOwned;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use canopen_rs::od::{AccessType, Object, ObjectDictionary, SubFlags, SubObject};
use canopen_rs::value::{DataType, Value};
use canopen_rs::NodeId;
use core::fmt;
use ini_core as ini;
use log::warn;

/// Errors raised while loading an EDS/DCF file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdsError {
    /// A section name is not a valid object or sub-object address.
    InvalidSection(String),
    /// A numeric property could not be parsed.
    InvalidNumber { section: String, key: &'static str },
    /// The `DataType` property names an unknown type.
    InvalidDataType { section: String, value: u16 },
    /// The `AccessType` property is unknown.
    InvalidAccessType { section: String },
    /// A sub-object section appeared before its object section.
    OrphanSubObject { section: String },
}

impl fmt::Display for EdsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdsError::InvalidSection(s) => write!(f, "invalid section [{}]", s),
            EdsError::InvalidNumber { section, key } => {
                write!(f, "invalid number for {} in [{}]", key, section)
            }
            EdsError::InvalidDataType { section, value } => {
                write!(f, "unknown data type {:#06X} in [{}]", value, section)
            }
            EdsError::InvalidAccessType { section } => {
                write!(f, "unknown access type in [{}]", section)
            }
            EdsError::OrphanSubObject { section } => {
                write!(f, "sub-object section [{}] without object section", section)
            }
        }
    }
}

/// Parses an EDS or DCF text into an object dictionary.
///
/// `$NODEID`-relative declarations are recorded with their offsets; the
/// dictionary re-derives the effective values when the node-ID is applied.
pub fn parse_eds(content: &str) -> Result<ObjectDictionary, EdsError> {
    let mut od = ObjectDictionary::new();
    let mut current: Option<(String, BTreeMap<String, String>)> = None;

    for item in ini::Parser::new(content) {
        match item {
            ini::Item::Section(name) => {
                if let Some((section, properties)) = current.take() {
                    process_section(&mut od, &section, &properties)?;
                }
                current = Some((name.trim().to_owned(), BTreeMap::new()));
            }
            ini::Item::Property(key, value) => {
                if let Some((_, properties)) = &mut current {
                    properties.insert(
                        key.trim().to_owned(),
                        value.unwrap_or_default().trim().to_owned(),
                    );
                }
            }
            _ => {}
        }
    }
    if let Some((section, properties)) = current {
        process_section(&mut od, &section, &properties)?;
    }
    Ok(od)
}

/// Parses a DCF: like [`parse_eds`], but also applies the node-ID from the
/// `[DeviceComissioning]` section when present.
pub fn parse_dcf(content: &str) -> Result<(ObjectDictionary, Option<NodeId>), EdsError> {
    let mut od = parse_eds(content)?;
    let mut node_id = None;
    // Scan for the NodeID property of the commissioning section.
    let mut in_commissioning = false;
    for item in ini::Parser::new(content) {
        match item {
            ini::Item::Section(name) => {
                in_commissioning = name.trim().eq_ignore_ascii_case("DeviceComissioning");
            }
            ini::Item::Property(key, value) if in_commissioning => {
                if key.trim().eq_ignore_ascii_case("NodeID") {
                    if let Some(raw) = value.and_then(|v| parse_number(v.trim())) {
                        if let Ok(id) = NodeId::try_from(raw as u8) {
                            od.set_node_id(id);
                            node_id = Some(id);
                        }
                    }
                }
            }
            _ => {}
        }
    }
    Ok((od, node_id))
}

/// The address a section names: an object or one of its sub-objects.
enum SectionKind {
    Object(u16),
    SubObject(u16, u8),
    Other,
}

fn classify_section(name: &str) -> SectionKind {
    fn hex16(s: &str) -> Option<u16> {
        (s.len() == 4 && s.chars().all(|c| c.is_ascii_hexdigit()))
            .then(|| u16::from_str_radix(s, 16).ok())
            .flatten()
    }
    if let Some(index) = hex16(name) {
        return SectionKind::Object(index);
    }
    if name.len() > 7 && name[4..7].eq_ignore_ascii_case("sub") {
        if let Some(index) = hex16(&name[..4]) {
            if let Ok(sub) = u8::from_str_radix(&name[7..], 16) {
                return SectionKind::SubObject(index, sub);
            }
        }
    }
    SectionKind::Other
}

fn process_section(
    od: &mut ObjectDictionary,
    section: &str,
    properties: &BTreeMap<String, String>,
) -> Result<(), EdsError> {
    match classify_section(section) {
        SectionKind::Object(index) => {
            let name = properties
                .get("ParameterName")
                .map(String::as_str)
                .unwrap_or("");
            let object_type = properties
                .get("ObjectType")
                .and_then(|v| parse_number(v))
                .unwrap_or(0x07);
            match object_type {
                // The EDS provides explicit `sub` sections, including
                // sub-index 0, which replace the builder's seed.
                0x08 => od.insert(Object::array(index, name)),
                0x09 => od.insert(Object::record(index, name)),
                // VAR (and DOMAIN etc.): the section itself describes
                // sub-index 0.
                _ => {
                    let sub = build_sub(0, section, properties)?;
                    od.insert(Object::var(index, name, sub));
                }
            }
            Ok(())
        }
        SectionKind::SubObject(index, sub_index) => {
            let sub = build_sub(sub_index, section, properties)?;
            match od.object_mut(index) {
                Ok(object) => {
                    object.insert_sub(sub);
                    Ok(())
                }
                Err(_) => Err(EdsError::OrphanSubObject {
                    section: section.to_owned(),
                }),
            }
        }
        SectionKind::Other => Ok(()),
    }
}

fn build_sub(
    sub_index: u8,
    section: &str,
    properties: &BTreeMap<String, String>,
) -> Result<SubObject, EdsError> {
    let name = properties
        .get("ParameterName")
        .map(String::as_str)
        .unwrap_or("");
    let raw_type = properties
        .get("DataType")
        .and_then(|v| parse_number(v))
        .unwrap_or(0x05) as u16;
    let data_type =
        DataType::try_from(raw_type).map_err(|_| EdsError::InvalidDataType {
            section: section.to_owned(),
            value: raw_type,
        })?;

    let mut flags = SubFlags::empty();
    // A DCF ParameterValue overrides the EDS DefaultValue.
    let (value_text, has_parameter_value) = match properties.get("ParameterValue") {
        Some(v) => (Some(v.as_str()), true),
        None => (properties.get("DefaultValue").map(String::as_str), false),
    };
    if has_parameter_value {
        flags.insert(SubFlags::PARAMETER_VALUE);
    }
    let (value, value_relative) = match value_text {
        Some(text) => parse_value(data_type, text, section, "DefaultValue")?,
        None => (Value::zero(data_type), false),
    };
    if value_relative {
        flags.insert(SubFlags::VAL_NODEID);
    }

    let mut sub = SubObject::new(sub_index, name, value);
    if let Some(text) = properties.get("LowLimit") {
        let (min, relative) = parse_value(data_type, text, section, "LowLimit")?;
        if relative {
            flags.insert(SubFlags::MIN_NODEID);
        }
        sub = sub.limits_min(min);
    }
    if let Some(text) = properties.get("HighLimit") {
        let (max, relative) = parse_value(data_type, text, section, "HighLimit")?;
        if relative {
            flags.insert(SubFlags::MAX_NODEID);
        }
        sub = sub.limits_max(max);
    }
    let access = match properties
        .get("AccessType")
        .map(String::as_str)
        .unwrap_or("rw")
        .to_ascii_lowercase()
        .as_str()
    {
        "ro" => AccessType::ReadOnly,
        "wo" => AccessType::WriteOnly,
        "rw" => AccessType::ReadWrite,
        "rwr" => AccessType::ReadWriteInput,
        "rww" => AccessType::ReadWriteOutput,
        "const" => AccessType::Constant,
        _ => {
            return Err(EdsError::InvalidAccessType {
                section: section.to_owned(),
            });
        }
    };
    sub = sub.access(access);
    if properties
        .get("PDOMapping")
        .and_then(|v| parse_number(v))
        .unwrap_or(0)
        != 0
    {
        sub = sub.pdo_mappable();
    }
    Ok(sub.with_flags(flags))
}

/// Parses a value literal, handling the `$NODEID+` prefix. Returns the value
/// (the raw offset for node-ID-relative declarations) and the relativity.
fn parse_value(
    data_type: DataType,
    text: &str,
    section: &str,
    key: &'static str,
) -> Result<(Value, bool), EdsError> {
    let trimmed = text.trim();
    let (literal, relative) = match trimmed
        .to_ascii_uppercase()
        .strip_prefix("$NODEID+")
    {
        Some(_) => (trimmed[8..].trim(), true),
        None => (trimmed, false),
    };
    let value = match data_type {
        DataType::VisibleString => Value::VisibleString(literal.to_owned()),
        DataType::OctetString => Value::OctetString(parse_octets(literal)),
        DataType::Domain => Value::Domain(Vec::new()),
        _ => {
            let number = parse_number(literal).ok_or(EdsError::InvalidNumber {
                section: section.to_owned(),
                key,
            })?;
            numeric_value(data_type, number).ok_or(EdsError::InvalidNumber {
                section: section.to_owned(),
                key,
            })?
        }
    };
    Ok((value, relative))
}

/// Parses `0x`-prefixed hex, `0`-prefixed octal or decimal numbers, as EDS
/// files mix all three.
pub fn parse_number(text: &str) -> Option<i64> {
    let text = text.trim();
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let magnitude = if let Some(hex) = digits.strip_prefix("0x").or(digits.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()?
    } else if digits.len() > 1 && digits.starts_with('0') {
        i64::from_str_radix(&digits[1..], 8).ok()?
    } else {
        digits.parse::<i64>().ok()?
    };
    Some(if negative { -magnitude } else { magnitude })
}

fn parse_octets(text: &str) -> Vec<u8> {
    let clean: String = text.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    clean
        .as_bytes()
        .chunks(2)
        .filter_map(|pair| {
            let s = core::str::from_utf8(pair).ok()?;
            u8::from_str_radix(s, 16).ok()
        })
        .collect()
}

fn numeric_value(data_type: DataType, number: i64) -> Option<Value> {
    use DataType as T;
    Some(match data_type {
        T::Boolean => Value::Boolean(number != 0),
        T::Integer8 => Value::Integer8(i8::try_from(number).ok()?),
        T::Integer16 => Value::Integer16(i16::try_from(number).ok()?),
        T::Integer24 => Value::Integer24(i32::try_from(number).ok()?),
        T::Integer32 => Value::Integer32(i32::try_from(number).ok()?),
        T::Integer40 => Value::Integer40(number),
        T::Integer48 => Value::Integer48(number),
        T::Integer56 => Value::Integer56(number),
        T::Integer64 => Value::Integer64(number),
        T::Unsigned8 => Value::Unsigned8(u8::try_from(number).ok()?),
        T::Unsigned16 => Value::Unsigned16(u16::try_from(number).ok()?),
        T::Unsigned24 => Value::Unsigned24(u32::try_from(number).ok()?),
        T::Unsigned32 => Value::Unsigned32(u32::try_from(number).ok()?),
        T::Unsigned40 => Value::Unsigned40(u64::try_from(number).ok()?),
        T::Unsigned48 => Value::Unsigned48(u64::try_from(number).ok()?),
        T::Unsigned56 => Value::Unsigned56(u64::try_from(number).ok()?),
        T::Unsigned64 => Value::Unsigned64(u64::try_from(number).ok()?),
        T::Real32 => Value::Real32(number as f32),
        T::Real64 => Value::Real64(number as f64),
        _ => {
            warn!("unsupported numeric data type {:?}", data_type);
            return None;
        }
    })
}
