use crate::sdo::SdoAbort;
use crate::value::{DataType, Value};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use core::fmt;

/// The object code of a dictionary entry. (Reference: CiA 301, Table 42)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectCode {
    Null = 0x00,
    Domain = 0x02,
    DefType = 0x05,
    DefStruct = 0x06,
    Var = 0x07,
    Array = 0x08,
    Record = 0x09,
}

/// Access rights of a sub-object. (Reference: CiA 301, Table 43 and CiA 306)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    /// Read only access.
    ReadOnly,
    /// Write only access.
    WriteOnly,
    /// Read and write access.
    ReadWrite,
    /// Read/write, written by the device on process input (`rwr`).
    ReadWriteInput,
    /// Read/write, written by the network on process output (`rww`).
    ReadWriteOutput,
    /// Read only access, value never changes after load.
    Constant,
}

impl AccessType {
    pub const fn is_readable(self) -> bool {
        !matches!(self, AccessType::WriteOnly)
    }

    pub const fn is_writable(self) -> bool {
        !matches!(self, AccessType::ReadOnly | AccessType::Constant)
    }
}

/// Feature flags of a sub-object, modeled as a type-safe bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubFlags(pub u16);

impl SubFlags {
    /// Refuse SDO upload regardless of the access mode.
    pub const REFUSE_READ: Self = Self(1 << 0);
    /// Refuse SDO download regardless of the access mode.
    pub const REFUSE_WRITE: Self = Self(1 << 1);
    /// The value names a file; uploads stream from that file.
    pub const UPLOAD_FILE: Self = Self(1 << 2);
    /// The value names a file; downloads stream into that file.
    pub const DOWNLOAD_FILE: Self = Self(1 << 3);
    /// The minimum is declared as `$NODEID + k`.
    pub const MIN_NODEID: Self = Self(1 << 4);
    /// The maximum is declared as `$NODEID + k`.
    pub const MAX_NODEID: Self = Self(1 << 5);
    /// The default is declared as `$NODEID + k`.
    pub const DEF_NODEID: Self = Self(1 << 6);
    /// The value is declared as `$NODEID + k`.
    pub const VAL_NODEID: Self = Self(1 << 7);
    /// A parameter value was set explicitly by the configuration file.
    pub const PARAMETER_VALUE: Self = Self(1 << 8);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl core::ops::BitOr for SubFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Interceptor invoked before a downloaded value is committed to the
/// dictionary. Returning an abort refuses the write.
pub trait DownloadHook {
    fn on_download(&mut self, index: u16, sub_index: u8, value: &Value) -> Result<(), SdoAbort>;
}

impl<F> DownloadHook for F
where
    F: FnMut(u16, u8, &Value) -> Result<(), SdoAbort>,
{
    fn on_download(&mut self, index: u16, sub_index: u8, value: &Value) -> Result<(), SdoAbort> {
        self(index, sub_index, value)
    }
}

/// Interceptor invoked on upload. Returning `Ok(Some(v))` substitutes `v`
/// for the stored value; `Ok(None)` uploads the stored value.
pub trait UploadHook {
    fn on_upload(
        &mut self,
        index: u16,
        sub_index: u8,
        value: &Value,
    ) -> Result<Option<Value>, SdoAbort>;
}

impl<F> UploadHook for F
where
    F: FnMut(u16, u8, &Value) -> Result<Option<Value>, SdoAbort>,
{
    fn on_upload(
        &mut self,
        index: u16,
        sub_index: u8,
        value: &Value,
    ) -> Result<Option<Value>, SdoAbort> {
        self(index, sub_index, value)
    }
}

/// Offsets captured at load time for `$NODEID + k` declarations.
#[derive(Debug, Clone, Default, PartialEq)]
pub(super) struct NodeIdOffsets {
    pub value: Option<Value>,
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub default: Option<Value>,
}

/// A single sub-object: the addressable unit of the dictionary.
pub struct SubObject {
    pub(super) sub_index: u8,
    pub(super) name: String,
    pub(super) data_type: DataType,
    pub(super) value: Value,
    pub(super) min: Option<Value>,
    pub(super) max: Option<Value>,
    pub(super) default: Option<Value>,
    pub(super) access: AccessType,
    pub(super) pdo_mapped: bool,
    pub(super) flags: SubFlags,
    pub(super) offsets: NodeIdOffsets,
    pub(super) download_hook: Option<Box<dyn DownloadHook>>,
    pub(super) upload_hook: Option<Box<dyn UploadHook>>,
}

impl SubObject {
    /// Creates a read/write sub-object holding `value`.
    pub fn new(sub_index: u8, name: &str, value: Value) -> Self {
        Self {
            sub_index,
            name: String::from(name),
            data_type: value.data_type(),
            value,
            min: None,
            max: None,
            default: None,
            access: AccessType::ReadWrite,
            pdo_mapped: false,
            flags: SubFlags::empty(),
            offsets: NodeIdOffsets::default(),
            download_hook: None,
            upload_hook: None,
        }
    }

    /// Sets the access mode (builder style).
    pub fn access(mut self, access: AccessType) -> Self {
        self.access = access;
        self
    }

    /// Declares `[min, max]` limits (builder style).
    pub fn limits(mut self, min: Value, max: Value) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    /// Declares only the lower limit (builder style).
    pub fn limits_min(mut self, min: Value) -> Self {
        self.min = Some(min);
        self
    }

    /// Declares only the upper limit (builder style).
    pub fn limits_max(mut self, max: Value) -> Self {
        self.max = Some(max);
        self
    }

    /// Sets the default value (builder style).
    pub fn default_value(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Marks the sub-object as PDO-mappable (builder style).
    pub fn pdo_mappable(mut self) -> Self {
        self.pdo_mapped = true;
        self
    }

    /// Adds feature flags (builder style). For the `*_NODEID` flags the
    /// corresponding field currently holds the raw offset; it is captured
    /// here and the effective value is derived on the next
    /// `ObjectDictionary::set_node_id`.
    pub fn with_flags(mut self, flags: SubFlags) -> Self {
        self.flags.insert(flags);
        if flags.contains(SubFlags::VAL_NODEID) {
            self.offsets.value = Some(self.value.clone());
        }
        if flags.contains(SubFlags::MIN_NODEID) {
            self.offsets.min = self.min.clone();
        }
        if flags.contains(SubFlags::MAX_NODEID) {
            self.offsets.max = self.max.clone();
        }
        if flags.contains(SubFlags::DEF_NODEID) {
            self.offsets.default = self.default.clone();
        }
        self
    }

    pub fn sub_index(&self) -> u8 {
        self.sub_index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn min(&self) -> Option<&Value> {
        self.min.as_ref()
    }

    pub fn max(&self) -> Option<&Value> {
        self.max.as_ref()
    }

    pub fn default_val(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    pub fn access_type(&self) -> AccessType {
        self.access
    }

    pub fn is_pdo_mapped(&self) -> bool {
        self.pdo_mapped
    }

    pub fn sub_flags(&self) -> SubFlags {
        self.flags
    }

    /// Replaces the stored value without type, range or access checks. For
    /// service bookkeeping only.
    pub fn set_value_silent(&mut self, value: Value) {
        self.value = value;
    }

    /// Installs the download interceptor, replacing any previous one.
    pub fn set_download_hook(&mut self, hook: Box<dyn DownloadHook>) {
        self.download_hook = Some(hook);
    }

    /// Installs the upload interceptor, replacing any previous one.
    pub fn set_upload_hook(&mut self, hook: Box<dyn UploadHook>) {
        self.upload_hook = Some(hook);
    }

    /// Checks a candidate value against the declared limits.
    pub fn check_range(&self, value: &Value) -> Result<(), SdoAbort> {
        if let Some(min) = &self.min {
            if value.partial_cmp_num(min) == Some(core::cmp::Ordering::Less) {
                return Err(SdoAbort::ValueTooLow);
            }
        }
        if let Some(max) = &self.max {
            if value.partial_cmp_num(max) == Some(core::cmp::Ordering::Greater) {
                return Err(SdoAbort::ValueTooHigh);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for SubObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubObject")
            .field("sub_index", &self.sub_index)
            .field("name", &self.name)
            .field("data_type", &self.data_type)
            .field("value", &self.value)
            .field("access", &self.access)
            .field("pdo_mapped", &self.pdo_mapped)
            .finish_non_exhaustive()
    }
}

/// A dictionary object: an index plus an ordered set of sub-objects.
#[derive(Debug)]
pub struct Object {
    pub(super) index: u16,
    pub(super) code: ObjectCode,
    pub(super) name: String,
    pub(super) subs: BTreeMap<u8, SubObject>,
}

impl Object {
    /// Creates a VAR object whose single sub-object 0 holds `value`.
    pub fn var(index: u16, name: &str, sub: SubObject) -> Self {
        let mut subs = BTreeMap::new();
        let mut sub = sub;
        sub.sub_index = 0;
        subs.insert(0, sub);
        Self {
            index,
            code: ObjectCode::Var,
            name: String::from(name),
            subs,
        }
    }

    /// Creates an empty ARRAY or RECORD object with sub-object 0 holding the
    /// highest sub-index supported (updated by [`Object::push_sub`]).
    pub fn compound(index: u16, name: &str, code: ObjectCode) -> Self {
        let mut subs = BTreeMap::new();
        subs.insert(
            0,
            SubObject::new(0, "Highest sub-index supported", Value::Unsigned8(0))
                .access(AccessType::ReadOnly),
        );
        Self {
            index,
            code,
            name: String::from(name),
            subs,
        }
    }

    /// Creates an ARRAY object.
    pub fn array(index: u16, name: &str) -> Self {
        Self::compound(index, name, ObjectCode::Array)
    }

    /// Creates a RECORD object.
    pub fn record(index: u16, name: &str) -> Self {
        Self::compound(index, name, ObjectCode::Record)
    }

    /// Inserts a sub-object, keeping sub-index 0 up to date for compound
    /// objects.
    pub fn push_sub(mut self, sub: SubObject) -> Self {
        self.insert_sub(sub);
        self
    }

    /// Non-consuming form of [`Object::push_sub`].
    pub fn insert_sub(&mut self, sub: SubObject) {
        let sub_index = sub.sub_index;
        self.subs.insert(sub_index, sub);
        if self.code != ObjectCode::Var {
            let highest = *self.subs.keys().next_back().expect("sub 0 exists");
            if let Some(zero) = self.subs.get_mut(&0) {
                if zero.value.as_u8().is_some() && sub_index != 0 {
                    zero.value = Value::Unsigned8(highest);
                }
            }
        }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn object_code(&self) -> ObjectCode {
        self.code
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sub(&self, sub_index: u8) -> Option<&SubObject> {
        self.subs.get(&sub_index)
    }

    pub fn sub_mut(&mut self, sub_index: u8) -> Option<&mut SubObject> {
        self.subs.get_mut(&sub_index)
    }

    /// Iterates the sub-objects in sub-index order.
    pub fn subs(&self) -> impl Iterator<Item = &SubObject> {
        self.subs.values()
    }

    pub(super) fn subs_mut(&mut self) -> impl Iterator<Item = &mut SubObject> {
        self.subs.values_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_object_has_single_sub_zero() {
        let obj = Object::var(
            0x1000,
            "Device type",
            SubObject::new(0, "Device type", Value::Unsigned32(0x0001_0191))
                .access(AccessType::ReadOnly),
        );
        assert_eq!(obj.object_code(), ObjectCode::Var);
        assert_eq!(obj.sub(0).unwrap().value(), &Value::Unsigned32(0x0001_0191));
        assert!(obj.sub(1).is_none());
    }

    #[test]
    fn test_compound_tracks_highest_sub_index() {
        let obj = Object::array(0x1016, "Consumer heartbeat time")
            .push_sub(SubObject::new(1, "Entry 1", Value::Unsigned32(0)))
            .push_sub(SubObject::new(3, "Entry 3", Value::Unsigned32(0)));
        assert_eq!(obj.sub(0).unwrap().value(), &Value::Unsigned8(3));
    }

    #[test]
    fn test_range_check() {
        let sub = SubObject::new(0, "x", Value::Unsigned16(50))
            .limits(Value::Unsigned16(10), Value::Unsigned16(100));
        assert_eq!(sub.check_range(&Value::Unsigned16(10)), Ok(()));
        assert_eq!(sub.check_range(&Value::Unsigned16(100)), Ok(()));
        assert_eq!(
            sub.check_range(&Value::Unsigned16(9)),
            Err(SdoAbort::ValueTooLow)
        );
        assert_eq!(
            sub.check_range(&Value::Unsigned16(101)),
            Err(SdoAbort::ValueTooHigh)
        );
    }

    #[test]
    fn test_nodeid_flag_captures_offset() {
        let sub = SubObject::new(0, "COB-ID", Value::Unsigned32(0x200))
            .with_flags(SubFlags::VAL_NODEID);
        assert_eq!(sub.offsets.value, Some(Value::Unsigned32(0x200)));
    }
}
