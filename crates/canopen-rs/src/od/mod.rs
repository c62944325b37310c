//! The object dictionary: the typed, introspectable data model shared by
//! every protocol service.

mod object;

pub use object::{
    AccessType, DownloadHook, Object, ObjectCode, SubFlags, SubObject, UploadHook,
};

use crate::sdo::SdoAbort;
use crate::types::NodeId;
use crate::value::Value;
use crate::CanOpenError;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;
use log::{debug, error};

/// A trait for abstracting the non-volatile storage of dictionary
/// parameters. This backs the "store parameters" (0x1010) and "restore
/// default parameters" (0x1011) objects, whose effect must persist across
/// device resets.
pub trait ParamStorage {
    /// Loads stored parameters from non-volatile memory.
    fn load(&mut self) -> Result<BTreeMap<(u16, u8), Value>, CanOpenError>;

    /// Saves the given parameters to non-volatile memory.
    fn save(&mut self, params: &BTreeMap<(u16, u8), Value>) -> Result<(), CanOpenError>;

    /// Clears all stored parameters.
    fn clear(&mut self) -> Result<(), CanOpenError>;

    /// Checks whether a restore was requested and is pending a reset.
    fn restore_requested(&self) -> bool;

    /// Sets the persistent restore flag. Called when the "load" signature is
    /// written to object 0x1011.
    fn request_restore(&mut self) -> Result<(), CanOpenError>;

    /// Clears the persistent restore flag after the restore completed.
    fn clear_restore_flag(&mut self) -> Result<(), CanOpenError>;
}

/// File back-end for sub-objects carrying the upload-from-file or
/// download-to-file flag. The value of such a sub-object names the file.
pub trait FileStore {
    fn read(&mut self, filename: &str) -> Result<Vec<u8>, SdoAbort>;
    fn write(&mut self, filename: &str, data: &[u8]) -> Result<(), SdoAbort>;
}

/// A guard consulted before an SDO download is committed. Used by the PDO
/// engine to validate communication/mapping parameter writes that need
/// dictionary-wide context.
pub type WriteGuard = fn(&ObjectDictionary, u16, u8, &Value) -> Result<(), SdoAbort>;

/// The object dictionary.
pub struct ObjectDictionary {
    objects: BTreeMap<u16, Object>,
    node_id: NodeId,
    /// When set, a committed download to a TPDO-mapped sub-object records a
    /// PDO event indication.
    event_on_write: bool,
    tpdo_events: Vec<(u16, u8)>,
    /// Every committed write and download, drained by the owning node to
    /// re-apply communication parameters.
    writes: Vec<(u16, u8)>,
    write_guard: Option<WriteGuard>,
    storage: Option<Box<dyn ParamStorage>>,
    file_store: Option<Box<dyn FileStore>>,
}

impl fmt::Debug for ObjectDictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectDictionary")
            .field("objects", &self.objects.len())
            .field("node_id", &self.node_id)
            .field("event_on_write", &self.event_on_write)
            .finish_non_exhaustive()
    }
}

impl ObjectDictionary {
    /// Creates an empty dictionary for an unconfigured node.
    pub fn new() -> Self {
        Self {
            objects: BTreeMap::new(),
            node_id: NodeId::UNCONFIGURED,
            event_on_write: true,
            tpdo_events: Vec::new(),
            writes: Vec::new(),
            write_guard: None,
            storage: None,
            file_store: None,
        }
    }

    /// Attaches a non-volatile parameter storage backend.
    pub fn set_storage(&mut self, storage: Box<dyn ParamStorage>) {
        self.storage = Some(storage);
    }

    /// Attaches a file backend for file-backed sub-objects.
    pub fn set_file_store(&mut self, store: Box<dyn FileStore>) {
        self.file_store = Some(store);
    }

    /// Installs the download write guard.
    pub fn set_write_guard(&mut self, guard: WriteGuard) {
        self.write_guard = Some(guard);
    }

    /// Initialises the dictionary after all objects have been inserted:
    /// handles a pending restore request and loads stored parameters.
    pub fn init(&mut self) -> Result<(), CanOpenError> {
        let mut restore = false;
        if let Some(s) = &mut self.storage {
            if s.restore_requested() {
                restore = true;
                s.clear_restore_flag()?;
                s.clear()?;
            }
        }
        if !restore {
            if let Some(s) = &mut self.storage {
                let stored = s.load()?;
                for ((index, sub_index), value) in stored {
                    // Objects may exist in storage but not in the current
                    // device description; those are skipped.
                    if let Some(sub) = self
                        .objects
                        .get_mut(&index)
                        .and_then(|o| o.sub_mut(sub_index))
                    {
                        if sub.data_type() == value.data_type() {
                            sub.value = value;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // --- Structure ---

    /// Inserts an object, replacing any object at the same index.
    pub fn insert(&mut self, object: Object) {
        self.objects.insert(object.index(), object);
    }

    /// Removes the object at `index`.
    pub fn remove(&mut self, index: u16) -> Option<Object> {
        self.objects.remove(&index)
    }

    /// Looks up an object. Missing index reports `ObjectNotFound`.
    pub fn object(&self, index: u16) -> Result<&Object, CanOpenError> {
        self.objects.get(&index).ok_or(CanOpenError::ObjectNotFound)
    }

    pub fn object_mut(&mut self, index: u16) -> Result<&mut Object, CanOpenError> {
        self.objects
            .get_mut(&index)
            .ok_or(CanOpenError::ObjectNotFound)
    }

    /// Returns `true` if the object exists.
    pub fn contains(&self, index: u16) -> bool {
        self.objects.contains_key(&index)
    }

    /// Looks up a sub-object. Missing index/sub-index report
    /// `ObjectNotFound`/`SubIndexNotFound`.
    pub fn sub(&self, index: u16, sub_index: u8) -> Result<&SubObject, CanOpenError> {
        self.object(index)?
            .sub(sub_index)
            .ok_or(CanOpenError::SubIndexNotFound)
    }

    pub fn sub_mut(&mut self, index: u16, sub_index: u8) -> Result<&mut SubObject, CanOpenError> {
        self.object_mut(index)?
            .sub_mut(sub_index)
            .ok_or(CanOpenError::SubIndexNotFound)
    }

    /// SDO-flavored lookup, reporting the CiA 301 abort codes for missing
    /// entries.
    fn sub_for_sdo(&self, index: u16, sub_index: u8) -> Result<&SubObject, SdoAbort> {
        self.objects
            .get(&index)
            .ok_or(SdoAbort::NoObject)?
            .sub(sub_index)
            .ok_or(SdoAbort::NoSubIndex)
    }

    /// Iterates objects in index order.
    pub fn objects(&self) -> impl Iterator<Item = &Object> {
        self.objects.values()
    }

    /// Returns the first index at or after `index`, for successor queries.
    pub fn next_index(&self, index: u16) -> Option<u16> {
        self.objects.range(index..).map(|(&i, _)| i).next()
    }

    // --- Typed access ---

    /// Reads the value of a sub-object.
    pub fn read(&self, index: u16, sub_index: u8) -> Result<&Value, CanOpenError> {
        Ok(self.sub(index, sub_index)?.value())
    }

    pub fn read_u8(&self, index: u16, sub_index: u8) -> Option<u8> {
        self.read(index, sub_index).ok()?.as_u8()
    }

    pub fn read_u16(&self, index: u16, sub_index: u8) -> Option<u16> {
        self.read(index, sub_index).ok()?.as_u16()
    }

    pub fn read_u32(&self, index: u16, sub_index: u8) -> Option<u32> {
        match self.read(index, sub_index).ok()? {
            Value::Unsigned32(v) => Some(*v),
            _ => None,
        }
    }

    /// Writes a value, enforcing the declared type and `[min, max]` limits
    /// but not the access mode (local writes may touch read-only entries).
    ///
    /// A committed write to a TPDO-mapped sub-object records a PDO event
    /// indication when the event-on-write flag is set.
    pub fn write(&mut self, index: u16, sub_index: u8, value: Value) -> Result<(), CanOpenError> {
        let sub = self.sub_mut(index, sub_index)?;
        if sub.data_type() != value.data_type() {
            return Err(CanOpenError::TypeMismatch);
        }
        if sub.check_range(&value).is_err() {
            return Err(CanOpenError::ValueOutOfRange);
        }
        let mapped = sub.is_pdo_mapped();
        sub.value = value;
        self.writes.push((index, sub_index));
        if mapped && self.event_on_write {
            self.tpdo_events.push((index, sub_index));
        }
        Ok(())
    }

    /// Writes a value without recording a PDO event indication. Used by the
    /// services for bookkeeping writes (e.g. the RPDO direction).
    pub fn write_silent(
        &mut self,
        index: u16,
        sub_index: u8,
        value: Value,
    ) -> Result<(), CanOpenError> {
        let sub = self.sub_mut(index, sub_index)?;
        if sub.data_type() != value.data_type() {
            return Err(CanOpenError::TypeMismatch);
        }
        sub.value = value;
        Ok(())
    }

    // --- SDO access ---

    /// Commits an SDO download of `data` to a sub-object: enforces the
    /// access mode, decodes per the declared type, range-checks, runs the
    /// download interceptor and stores the value.
    pub fn download(&mut self, index: u16, sub_index: u8, data: &[u8]) -> Result<(), SdoAbort> {
        let sub = self.sub_for_sdo(index, sub_index)?;
        if !sub.access_type().is_writable() {
            return Err(SdoAbort::ReadOnly);
        }
        if sub.sub_flags().contains(SubFlags::REFUSE_WRITE) {
            return Err(SdoAbort::UnsupportedAccess);
        }

        // Store/restore signatures are handled before any decode so that the
        // storage backend sees them even without a matching entry shape.
        if index == 0x1010 || index == 0x1011 {
            return self.handle_storage_command(index, sub_index, data);
        }

        // Only the value 0 may be written to the number of errors
        // (0x1003:00); it clears the pre-defined error field.
        if index == 0x1003 && sub_index == 0 {
            if data.iter().any(|&b| b != 0) {
                return Err(SdoAbort::InvalidValue);
            }
            self.clear_error_history();
            return Ok(());
        }

        if sub.sub_flags().contains(SubFlags::DOWNLOAD_FILE) {
            let Value::VisibleString(name) = sub.value().clone() else {
                return Err(SdoAbort::HardwareError);
            };
            let store = self.file_store.as_mut().ok_or(SdoAbort::HardwareError)?;
            return store.write(&name, data);
        }

        let data_type = sub.data_type();
        let value = match data_type.fixed_size() {
            Some(size) if data.len() > size => return Err(SdoAbort::TypeLengthTooHigh),
            Some(size) if data.len() < size => return Err(SdoAbort::TypeLengthTooLow),
            _ => Value::from_bytes(data_type, data).map_err(|_| SdoAbort::TypeLengthMismatch)?,
        };
        sub.check_range(&value)?;

        if let Some(guard) = self.write_guard {
            guard(self, index, sub_index, &value)?;
        }

        let sub = self.sub_mut(index, sub_index).map_err(|_| SdoAbort::NoObject)?;
        if let Some(hook) = &mut sub.download_hook {
            hook.on_download(index, sub_index, &value)?;
        }
        let mapped = sub.is_pdo_mapped();
        sub.value = value;
        debug!("[OD] download {:04X}:{:02X} committed", index, sub_index);
        self.writes.push((index, sub_index));
        if mapped && self.event_on_write {
            self.tpdo_events.push((index, sub_index));
        }
        Ok(())
    }

    /// Serves an SDO upload from a sub-object: enforces the access mode,
    /// runs the upload interceptor and serializes the value.
    pub fn upload(&mut self, index: u16, sub_index: u8) -> Result<Vec<u8>, SdoAbort> {
        let sub = self.sub_for_sdo(index, sub_index)?;
        if !sub.access_type().is_readable() {
            return Err(SdoAbort::WriteOnly);
        }
        if sub.sub_flags().contains(SubFlags::REFUSE_READ) {
            return Err(SdoAbort::UnsupportedAccess);
        }
        if sub.sub_flags().contains(SubFlags::UPLOAD_FILE) {
            let Value::VisibleString(name) = sub.value().clone() else {
                return Err(SdoAbort::HardwareError);
            };
            let store = self.file_store.as_mut().ok_or(SdoAbort::HardwareError)?;
            return store.read(&name);
        }
        let sub = self
            .object_mut(index)
            .map_err(|_| SdoAbort::NoObject)?
            .sub_mut(sub_index)
            .ok_or(SdoAbort::NoSubIndex)?;
        let stored = sub.value.clone();
        if let Some(hook) = &mut sub.upload_hook {
            if let Some(substituted) = hook.on_upload(index, sub_index, &stored)? {
                return Ok(substituted.to_bytes());
            }
        }
        Ok(stored.to_bytes())
    }

    fn handle_storage_command(
        &mut self,
        index: u16,
        sub_index: u8,
        data: &[u8],
    ) -> Result<(), SdoAbort> {
        if sub_index == 0 {
            return Err(SdoAbort::UnsupportedAccess);
        }
        let signature: &[u8] = if index == 0x1010 { b"save" } else { b"load" };
        if data != signature {
            return Err(SdoAbort::InvalidValue);
        }
        if index == 0x1010 {
            self.store_parameters(sub_index)
        } else {
            match &mut self.storage {
                Some(s) => s.request_restore().map_err(|_| SdoAbort::HardwareError),
                None => Err(SdoAbort::UnsupportedAccess),
            }
        }
    }

    /// Clears the pre-defined error field (object 0x1003).
    fn clear_error_history(&mut self) {
        let Ok(object) = self.object_mut(0x1003) else {
            return;
        };
        for sub in object.subs_mut() {
            if sub.sub_index() == 0 {
                sub.set_value_silent(Value::Unsigned8(0));
            } else {
                sub.set_value_silent(Value::Unsigned32(0));
            }
        }
    }

    /// Collects the storable parameter group and hands it to the backend.
    fn store_parameters(&mut self, group: u8) -> Result<(), SdoAbort> {
        if self.storage.is_none() {
            return Err(SdoAbort::UnsupportedAccess);
        }
        let mut params = BTreeMap::new();
        for (&index, object) in &self.objects {
            let in_group = match group {
                1 => true,
                2 => (0x1000..=0x1FFF).contains(&index),
                3 => (0x6000..=0x9FFF).contains(&index),
                _ => false,
            };
            if !in_group {
                continue;
            }
            for sub in object.subs() {
                if sub.access_type().is_writable() {
                    params.insert((index, sub.sub_index()), sub.value().clone());
                }
            }
        }
        let storage = self.storage.as_mut().expect("checked above");
        match storage.save(&params) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("[OD] store parameters failed: {}", e);
                Err(SdoAbort::HardwareError)
            }
        }
    }

    // --- Node-ID handling ---

    /// The node-ID currently substituted into `$NODEID` declarations.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Rewrites every `$NODEID`-relative field to `offset + new_id`.
    pub fn set_node_id(&mut self, new_id: NodeId) {
        self.node_id = new_id;
        let raw = new_id.raw();
        for object in self.objects.values_mut() {
            for sub in object.subs_mut() {
                if let Some(offset) = &sub.offsets.value {
                    sub.value = offset.plus_node_id(raw);
                }
                if let Some(offset) = &sub.offsets.min {
                    sub.min = Some(offset.plus_node_id(raw));
                }
                if let Some(offset) = &sub.offsets.max {
                    sub.max = Some(offset.plus_node_id(raw));
                }
                if let Some(offset) = &sub.offsets.default {
                    sub.default = Some(offset.plus_node_id(raw));
                }
            }
        }
    }

    // --- PDO event indications ---

    /// Enables or disables PDO event indications on committed writes.
    pub fn set_event_on_write(&mut self, enabled: bool) {
        self.event_on_write = enabled;
    }

    /// Drains the PDO event indications recorded since the last call.
    pub fn take_tpdo_events(&mut self) -> Vec<(u16, u8)> {
        core::mem::take(&mut self.tpdo_events)
    }

    /// Drains the committed writes recorded since the last call.
    pub fn take_writes(&mut self) -> Vec<(u16, u8)> {
        core::mem::take(&mut self.writes)
    }

    /// Restores every sub-object in `[lo, hi]` that declares a default to
    /// that default. Used by the NMT reset sequences.
    pub fn restore_power_on_values(&mut self, lo: u16, hi: u16) {
        for (_, object) in self.objects.range_mut(lo..=hi) {
            for sub in object.subs_mut() {
                if let Some(default) = sub.default_val().cloned() {
                    sub.set_value_silent(default);
                }
            }
        }
    }
}

impl Default for ObjectDictionary {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{DataType, TimeOfDay};
    use alloc::string::ToString;
    use alloc::vec;

    fn get_test_od() -> ObjectDictionary {
        let mut od = ObjectDictionary::new();
        od.insert(Object::var(
            0x1000,
            "Device type",
            SubObject::new(0, "Device type", Value::Unsigned32(0x0001_0191))
                .access(AccessType::ReadOnly),
        ));
        od.insert(Object::var(
            0x2000,
            "Test value",
            SubObject::new(0, "Test value", Value::Unsigned32(0)).pdo_mappable(),
        ));
        od.insert(Object::var(
            0x2001,
            "Bounded value",
            SubObject::new(0, "Bounded value", Value::Unsigned16(50))
                .limits(Value::Unsigned16(10), Value::Unsigned16(100)),
        ));
        od
    }

    #[test]
    fn test_lookup_errors() {
        let od = get_test_od();
        assert!(matches!(
            od.sub(0x3000, 0),
            Err(CanOpenError::ObjectNotFound)
        ));
        assert!(matches!(
            od.sub(0x1000, 9),
            Err(CanOpenError::SubIndexNotFound)
        ));
    }

    #[test]
    fn test_write_type_checked() {
        let mut od = get_test_od();
        assert_eq!(
            od.write(0x2000, 0, Value::Unsigned16(5)),
            Err(CanOpenError::TypeMismatch)
        );
        assert!(od.write(0x2000, 0, Value::Unsigned32(5)).is_ok());
        assert_eq!(od.read_u32(0x2000, 0), Some(5));
    }

    #[test]
    fn test_range_enforced_on_both_paths() {
        let mut od = get_test_od();
        assert_eq!(
            od.write(0x2001, 0, Value::Unsigned16(101)),
            Err(CanOpenError::ValueOutOfRange)
        );
        assert_eq!(
            od.download(0x2001, 0, &101u16.to_le_bytes()),
            Err(SdoAbort::ValueTooHigh)
        );
        assert_eq!(
            od.download(0x2001, 0, &9u16.to_le_bytes()),
            Err(SdoAbort::ValueTooLow)
        );
        assert!(od.download(0x2001, 0, &77u16.to_le_bytes()).is_ok());
        assert_eq!(od.read_u16(0x2001, 0), Some(77));
    }

    #[test]
    fn test_download_enforces_access_mode() {
        let mut od = get_test_od();
        assert_eq!(
            od.download(0x1000, 0, &0u32.to_le_bytes()),
            Err(SdoAbort::ReadOnly)
        );
    }

    #[test]
    fn test_download_length_mismatch() {
        let mut od = get_test_od();
        assert_eq!(
            od.download(0x2000, 0, &[1, 2, 3]),
            Err(SdoAbort::TypeLengthTooLow)
        );
        assert_eq!(
            od.download(0x2000, 0, &[1, 2, 3, 4, 5]),
            Err(SdoAbort::TypeLengthTooHigh)
        );
    }

    #[test]
    fn test_download_records_pdo_event() {
        let mut od = get_test_od();
        od.download(0x2000, 0, &1u32.to_le_bytes()).unwrap();
        assert_eq!(od.take_tpdo_events(), vec![(0x2000, 0)]);
        assert!(od.take_tpdo_events().is_empty());

        od.set_event_on_write(false);
        od.download(0x2000, 0, &2u32.to_le_bytes()).unwrap();
        assert!(od.take_tpdo_events().is_empty());
    }

    #[test]
    fn test_download_hook_can_refuse() {
        let mut od = get_test_od();
        od.sub_mut(0x2000, 0)
            .unwrap()
            .set_download_hook(Box::new(|_, _, value: &Value| {
                if value == &Value::Unsigned32(13) {
                    Err(SdoAbort::InvalidValue)
                } else {
                    Ok(())
                }
            }));
        assert_eq!(
            od.download(0x2000, 0, &13u32.to_le_bytes()),
            Err(SdoAbort::InvalidValue)
        );
        // Refused writes leave the stored value untouched.
        assert_eq!(od.read_u32(0x2000, 0), Some(0));
        assert!(od.download(0x2000, 0, &14u32.to_le_bytes()).is_ok());
    }

    #[test]
    fn test_upload_hook_substitutes() {
        let mut od = get_test_od();
        od.sub_mut(0x2000, 0)
            .unwrap()
            .set_upload_hook(Box::new(|_, _, _: &Value| {
                Ok(Some(Value::Unsigned32(0xAABB_CCDD)))
            }));
        assert_eq!(
            od.upload(0x2000, 0).unwrap(),
            0xAABB_CCDDu32.to_le_bytes().to_vec()
        );
    }

    #[test]
    fn test_set_node_id_rewrites_only_flagged_values() {
        let mut od = get_test_od();
        od.insert(Object::var(
            0x1200,
            "SDO server parameter",
            SubObject::new(0, "COB-ID client to server", Value::Unsigned32(0x600))
                .with_flags(SubFlags::VAL_NODEID),
        ));
        let before = od.read_u32(0x2000, 0);
        od.set_node_id(NodeId::try_from(5).unwrap());
        assert_eq!(od.read_u32(0x1200, 0), Some(0x605));
        assert_eq!(od.read_u32(0x2000, 0), before);
        od.set_node_id(NodeId::try_from(9).unwrap());
        assert_eq!(od.read_u32(0x1200, 0), Some(0x609));
    }

    #[test]
    fn test_storage_signature_handling() {
        struct MockStorage {
            restore_requested: bool,
            saved: Option<BTreeMap<(u16, u8), Value>>,
        }
        impl ParamStorage for MockStorage {
            fn load(&mut self) -> Result<BTreeMap<(u16, u8), Value>, CanOpenError> {
                Ok(BTreeMap::new())
            }
            fn save(&mut self, p: &BTreeMap<(u16, u8), Value>) -> Result<(), CanOpenError> {
                self.saved = Some(p.clone());
                Ok(())
            }
            fn clear(&mut self) -> Result<(), CanOpenError> {
                Ok(())
            }
            fn restore_requested(&self) -> bool {
                self.restore_requested
            }
            fn request_restore(&mut self) -> Result<(), CanOpenError> {
                self.restore_requested = true;
                Ok(())
            }
            fn clear_restore_flag(&mut self) -> Result<(), CanOpenError> {
                self.restore_requested = false;
                Ok(())
            }
        }

        let mut od = get_test_od();
        od.insert(
            Object::array(0x1011, "Restore default parameters").push_sub(
                SubObject::new(1, "Restore all default parameters", Value::Unsigned32(1)),
            ),
        );
        od.set_storage(Box::new(MockStorage {
            restore_requested: false,
            saved: None,
        }));

        // A wrong signature is refused.
        assert_eq!(
            od.download(0x1011, 1, b"luad"),
            Err(SdoAbort::InvalidValue)
        );
        assert_eq!(od.download(0x1011, 1, b"load"), Ok(()));
    }

    #[test]
    fn test_time_of_day_entry() {
        let mut od = ObjectDictionary::new();
        od.insert(Object::var(
            0x2100,
            "Timestamp",
            SubObject::new(0, "Timestamp", Value::TimeOfDay(TimeOfDay::default())),
        ));
        let t = TimeOfDay {
            millis: 1234,
            days: 99,
        };
        od.write(0x2100, 0, Value::TimeOfDay(t)).unwrap();
        let bytes = od.upload(0x2100, 0).unwrap();
        assert_eq!(bytes.len(), 6);
        assert_eq!(
            Value::from_bytes(DataType::TimeOfDay, &bytes).unwrap(),
            Value::TimeOfDay(t)
        );
    }

    #[test]
    fn test_visible_string_download() {
        let mut od = ObjectDictionary::new();
        od.insert(Object::var(
            0x2002,
            "Label",
            SubObject::new(0, "Label", Value::VisibleString("".to_string())),
        ));
        od.download(0x2002, 0, b"hello").unwrap();
        assert_eq!(
            od.read(0x2002, 0).unwrap(),
            &Value::VisibleString("hello".to_string())
        );
    }
}
