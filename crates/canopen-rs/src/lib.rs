#![cfg_attr(not(feature = "std"), no_std)]

// 'alloc' is used for dynamic allocation (e.g., Vec<u8> in SDO payloads)
extern crate alloc;

// --- Foundation Modules ---
pub mod error;
pub mod frame;
pub mod net;
pub mod types;
pub mod value;

// --- Data Model ---
pub mod od;

// --- Protocol Services ---
pub mod emcy;
pub mod lss;
pub mod nmt;
pub mod pdo;
pub mod sdo;
pub mod sync;
pub mod time;

// --- Node Abstraction ---
pub mod node;

// --- Top-level Exports ---
pub use error::CanOpenError;
pub use frame::{BusErrorFlags, BusErrorFrame, BusState, CanFlags, CanFrame};
pub use net::CanNet;
pub use node::{Node, NodeEvent, ServiceId};
pub use od::{AccessType, Object, ObjectDictionary, SubObject};
pub use sdo::{SdoAbort, SdoClientRequest, SdoConfirm, TransferMode};
pub use types::NodeId;
pub use value::{DataType, TimeOfDay, Value};
