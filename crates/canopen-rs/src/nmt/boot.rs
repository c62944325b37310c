//! The boot-slave process of the NMT master.
//!
//! Reads the device type and identity objects of a slave over SDO, compares
//! them against the expected values in the master's dictionary (objects
//! 0x1F84..0x1F88) and reports failure with the error status letter of
//! CiA 302-2.

use crate::net::CanNet;
use crate::od::ObjectDictionary;
use crate::sdo::{SdoClient, SdoClientRequest, SdoConfirm};
use crate::types::NodeId;
use crate::CanOpenError;
use log::{debug, info, warn};

/// The identity checks performed by the boot process, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Object 0x1000 versus 0x1F84.
    DeviceType,
    /// Object 0x1018:01 versus 0x1F85.
    VendorId,
    /// Object 0x1018:02 versus 0x1F86.
    ProductCode,
    /// Object 0x1018:03 versus 0x1F87.
    Revision,
    /// Object 0x1018:04 versus 0x1F88.
    SerialNumber,
}

impl Step {
    /// The (remote object, remote sub, expected-value object) of this step.
    fn addresses(self) -> (u16, u8, u16) {
        match self {
            Step::DeviceType => (0x1000, 0, 0x1F84),
            Step::VendorId => (0x1018, 1, 0x1F85),
            Step::ProductCode => (0x1018, 2, 0x1F86),
            Step::Revision => (0x1018, 3, 0x1F87),
            Step::SerialNumber => (0x1018, 4, 0x1F88),
        }
    }

    /// The CiA 302-2 error status letter reported on a mismatch.
    fn mismatch_status(self) -> char {
        match self {
            Step::DeviceType => 'C',
            Step::VendorId => 'D',
            Step::ProductCode => 'M',
            Step::Revision => 'N',
            Step::SerialNumber => 'O',
        }
    }

    fn next(self) -> Option<Step> {
        match self {
            Step::DeviceType => Some(Step::VendorId),
            Step::VendorId => Some(Step::ProductCode),
            Step::ProductCode => Some(Step::Revision),
            Step::Revision => Some(Step::SerialNumber),
            Step::SerialNumber => None,
        }
    }
}

/// What the master must do after feeding the boot process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootOutcome {
    /// An SDO request is in flight; wait for its confirmation.
    Pending,
    /// All identity checks passed; proceed to the configuration request.
    IdentityOk,
    /// The boot failed with the given error status letter. The slave must
    /// not be started.
    Failed(char),
}

/// The boot process of a single slave.
#[derive(Debug)]
pub struct BootSlave {
    node: NodeId,
    step: Step,
}

impl BootSlave {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            step: Step::DeviceType,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Starts the process: binds the client to the slave and requests the
    /// device type.
    pub fn begin<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        csdo: &mut SdoClient,
    ) -> Result<(), CanOpenError> {
        info!("[NMT] booting slave {}", self.node);
        csdo.set_remote(net, self.node);
        self.step = Step::DeviceType;
        self.request_current(net, csdo)
    }

    /// Feeds an SDO confirmation into the process.
    pub fn on_confirm<T: Copy>(
        &mut self,
        confirm: &SdoConfirm,
        net: &mut CanNet<T>,
        csdo: &mut SdoClient,
        master_od: &ObjectDictionary,
    ) -> BootOutcome {
        let (index, sub_index, expected_obj) = self.step.addresses();
        if (confirm.index, confirm.sub_index) != (index, sub_index) {
            return BootOutcome::Pending;
        }
        let actual = match &confirm.result {
            Ok(Some(payload)) if payload.len() >= 4 => {
                u32::from_le_bytes(payload[0..4].try_into().unwrap())
            }
            Ok(_) => 0,
            Err(_) => {
                // No (valid) response to the device type read is status 'B';
                // later reads degrade to the step's mismatch letter only if
                // an expected value exists.
                warn!(
                    "[NMT] boot of slave {}: no response reading {:#06X}:{:02X}",
                    self.node, index, sub_index
                );
                return if self.step == Step::DeviceType {
                    BootOutcome::Failed('B')
                } else if self.expected(master_od, expected_obj).unwrap_or(0) != 0 {
                    BootOutcome::Failed(self.step.mismatch_status())
                } else {
                    self.advance(net, csdo)
                };
            }
        };
        // An expected value of zero (or an absent entry) means "do not
        // check".
        let expected = self.expected(master_od, expected_obj).unwrap_or(0);
        if expected != 0 && expected != actual {
            warn!(
                "[NMT] boot of slave {}: {:#06X}:{:02X} is {:#010X}, expected {:#010X}",
                self.node, index, sub_index, actual, expected
            );
            return BootOutcome::Failed(self.step.mismatch_status());
        }
        debug!(
            "[NMT] boot of slave {}: {:#06X}:{:02X} = {:#010X} ok",
            self.node, index, sub_index, actual
        );
        self.advance(net, csdo)
    }

    fn advance<T: Copy>(&mut self, net: &mut CanNet<T>, csdo: &mut SdoClient) -> BootOutcome {
        match self.step.next() {
            Some(step) => {
                self.step = step;
                match self.request_current(net, csdo) {
                    Ok(()) => BootOutcome::Pending,
                    Err(_) => BootOutcome::Failed('B'),
                }
            }
            None => BootOutcome::IdentityOk,
        }
    }

    fn request_current<T: Copy>(
        &self,
        net: &mut CanNet<T>,
        csdo: &mut SdoClient,
    ) -> Result<(), CanOpenError> {
        let (index, sub_index, _) = self.step.addresses();
        csdo.submit(net, SdoClientRequest::upload(index, sub_index))
    }

    /// Reads the expected value for this slave from a 0x1F84..0x1F88 array
    /// (sub-index = the slave's node-ID).
    fn expected(&self, master_od: &ObjectDictionary, object: u16) -> Option<u32> {
        master_od.read_u32(object, self.node.raw())
    }
}
