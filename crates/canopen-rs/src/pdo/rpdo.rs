//! The receive-PDO service.

use super::{COB_PDO_INVALID, PdoError, PdoMapping};
use crate::frame::CanFrame;
use crate::net::{CanNet, RecvHandle, TimerHandle};
use crate::od::ObjectDictionary;
use crate::types::{COB_ID_RPDO_BASE, NodeId};
use alloc::vec::Vec;
use log::trace;

/// Transmission types of an RPDO: 0..=240 apply the buffered frame on the
/// next SYNC, 254/255 apply immediately.
fn is_synchronous(tx_type: u8) -> bool {
    tx_type <= 240
}

/// One receive-PDO channel.
pub struct Rpdo {
    /// Zero-based channel number (objects 0x1400+num / 0x1600+num).
    num: u8,
    cob_id: u32,
    tx_type: u8,
    /// Deadline monitoring period (event timer, sub-index 5), microseconds.
    deadline_us: u64,
    mapping: PdoMapping,
    active: bool,
    /// Last received payload of a synchronous RPDO, applied on SYNC.
    pending: Option<Vec<u8>>,
    recv: RecvHandle,
    /// Deadline monitoring timer.
    timer: TimerHandle,
}

impl Rpdo {
    pub fn new(num: u8, recv: RecvHandle, timer: TimerHandle) -> Self {
        Self {
            num,
            cob_id: 0,
            tx_type: 255,
            deadline_us: 0,
            mapping: PdoMapping::default(),
            active: false,
            pending: None,
            recv,
            timer,
        }
    }

    pub fn num(&self) -> u8 {
        self.num
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// (Re)configures the channel from its communication (0x1400+num) and
    /// mapping (0x1600+num) parameter objects and starts listening.
    pub fn start<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        od: &ObjectDictionary,
        node_id: NodeId,
    ) {
        self.stop(net);
        let comm = 0x1400u16 + u16::from(self.num);
        let default = if usize::from(self.num) < COB_ID_RPDO_BASE.len() && !node_id.is_unconfigured()
        {
            COB_ID_RPDO_BASE[usize::from(self.num)] + u32::from(node_id.raw())
        } else {
            COB_PDO_INVALID
        };
        let cob = od.read_u32(comm, 1).unwrap_or(default);
        if cob & COB_PDO_INVALID != 0 {
            return;
        }
        self.cob_id = cob & 0x7FF;
        self.tx_type = od.read_u8(comm, 2).unwrap_or(255);
        self.deadline_us = u64::from(od.read_u16(comm, 5).unwrap_or(0)) * 1000;
        self.mapping = PdoMapping::read_from(od, 0x1600 + u16::from(self.num));
        self.pending = None;
        self.active = true;
        net.recv_start(self.recv, self.cob_id, false);
        if self.deadline_us > 0 {
            net.timer_after(self.timer, self.deadline_us);
        }
        trace!(
            "[RPDO {}] listening on {:#05X}, type {}",
            self.num + 1,
            self.cob_id,
            self.tx_type
        );
    }

    pub fn stop<T: Copy>(&mut self, net: &mut CanNet<T>) {
        net.recv_stop(self.recv);
        net.timer_stop(self.timer);
        self.pending = None;
        self.active = false;
    }

    /// Processes a received PDO frame. Event-driven channels apply it to the
    /// dictionary immediately; synchronous channels buffer it for the next
    /// SYNC. Returns the dictionary entries written, if any.
    pub fn on_frame<T: Copy>(
        &mut self,
        frame: &CanFrame,
        net: &mut CanNet<T>,
        od: &mut ObjectDictionary,
    ) -> Result<Vec<(u16, u8)>, PdoError> {
        if !self.active || frame.is_rtr() {
            return Ok(Vec::new());
        }
        if self.deadline_us > 0 {
            net.timer_after(self.timer, self.deadline_us);
        }
        if frame.len() * 8 < self.mapping.bit_len() {
            return Err(PdoError::LengthMismatch {
                expected_bits: self.mapping.bit_len(),
                got_bits: frame.len() * 8,
            });
        }
        if is_synchronous(self.tx_type) {
            self.pending = Some(frame.data().to_vec());
            Ok(Vec::new())
        } else {
            self.mapping.decode_into(od, frame.data())
        }
    }

    /// Applies the buffered frame of a synchronous channel.
    pub fn on_sync(&mut self, od: &mut ObjectDictionary) -> Result<Vec<(u16, u8)>, PdoError> {
        if !self.active || !is_synchronous(self.tx_type) {
            return Ok(Vec::new());
        }
        match self.pending.take() {
            Some(payload) => self.mapping.decode_into(od, &payload),
            None => Ok(Vec::new()),
        }
    }

    /// The deadline monitor fired: no PDO arrived within the event-timer
    /// period. The caller raises the RPDO-timeout emergency.
    pub fn on_deadline<T: Copy>(&mut self, net: &mut CanNet<T>) -> bool {
        if !self.active || self.deadline_us == 0 {
            return false;
        }
        net.timer_after(self.timer, self.deadline_us);
        true
    }
}
