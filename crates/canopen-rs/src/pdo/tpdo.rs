//! The transmit-PDO service.

use super::{COB_PDO_INVALID, PdoError, PdoMapping};
use crate::frame::CanFrame;
use crate::net::{CanNet, TimerHandle};
use crate::od::ObjectDictionary;
use crate::types::{COB_ID_TPDO_BASE, NodeId};
use log::trace;

/// One transmit-PDO channel.
///
/// Transmission types (communication parameter sub-index 2):
/// 0 transmits on SYNC if an event occurred since the previous SYNC,
/// 1..=240 transmit every n-th SYNC, 254/255 transmit on event subject to
/// the inhibit time (sub-index 3, 100 us units) and the event timer
/// (sub-index 5, ms).
pub struct Tpdo {
    /// Zero-based channel number (objects 0x1800+num / 0x1A00+num).
    num: u8,
    cob_id: u32,
    tx_type: u8,
    inhibit_us: u64,
    event_timer_us: u64,
    /// SYNC start value (sub-index 6): first transmission is gated on this
    /// counter value.
    sync_start: u8,
    mapping: PdoMapping,
    active: bool,
    /// SYNCs seen since the last transmission (cyclic types).
    sync_count: u8,
    /// Waiting for the SYNC start value to pass.
    sync_armed: bool,
    /// An event fired since the last synchronous transmission (type 0).
    event_pending: bool,
    /// Earliest time the next transmission may happen.
    inhibit_until: u64,
    /// An event-driven transmission is deferred until the inhibit deadline.
    inhibit_deferred: bool,
    /// Inhibit re-arm timer.
    inhibit_timer: TimerHandle,
    /// Event (idle) timer.
    event_timer: TimerHandle,
}

impl Tpdo {
    pub fn new(num: u8, inhibit_timer: TimerHandle, event_timer: TimerHandle) -> Self {
        Self {
            num,
            cob_id: 0,
            tx_type: 255,
            inhibit_us: 0,
            event_timer_us: 0,
            sync_start: 0,
            mapping: PdoMapping::default(),
            active: false,
            sync_count: 0,
            sync_armed: false,
            event_pending: false,
            inhibit_until: 0,
            inhibit_deferred: false,
            inhibit_timer,
            event_timer,
        }
    }

    pub fn num(&self) -> u8 {
        self.num
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Returns `true` if the given dictionary entry is part of this
    /// channel's mapping.
    pub fn maps(&self, index: u16, sub_index: u8) -> bool {
        self.active
            && self
                .mapping
                .entries()
                .iter()
                .any(|e| e.index == index && e.sub_index == sub_index)
    }

    /// (Re)configures the channel from its communication (0x1800+num) and
    /// mapping (0x1A00+num) parameter objects.
    pub fn start<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        od: &ObjectDictionary,
        node_id: NodeId,
    ) {
        self.stop(net);
        let comm = 0x1800u16 + u16::from(self.num);
        let default = if usize::from(self.num) < COB_ID_TPDO_BASE.len() && !node_id.is_unconfigured()
        {
            COB_ID_TPDO_BASE[usize::from(self.num)] + u32::from(node_id.raw())
        } else {
            COB_PDO_INVALID
        };
        let cob = od.read_u32(comm, 1).unwrap_or(default);
        if cob & COB_PDO_INVALID != 0 {
            return;
        }
        self.cob_id = cob & 0x7FF;
        self.tx_type = od.read_u8(comm, 2).unwrap_or(255);
        self.inhibit_us = u64::from(od.read_u16(comm, 3).unwrap_or(0)) * 100;
        self.event_timer_us = u64::from(od.read_u16(comm, 5).unwrap_or(0)) * 1000;
        self.sync_start = od.read_u8(comm, 6).unwrap_or(0);
        self.mapping = PdoMapping::read_from(od, 0x1A00 + u16::from(self.num));
        self.sync_count = 0;
        self.sync_armed = self.sync_start != 0;
        self.event_pending = false;
        self.inhibit_until = 0;
        self.inhibit_deferred = false;
        self.active = true;
        if self.is_event_driven() && self.event_timer_us > 0 {
            net.timer_after(self.event_timer, self.event_timer_us);
        }
        trace!(
            "[TPDO {}] transmitting on {:#05X}, type {}",
            self.num + 1,
            self.cob_id,
            self.tx_type
        );
    }

    pub fn stop<T: Copy>(&mut self, net: &mut CanNet<T>) {
        net.timer_stop(self.inhibit_timer);
        net.timer_stop(self.event_timer);
        self.active = false;
    }

    fn is_event_driven(&self) -> bool {
        self.tx_type >= 254
    }

    /// An application or RPDO event touched a mapped entry.
    ///
    /// Event-driven channels transmit immediately, or defer to the inhibit
    /// deadline; synchronous-acyclic channels flag the event for the next
    /// SYNC.
    pub fn trigger<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        od: &ObjectDictionary,
    ) -> Result<bool, PdoError> {
        if !self.active {
            return Ok(false);
        }
        match self.tx_type {
            0 => {
                self.event_pending = true;
                Ok(false)
            }
            254 | 255 => {
                let now = net.time();
                if now < self.inhibit_until {
                    // Defer: one transmission fires at the inhibit deadline
                    // carrying the then-current values.
                    if !self.inhibit_deferred {
                        self.inhibit_deferred = true;
                        net.timer_start(self.inhibit_timer, self.inhibit_until, None);
                    }
                    Ok(false)
                } else {
                    self.transmit(net, od)
                }
            }
            _ => Ok(false), // Cyclic channels ignore events.
        }
    }

    /// A SYNC pulse arrived (or was produced locally).
    pub fn on_sync<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        od: &ObjectDictionary,
        counter: Option<u8>,
    ) -> Result<bool, PdoError> {
        if !self.active {
            return Ok(false);
        }
        if self.sync_armed {
            match counter {
                Some(c) if c == self.sync_start => self.sync_armed = false,
                _ => return Ok(false),
            }
        }
        match self.tx_type {
            0 => {
                if self.event_pending {
                    self.event_pending = false;
                    self.transmit(net, od)
                } else {
                    Ok(false)
                }
            }
            n @ 1..=240 => {
                self.sync_count += 1;
                if self.sync_count >= n {
                    self.sync_count = 0;
                    self.transmit(net, od)
                } else {
                    Ok(false)
                }
            }
            _ => Ok(false),
        }
    }

    /// The inhibit deadline passed with a deferred transmission pending.
    pub fn on_inhibit_elapsed<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        od: &ObjectDictionary,
    ) -> Result<bool, PdoError> {
        if !self.active || !self.inhibit_deferred {
            return Ok(false);
        }
        self.inhibit_deferred = false;
        self.transmit(net, od)
    }

    /// The event timer expired: maximum spacing reached, transmit if idle.
    pub fn on_event_timer<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        od: &ObjectDictionary,
    ) -> Result<bool, PdoError> {
        if !self.active || !self.is_event_driven() {
            return Ok(false);
        }
        self.transmit(net, od)
    }

    fn transmit<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        od: &ObjectDictionary,
    ) -> Result<bool, PdoError> {
        let payload = self.mapping.encode(od)?;
        if let Ok(frame) = CanFrame::new(self.cob_id, &payload) {
            let _ = net.send(&frame);
        }
        let now = net.time();
        self.inhibit_until = now.saturating_add(self.inhibit_us);
        if self.is_event_driven() && self.event_timer_us > 0 {
            net.timer_after(self.event_timer, self.event_timer_us);
        }
        Ok(true)
    }
}
