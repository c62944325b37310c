//! Network management: the node state machine, error control (heartbeat and
//! node guarding) and, for masters, the boot-slave and configuration-request
//! processes. (Reference: CiA 301, Section 7.2.8 and CiA 302-2)

pub mod boot;
pub mod cfg;
pub mod master;

pub use master::NmtMaster;

use crate::frame::CanFrame;
use crate::net::{CanNet, RecvHandle, TimerHandle};
use crate::od::ObjectDictionary;
use crate::types::{COB_ID_EC_BASE, COB_ID_NMT, NodeId};
use alloc::vec::Vec;
use core::convert::TryFrom;
use log::{info, trace, warn};

/// The NMT state of a node. The two reset entries are transient sub-states
/// used only locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NmtState {
    /// Power-on initialisation; announced on the wire as boot-up.
    #[default]
    Initialising,
    Stopped,
    Operational,
    PreOperational,
    ResetApplication,
    ResetCommunication,
}

impl NmtState {
    /// The wire representation used by error-control frames.
    pub const fn to_u8(self) -> u8 {
        match self {
            NmtState::Initialising => 0x00,
            NmtState::Stopped => 0x04,
            NmtState::Operational => 0x05,
            NmtState::PreOperational => 0x7F,
            // Reset states are never announced; they resolve to boot-up.
            NmtState::ResetApplication | NmtState::ResetCommunication => 0x00,
        }
    }

    /// Parses the state byte of an error-control frame (toggle bit masked).
    pub fn from_u8(value: u8) -> Option<Self> {
        match value & 0x7F {
            0x00 => Some(NmtState::Initialising),
            0x04 => Some(NmtState::Stopped),
            0x05 => Some(NmtState::Operational),
            0x7F => Some(NmtState::PreOperational),
            _ => None,
        }
    }
}

/// NMT command specifiers. (Reference: CiA 301, Table 39)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtCommand {
    Start = 0x01,
    Stop = 0x02,
    EnterPreOperational = 0x80,
    ResetNode = 0x81,
    ResetCommunication = 0x82,
}

impl TryFrom<u8> for NmtCommand {
    type Error = ();
    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(NmtCommand::Start),
            0x02 => Ok(NmtCommand::Stop),
            0x80 => Ok(NmtCommand::EnterPreOperational),
            0x81 => Ok(NmtCommand::ResetNode),
            0x82 => Ok(NmtCommand::ResetCommunication),
            _ => Err(()),
        }
    }
}

/// The outcome of feeding a command or event into the slave state machine.
/// The owning node performs the service start/stop work the transition
/// implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmtTransition {
    /// No state change.
    None,
    /// The node entered the given state.
    Entered(NmtState),
    /// The application and communication must be reset, then re-initialise.
    ResetApplication,
    /// The communication must be reset, then re-initialise.
    ResetCommunication,
}

/// The NMT slave service: runs the local node state machine, produces
/// boot-up and heartbeat frames and answers node-guarding polls.
pub struct NmtSlave {
    node_id: NodeId,
    state: NmtState,
    /// Receiver for NMT commands (COB-ID 0x000).
    recv: RecvHandle,
    /// Receiver for the node-guarding RTR on this node's error-control
    /// COB-ID.
    ec_recv: RecvHandle,
    /// Heartbeat production timer.
    hb_timer: TimerHandle,
    /// Life-guarding timer (guard time x life time factor).
    guard_timer: TimerHandle,
    /// Toggle bit of the node-guarding response.
    guard_toggle: bool,
    /// Life guarding raised an event that has not been resolved yet.
    life_guard_lost: bool,
    active: bool,
}

/// Events surfaced by the slave service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveEvent {
    /// Life guarding expired: the master stopped polling.
    LifeGuardOccurred,
    /// A guarding poll arrived after a loss.
    LifeGuardResolved,
}

impl NmtSlave {
    pub fn new(
        node_id: NodeId,
        recv: RecvHandle,
        ec_recv: RecvHandle,
        hb_timer: TimerHandle,
        guard_timer: TimerHandle,
    ) -> Self {
        Self {
            node_id,
            state: NmtState::Initialising,
            recv,
            ec_recv,
            hb_timer,
            guard_timer,
            guard_toggle: false,
            life_guard_lost: false,
            active: false,
        }
    }

    pub fn state(&self) -> NmtState {
        self.state
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn set_node_id(&mut self, node_id: NodeId) {
        self.node_id = node_id;
    }

    /// Finishes initialisation: emits the boot-up frame, starts listening
    /// for commands and guarding polls, starts heartbeat production, and
    /// enters pre-operational.
    pub fn boot<T: Copy>(&mut self, net: &mut CanNet<T>, od: &ObjectDictionary) -> NmtTransition {
        self.active = true;
        net.recv_start(self.recv, COB_ID_NMT, false);
        if !self.node_id.is_unconfigured() {
            let ec_cob = COB_ID_EC_BASE + u32::from(self.node_id.raw());
            net.recv_start(self.ec_recv, ec_cob, false);
            if let Ok(frame) = CanFrame::new(ec_cob, &[NmtState::Initialising.to_u8()]) {
                let _ = net.send(&frame);
            }
        }
        self.guard_toggle = false;
        self.life_guard_lost = false;
        self.restart_heartbeat(net, od);
        self.state = NmtState::PreOperational;
        info!("[NMT] node {} booted into pre-operational", self.node_id);
        NmtTransition::Entered(NmtState::PreOperational)
    }

    pub fn stop_service<T: Copy>(&mut self, net: &mut CanNet<T>) {
        net.recv_stop(self.recv);
        net.recv_stop(self.ec_recv);
        net.timer_stop(self.hb_timer);
        net.timer_stop(self.guard_timer);
        self.active = false;
    }

    /// (Re)arms heartbeat production per object 0x1017. A producer time of
    /// zero disables the heartbeat (node guarding applies instead).
    pub fn restart_heartbeat<T: Copy>(&mut self, net: &mut CanNet<T>, od: &ObjectDictionary) {
        net.timer_stop(self.hb_timer);
        let hb_ms = od.read_u16(0x1017, 0).unwrap_or(0);
        if hb_ms > 0 {
            let period = u64::from(hb_ms) * 1000;
            net.timer_start(self.hb_timer, net.time().saturating_add(period), Some(period));
        }
    }

    /// Applies an NMT command addressed to this node (target 0 or own ID).
    /// Invalid or inapplicable commands are no-ops.
    pub fn apply_command(&mut self, command: NmtCommand) -> NmtTransition {
        let next = match (self.state, command) {
            (_, NmtCommand::ResetNode) => return NmtTransition::ResetApplication,
            (_, NmtCommand::ResetCommunication) => return NmtTransition::ResetCommunication,
            (s, NmtCommand::Start) if s != NmtState::Operational => NmtState::Operational,
            (s, NmtCommand::Stop) if s != NmtState::Stopped => NmtState::Stopped,
            (s, NmtCommand::EnterPreOperational) if s != NmtState::PreOperational => {
                NmtState::PreOperational
            }
            _ => return NmtTransition::None,
        };
        trace!("[NMT] {:?} -> {:?} ({:?})", self.state, next, command);
        self.state = next;
        NmtTransition::Entered(next)
    }

    /// Processes a frame on the NMT command COB-ID.
    pub fn on_command_frame(&mut self, frame: &CanFrame) -> NmtTransition {
        if !self.active || frame.is_rtr() || frame.len() < 2 {
            return NmtTransition::None;
        }
        let data = frame.data();
        let Ok(command) = NmtCommand::try_from(data[0]) else {
            return NmtTransition::None;
        };
        let target = data[1];
        if target != 0 && target != self.node_id.raw() {
            return NmtTransition::None;
        }
        self.apply_command(command)
    }

    /// Processes a frame on this node's error-control COB-ID: answers
    /// node-guarding RTR polls and feeds the life-guarding timer.
    pub fn on_ec_frame<T: Copy>(
        &mut self,
        frame: &CanFrame,
        net: &mut CanNet<T>,
        od: &ObjectDictionary,
    ) -> Option<SlaveEvent> {
        if !self.active || !frame.is_rtr() {
            return None;
        }
        let byte = self.state.to_u8() | if self.guard_toggle { 0x80 } else { 0x00 };
        self.guard_toggle = !self.guard_toggle;
        let ec_cob = COB_ID_EC_BASE + u32::from(self.node_id.raw());
        if let Ok(response) = CanFrame::new(ec_cob, &[byte]) {
            let _ = net.send(&response);
        }
        // Life guarding: expect the next poll within guard time x life time
        // factor.
        let guard_ms = od.read_u16(0x100C, 0).unwrap_or(0);
        let factor = od.read_u8(0x100D, 0).unwrap_or(0);
        let resolved = self.life_guard_lost;
        self.life_guard_lost = false;
        if guard_ms > 0 && factor > 0 {
            let life_us = u64::from(guard_ms) * 1000 * u64::from(factor);
            net.timer_after(self.guard_timer, life_us);
        }
        resolved.then_some(SlaveEvent::LifeGuardResolved)
    }

    /// Heartbeat production timer fired.
    pub fn on_heartbeat_timer<T: Copy>(&mut self, net: &mut CanNet<T>) {
        if !self.active || self.node_id.is_unconfigured() {
            return;
        }
        let ec_cob = COB_ID_EC_BASE + u32::from(self.node_id.raw());
        if let Ok(frame) = CanFrame::new(ec_cob, &[self.state.to_u8()]) {
            let _ = net.send(&frame);
        }
    }

    /// Life-guarding timer fired: the master stopped polling.
    pub fn on_guard_timeout(&mut self) -> Option<SlaveEvent> {
        if !self.active || self.life_guard_lost {
            return None;
        }
        warn!("[NMT] life guarding event on node {}", self.node_id);
        self.life_guard_lost = true;
        Some(SlaveEvent::LifeGuardOccurred)
    }
}

/// An error-control event observed by a heartbeat consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HbEvent {
    /// The heartbeat of the node expired.
    Occurred { node: NodeId },
    /// A heartbeat arrived after a loss.
    Resolved { node: NodeId },
    /// The node announced a state (report-only indication).
    StateChange { node: NodeId, state: NmtState },
    /// The node announced boot-up.
    Bootup { node: NodeId },
}

/// One consumer heartbeat entry (object 0x1016).
pub struct HbConsumerEntry {
    pub node: NodeId,
    /// Consumer heartbeat time, microseconds.
    period_us: u64,
    state: Option<NmtState>,
    lost: bool,
    pub recv: RecvHandle,
    pub timer: TimerHandle,
}

impl HbConsumerEntry {
    /// Builds an entry from a 0x1016 sub-object value
    /// (`node-ID << 16 | heartbeat time in ms`).
    pub fn from_entry(raw: u32, recv: RecvHandle, timer: TimerHandle) -> Option<Self> {
        let node = NodeId::try_from(((raw >> 16) & 0xFF) as u8).ok()?;
        let time_ms = raw & 0xFFFF;
        if time_ms == 0 {
            return None;
        }
        Some(Self {
            node,
            period_us: u64::from(time_ms) * 1000,
            state: None,
            lost: false,
            recv,
            timer,
        })
    }

    /// Starts monitoring. The timer is first armed on the first received
    /// heartbeat, per CiA 301.
    pub fn start<T: Copy>(&mut self, net: &mut CanNet<T>) {
        let cob = COB_ID_EC_BASE + u32::from(self.node.raw());
        net.recv_start(self.recv, cob, false);
    }

    pub fn stop<T: Copy>(&mut self, net: &mut CanNet<T>) {
        net.recv_stop(self.recv);
        net.timer_stop(self.timer);
        self.state = None;
        self.lost = false;
    }

    /// The monitored node's state, as last announced.
    pub fn last_state(&self) -> Option<NmtState> {
        self.state
    }

    /// Processes an error-control frame of the monitored node.
    pub fn on_frame<T: Copy>(&mut self, frame: &CanFrame, net: &mut CanNet<T>) -> Vec<HbEvent> {
        let mut events = Vec::new();
        if frame.is_rtr() || frame.is_empty() {
            return events;
        }
        let Some(state) = NmtState::from_u8(frame.data()[0]) else {
            return events;
        };
        net.timer_after(self.timer, self.period_us);
        if self.lost {
            self.lost = false;
            events.push(HbEvent::Resolved { node: self.node });
        }
        if state == NmtState::Initialising {
            events.push(HbEvent::Bootup { node: self.node });
            self.state = Some(state);
            return events;
        }
        if self.state != Some(state) {
            events.push(HbEvent::StateChange {
                node: self.node,
                state,
            });
        }
        self.state = Some(state);
        events
    }

    /// The consumer timer expired without a heartbeat.
    pub fn on_timeout(&mut self) -> Option<HbEvent> {
        if self.lost {
            return None;
        }
        self.lost = true;
        Some(HbEvent::Occurred { node: self.node })
    }
}
