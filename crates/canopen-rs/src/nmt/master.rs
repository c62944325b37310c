//! The NMT master: tracks every assigned slave, runs error control against
//! it (node guarding or heartbeat consumption), boots it and dispatches NMT
//! commands. (Reference: CiA 302-2)

use super::boot::{BootOutcome, BootSlave};
use super::cfg::{BOOTUP_TIMEOUT_US, CfgOutcome, CfgRequest};
use super::{HbEvent, NmtCommand, NmtState};
use crate::frame::CanFrame;
use crate::net::{CanNet, RecvHandle, TimerHandle};
use crate::od::ObjectDictionary;
use crate::sdo::{SdoAbort, SdoClient, SdoConfirm};
use crate::types::{COB_ID_EC_BASE, COB_ID_NMT, NodeId};
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use log::{info, warn};

/// Bits of the NMT startup object (0x1F80).
pub mod startup {
    /// The device is the NMT master.
    pub const MASTER: u32 = 1 << 0;
    /// Start all slaves with one broadcast after boot-up.
    pub const START_ALL: u32 = 1 << 1;
    /// Do not switch to operational automatically.
    pub const NO_AUTOSTART_SELF: u32 = 1 << 2;
    /// The application starts the slaves; the master does not.
    pub const NO_START_SLAVES: u32 = 1 << 3;
}

/// Bits of a slave assignment entry (object 0x1F81).
pub mod assignment {
    /// The node is a slave of this master.
    pub const SLAVE: u32 = 1 << 0;
    /// Boot the slave at master start-up.
    pub const BOOT: u32 = 1 << 2;
    /// The slave is mandatory for network operation.
    pub const MANDATORY: u32 = 1 << 3;
    /// Keep the slave alive: never reset it on error-control events.
    pub const KEEP_ALIVE: u32 = 1 << 4;
    /// Reset the slave before a configuration request.
    pub const FORCE_RESET: u32 = 1 << 7;
}

/// Observable outcomes of the master's work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterEvent {
    /// A boot-slave process finished. `status` is `None` on success, or the
    /// CiA 302-2 error status letter.
    BootCompleted {
        node: NodeId,
        status: Option<char>,
    },
    /// A configuration request finished.
    CfgCompleted {
        node: NodeId,
        result: Result<(), SdoAbort>,
    },
    /// A configuration request reached its user-defined step; the
    /// application resumes it with a continuation call.
    CfgUserStep { node: NodeId },
    /// Node guarding lost the slave.
    GuardOccurred { node: NodeId },
    /// Node guarding regained the slave.
    GuardResolved { node: NodeId },
    /// A guarded or heartbeat-monitored slave announced a new state.
    SlaveStateChange { node: NodeId, state: NmtState },
}

/// Node-guarding state of one guarded slave.
struct GuardRecord {
    recv: RecvHandle,
    timer: TimerHandle,
    expect_toggle: bool,
    /// Polls sent since the last response.
    outstanding: u8,
    lost: bool,
}

/// The master's record of one assigned slave (object 0x1F81 semantics).
pub struct SlaveRecord {
    pub node: NodeId,
    pub assignment: u32,
    pub state: Option<NmtState>,
    pub bootup_seen: bool,
    /// The boot-slave process completed without an error status.
    pub booted: bool,
    guard: Option<GuardRecord>,
}

impl SlaveRecord {
    pub fn is_mandatory(&self) -> bool {
        self.assignment & assignment::MANDATORY != 0
    }
}

/// The NMT master service.
pub struct NmtMaster {
    own_id: NodeId,
    startup: u32,
    slaves: Vec<SlaveRecord>,
    /// Guard poll period and lifetime, shared by all guarded slaves.
    guard_period_us: u64,
    life_factor: u8,
    boot_queue: VecDeque<NodeId>,
    active_boot: Option<BootSlave>,
    active_cfg: Option<CfgRequest>,
    /// Slaves awaiting the global start broadcast.
    pending_start: Vec<NodeId>,
    /// Timer guarding the wait for a slave's boot-up during configuration.
    bootup_timer: TimerHandle,
    events: Vec<MasterEvent>,
    active: bool,
}

impl NmtMaster {
    pub fn new(own_id: NodeId, bootup_timer: TimerHandle) -> Self {
        Self {
            own_id,
            startup: 0,
            slaves: Vec::new(),
            guard_period_us: 0,
            life_factor: 0,
            boot_queue: VecDeque::new(),
            active_boot: None,
            active_cfg: None,
            pending_start: Vec::new(),
            bootup_timer,
            events: Vec::new(),
            active: false,
        }
    }

    /// Reads the master configuration (objects 0x1F80 and 0x1F81) and
    /// rebuilds the slave records. Returns `false` if the startup object
    /// does not flag this device as the master.
    pub fn configure(&mut self, od: &ObjectDictionary) -> bool {
        self.startup = od.read_u32(0x1F80, 0).unwrap_or(0);
        if self.startup & startup::MASTER == 0 {
            return false;
        }
        self.guard_period_us = u64::from(od.read_u16(0x100C, 0).unwrap_or(0)) * 1000;
        self.life_factor = od.read_u8(0x100D, 0).unwrap_or(0);
        self.slaves.clear();
        if let Ok(obj) = od.object(0x1F81) {
            for sub in obj.subs() {
                if sub.sub_index() == 0 || usize::from(sub.sub_index()) > 127 {
                    continue;
                }
                let Some(raw) = sub.value().as_u32() else {
                    continue;
                };
                if raw & assignment::SLAVE == 0 {
                    continue;
                }
                let Ok(node) = NodeId::try_from(sub.sub_index()) else {
                    continue;
                };
                if node == self.own_id {
                    continue;
                }
                self.slaves.push(SlaveRecord {
                    node,
                    assignment: raw,
                    state: None,
                    bootup_seen: false,
                    booted: false,
                    guard: None,
                });
            }
        }
        true
    }

    /// The slaves whose error-control COB-ID the master must watch itself
    /// (no heartbeat-consumer entry covers them). The node creates the
    /// receiver/timer pair for each and hands them over via
    /// [`NmtMaster::attach_guard`]. Guarding polls only run when objects
    /// 0x100C/0x100D configure them; the receiver also observes boot-up
    /// frames and announced states.
    pub fn monitored_nodes(&self, hb_nodes: &[NodeId]) -> Vec<NodeId> {
        self.slaves
            .iter()
            .filter(|s| !hb_nodes.contains(&s.node))
            .map(|s| s.node)
            .collect()
    }

    pub fn attach_guard(&mut self, node: NodeId, recv: RecvHandle, timer: TimerHandle) {
        if let Some(slave) = self.slaves.iter_mut().find(|s| s.node == node) {
            slave.guard = Some(GuardRecord {
                recv,
                timer,
                expect_toggle: false,
                outstanding: 0,
                lost: false,
            });
        }
    }

    /// Activates the master: starts guarding and queues the boot-slave
    /// processes for every slave assigned for boot-up.
    pub fn start<T: Copy>(&mut self, net: &mut CanNet<T>, csdo: &mut SdoClient) {
        self.active = true;
        self.pending_start.clear();
        let guarding = self.guard_period_us > 0 && self.life_factor > 0;
        for slave in &mut self.slaves {
            if let Some(guard) = &mut slave.guard {
                let cob = COB_ID_EC_BASE + u32::from(slave.node.raw());
                net.recv_start(guard.recv, cob, false);
                if guarding {
                    net.timer_start(
                        guard.timer,
                        net.time().saturating_add(self.guard_period_us),
                        Some(self.guard_period_us),
                    );
                }
                guard.expect_toggle = false;
                guard.outstanding = 0;
                guard.lost = false;
            }
            if slave.assignment & assignment::BOOT != 0 {
                self.boot_queue.push_back(slave.node);
            }
        }
        self.kick_boot_queue(net, csdo);
    }

    pub fn stop<T: Copy>(&mut self, net: &mut CanNet<T>) {
        for slave in &mut self.slaves {
            // Guard records are recreated on the next start.
            if let Some(guard) = slave.guard.take() {
                net.recv_destroy(guard.recv);
                net.timer_destroy(guard.timer);
            }
        }
        net.timer_stop(self.bootup_timer);
        self.boot_queue.clear();
        self.active_boot = None;
        self.active_cfg = None;
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Whether this device starts itself (enters operational) without an
    /// application request.
    pub fn autostart_self(&self) -> bool {
        self.startup & startup::NO_AUTOSTART_SELF == 0
    }

    pub fn slaves(&self) -> &[SlaveRecord] {
        &self.slaves
    }

    pub fn take_events(&mut self) -> Vec<MasterEvent> {
        core::mem::take(&mut self.events)
    }

    /// Transmits an NMT command. `node` of `None` addresses all nodes.
    pub fn command<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        command: NmtCommand,
        node: Option<NodeId>,
    ) {
        let target = node.map(|n| n.raw()).unwrap_or(0);
        if let Ok(frame) = CanFrame::new(COB_ID_NMT, &[command as u8, target]) {
            let _ = net.send(&frame);
        }
        // Track the expected state of addressed slaves; error control
        // confirms it eventually.
        let expected = match command {
            NmtCommand::Start => Some(NmtState::Operational),
            NmtCommand::Stop => Some(NmtState::Stopped),
            NmtCommand::EnterPreOperational => Some(NmtState::PreOperational),
            NmtCommand::ResetNode | NmtCommand::ResetCommunication => None,
        };
        for slave in &mut self.slaves {
            if target == 0 || slave.node.raw() == target {
                slave.state = expected;
            }
        }
    }

    /// Requests the boot-slave process for one slave.
    pub fn boot_slave<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        csdo: &mut SdoClient,
        node: NodeId,
    ) {
        if self.slaves.iter().all(|s| s.node != node) {
            // Not in the network list: status 'A' per CiA 302-2.
            self.events.push(MasterEvent::BootCompleted {
                node,
                status: Some('A'),
            });
            return;
        }
        if !self.boot_queue.contains(&node) {
            self.boot_queue.push_back(node);
        }
        self.kick_boot_queue(net, csdo);
    }

    /// Routes an SDO confirmation of the master's client into the active
    /// boot or configuration process.
    pub fn on_sdo_confirm<T: Copy>(
        &mut self,
        confirm: &SdoConfirm,
        net: &mut CanNet<T>,
        csdo: &mut SdoClient,
        od: &ObjectDictionary,
    ) {
        if let Some(mut boot) = self.active_boot.take() {
            match boot.on_confirm(confirm, net, csdo, od) {
                BootOutcome::Pending => self.active_boot = Some(boot),
                BootOutcome::IdentityOk => self.enter_cfg_phase(boot.node(), net, csdo),
                BootOutcome::Failed(status) => {
                    self.finish_boot(net, csdo, boot.node(), Some(status))
                }
            }
            return;
        }
        if let Some(mut cfg) = self.active_cfg.take() {
            let node = cfg.node();
            match cfg.on_confirm(confirm, net, csdo, od) {
                CfgOutcome::Pending => self.active_cfg = Some(cfg),
                CfgOutcome::ResetSlave => {
                    self.active_cfg = Some(cfg);
                    self.reset_for_cfg(net, node);
                }
                CfgOutcome::UserStep => {
                    self.active_cfg = Some(cfg);
                    self.events.push(MasterEvent::CfgUserStep { node });
                }
                CfgOutcome::Done => self.finish_cfg(net, csdo, node, Ok(())),
                CfgOutcome::Failed(code) => self.finish_cfg(net, csdo, node, Err(code)),
            }
        }
    }

    /// Routes a heartbeat-consumer event into the slave records and the
    /// active configuration process.
    pub fn on_hb_event<T: Copy>(
        &mut self,
        event: &HbEvent,
        net: &mut CanNet<T>,
        csdo: &mut SdoClient,
        od: &ObjectDictionary,
    ) {
        match event {
            HbEvent::Bootup { node } => {
                if let Some(slave) = self.slaves.iter_mut().find(|s| s.node == *node) {
                    slave.bootup_seen = true;
                    slave.state = Some(NmtState::Initialising);
                }
                self.on_bootup(*node, net, csdo, od);
            }
            HbEvent::StateChange { node, state } => {
                if let Some(slave) = self.slaves.iter_mut().find(|s| s.node == *node) {
                    slave.state = Some(*state);
                }
                self.events.push(MasterEvent::SlaveStateChange {
                    node: *node,
                    state: *state,
                });
            }
            HbEvent::Occurred { .. } | HbEvent::Resolved { .. } => {}
        }
    }

    /// A boot-up frame of `node` was observed (via heartbeat consumer or
    /// guard receiver).
    pub fn on_bootup<T: Copy>(
        &mut self,
        node: NodeId,
        net: &mut CanNet<T>,
        csdo: &mut SdoClient,
        od: &ObjectDictionary,
    ) {
        if let Some(mut cfg) = self.active_cfg.take() {
            if cfg.node() == node {
                net.timer_stop(self.bootup_timer);
                match cfg.on_bootup(net, csdo, od) {
                    CfgOutcome::Pending => self.active_cfg = Some(cfg),
                    CfgOutcome::UserStep => {
                        self.active_cfg = Some(cfg);
                        self.events.push(MasterEvent::CfgUserStep { node });
                    }
                    CfgOutcome::Done => self.finish_cfg(net, csdo, node, Ok(())),
                    CfgOutcome::Failed(code) => self.finish_cfg(net, csdo, node, Err(code)),
                    CfgOutcome::ResetSlave => self.active_cfg = Some(cfg),
                }
                return;
            }
            self.active_cfg = Some(cfg);
        }
    }

    /// The boot-up wait of the configuration process expired.
    pub fn on_bootup_timeout<T: Copy>(&mut self, net: &mut CanNet<T>, csdo: &mut SdoClient) {
        if let Some(mut cfg) = self.active_cfg.take() {
            let node = cfg.node();
            match cfg.on_bootup_timeout() {
                CfgOutcome::Failed(code) => self.finish_cfg(net, csdo, node, Err(code)),
                _ => self.active_cfg = Some(cfg),
            }
        }
    }

    /// Node-guarding poll timer of `node` fired.
    pub fn on_guard_timer<T: Copy>(&mut self, node: NodeId, net: &mut CanNet<T>) {
        let life_factor = self.life_factor;
        let Some(slave) = self.slaves.iter_mut().find(|s| s.node == node) else {
            return;
        };
        let Some(guard) = &mut slave.guard else {
            return;
        };
        if guard.outstanding >= life_factor && !guard.lost {
            guard.lost = true;
            warn!("[NMT] node guarding lost slave {}", node);
            self.events.push(MasterEvent::GuardOccurred { node });
        } else {
            guard.outstanding = guard.outstanding.saturating_add(1);
        }
        let _ = net.send(&CanFrame::rtr(COB_ID_EC_BASE + u32::from(node.raw()), 1).unwrap());
    }

    /// A frame arrived on the error-control COB-ID of a guarded slave.
    pub fn on_guard_frame<T: Copy>(
        &mut self,
        node: NodeId,
        frame: &CanFrame,
        net: &mut CanNet<T>,
        csdo: &mut SdoClient,
        od: &ObjectDictionary,
    ) {
        if frame.is_rtr() || frame.is_empty() {
            return;
        }
        let byte = frame.data()[0];
        let Some(state) = NmtState::from_u8(byte) else {
            return;
        };
        if state == NmtState::Initialising {
            if let Some(slave) = self.slaves.iter_mut().find(|s| s.node == node) {
                slave.bootup_seen = true;
                slave.state = Some(state);
            }
            self.on_bootup(node, net, csdo, od);
            return;
        }
        let Some(slave) = self.slaves.iter_mut().find(|s| s.node == node) else {
            return;
        };
        let Some(guard) = &mut slave.guard else {
            return;
        };
        let toggle = byte & 0x80 != 0;
        if toggle != guard.expect_toggle {
            // A toggle mismatch counts as a missed response.
            return;
        }
        guard.expect_toggle = !guard.expect_toggle;
        guard.outstanding = 0;
        if guard.lost {
            guard.lost = false;
            self.events.push(MasterEvent::GuardResolved { node });
        }
        if slave.state != Some(state) {
            slave.state = Some(state);
            self.events.push(MasterEvent::SlaveStateChange { node, state });
        }
    }

    /// The application's continuation after a user-defined configuration
    /// step.
    pub fn cfg_continue<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        csdo: &mut SdoClient,
        result: Result<(), SdoAbort>,
    ) {
        if let Some(mut cfg) = self.active_cfg.take() {
            let node = cfg.node();
            match cfg.continue_user_step(result) {
                CfgOutcome::Done => self.finish_cfg(net, csdo, node, Ok(())),
                CfgOutcome::Failed(code) => self.finish_cfg(net, csdo, node, Err(code)),
                _ => self.active_cfg = Some(cfg),
            }
        }
    }

    // --- Internal orchestration ---

    fn kick_boot_queue<T: Copy>(&mut self, net: &mut CanNet<T>, csdo: &mut SdoClient) {
        if self.active_boot.is_some() || self.active_cfg.is_some() {
            return;
        }
        let Some(node) = self.boot_queue.pop_front() else {
            return;
        };
        let mut boot = BootSlave::new(node);
        match boot.begin(net, csdo) {
            Ok(()) => self.active_boot = Some(boot),
            Err(_) => self.finish_boot(net, csdo, node, Some('B')),
        }
    }

    fn enter_cfg_phase<T: Copy>(
        &mut self,
        node: NodeId,
        net: &mut CanNet<T>,
        csdo: &mut SdoClient,
    ) {
        self.active_boot = None;
        let assignment = self
            .slaves
            .iter()
            .find(|s| s.node == node)
            .map(|s| s.assignment)
            .unwrap_or(0);
        // Reset-before-configure is forced by bit 7 of the assignment.
        let restore_sub = if assignment & assignment::FORCE_RESET != 0 {
            1
        } else {
            0
        };
        let mut cfg = CfgRequest::new(node, restore_sub, false);
        match cfg.begin(net, csdo) {
            CfgOutcome::Pending => self.active_cfg = Some(cfg),
            CfgOutcome::ResetSlave => {
                self.active_cfg = Some(cfg);
                self.reset_for_cfg(net, node);
            }
            CfgOutcome::Done => self.finish_cfg(net, csdo, node, Ok(())),
            CfgOutcome::Failed(code) => self.finish_cfg(net, csdo, node, Err(code)),
            CfgOutcome::UserStep => self.active_cfg = Some(cfg),
        }
    }

    fn reset_for_cfg<T: Copy>(&mut self, net: &mut CanNet<T>, node: NodeId) {
        self.command(net, NmtCommand::ResetNode, Some(node));
        net.timer_after(self.bootup_timer, BOOTUP_TIMEOUT_US);
    }

    fn finish_cfg<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        csdo: &mut SdoClient,
        node: NodeId,
        result: Result<(), SdoAbort>,
    ) {
        self.active_cfg = None;
        net.timer_stop(self.bootup_timer);
        self.events.push(MasterEvent::CfgCompleted {
            node,
            result: result.clone(),
        });
        match result {
            Ok(()) => self.finish_boot(net, csdo, node, None),
            Err(_) => self.finish_boot(net, csdo, node, Some('J')),
        }
    }

    fn finish_boot<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        csdo: &mut SdoClient,
        node: NodeId,
        status: Option<char>,
    ) {
        self.active_boot = None;
        if let Some(slave) = self.slaves.iter_mut().find(|s| s.node == node) {
            slave.booted = status.is_none();
        }
        self.events.push(MasterEvent::BootCompleted { node, status });
        if status.is_none() {
            info!("[NMT] slave {} booted successfully", node);
            self.start_slave(net, node);
        } else {
            warn!(
                "[NMT] boot of slave {} failed with status {}",
                node,
                status.unwrap_or('?')
            );
        }
        self.kick_boot_queue(net, csdo);
    }

    /// Starts a successfully booted slave, honoring the start-up object.
    fn start_slave<T: Copy>(&mut self, net: &mut CanNet<T>, node: NodeId) {
        if self.startup & startup::NO_START_SLAVES != 0 {
            return;
        }
        if self.startup & startup::START_ALL != 0 {
            self.pending_start.push(node);
            // The broadcast goes out once every queued boot finished.
            let boots_pending = self.active_boot.is_some() || !self.boot_queue.is_empty();
            if !boots_pending {
                self.pending_start.clear();
                self.command(net, NmtCommand::Start, None);
            }
        } else {
            self.command(net, NmtCommand::Start, Some(node));
        }
    }
}
