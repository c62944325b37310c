//! The CANopen node: owns the network binding, the object dictionary and
//! every protocol service, and dispatches received frames and timer expiry
//! among them on a single logical thread.

use crate::emcy::{EmcyMessage, EmcyService, EmcyWatcher, codes, parse_emcy};
use crate::frame::{BusErrorFlags, BusErrorFrame, BusState, CanFrame};
use crate::lss::{LssAddress, LssMaster, LssMasterEvent, LssMode, LssSlave, LssSlaveEvent};
use crate::net::{CanNet, SendFn};
use crate::nmt::master::MasterEvent;
use crate::nmt::{
    HbConsumerEntry, HbEvent, NmtCommand, NmtMaster, NmtSlave, NmtState, NmtTransition, SlaveEvent,
};
use crate::od::ObjectDictionary;
use crate::pdo::{PDO_COUNT, PdoError, Rpdo, Tpdo, mapping_write_guard};
use crate::sdo::{SdoAbort, SdoClient, SdoClientRequest, SdoConfirm, SdoServer};
use crate::sync::{SyncEvent, SyncService};
use crate::time::TimeService;
use crate::types::{COB_ID_EMCY_BASE, NodeId};
use crate::value::{TimeOfDay, Value};
use crate::CanOpenError;
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use log::{info, warn};

/// Identifies the service owning a receiver or timer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceId {
    /// NMT command receiver (COB-ID 0x000).
    NmtCommand,
    /// Own error-control COB-ID (guarding RTR).
    NmtErrorControl,
    /// Heartbeat production timer.
    NmtHeartbeat,
    /// Life-guarding timer.
    NmtLifeGuard,
    /// Heartbeat consumer entry (receiver and timer).
    HbConsumer(u8),
    /// Master-side node guarding of a slave (receiver and poll timer).
    Guard(NodeId),
    /// Boot-up wait of the master's configuration process.
    BootupWait,
    /// SDO server channel (receiver and timeout timer).
    Ssdo(u8),
    /// SDO client channel (receiver and timeout timer).
    Csdo(u8),
    /// The master's internal SDO client.
    MasterCsdo,
    /// SYNC (receiver for consumers, period timer for the producer).
    Sync,
    /// TIME (receiver and production timer).
    Time,
    /// EMCY producer inhibit timer.
    EmcyInhibit,
    /// EMCY consumer of a monitored peer.
    EmcyMonitor(u8),
    /// RPDO channel receiver.
    Rpdo(u8),
    /// RPDO deadline monitor.
    RpdoDeadline(u8),
    /// TPDO inhibit re-arm timer.
    TpdoInhibit(u8),
    /// TPDO event (idle) timer.
    TpdoEvent(u8),
    /// LSS (master and slave share the role-specific COB-IDs).
    Lss,
}

/// Observable occurrences, drained by the host with [`Node::take_events`].
/// Every asynchronous request produces exactly one completion event.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// The local NMT state changed.
    NmtState(NmtState),
    /// An SDO client request completed.
    SdoConfirm(SdoConfirm),
    /// A SYNC pulse was received or produced.
    Sync { counter: Option<u8> },
    /// A SYNC frame with an inconsistent length was received.
    SyncError,
    /// A TIME stamp was received.
    Time(TimeOfDay),
    /// An emergency message of a monitored peer was received.
    Emcy(EmcyMessage),
    /// A heartbeat-consumer event (occurrence, resolution, state change or
    /// boot-up of the monitored node).
    Heartbeat(HbEvent),
    /// Life guarding on this (slave) node fired or resolved.
    LifeGuard { occurred: bool },
    /// An RPDO wrote the given dictionary entries.
    PdoReceived { num: u8, entries: Vec<(u16, u8)> },
    /// A PDO-shape error occurred.
    PdoError { num: u8, error: PdoError },
    /// A TPDO was transmitted.
    TpdoSent { num: u8 },
    /// An NMT master event (boot result, configuration result, guarding).
    Master(MasterEvent),
    /// An LSS master operation completed.
    LssMaster(LssMasterEvent),
    /// The LSS slave role signalled a configuration change.
    LssSlave(LssSlaveEvent),
    /// The CAN controller state changed.
    BusState(BusState),
    /// A bus error was reported by the controller.
    BusError(BusErrorFlags),
}

/// A CANopen node (master or slave), bound to one CAN network.
pub struct Node {
    net: CanNet<ServiceId>,
    od: ObjectDictionary,
    nmt: NmtSlave,
    master: Option<NmtMaster>,
    master_csdo: Option<SdoClient>,
    ssdo: Vec<SdoServer>,
    csdo: Vec<SdoClient>,
    sync: SyncService,
    time: TimeService,
    emcy: EmcyService,
    emcy_watch: Vec<EmcyWatcher>,
    hb_entries: Vec<HbConsumerEntry>,
    rpdo: Vec<Rpdo>,
    tpdo: Vec<Tpdo>,
    lss_master: Option<LssMaster>,
    lss_slave: Option<LssSlave>,
    events: VecDeque<NodeEvent>,
    /// Whether the communication services (SDO, SYNC, TIME, EMCY) are
    /// running; they stop in the stopped state.
    comm_active: bool,
    /// Counted suspension of TPDO event triggers.
    tpdo_lock: u32,
    /// TPDO numbers with triggers deferred by the lock.
    tpdo_deferred: Vec<u8>,
    bus_state: BusState,
}

impl Node {
    /// Creates a node around a populated object dictionary.
    ///
    /// The dictionary must already contain the device's objects (from an EDS
    /// file or in-code definition). `node_id` may be
    /// [`NodeId::UNCONFIGURED`] for an LSS-configured device. The node comes
    /// up in pre-operational state with the boot-up frame emitted once a
    /// send hook is installed and [`Node::start`] is called.
    pub fn new(mut od: ObjectDictionary, node_id: NodeId) -> Result<Self, CanOpenError> {
        if !od.contains(0x1000) {
            return Err(CanOpenError::ValidationError("object 0x1000 is mandatory"));
        }
        if !od.contains(0x1018) {
            return Err(CanOpenError::ValidationError("object 0x1018 is mandatory"));
        }
        od.set_write_guard(mapping_write_guard);
        od.init()?;
        od.set_node_id(node_id);

        let mut net: CanNet<ServiceId> = CanNet::new();

        let nmt = NmtSlave::new(
            node_id,
            net.recv_create(ServiceId::NmtCommand),
            net.recv_create(ServiceId::NmtErrorControl),
            net.timer_create(ServiceId::NmtHeartbeat),
            net.timer_create(ServiceId::NmtLifeGuard),
        );

        // One SDO server per parameter record, at least the default channel.
        let mut ssdo = Vec::new();
        for num in 0..128u16 {
            if num > 0 && !od.contains(0x1200 + num) {
                break;
            }
            let recv = net.recv_create(ServiceId::Ssdo(num as u8));
            let timer = net.timer_create(ServiceId::Ssdo(num as u8));
            ssdo.push(SdoServer::new(num as u8, recv, timer));
        }
        let mut csdo = Vec::new();
        for num in 0..128u16 {
            if !od.contains(0x1280 + num) {
                break;
            }
            let recv = net.recv_create(ServiceId::Csdo(num as u8));
            let timer = net.timer_create(ServiceId::Csdo(num as u8));
            csdo.push(SdoClient::new(num as u8, recv, timer));
        }

        let sync = SyncService::new(
            net.recv_create(ServiceId::Sync),
            net.timer_create(ServiceId::Sync),
        );
        let time = TimeService::new(
            net.recv_create(ServiceId::Time),
            net.timer_create(ServiceId::Time),
        );
        let emcy = EmcyService::new(net.timer_create(ServiceId::EmcyInhibit));

        let mut rpdo = Vec::new();
        let mut tpdo = Vec::new();
        for num in 0..PDO_COUNT as u8 {
            rpdo.push(Rpdo::new(
                num,
                net.recv_create(ServiceId::Rpdo(num)),
                net.timer_create(ServiceId::RpdoDeadline(num)),
            ));
            tpdo.push(Tpdo::new(
                num,
                net.timer_create(ServiceId::TpdoInhibit(num)),
                net.timer_create(ServiceId::TpdoEvent(num)),
            ));
        }

        // The master role is enabled by bit 0 of the NMT startup object.
        let is_master = od.read_u32(0x1F80, 0).unwrap_or(0) & 0x01 != 0;
        let (master, master_csdo, lss_master) = if is_master {
            let bootup_timer = net.timer_create(ServiceId::BootupWait);
            let mut master = NmtMaster::new(node_id, bootup_timer);
            master.configure(&od);
            let recv = net.recv_create(ServiceId::MasterCsdo);
            let timer = net.timer_create(ServiceId::MasterCsdo);
            let lss = LssMaster::new(
                net.recv_create(ServiceId::Lss),
                net.timer_create(ServiceId::Lss),
            );
            (
                Some(master),
                Some(SdoClient::new(0, recv, timer)),
                Some(lss),
            )
        } else {
            (None, None, None)
        };

        // Every device with an identity object can act as an LSS slave.
        let lss_slave = if is_master {
            None
        } else {
            let address = LssAddress {
                vendor_id: od.read_u32(0x1018, 1).unwrap_or(0),
                product_code: od.read_u32(0x1018, 2).unwrap_or(0),
                revision: od.read_u32(0x1018, 3).unwrap_or(0),
                serial: od.read_u32(0x1018, 4).unwrap_or(0),
            };
            Some(LssSlave::new(
                address,
                node_id,
                net.recv_create(ServiceId::Lss),
            ))
        };

        Ok(Self {
            net,
            od,
            nmt,
            master,
            master_csdo,
            ssdo,
            csdo,
            sync,
            time,
            emcy,
            emcy_watch: Vec::new(),
            hb_entries: Vec::new(),
            rpdo,
            tpdo,
            lss_master,
            lss_slave,
            events: VecDeque::new(),
            comm_active: false,
            tpdo_lock: 0,
            tpdo_deferred: Vec::new(),
            bus_state: BusState::default(),
        })
    }

    // --- Driver surface ---

    /// Installs the driver's send hook.
    pub fn set_send_fn(&mut self, f: Box<SendFn>) {
        self.net.set_send_fn(f);
    }

    /// The deadline of the earliest pending timer, for the driver's sleep.
    pub fn next_deadline(&self) -> Option<u64> {
        self.net.next_deadline()
    }

    /// The current time of the node's clock, in microseconds.
    pub fn time(&self) -> u64 {
        self.net.time()
    }

    /// Boots the node: emits the boot-up frame, starts the services and
    /// enters pre-operational (then operational, for an autostarting
    /// master).
    pub fn start(&mut self) {
        self.reset_communication();
    }

    /// Advances the clock and runs every timer that became due, in deadline
    /// order.
    pub fn set_time(&mut self, now_us: u64) {
        self.net.set_time(now_us);
        while let Some(expired) = self.net.pop_expired() {
            self.dispatch_timer(expired.token);
        }
        self.post_dispatch();
    }

    /// Feeds one received frame into the matching services.
    pub fn recv(&mut self, frame: &CanFrame) {
        for handle in self.net.matches(frame) {
            // Re-validate: an earlier receiver may have stopped this one.
            if let Some(service) = self.net.recv_token(handle, frame) {
                self.dispatch_frame(service, frame);
            }
        }
        self.post_dispatch();
    }

    /// Feeds a controller state change reported by the driver.
    pub fn on_bus_state(&mut self, state: BusState) {
        if state == self.bus_state {
            return;
        }
        let previous = core::mem::replace(&mut self.bus_state, state);
        self.events.push_back(NodeEvent::BusState(state));
        match state {
            BusState::ErrorPassive => {
                self.emcy
                    .push_error(&mut self.net, &mut self.od, codes::ERROR_PASSIVE, [0; 5]);
            }
            BusState::ErrorActive => {
                if previous == BusState::BusOff {
                    self.emcy.push_error(
                        &mut self.net,
                        &mut self.od,
                        codes::BUS_OFF_RECOVERED,
                        [0; 5],
                    );
                }
                self.emcy
                    .clear_error(&mut self.net, &mut self.od, codes::ERROR_PASSIVE);
            }
            BusState::BusOff => warn!("[CAN] controller went bus off"),
        }
        self.post_dispatch();
    }

    /// Feeds a bus error frame reported by the driver.
    pub fn on_bus_error(&mut self, error: &BusErrorFrame) {
        self.events.push_back(NodeEvent::BusError(error.errors));
        self.on_bus_state(error.state);
    }

    /// Drains the events produced since the last call.
    pub fn take_events(&mut self) -> Vec<NodeEvent> {
        self.events.drain(..).collect()
    }

    // --- Host surface ---

    pub fn node_id(&self) -> NodeId {
        self.nmt.node_id()
    }

    /// The node-ID that takes effect at the next reset-communication.
    pub fn pending_node_id(&self) -> NodeId {
        self.lss_slave
            .as_ref()
            .map(|s| s.pending_node_id())
            .unwrap_or_else(|| self.nmt.node_id())
    }

    pub fn nmt_state(&self) -> NmtState {
        self.nmt.state()
    }

    pub fn dictionary(&self) -> &ObjectDictionary {
        &self.od
    }

    pub fn dictionary_mut(&mut self) -> &mut ObjectDictionary {
        &mut self.od
    }

    /// Reads a local dictionary entry.
    pub fn read(&self, index: u16, sub_index: u8) -> Result<&Value, CanOpenError> {
        self.od.read(index, sub_index)
    }

    /// Writes a local dictionary entry and re-applies any communication
    /// parameter it configures. TPDO events fire for mapped entries.
    pub fn write(&mut self, index: u16, sub_index: u8, value: Value) -> Result<(), CanOpenError> {
        self.od.write(index, sub_index, value)?;
        self.post_dispatch();
        Ok(())
    }

    /// Issues an NMT command, remotely and to the own state machine if
    /// addressed. Only masters may address other nodes.
    pub fn nmt_request(
        &mut self,
        command: NmtCommand,
        target: Option<NodeId>,
    ) -> Result<(), CanOpenError> {
        let own = self.nmt.node_id();
        let local = target.is_none() || target == Some(own);
        if let Some(master) = &mut self.master {
            master.command(&mut self.net, command, target);
        } else if !local {
            return Err(CanOpenError::NotReady);
        }
        if local {
            let transition = self.nmt.apply_command(command);
            self.apply_transition(transition);
        }
        self.post_dispatch();
        Ok(())
    }

    /// Submits an SDO client request on channel `num`.
    pub fn sdo_request(
        &mut self,
        num: usize,
        request: SdoClientRequest,
    ) -> Result<(), CanOpenError> {
        let client = self.csdo.get_mut(num).ok_or(CanOpenError::NotReady)?;
        client.submit(&mut self.net, request)?;
        Ok(())
    }

    /// Cancels the in-flight request of SDO client channel `num`; the
    /// confirmation fires with the given code.
    pub fn sdo_abort(&mut self, num: usize, code: SdoAbort) -> Result<(), CanOpenError> {
        let client = self.csdo.get_mut(num).ok_or(CanOpenError::NotReady)?;
        client.abort_request(&mut self.net, code);
        self.post_dispatch();
        Ok(())
    }

    /// Starts monitoring the EMCY output of a peer.
    pub fn emcy_watch(&mut self, node: NodeId) {
        let index = self.emcy_watch.len() as u8;
        let recv = self.net.recv_create(ServiceId::EmcyMonitor(index));
        self.net
            .recv_start(recv, COB_ID_EMCY_BASE + u32::from(node.raw()), false);
        self.emcy_watch.push(EmcyWatcher { node, recv });
    }

    /// Raises an emergency with the given error code.
    pub fn emcy_push(&mut self, code: u16, vendor: [u8; 5]) {
        self.emcy
            .push_error(&mut self.net, &mut self.od, code, vendor);
    }

    /// Clears a previously raised emergency.
    pub fn emcy_clear(&mut self, code: u16) {
        self.emcy.clear_error(&mut self.net, &mut self.od, code);
    }

    /// Transmits a TIME frame carrying `stamp`.
    pub fn time_produce(&mut self, stamp: TimeOfDay) {
        self.time.produce(&mut self.net, stamp);
    }

    /// Triggers the event-driven transmission of a TPDO explicitly.
    pub fn tpdo_event(&mut self, num: u8) {
        if self.nmt.state() != NmtState::Operational {
            return;
        }
        if self.tpdo_lock > 0 {
            if !self.tpdo_deferred.contains(&num) {
                self.tpdo_deferred.push(num);
            }
            return;
        }
        self.trigger_tpdo(num);
    }

    /// Suspends TPDO event triggers. Suspensions nest; every trigger
    /// arriving while locked collapses into one transmission per TPDO on
    /// the final unlock.
    pub fn tpdo_event_lock(&mut self) {
        self.tpdo_lock += 1;
    }

    pub fn tpdo_event_unlock(&mut self) {
        self.tpdo_lock = self.tpdo_lock.saturating_sub(1);
        if self.tpdo_lock == 0 {
            let deferred = core::mem::take(&mut self.tpdo_deferred);
            for num in deferred {
                self.trigger_tpdo(num);
            }
        }
    }

    /// Requests the boot-slave process for a remote node (master only).
    pub fn boot_slave(&mut self, node: NodeId) -> Result<(), CanOpenError> {
        let (Some(master), Some(csdo)) = (&mut self.master, &mut self.master_csdo) else {
            return Err(CanOpenError::NotReady);
        };
        master.boot_slave(&mut self.net, csdo, node);
        self.post_dispatch();
        Ok(())
    }

    /// Resumes a configuration request paused at its user-defined step.
    pub fn cfg_continue(&mut self, result: Result<(), SdoAbort>) -> Result<(), CanOpenError> {
        let (Some(master), Some(csdo)) = (&mut self.master, &mut self.master_csdo) else {
            return Err(CanOpenError::NotReady);
        };
        master.cfg_continue(&mut self.net, csdo, result);
        self.post_dispatch();
        Ok(())
    }

    // --- LSS master surface ---

    pub fn lss_switch_global(&mut self, mode: LssMode) -> Result<(), CanOpenError> {
        let lss = self.lss_master.as_mut().ok_or(CanOpenError::NotReady)?;
        lss.switch_global(&mut self.net, mode);
        Ok(())
    }

    pub fn lss_switch_selective(&mut self, address: &LssAddress) -> Result<(), CanOpenError> {
        let lss = self.lss_master.as_mut().ok_or(CanOpenError::NotReady)?;
        lss.switch_selective(&mut self.net, address);
        Ok(())
    }

    pub fn lss_configure_node_id(&mut self, node_id: NodeId) -> Result<(), CanOpenError> {
        let lss = self.lss_master.as_mut().ok_or(CanOpenError::NotReady)?;
        lss.configure_node_id(&mut self.net, node_id);
        Ok(())
    }

    pub fn lss_store_configuration(&mut self) -> Result<(), CanOpenError> {
        let lss = self.lss_master.as_mut().ok_or(CanOpenError::NotReady)?;
        lss.store_configuration(&mut self.net);
        Ok(())
    }

    pub fn lss_activate_bit_timing(&mut self, delay_ms: u16) -> Result<(), CanOpenError> {
        let lss = self.lss_master.as_mut().ok_or(CanOpenError::NotReady)?;
        lss.activate_bit_timing(&mut self.net, delay_ms);
        Ok(())
    }

    pub fn lss_slowscan(
        &mut self,
        lo: &LssAddress,
        hi: &LssAddress,
    ) -> Result<(), CanOpenError> {
        let lss = self.lss_master.as_mut().ok_or(CanOpenError::NotReady)?;
        lss.slowscan(&mut self.net, lo, hi);
        Ok(())
    }

    pub fn lss_fastscan(&mut self) -> Result<(), CanOpenError> {
        let lss = self.lss_master.as_mut().ok_or(CanOpenError::NotReady)?;
        lss.fastscan(&mut self.net);
        Ok(())
    }

    // --- Lifecycle ---

    /// Performs the reset-communication sequence: every service is torn
    /// down and recreated, the pending node-ID takes effect, and the node
    /// re-enters pre-operational via a fresh boot-up frame.
    pub fn reset_communication(&mut self) {
        self.stop_services();
        // The pending node-ID becomes current.
        if let Some(lss) = &mut self.lss_slave {
            let node_id = lss.apply_pending();
            self.nmt.set_node_id(node_id);
        }
        self.od.set_node_id(self.nmt.node_id());

        let transition = self.nmt.boot(&mut self.net, &self.od);
        self.apply_transition(transition);

        if let (Some(master), Some(csdo)) = (&mut self.master, &mut self.master_csdo) {
            master.configure(&self.od);
            let hb_nodes: Vec<NodeId> = self.hb_entries.iter().map(|e| e.node).collect();
            for node in master.monitored_nodes(&hb_nodes) {
                let recv = self.net.recv_create(ServiceId::Guard(node));
                let timer = self.net.timer_create(ServiceId::Guard(node));
                master.attach_guard(node, recv, timer);
            }
            master.start(&mut self.net, csdo);
            if master.autostart_self() {
                let transition = self.nmt.apply_command(NmtCommand::Start);
                self.apply_transition(transition);
            }
        }
        if let Some(lss) = &mut self.lss_master {
            lss.start(&mut self.net);
        }
        self.post_dispatch();
    }

    /// Performs the reset-application sequence: application parameters
    /// return to their defaults, then communication resets.
    pub fn reset_node(&mut self) {
        self.restore_application_defaults();
        self.reset_communication();
    }

    fn restore_application_defaults(&mut self) {
        // Manufacturer-specific and standardised device profile areas.
        self.od.restore_power_on_values(0x2000, 0x5FFF);
        self.od.restore_power_on_values(0x6000, 0x9FFF);
    }

    fn stop_services(&mut self) {
        self.nmt.stop_service(&mut self.net);
        for server in &mut self.ssdo {
            server.stop(&mut self.net);
        }
        for client in &mut self.csdo {
            client.stop(&mut self.net);
        }
        if let Some(csdo) = &mut self.master_csdo {
            csdo.stop(&mut self.net);
        }
        if let Some(master) = &mut self.master {
            master.stop(&mut self.net);
        }
        if let Some(lss) = &mut self.lss_master {
            lss.stop(&mut self.net);
        }
        if let Some(lss) = &mut self.lss_slave {
            lss.stop(&mut self.net);
        }
        self.sync.stop(&mut self.net);
        self.time.stop(&mut self.net);
        self.emcy.stop(&mut self.net);
        for entry in &mut self.hb_entries {
            entry.stop(&mut self.net);
            self.net.recv_destroy(entry.recv);
            self.net.timer_destroy(entry.timer);
        }
        self.hb_entries.clear();
        for pdo in &mut self.rpdo {
            pdo.stop(&mut self.net);
        }
        for pdo in &mut self.tpdo {
            pdo.stop(&mut self.net);
        }
        self.comm_active = false;
        // Pending confirmations complete with a device-state abort before
        // the services disappear.
        self.drain_confirms();
    }

    /// Starts and stops services according to the entered NMT state.
    fn apply_transition(&mut self, transition: NmtTransition) {
        match transition {
            NmtTransition::None => {}
            NmtTransition::Entered(state) => {
                self.apply_state(state);
                self.events.push_back(NodeEvent::NmtState(state));
            }
            NmtTransition::ResetApplication => {
                self.events
                    .push_back(NodeEvent::NmtState(NmtState::ResetApplication));
                self.reset_node();
            }
            NmtTransition::ResetCommunication => {
                self.events
                    .push_back(NodeEvent::NmtState(NmtState::ResetCommunication));
                self.reset_communication();
            }
        }
    }

    fn apply_state(&mut self, state: NmtState) {
        match state {
            NmtState::PreOperational => {
                info!("[NODE] entering pre-operational");
                self.start_comm_services();
                // PDOs neither transmit nor process outside operational.
                for pdo in &mut self.rpdo {
                    pdo.stop(&mut self.net);
                }
                for pdo in &mut self.tpdo {
                    pdo.stop(&mut self.net);
                }
            }
            NmtState::Operational => {
                info!("[NODE] entering operational");
                // A start command out of the stopped state revives the
                // communication services too.
                self.start_comm_services();
                let node_id = self.nmt.node_id();
                for pdo in &mut self.rpdo {
                    pdo.start(&mut self.net, &self.od, node_id);
                }
                for pdo in &mut self.tpdo {
                    pdo.start(&mut self.net, &self.od, node_id);
                }
            }
            NmtState::Stopped => {
                info!("[NODE] entering stopped");
                for server in &mut self.ssdo {
                    server.stop(&mut self.net);
                }
                for client in &mut self.csdo {
                    client.stop(&mut self.net);
                }
                self.sync.stop(&mut self.net);
                self.time.stop(&mut self.net);
                self.emcy.stop(&mut self.net);
                for pdo in &mut self.rpdo {
                    pdo.stop(&mut self.net);
                }
                for pdo in &mut self.tpdo {
                    pdo.stop(&mut self.net);
                }
                self.comm_active = false;
                // Error control (and the LSS slave) stay active in stopped.
            }
            _ => {}
        }
    }

    /// Starts the SDO, SYNC, TIME, EMCY and heartbeat-consumer services if
    /// they are not already running. Idempotent across the pre-operational
    /// to operational transition so in-flight SDO sessions survive it.
    fn start_comm_services(&mut self) {
        if self.comm_active {
            return;
        }
        let node_id = self.nmt.node_id();
        for server in &mut self.ssdo {
            server.start(&mut self.net, &self.od, node_id);
        }
        for client in &mut self.csdo {
            client.start(&mut self.net, &self.od);
        }
        self.sync.start(&mut self.net, &self.od);
        self.time.start(&mut self.net, &self.od);
        self.emcy.start(&mut self.net, &self.od, node_id);
        self.restart_hb_consumers();
        if let Some(lss) = &mut self.lss_slave {
            lss.start(&mut self.net);
        }
        self.comm_active = true;
    }

    fn restart_hb_consumers(&mut self) {
        for entry in &mut self.hb_entries {
            entry.stop(&mut self.net);
            self.net.recv_destroy(entry.recv);
            self.net.timer_destroy(entry.timer);
        }
        self.hb_entries.clear();
        let Ok(object) = self.od.object(0x1016) else {
            return;
        };
        let raws: Vec<u32> = object
            .subs()
            .filter(|s| s.sub_index() != 0)
            .filter_map(|s| s.value().as_u32())
            .collect();
        for raw in raws {
            let index = self.hb_entries.len() as u8;
            let recv = self.net.recv_create(ServiceId::HbConsumer(index));
            let timer = self.net.timer_create(ServiceId::HbConsumer(index));
            if let Some(mut entry) = HbConsumerEntry::from_entry(raw, recv, timer) {
                entry.start(&mut self.net);
                self.hb_entries.push(entry);
            } else {
                self.net.recv_destroy(recv);
                self.net.timer_destroy(timer);
            }
        }
    }

    // --- Dispatch ---

    fn dispatch_frame(&mut self, service: ServiceId, frame: &CanFrame) {
        match service {
            ServiceId::NmtCommand => {
                let transition = self.nmt.on_command_frame(frame);
                self.apply_transition(transition);
            }
            ServiceId::NmtErrorControl => {
                if let Some(event) = self.nmt.on_ec_frame(frame, &mut self.net, &self.od) {
                    self.handle_slave_event(event);
                }
            }
            ServiceId::HbConsumer(index) => {
                let Some(entry) = self.hb_entries.get_mut(usize::from(index)) else {
                    return;
                };
                let events = entry.on_frame(frame, &mut self.net);
                for event in events {
                    self.handle_hb_event(event);
                }
            }
            ServiceId::Guard(node) => {
                if let (Some(master), Some(csdo)) = (&mut self.master, &mut self.master_csdo) {
                    master.on_guard_frame(node, frame, &mut self.net, csdo, &self.od);
                }
            }
            ServiceId::Ssdo(num) => {
                if let Some(server) = self.ssdo.get_mut(usize::from(num)) {
                    server.on_frame(frame, &mut self.net, &mut self.od);
                }
            }
            ServiceId::Csdo(num) => {
                if let Some(client) = self.csdo.get_mut(usize::from(num)) {
                    client.on_frame(frame, &mut self.net);
                }
            }
            ServiceId::MasterCsdo => {
                if let Some(csdo) = &mut self.master_csdo {
                    csdo.on_frame(frame, &mut self.net);
                }
            }
            ServiceId::Sync => {
                match self.sync.on_frame(frame) {
                    Some(SyncEvent::Pulse(counter)) => self.do_sync(counter),
                    Some(SyncEvent::LengthError) => {
                        self.emcy.push_error(
                            &mut self.net,
                            &mut self.od,
                            codes::SYNC_LENGTH,
                            [0; 5],
                        );
                        self.events.push_back(NodeEvent::SyncError);
                    }
                    None => {}
                }
            }
            ServiceId::Time => {
                if let Some(stamp) = self.time.on_frame(frame) {
                    self.events.push_back(NodeEvent::Time(stamp));
                }
            }
            ServiceId::EmcyMonitor(_) => {
                if let Some(message) = parse_emcy(frame) {
                    self.events.push_back(NodeEvent::Emcy(message));
                }
            }
            ServiceId::Rpdo(num) => {
                if self.nmt.state() != NmtState::Operational {
                    return;
                }
                let Some(pdo) = self.rpdo.get_mut(usize::from(num)) else {
                    return;
                };
                match pdo.on_frame(frame, &mut self.net, &mut self.od) {
                    Ok(entries) if !entries.is_empty() => {
                        self.events.push_back(NodeEvent::PdoReceived { num, entries });
                    }
                    Ok(_) => {}
                    Err(error) => self.pdo_error(num, error),
                }
            }
            ServiceId::Lss => {
                if let Some(lss) = &mut self.lss_master {
                    lss.on_frame(frame, &mut self.net);
                    for event in lss.take_events() {
                        self.events.push_back(NodeEvent::LssMaster(event));
                    }
                }
                if let Some(lss) = &mut self.lss_slave {
                    if let Some(event) = lss.on_frame(frame, &mut self.net) {
                        self.events.push_back(NodeEvent::LssSlave(event));
                    }
                }
            }
            // These tokens identify timers only.
            ServiceId::NmtHeartbeat
            | ServiceId::NmtLifeGuard
            | ServiceId::BootupWait
            | ServiceId::EmcyInhibit
            | ServiceId::RpdoDeadline(_)
            | ServiceId::TpdoInhibit(_)
            | ServiceId::TpdoEvent(_) => {}
        }
    }

    fn dispatch_timer(&mut self, service: ServiceId) {
        match service {
            ServiceId::NmtHeartbeat => self.nmt.on_heartbeat_timer(&mut self.net),
            ServiceId::NmtLifeGuard => {
                if let Some(event) = self.nmt.on_guard_timeout() {
                    self.handle_slave_event(event);
                }
            }
            ServiceId::HbConsumer(index) => {
                let Some(entry) = self.hb_entries.get_mut(usize::from(index)) else {
                    return;
                };
                if let Some(event) = entry.on_timeout() {
                    self.handle_hb_event(event);
                }
            }
            ServiceId::Guard(node) => {
                if let Some(master) = &mut self.master {
                    master.on_guard_timer(node, &mut self.net);
                }
            }
            ServiceId::BootupWait => {
                if let (Some(master), Some(csdo)) = (&mut self.master, &mut self.master_csdo) {
                    master.on_bootup_timeout(&mut self.net, csdo);
                }
            }
            ServiceId::Ssdo(num) => {
                if let Some(server) = self.ssdo.get_mut(usize::from(num)) {
                    server.on_timeout(&mut self.net);
                }
            }
            ServiceId::Csdo(num) => {
                if let Some(client) = self.csdo.get_mut(usize::from(num)) {
                    client.on_timeout(&mut self.net);
                }
            }
            ServiceId::MasterCsdo => {
                if let Some(csdo) = &mut self.master_csdo {
                    csdo.on_timeout(&mut self.net);
                }
            }
            ServiceId::Sync => {
                if let Some(SyncEvent::Pulse(counter)) = self.sync.on_timer(&mut self.net) {
                    self.do_sync(counter);
                }
            }
            ServiceId::Time => self.time.on_timer(&mut self.net),
            ServiceId::EmcyInhibit => self.emcy.on_timer(&mut self.net),
            ServiceId::RpdoDeadline(num) => {
                let Some(pdo) = self.rpdo.get_mut(usize::from(num)) else {
                    return;
                };
                if pdo.on_deadline(&mut self.net) {
                    self.pdo_error(num, PdoError::Deadline);
                }
            }
            ServiceId::TpdoInhibit(num) => {
                let Some(pdo) = self.tpdo.get_mut(usize::from(num)) else {
                    return;
                };
                match pdo.on_inhibit_elapsed(&mut self.net, &self.od) {
                    Ok(true) => self.events.push_back(NodeEvent::TpdoSent { num }),
                    Ok(false) => {}
                    Err(error) => self.pdo_error(num, error),
                }
            }
            ServiceId::TpdoEvent(num) => {
                let Some(pdo) = self.tpdo.get_mut(usize::from(num)) else {
                    return;
                };
                match pdo.on_event_timer(&mut self.net, &self.od) {
                    Ok(true) => self.events.push_back(NodeEvent::TpdoSent { num }),
                    Ok(false) => {}
                    Err(error) => self.pdo_error(num, error),
                }
            }
            ServiceId::Lss => {
                if let Some(lss) = &mut self.lss_master {
                    lss.on_timeout(&mut self.net);
                    for event in lss.take_events() {
                        self.events.push_back(NodeEvent::LssMaster(event));
                    }
                }
            }
            // These tokens identify receivers only.
            ServiceId::NmtCommand
            | ServiceId::NmtErrorControl
            | ServiceId::EmcyMonitor(_)
            | ServiceId::Rpdo(_) => {}
        }
    }

    /// One SYNC pulse: synchronous TPDOs transmit first, then the SYNC
    /// consumer actuates buffered RPDOs.
    fn do_sync(&mut self, counter: Option<u8>) {
        if self.nmt.state() == NmtState::Operational {
            for num in 0..self.tpdo.len() {
                match self.tpdo[num].on_sync(&mut self.net, &self.od, counter) {
                    Ok(true) => self
                        .events
                        .push_back(NodeEvent::TpdoSent { num: num as u8 }),
                    Ok(false) => {}
                    Err(error) => self.pdo_error(num as u8, error),
                }
            }
            for num in 0..self.rpdo.len() {
                match self.rpdo[num].on_sync(&mut self.od) {
                    Ok(entries) if !entries.is_empty() => {
                        self.events.push_back(NodeEvent::PdoReceived {
                            num: num as u8,
                            entries,
                        });
                    }
                    Ok(_) => {}
                    Err(error) => self.pdo_error(num as u8, error),
                }
            }
        }
        self.events.push_back(NodeEvent::Sync { counter });
    }

    fn handle_slave_event(&mut self, event: SlaveEvent) {
        match event {
            SlaveEvent::LifeGuardOccurred => {
                self.emcy
                    .push_error(&mut self.net, &mut self.od, codes::LIFE_GUARD, [0; 5]);
                self.events.push_back(NodeEvent::LifeGuard { occurred: true });
                self.comm_error_behavior();
            }
            SlaveEvent::LifeGuardResolved => {
                self.emcy
                    .clear_error(&mut self.net, &mut self.od, codes::LIFE_GUARD);
                self.events
                    .push_back(NodeEvent::LifeGuard { occurred: false });
            }
        }
    }

    fn handle_hb_event(&mut self, event: HbEvent) {
        if let HbEvent::Occurred { .. } = event {
            self.emcy
                .push_error(&mut self.net, &mut self.od, codes::LIFE_GUARD, [0; 5]);
            self.comm_error_behavior();
        }
        if let (Some(master), Some(csdo)) = (&mut self.master, &mut self.master_csdo) {
            master.on_hb_event(&event, &mut self.net, csdo, &self.od);
        }
        self.events.push_back(NodeEvent::Heartbeat(event));
    }

    /// Applies the communication error behavior of object 0x1029:01.
    fn comm_error_behavior(&mut self) {
        let behavior = self.od.read_u8(0x1029, 1).unwrap_or(0);
        let transition = match behavior {
            // 0: switch to pre-operational, but only when operational.
            0 if self.nmt.state() == NmtState::Operational => {
                self.nmt.apply_command(NmtCommand::EnterPreOperational)
            }
            // 1: no state change.
            // 2: stop the device.
            2 => self.nmt.apply_command(NmtCommand::Stop),
            _ => NmtTransition::None,
        };
        self.apply_transition(transition);
    }

    fn pdo_error(&mut self, num: u8, error: PdoError) {
        let code = match error {
            PdoError::LengthMismatch { expected_bits, got_bits }
                if got_bits > expected_bits => codes::PDO_LENGTH_EXCEEDED,
            PdoError::LengthMismatch { .. } | PdoError::MappingError { .. } => codes::PDO_LENGTH,
            PdoError::Deadline => codes::RPDO_TIMEOUT,
        };
        self.emcy
            .push_error(&mut self.net, &mut self.od, code, [0; 5]);
        self.events.push_back(NodeEvent::PdoError { num, error });
    }

    fn trigger_tpdo(&mut self, num: u8) {
        let Some(pdo) = self.tpdo.get_mut(usize::from(num)) else {
            return;
        };
        match pdo.trigger(&mut self.net, &self.od) {
            Ok(true) => self.events.push_back(NodeEvent::TpdoSent { num }),
            Ok(false) => {}
            Err(error) => self.pdo_error(num, error),
        }
    }

    /// Post-processing after every dispatch: TPDO event indications,
    /// client confirmations, master events and touched communication
    /// parameters.
    fn post_dispatch(&mut self) {
        // Dictionary writes that configure a service re-apply it.
        for (index, _) in self.od.take_writes() {
            self.reapply_comm_parameter(index);
        }
        // TPDO event indications collapse into per-channel triggers.
        let touched = self.od.take_tpdo_events();
        if self.nmt.state() == NmtState::Operational {
            let mut triggered: Vec<u8> = Vec::new();
            for (index, sub_index) in touched {
                for num in 0..self.tpdo.len() as u8 {
                    if self.tpdo[usize::from(num)].maps(index, sub_index)
                        && !triggered.contains(&num)
                    {
                        triggered.push(num);
                    }
                }
            }
            for num in triggered {
                self.tpdo_event(num);
            }
        }
        self.drain_confirms();
    }

    fn drain_confirms(&mut self) {
        for i in 0..self.csdo.len() {
            for confirm in self.csdo[i].take_confirms() {
                self.events.push_back(NodeEvent::SdoConfirm(confirm));
            }
        }
        // The master's client confirmations feed its state machines, which
        // may produce follow-up requests; loop until quiet.
        loop {
            let confirms = match &mut self.master_csdo {
                Some(csdo) => csdo.take_confirms(),
                None => break,
            };
            if confirms.is_empty() {
                break;
            }
            for confirm in confirms {
                if let (Some(master), Some(csdo)) = (&mut self.master, &mut self.master_csdo) {
                    master.on_sdo_confirm(&confirm, &mut self.net, csdo, &self.od);
                }
            }
        }
        if let Some(master) = &mut self.master {
            for event in master.take_events() {
                self.events.push_back(NodeEvent::Master(event));
            }
        }
    }

    /// Re-applies a service configuration after its dictionary object was
    /// written.
    fn reapply_comm_parameter(&mut self, index: u16) {
        let node_id = self.nmt.node_id();
        match index {
            0x1005 | 0x1006 | 0x1019 => {
                if self.nmt.state() != NmtState::Stopped {
                    self.sync.start(&mut self.net, &self.od);
                }
            }
            0x1012 => {
                if self.nmt.state() != NmtState::Stopped {
                    self.time.start(&mut self.net, &self.od);
                }
            }
            0x1014 | 0x1015 => {
                if self.nmt.state() != NmtState::Stopped {
                    self.emcy.start(&mut self.net, &self.od, node_id);
                }
            }
            0x1016 => self.restart_hb_consumers(),
            0x1017 => self.nmt.restart_heartbeat(&mut self.net, &self.od),
            0x1200..=0x127F => {
                let num = (index - 0x1200) as usize;
                if let Some(server) = self.ssdo.get_mut(num) {
                    server.start(&mut self.net, &self.od, node_id);
                }
            }
            0x1280..=0x12FF => {
                let num = (index - 0x1280) as usize;
                if let Some(client) = self.csdo.get_mut(num) {
                    client.start(&mut self.net, &self.od);
                }
            }
            0x1400..=0x15FF | 0x1600..=0x17FF => {
                if self.nmt.state() == NmtState::Operational {
                    let num = (index & 0x00FF) as usize;
                    if let Some(pdo) = self.rpdo.get_mut(num) {
                        pdo.start(&mut self.net, &self.od, node_id);
                    }
                }
            }
            0x1800..=0x19FF | 0x1A00..=0x1BFF => {
                if self.nmt.state() == NmtState::Operational {
                    let num = (index & 0x00FF) as usize;
                    if let Some(pdo) = self.tpdo.get_mut(num) {
                        pdo.start(&mut self.net, &self.od, node_id);
                    }
                }
            }
            _ => {}
        }
    }
}
