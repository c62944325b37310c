//! The configuration-request process of the NMT master.
//!
//! Transitions a slave through an optional restore phase (writing the
//! literal ASCII "load" to a sub-index of object 0x1011), an NMT reset, a
//! re-download of the concise DCF stored for that slave in the *master's*
//! object 0x1F22, and an optional user-defined step synchronized by a
//! continuation call.

use crate::net::CanNet;
use crate::od::ObjectDictionary;
use crate::sdo::{SdoAbort, SdoClient, SdoClientRequest, SdoConfirm, TransferMode};
use crate::types::NodeId;
use crate::value::Value;
use log::{debug, info};

/// How long the process waits for the slave's boot-up after a reset.
pub const BOOTUP_TIMEOUT_US: u64 = 5_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// Writing "load" to the slave's 0x1011 sub-index.
    Restore,
    /// Waiting for the boot-up frame after the reset.
    AwaitBootup,
    /// Downloading the concise DCF.
    Download,
    /// Waiting for the application's continuation.
    UserStep,
}

/// What the master must do after feeding the configuration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CfgOutcome {
    /// An SDO request is in flight; wait for its confirmation.
    Pending,
    /// Send an NMT reset to the slave and wait for its boot-up (the process
    /// arms no timer itself; the master does).
    ResetSlave,
    /// Invoke the application's configuration step; the process resumes on
    /// [`CfgRequest::continue_user_step`].
    UserStep,
    /// The request completed successfully.
    Done,
    /// The request failed with the triggering abort code.
    Failed(SdoAbort),
}

/// A configuration request for a single slave.
#[derive(Debug)]
pub struct CfgRequest {
    node: NodeId,
    step: Step,
    /// Sub-index of object 0x1011 to restore; 0 skips the restore phase.
    restore_sub: u8,
    /// Whether the application registered a user-defined step.
    user_step: bool,
}

impl CfgRequest {
    pub fn new(node: NodeId, restore_sub: u8, user_step: bool) -> Self {
        Self {
            node,
            step: Step::Restore,
            restore_sub,
            user_step,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Starts the process. Returns `Pending` if a restore write was issued,
    /// or `ResetSlave` to go straight to the reset phase.
    pub fn begin<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        csdo: &mut SdoClient,
    ) -> CfgOutcome {
        info!("[NMT] configuration request for slave {}", self.node);
        csdo.set_remote(net, self.node);
        if self.restore_sub != 0 {
            self.step = Step::Restore;
            let request =
                SdoClientRequest::download(0x1011, self.restore_sub, b"load".to_vec());
            match csdo.submit(net, request) {
                Ok(()) => CfgOutcome::Pending,
                Err(_) => CfgOutcome::Failed(SdoAbort::GeneralError),
            }
        } else {
            self.step = Step::AwaitBootup;
            CfgOutcome::ResetSlave
        }
    }

    /// Feeds an SDO confirmation into the process.
    pub fn on_confirm<T: Copy>(
        &mut self,
        confirm: &SdoConfirm,
        _net: &mut CanNet<T>,
        _csdo: &mut SdoClient,
        _master_od: &ObjectDictionary,
    ) -> CfgOutcome {
        match self.step {
            Step::Restore => match &confirm.result {
                Ok(_) => {
                    self.step = Step::AwaitBootup;
                    CfgOutcome::ResetSlave
                }
                Err(code) => CfgOutcome::Failed(*code),
            },
            Step::Download => match &confirm.result {
                Ok(_) => self.finish_or_user_step(),
                Err(code) => CfgOutcome::Failed(*code),
            },
            _ => CfgOutcome::Pending,
        }
    }

    /// The slave's boot-up arrived after the reset: start the DCF download,
    /// or finish if the master holds no configuration for this slave.
    pub fn on_bootup<T: Copy>(
        &mut self,
        net: &mut CanNet<T>,
        csdo: &mut SdoClient,
        master_od: &ObjectDictionary,
    ) -> CfgOutcome {
        if self.step != Step::AwaitBootup {
            return CfgOutcome::Pending;
        }
        let stream = match master_od.read(0x1F22, self.node.raw()) {
            Ok(Value::Domain(stream)) if !stream.is_empty() => stream.clone(),
            _ => {
                debug!(
                    "[NMT] no concise DCF for slave {}, skipping download",
                    self.node
                );
                return self.finish_or_user_step();
            }
        };
        self.step = Step::Download;
        csdo.set_remote(net, self.node);
        let request = SdoClientRequest::download_dcf(stream)
            .with_mode(TransferMode::Block { fallback: true });
        match csdo.submit(net, request) {
            Ok(()) => CfgOutcome::Pending,
            Err(_) => CfgOutcome::Failed(SdoAbort::GeneralError),
        }
    }

    /// The boot-up wait expired.
    pub fn on_bootup_timeout(&mut self) -> CfgOutcome {
        if self.step == Step::AwaitBootup {
            CfgOutcome::Failed(SdoAbort::Timeout)
        } else {
            CfgOutcome::Pending
        }
    }

    /// The application's continuation after a user-defined step.
    pub fn continue_user_step(&mut self, result: Result<(), SdoAbort>) -> CfgOutcome {
        if self.step != Step::UserStep {
            return CfgOutcome::Pending;
        }
        match result {
            Ok(()) => CfgOutcome::Done,
            Err(code) => CfgOutcome::Failed(code),
        }
    }

    fn finish_or_user_step(&mut self) -> CfgOutcome {
        if self.user_step {
            self.step = Step::UserStep;
            CfgOutcome::UserStep
        } else {
            CfgOutcome::Done
        }
    }
}
