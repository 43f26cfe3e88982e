// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! A runnable async controller wrapping the sans-io
//! [`Controller`].
//!
//! Every event, datapath and collaborator alike, arrives through one
//! channel and is handled to completion before the next, so the
//! controller's state is only ever touched by the task.

use crate::api::DatapathCmd;
use crate::api::FlowRemoved;
use crate::api::Ipv4Addr;
use crate::api::MacAddr;
use crate::api::PacketIn;
use crate::api::PortId;
use crate::engine::controller::Controller;
use crate::engine::resolve::ResolutionId;
use slog::Logger;
use slog::crit;
use slog::error;
use slog::info;
use slog::o;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::RecvError;

/// A snapshot of the controller's bookkeeping.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ControllerStatus {
    pub ports: usize,
    pub tracked_flows: usize,
    pub pending_resolutions: usize,
}

/// A request sent to the `ControllerTask` from a `ControllerHandle`
pub enum ControllerRequest {
    /// A packet the datapath had no flow for
    PacketIn(PacketIn),

    /// The datapath removed a flow
    FlowRemoved(FlowRemoved),

    /// The network answered (or gave up on) a MAC resolution
    MacResolved { id: ResolutionId, mac: Option<MacAddr> },

    AddVirtualPort { num: u16, name: String, mac: MacAddr, id: PortId },

    DeleteVirtualPort { num: u16, id: PortId },

    AddTunnelPort { num: u16, peer: Ipv4Addr },

    RemoveTunnelPort { num: u16 },

    /// Patch a service port through to the router port it serves
    SetServiceFlows {
        local_port: u16,
        remote_port: u16,
        local_addr: Ipv4Addr,
        remote_addr: Ipv4Addr,
        local_tport: u16,
        remote_tport: u16,
    },

    /// A service port appeared on the datapath
    SetupServicePort { num: u16, name: String },

    /// Report the controller's bookkeeping
    Status { tx: oneshot::Sender<ControllerStatus> },

    /// Stop the task
    Shutdown,
}

/// An error response from a `ControllerRequest`
#[derive(Debug, Error, PartialEq)]
pub enum TaskError {
    #[error("failed to send request to controller task")]
    Send,
    #[error("failed to receive response from controller task")]
    Recv,
}

impl<T> From<SendError<T>> for TaskError {
    fn from(_: SendError<T>) -> Self {
        TaskError::Send
    }
}

impl From<RecvError> for TaskError {
    fn from(_: RecvError) -> Self {
        TaskError::Recv
    }
}

#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControllerRequest>,
}

impl ControllerHandle {
    pub async fn packet_in(&self, pi: PacketIn) -> Result<(), TaskError> {
        self.tx.send(ControllerRequest::PacketIn(pi)).await?;
        Ok(())
    }

    pub async fn flow_removed(&self, fr: FlowRemoved) -> Result<(), TaskError> {
        self.tx.send(ControllerRequest::FlowRemoved(fr)).await?;
        Ok(())
    }

    /// Deliver the outcome of a `Network::request_mac` call
    pub async fn mac_resolved(
        &self,
        id: ResolutionId,
        mac: Option<MacAddr>,
    ) -> Result<(), TaskError> {
        self.tx.send(ControllerRequest::MacResolved { id, mac }).await?;
        Ok(())
    }

    pub async fn add_virtual_port(
        &self,
        num: u16,
        name: &str,
        mac: MacAddr,
        id: PortId,
    ) -> Result<(), TaskError> {
        let name = name.to_string();
        self.tx
            .send(ControllerRequest::AddVirtualPort { num, name, mac, id })
            .await?;
        Ok(())
    }

    pub async fn delete_virtual_port(
        &self,
        num: u16,
        id: PortId,
    ) -> Result<(), TaskError> {
        self.tx.send(ControllerRequest::DeleteVirtualPort { num, id }).await?;
        Ok(())
    }

    pub async fn add_tunnel_port(
        &self,
        num: u16,
        peer: Ipv4Addr,
    ) -> Result<(), TaskError> {
        self.tx.send(ControllerRequest::AddTunnelPort { num, peer }).await?;
        Ok(())
    }

    pub async fn remove_tunnel_port(&self, num: u16) -> Result<(), TaskError> {
        self.tx.send(ControllerRequest::RemoveTunnelPort { num }).await?;
        Ok(())
    }

    pub async fn set_service_flows(
        &self,
        local_port: u16,
        remote_port: u16,
        local_addr: Ipv4Addr,
        remote_addr: Ipv4Addr,
        local_tport: u16,
        remote_tport: u16,
    ) -> Result<(), TaskError> {
        self.tx
            .send(ControllerRequest::SetServiceFlows {
                local_port,
                remote_port,
                local_addr,
                remote_addr,
                local_tport,
                remote_tport,
            })
            .await?;
        Ok(())
    }

    pub async fn setup_service_port(
        &self,
        num: u16,
        name: &str,
    ) -> Result<(), TaskError> {
        let name = name.to_string();
        self.tx.send(ControllerRequest::SetupServicePort { num, name }).await?;
        Ok(())
    }

    pub async fn status(&self) -> Result<ControllerStatus, TaskError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(ControllerRequest::Status { tx }).await?;
        let res = rx.await?;
        Ok(res)
    }

    /// Shutdown the [`ControllerTask`]
    pub async fn shutdown(&self) -> Result<(), TaskError> {
        self.tx.send(ControllerRequest::Shutdown).await?;
        Ok(())
    }
}

pub struct ControllerTask {
    shutdown: bool,
    log: Logger,
    controller: Controller,

    // Requests from `ControllerHandle`s
    rx: mpsc::Receiver<ControllerRequest>,

    // Commands for the datapath
    cmd_tx: mpsc::Sender<DatapathCmd>,
}

impl ControllerTask {
    pub fn new(
        controller: Controller,
        cmd_tx: mpsc::Sender<DatapathCmd>,
        log: &Logger,
    ) -> (ControllerTask, ControllerHandle) {
        let log = log.new(o!(
            "component" => "vrouter-task",
            "datapath" => controller.config().datapath_id,
        ));

        let (tx, rx) = mpsc::channel(controller.config().channel_depth);

        (
            ControllerTask { shutdown: false, log, controller, rx, cmd_tx },
            ControllerHandle { tx },
        )
    }

    /// Run the main loop of the controller
    ///
    /// This should be spawned into its own tokio task. It returns on
    /// `Shutdown`, when every handle is dropped, when the datapath
    /// command channel closes, or after a packet-in fails dispatch
    /// with a contract violation. Commands already produced are still
    /// sent to the datapath before returning.
    pub async fn run(&mut self) {
        while !self.shutdown {
            let Some(request) = self.rx.recv().await else {
                info!(self.log, "All handles dropped, stopping");
                break;
            };

            self.on_request(request);

            for cmd in self.controller.drain_cmds() {
                if self.cmd_tx.send(cmd).await.is_err() {
                    error!(self.log, "Datapath command channel closed");
                    self.shutdown = true;
                    break;
                }
            }
        }
    }

    fn on_request(&mut self, request: ControllerRequest) {
        match request {
            ControllerRequest::PacketIn(pi) => {
                // The controller and its collaborators disagree about
                // the routing contract. Nothing after this can be
                // trusted.
                if let Err(err) = self.controller.on_packet_in(pi) {
                    crit!(
                        self.log,
                        "Failed to dispatch packet, stopping";
                        "err" => %err,
                    );
                    self.shutdown = true;
                }
            }
            ControllerRequest::FlowRemoved(fr) => {
                self.controller.on_flow_removed(&fr);
            }
            ControllerRequest::MacResolved { id, mac } => {
                self.controller.on_mac_resolved(id, mac);
            }
            ControllerRequest::AddVirtualPort { num, name, mac, id } => {
                self.controller.add_virtual_port(num, &name, mac, id);
            }
            ControllerRequest::DeleteVirtualPort { num, id } => {
                self.controller.delete_virtual_port(num, id);
            }
            ControllerRequest::AddTunnelPort { num, peer } => {
                self.controller.add_tunnel_port(num, peer);
            }
            ControllerRequest::RemoveTunnelPort { num } => {
                self.controller.remove_tunnel_port(num);
            }
            ControllerRequest::SetServiceFlows {
                local_port,
                remote_port,
                local_addr,
                remote_addr,
                local_tport,
                remote_tport,
            } => {
                self.controller.set_service_flows(
                    local_port,
                    remote_port,
                    local_addr,
                    remote_addr,
                    local_tport,
                    remote_tport,
                );
            }
            ControllerRequest::SetupServicePort { num, name } => {
                self.controller.setup_service_port(num, &name);
            }
            ControllerRequest::Status { tx } => {
                let _ = tx.send(ControllerStatus {
                    ports: self.controller.ports().len(),
                    tracked_flows: self.controller.tracker().len(),
                    pending_resolutions: self
                        .controller
                        .pending_resolutions(),
                });
            }
            ControllerRequest::Shutdown => {
                info!(self.log, "Shutting down controller task");
                self.shutdown = true;
            }
        }
    }
}
