//! Parameter-end and application-ready exchange.
//!
//! After a successful connect the controller sends a parameter-end control
//! request and then waits for the device to announce application-ready on
//! the controller's RPC port. Both steps are one-shot with an explicit
//! deadline; a missed deadline is a `HandshakeTimeout`.

use crate::blocks::{
    decode_connect_response, decode_control_block, encode_control_block, parse_blocks, ControlBlock,
    PnioStatus, BLOCK_IOD_CONTROL_REQ, BLOCK_IOD_CONTROL_RES, BLOCK_IOX_CONTROL_REQ,
    BLOCK_IOX_CONTROL_RES, BLOCK_RELEASE_REQ, CONTROL_APPLICATION_READY, CONTROL_PRM_END,
    CONTROL_RELEASE,
};
use crate::device::Session;
use crate::rpc::{Opnum, RpcEndpoint};
use pnio_common::error::{PnioError, PnioResult};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Where control requests for one device go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlTarget {
    /// Device RPC address.
    pub peer: SocketAddr,
    /// Device object UUID.
    pub object: Uuid,
}

/// Drives the post-connect handshake over a shared RPC endpoint.
#[derive(Debug)]
pub struct HandshakeCoordinator<'a> {
    rpc: &'a RpcEndpoint,
    target: ControlTarget,
}

impl<'a> HandshakeCoordinator<'a> {
    /// Coordinator for one device.
    #[must_use]
    pub fn new(rpc: &'a RpcEndpoint, target: ControlTarget) -> Self {
        Self { rpc, target }
    }

    /// Send parameter-end and wait for a success status.
    ///
    /// # Errors
    ///
    /// Returns:
    /// - `PnioError::HandshakeTimeout` if the device does not answer in time
    /// - `PnioError::ConnectRejected` if it answers with a non-zero status
    pub fn send_parameter_end(&self, session: &Session, timeout: Duration) -> PnioResult<()> {
        let block = encode_control_block(
            BLOCK_IOD_CONTROL_REQ,
            &ControlBlock {
                ar_uuid: session.ar_uuid,
                session_key: session.session_key,
                command: CONTROL_PRM_END,
                properties: 0,
            },
        );

        let response = self
            .rpc
            .call(self.target.peer, self.target.object, Opnum::Control, &block, timeout)
            .map_err(|e| match e {
                PnioError::TransportTimeout(msg) => {
                    PnioError::HandshakeTimeout(format!("parameter end: {msg}"))
                }
                other => other,
            })?;

        let status = decode_connect_response(&response.datagram)?;
        if !status.is_ok() {
            warn!(ar = %session.ar_uuid, %status, "Parameter end rejected");
            return Err(status.to_error());
        }

        if let Ok(blocks) = response.blocks() {
            let confirmed = parse_blocks(blocks, false)
                .map(|b| b.iter().any(|b| b.block_type == BLOCK_IOD_CONTROL_RES))
                .unwrap_or(false);
            if !confirmed {
                debug!(ar = %session.ar_uuid, "Parameter end response carried no control block");
            }
        }

        info!(ar = %session.ar_uuid, key = session.session_key, "Parameter end acknowledged");
        Ok(())
    }

    /// Wait for the device's application-ready request and answer it.
    ///
    /// Requests for other sessions are ignored. The reply echoes the
    /// request's identifiers and the device's command code.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::HandshakeTimeout` if no matching request arrives.
    pub fn wait_for_application_ready(
        &self,
        session: &Session,
        timeout: Duration,
    ) -> PnioResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let Some(request) = self.rpc.recv_request(deadline)? else {
                return Err(PnioError::HandshakeTimeout(format!(
                    "no application ready for session {} within {timeout:?}",
                    session.session_key
                )));
            };
            if request.header.opnum != Opnum::Control as u16 {
                debug!(
                    opnum = request.header.opnum,
                    "Ignoring non-control request while awaiting application ready"
                );
                continue;
            }

            let blocks = match request.blocks().and_then(|b| parse_blocks(b, false)) {
                Ok(blocks) => blocks,
                Err(e) => {
                    warn!(peer = %request.peer, error = %e, "Malformed control request");
                    continue;
                }
            };
            let Some(control) = blocks
                .iter()
                .filter(|b| b.block_type == BLOCK_IOX_CONTROL_REQ)
                .find_map(|b| decode_control_block(b.body).ok())
            else {
                debug!(peer = %request.peer, "Control request without application-ready block");
                continue;
            };

            if control.ar_uuid != session.ar_uuid {
                debug!(
                    got = %control.ar_uuid,
                    want = %session.ar_uuid,
                    "Application ready for another session"
                );
                continue;
            }
            if control.command & CONTROL_APPLICATION_READY == 0 {
                debug!(command = control.command, "Control request is not application ready");
                continue;
            }

            let reply = encode_control_block(
                BLOCK_IOX_CONTROL_RES,
                &ControlBlock {
                    ar_uuid: session.ar_uuid,
                    session_key: session.session_key,
                    command: control.command,
                    properties: 0,
                },
            );
            self.rpc.respond(&request, PnioStatus::OK, &reply)?;
            info!(ar = %session.ar_uuid, peer = %request.peer, "Application ready confirmed");
            return Ok(());
        }
    }

    /// Ask the device to release the session without waiting for an answer.
    ///
    /// # Errors
    ///
    /// Returns `PnioError::Io` if the request cannot be sent.
    pub fn release(&self, session: &Session) -> PnioResult<()> {
        let block = encode_control_block(
            BLOCK_RELEASE_REQ,
            &ControlBlock {
                ar_uuid: session.ar_uuid,
                session_key: session.session_key,
                command: CONTROL_RELEASE,
                properties: 0,
            },
        );
        self.rpc.notify(self.target.peer, self.target.object, Opnum::Release, &block)?;
        debug!(ar = %session.ar_uuid, "Release sent");
        Ok(())
    }
}
