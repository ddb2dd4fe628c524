//! RPC sessions
//!
//! An [`RpcSession`] wraps one transport port. The calling side pairs each
//! request with the next message that arrives on the port; the serving side
//! runs a receive loop that hands every message to a handler until the port
//! disconnects or the session is shut down.
//!
//! A session is used either for calls or for serving, not both: a receive
//! loop would consume the responses `send_with_response` waits for.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use avp_transport::{
    PortHandle, PortName, PortState, Timeout, Transport, TransportError, MAX_MESSAGE_LEN,
};

use crate::config::RpcConfig;
use crate::error::{Result, RpcError};
use crate::message::RpcMessage;

/// Receives raw messages from [`RpcSession::run_receive_loop`]
pub trait MessageHandler {
    fn handle(&mut self, session: &RpcSession, payload: &[u8]);
}

impl<F> MessageHandler for F
where
    F: FnMut(&RpcSession, &[u8]),
{
    fn handle(&mut self, session: &RpcSession, payload: &[u8]) {
        self(session, payload)
    }
}

/// A typed request handler driven by [`RpcSession::serve`]
pub trait Service {
    /// Handle one request; a returned message is posted back as the response
    fn handle(&mut self, request: RpcMessage) -> Option<RpcMessage>;
}

/// One RPC endpoint bound to a transport port
pub struct RpcSession {
    transport: Arc<Transport>,
    port: PortHandle,
    config: RpcConfig,
    /// Held from a request's send until its response is received
    pairing: Mutex<()>,
    shutdown: AtomicBool,
}

impl RpcSession {
    /// Open a port for a session without connecting it yet
    ///
    /// # Errors
    /// Any error from `Transport::open`.
    pub fn open(transport: Arc<Transport>, name: &str, config: RpcConfig) -> Result<Self> {
        let port = transport.open(Some(name))?;
        log::debug!("rpc: opened session port {} ({})", name, port);
        Ok(Self {
            transport,
            port,
            config,
            pairing: Mutex::new(()),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Open a port and connect it within the configured connect timeout
    ///
    /// # Arguments
    /// * `transport` - Transport the port lives on
    /// * `name` - Port name the far side is waiting on
    /// * `config` - Session timeouts
    ///
    /// # Errors
    /// `ConnectTimeout` when nobody is listening; the port is closed again.
    pub fn init(transport: Arc<Transport>, name: &str, config: RpcConfig) -> Result<Self> {
        let session = Self::open(transport, name, config)?;
        session.connect()?;
        Ok(session)
    }

    /// Open a port and wait for the far side to connect to it
    ///
    /// # Errors
    /// `ConnectTimeout` if nobody connected within `timeout`.
    pub fn accept(
        transport: Arc<Transport>,
        name: &str,
        config: RpcConfig,
        timeout: Timeout,
    ) -> Result<Self> {
        let session = Self::open(transport, name, config)?;
        session.transport.wait_for_connect(session.port, timeout)?;
        log::info!("rpc: accepted session on {}", name);
        Ok(session)
    }

    /// Connect the session's port unless it already is
    ///
    /// Callers may invoke this before every use; only the first successful
    /// call does any work.
    pub fn connect(&self) -> Result<()> {
        match self.transport.port_state(self.port)? {
            PortState::Connected => Ok(()),
            PortState::Open => {
                self.transport
                    .connect(self.port, self.config.connect_timeout())?;
                log::info!("rpc: session {} connected", self.name()?);
                Ok(())
            }
            state => Err(TransportError::InvalidState { state }.into()),
        }
    }

    pub fn port(&self) -> PortHandle {
        self.port
    }

    pub fn name(&self) -> Result<PortName> {
        Ok(self.transport.port_name(self.port)?)
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.transport.port_state(self.port) == Ok(PortState::Connected)
    }

    /// Send a message without waiting for an answer
    ///
    /// Waits for any request in flight on this session to get its response
    /// first, so the message is never mistaken for part of that exchange.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let _pairing = self.pairing.lock().unwrap_or_else(PoisonError::into_inner);
        self.send_unpaired(payload)
    }

    fn send_unpaired(&self, payload: &[u8]) -> Result<()> {
        self.transport
            .send(self.port, payload, self.config.send_timeout())?;
        Ok(())
    }

    /// Send a request and receive the message that answers it
    ///
    /// Concurrent callers are serialized so each receives its own response.
    ///
    /// # Returns
    /// Length of the response written to `response`
    ///
    /// # Errors
    /// - `Timeout` when no response arrived within the response timeout
    /// - `Disconnected` if the far side went away
    /// - `ShutDown` after [`RpcSession::request_shutdown`]
    pub fn send_with_response(&self, payload: &[u8], response: &mut [u8]) -> Result<usize> {
        let _pairing = self.pairing.lock().unwrap_or_else(PoisonError::into_inner);
        self.send_unpaired(payload)?;

        let timeout = self.config.response_timeout();
        let start = Instant::now();
        loop {
            match self.transport.recv(self.port, response) {
                Ok(len) => return Ok(len),
                Err(TransportError::MailboxEmpty) => {}
                Err(e) => return Err(e.into()),
            }
            if self.is_shutting_down() {
                return Err(RpcError::ShutDown);
            }
            let wait = match timeout.remaining(start) {
                None => Timeout::Infinite,
                Some(left) if left.is_zero() => return Err(TransportError::Timeout.into()),
                Some(left) => Timeout::After(left),
            };
            match self.transport.wait_message(self.port, wait) {
                Ok(()) | Err(TransportError::Timeout) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Post a typed message
    pub fn post(&self, message: &RpcMessage) -> Result<()> {
        self.send(&message.encode()?)
    }

    /// Send a typed request and decode its response
    ///
    /// # Errors
    /// - `NoResponse` for requests that are never answered; use [`RpcSession::post`]
    /// - `UnexpectedResponse` if the answer is not the request's response kind
    pub fn call(&self, request: &RpcMessage) -> Result<RpcMessage> {
        let Some(expected) = request.response_kind() else {
            return Err(RpcError::NoResponse(request.kind()));
        };
        let mut buf = [0u8; MAX_MESSAGE_LEN];
        let len = self.send_with_response(&request.encode()?, &mut buf)?;
        let response = RpcMessage::decode(&buf[..len])?;
        if response.kind() != expected {
            return Err(RpcError::UnexpectedResponse {
                request: request.kind(),
                response: response.kind(),
            });
        }
        Ok(response)
    }

    /// Feed every received message to `handler`
    ///
    /// Returns `Ok` when the port disconnects or closes, or once shutdown
    /// has been requested.
    pub fn run_receive_loop<H: MessageHandler>(&self, mut handler: H) -> Result<()> {
        let mut buf = [0u8; MAX_MESSAGE_LEN];
        loop {
            if self.is_shutting_down() {
                log::debug!("rpc: receive loop on {} shutting down", self.port);
                return Ok(());
            }
            match self.transport.recv(self.port, &mut buf) {
                Ok(len) => handler.handle(self, &buf[..len]),
                Err(TransportError::MailboxEmpty) => {
                    match self.transport.wait_message(self.port, Timeout::Infinite) {
                        Ok(()) | Err(TransportError::Timeout) => {}
                        Err(TransportError::Closed) => return Ok(()),
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(TransportError::Disconnected | TransportError::Closed) => {
                    log::info!("rpc: receive loop on {} ended, peer gone", self.port);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Run `service` over decoded requests, posting back its responses
    pub fn serve<S: Service>(&self, service: &mut S) -> Result<()> {
        self.run_receive_loop(|session: &RpcSession, payload: &[u8]| {
            let request = match RpcMessage::decode(payload) {
                Ok(request) => request,
                Err(e) => {
                    log::warn!("rpc: dropping undecodable message ({} bytes): {}", payload.len(), e);
                    return;
                }
            };
            log::trace!("rpc: handling {}", request.kind());
            if let Some(response) = service.handle(request) {
                if let Err(e) = session.post(&response) {
                    log::warn!("rpc: failed to post {}: {}", response.kind(), e);
                }
            }
        })
    }

    /// Stop the receive loop and any pending response wait
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.transport.signal_port(self.port) {
            log::debug!("rpc: shutdown signal on {}: {}", self.port, e);
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for RpcSession {
    fn drop(&mut self) {
        match self.transport.close(self.port) {
            Ok(()) | Err(TransportError::Closed) => {}
            Err(e) => log::warn!("rpc: closing session port {}: {}", self.port, e),
        }
    }
}

impl core::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RpcSession")
            .field("port", &self.port)
            .field("shutdown", &self.is_shutting_down())
            .finish()
    }
}
