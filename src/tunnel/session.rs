//! Tunnel sessions
//!
//! A session pairs one input channel and one output channel with the socket
//! (real or piped) they carry. Its lifecycle:
//!
//! ```text
//! Created -> AwaitingResult -> Established | Failed -> Closed
//! ```

use crate::mux::{Closeable, InputChannel, Multiplexer, OutputChannel};
use crate::protocol::TunnelKind;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    AwaitingResult,
    Established,
    Failed,
    Closed,
}

struct ChannelPair {
    input: Arc<InputChannel>,
    output: Arc<OutputChannel>,
}

/// One tunnelled connection
pub struct TunnelSession {
    tunnel: TunnelKind,
    originator: bool,
    mux: Multiplexer,
    channels: OnceLock<ChannelPair>,
    remote: Mutex<Option<(String, u16)>>,
    state: watch::Sender<SessionState>,
    closed: AtomicBool,
}

impl TunnelSession {
    pub fn new(mux: Multiplexer, tunnel: TunnelKind, originator: bool) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Created);
        Arc::new(TunnelSession {
            tunnel,
            originator,
            mux,
            channels: OnceLock::new(),
            remote: Mutex::new(None),
            state,
            closed: AtomicBool::new(false),
        })
    }

    /// Bind the channel pair; only the first call has an effect
    pub fn attach(&self, input: Arc<InputChannel>, output: Arc<OutputChannel>) {
        let _ = self.channels.set(ChannelPair { input, output });
    }

    pub fn input(&self) -> Option<&Arc<InputChannel>> {
        self.channels.get().map(|pair| &pair.input)
    }

    pub fn output(&self) -> Option<&Arc<OutputChannel>> {
        self.channels.get().map(|pair| &pair.output)
    }

    pub fn tunnel_kind(&self) -> TunnelKind {
        self.tunnel
    }

    /// Whether this side issued the request
    pub fn is_originator(&self) -> bool {
        self.originator
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Address reported by the remote side
    pub fn remote(&self) -> Option<(String, u16)> {
        self.remote
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_remote(&self, host: String, port: u16) {
        *self.remote.lock().unwrap_or_else(PoisonError::into_inner) = Some((host, port));
    }

    /// Record the outcome of the request and wake any waiter
    pub fn set_result(&self, ok: bool) {
        self.state.send_if_modified(|state| match state {
            SessionState::Created | SessionState::AwaitingResult => {
                *state = if ok {
                    SessionState::Established
                } else {
                    SessionState::Failed
                };
                true
            }
            _ => false,
        });
    }

    /// Wait for [`set_result`](Self::set_result) or a close
    ///
    /// Returns `true` only for an established session.
    pub async fn wait_result(&self) -> bool {
        let mut rx = self.state.subscribe();
        self.state.send_if_modified(|state| {
            if *state == SessionState::Created {
                *state = SessionState::AwaitingResult;
                true
            } else {
                false
            }
        });
        let outcome = match rx
            .wait_for(|state| {
                matches!(
                    state,
                    SessionState::Established | SessionState::Failed | SessionState::Closed
                )
            })
            .await
        {
            Ok(state) => *state,
            Err(_) => SessionState::Closed,
        };
        outcome == SessionState::Established
    }

    /// Resolves once the session is closed
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close both channels and release their numbers
    ///
    /// Idempotent; safe to call from any task.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.state.send_replace(SessionState::Closed);

        if let Some(pair) = self.channels.get() {
            pair.input.close().await;
            pair.input.detach_sink().await;
            if let Err(e) = pair.output.close().await {
                debug!("Close signal for channel {} not sent: {}", pair.output.number(), e);
            }
            self.mux.release_input(&pair.input);
            self.mux.release_output(&pair.output);
            debug!(
                "{} session closed (in={}, out={})",
                self.tunnel,
                pair.input.number(),
                pair.output.number()
            );
        }
    }
}

#[async_trait]
impl Closeable for TunnelSession {
    async fn close(&self) {
        TunnelSession::close(self).await
    }
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("tunnel", &self.tunnel)
            .field("originator", &self.originator)
            .field("state", &self.state())
            .field("input", &self.input().map(|c| c.number()))
            .field("output", &self.output().map(|c| c.number()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::{MuxSettings, SessionSeed};
    use std::time::Duration;

    fn mux() -> Multiplexer {
        let (a, _b) = tokio::io::duplex(1024);
        Multiplexer::start(a, MuxSettings::default(), SessionSeed::from_u64(1))
    }

    #[tokio::test]
    async fn test_wait_result_success() {
        let session = TunnelSession::new(mux(), TunnelKind::Tcp, true);
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.wait_result().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.set_result(true);
        assert!(waiter.await.unwrap());
        assert_eq!(session.state(), SessionState::Established);

        // a late failure does not overwrite the outcome
        session.set_result(false);
        assert_eq!(session.state(), SessionState::Established);
    }

    #[tokio::test]
    async fn test_close_wakes_waiter_with_failure() {
        let session = TunnelSession::new(mux(), TunnelKind::Udp, true);
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.wait_result().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        session.close().await;
        session.close().await;
        assert!(!waiter.await.unwrap());
        assert!(session.is_closed());
        session.closed().await;
    }

    #[tokio::test]
    async fn test_close_releases_links() {
        use crate::mux::{ChannelType, SessionLink};

        let mux = mux();
        let session = TunnelSession::new(mux.clone(), TunnelKind::Tcp, true);
        let input = mux
            .link_input(ChannelType::DIRECT, SessionLink::Outgoing(session.clone()))
            .unwrap();
        let output = mux
            .link_output(ChannelType::DIRECT, SessionLink::Outgoing(session.clone()))
            .unwrap();
        session.attach(input.clone(), output.clone());

        session.close().await;
        assert!(input.is_closed());
        assert!(output.is_closed());
        assert!(input.link().is_none());
        assert!(output.link().is_none());
        assert_eq!(session.remote(), None);
    }
}
