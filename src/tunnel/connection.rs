//! One multiplexed connection: the engine plus its control task

use super::control::run_control;
use crate::config::TunnelConfig;
use crate::error::{Result, TunnelError};
use crate::mux::{ChannelType, Multiplexer, OutputChannel, SessionLink};
use crate::protocol::{ControlMessage, EndianReader, EndianWriter};
use crate::transport::Dialer;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct ConnectionShared {
    mux: Multiplexer,
    config: TunnelConfig,
    dialer: Arc<dyn Dialer>,
    control_output: Arc<OutputChannel>,
    control_task: Mutex<Option<JoinHandle<()>>>,
}

/// A running connection; clones share it
#[derive(Clone)]
pub struct TunnelConnection {
    shared: Arc<ConnectionShared>,
}

impl TunnelConnection {
    /// Take over `transport`, start the packet reader and the control task
    ///
    /// Both peers must use the same token and control channel.
    pub async fn start<T>(transport: T, config: TunnelConfig, dialer: Arc<dyn Dialer>) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;
        let mux = Multiplexer::start(transport, config.mux_settings(), config.seed());

        let control = config.control_channel;
        let control_input = mux.link_input_number(ChannelType::BUFFERED, control, SessionLink::Control)?;
        let control_output =
            mux.link_output_number(ChannelType::BUFFERED, control, SessionLink::Control)?;
        let reader = control_input.reader().await?;

        let connection = TunnelConnection {
            shared: Arc::new(ConnectionShared {
                mux,
                config,
                dialer,
                control_output,
                control_task: Mutex::new(None),
            }),
        };
        let handle = tokio::spawn(run_control(
            connection.clone(),
            EndianReader::little(reader),
        ));
        *connection
            .shared
            .control_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!("Tunnel connection started (control channel {})", control);
        Ok(connection)
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.shared.mux
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.shared.config
    }

    pub fn dialer(&self) -> &Arc<dyn Dialer> {
        &self.shared.dialer
    }

    /// Write one message on the control channel
    pub async fn send_control(&self, message: &ControlMessage) -> Result<()> {
        let text = message.encode();
        let mut writer = EndianWriter::little(Vec::with_capacity(text.len() + 4));
        writer.write_string(&text).await?;
        debug!("Sending control message {:?}", text);
        self.shared.control_output.write(&writer.into_inner()).await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.mux.is_closed()
    }

    /// Resolves once the connection has started closing
    pub async fn closed(&self) {
        self.shared.mux.closed().await
    }

    /// Close the engine, every session and the control task
    pub async fn close(&self) {
        self.shared.mux.stop().await;
        let handle = self
            .shared
            .control_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub(crate) fn closed_error() -> TunnelError {
        TunnelError::Closed("connection closed".to_string())
    }
}

impl std::fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("mux", &self.shared.mux)
            .field("control_channel", &self.shared.config.control_channel)
            .finish()
    }
}
