//! Relay between a session's socket and its channel pair

use super::session::TunnelSession;
use crate::error::{Result, TunnelError};
use crate::mux::{Closeable, PipeKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tracing::{debug, trace};

fn not_attached() -> TunnelError {
    TunnelError::Closed("session has no channels".to_string())
}

/// Route inbound channel data into `writer`
///
/// Direct channels write straight into it from the engine reader and close
/// the session with the channel. Buffered channels get a copy task.
pub async fn wire_inbound<W>(session: &Arc<TunnelSession>, writer: W) -> Result<()>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let input = session.input().ok_or_else(not_attached)?.clone();
    match input.pipe_kind() {
        PipeKind::Direct => {
            let owner: Arc<dyn Closeable> = session.clone();
            input.set_sink(Box::new(writer), Some(owner)).await;
        }
        PipeKind::Buffered => {
            let mut reader = input.reader().await?;
            let session = session.clone();
            let mut writer = writer;
            tokio::spawn(async move {
                match tokio::io::copy(&mut reader, &mut writer).await {
                    Ok(n) => trace!("Channel {} drained after {} bytes", input.number(), n),
                    Err(e) => debug!("Channel {} copy failed: {}", input.number(), e),
                }
                let _ = writer.shutdown().await;
                session.close().await;
            });
        }
    }
    Ok(())
}

/// Split `stream`, wire its write half as the inbound sink and return the
/// read half for [`pump_outbound`]
pub async fn attach_stream<S>(session: &Arc<TunnelSession>, stream: S) -> Result<ReadHalf<S>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    wire_inbound(session, write_half).await?;
    Ok(read_half)
}

async fn read_chunk<R>(reader: &mut R, buf: &mut [u8], limit: Option<Duration>) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, reader.read(buf))
            .await
            .map_err(|_| TunnelError::Timeout(format!("no data for {:?}", limit)))?
            .map_err(TunnelError::from),
        None => reader.read(buf).await.map_err(TunnelError::from),
    }
}

/// Copy `reader` into the session's output until either side is done, then
/// close the session
pub async fn pump_outbound<R>(session: Arc<TunnelSession>, mut reader: R, data_timeout: Option<Duration>)
where
    R: AsyncRead + Unpin,
{
    let output = match session.output() {
        Some(output) => output.clone(),
        None => return session.close().await,
    };
    let mut buf = vec![0u8; crate::helper::DEFAULT_BUFFER_SIZE];

    let pump = async {
        loop {
            let n = read_chunk(&mut reader, &mut buf, data_timeout).await?;
            if n == 0 {
                return Ok::<(), TunnelError>(());
            }
            output.write(&buf[..n]).await?;
        }
    };

    tokio::select! {
        result = pump => match result {
            Ok(()) => debug!("Local end of channel {} finished", output.number()),
            Err(e) => debug!("Relay on channel {} stopped: {}", output.number(), e),
        },
        _ = session.closed() => trace!("Session on channel {} closed", output.number()),
    }
    session.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::{ChannelType, MuxSettings, Multiplexer, SessionLink, SessionSeed};
    use crate::protocol::TunnelKind;

    fn pair() -> (Multiplexer, Multiplexer) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let seed = SessionSeed::from_u64(42);
        (
            Multiplexer::start(a, MuxSettings::default(), seed),
            Multiplexer::start(b, MuxSettings::default(), seed),
        )
    }

    fn session_on(mux: &Multiplexer, ty: ChannelType) -> Arc<TunnelSession> {
        let session = TunnelSession::new(mux.clone(), TunnelKind::Tcp, true);
        let input = mux
            .link_input(ty, SessionLink::Outgoing(session.clone()))
            .unwrap();
        let output = mux
            .link_output(ty, SessionLink::Outgoing(session.clone()))
            .unwrap();
        session.attach(input, output);
        session
    }

    #[tokio::test]
    async fn test_pump_and_wire_over_engine() {
        for ty in [ChannelType::DIRECT, ChannelType::BUFFERED] {
            let (left, right) = pair();
            let a = session_on(&left, ty);
            let b = session_on(&right, ty);

            let (user_a, inner_a) = tokio::io::duplex(4096);
            let (mut user_b, inner_b) = tokio::io::duplex(4096);
            let read_a = attach_stream(&a, inner_a).await.unwrap();
            let read_b = attach_stream(&b, inner_b).await.unwrap();
            tokio::spawn(pump_outbound(a.clone(), read_a, None));
            tokio::spawn(pump_outbound(b.clone(), read_b, None));

            let (mut user_a_read, mut user_a_write) = tokio::io::split(user_a);
            user_a_write.write_all(b"ping").await.unwrap();
            let mut buf = [0u8; 4];
            user_b.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");

            // closing one end tears both sessions down
            drop(user_b);
            let mut rest = Vec::new();
            user_a_read.read_to_end(&mut rest).await.unwrap();
            tokio::time::timeout(Duration::from_secs(2), a.closed())
                .await
                .unwrap();
            assert!(b.is_closed());
        }
    }

    #[tokio::test]
    async fn test_data_timeout_closes_session() {
        let (left, _right) = pair();
        let session = session_on(&left, ChannelType::DIRECT);
        let (_user, inner) = tokio::io::duplex(64);
        let read_half = attach_stream(&session, inner).await.unwrap();

        pump_outbound(session.clone(), read_half, Some(Duration::from_millis(20))).await;
        assert!(session.is_closed());
    }
}
