//! One serial session against the controller.
//!
//! The wire has no length framing: a write frame is an instruction byte
//! followed by ASCII bytes that keep arriving until the line goes quiet
//! for the frame gap. [`serve`] runs one session to completion, handing
//! decoded commands to the controller and writing the acknowledgement or
//! reply bytes back.

use crate::controller::{Reply, Request};
use crate::protocol::{Command, Instruction, Query, Setpoint, ACK, GREETING, NAK};
use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::debug;

/// Upper bound on accumulated payload bytes for one write frame. Anything
/// near it is garbage; the decoder rejects payloads over its own limit.
const PAYLOAD_CAP: usize = 256;

/// Run one session until the peer hangs up.
pub async fn serve<T>(
    mut transport: T,
    requests: mpsc::Sender<Request>,
    frame_gap: Duration,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    transport
        .write_all(&[GREETING])
        .await
        .context("writing the session greeting")?;

    loop {
        let instruction = match transport.read_u8().await {
            Ok(byte) => byte,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err).context("reading an instruction byte"),
        };

        match Instruction::classify(instruction) {
            Instruction::Write(byte) => {
                let payload = read_payload(&mut transport, frame_gap).await?;
                debug!(
                    instruction = byte,
                    payload = %hex::encode(&payload),
                    "write frame"
                );
                match Setpoint::parse(byte, &payload) {
                    Ok(setpoint) => {
                        dispatch(&requests, Command::Set(setpoint)).await?;
                        transport.write_all(&[ACK]).await?;
                    }
                    Err(err) => {
                        debug!(%err, "rejecting write frame");
                        transport.write_all(&[NAK]).await?;
                    }
                }
            }
            Instruction::Read(byte) => match Query::from_byte(byte) {
                Ok(query) => {
                    let reply = dispatch(&requests, Command::Query(query)).await?;
                    if let Reply::Data(bytes) = reply {
                        transport.write_all(&bytes).await?;
                    }
                }
                Err(_) => {
                    debug!(instruction = byte, "ignoring unknown read");
                }
            },
        }
    }
}

/// Accumulate a write frame's payload until the line stays quiet for the
/// frame gap.
async fn read_payload<T>(transport: &mut T, frame_gap: Duration) -> Result<Vec<u8>>
where
    T: AsyncRead + Unpin,
{
    let mut payload = Vec::new();
    let mut buf = [0u8; 64];
    loop {
        match timeout(frame_gap, transport.read(&mut buf)).await {
            // Quiet: the frame is complete.
            Err(_) => break,
            // The peer hung up mid-frame; decode what arrived.
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                let take = n.min(PAYLOAD_CAP - payload.len());
                payload.extend_from_slice(&buf[..take]);
                if payload.len() == PAYLOAD_CAP {
                    break;
                }
            }
            Ok(Err(err)) => return Err(err).context("reading a write payload"),
        }
    }
    Ok(payload)
}

/// Hand one command to the controller and wait for its reply.
async fn dispatch(requests: &mpsc::Sender<Request>, command: Command) -> Result<Reply> {
    let (reply_tx, reply_rx) = oneshot::channel();
    let request = Request {
        command,
        reply: reply_tx,
    };
    requests.try_send(request).map_err(|err| match err {
        mpsc::error::TrySendError::Full(_) => anyhow!("controller command queue is full"),
        mpsc::error::TrySendError::Closed(_) => anyhow!("controller is gone"),
    })?;
    reply_rx.await.context("controller dropped the request")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::task::JoinHandle;

    const GAP: Duration = Duration::from_millis(100);

    /// Answers like the controller does: every write is acknowledged,
    /// status reads report idle, other reads get a fixed voltage.
    fn stub_controller() -> (mpsc::Sender<Request>, JoinHandle<Vec<Command>>) {
        let (tx, mut rx) = mpsc::channel::<Request>(16);
        let handle = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(request) = rx.recv().await {
                seen.push(request.command.clone());
                let reply = match &request.command {
                    Command::Set(_) => Reply::Ack,
                    Command::Query(Query::Status) => Reply::Data(b"0".to_vec()),
                    Command::Query(_) => Reply::Data(b"3.85000".to_vec()),
                };
                let _ = request.reply.send(reply);
            }
            seen
        });
        (tx, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn a_session_opens_with_the_greeting() {
        let (device, mut host) = duplex(1024);
        let (tx, _commands) = stub_controller();
        tokio::spawn(serve(device, tx, GAP));

        assert_eq!(host.read_u8().await.unwrap(), GREETING);
    }

    #[tokio::test(start_paused = true)]
    async fn a_write_frame_is_dispatched_and_acknowledged() {
        let (device, mut host) = duplex(1024);
        let (tx, commands) = stub_controller();
        tokio::spawn(serve(device, tx, GAP));

        assert_eq!(host.read_u8().await.unwrap(), GREETING);
        host.write_all(b"\x853.90").await.unwrap();
        assert_eq!(host.read_u8().await.unwrap(), ACK);

        drop(host);
        let seen = commands.await.unwrap();
        assert_eq!(seen, vec![Command::Set(Setpoint::TargetVoltage(3.9))]);
    }

    #[tokio::test(start_paused = true)]
    async fn a_payload_split_by_short_pauses_still_parses() {
        let (device, mut host) = duplex(1024);
        let (tx, commands) = stub_controller();
        tokio::spawn(serve(device, tx, GAP));

        assert_eq!(host.read_u8().await.unwrap(), GREETING);
        host.write_all(b"\x873").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        host.write_all(b"2").await.unwrap();
        assert_eq!(host.read_u8().await.unwrap(), ACK);

        drop(host);
        let seen = commands.await.unwrap();
        assert_eq!(seen, vec![Command::Set(Setpoint::DwellSecs(32))]);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_writes_are_refused() {
        let (device, mut host) = duplex(1024);
        let (tx, commands) = stub_controller();
        tokio::spawn(serve(device, tx, GAP));

        assert_eq!(host.read_u8().await.unwrap(), GREETING);

        // Unknown write instruction.
        host.write_all(b"\x905").await.unwrap();
        assert_eq!(host.read_u8().await.unwrap(), NAK);

        // Numeric field that does not parse.
        host.write_all(b"\x85abc").await.unwrap();
        assert_eq!(host.read_u8().await.unwrap(), NAK);

        // Instruction with no payload before the line went quiet.
        host.write_all(b"\x85").await.unwrap();
        assert_eq!(host.read_u8().await.unwrap(), NAK);

        drop(host);
        // Nothing malformed ever reached the controller.
        assert!(commands.await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn an_unknown_read_is_silently_ignored() {
        let (device, mut host) = duplex(1024);
        let (tx, _commands) = stub_controller();
        tokio::spawn(serve(device, tx, GAP));

        assert_eq!(host.read_u8().await.unwrap(), GREETING);
        host.write_all(&[0x07]).await.unwrap();
        host.write_all(&[Query::Status.byte()]).await.unwrap();

        // The first byte back answers the status query, not the unknown
        // instruction.
        assert_eq!(host.read_u8().await.unwrap(), b'0');
    }
}
