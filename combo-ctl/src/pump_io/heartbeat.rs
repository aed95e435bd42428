//! Per-mode heartbeat tasks (spec §4.5, §5): CMD ping while in COMMAND_MODE,
//! RT keep-alive while in REMOTE_TERMINAL mode. Mutually exclusive with
//! each other and with themselves — `PumpIo` never runs more than one.

use crate::app::cmd;
use crate::app::rt::{self, RtSequence};
use crate::app::AppPacket;
use crate::transport::{self, OutgoingPacketInfo, TransportSession};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);

fn data_packet(payload: Vec<u8>) -> OutgoingPacketInfo {
    OutgoingPacketInfo {
        command: transport::command::DATA,
        reliable: true,
        payload,
        use_pairing_address: false,
        authenticated: true,
    }
}

/// Sends `CMD_PING` every 1000ms and awaits `CMD_PING_RESPONSE`. An error
/// ends this task only; it does not itself propagate to the session (a send
/// failure that is fatal to the session is already observed by
/// `TransportSession` directly).
pub struct CmdPingHeartbeat {
    handle: JoinHandle<()>,
}

impl CmdPingHeartbeat {
    pub fn stop(self) {
        self.handle.abort();
    }
}

pub fn start_cmd_ping(session: Arc<TransportSession>, logger: slog::Logger) -> CmdPingHeartbeat {
    let handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(HEARTBEAT_INTERVAL).await;

            let _guard = session.send_lock().lock().await;
            let packet = cmd::ping();
            let info = data_packet(packet.encode());

            match session.send_and_receive(info, Some(transport::command::DATA)).await {
                Ok(frame) => match AppPacket::decode(&frame.payload) {
                    Ok(app) if cmd::is_ping_response(&app) => {
                        slog::trace!(logger, "cmd ping acknowledged");
                    }
                    Ok(app) => {
                        slog::warn!(logger, "unexpected app packet in ping slot"; "command" => app.command);
                    }
                    Err(e) => {
                        slog::warn!(logger, "ping response failed to parse"; "error" => %e);
                    }
                },
                Err(e) => {
                    slog::warn!(logger, "cmd ping failed, stopping heartbeat"; "error" => %e);
                    break;
                }
            }
        }
    });

    CmdPingHeartbeat { handle }
}

/// Fires `RT_KEEP_ALIVE` only after 1000ms of outgoing-send inactivity;
/// `reset()` (called by `PumpIo` around every other send while in RT mode)
/// restarts the countdown, modeling "stopping+restarting the RT keep-alive
/// task" from spec §4.5 without literally respawning it each time.
pub struct RtKeepAlive {
    handle: JoinHandle<()>,
    reset: Arc<Notify>,
}

impl RtKeepAlive {
    pub fn reset(&self) {
        self.reset.notify_one();
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

pub fn start_rt_keep_alive(
    session: Arc<TransportSession>,
    seq: Arc<RtSequence>,
    logger: slog::Logger,
) -> RtKeepAlive {
    let reset = Arc::new(Notify::new());
    let reset_for_task = reset.clone();

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                    let _guard = session.send_lock().lock().await;
                    let packet = rt::keep_alive(seq.next());
                    let info = data_packet(packet.encode());
                    if let Err(e) = session.send(info).await {
                        slog::warn!(logger, "rt keep-alive failed, stopping heartbeat"; "error" => %e);
                        break;
                    }
                }
                _ = reset_for_task.notified() => {
                    // Some other send happened; restart the inactivity countdown.
                }
            }
        }
    });

    RtKeepAlive { handle, reset }
}
