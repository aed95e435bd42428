//! Pump I/O: the session orchestrator (spec §4.5). Owns the pairing and
//! connected-mode machinery, the two state machines, and button-press
//! coordination; exposes the public operations a caller actually drives.

pub mod buttons;
pub mod connect;
pub mod heartbeat;
pub mod pairing;

use crate::app::cmd::{self, BolusKind, BolusStatus, ErrorWarningStatus, HistoryEvent, PumpDateTime, PumpStatus};
use crate::app::ctrl;
use crate::app::display::DisplayFrame;
use crate::app::rt::RtSequence;
use crate::app::{service, AppPacket};
use crate::error::{ComboError, Result};
use crate::external::{DeviceDisconnect, PinCallback, PumpStateStore, RfcommStream};
use crate::transport::classify::PacketClassifier;
use crate::transport::{self, OutgoingPacketInfo, TransportSession};
use async_trait::async_trait;
use buttons::{BarrierWaiter, ButtonBarrier, LongPress};
use heartbeat::{CmdPingHeartbeat, RtKeepAlive};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// A session mode; `None` (not represented here, see `PumpIo::mode`) is the
/// initial state before the first activation (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    RemoteTerminal,
    Command,
}

impl Mode {
    fn service_id(self) -> u8 {
        match self {
            Mode::RemoteTerminal => service::RT_MODE,
            Mode::Command => service::COMMAND_MODE,
        }
    }
}

/// Observer events `PumpIo` pushes to an optional subscriber instead of
/// requiring the caller to poll (SPEC_FULL.md §2 — additive, not in
/// spec.md).
#[derive(Debug, Clone)]
pub enum ComboCtlEvent {
    DisplayFrameReady(DisplayFrame),
    ModeChanged(Mode),
}

/// The collaborators `PumpIo` is constructed with (spec §1.3/§6): every
/// external dependency is an injected trait object, not a singleton.
pub struct PumpIoConfig {
    pub stream: Box<dyn RfcommStream>,
    pub store: Arc<dyn PumpStateStore>,
    pub pump_addr: String,
    pub pin_callback: Arc<dyn PinCallback>,
    pub disconnect_callback: Arc<dyn DeviceDisconnect + Send + Sync>,
    pub events: Option<mpsc::Sender<ComboCtlEvent>>,
    pub logger: slog::Logger,
}

enum HeartbeatHandle {
    Cmd(CmdPingHeartbeat),
    Rt(RtKeepAlive),
}

pub struct PumpIo {
    session: Arc<TransportSession>,
    store: Arc<dyn PumpStateStore>,
    pump_addr: String,
    pin_callback: Arc<dyn PinCallback>,
    disconnect_callback: Arc<dyn DeviceDisconnect + Send + Sync>,
    logger: slog::Logger,

    rt_seq: Arc<RtSequence>,
    display: Arc<Mutex<crate::app::display::DisplayAssembler>>,
    barrier: Arc<ButtonBarrier>,
    barrier_waiter_template: BarrierWaiter,
    events: Option<mpsc::Sender<ComboCtlEvent>>,

    mode: Mutex<Option<Mode>>,
    connected: Mutex<bool>,
    heartbeat: Mutex<Option<HeartbeatHandle>>,
    long_press: Mutex<Option<LongPress>>,
}

/// Runs `fut` on a detached task and awaits it, so dropping/cancelling the
/// calling future cannot abort `fut` partway through (spec §5, §9:
/// "non-cancellable scope").
async fn non_cancellable<F>(fut: F) -> F::Output
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(out) => out,
        Err(_) => panic!("non-cancellable teardown task was aborted or panicked"),
    }
}

/// Sends one app packet as a DATA frame and decodes the response. Shared by
/// `app_round_trip_locked` and the non-cancellable mode-switch scope, which
/// cannot borrow `self` across a `tokio::spawn` boundary.
async fn send_app_packet(session: &TransportSession, packet: AppPacket) -> Result<AppPacket> {
    let info = OutgoingPacketInfo {
        command: transport::command::DATA,
        reliable: true,
        payload: packet.encode(),
        use_pairing_address: false,
        authenticated: true,
    };
    let frame = session.send_and_receive(info, Some(transport::command::DATA)).await?;
    AppPacket::decode(&frame.payload)
}

impl PumpIo {
    pub fn new(config: PumpIoConfig) -> PumpIo {
        let (barrier, barrier_waiter_template) = ButtonBarrier::new();

        PumpIo {
            session: Arc::new(TransportSession::new(
                config.stream,
                config.store.clone(),
                config.pump_addr.clone(),
                config.logger.clone(),
            )),
            store: config.store,
            pump_addr: config.pump_addr,
            pin_callback: config.pin_callback,
            disconnect_callback: config.disconnect_callback,
            logger: config.logger,
            rt_seq: Arc::new(RtSequence::new()),
            display: Arc::new(Mutex::new(crate::app::display::DisplayAssembler::new())),
            barrier,
            barrier_waiter_template,
            events: config.events,
            mode: Mutex::new(None),
            connected: Mutex::new(false),
            heartbeat: Mutex::new(None),
            long_press: Mutex::new(None),
        }
    }

    fn new_barrier_waiter(&self) -> BarrierWaiter {
        self.barrier_waiter_template.clone()
    }

    async fn emit(&self, event: ComboCtlEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    async fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat.lock().await.take() {
            match handle {
                HeartbeatHandle::Cmd(h) => h.stop(),
                HeartbeatHandle::Rt(h) => h.stop(),
            }
        }
    }

    async fn start_heartbeat_for(&self, mode: Mode) {
        let handle = match mode {
            Mode::Command => {
                HeartbeatHandle::Cmd(heartbeat::start_cmd_ping(self.session.clone(), self.logger.clone()))
            }
            Mode::RemoteTerminal => HeartbeatHandle::Rt(heartbeat::start_rt_keep_alive(
                self.session.clone(),
                self.rt_seq.clone(),
                self.logger.clone(),
            )),
        };
        *self.heartbeat.lock().await = Some(handle);
    }

    /// Called around every outgoing send while in RT mode so the keep-alive
    /// countdown restarts (spec §4.5: "any other outgoing send call resets
    /// the timer").
    async fn notify_send_activity(&self) {
        if let Some(HeartbeatHandle::Rt(rt)) = &*self.heartbeat.lock().await {
            rt.reset();
        }
    }

    fn connected_classifier(&self) -> Arc<dyn PacketClassifier> {
        Arc::new(ConnectedClassifier {
            display: self.display.clone(),
            barrier: self.barrier.clone(),
            events: self.events.clone(),
        })
    }

    pub async fn is_connected(&self) -> bool {
        *self.connected.lock().await
    }

    pub async fn current_mode(&self) -> Option<Mode> {
        *self.mode.lock().await
    }

    /// Runs the pairing handshake (spec §4.5 steps 1-14). Ends with the
    /// pump disconnected either way; call `connect()` afterward to open the
    /// long-lived session.
    pub async fn pair(&self) -> Result<()> {
        pairing::pair(
            self.session.clone(),
            self.store.as_ref(),
            &self.pump_addr,
            self.pin_callback.as_ref(),
            self.disconnect_callback.clone(),
            &self.logger,
        )
        .await
    }

    /// Connect state machine (spec §4.5): requires a previously paired
    /// pump and no existing connection.
    pub async fn connect(&self, initial_mode: Mode, run_heartbeat: bool) -> Result<()> {
        if *self.connected.lock().await {
            return Err(ComboError::InvalidPayload);
        }

        let invariant = self.store.get_invariant_data(&self.pump_addr).await?;
        let tx_nonce = self.store.get_current_tx_nonce(&self.pump_addr).await?;
        self.session.cache_invariant_data(invariant).await;
        self.session.set_initial_tx_nonce(tx_nonce).await?;

        self.display.lock().await.reset();
        // Button-confirmation barrier: each press takes a fresh waiter
        // cloned from `barrier_waiter_template` and drains it before use
        // (see `buttons::BarrierWaiter::drain`), so there is no leftover
        // signal to reset here.

        self.session.start(self.connected_classifier()).await;

        {
            let session = self.session.clone();
            let barrier = self.barrier.clone();
            tokio::spawn(async move {
                session.wait_failed().await;
                barrier.fail();
            });
        }

        let guard = self.session.send_lock().lock().await;
        let result: Result<()> = async {
            connect::open_regular_connection(&self.session).await?;
            self.app_round_trip_locked(ctrl::connect()).await?;
            Ok(())
        }
        .await;
        drop(guard);

        if let Err(e) = result {
            let session = self.session.clone();
            let disconnect_cb = self.disconnect_callback.clone();
            let packet = self.disconnect_packet();
            non_cancellable(async move {
                session.stop(packet, disconnect_cb.as_ref()).await;
            })
            .await;
            return Err(e);
        }

        *self.connected.lock().await = true;

        if let Err(e) = self.switch_mode(initial_mode, run_heartbeat).await {
            let _ = self.disconnect().await;
            return Err(e);
        }

        Ok(())
    }

    fn disconnect_packet(&self) -> OutgoingPacketInfo {
        OutgoingPacketInfo {
            command: transport::command::DATA,
            reliable: true,
            payload: ctrl::disconnect().encode(),
            use_pairing_address: false,
            authenticated: true,
        }
    }

    /// Tears the connection down: stops heartbeats and any long press,
    /// releases the button barrier, sends CTRL_DISCONNECT, stops the
    /// receiver, and invokes the disconnect callback.
    pub async fn disconnect(&self) -> Result<()> {
        self.stop_heartbeat().await;
        if let Some(lp) = self.long_press.lock().await.take() {
            lp.stop();
        }
        self.barrier.stop();

        let session = self.session.clone();
        let disconnect_cb = self.disconnect_callback.clone();
        let packet = self.disconnect_packet();
        non_cancellable(async move {
            session.stop(packet, disconnect_cb.as_ref()).await;
        })
        .await;

        *self.connected.lock().await = false;
        *self.mode.lock().await = None;
        Ok(())
    }

    /// Mode switching (spec §4.5): runs under the caller's send lock,
    /// deactivates the current service if any, activates the new one, and
    /// starts the matching heartbeat. The deactivate/activate round trips
    /// run in a non-cancellable scope (spec §5, §9) so a caller dropping the
    /// future mid-switch cannot abandon the pump in a half-activated state.
    pub async fn switch_mode(&self, new_mode: Mode, run_heartbeat: bool) -> Result<()> {
        self.stop_heartbeat().await;
        self.display.lock().await.reset();

        let guard = self.session.send_lock().lock().await;
        let current = *self.mode.lock().await;
        let session = self.session.clone();

        non_cancellable(async move {
            if let Some(mode) = current {
                send_app_packet(&session, ctrl::deactivate_service(mode.service_id())).await?;
            }
            send_app_packet(&session, ctrl::activate_service(new_mode.service_id())).await?;
            Ok(())
        })
        .await?;
        self.notify_send_activity().await;
        drop(guard);

        if new_mode == Mode::RemoteTerminal {
            self.rt_seq.reset();
        }

        *self.mode.lock().await = Some(new_mode);
        self.emit(ComboCtlEvent::ModeChanged(new_mode)).await;

        if run_heartbeat {
            self.start_heartbeat_for(new_mode).await;
        }

        Ok(())
    }

    /// Sends one app packet as a DATA frame and decodes the response.
    /// Caller must already hold `session.send_lock()`.
    async fn app_round_trip_locked(&self, packet: AppPacket) -> Result<AppPacket> {
        let result = send_app_packet(&self.session, packet).await;
        self.notify_send_activity().await;
        result
    }

    async fn app_round_trip(&self, packet: AppPacket) -> Result<AppPacket> {
        let _guard = self.session.send_lock().lock().await;
        self.app_round_trip_locked(packet).await
    }

    pub async fn send_short_rt_button_press(&self, buttons: &[u8]) -> Result<()> {
        if self.current_mode().await != Some(Mode::RemoteTerminal) || !self.is_connected().await {
            return Err(ComboError::InvalidPayload);
        }
        if self.long_press.lock().await.is_some() {
            return Err(ComboError::InvalidPayload);
        }

        let _guard = self.session.send_lock().lock().await;
        let mut waiter = self.new_barrier_waiter();
        let result = buttons::short_press(&self.session, &self.rt_seq, &mut waiter, buttons).await;
        self.notify_send_activity().await;
        result
    }

    pub async fn start_long_rt_button_press(
        &self,
        buttons: Vec<u8>,
        keep_going: impl FnMut() -> bool + Send + 'static,
    ) -> Result<()> {
        if self.current_mode().await != Some(Mode::RemoteTerminal) || !self.is_connected().await {
            return Err(ComboError::InvalidPayload);
        }

        let mut long_press = self.long_press.lock().await;
        if long_press.is_some() {
            return Err(ComboError::InvalidPayload);
        }

        let waiter = self.new_barrier_waiter();
        let handle = buttons::start_long_press(
            self.session.clone(),
            self.rt_seq.clone(),
            waiter,
            buttons,
            keep_going,
            self.logger.clone(),
        );
        *long_press = Some(handle);
        Ok(())
    }

    pub async fn stop_long_rt_button_press(&self) {
        if let Some(lp) = self.long_press.lock().await.take() {
            lp.stop();
        }
        self.barrier.stop();
    }

    async fn require_command_mode(&self) -> Result<()> {
        if !self.is_connected().await || self.current_mode().await != Some(Mode::Command) {
            return Err(ComboError::InvalidPayload);
        }
        Ok(())
    }

    pub async fn read_date_time(&self) -> Result<PumpDateTime> {
        self.require_command_mode().await?;
        let response = self.app_round_trip(cmd::read_date_time()).await?;
        cmd::parse_date_time(&response)
    }

    pub async fn read_pump_status(&self) -> Result<PumpStatus> {
        self.require_command_mode().await?;
        let response = self.app_round_trip(cmd::read_pump_status()).await?;
        cmd::parse_pump_status(&response)
    }

    pub async fn read_error_warning_status(&self) -> Result<ErrorWarningStatus> {
        self.require_command_mode().await?;
        let response = self.app_round_trip(cmd::read_error_warning_status()).await?;
        cmd::parse_error_warning_status(&response)
    }

    pub async fn get_bolus_status(&self, bolus_id: u8) -> Result<BolusStatus> {
        self.require_command_mode().await?;
        let response = self.app_round_trip(cmd::get_bolus_status(bolus_id)).await?;
        cmd::parse_bolus_status(&response)
    }

    pub async fn deliver_bolus(
        &self,
        kind: BolusKind,
        amount: u16,
        immediate_amount: u16,
        duration_minutes: u16,
    ) -> Result<u8> {
        self.require_command_mode().await?;
        let response = self
            .app_round_trip(cmd::deliver_bolus(kind, amount, immediate_amount, duration_minutes))
            .await?;
        cmd::parse_deliver_bolus_response(&response)
    }

    pub async fn cancel_bolus(&self, bolus_id: u8) -> Result<()> {
        self.require_command_mode().await?;
        self.app_round_trip(cmd::cancel_bolus(bolus_id)).await?;
        Ok(())
    }

    /// Retrieves the full history delta via repeated read/confirm pairs
    /// (spec §4.4). Corrupted blocks are logged and retried rather than
    /// failing the whole operation; exceeding `max_requests` (caller must
    /// pass >= 10, spec §4.4) is `InfiniteHistoryData`.
    pub async fn read_history_delta(&self, max_requests: u32) -> Result<Vec<HistoryEvent>> {
        self.require_command_mode().await?;
        if max_requests < 10 {
            return Err(ComboError::InvalidPayload);
        }

        let mut events = Vec::new();
        let mut block_index: u16 = 0;
        let mut requests = 0u32;

        loop {
            if requests >= max_requests {
                return Err(ComboError::InfiniteHistoryData);
            }
            requests += 1;

            let response = match self.app_round_trip(cmd::read_history_block(block_index)).await {
                Ok(r) => r,
                Err(e) => {
                    slog::warn!(self.logger, "history block request failed, retrying"; "error" => %e);
                    continue;
                }
            };

            let block = match cmd::parse_history_block(&response) {
                Ok(block) => block,
                Err(e) => {
                    slog::warn!(self.logger, "corrupted history block, retrying"; "error" => %e);
                    continue;
                }
            };

            let collected_before_block = events.len();
            events.extend(block.events.iter().cloned());
            self.app_round_trip(cmd::confirm_history_block(block_index)).await?;

            if cmd::is_history_complete(&block, collected_before_block) {
                return Ok(events);
            }

            block_index = block_index.wrapping_add(1);
        }
    }
}

struct ConnectedClassifier {
    display: Arc<Mutex<crate::app::display::DisplayAssembler>>,
    barrier: Arc<ButtonBarrier>,
    events: Option<mpsc::Sender<ComboCtlEvent>>,
}

#[async_trait]
impl PacketClassifier for ConnectedClassifier {
    async fn classify(&self, frame: &crate::framer::Frame) -> Result<crate::transport::ClassifyOutcome> {
        use crate::app::rt;
        use crate::transport::ClassifyOutcome;

        if frame.command != transport::command::DATA {
            return Ok(ClassifyOutcome::Forward);
        }

        let app = match AppPacket::decode(&frame.payload) {
            Ok(app) => app,
            Err(_) => return Ok(ClassifyOutcome::Forward),
        };

        if ctrl::is_service_error(&app) {
            let code = ctrl::parse_service_error(&app).unwrap_or(0xFF);
            return Err(ComboError::ServiceError { code });
        }

        if rt::is_display(&app) {
            if let Ok(row) = rt::parse_display(&app) {
                let mut assembler = self.display.lock().await;
                let completed = assembler.feed(&row);
                drop(assembler);
                if let Some(frame) = completed {
                    if let Some(tx) = &self.events {
                        let _ = tx.send(ComboCtlEvent::DisplayFrameReady(frame)).await;
                    }
                }
            }
            self.barrier.confirm();
            return Ok(ClassifyOutcome::Drop);
        }

        if rt::is_button_confirmation(&app) {
            self.barrier.confirm();
            return Ok(ClassifyOutcome::Drop);
        }

        Ok(ClassifyOutcome::Forward)
    }
}
