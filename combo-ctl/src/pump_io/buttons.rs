//! The button-confirmation barrier and short/long RT button press
//! coordination (spec §4.5).

use crate::app::rt::{self, button, RtSequence};
use crate::error::{ComboError, Result};
use crate::transport::{OutgoingPacketInfo, TransportSession};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// What the barrier delivers to a waiter (spec §4.5, §7): a confirmation
/// from the pump, an externally-requested stop (disconnect), or the cause
/// of a fatal packet-receiver failure.
#[derive(Debug, Clone)]
enum Signal {
    Confirmed,
    Stop,
    Failed,
}

/// Single-slot, conflated, latest-wins channel of button-press outcomes
/// (spec §4.5 "Button-confirmation barrier"). The sending half is held by
/// the connected-mode packet classifier and by `disconnect()`; the
/// receiving half by the short/long press coordinators below.
pub struct ButtonBarrier {
    tx: watch::Sender<Option<Signal>>,
}

pub struct BarrierWaiter {
    rx: watch::Receiver<Option<Signal>>,
}

impl ButtonBarrier {
    pub fn new() -> (Arc<ButtonBarrier>, BarrierWaiter) {
        let (tx, rx) = watch::channel(None);
        (Arc::new(ButtonBarrier { tx }), BarrierWaiter { rx })
    }

    /// Populated by the receiver task on RT_DISPLAY or RT_BUTTON_CONFIRMATION.
    pub fn confirm(&self) {
        let _ = self.tx.send(Some(Signal::Confirmed));
    }

    /// Populated by `disconnect()`.
    pub fn stop(&self) {
        let _ = self.tx.send(Some(Signal::Stop));
    }

    /// Closes the barrier on packet-receiver failure, propagating the cause
    /// to any waiter.
    pub fn fail(&self) {
        let _ = self.tx.send(Some(Signal::Failed));
    }
}

impl BarrierWaiter {
    /// Marks whatever is currently pending as seen without blocking, so a
    /// stale confirmation from a previous round can't be mistaken for the
    /// one belonging to the press about to be sent.
    pub fn drain(&mut self) {
        self.rx.borrow_and_update();
    }

    /// Blocks until the next signal arrives. `Ok(true)` means confirmed,
    /// `Ok(false)` means a stop was requested, `Err` means the barrier
    /// closed due to a fatal receiver error.
    pub async fn wait(&mut self) -> Result<bool> {
        self.rx
            .changed()
            .await
            .map_err(|_| ComboError::PacketReceiverClosed)?;

        match &*self.rx.borrow_and_update() {
            Some(Signal::Confirmed) => Ok(true),
            Some(Signal::Stop) => Ok(false),
            Some(Signal::Failed) => Err(ComboError::PacketReceiverClosed),
            None => Ok(false),
        }
    }
}

fn button_status_packet(seq: &RtSequence, code: u8, changed: bool) -> OutgoingPacketInfo {
    let packet = rt::button_status(seq.next(), code, changed);
    OutgoingPacketInfo {
        command: crate::transport::command::DATA,
        reliable: true,
        payload: packet.encode(),
        use_pairing_address: false,
        authenticated: true,
    }
}

/// Sends `RT_BUTTON_STATUS(NO_BUTTON, changed=true)` in a context the caller
/// must ensure is non-cancellable, with an optional pre-delay for exception
/// paths (spec §4.5, §9 — the 200ms pre-delay's exact purpose versus
/// `PACKET_SEND_INTERVAL` is one of the preserved open questions).
async fn send_no_button(
    session: &TransportSession,
    seq: &RtSequence,
    pre_delay_on_exception: bool,
) {
    if pre_delay_on_exception {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    let _ = session.send(button_status_packet(seq, button::NO_BUTTON, true)).await;
}

/// Runs a short RT button press to completion (spec §4.5). The caller must
/// hold `session.send_lock()` for the duration of this call so the whole
/// sequence is atomic with respect to other send+receive operations.
pub async fn short_press(
    session: &TransportSession,
    seq: &RtSequence,
    waiter: &mut BarrierWaiter,
    buttons: &[u8],
) -> Result<()> {
    if buttons.is_empty() {
        return Err(ComboError::InvalidPayload);
    }
    let code = rt::combine_buttons(buttons);

    waiter.drain();
    let send_result = session.send(button_status_packet(seq, code, true)).await;

    let outcome = match send_result {
        Ok(()) => waiter.wait().await,
        Err(e) => Err(e),
    };

    send_no_button(session, seq, outcome.is_err()).await;
    outcome.map(|_| ())
}

/// A running long RT button press (spec §4.5): `stop()` requests a clean
/// exit, mirroring `disconnect()` populating the barrier with `Stop`.
pub struct LongPress {
    handle: tokio::task::JoinHandle<()>,
}

impl LongPress {
    pub fn stop(self) {
        self.handle.abort();
    }
}

/// Starts the long-press loop described in spec §4.5: each iteration sends
/// `RT_BUTTON_STATUS(code, changed=keep_going())` -- `keep_going`'s result
/// is the send's own `changed` flag, not just a continue/stop switch, so
/// the call that returns `false` still gets sent (with `changed=false`)
/// before the loop exits. Any exit path converges on sending NO_BUTTON.
pub fn start_long_press(
    session: Arc<TransportSession>,
    seq: Arc<RtSequence>,
    mut waiter: BarrierWaiter,
    buttons: Vec<u8>,
    mut keep_going: impl FnMut() -> bool + Send + 'static,
    logger: slog::Logger,
) -> LongPress {
    let code = rt::combine_buttons(&buttons);

    let handle = tokio::spawn(async move {
        let _permit = session.send_lock().lock().await;

        let mut exited_via_exception = false;

        loop {
            let going = keep_going();

            waiter.drain();

            if let Err(e) = session.send(button_status_packet(&seq, code, going)).await {
                slog::warn!(logger, "long press send failed"; "error" => %e);
                exited_via_exception = true;
                break;
            }

            match waiter.wait().await {
                Ok(true) => {
                    if !going {
                        break;
                    }
                }
                Ok(false) => break,
                Err(e) => {
                    slog::warn!(logger, "long press barrier closed"; "error" => %e);
                    exited_via_exception = true;
                    break;
                }
            }
        }

        send_no_button(&session, &seq, exited_via_exception).await;
    });

    LongPress { handle }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn barrier_delivers_confirm_then_stop() {
        let (barrier, mut waiter) = ButtonBarrier::new();
        barrier.confirm();
        assert!(waiter.wait().await.unwrap());

        barrier.stop();
        assert!(!waiter.wait().await.unwrap());
    }

    #[tokio::test]
    async fn barrier_fail_propagates_as_error() {
        let (barrier, mut waiter) = ButtonBarrier::new();
        barrier.fail();
        assert!(waiter.wait().await.is_err());
    }

    #[tokio::test]
    async fn drain_discards_stale_signal() {
        let (barrier, mut waiter) = ButtonBarrier::new();
        barrier.confirm();
        waiter.drain();
        barrier.confirm();
        assert!(waiter.wait().await.unwrap());
    }
}
