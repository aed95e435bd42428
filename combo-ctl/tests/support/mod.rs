pub mod loopback;
pub mod store;

use combo_ctl::cipher::{self, Key};
use combo_ctl::error::Result as ComboResult;
use combo_ctl::external::{DeviceDisconnect, PinCallback};
use combo_ctl::framer;
use combo_ctl::nonce::Nonce;
use combo_ctl::transport::state::InvariantPumpData;
use async_trait::async_trait;

pub const TEST_PUMP_ADDR: &str = "AA:BB:CC:DD:EE:FF";

/// Fixed pairing address byte used before directional keys exist.
pub const PAIRING_ADDRESS: u8 = combo_ctl::transport::state::PAIRING_ADDRESS;

/// Builds the wire layout this crate defines for KEY_RESPONSE (see
/// `pump_io::pairing`): two AES-128-ECB-encrypted 16-byte key blocks under
/// `weak_key`, then an 8-byte MAC (also under `weak_key`) over those 32
/// bytes.
pub fn build_key_response_payload(
    weak_key: &Key,
    pump_to_client_key: &Key,
    client_to_pump_key: &Key,
) -> Vec<u8> {
    let pump_to_client_encrypted = cipher::encrypt_block(weak_key, pump_to_client_key);
    let client_to_pump_encrypted = cipher::encrypt_block(weak_key, client_to_pump_key);

    let mut signed = [0u8; 32];
    signed[..16].copy_from_slice(&pump_to_client_encrypted);
    signed[16..].copy_from_slice(&client_to_pump_encrypted);
    let mac = cipher::mac(weak_key, &signed);

    let mut payload = Vec::with_capacity(40);
    payload.extend_from_slice(&signed);
    payload.extend_from_slice(&mac);
    payload
}

/// Encodes one transport frame exactly as the pump side of a test script
/// would send it.
#[allow(clippy::too_many_arguments)]
pub fn encode_pump_frame(
    address: u8,
    nonce: Nonce,
    command: u8,
    payload: &[u8],
    mac_key: Option<&Key>,
) -> Vec<u8> {
    framer::encode(1, command == combo_ctl::transport::command::DATA, true, address, nonce, command, payload, mac_key)
}

pub struct FixedPin {
    pub pin: [u8; 10],
}

impl FixedPin {
    pub fn new(pin: &str) -> FixedPin {
        let mut bytes = [0u8; 10];
        bytes.copy_from_slice(pin.as_bytes());
        FixedPin { pin: bytes }
    }
}

#[async_trait]
impl PinCallback for FixedPin {
    async fn request_pin(&self, _previous_attempt_failed: bool) -> ComboResult<[u8; 10]> {
        Ok(self.pin)
    }
}

/// Cycles through a scripted sequence of PINs, one per call, used by the
/// wrong-then-correct-PIN scenario.
pub struct ScriptedPin {
    pins: tokio::sync::Mutex<std::vec::IntoIter<[u8; 10]>>,
}

impl ScriptedPin {
    pub fn new(pins: Vec<&str>) -> ScriptedPin {
        let pins = pins
            .into_iter()
            .map(|p| {
                let mut bytes = [0u8; 10];
                bytes.copy_from_slice(p.as_bytes());
                bytes
            })
            .collect::<Vec<_>>();
        ScriptedPin { pins: tokio::sync::Mutex::new(pins.into_iter()) }
    }
}

#[async_trait]
impl PinCallback for ScriptedPin {
    async fn request_pin(&self, _previous_attempt_failed: bool) -> ComboResult<[u8; 10]> {
        Ok(self.pins.lock().await.next().expect("scripted PIN sequence exhausted"))
    }
}

pub struct NoopDisconnect;

#[async_trait]
impl DeviceDisconnect for NoopDisconnect {
    async fn disconnect(&self) {}
}

pub fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

pub fn sample_invariant_data(pump_to_client_key: Key, client_to_pump_key: Key) -> InvariantPumpData {
    InvariantPumpData {
        client_to_pump_key,
        pump_to_client_key,
        key_response_address: 0x21,
        pump_id: "PUMP001".to_string(),
    }
}

/// Scripts the pump side of an already-paired session: decodes whatever
/// the client just sent and answers with authenticated frames signed
/// under `pump_to_client_key`, tracking its own monotonically increasing
/// nonce per the transport's per-command replay rule.
pub struct PumpScript {
    pump: loopback::PumpSide,
    pump_to_client_key: Key,
    client_to_pump_key: Key,
    address: u8,
    nonce: Nonce,
}

impl PumpScript {
    pub fn new(
        pump: loopback::PumpSide,
        pump_to_client_key: Key,
        client_to_pump_key: Key,
        address: u8,
    ) -> PumpScript {
        PumpScript {
            pump,
            pump_to_client_key,
            client_to_pump_key,
            address,
            nonce: combo_ctl::nonce::INITIAL_TX_NONCE,
        }
    }

    fn next_nonce(&mut self) -> Nonce {
        self.nonce = self.nonce.increment();
        self.nonce
    }

    /// Reads one whole frame sent by the client and decodes it against the
    /// client-to-pump key (all post-pairing traffic is authenticated).
    pub async fn recv(&mut self) -> framer::Frame {
        let bytes = self.pump.recv_frame_bytes().await;
        framer::decode(&bytes, Some(&self.client_to_pump_key)).expect("client sent an undecodable frame")
    }

    /// Reads one whole frame and decodes its DATA payload as an app packet.
    pub async fn recv_app(&mut self) -> combo_ctl::app::AppPacket {
        let frame = self.recv().await;
        combo_ctl::app::AppPacket::decode(&frame.payload).expect("client sent an undecodable app packet")
    }

    /// Sends a bare transport-level response frame (no app-layer payload).
    pub async fn respond_transport(&mut self, command: u8, payload: &[u8]) {
        let nonce = self.next_nonce();
        let bytes = encode_pump_frame(self.address, nonce, command, payload, Some(&self.pump_to_client_key));
        self.pump.send_frame_bytes(bytes).await;
    }

    /// Sends an application-layer packet wrapped in a transport DATA frame.
    pub async fn respond_app(&mut self, service: u8, command: u16, payload: Vec<u8>) {
        let packet = combo_ctl::app::AppPacket::new(service, command, payload);
        self.respond_transport(combo_ctl::transport::command::DATA, &packet.encode()).await;
    }

    /// Answers the fixed sequence `PumpIo::connect` always runs before
    /// `switch_mode` takes over: open the regular connection, then
    /// CTRL_CONNECT. Leaves mode activation to the caller, since that part
    /// varies with the requested initial mode.
    pub async fn answer_open_connection(&mut self) {
        use combo_ctl::app::{ctrl, response_code, service};
        use combo_ctl::transport;

        let _ = self.recv().await;
        self.respond_transport(transport::command::REGULAR_CONNECTION_REQUEST_ACCEPTED, &[]).await;

        let request = self.recv_app().await;
        assert_eq!(request.command, ctrl::command::CONNECT);
        self.respond_app(service::CTRL, response_code(ctrl::command::CONNECT), Vec::new()).await;
    }

    /// Answers one CTRL_ACTIVATE_SERVICE or CTRL_DEACTIVATE_SERVICE round
    /// trip, asserting which one and for which service it expects.
    pub async fn answer_service_toggle(&mut self, expected_command: u16, target_service: u8) {
        use combo_ctl::app::{response_code, service};

        let request = self.recv_app().await;
        assert_eq!(request.command, expected_command);
        assert_eq!(request.payload, vec![target_service]);
        self.respond_app(service::CTRL, response_code(expected_command), Vec::new()).await;
    }
}

/// Directional keys shared by the already-paired scenario tests (RT button
/// presses, mode switching, CMD operations) — pairing itself is exercised
/// separately in `pairing.rs`.
pub const CONNECTED_PUMP_TO_CLIENT_KEY: Key = [0xAA; 16];
pub const CONNECTED_CLIENT_TO_PUMP_KEY: Key = [0xBB; 16];
pub const CONNECTED_ADDRESS: u8 = 0x21;

/// Seeds a store with a pre-paired pump and drives `PumpIo::connect`
/// against a scripted pump that answers the open-connection and initial
/// mode-activation round trips, returning the connected `PumpIo` and the
/// `PumpScript` ready for further scripted exchanges.
pub async fn connect_pump(
    initial_mode: combo_ctl::Mode,
    run_heartbeat: bool,
) -> (combo_ctl::PumpIo, PumpScript) {
    let (client_stream, pump_side) = loopback::duplex();
    let store = std::sync::Arc::new(store::MemoryStore::default());
    let invariant = sample_invariant_data(CONNECTED_PUMP_TO_CLIENT_KEY, CONNECTED_CLIENT_TO_PUMP_KEY);
    store.seed(TEST_PUMP_ADDR, invariant, combo_ctl::nonce::INITIAL_TX_NONCE).await;

    let pump_io = combo_ctl::PumpIo::new(combo_ctl::PumpIoConfig {
        stream: Box::new(client_stream),
        store,
        pump_addr: TEST_PUMP_ADDR.to_string(),
        pin_callback: std::sync::Arc::new(FixedPin::new("1234567890")),
        disconnect_callback: std::sync::Arc::new(NoopDisconnect) as std::sync::Arc<dyn DeviceDisconnect + Send + Sync>,
        events: None,
        logger: test_logger(),
    });

    let mut script = PumpScript::new(pump_side, CONNECTED_PUMP_TO_CLIENT_KEY, CONNECTED_CLIENT_TO_PUMP_KEY, CONNECTED_ADDRESS);
    let mode_service = match initial_mode {
        combo_ctl::Mode::RemoteTerminal => combo_ctl::app::service::RT_MODE,
        combo_ctl::Mode::Command => combo_ctl::app::service::COMMAND_MODE,
    };

    let connect_script = tokio::spawn(async move {
        script.answer_open_connection().await;
        script
            .answer_service_toggle(combo_ctl::app::ctrl::command::ACTIVATE_SERVICE, mode_service)
            .await;
        script
    });

    tokio::time::timeout(std::time::Duration::from_secs(5), pump_io.connect(initial_mode, run_heartbeat))
        .await
        .expect("connect did not hang")
        .expect("connect succeeds");

    let script = connect_script.await.expect("connect script task did not panic");
    (pump_io, script)
}
