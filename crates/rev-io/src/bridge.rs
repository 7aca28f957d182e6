use crate::metrics::{
    record_control, BRIDGE_CONNECTED, CONTROL_OUT_OF_ORDER, CONTROL_REJECTED,
};
use crate::protocol::{ControlMsg, HelloMsg, IncomingMessage, StateMsg};
use rev_core::{StateExchange, TimeBase};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{atomic::AtomicBool, Arc};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

pub struct BridgeConfig {
    pub bind_addr: String,
    pub publish_interval: Duration,
    pub require_handshake: bool,
    /// Longest unterminated line a client may buffer before it is dropped.
    pub max_line_bytes: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7000".to_string(),
            publish_interval: Duration::from_millis(50),
            require_handshake: false,
            max_line_bytes: 64 * 1024,
        }
    }
}

/// Why an inbound control message was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRejection {
    UnsupportedVersion,
    MissingHandshake,
    MissingSequence,
    OutOfOrder,
    NonFinite,
}

#[derive(Debug)]
struct InboundState {
    last_sequence: Option<u64>,
    handshake_seen: bool,
    capabilities: Vec<String>,
    client_id: Option<String>,
}

impl InboundState {
    fn new() -> Self {
        Self {
            last_sequence: None,
            handshake_seen: false,
            capabilities: Vec::new(),
            client_id: None,
        }
    }

    fn reset(&mut self) {
        self.last_sequence = None;
        self.handshake_seen = false;
        self.capabilities.clear();
        self.client_id = None;
    }

    fn accept_sequence(&mut self, sequence: u64) -> Result<(), ControlRejection> {
        if sequence == 0 {
            warn!("Control sequence missing or zero");
            return Err(ControlRejection::MissingSequence);
        }
        if let Some(last) = self.last_sequence {
            if sequence <= last {
                warn!(
                    sequence,
                    last_sequence = last,
                    "Out-of-order control sequence"
                );
                return Err(ControlRejection::OutOfOrder);
            }
        }
        self.last_sequence = Some(sequence);
        Ok(())
    }

    fn note_handshake(&mut self, hello: &HelloMsg) {
        self.handshake_seen = true;
        self.capabilities = hello.capabilities.clone();
        self.client_id = hello.client_id.clone();
    }
}

/// Serve one client at a time until `stop` is raised. Fails only if the
/// listener cannot be set up.
pub fn run_bridge(
    exchange: Arc<StateExchange>,
    timebase: TimeBase,
    config: BridgeConfig,
    stop: Arc<AtomicBool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(&config.bind_addr)?;
    listener.set_nonblocking(true)?;

    info!(
        addr = %config.bind_addr,
        require_handshake = config.require_handshake,
        "Bridge listening"
    );

    let mut client: Option<TcpStream> = None;
    let mut recv_buf: Vec<u8> = Vec::with_capacity(4096);
    let mut send_buf: Vec<u8> = Vec::new();
    let mut send_offset: usize = 0;
    let mut last_publish = Instant::now();
    let mut state_sequence: u64 = 0;
    let mut inbound_state = InboundState::new();

    loop {
        if stop.load(std::sync::atomic::Ordering::Relaxed) {
            break;
        }
        if client.is_none() {
            match listener.accept() {
                Ok((stream, addr)) => match stream.set_nonblocking(true) {
                    Ok(()) => {
                        info!(client_addr = %addr, "Bridge client connected");
                        client = Some(stream);
                        BRIDGE_CONNECTED.set(1.0);
                    }
                    Err(err) => {
                        warn!(client_addr = %addr, error = %err, "Failed to set nonblocking on client");
                    }
                },
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    warn!("Bridge accept error: {}", err);
                }
            }
        }

        let mut drop_client = false;
        if let Some(stream) = client.as_mut() {
            // Receive data
            let mut temp = [0u8; 1024];
            match stream.read(&mut temp) {
                Ok(0) => {
                    info!("Bridge client disconnected");
                    drop_client = true;
                }
                Ok(n) => {
                    recv_buf.extend_from_slice(&temp[..n]);
                    match take_lines(&mut recv_buf, config.max_line_bytes) {
                        Ok(lines) => {
                            for line in lines {
                                let Ok(text) = std::str::from_utf8(&line) else {
                                    continue;
                                };
                                let trimmed = text.trim();
                                if trimmed.is_empty() {
                                    continue;
                                }
                                match IncomingMessage::parse(trimmed) {
                                    Some(msg) => {
                                        let _ = handle_incoming(
                                            msg,
                                            &exchange,
                                            config.require_handshake,
                                            &mut inbound_state,
                                        );
                                    }
                                    None => debug!(line = trimmed, "Ignoring unrecognised bridge message"),
                                }
                            }
                        }
                        Err(pending) => {
                            warn!(
                                pending,
                                limit = config.max_line_bytes,
                                "Bridge client line too long; dropping client"
                            );
                            drop_client = true;
                        }
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    warn!(error = %err, "Bridge read error");
                    drop_client = true;
                }
            }

            // Publish state; nothing goes out until the clock has published.
            if send_buf.is_empty() && last_publish.elapsed() >= config.publish_interval {
                if let Some(state) = exchange.read_state() {
                    state_sequence = state_sequence.wrapping_add(1);
                    let msg = StateMsg::new(
                        state_sequence,
                        timebase.unix_us(),
                        &state,
                        &exchange.read_control(),
                    );
                    if let Ok(line) = serde_json::to_string(&msg) {
                        send_buf = line.into_bytes();
                        send_buf.push(b'\n');
                        send_offset = 0;
                    }
                }
                last_publish = Instant::now();
            }

            if !send_buf.is_empty() {
                match stream.write(&send_buf[send_offset..]) {
                    Ok(0) => {
                        info!("Bridge client disconnected");
                        drop_client = true;
                    }
                    Ok(n) => {
                        send_offset += n;
                        if send_offset >= send_buf.len() {
                            send_buf.clear();
                            send_offset = 0;
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        warn!(error = %err, "Bridge write error");
                        drop_client = true;
                    }
                }
            }
        }

        if drop_client {
            client = None;
            recv_buf.clear();
            send_buf.clear();
            send_offset = 0;
            inbound_state.reset();
            BRIDGE_CONNECTED.set(0.0);
        }

        std::thread::sleep(Duration::from_millis(5));
    }

    info!("Bridge stopped");
    Ok(())
}

/// Split complete lines off the front of `buf`. Fails with the pending
/// length once an unterminated line grows past `limit`.
fn take_lines(buf: &mut Vec<u8>, limit: usize) -> Result<Vec<Vec<u8>>, usize> {
    let mut lines = Vec::new();
    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
        lines.push(buf.drain(..=pos).collect());
    }
    if buf.len() > limit {
        return Err(buf.len());
    }
    Ok(lines)
}

#[instrument(skip(exchange, inbound_state), fields(sequence))]
fn handle_incoming(
    msg: IncomingMessage,
    exchange: &StateExchange,
    require_handshake: bool,
    inbound_state: &mut InboundState,
) -> Result<(), ControlRejection> {
    match msg {
        IncomingMessage::Hello(hello) => {
            if !hello.protocol_version.is_supported() {
                warn!(
                    major = hello.protocol_version.major,
                    minor = hello.protocol_version.minor,
                    "Unsupported protocol version"
                );
                return Err(ControlRejection::UnsupportedVersion);
            }
            inbound_state.note_handshake(&hello);
            info!(
                client_id = ?hello.client_id,
                capabilities = ?hello.capabilities,
                "Bridge handshake received"
            );
            Ok(())
        }
        IncomingMessage::Control(control) => {
            tracing::Span::current().record("sequence", control.sequence);
            let result = apply_control(&control, exchange, require_handshake, inbound_state);
            match result {
                Err(ControlRejection::OutOfOrder) => CONTROL_OUT_OF_ORDER.inc(),
                Err(_) => CONTROL_REJECTED.inc(),
                Ok(()) => {}
            }
            result
        }
    }
}

fn apply_control(
    control: &ControlMsg,
    exchange: &StateExchange,
    require_handshake: bool,
    inbound_state: &mut InboundState,
) -> Result<(), ControlRejection> {
    if !control.protocol_version.is_supported() {
        warn!(
            major = control.protocol_version.major,
            minor = control.protocol_version.minor,
            "Unsupported protocol version"
        );
        return Err(ControlRejection::UnsupportedVersion);
    }

    if require_handshake && !inbound_state.handshake_seen {
        warn!("Control received before handshake");
        return Err(ControlRejection::MissingHandshake);
    }

    inbound_state.accept_sequence(control.sequence)?;

    if !control.is_finite() {
        warn!(
            throttle = ?control.throttle,
            load_torque_nm = ?control.load_torque_nm,
            "Ignoring non-finite control"
        );
        return Err(ControlRejection::NonFinite);
    }

    let merged = control.apply_to(exchange.read_control());
    exchange.submit_control(merged);
    record_control(&merged);

    debug!(
        throttle = merged.throttle,
        load_torque_nm = merged.load_torque_nm,
        "Control applied"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rev_core::ControlInput;

    fn control(line: &str) -> IncomingMessage {
        IncomingMessage::parse(line).unwrap()
    }

    #[test]
    fn out_of_order_sequences_are_rejected() {
        let exchange = StateExchange::new();
        let mut inbound = InboundState::new();

        let first = control(r#"{"type":"control","sequence":5,"throttle":0.4}"#);
        assert_eq!(handle_incoming(first, &exchange, false, &mut inbound), Ok(()));

        let stale = control(r#"{"type":"control","sequence":5,"throttle":0.9}"#);
        assert_eq!(
            handle_incoming(stale, &exchange, false, &mut inbound),
            Err(ControlRejection::OutOfOrder)
        );
        assert_eq!(exchange.read_control().throttle, 0.4);
    }

    #[test]
    fn partial_control_keeps_other_field() {
        let exchange = StateExchange::new();
        exchange.submit_control(ControlInput::new(0.3, 40.0));
        let mut inbound = InboundState::new();

        let msg = control(r#"{"type":"control","sequence":1,"load_torque_nm":75.0}"#);
        handle_incoming(msg, &exchange, false, &mut inbound).unwrap();
        assert_eq!(exchange.read_control(), ControlInput::new(0.3, 75.0));
    }

    #[test]
    fn handshake_required_when_configured() {
        let exchange = StateExchange::new();
        let mut inbound = InboundState::new();

        let early = control(r#"{"type":"control","sequence":1,"throttle":1.0}"#);
        assert_eq!(
            handle_incoming(early, &exchange, true, &mut inbound),
            Err(ControlRejection::MissingHandshake)
        );

        let hello = control(r#"{"type":"hello","protocol_version":{"major":1,"minor":0},"client_id":"ui"}"#);
        handle_incoming(hello, &exchange, true, &mut inbound).unwrap();

        let after = control(r#"{"type":"control","sequence":2,"throttle":1.0}"#);
        assert_eq!(handle_incoming(after, &exchange, true, &mut inbound), Ok(()));
        assert_eq!(inbound.client_id.as_deref(), Some("ui"));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let exchange = StateExchange::new();
        let mut inbound = InboundState::new();
        let msg = control(
            r#"{"type":"control","protocol_version":{"major":2,"minor":0},"sequence":1,"throttle":1.0}"#,
        );
        assert_eq!(
            handle_incoming(msg, &exchange, false, &mut inbound),
            Err(ControlRejection::UnsupportedVersion)
        );
        assert_eq!(exchange.read_control(), ControlInput::default());
    }

    #[test]
    fn take_lines_keeps_partial_tail() {
        let mut buf = b"{\"a\":1}\n{\"b\"".to_vec();
        let lines = take_lines(&mut buf, 64).unwrap();
        assert_eq!(lines, vec![b"{\"a\":1}\n".to_vec()]);
        assert_eq!(buf, b"{\"b\"".to_vec());
    }

    #[test]
    fn take_lines_rejects_oversized_tail() {
        let mut buf = vec![b'x'; 100];
        assert_eq!(take_lines(&mut buf, 64), Err(100));

        let mut buf = vec![b'x'; 100];
        buf.push(b'\n');
        assert_eq!(take_lines(&mut buf, 64).map(|l| l.len()), Ok(1));
    }

    #[test]
    fn client_without_newlines_is_dropped() {
        use std::io::{Read, Write};
        use std::net::{TcpListener, TcpStream};

        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let config = BridgeConfig {
            bind_addr: addr.to_string(),
            max_line_bytes: 128,
            ..Default::default()
        };
        let exchange = Arc::new(StateExchange::new());
        let stop_bridge = Arc::clone(&stop);
        let handle = std::thread::spawn(move || run_bridge(exchange, TimeBase::new(), config, stop_bridge));

        let mut stream = None;
        for _ in 0..50 {
            if let Ok(s) = TcpStream::connect(addr) {
                stream = Some(s);
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        let mut stream = stream.unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        stream.write_all(&[b'x'; 300]).unwrap();

        let mut byte = [0u8; 1];
        match stream.read(&mut byte) {
            Ok(n) => assert_eq!(n, 0),
            Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionReset),
        }

        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        handle.join().unwrap().unwrap();
    }
}
