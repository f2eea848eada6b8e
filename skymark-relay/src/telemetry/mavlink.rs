//! MAVLink telemetry source (ArduPilot dialect)
//!
//! A reader thread owns the receive side of the connection and forwards
//! decoded messages through a bounded channel; [`TelemetryConnection::try_recv`]
//! drains that channel and translates the message kinds the platform state
//! cares about.
//!
//! `udpin`, `udpout` and `tcpout` endpoints are driven here over sockets with
//! a read timeout: dropping the connection stops the reader within one
//! read poll and the socket is released with it. Other address forms
//! (serial, `tcpin`, `file`) go through `mavlink::connect`, whose reader
//! only notices the drop at its next frame.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ::mavlink::ardupilotmega::{
    MavDataStream, MavMessage, MavModeFlag, MavType, REQUEST_DATA_STREAM_DATA,
};
use ::mavlink::error::MessageReadError;
use ::mavlink::peek_reader::PeekReader;
use ::mavlink::{
    read_versioned_msg, write_versioned_msg, MavConnection, MavHeader, MavlinkVersion,
};
use tracing::{debug, trace};

use super::{TelemetryConnection, TelemetryEvent, TelemetrySource};
use crate::error::TelemetryError;

/// Messages buffered between the reader thread and the link
const READER_QUEUE_DEPTH: usize = 1024;

/// Longest the reader blocks before checking whether it was stopped
const READ_POLL: Duration = Duration::from_millis(100);

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

const MAX_DATAGRAM: usize = 1500;

/// Our own identity on the MAVLink network (ground station range)
const GCS_SYSTEM_ID: u8 = 255;
const GCS_COMPONENT_ID: u8 = 190;

type SharedConnection = Arc<dyn MavConnection<MavMessage> + Send + Sync>;

/// Set when the connection is dropped
type StopFlag = Arc<AtomicBool>;

type PeerAddress = Arc<Mutex<Option<SocketAddr>>>;

enum ReaderFrame {
    Message(MavHeader, MavMessage),
    Closed(String),
}

/// Telemetry source backed by a MAVLink connection string
///
/// Accepts the `mavlink` crate's address forms, e.g. `udpin:0.0.0.0:14550`,
/// `tcpout:127.0.0.1:5760` or `serial:/dev/ttyACM0:57600`.
pub struct MavlinkSource {
    endpoint: String,
}

impl MavlinkSource {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    fn open_outbound(
        &self,
        stop: &StopFlag,
        tx: SyncSender<ReaderFrame>,
    ) -> io::Result<Outbound> {
        if let Some(addr) = self.endpoint.strip_prefix("udpin:") {
            let socket = UdpSocket::bind(resolve(addr)?)?;
            open_datagram(socket, None, stop, tx)
        } else if let Some(addr) = self.endpoint.strip_prefix("udpout:") {
            let peer = resolve(addr)?;
            let socket = UdpSocket::bind("0.0.0.0:0")?;
            open_datagram(socket, Some(peer), stop, tx)
        } else if let Some(addr) = self.endpoint.strip_prefix("tcpout:") {
            let stream = TcpStream::connect_timeout(&resolve(addr)?, TCP_CONNECT_TIMEOUT)?;
            stream.set_nodelay(true)?;
            stream.set_read_timeout(Some(READ_POLL))?;
            let mut reader = PeekReader::new(StreamReader {
                stream: stream.try_clone()?,
                stop: Arc::clone(stop),
            });
            spawn_reader(
                move || read_versioned_msg::<MavMessage, _>(&mut reader, MavlinkVersion::V2),
                Arc::clone(stop),
                tx,
            )?;
            Ok(Outbound::Stream(stream))
        } else {
            let connection: SharedConnection =
                Arc::from(::mavlink::connect::<MavMessage>(&self.endpoint)?);
            let reader = Arc::clone(&connection);
            spawn_reader(move || reader.recv(), Arc::clone(stop), tx)?;
            Ok(Outbound::Shared(connection))
        }
    }
}

impl TelemetrySource for MavlinkSource {
    fn describe(&self) -> String {
        self.endpoint.clone()
    }

    fn open(&mut self) -> Result<Box<dyn TelemetryConnection>, TelemetryError> {
        let stop = StopFlag::default();
        let (tx, rx) = mpsc::sync_channel(READER_QUEUE_DEPTH);
        let outbound = self
            .open_outbound(&stop, tx)
            .map_err(|e| TelemetryError::Connection(format!("{}: {}", self.endpoint, e)))?;

        debug!("MAVLink connection opened on {}", self.endpoint);
        Ok(Box::new(MavlinkConnection {
            outbound,
            rx,
            stop,
            target: None,
        }))
    }
}

fn resolve(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address for {}", addr),
        )
    })
}

fn open_datagram(
    socket: UdpSocket,
    peer: Option<SocketAddr>,
    stop: &StopFlag,
    tx: SyncSender<ReaderFrame>,
) -> io::Result<Outbound> {
    socket.set_read_timeout(Some(READ_POLL))?;
    let learn_peer = peer.is_none();
    let peer: PeerAddress = Arc::new(Mutex::new(peer));
    let mut reader = PeekReader::new(DatagramReader {
        socket: socket.try_clone()?,
        pending: VecDeque::new(),
        peer: Arc::clone(&peer),
        learn_peer,
        stop: Arc::clone(stop),
    });
    spawn_reader(
        move || read_versioned_msg::<MavMessage, _>(&mut reader, MavlinkVersion::V2),
        Arc::clone(stop),
        tx,
    )?;
    Ok(Outbound::Datagram { socket, peer })
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn stopped() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection dropped")
}

/// Byte stream over received datagrams
///
/// In `udpin` mode the last sender becomes the reply address.
struct DatagramReader {
    socket: UdpSocket,
    pending: VecDeque<u8>,
    peer: PeerAddress,
    learn_peer: bool,
    stop: StopFlag,
}

impl Read for DatagramReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending.is_empty() {
            let mut datagram = [0u8; MAX_DATAGRAM];
            match self.socket.recv_from(&mut datagram) {
                Ok((n, from)) => {
                    self.pending.extend(&datagram[..n]);
                    if self.learn_peer {
                        if let Ok(mut peer) = self.peer.lock() {
                            *peer = Some(from);
                        }
                    }
                }
                Err(e) if is_timeout(&e) => {
                    if self.stop.load(Ordering::Relaxed) {
                        return Err(stopped());
                    }
                }
                Err(e) => return Err(e),
            }
        }
        self.pending.read(buf)
    }
}

/// TCP stream that gives up its blocking read once stopped
struct StreamReader {
    stream: TcpStream,
    stop: StopFlag,
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.stream.read(buf) {
                Err(e) if is_timeout(&e) => {
                    if self.stop.load(Ordering::Relaxed) {
                        return Err(stopped());
                    }
                }
                other => return other,
            }
        }
    }
}

fn spawn_reader<F>(next: F, stop: StopFlag, tx: SyncSender<ReaderFrame>) -> io::Result<()>
where
    F: FnMut() -> Result<(MavHeader, MavMessage), MessageReadError> + Send + 'static,
{
    thread::Builder::new()
        .name("mavlink-reader".to_string())
        .spawn(move || read_messages(next, &stop, tx))?;
    Ok(())
}

fn read_messages<F>(mut next: F, stop: &AtomicBool, tx: SyncSender<ReaderFrame>)
where
    F: FnMut() -> Result<(MavHeader, MavMessage), MessageReadError>,
{
    while !stop.load(Ordering::Relaxed) {
        let frame = match next() {
            Ok((header, message)) => ReaderFrame::Message(header, message),
            Err(MessageReadError::Parse(e)) => {
                trace!("Skipping unparsable MAVLink frame: {:?}", e);
                continue;
            }
            Err(MessageReadError::Io(_)) if stop.load(Ordering::Relaxed) => break,
            Err(MessageReadError::Io(e)) => ReaderFrame::Closed(e.to_string()),
        };
        let closed = matches!(frame, ReaderFrame::Closed(_));
        if tx.send(frame).is_err() || closed {
            break;
        }
    }
    debug!("MAVLink reader stopped");
}

/// Send side of an open connection
enum Outbound {
    Datagram { socket: UdpSocket, peer: PeerAddress },
    Stream(TcpStream),
    Shared(SharedConnection),
}

impl Outbound {
    fn send(&mut self, header: MavHeader, message: &MavMessage) -> Result<(), TelemetryError> {
        match self {
            Outbound::Datagram { socket, peer } => {
                let peer = peer
                    .lock()
                    .ok()
                    .and_then(|p| *p)
                    .ok_or_else(|| TelemetryError::Connection("no peer address yet".to_string()))?;
                socket.send_to(&encode(header, message)?, peer)?;
            }
            Outbound::Stream(stream) => stream.write_all(&encode(header, message)?)?,
            Outbound::Shared(connection) => {
                connection.send(&header, message).map_err(|e| {
                    TelemetryError::Connection(format!("send failed: {:?}", e))
                })?;
            }
        }
        Ok(())
    }
}

fn encode(header: MavHeader, message: &MavMessage) -> Result<Vec<u8>, TelemetryError> {
    let mut frame = Vec::new();
    write_versioned_msg(&mut frame, MavlinkVersion::V2, header, message)
        .map_err(|e| TelemetryError::Connection(format!("encode failed: {:?}", e)))?;
    Ok(frame)
}

struct MavlinkConnection {
    outbound: Outbound,
    rx: Receiver<ReaderFrame>,
    stop: StopFlag,
    /// System/component of the vehicle, learned from its heartbeat
    target: Option<(u8, u8)>,
}

impl Drop for MavlinkConnection {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Outbound::Stream(stream) = &self.outbound {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl TelemetryConnection for MavlinkConnection {
    fn try_recv(&mut self) -> Result<Option<TelemetryEvent>, TelemetryError> {
        loop {
            match self.rx.try_recv() {
                Ok(ReaderFrame::Message(header, message)) => {
                    if let MavMessage::HEARTBEAT(hb) = &message {
                        if !is_ground_station(hb.mavtype) {
                            self.target = Some((header.system_id, header.component_id));
                        }
                    }
                    if let Some(event) = translate(&message) {
                        return Ok(Some(event));
                    }
                }
                Ok(ReaderFrame::Closed(reason)) => {
                    return Err(TelemetryError::Connection(reason));
                }
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => {
                    return Err(TelemetryError::Connection(
                        "MAVLink reader stopped".to_string(),
                    ));
                }
            }
        }
    }

    fn request_streams(&mut self, rate_hz: u16) -> Result<(), TelemetryError> {
        let (target_system, target_component) = self.target.ok_or_else(|| {
            TelemetryError::Connection("no vehicle heartbeat seen yet".to_string())
        })?;

        let request = MavMessage::REQUEST_DATA_STREAM(REQUEST_DATA_STREAM_DATA {
            req_message_rate: rate_hz,
            target_system,
            target_component,
            req_stream_id: MavDataStream::MAV_DATA_STREAM_ALL as u8,
            start_stop: 1,
        });
        let header = MavHeader {
            system_id: GCS_SYSTEM_ID,
            component_id: GCS_COMPONENT_ID,
            sequence: 0,
        };
        self.outbound.send(header, &request)?;
        debug!(
            "Requested all streams at {} Hz from {}/{}",
            rate_hz, target_system, target_component
        );
        Ok(())
    }
}

fn is_ground_station(mavtype: MavType) -> bool {
    matches!(mavtype, MavType::MAV_TYPE_GCS)
}

/// Map the message kinds the platform state tracks; everything else is ignored
fn translate(message: &MavMessage) -> Option<TelemetryEvent> {
    match message {
        MavMessage::HEARTBEAT(hb) if !is_ground_station(hb.mavtype) => {
            Some(TelemetryEvent::Heartbeat {
                armed: hb.base_mode.contains(MavModeFlag::MAV_MODE_FLAG_SAFETY_ARMED),
                flight_mode: copter_mode_name(hb.custom_mode),
            })
        }
        MavMessage::LOCAL_POSITION_NED(p) => Some(TelemetryEvent::Position {
            x: f64::from(p.x),
            y: f64::from(p.y),
            z: f64::from(p.z),
        }),
        MavMessage::ATTITUDE(a) => Some(TelemetryEvent::Orientation {
            pitch: f64::from(a.pitch),
            roll: f64::from(a.roll),
            yaw: f64::from(a.yaw),
        }),
        MavMessage::BATTERY_STATUS(b) => Some(TelemetryEvent::Battery {
            voltage_mv: b.voltages[0],
            remaining: b.battery_remaining,
        }),
        MavMessage::RADIO_STATUS(r) => Some(TelemetryEvent::Signal { rssi: r.rssi }),
        MavMessage::STATUSTEXT(s) => Some(TelemetryEvent::StatusText {
            severity: s.severity as u8,
            text: status_text(&s.text),
        }),
        _ => None,
    }
}

/// Fixed-size, NUL-padded STATUSTEXT payload as a string
fn status_text<T: Copy + Into<char>>(raw: &[T]) -> String {
    raw.iter()
        .map(|&c| c.into())
        .take_while(|&c| c != '\0')
        .collect::<String>()
        .trim_end()
        .to_string()
}

/// ArduCopter flight mode name for a heartbeat's custom mode
pub fn copter_mode_name(custom_mode: u32) -> String {
    let name = match custom_mode {
        0 => "STABILIZE",
        1 => "ACRO",
        2 => "ALT_HOLD",
        3 => "AUTO",
        4 => "GUIDED",
        5 => "LOITER",
        6 => "RTL",
        7 => "CIRCLE",
        9 => "LAND",
        11 => "DRIFT",
        13 => "SPORT",
        14 => "FLIP",
        15 => "AUTOTUNE",
        16 => "POSHOLD",
        17 => "BRAKE",
        18 => "THROW",
        19 => "AVOID_ADSB",
        20 => "GUIDED_NOGPS",
        21 => "SMART_RTL",
        other => return format!("Mode({})", other),
    };
    name.to_string()
}
