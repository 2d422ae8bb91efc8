//! Drives the public API against a simulated thermostat bus on a duplex pipe.

use assert_matches::assert_matches;
use hmmb_lib::{
    client::{Client, ClientConfig, ConnectionState},
    frame::{crc16, encode, Exception},
    protocol::{self as proto, HoldDurationEncoding, RangeError, TemperatureUnit},
    queue::TransactionError,
    transport::{StreamTransport, Transport},
    Error,
};
use std::{
    collections::HashMap,
    io,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf},
    time::timeout,
};

const REGISTERS: usize = 0x20;

/// Register banks of the simulated thermostats and what they observed.
#[derive(Default)]
struct BusState {
    banks: HashMap<u8, [u16; REGISTERS]>,
    requests: Vec<Vec<u8>>,
    corrupt_replies: usize,
    mute: bool,
    overlaps: usize,
}

#[derive(Clone, Default)]
struct Bus(Arc<Mutex<BusState>>);

impl Bus {
    fn with_thermostat(self, address: u8, registers: [u16; REGISTERS]) -> Self {
        self.0.lock().unwrap().banks.insert(address, registers);
        self
    }

    fn corrupt_replies(self, count: usize) -> Self {
        self.0.lock().unwrap().corrupt_replies = count;
        self
    }

    fn mute(self) -> Self {
        self.0.lock().unwrap().mute = true;
        self
    }

    fn register(&self, address: u8, register: u16) -> u16 {
        self.0.lock().unwrap().banks[&address][register as usize]
    }

    fn requests(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().requests.clone()
    }

    fn overlaps(&self) -> usize {
        self.0.lock().unwrap().overlaps
    }

    /// Reads one request frame, using the function code to find its length.
    async fn receive(stream: &mut DuplexStream) -> Option<Vec<u8>> {
        let mut frame = vec![0u8; 2];
        stream.read_exact(&mut frame).await.ok()?;
        let rest = match frame[1] {
            0x03 | 0x06 => 6,
            0x10 => {
                let mut header = [0u8; 5];
                stream.read_exact(&mut header).await.ok()?;
                frame.extend_from_slice(&header);
                header[4] as usize + 2
            }
            other => panic!("unexpected function code {other:#04X}"),
        };
        let start = frame.len();
        frame.resize(start + rest, 0);
        stream.read_exact(&mut frame[start..]).await.ok()?;
        Some(frame)
    }

    fn respond(&self, request: &[u8]) -> Option<Vec<u8>> {
        let (body, crc) = request.split_at(request.len() - 2);
        assert_eq!(
            crc16(body).to_le_bytes(),
            crc,
            "request with bad CRC {request:02X?}"
        );

        let mut state = self.0.lock().unwrap();
        state.requests.push(request.to_vec());
        let (address, function) = (body[0], body[1]);
        if state.mute {
            return None;
        }
        let bank = state.banks.get_mut(&address)?;
        let word = |index: usize| u16::from_be_bytes([body[index], body[index + 1]]) as usize;
        let start = word(2);

        let reply = match function {
            0x03 => {
                let count = word(4);
                if start + count > REGISTERS {
                    encode(address, 0x83, &[0x02])
                } else {
                    let mut data = vec![(count * 2) as u8];
                    for value in &bank[start..start + count] {
                        data.extend_from_slice(&value.to_be_bytes());
                    }
                    encode(address, 0x03, &data)
                }
            }
            0x06 if start < REGISTERS => {
                bank[start] = word(4) as u16;
                encode(address, 0x06, &body[2..6])
            }
            0x10 => {
                let count = word(4);
                if start + count > REGISTERS {
                    encode(address, 0x90, &[0x02])
                } else {
                    for i in 0..count {
                        bank[start + i] = word(7 + 2 * i) as u16;
                    }
                    encode(address, 0x10, &body[2..6])
                }
            }
            _ => encode(address, function | 0x80, &[0x02]),
        };

        if state.corrupt_replies > 0 {
            state.corrupt_replies -= 1;
            let mut corrupted = reply;
            let last = corrupted.len() - 1;
            corrupted[last] ^= 0x01;
            return Some(corrupted);
        }
        Some(reply)
    }

    /// Serves requests until the client side of the pipe goes away.
    fn spawn(&self, mut stream: DuplexStream) -> tokio::task::JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            while let Some(request) = Self::receive(&mut stream).await {
                // A second request showing up before the reply means two
                // transactions overlap on the line.
                let mut next = [0u8; 1];
                if let Ok(Ok(1)) =
                    timeout(Duration::from_millis(3), stream.read(&mut next)).await
                {
                    bus.0.lock().unwrap().overlaps += 1;
                }
                if let Some(reply) = bus.respond(&request) {
                    if stream.write_all(&reply).await.is_err() {
                        break;
                    }
                }
            }
        })
    }
}

/// A thermostat in Celsius, 20.3 °C in the room, no floor sensor, switched on.
fn celsius_thermostat() -> [u16; REGISTERS] {
    let mut registers = [0u16; REGISTERS];
    registers[0x00] = 20;
    registers[0x01] = 3;
    registers[0x02] = proto::NO_SENSOR;
    registers[0x04] = 40;
    registers[0x05] = 0b001;
    registers[0x10] = 1;
    registers
}

fn test_config() -> ClientConfig {
    ClientConfig {
        timeout: Duration::from_millis(200),
        max_retries: 2,
        silent_interval: Duration::from_millis(1),
        hold_encoding: HoldDurationEncoding::Minutes,
    }
}

async fn connected_client(bus: &Bus, config: ClientConfig) -> Client {
    let (client_side, device_side) = duplex(512);
    bus.spawn(device_side);
    let client = Client::new(config);
    client
        .connect(&mut StreamTransport::new("pipe", client_side))
        .await
        .unwrap();
    client
}

#[tokio::test]
async fn set_target_temperature_and_read_it_back() {
    let bus = Bus::default().with_thermostat(3, celsius_thermostat());
    let client = connected_client(&bus, test_config()).await;
    let thermostat = client.add_thermostat(3).unwrap();

    thermostat.set_target_temperature(21.5).await.unwrap();
    assert_eq!(bus.register(3, 0x0004), 43);
    assert_eq!(
        bus.requests()[0],
        encode(3, 0x06, &[0x00, 0x04, 0x00, 43])
    );

    let status = thermostat.read_status().await.unwrap();
    assert_eq!(status.target_temperature, 21.5);
    assert_eq!(status.room_temperature, Some(20.3));
    assert_eq!(status.floor_temperature, None);
    assert_eq!(status.power, proto::PowerState::On);
    assert_eq!(status.relay_status, proto::RelayStatus::Off);
    assert_eq!(status.operation_mode, proto::OperationMode::Schedule);
    assert_eq!(status.units, TemperatureUnit::Celsius);
    // the whole status block comes from a single request
    assert_eq!(bus.requests().len(), 2);

    client.close().await;
}

#[tokio::test]
async fn corrupted_reply_is_retried() {
    let bus = Bus::default()
        .with_thermostat(3, celsius_thermostat())
        .corrupt_replies(1);
    let client = connected_client(&bus, test_config()).await;
    let thermostat = client.add_thermostat(3).unwrap();

    let status = thermostat.read_status().await.unwrap();
    assert_eq!(status.target_temperature, 20.0);
    let requests = bus.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0], requests[1]);

    client.close().await;
}

#[tokio::test]
async fn persistent_corruption_exhausts_retries() {
    let bus = Bus::default()
        .with_thermostat(3, celsius_thermostat())
        .corrupt_replies(usize::MAX);
    let client = connected_client(&bus, test_config()).await;
    let thermostat = client.add_thermostat(3).unwrap();

    assert_matches!(
        thermostat.turn_off().await,
        Err(Error::Transaction(TransactionError::ChecksumFailed(_)))
    );
    assert_eq!(bus.requests().len(), 3);

    client.close().await;
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let bus = Bus::default().mute();
    let mut config = test_config();
    config.timeout = Duration::from_millis(20);
    config.max_retries = 1;
    let client = connected_client(&bus, config).await;

    let result = client.add_thermostat(7).unwrap().turn_on().await;
    assert_matches!(
        result,
        Err(Error::Transaction(TransactionError::Timeout(_)))
    );
    assert_eq!(bus.requests().len(), 2);
    assert_eq!(client.state().await, ConnectionState::Connected);

    client.close().await;
}

#[tokio::test]
async fn writes_use_the_register_map() {
    let bus = Bus::default().with_thermostat(5, celsius_thermostat());
    let client = connected_client(&bus, test_config()).await;
    let thermostat = client.add_thermostat(5).unwrap();

    thermostat.turn_off().await.unwrap();
    assert_eq!(bus.register(5, proto::PowerState::ADDRESS), 0);
    thermostat.turn_on().await.unwrap();
    assert_eq!(bus.register(5, proto::PowerState::ADDRESS), 1);

    thermostat.set_floor_limit_temperature(28.0).await.unwrap();
    assert_eq!(bus.register(5, proto::FLOOR_LIMIT_REG_ADDR), 56);

    thermostat.set_hold_temperature(18.5, 90).await.unwrap();
    assert_eq!(bus.register(5, proto::Hold::ADDRESS), 37);
    assert_eq!(bus.register(5, proto::Hold::ADDRESS + 1), 90);
    let hold_request = bus.requests().last().cloned().unwrap();
    assert_eq!(hold_request[1], 0x10);

    // 2024-03-18 was a Monday
    let time = chrono::NaiveDate::from_ymd_opt(2024, 3, 18)
        .unwrap()
        .and_hms_opt(7, 45, 30)
        .unwrap();
    thermostat.set_time(&time).await.unwrap();
    let clock: Vec<u16> = (0..4)
        .map(|i| bus.register(5, proto::ClockTime::ADDRESS + i))
        .collect();
    assert_eq!(clock, [1, 7, 45, 30]);

    thermostat.set_keylock(Some(1234)).await.unwrap();
    assert_eq!(bus.register(5, proto::KeyLock::ADDRESS), 1);
    assert_eq!(bus.register(5, proto::KeyLock::ADDRESS + 1), 1234);
    thermostat.set_keylock(None).await.unwrap();
    assert_eq!(bus.register(5, proto::KeyLock::ADDRESS), 0);

    thermostat.factory_reset().await.unwrap();
    assert_eq!(bus.register(5, proto::FactoryReset::ADDRESS), 0x00A5);

    client.close().await;
}

#[tokio::test]
async fn hold_duration_encoding_is_configurable() {
    let bus = Bus::default().with_thermostat(2, celsius_thermostat());
    let mut config = test_config();
    config.hold_encoding = HoldDurationEncoding::HoursMinutes;
    let client = connected_client(&bus, config).await;

    client
        .add_thermostat(2)
        .unwrap()
        .set_hold_temperature(20.0, 150)
        .await
        .unwrap();
    assert_eq!(bus.register(2, proto::Hold::ADDRESS + 1), 0x021E);

    client.close().await;
}

#[tokio::test]
async fn temperatures_follow_the_thermostat_units() {
    let mut registers = celsius_thermostat();
    registers[proto::TemperatureUnit::ADDRESS as usize] = 1;
    registers[0x04] = 140;
    let bus = Bus::default().with_thermostat(4, registers);
    let client = connected_client(&bus, test_config()).await;
    let thermostat = client.add_thermostat(4).unwrap();

    assert_eq!(thermostat.units(), TemperatureUnit::Celsius);
    assert_eq!(
        thermostat.get_temperature_units().await.unwrap(),
        TemperatureUnit::Fahrenheit
    );
    assert_eq!(thermostat.units(), TemperatureUnit::Fahrenheit);

    thermostat.set_target_temperature(72.0).await.unwrap();
    assert_eq!(bus.register(4, 0x0004), 144);
    assert_matches!(
        thermostat.set_target_temperature(21.0).await,
        Err(Error::Protocol(proto::Error::Range(RangeError::Temperature { .. })))
    );

    thermostat
        .set_temperature_units(TemperatureUnit::Celsius)
        .await
        .unwrap();
    assert_eq!(bus.register(4, proto::TemperatureUnit::ADDRESS), 0);
    assert_eq!(thermostat.units(), TemperatureUnit::Celsius);
    thermostat.set_target_temperature(21.0).await.unwrap();

    client.close().await;
}

#[tokio::test]
async fn handles_for_the_same_device_share_its_units() {
    let mut registers = celsius_thermostat();
    registers[proto::TemperatureUnit::ADDRESS as usize] = 1;
    registers[0x04] = 140;
    let bus = Bus::default().with_thermostat(3, registers);
    let client = connected_client(&bus, test_config()).await;
    let first = client.add_thermostat(3).unwrap();
    let second = client.add_thermostat(3).unwrap().with_name("Hallway");
    let other = client.add_thermostat(4).unwrap();

    first.read_status().await.unwrap();
    assert_eq!(second.units(), TemperatureUnit::Fahrenheit);
    assert_eq!(other.units(), TemperatureUnit::Celsius);
    second.set_target_temperature(68.0).await.unwrap();
    assert_eq!(bus.register(3, 0x0004), 136);

    second
        .set_temperature_units(TemperatureUnit::Celsius)
        .await
        .unwrap();
    assert_eq!(first.units(), TemperatureUnit::Celsius);

    client.close().await;
}

#[tokio::test]
async fn invalid_values_never_reach_the_bus() {
    let bus = Bus::default().with_thermostat(1, celsius_thermostat());
    let client = connected_client(&bus, test_config()).await;
    let thermostat = client.add_thermostat(1).unwrap();

    assert_matches!(
        thermostat.set_target_temperature(50.0).await,
        Err(Error::Protocol(proto::Error::Range(RangeError::Temperature { .. })))
    );
    assert_matches!(
        thermostat.set_floor_limit_temperature(4.0).await,
        Err(Error::Protocol(proto::Error::Range(_)))
    );
    assert_matches!(
        thermostat.set_hold_temperature(20.0, 6000).await,
        Err(Error::Protocol(proto::Error::Range(RangeError::HoldDuration(6000))))
    );
    assert_matches!(
        thermostat.set_keylock(Some(12345)).await,
        Err(Error::Protocol(proto::Error::Range(RangeError::Pin(12345))))
    );
    assert_matches!(
        client.add_thermostat(33),
        Err(Error::Protocol(proto::Error::Range(RangeError::Address(33))))
    );
    let device = proto::DeviceAddress::try_from(1).unwrap();
    assert_matches!(
        client.read_registers(device, 0, 126).await,
        Err(Error::Protocol(proto::Error::Range(RangeError::RegisterCount { .. })))
    );
    assert_matches!(
        client.write_registers(device, 0, &[]).await,
        Err(Error::Protocol(proto::Error::Range(RangeError::RegisterCount { .. })))
    );
    assert!(bus.requests().is_empty());

    client.close().await;
}

#[tokio::test]
async fn exception_reply_is_reported() {
    let bus = Bus::default().with_thermostat(1, celsius_thermostat());
    let client = connected_client(&bus, test_config()).await;
    let device = proto::DeviceAddress::try_from(1).unwrap();

    assert_matches!(
        client.read_registers(device, 0x0100, 2).await,
        Err(Error::Transaction(TransactionError::Exception {
            address: 1,
            function: 0x03,
            exception: Exception::IllegalDataAddress,
        }))
    );
    // exceptions are answers, not transmission faults
    assert_eq!(bus.requests().len(), 1);

    client.close().await;
}

#[tokio::test]
async fn concurrent_operations_never_overlap() {
    let bus = Bus::default()
        .with_thermostat(1, celsius_thermostat())
        .with_thermostat(2, celsius_thermostat())
        .with_thermostat(3, celsius_thermostat());
    let client = connected_client(&bus, test_config()).await;

    let tasks: Vec<_> = (1..=3u8)
        .map(|id| {
            let thermostat = client.add_thermostat(id).unwrap();
            tokio::spawn(async move {
                for step in 0..4 {
                    let target = 15.0 + id as f32 + step as f32 * 0.5;
                    thermostat.set_target_temperature(target).await?;
                    let status = thermostat.read_status().await?;
                    assert_eq!(status.target_temperature, target);
                }
                Ok::<_, Error>(())
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(bus.requests().len(), 3 * 4 * 2);
    assert_eq!(bus.overlaps(), 0);
    client.close().await;
}

/// Counts how often the wrapped stream is dropped.
struct CountingStream {
    inner: DuplexStream,
    drops: Arc<AtomicUsize>,
}

impl Drop for CountingStream {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

impl AsyncRead for CountingStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for CountingStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[tokio::test]
async fn close_cancels_waiting_operations_and_releases_the_transport_once() {
    let bus = Bus::default().mute();
    let (client_side, device_side) = duplex(512);
    bus.spawn(device_side);
    let drops = Arc::new(AtomicUsize::new(0));
    let stream = CountingStream {
        inner: client_side,
        drops: drops.clone(),
    };

    let mut config = test_config();
    config.timeout = Duration::from_secs(10);
    let client = Client::new(config);
    client
        .connect(&mut StreamTransport::new("counting pipe", stream))
        .await
        .unwrap();
    assert_eq!(client.state().await, ConnectionState::Connected);

    let thermostat = client.add_thermostat(1).unwrap();
    let waiting = {
        let thermostat = thermostat.clone();
        tokio::spawn(async move { thermostat.read_status().await })
    };
    let queued = {
        let thermostat = thermostat.clone();
        tokio::spawn(async move { thermostat.turn_on().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.close().await;
    assert_matches!(waiting.await.unwrap(), Err(Error::Cancelled));
    assert_matches!(queued.await.unwrap(), Err(Error::Cancelled));
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(client.state().await, ConnectionState::Disconnected);

    // closing again changes nothing
    client.close().await;
    assert_eq!(drops.load(Ordering::SeqCst), 1);
    assert_eq!(client.state().await, ConnectionState::Disconnected);

    assert_matches!(thermostat.turn_on().await, Err(Error::NotConnected));
}

#[tokio::test]
async fn operations_require_a_connection() {
    let client = Client::new(test_config());
    assert_eq!(client.state().await, ConnectionState::Disconnected);
    let thermostat = client.add_thermostat(3).unwrap();
    assert_matches!(thermostat.read_status().await, Err(Error::NotConnected));
    assert_matches!(thermostat.turn_on().await, Err(Error::NotConnected));

    // closing a client that never connected is a no-op
    client.close().await;
    assert_eq!(client.state().await, ConnectionState::Disconnected);
}

struct BrokenTransport;

impl Transport for BrokenTransport {
    type Stream = DuplexStream;

    fn open(&mut self) -> io::Result<DuplexStream> {
        Err(io::Error::new(io::ErrorKind::NotFound, "no such device"))
    }

    fn name(&self) -> &str {
        "/dev/missing"
    }
}

#[tokio::test]
async fn connect_failure_leaves_client_disconnected() {
    let client = Client::new(test_config());
    assert_matches!(
        client.connect(&mut BrokenTransport).await,
        Err(Error::Connect(err)) if err.kind() == io::ErrorKind::NotFound
    );
    assert_eq!(client.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn transport_failure_closes_the_client() {
    let (client_side, device_side) = duplex(512);
    drop(device_side);
    let client = Client::new(test_config());
    client
        .connect(&mut StreamTransport::new("pipe", client_side))
        .await
        .unwrap();

    assert_matches!(
        client.add_thermostat(1).unwrap().turn_on().await,
        Err(Error::Transport(_))
    );
    assert_eq!(client.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn reconnect_after_close() {
    let bus = Bus::default().with_thermostat(6, celsius_thermostat());
    let client = connected_client(&bus, test_config()).await;
    client.close().await;

    let (client_side, device_side) = duplex(512);
    bus.spawn(device_side);
    client
        .connect(&mut StreamTransport::new("pipe", client_side))
        .await
        .unwrap();
    let units = client
        .add_thermostat(6)
        .unwrap()
        .get_temperature_units()
        .await
        .unwrap();
    assert_eq!(units, TemperatureUnit::Celsius);
    client.close().await;
}
