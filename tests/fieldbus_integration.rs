//! End-to-end field-bus tests: the real driver and write guard against a
//! mock GoodWe inverter speaking Modbus/TCP.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;

use consus_edge::error::FieldBusError;
use consus_edge::fieldbus::driver::FieldBusDriver;
use consus_edge::fieldbus::registers::{names, RegisterAccess, RegisterDescriptor, RegisterMap};
use consus_edge::fieldbus::write_guard::{DropCause, WriteGuard, WriteGuardConfig};
use consus_edge::fieldbus::{RegisterBus, WriteOutcome};

/// Mock GoodWe inverter: holding registers in a map, every write captured.
struct MockInverter {
    registers: Arc<RwLock<HashMap<u16, u16>>>,
    writes: Arc<RwLock<Vec<(u16, u16)>>>,
    reject_writes: Arc<RwLock<bool>>,
}

impl MockInverter {
    fn new() -> Self {
        Self {
            registers: Arc::new(RwLock::new(HashMap::new())),
            writes: Arc::new(RwLock::new(Vec::new())),
            reject_writes: Arc::new(RwLock::new(false)),
        }
    }

    async fn seed(&self, address: u16, value: u16) {
        self.registers.write().await.insert(address, value);
    }

    async fn captured_writes(&self) -> Vec<(u16, u16)> {
        self.writes.read().await.clone()
    }

    async fn set_reject_writes(&self, reject: bool) {
        *self.reject_writes.write().await = reject;
    }

    async fn serve(self: Arc<Self>) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let server = Arc::clone(&self);
                tokio::spawn(async move {
                    let _ = server.handle_connection(stream).await;
                });
            }
        });
        Ok(addr)
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        loop {
            let mut header = [0u8; 7];
            if stream.read_exact(&mut header).await.is_err() {
                return Ok(());
            }
            let tid = u16::from_be_bytes([header[0], header[1]]);
            let len = u16::from_be_bytes([header[4], header[5]]) as usize;
            let uid = header[6];
            let mut body = vec![0u8; len.saturating_sub(1)];
            stream.read_exact(&mut body).await?;

            let response = self.respond(&body).await;
            let mut frame = Vec::with_capacity(7 + response.len());
            frame.extend_from_slice(&tid.to_be_bytes());
            frame.extend_from_slice(&0u16.to_be_bytes());
            frame.extend_from_slice(&((response.len() + 1) as u16).to_be_bytes());
            frame.push(uid);
            frame.extend_from_slice(&response);
            stream.write_all(&frame).await?;
        }
    }

    async fn respond(&self, body: &[u8]) -> Vec<u8> {
        let fc = body[0];
        match fc {
            // Read holding registers
            0x03 => {
                let address = u16::from_be_bytes([body[1], body[2]]);
                let quantity = u16::from_be_bytes([body[3], body[4]]);
                let registers = self.registers.read().await;
                let mut data = Vec::with_capacity(quantity as usize * 2);
                for offset in 0..quantity {
                    match registers.get(&(address + offset)) {
                        Some(value) => data.extend_from_slice(&value.to_be_bytes()),
                        // Illegal data address
                        None => return vec![fc | 0x80, 0x02],
                    }
                }
                let mut response = vec![fc, (quantity * 2) as u8];
                response.extend_from_slice(&data);
                response
            }
            // Write single register
            0x06 => {
                if *self.reject_writes.read().await {
                    return vec![fc | 0x80, 0x04];
                }
                let address = u16::from_be_bytes([body[1], body[2]]);
                let value = u16::from_be_bytes([body[3], body[4]]);
                self.registers.write().await.insert(address, value);
                self.writes.write().await.push((address, value));
                body[..5].to_vec()
            }
            // Write multiple registers
            0x10 => {
                if *self.reject_writes.read().await {
                    return vec![fc | 0x80, 0x04];
                }
                let address = u16::from_be_bytes([body[1], body[2]]);
                let quantity = u16::from_be_bytes([body[3], body[4]]);
                let mut registers = self.registers.write().await;
                let mut writes = self.writes.write().await;
                for offset in 0..quantity {
                    let base = 6 + offset as usize * 2;
                    let value = u16::from_be_bytes([body[base], body[base + 1]]);
                    registers.insert(address + offset, value);
                    writes.push((address + offset, value));
                }
                body[..5].to_vec()
            }
            // Illegal function
            _ => vec![fc | 0x80, 0x01],
        }
    }
}

fn descriptor(
    name: &str,
    address: u16,
    words: u8,
    signed: bool,
    scale: f64,
    access: RegisterAccess,
) -> RegisterDescriptor {
    RegisterDescriptor {
        name: name.to_string(),
        address,
        words,
        signed,
        scale,
        unit: String::new(),
        access,
    }
}

fn goodwe_register_map() -> Arc<RegisterMap> {
    let descriptors = vec![
        descriptor(names::GRID_METER_POWER, 36025, 1, true, 1.0, RegisterAccess::R),
        descriptor(names::BATTERY_SOC, 37007, 1, false, 1.0, RegisterAccess::R),
        descriptor(names::BATTERY_VOLTAGE, 37003, 1, false, 10.0, RegisterAccess::R),
        descriptor("pv_string_power_1", 35103, 2, false, 1.0, RegisterAccess::R),
        descriptor(names::EMS_POWER_MODE, 47511, 1, false, 1.0, RegisterAccess::Rw),
        descriptor(names::EMS_POWER_SET, 47512, 1, false, 1.0, RegisterAccess::Rw),
        descriptor(names::EXPORT_POWER_CAP, 47510, 1, false, 1.0, RegisterAccess::Rw),
        descriptor(names::METER_TARGET_BIAS, 47120, 1, true, 1.0, RegisterAccess::Rw),
    ];
    Arc::new(RegisterMap::from_descriptors(descriptors).unwrap())
}

async fn start_driver(server: &Arc<MockInverter>) -> FieldBusDriver {
    let addr = Arc::clone(server).serve().await.unwrap();
    let guard = Arc::new(WriteGuard::new(&WriteGuardConfig::default()));
    FieldBusDriver::new(
        addr.ip().to_string(),
        addr.port(),
        1,
        goodwe_register_map(),
        guard,
    )
}

#[tokio::test]
async fn reads_apply_scaling_and_sign_extension() {
    let server = Arc::new(MockInverter::new());
    server.seed(37007, 54).await;
    server.seed(37003, 4105).await; // 410.5 V at scale 10
    server.seed(36025, (-250i16) as u16).await;
    server.seed(35103, 0).await;
    server.seed(35104, 1200).await; // two-word string power

    let mut driver = start_driver(&server).await;
    assert_eq!(driver.read(names::BATTERY_SOC).await.unwrap(), 54.0);
    assert_eq!(driver.read(names::BATTERY_VOLTAGE).await.unwrap(), 410.5);
    assert_eq!(driver.read(names::GRID_METER_POWER).await.unwrap(), -250.0);
    assert_eq!(driver.read("pv_string_power_1").await.unwrap(), 1200.0);
}

#[tokio::test]
async fn unknown_register_fails_without_touching_the_wire() {
    let server = Arc::new(MockInverter::new());
    let mut driver = start_driver(&server).await;
    match driver.read("grid_frequency").await {
        Err(FieldBusError::UnknownRegister(name)) => assert_eq!(name, "grid_frequency"),
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn undefined_address_surfaces_as_device_exception() {
    let server = Arc::new(MockInverter::new());
    let mut driver = start_driver(&server).await;
    // battery_soc was never seeded on the device.
    match driver.read(names::BATTERY_SOC).await {
        Err(FieldBusError::Exception(_)) | Err(FieldBusError::Transport(_)) => {}
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn guarded_write_reaches_device_once_then_dedupes() {
    let server = Arc::new(MockInverter::new());
    let mut driver = start_driver(&server).await;

    let outcome = driver.write(names::EMS_POWER_SET, 2600.0).await.unwrap();
    assert_eq!(outcome, WriteOutcome::Applied);

    // Immediately again: inside the per-register interval.
    let outcome = driver.write(names::EMS_POWER_SET, 2600.0).await.unwrap();
    assert_eq!(outcome, WriteOutcome::Dropped(DropCause::ThrottlePerReg));

    // Past the interval but same value: deduped.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let outcome = driver.write(names::EMS_POWER_SET, 2600.0).await.unwrap();
    assert_eq!(outcome, WriteOutcome::Dropped(DropCause::Dedup));

    assert_eq!(server.captured_writes().await, vec![(47512, 2600)]);
    let counters = driver.write_counters();
    assert_eq!(counters.writes_ok, 1);
    assert_eq!(counters.writes_throttle_per_reg, 1);
    assert_eq!(counters.writes_dedup, 1);
}

#[tokio::test]
async fn write_storm_is_suppressed() {
    let server = Arc::new(MockInverter::new());
    let mut driver = start_driver(&server).await;

    let mut applied = 0;
    for _ in 0..10 {
        if let Ok(WriteOutcome::Applied) = driver.write(names::EMS_POWER_SET, 2600.0).await {
            applied += 1;
        }
    }
    assert_eq!(applied, 1);
    assert_eq!(server.captured_writes().await.len(), 1);
    let counters = driver.write_counters();
    assert_eq!(counters.writes_ok, 1);
    assert_eq!(
        counters.writes_throttle_per_reg + counters.writes_throttle_global,
        9
    );
}

#[tokio::test]
async fn negative_bias_round_trips_through_signed_register() {
    let server = Arc::new(MockInverter::new());
    let mut driver = start_driver(&server).await;

    let outcome = driver.write(names::METER_TARGET_BIAS, -120.0).await.unwrap();
    assert_eq!(outcome, WriteOutcome::Applied);
    assert_eq!(
        server.captured_writes().await,
        vec![(47120, (-120i16) as u16)]
    );
    assert_eq!(driver.read(names::METER_TARGET_BIAS).await.unwrap(), -120.0);
}

#[tokio::test]
async fn rejected_write_counts_as_error_and_is_retryable() {
    let server = Arc::new(MockInverter::new());
    let mut driver = start_driver(&server).await;
    server.set_reject_writes(true).await;

    let err = driver.write(names::EMS_POWER_SET, 1000.0).await.unwrap_err();
    assert!(matches!(
        err,
        FieldBusError::Exception(_) | FieldBusError::Transport(_)
    ));
    assert_eq!(driver.write_counters().writes_error, 1);

    // Device recovers: the same value must go through, not be deduped
    // against the failed attempt.
    server.set_reject_writes(false).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let outcome = driver.write(names::EMS_POWER_SET, 1000.0).await.unwrap();
    assert_eq!(outcome, WriteOutcome::Applied);
}
