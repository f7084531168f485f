use i2c_sniffer::gpio::simulated::{BusScript, SimulatedBackend};
use i2c_sniffer::gpio::{GpioError, Hardware, PinMode, Pull};
use i2c_sniffer::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SDA: u32 = 2;
const SCL: u32 = 3;

fn config() -> SnifferConfig {
    SnifferConfig::new("test-bus", SDA, SCL).with_poll_interval(Duration::from_micros(10))
}

fn bus() -> BusScript {
    BusScript::new(SDA as u8, SCL as u8, 5)
}

#[test]
fn test_sniffer_decodes_replayed_traffic() {
    let hardware = Hardware::new(SimulatedBackend::new());
    let mut sniffer = BusSniffer::new(&hardware, config());
    let received = sniffer.subscribe_channel();

    assert!(sniffer.is_valid());
    assert!(sniffer.is_good());
    sniffer.prepare().unwrap();
    assert_eq!(hardware.backend().pull(2), Some(Pull::Off));
    assert_eq!(hardware.backend().mode(3), Some(PinMode::Input));

    sniffer.start().unwrap();
    assert!(sniffer.is_running());
    assert!(hardware.backend().has_callback(2));
    assert!(hardware.backend().has_callback(3));

    hardware.backend().replay(bus().write(0x50, &[0xAB]).events());
    sniffer.stop();

    let transactions: Vec<Transaction> = received.try_iter().collect();
    assert_eq!(transactions.len(), 1);
    let kinds: Vec<FrameKind> = transactions[0].kinds().collect();
    assert_eq!(
        kinds,
        vec![FrameKind::Start, FrameKind::Address, FrameKind::Data, FrameKind::Stop]
    );
    assert_eq!(transactions[0].frames()[2].value(), 0xAB);

    let stats = sniffer.stats();
    assert_eq!(stats.transactions, 1);
    assert_eq!(stats.frames, 4);
    assert_eq!(stats.clock_hz, 100_000);
}

#[test]
fn test_stop_twice_then_restart_resumes_decoding() {
    let hardware = Hardware::new(SimulatedBackend::new());
    let mut sniffer = BusSniffer::new(&hardware, config());
    let received = sniffer.subscribe_channel();

    sniffer.start().unwrap();
    hardware.backend().replay(bus().write(0x10, &[1]).events());
    sniffer.stop();
    sniffer.stop();
    assert!(!sniffer.is_running());
    assert!(!hardware.backend().has_callback(2));

    // edges while stopped go nowhere
    hardware.backend().replay(bus().write(0x11, &[2]).events());

    sniffer.start().unwrap();
    hardware.backend().replay(bus().write(0x12, &[3]).events());
    sniffer.stop();

    let targets: Vec<(u32, Option<TargetAddress>)> = received
        .try_iter()
        .map(|t| (t.number(), t.target_address()))
        .collect();
    assert_eq!(
        targets,
        vec![
            (0, Some(TargetAddress::SevenBit(0x10))),
            (1, Some(TargetAddress::SevenBit(0x12))),
        ]
    );
}

#[test]
fn test_second_start_is_a_no_op() {
    let hardware = Hardware::new(SimulatedBackend::new());
    let mut sniffer = BusSniffer::new(&hardware, config());

    sniffer.start().unwrap();
    sniffer.start().unwrap();
    assert!(sniffer.is_running());
    sniffer.stop();
    assert!(!sniffer.is_running());
}

#[test]
fn test_stop_publishes_unterminated_transaction() {
    let hardware = Hardware::new(SimulatedBackend::new());
    let mut sniffer = BusSniffer::new(&hardware, config());
    let received = sniffer.subscribe_channel();

    sniffer.start().unwrap();
    hardware
        .backend()
        .replay(bus().start().byte(0xA0, true).bit(true).events());
    sniffer.stop();

    let transactions: Vec<Transaction> = received.try_iter().collect();
    assert_eq!(transactions.len(), 1);
    assert!(!transactions[0].is_complete());
    assert_eq!(
        transactions[0].anomalies(),
        &[
            Anomaly::IncompleteFrame { sequence: 2, bits: 1 },
            Anomaly::Interrupted,
        ]
    );
}

#[test]
fn test_invalid_pins_are_refused() {
    let hardware = Hardware::new(SimulatedBackend::new());

    let mut reserved = BusSniffer::new(&hardware, SnifferConfig::new("reserved", 2, 28));
    assert!(!reserved.is_valid());
    assert!(!reserved.is_good());
    assert!(matches!(reserved.prepare(), Err(SnifferError::InvalidPins { scl: 28, .. })));
    assert!(matches!(reserved.start(), Err(SnifferError::InvalidPins { .. })));

    let same = BusSniffer::new(&hardware, SnifferConfig::new("same", 4, 4));
    assert!(!same.is_valid());
}

#[test]
fn test_failed_hardware_is_not_good() {
    let hardware = Hardware::new(SimulatedBackend::failing());
    let mut sniffer = BusSniffer::new(&hardware, config());

    assert!(sniffer.is_valid());
    assert!(!sniffer.is_good());
    assert!(matches!(sniffer.start(), Err(SnifferError::NotReady(_))));
    assert!(matches!(
        sniffer.prepare(),
        Err(SnifferError::Prepare {
            line: "SDA",
            source: GpioError::NotInitialised,
            ..
        })
    ));
}

#[test]
fn test_registration_failure_detaches_and_disables() {
    let hardware = Hardware::new(SimulatedBackend::new());
    hardware.backend().refuse_callbacks_on(SCL as u8);
    let mut sniffer = BusSniffer::new(&hardware, config());

    let result = sniffer.start();
    assert!(matches!(
        result,
        Err(SnifferError::Gpio(GpioError::Registration { pin: 3, .. }))
    ));
    assert!(!sniffer.is_running());
    assert!(!sniffer.is_good());
    assert!(!hardware.backend().has_callback(SDA as u8));

    // stays safe to stop and drop
    sniffer.stop();
    drop(sniffer);
    assert_eq!(hardware.users(), 0);
}

#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<(String, u32)>>>,
}

impl TransactionSink for Recorder {
    fn deliver(&mut self, sniffer: &str, transaction: &Transaction) {
        self.seen
            .lock()
            .unwrap()
            .push((sniffer.to_string(), transaction.number()));
    }
}

#[test]
fn test_sinks_receive_sniffer_name() {
    let hardware = Hardware::new(SimulatedBackend::new());
    let mut sniffer = BusSniffer::new(&hardware, config());
    let recorder = Recorder::default();
    sniffer.subscribe(recorder.clone());

    sniffer.start().unwrap();
    hardware
        .backend()
        .replay(bus().write(0x20, &[1]).idle(20).read(0x20, &[2]).events());
    sniffer.stop();

    assert_eq!(
        *recorder.seen.lock().unwrap(),
        vec![("test-bus".to_string(), 0), ("test-bus".to_string(), 1)]
    );
}

#[test]
fn test_two_buses_share_the_hardware() {
    let hardware = Hardware::new(SimulatedBackend::new());
    let mut first = BusSniffer::new(&hardware, config());
    let mut second = BusSniffer::new(&hardware, SnifferConfig::new("aux", 17, 27));
    assert_eq!(hardware.users(), 4);

    let first_rx = first.subscribe_channel();
    let second_rx = second.subscribe_channel();
    first.start().unwrap();
    second.start().unwrap();

    hardware.backend().replay(bus().write(0x30, &[1]).events());
    hardware
        .backend()
        .replay(BusScript::new(17, 27, 5).read(0x31, &[2]).events());
    first.stop();
    second.stop();

    let first_targets: Vec<_> = first_rx.try_iter().map(|t| t.target_address()).collect();
    let second_targets: Vec<_> = second_rx.try_iter().map(|t| t.target_address()).collect();
    assert_eq!(first_targets, vec![Some(TargetAddress::SevenBit(0x30))]);
    assert_eq!(second_targets, vec![Some(TargetAddress::SevenBit(0x31))]);

    drop(first);
    assert!(hardware.is_initialised());
    drop(second);
    assert!(!hardware.is_initialised());
    assert_eq!(hardware.backend().terminate_calls(), 1);
}

#[test]
fn test_json_output_still_delivers() {
    let hardware = Hardware::new(SimulatedBackend::new());
    let mut sniffer = BusSniffer::new(
        &hardware,
        config()
            .with_format(OutputFormat::Json)
            .with_verbosity(Verbosity::TRACE),
    );
    let received = sniffer.subscribe_channel();

    sniffer.start().unwrap();
    hardware.backend().replay(bus().write(0x50, &[0xAB]).events());
    sniffer.stop();

    assert_eq!(received.try_iter().count(), 1);
}

#[test]
fn test_dropping_running_sniffer_stops_it() {
    let hardware = Hardware::new(SimulatedBackend::new());
    let mut sniffer = BusSniffer::new(&hardware, config());
    sniffer.start().unwrap();
    assert!(hardware.backend().has_callback(2));

    drop(sniffer);
    assert!(!hardware.backend().has_callback(2));
    assert!(!hardware.backend().has_callback(3));
    assert!(!hardware.is_initialised());
}
