//! Capture replay integration tests.
//!
//! Captures are synthesized in-memory (classic pcap in both byte orders and
//! both timestamp resolutions, plus pcapng with explicit `if_tsresol`),
//! written to temp files, and replayed through a real reactor.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use std::time::{Duration, Instant};

use kestrel_core::{
    EventLoop, KestrelError, PacketTimestamp, PcapConfig, PcapReceiver, ReceiverConfig, ReplayMode,
};
use tempfile::NamedTempFile;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ---------------------------------------------------------------------------
// Capture builders
// ---------------------------------------------------------------------------

const MAGIC_MICROS: u32 = 0xa1b2_c3d4;
const MAGIC_NANOS: u32 = 0xa1b2_3c4d;
const DLT_EN10MB: u32 = 1;
const DLT_LINUX_SLL: u32 = 113;

fn push_u16(out: &mut Vec<u8>, value: u16, swap: bool) {
    let value = if swap { value.swap_bytes() } else { value };
    out.extend_from_slice(&value.to_ne_bytes());
}

fn push_u32(out: &mut Vec<u8>, value: u32, swap: bool) {
    let value = if swap { value.swap_bytes() } else { value };
    out.extend_from_slice(&value.to_ne_bytes());
}

/// Ethernet + IPv4 + UDP frame. Checksums are zero; replay does not verify.
fn eth_udp_frame(dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&[0u8; 12]); // MACs
    frame.extend_from_slice(&0x0800u16.to_be_bytes());
    frame.extend_from_slice(&ipv4_udp(dst_port, payload));
    frame
}

/// Linux cooked-capture framing of the same IPv4/UDP packet.
fn sll_udp_frame(dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; 14]; // packet type, ARPHRD, addr len, addr
    frame.extend_from_slice(&0x0800u16.to_be_bytes()); // protocol at offset 14
    frame.extend_from_slice(&ipv4_udp(dst_port, payload));
    frame
}

/// 802.1Q-tagged Ethernet framing of the same IPv4/UDP packet.
fn vlan_udp_frame(dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&[0u8; 12]);
    frame.extend_from_slice(&0x8100u16.to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x2a]); // TCI, VLAN 42
    frame.extend_from_slice(&0x0800u16.to_be_bytes());
    frame.extend_from_slice(&ipv4_udp(dst_port, payload));
    frame
}

fn ipv4_udp(dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let udp_len = (8 + payload.len()) as u16;
    let total_len = 20 + udp_len;

    let mut packet = Vec::new();
    packet.push(0x45);
    packet.push(0);
    packet.extend_from_slice(&total_len.to_be_bytes());
    packet.extend_from_slice(&[0u8; 4]);
    packet.push(64);
    packet.push(17); // UDP
    packet.extend_from_slice(&[0u8; 2]);
    packet.extend_from_slice(&[10, 0, 0, 1]);
    packet.extend_from_slice(&[10, 0, 0, 2]);

    packet.extend_from_slice(&4000u16.to_be_bytes());
    packet.extend_from_slice(&dst_port.to_be_bytes());
    packet.extend_from_slice(&udp_len.to_be_bytes());
    packet.extend_from_slice(&[0u8; 2]);
    packet.extend_from_slice(payload);
    packet
}

struct LegacyRecord {
    ts_sec: u32,
    ts_frac: u32,
    caplen: Option<u32>, // None = frame length
    frame: Vec<u8>,
}

impl LegacyRecord {
    fn at(ts_sec: u32, ts_frac: u32, frame: Vec<u8>) -> Self {
        Self {
            ts_sec,
            ts_frac,
            caplen: None,
            frame,
        }
    }
}

fn legacy_capture(magic: u32, swap: bool, link_type: u32, records: &[LegacyRecord]) -> Vec<u8> {
    let mut out = Vec::new();
    push_u32(&mut out, magic, swap);
    push_u16(&mut out, 2, swap); // version major
    push_u16(&mut out, 4, swap); // version minor
    push_u32(&mut out, 0, swap); // thiszone
    push_u32(&mut out, 0, swap); // sigfigs
    push_u32(&mut out, 65535, swap); // snaplen
    push_u32(&mut out, link_type, swap);

    for record in records {
        let caplen = record.caplen.unwrap_or(record.frame.len() as u32);
        push_u32(&mut out, record.ts_sec, swap);
        push_u32(&mut out, record.ts_frac, swap);
        push_u32(&mut out, caplen, swap);
        push_u32(&mut out, record.frame.len() as u32, swap);
        out.extend_from_slice(&record.frame[..caplen as usize]);
    }
    out
}

fn wrap_block(block_type: u32, body: &[u8], swap: bool) -> Vec<u8> {
    let mut padded = body.to_vec();
    while padded.len() % 4 != 0 {
        padded.push(0);
    }
    let total_len = (8 + padded.len() + 4) as u32;

    let mut out = Vec::new();
    push_u32(&mut out, block_type, swap);
    push_u32(&mut out, total_len, swap);
    out.extend_from_slice(&padded);
    push_u32(&mut out, total_len, swap);
    out
}

/// Minimal pcapng: SHB, one IDB (optionally declaring `if_tsresol`), then
/// one EPB per packet.
fn pcapng_capture(tsresol: Option<u8>, packets: &[(u64, Vec<u8>)]) -> Vec<u8> {
    let swap = false;
    let mut out = Vec::new();

    let mut shb = Vec::new();
    push_u32(&mut shb, 0x1a2b_3c4d, swap); // byte-order magic
    push_u16(&mut shb, 1, swap); // version major
    push_u16(&mut shb, 0, swap); // version minor
    shb.extend_from_slice(&u64::MAX.to_ne_bytes()); // section length: unknown
    out.extend_from_slice(&wrap_block(0x0a0d_0d0a, &shb, swap));

    let mut idb = Vec::new();
    push_u16(&mut idb, DLT_EN10MB as u16, swap);
    push_u16(&mut idb, 0, swap); // reserved
    push_u32(&mut idb, 65535, swap); // snaplen
    if let Some(value) = tsresol {
        push_u16(&mut idb, 9, swap); // if_tsresol
        push_u16(&mut idb, 1, swap);
        idb.extend_from_slice(&[value, 0, 0, 0]); // value + padding
    }
    push_u16(&mut idb, 0, swap); // opt_endofopt
    push_u16(&mut idb, 0, swap);
    out.extend_from_slice(&wrap_block(1, &idb, swap));

    for (raw_ts, frame) in packets {
        let mut epb = Vec::new();
        push_u32(&mut epb, 0, swap); // interface id
        push_u32(&mut epb, (raw_ts >> 32) as u32, swap);
        push_u32(&mut epb, *raw_ts as u32, swap);
        push_u32(&mut epb, frame.len() as u32, swap);
        push_u32(&mut epb, frame.len() as u32, swap);
        epb.extend_from_slice(frame);
        out.extend_from_slice(&wrap_block(6, &epb, swap));
    }
    out
}

fn write_capture(bytes: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create capture file");
    file.write_all(bytes).expect("write capture");
    file.flush().expect("flush capture");
    file
}

#[derive(Debug, Clone)]
struct Captured {
    data: Vec<u8>,
    timestamp: PacketTimestamp,
    at: Instant,
}

type Capture = Rc<RefCell<Vec<Captured>>>;

fn capturing_handler(capture: &Capture) -> impl FnMut(&kestrel_core::PacketView<'_>) + 'static {
    let capture = Rc::clone(capture);
    move |packet| {
        capture.borrow_mut().push(Captured {
            data: packet.data.to_vec(),
            timestamp: packet.timestamp,
            at: Instant::now(),
        });
    }
}

fn flood_config() -> PcapConfig {
    PcapConfig {
        mode: ReplayMode::Flood,
        ..Default::default()
    }
}

fn run_to_completion(event_loop: &EventLoop, receiver: &PcapReceiver<'_>) {
    let start = Instant::now();
    while !receiver.finished() && start.elapsed() < Duration::from_secs(5) {
        event_loop.run_once(10).unwrap();
    }
    assert!(receiver.finished(), "replay did not finish in time");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn flood_replays_every_subscribed_packet_in_order() {
    init_logging();
    let records: Vec<LegacyRecord> = (0..5u32)
        .map(|i| {
            LegacyRecord::at(
                100 + i,
                0,
                eth_udp_frame(7000, format!("payload {}", i).as_bytes()),
            )
        })
        .collect();
    let file = write_capture(&legacy_capture(MAGIC_MICROS, false, DLT_EN10MB, &records));

    let event_loop = EventLoop::new().unwrap();
    let mut receiver = PcapReceiver::new(&event_loop, flood_config()).unwrap();
    let capture: Capture = Rc::default();
    receiver.subscribe(7000, capturing_handler(&capture)).unwrap();

    receiver.open(file.path()).unwrap();
    receiver.start();
    run_to_completion(&event_loop, &receiver);

    let packets = capture.borrow();
    assert_eq!(packets.len(), 5);
    for (i, packet) in packets.iter().enumerate() {
        assert_eq!(packet.data, format!("payload {}", i).as_bytes());
        assert_eq!(packet.timestamp.sec, 100 + i as i64);
    }
}

#[test]
fn step_mode_dispatches_exactly_one_packet_per_call() {
    init_logging();
    let records = vec![
        LegacyRecord::at(1, 0, eth_udp_frame(7001, b"one")),
        LegacyRecord::at(2, 0, eth_udp_frame(7001, b"two")),
    ];
    let file = write_capture(&legacy_capture(MAGIC_MICROS, false, DLT_EN10MB, &records));

    let event_loop = EventLoop::new().unwrap();
    let config = PcapConfig {
        mode: ReplayMode::Step,
        ..Default::default()
    };
    let mut receiver = PcapReceiver::new(&event_loop, config).unwrap();
    let capture: Capture = Rc::default();
    receiver.subscribe(7001, capturing_handler(&capture)).unwrap();
    receiver.open(file.path()).unwrap();

    // start() is a no-op in STEP mode.
    receiver.start();
    event_loop.run_once(0).unwrap();
    assert!(capture.borrow().is_empty());

    assert!(receiver.step());
    assert_eq!(capture.borrow().len(), 1);
    assert!(receiver.step());
    assert_eq!(capture.borrow().len(), 2);

    // Exhausted.
    assert!(!receiver.step());
    assert!(receiver.finished());
    assert_eq!(capture.borrow().len(), 2);
}

#[test]
fn timed_replay_at_double_speed_halves_the_intervals() {
    init_logging();
    // Packets spaced 100ms apart in capture time.
    let records = vec![
        LegacyRecord::at(10, 0, eth_udp_frame(7002, b"t0")),
        LegacyRecord::at(10, 100_000, eth_udp_frame(7002, b"t1")),
        LegacyRecord::at(10, 200_000, eth_udp_frame(7002, b"t2")),
    ];
    let file = write_capture(&legacy_capture(MAGIC_MICROS, false, DLT_EN10MB, &records));

    let event_loop = EventLoop::new().unwrap();
    let config = PcapConfig {
        mode: ReplayMode::Timed,
        speed_multiplier: 2.0,
        ..Default::default()
    };
    let mut receiver = PcapReceiver::new(&event_loop, config).unwrap();
    let capture: Capture = Rc::default();
    receiver.subscribe(7002, capturing_handler(&capture)).unwrap();
    receiver.open(file.path()).unwrap();
    receiver.start();
    run_to_completion(&event_loop, &receiver);

    let packets = capture.borrow();
    assert_eq!(packets.len(), 3);
    // 100ms of capture time at 2x is ~50ms of wall time. Generous bounds:
    // the scheduler only promises "not early".
    for pair in packets.windows(2) {
        let gap = pair[1].at - pair[0].at;
        assert!(
            gap >= Duration::from_millis(35) && gap <= Duration::from_millis(150),
            "inter-dispatch gap {:?} outside the 2x pacing window",
            gap
        );
    }
}

#[test]
fn swapped_endian_capture_parses() {
    init_logging();
    let records = vec![LegacyRecord::at(9, 5, eth_udp_frame(7003, b"swapped"))];
    let file = write_capture(&legacy_capture(MAGIC_MICROS, true, DLT_EN10MB, &records));

    let event_loop = EventLoop::new().unwrap();
    let mut receiver = PcapReceiver::new(&event_loop, flood_config()).unwrap();
    let capture: Capture = Rc::default();
    receiver.subscribe(7003, capturing_handler(&capture)).unwrap();
    receiver.open(file.path()).unwrap();
    receiver.start();
    run_to_completion(&event_loop, &receiver);

    let packets = capture.borrow();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].data, b"swapped");
    assert_eq!(packets[0].timestamp.sec, 9);
    assert_eq!(packets[0].timestamp.nsec, 5_000); // 5us
}

#[test]
fn nanosecond_magic_keeps_fraction_as_nanos() {
    init_logging();
    let records = vec![LegacyRecord::at(3, 123_456_789, eth_udp_frame(7004, b"ns"))];
    let file = write_capture(&legacy_capture(MAGIC_NANOS, false, DLT_EN10MB, &records));

    let event_loop = EventLoop::new().unwrap();
    let mut receiver = PcapReceiver::new(&event_loop, flood_config()).unwrap();
    let capture: Capture = Rc::default();
    receiver.subscribe(7004, capturing_handler(&capture)).unwrap();
    receiver.open(file.path()).unwrap();
    receiver.start();
    run_to_completion(&event_loop, &receiver);

    let packets = capture.borrow();
    assert_eq!(packets.len(), 1);
    assert_eq!(
        packets[0].timestamp,
        PacketTimestamp {
            sec: 3,
            nsec: 123_456_789
        }
    );
}

#[test]
fn sll_and_vlan_frames_decode() {
    init_logging();
    let event_loop = EventLoop::new().unwrap();

    // Linux cooked capture.
    let records = vec![LegacyRecord::at(1, 0, sll_udp_frame(7005, b"cooked"))];
    let file = write_capture(&legacy_capture(MAGIC_MICROS, false, DLT_LINUX_SLL, &records));
    let mut receiver = PcapReceiver::new(&event_loop, flood_config()).unwrap();
    let capture: Capture = Rc::default();
    receiver.subscribe(7005, capturing_handler(&capture)).unwrap();
    receiver.open(file.path()).unwrap();
    receiver.start();
    run_to_completion(&event_loop, &receiver);
    assert_eq!(capture.borrow().len(), 1);
    assert_eq!(capture.borrow()[0].data, b"cooked");

    // VLAN-tagged Ethernet.
    let records = vec![LegacyRecord::at(1, 0, vlan_udp_frame(7006, b"tagged"))];
    let file = write_capture(&legacy_capture(MAGIC_MICROS, false, DLT_EN10MB, &records));
    let mut receiver = PcapReceiver::new(&event_loop, flood_config()).unwrap();
    let capture: Capture = Rc::default();
    receiver.subscribe(7006, capturing_handler(&capture)).unwrap();
    receiver.open(file.path()).unwrap();
    receiver.start();
    run_to_completion(&event_loop, &receiver);
    assert_eq!(capture.borrow().len(), 1);
    assert_eq!(capture.borrow()[0].data, b"tagged");
}

#[test]
fn capture_truncated_packets_are_dropped() {
    init_logging();
    let full = eth_udp_frame(7007, b"whole");
    let mut truncated = LegacyRecord::at(1, 0, eth_udp_frame(7007, b"cut short"));
    truncated.caplen = Some(20); // snaplen clipped this one: caplen < origlen

    let records = vec![truncated, LegacyRecord::at(2, 0, full)];
    let file = write_capture(&legacy_capture(MAGIC_MICROS, false, DLT_EN10MB, &records));

    let event_loop = EventLoop::new().unwrap();
    let mut receiver = PcapReceiver::new(&event_loop, flood_config()).unwrap();
    let capture: Capture = Rc::default();
    receiver.subscribe(7007, capturing_handler(&capture)).unwrap();
    receiver.open(file.path()).unwrap();
    receiver.start();
    run_to_completion(&event_loop, &receiver);

    // The clipped packet is skipped, replay continues past it.
    let packets = capture.borrow();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].data, b"whole");
}

#[test]
fn pcapng_nanosecond_tsresol_round_trips() {
    init_logging();
    // One IDB with if_tsresol=9, one EPB with raw = 1_500_000_000.
    let bytes = pcapng_capture(Some(9), &[(1_500_000_000, eth_udp_frame(7008, b"ng"))]);
    let file = write_capture(&bytes);

    let event_loop = EventLoop::new().unwrap();
    let mut receiver = PcapReceiver::new(&event_loop, flood_config()).unwrap();
    let capture: Capture = Rc::default();
    receiver.subscribe(7008, capturing_handler(&capture)).unwrap();
    receiver.open(file.path()).unwrap();
    receiver.start();
    run_to_completion(&event_loop, &receiver);

    let packets = capture.borrow();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].data, b"ng");
    assert_eq!(
        packets[0].timestamp,
        PacketTimestamp {
            sec: 1,
            nsec: 500_000_000
        }
    );
}

#[test]
fn pcapng_microsecond_tsresol_round_trips() {
    init_logging();
    let bytes = pcapng_capture(Some(6), &[(2_500_000, eth_udp_frame(7009, b"us"))]);
    let file = write_capture(&bytes);

    let event_loop = EventLoop::new().unwrap();
    let mut receiver = PcapReceiver::new(&event_loop, flood_config()).unwrap();
    let capture: Capture = Rc::default();
    receiver.subscribe(7009, capturing_handler(&capture)).unwrap();
    receiver.open(file.path()).unwrap();
    receiver.start();
    run_to_completion(&event_loop, &receiver);

    let packets = capture.borrow();
    assert_eq!(packets.len(), 1);
    assert_eq!(
        packets[0].timestamp,
        PacketTimestamp {
            sec: 2,
            nsec: 500_000_000
        }
    );
}

#[test]
fn pcapng_without_tsresol_defaults_to_microseconds() {
    init_logging();
    let bytes = pcapng_capture(None, &[(3_000_001, eth_udp_frame(7010, b"default"))]);
    let file = write_capture(&bytes);

    let event_loop = EventLoop::new().unwrap();
    let mut receiver = PcapReceiver::new(&event_loop, flood_config()).unwrap();
    let capture: Capture = Rc::default();
    receiver.subscribe(7010, capturing_handler(&capture)).unwrap();
    receiver.open(file.path()).unwrap();
    receiver.start();
    run_to_completion(&event_loop, &receiver);

    let packets = capture.borrow();
    assert_eq!(packets.len(), 1);
    assert_eq!(
        packets[0].timestamp,
        PacketTimestamp {
            sec: 3,
            nsec: 1_000
        }
    );
}

#[test]
fn rewind_replays_the_capture_again() {
    init_logging();
    let records = vec![
        LegacyRecord::at(1, 0, eth_udp_frame(7011, b"a")),
        LegacyRecord::at(2, 0, eth_udp_frame(7011, b"b")),
    ];
    let file = write_capture(&legacy_capture(MAGIC_MICROS, false, DLT_EN10MB, &records));

    let event_loop = EventLoop::new().unwrap();
    let mut receiver = PcapReceiver::new(&event_loop, flood_config()).unwrap();
    let capture: Capture = Rc::default();
    receiver.subscribe(7011, capturing_handler(&capture)).unwrap();
    receiver.open(file.path()).unwrap();

    receiver.start();
    run_to_completion(&event_loop, &receiver);
    assert_eq!(capture.borrow().len(), 2);

    receiver.rewind();
    assert!(!receiver.finished());
    receiver.start();
    run_to_completion(&event_loop, &receiver);
    assert_eq!(capture.borrow().len(), 4);
}

#[test]
fn unsubscribed_ports_are_ignored() {
    init_logging();
    let records = vec![
        LegacyRecord::at(1, 0, eth_udp_frame(7012, b"wanted")),
        LegacyRecord::at(2, 0, eth_udp_frame(9999, b"unwanted")),
    ];
    let file = write_capture(&legacy_capture(MAGIC_MICROS, false, DLT_EN10MB, &records));

    let event_loop = EventLoop::new().unwrap();
    let mut receiver = PcapReceiver::new(&event_loop, flood_config()).unwrap();
    let capture: Capture = Rc::default();
    receiver.subscribe(7012, capturing_handler(&capture)).unwrap();
    receiver.open(file.path()).unwrap();
    receiver.start();
    run_to_completion(&event_loop, &receiver);

    let packets = capture.borrow();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].data, b"wanted");
}

#[test]
fn open_rejects_bad_files() {
    init_logging();
    let event_loop = EventLoop::new().unwrap();
    let mut receiver = PcapReceiver::new(&event_loop, flood_config()).unwrap();

    // Missing file.
    assert!(matches!(
        receiver.open("/nonexistent/capture.pcap"),
        Err(KestrelError::Io(_))
    ));

    // Too small for any header.
    let tiny = write_capture(&[0u8; 10]);
    assert!(matches!(
        receiver.open(tiny.path()),
        Err(KestrelError::Capture(_))
    ));

    // Unrecognized magic.
    let garbage = write_capture(&[0xabu8; 64]);
    assert!(matches!(
        receiver.open(garbage.path()),
        Err(KestrelError::Capture(_))
    ));
}

#[test]
fn empty_capture_finishes_immediately() {
    init_logging();
    let file = write_capture(&legacy_capture(MAGIC_MICROS, false, DLT_EN10MB, &[]));

    let event_loop = EventLoop::new().unwrap();
    let config = PcapConfig {
        mode: ReplayMode::Step,
        receiver: ReceiverConfig::default(),
        speed_multiplier: 1.0,
    };
    let mut receiver = PcapReceiver::new(&event_loop, config).unwrap();
    receiver.open(file.path()).unwrap();

    assert!(!receiver.step());
    assert!(receiver.finished());
}
