//! Replay a capture file against a port handler.
//!
//! Usage: pcap_replay <FILE> <PORT> [timed|flood|step] [SPEED]

use std::cell::RefCell;
use std::rc::Rc;

use kestrel_core::{EventLoop, KestrelResult, PcapConfig, PcapReceiver, ReplayMode};

fn main() -> KestrelResult<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let path = args.next().expect("usage: pcap_replay <FILE> <PORT> [MODE] [SPEED]");
    let port: u16 = args.next().expect("missing port").parse().expect("port");
    let mode = match args.next().as_deref() {
        None | Some("timed") => ReplayMode::Timed,
        Some("flood") => ReplayMode::Flood,
        Some("step") => ReplayMode::Step,
        Some(other) => panic!("unknown mode {:?}", other),
    };
    let speed: f64 = args.next().map_or(1.0, |s| s.parse().expect("speed"));

    let event_loop = EventLoop::new()?;
    let config = PcapConfig {
        mode,
        speed_multiplier: speed,
        ..Default::default()
    };
    let mut receiver = PcapReceiver::new(&event_loop, config)?;

    let seen = Rc::new(RefCell::new((0usize, 0usize))); // packets, bytes
    let counter = Rc::clone(&seen);
    receiver.subscribe(port, move |packet| {
        let mut c = counter.borrow_mut();
        c.0 += 1;
        c.1 += packet.data.len();
    })?;

    receiver.open(&path)?;
    receiver.start();

    if mode == ReplayMode::Step {
        while receiver.step() {}
    } else {
        while !receiver.finished() {
            event_loop.run_once(100)?;
        }
    }

    let (packets, bytes) = *seen.borrow();
    println!("{}: {} packets, {} bytes to port {}", path, packets, bytes, port);
    Ok(())
}
