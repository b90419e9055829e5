//! Minimal live listener: subscribe to one or more UDP ports and print
//! everything that arrives.
//!
//! Usage: udp_listen [--core N] [PORT ...]   (defaults to an OS-assigned port)

use kestrel_core::{pin_thread_to_core, EventLoop, KestrelResult, ReceiverConfig, UdpReceiver};

fn main() -> KestrelResult<()> {
    env_logger::init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("--core") {
        args.remove(0);
        let core: usize = args.remove(0).parse().expect("--core takes an index");
        pin_thread_to_core(core)?;
    }

    let ports: Vec<u16> = args
        .iter()
        .map(|arg| arg.parse().expect("ports are u16"))
        .collect();
    let ports = if ports.is_empty() { vec![0] } else { ports };

    let event_loop = EventLoop::new()?;
    let mut receiver = UdpReceiver::new(&event_loop, ReceiverConfig::default())?;

    for port in ports {
        let bound = receiver.subscribe(port, move |packet| {
            let flag = if packet.status.is_truncated() {
                " [truncated]"
            } else {
                ""
            };
            println!(
                "{:>5} bytes at {}.{:09}{}",
                packet.data.len(),
                packet.timestamp.sec,
                packet.timestamp.nsec,
                flag
            );
        })?;
        println!("listening on port {}", bound);
    }

    loop {
        event_loop.run_once(100)?;
    }
}
