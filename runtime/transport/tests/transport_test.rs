//! Integration tests for the port transport
//!
//! These tests drive complete handshakes through the public API:
//! - Local pairs linked by name inside one transport
//! - A CPU and an AVP transport joined by the loopback mailbox
//! - Close/wait races, backpressure replay and the watchdog notification

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use avp_transport::wire::WATCHDOG_RESET_SENTINEL;
use avp_transport::*;
use avp_xpc::loopback::{self, LoopbackLoader, LoopbackSide};
use avp_xpc::Doorbell;

const LONG: Timeout = Timeout::millis(5_000);

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < Duration::from_secs(5), "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

fn local_transport() -> Arc<Transport> {
    Transport::init(TransportConfig::default(), Processor::Cpu, None).expect("transport")
}

/// Open two ports with the same name and connect them
fn local_pair(transport: &Arc<Transport>, name: &str) -> (PortHandle, PortHandle) {
    let waiter = transport.open(Some(name)).expect("open waiter");
    let connector = transport.open(Some(name)).expect("open connector");

    let t = Arc::clone(transport);
    let waiting = thread::spawn(move || t.wait_for_connect(waiter, LONG));
    wait_until("waiter to block", || {
        transport.port_state(waiter) == Ok(PortState::Waiting)
    });
    transport.connect(connector, LONG).expect("connect");
    waiting.join().expect("waiter panicked").expect("wait_for_connect");
    (waiter, connector)
}

struct Booted {
    cpu: Arc<Transport>,
    avp: Arc<Transport>,
    _cpu_side: LoopbackSide,
    avp_side: LoopbackSide,
}

fn boot() -> Booted {
    let (cpu_side, avp_side) = loopback::pair();
    let avp = Transport::init(
        TransportConfig::default(),
        Processor::Avp,
        Some(avp_side.platform()),
    )
    .expect("avp transport");
    let cpu = Transport::init(
        TransportConfig::default(),
        Processor::Cpu,
        Some(cpu_side.platform()),
    )
    .expect("cpu transport");

    let loader = LoopbackLoader::new(0x1000_0000);
    assert_eq!(cpu.boot_remote(&loader, "avp_fw.axf"), Ok(0x1000_0000));
    assert_eq!(loader.loaded(), vec!["avp_fw.axf".to_string()]);
    wait_until("avp to latch the mailbox", || cpu.is_mailbox_ready());
    assert!(avp.is_mailbox_ready());

    Booted {
        cpu,
        avp,
        _cpu_side: cpu_side,
        avp_side,
    }
}

/// `listener` waits on `name`, `caller` connects to it across the mailbox
fn remote_pair(
    listener: &Arc<Transport>,
    caller: &Arc<Transport>,
    name: &str,
    setup: impl FnOnce(PortHandle),
) -> (PortHandle, PortHandle) {
    let listening = listener.open(Some(name)).expect("open listener");
    setup(listening);
    let t = Arc::clone(listener);
    let waiting = thread::spawn(move || t.wait_for_connect(listening, LONG));

    let calling = caller.open(Some(name)).expect("open caller");
    caller.connect(calling, LONG).expect("connect");
    waiting.join().expect("listener panicked").expect("wait_for_connect");
    (listening, calling)
}

fn recv_blocking(transport: &Transport, port: PortHandle, out: &mut [u8]) -> Result<usize> {
    let start = Instant::now();
    loop {
        match transport.recv(port, out) {
            Err(TransportError::MailboxEmpty) => {
                assert!(start.elapsed() < Duration::from_secs(5), "no message arrived");
                let _ = transport.wait_message(port, Timeout::millis(100));
            }
            other => return other,
        }
    }
}

#[test]
fn test_local_round_trip() {
    let transport = local_transport();
    let (a, b) = local_pair(&transport, "A");
    assert_eq!(transport.port_state(a), Ok(PortState::Connected));
    assert_eq!(transport.port_state(b), Ok(PortState::Connected));

    let payload: Vec<u8> = (0..=255u8).collect();
    transport.send(b, &payload, Timeout::ZERO).expect("send");
    let mut buf = [0u8; MAX_MESSAGE_LEN];
    let n = transport.recv(a, &mut buf).expect("recv");
    assert_eq!(&buf[..n], &payload[..]);
    assert_eq!(transport.pending(a), Ok(0));
    assert_eq!(transport.recv(a, &mut buf), Err(TransportError::MailboxEmpty));

    transport.send(a, b"back", Timeout::ZERO).expect("send back");
    let n = transport.recv(b, &mut buf).expect("recv back");
    assert_eq!(&buf[..n], b"back");
}

#[test]
fn test_local_messages_keep_order() {
    let transport = local_transport();
    let (a, b) = local_pair(&transport, "ordered");

    let sender = {
        let t = Arc::clone(&transport);
        thread::spawn(move || {
            for i in 0..200u32 {
                t.send(b, &i.to_le_bytes(), Timeout::Infinite).expect("send");
            }
        })
    };

    let mut buf = [0u8; 4];
    for expected in 0..200u32 {
        let n = recv_blocking(&transport, a, &mut buf).expect("recv");
        assert_eq!(n, 4);
        assert_eq!(u32::from_le_bytes(buf), expected);
    }
    sender.join().expect("sender panicked");
}

#[test]
fn test_wait_for_connect_times_out_back_to_open() {
    let transport = local_transport();
    let port = transport.open(Some("A")).expect("open");

    let start = Instant::now();
    assert_eq!(
        transport.wait_for_connect(port, Timeout::millis(500)),
        Err(TransportError::ConnectTimeout)
    );
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_secs(3));
    assert_eq!(transport.port_state(port), Ok(PortState::Open));

    // still usable afterwards
    let partner = transport.open(Some("A")).expect("open partner");
    let t = Arc::clone(&transport);
    let waiting = thread::spawn(move || t.wait_for_connect(port, LONG));
    wait_until("waiter", || transport.port_state(port) == Ok(PortState::Waiting));
    transport.connect(partner, LONG).expect("connect");
    assert_eq!(waiting.join().expect("waiter panicked"), Ok(()));
}

#[test]
fn test_close_twice() {
    let transport = local_transport();
    let port = transport.open(None).expect("open");
    assert_eq!(transport.close(port), Ok(()));
    assert_eq!(transport.close(port), Err(TransportError::Closed));
    assert_eq!(transport.open_ports(), 0);
}

#[test]
fn test_close_wakes_waiter() {
    let transport = local_transport();
    let port = transport.open(Some("doomed")).expect("open");

    let t = Arc::clone(&transport);
    let waiting = thread::spawn(move || t.wait_for_connect(port, Timeout::Infinite));
    wait_until("waiter", || transport.port_state(port) == Ok(PortState::Waiting));

    transport.close(port).expect("close");
    assert_eq!(
        waiting.join().expect("waiter panicked"),
        Err(TransportError::ConnectionFailed)
    );
    assert_eq!(transport.port_state(port), Err(TransportError::Closed));
    assert_eq!(transport.close(port), Err(TransportError::Closed));
}

#[test]
fn test_local_full_queue() {
    let transport = local_transport();
    let waiter = transport.open(Some("narrow")).expect("open");
    let sender = transport.open(Some("narrow")).expect("open");
    transport.set_queue_depth(waiter, 2, 16).expect("depth");

    let t = Arc::clone(&transport);
    let waiting = thread::spawn(move || t.wait_for_connect(waiter, LONG));
    wait_until("waiter", || transport.port_state(waiter) == Ok(PortState::Waiting));
    transport.connect(sender, LONG).expect("connect");
    waiting.join().expect("waiter panicked").expect("wait");

    transport.send(sender, b"1", Timeout::ZERO).expect("first");
    transport.send(sender, b"2", Timeout::ZERO).expect("second");
    assert_eq!(
        transport.send(sender, b"3", Timeout::ZERO),
        Err(TransportError::MailboxFull)
    );

    let start = Instant::now();
    assert_eq!(
        transport.send(sender, b"3", Timeout::millis(30)),
        Err(TransportError::MailboxFull)
    );
    assert!(start.elapsed() >= Duration::from_millis(30));

    let mut buf = [0u8; 16];
    assert_eq!(transport.recv(waiter, &mut buf), Ok(1));
    transport.send(sender, b"3", Timeout::ZERO).expect("room again");
    assert!(matches!(
        transport.send(sender, &[0u8; 17], Timeout::ZERO),
        Err(TransportError::BadParameter(_))
    ));
}

#[test]
fn test_set_queue_depth_only_while_open() {
    let transport = local_transport();
    let idle = transport.open(Some("idle")).expect("open");
    let (a, _b) = local_pair(&transport, "other");

    assert_eq!(
        transport.set_queue_depth(a, 4, 16),
        Err(TransportError::InvalidState { state: PortState::Connected })
    );
    transport.set_queue_depth(idle, 4, 16).expect("open port resizes");
}

#[test]
fn test_peer_close_disconnects_locally() {
    let transport = local_transport();
    let (a, b) = local_pair(&transport, "short");

    transport.send(b, b"last words", Timeout::ZERO).expect("send");
    transport.close(b).expect("close");
    assert_eq!(transport.port_state(a), Ok(PortState::Disconnected));

    let mut buf = [0u8; 32];
    let n = transport.recv(a, &mut buf).expect("queued data survives");
    assert_eq!(&buf[..n], b"last words");
    assert_eq!(transport.recv(a, &mut buf), Err(TransportError::Disconnected));
    assert_eq!(
        transport.send(a, b"anyone?", Timeout::ZERO),
        Err(TransportError::Disconnected)
    );
}

#[test]
fn test_recv_small_buffer_keeps_message() {
    let transport = local_transport();
    let (a, b) = local_pair(&transport, "sizes");
    transport.send(b, &[9u8; 40], Timeout::ZERO).expect("send");

    let mut small = [0u8; 8];
    assert_eq!(
        transport.recv(a, &mut small),
        Err(TransportError::BufferTooSmall { needed: 40, available: 8 })
    );
    let mut big = [0u8; 64];
    assert_eq!(transport.recv(a, &mut big), Ok(40));
}

#[test]
fn test_remote_connect_and_exchange() {
    let booted = boot();
    let (avp_port, cpu_port) = remote_pair(&booted.avp, &booted.cpu, "svc", |_| {});
    assert_eq!(booted.cpu.port_state(cpu_port), Ok(PortState::Connected));
    assert_eq!(booted.avp.port_state(avp_port), Ok(PortState::Connected));

    booted.cpu.send(cpu_port, b"ping", LONG).expect("send");
    let mut buf = [0u8; MAX_MESSAGE_LEN];
    let n = recv_blocking(&booted.avp, avp_port, &mut buf).expect("avp recv");
    assert_eq!(&buf[..n], b"ping");

    let big = [0x5au8; MAX_MESSAGE_LEN];
    booted.avp.send(avp_port, &big, LONG).expect("reply");
    let n = recv_blocking(&booted.cpu, cpu_port, &mut buf).expect("cpu recv");
    assert_eq!(&buf[..n], &big[..]);
}

#[test]
fn test_remote_connect_without_listener_times_out() {
    let booted = boot();
    let port = booted.cpu.open(Some("nobody")).expect("open");
    let start = Instant::now();
    assert_eq!(
        booted.cpu.connect(port, Timeout::millis(100)),
        Err(TransportError::ConnectTimeout)
    );
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(booted.cpu.port_state(port), Ok(PortState::Open));
}

/// A remote Connect never claims a port that is paired with a local peer
#[test]
fn test_remote_connect_skips_locally_paired_port() {
    let booted = boot();
    let a = booted.avp.open(Some("dual")).expect("open a");
    let b = booted.avp.open(Some("dual")).expect("open b");

    let avp = Arc::clone(&booted.avp);
    let waiting = thread::spawn(move || avp.wait_for_connect(a, LONG));
    wait_until("a to block", || booted.avp.port_state(a) == Ok(PortState::Waiting));

    let remote = booted.cpu.open(Some("dual")).expect("open remote");
    assert_eq!(
        booted.cpu.connect(remote, Timeout::millis(200)),
        Err(TransportError::ConnectTimeout)
    );
    assert_eq!(booted.avp.port_state(a), Ok(PortState::Waiting));

    booted.avp.connect(b, LONG).expect("local connect");
    waiting.join().expect("waiter panicked").expect("wait_for_connect");

    booted.avp.send(a, b"local", Timeout::ZERO).expect("send");
    let mut buf = [0u8; 16];
    let n = booted.avp.recv(b, &mut buf).expect("recv");
    assert_eq!(&buf[..n], b"local");
}

#[test]
fn test_backpressure_replays_parked_message() {
    let booted = boot();
    let (avp_port, cpu_port) = remote_pair(&booted.avp, &booted.cpu, "bp", |port| {
        booted.avp.set_queue_depth(port, 1, 64).expect("depth");
    });

    booted.cpu.send(cpu_port, b"one", LONG).expect("one");
    booted.cpu.send(cpu_port, b"two", LONG).expect("two");
    wait_until("message to park", || booted.avp.backpressure_events() == 1);

    // parked message still occupies the mailbox
    let start = Instant::now();
    assert_eq!(
        booted.cpu.send(cpu_port, b"three", Timeout::ZERO),
        Err(TransportError::MailboxBusy)
    );
    assert!(start.elapsed() < Duration::from_millis(500));

    let mut buf = [0u8; 64];
    let n = recv_blocking(&booted.avp, avp_port, &mut buf).expect("one");
    assert_eq!(&buf[..n], b"one");
    // replayed without a resend
    let n = recv_blocking(&booted.avp, avp_port, &mut buf).expect("two");
    assert_eq!(&buf[..n], b"two");

    booted.cpu.send(cpu_port, b"three", LONG).expect("three");
    let n = recv_blocking(&booted.avp, avp_port, &mut buf).expect("three");
    assert_eq!(&buf[..n], b"three");
}

#[test]
fn test_remote_close_disconnects_peer() {
    let booted = boot();
    let (cpu_port, avp_port) = remote_pair(&booted.cpu, &booted.avp, "link", |_| {});

    booted.cpu.close(cpu_port).expect("close");
    wait_until("avp port to see the disconnect", || {
        booted.avp.port_state(avp_port) == Ok(PortState::Disconnected)
    });

    let mut buf = [0u8; 8];
    assert_eq!(booted.avp.recv(avp_port, &mut buf), Err(TransportError::Disconnected));
    assert_eq!(
        booted.avp.send(avp_port, b"x", Timeout::ZERO),
        Err(TransportError::Disconnected)
    );
}

#[test]
fn test_watchdog_reset_notifies_rpc_cpu_port() {
    let booted = boot();
    let (cpu_port, _avp_port) = remote_pair(&booted.cpu, &booted.avp, RPC_CPU_PORT, |_| {});

    booted.avp_side.doorbell.signal(WATCHDOG_RESET_SENTINEL);
    let mut buf = [0u8; 16];
    let n = recv_blocking(&booted.cpu, cpu_port, &mut buf).expect("reset notification");
    assert_eq!(&buf[..n], &RESET_NOTIFICATION);
}

#[test]
fn test_avp_cannot_boot_remote() {
    let booted = boot();
    let loader = LoopbackLoader::new(0);
    assert!(matches!(
        booted.avp.boot_remote(&loader, "again.axf"),
        Err(TransportError::BadParameter(_))
    ));
    assert!(matches!(
        booted.cpu.boot_remote(&loader, "again.axf"),
        Err(TransportError::BadParameter(_))
    ));
}
