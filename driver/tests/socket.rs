mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{config, map_mailbox, wait_until};
use peregrine::config::{MAILBOX_SIZE, SLEEP_INDEFINITE};
use peregrine::ffa::{FfaValue, FFA_MSG_SEND_32};
use peregrine::guest::{GuestCtx, GuestExit};
use peregrine::vm::PRIMARY_VM_ID;
use pg_driver::socket::{HEADER_SIZE, MAX_PAYLOAD};
use pg_driver::{Driver, DriverConfig, MsgFlags, SockAddr, SockError, SockState, SockType, Socket, AF_PG};

const VM: u16 = 2;

fn datagram(driver: &Driver) -> Socket {
    driver.socket(SockType::Datagram, 0, true).unwrap()
}

/// Two host sockets talking to each other. Ports are handed out in connect
/// order starting at 1, so `b` gets 1 and `a` gets 2.
fn loopback_pair(driver: &Driver) -> (Socket, Socket) {
    let a = datagram(driver);
    let b = datagram(driver);
    b.connect(&SockAddr::new(PRIMARY_VM_ID, 2)).unwrap();
    a.connect(&SockAddr::new(PRIMARY_VM_ID, 1)).unwrap();
    assert_eq!(b.local_port(), Some(1));
    assert_eq!(a.local_port(), Some(2));
    (a, b)
}

#[test]
fn loopback() {
    let driver = Driver::init(config(0)).unwrap();
    let (a, b) = loopback_pair(&driver);

    assert_eq!(a.sendmsg(b"hello", None, MsgFlags::empty()), Ok(5));
    let mut buf = [0u8; 16];
    let (len, flags) = b.recvmsg(&mut buf, MsgFlags::empty()).unwrap();
    assert_eq!(&buf[..len], b"hello");
    assert!(!flags.contains(MsgFlags::TRUNC));
}

#[test]
fn truncation() {
    let driver = Driver::init(config(0)).unwrap();
    let (a, b) = loopback_pair(&driver);

    a.sendmsg(b"abcdefgh", None, MsgFlags::empty()).unwrap();
    let mut buf = [0u8; 3];
    let (len, flags) = b.recvmsg(&mut buf, MsgFlags::empty()).unwrap();
    assert_eq!(len, 3);
    assert_eq!(&buf, b"abc");
    assert!(flags.contains(MsgFlags::TRUNC));
    // The rest of the datagram is gone.
    assert_eq!(
        b.recvmsg(&mut buf, MsgFlags::DONTWAIT),
        Err(SockError::WouldBlock)
    );
}

#[test]
fn message_too_large() {
    let driver = Driver::init(config(0)).unwrap();
    let (a, b) = loopback_pair(&driver);

    let big = vec![0x5a; MAILBOX_SIZE];
    assert_eq!(
        a.sendmsg(&big, None, MsgFlags::empty()),
        Err(SockError::MessageTooLarge)
    );
    assert_eq!(MAX_PAYLOAD, MAILBOX_SIZE - HEADER_SIZE);
    assert_eq!(a.sendmsg(&big[..MAX_PAYLOAD], None, MsgFlags::empty()), Ok(MAX_PAYLOAD));
    let mut buf = vec![0u8; MAILBOX_SIZE];
    assert_eq!(b.recvmsg(&mut buf, MsgFlags::empty()).unwrap().0, MAX_PAYLOAD);
}

#[test]
fn distinct_local_ports() {
    let driver = Driver::init(config(1)).unwrap();
    let x = datagram(&driver);
    let y = datagram(&driver);
    x.connect(&SockAddr::new(VM, 9)).unwrap();
    y.connect(&SockAddr::new(VM, 9)).unwrap();
    assert_ne!(x.local_port(), y.local_port());
    assert_eq!(x.peer(), y.peer());
    assert_eq!(x.state(), SockState::Connected);
}

#[test]
fn creation_rules() {
    let driver = Driver::init(config(0)).unwrap();
    for kind in [SockType::Stream, SockType::Raw, SockType::SeqPacket] {
        assert_eq!(
            driver.socket(kind, 0, true).err(),
            Some(SockError::TypeNotSupported)
        );
    }
    assert_eq!(
        driver.socket(SockType::Datagram, 17, true).err(),
        Some(SockError::ProtocolNotSupported)
    );
    let denied = driver.socket(SockType::Datagram, 0, false).err();
    assert_eq!(denied, Some(SockError::PermissionDenied));
    assert_eq!(denied.map(|e| e.errno()), Some(1));

    let sock = datagram(&driver);
    assert_eq!(sock.state(), SockState::Unconnected);
    assert_eq!(sock.bind(&SockAddr::new(VM, 1)), Err(SockError::NotSupported));
    assert_eq!(sock.listen(1), Err(SockError::NotSupported));
    assert!(matches!(sock.accept(), Err(SockError::NotSupported)));
    assert_eq!(sock.shutdown(), Err(SockError::NotSupported));
    assert_eq!(sock.setsockopt(1, 2, &[]), Err(SockError::NotSupported));
    assert_eq!(sock.ioctl(0, 0), Err(SockError::NotSupported));
    assert_eq!(sock.mmap(4096), Err(SockError::NotSupported));
    assert_eq!(sock.sendpage(&[0], MsgFlags::empty()), Err(SockError::NotSupported));
}

#[test]
fn connect_and_send_rules() {
    let driver = Driver::init(config(1)).unwrap();
    let sock = datagram(&driver);
    let mut buf = [0u8; 8];

    assert_eq!(
        sock.sendmsg(b"x", None, MsgFlags::empty()),
        Err(SockError::NotConnected)
    );
    assert_eq!(
        sock.recvmsg(&mut buf, MsgFlags::empty()),
        Err(SockError::NotConnected)
    );

    let mut wrong = SockAddr::new(VM, 1);
    wrong.family = AF_PG + 1;
    assert_eq!(sock.connect(&wrong), Err(SockError::InvalidArgument));
    assert_eq!(
        sock.connect(&SockAddr::new(9, 1)),
        Err(SockError::PeerUnreachable)
    );
    sock.connect(&SockAddr::new(VM, 1)).unwrap();
    assert_eq!(
        sock.connect(&SockAddr::new(VM, 2)),
        Err(SockError::AlreadyConnected)
    );
    assert_eq!(sock.peer(), Some(SockAddr::new(VM, 1)));

    let dest = SockAddr::new(VM, 1);
    assert_eq!(
        sock.sendmsg(b"x", Some(&dest), MsgFlags::empty()),
        Err(SockError::AlreadyConnected)
    );
    assert_eq!(
        sock.sendmsg(b"x", None, MsgFlags::OOB),
        Err(SockError::NotSupported)
    );
    assert_eq!(
        sock.recvmsg(&mut buf, MsgFlags::DONTWAIT),
        Err(SockError::WouldBlock)
    );
}

#[test]
fn busy_peer_would_block() {
    let driver = Driver::init_with_guests(config(1), |core| map_mailbox(core, VM)).unwrap();
    let sock = datagram(&driver);
    sock.connect(&SockAddr::new(VM, 1)).unwrap();

    // Nobody reads VM 2's mailbox.
    assert_eq!(sock.sendmsg(b"first", None, MsgFlags::empty()), Ok(5));
    assert_eq!(
        sock.sendmsg(b"second", None, MsgFlags::empty()),
        Err(SockError::WouldBlock)
    );
}

#[test]
fn exhausted_send_quota_would_block() {
    let driver = Driver::init(DriverConfig {
        send_quota: 0,
        ..config(0)
    })
    .unwrap();
    let (a, b) = loopback_pair(&driver);

    assert_eq!(
        a.sendmsg(b"no room", None, MsgFlags::DONTWAIT),
        Err(SockError::WouldBlock)
    );
    assert_eq!(
        b.sendmsg(b"", None, MsgFlags::DONTWAIT),
        Err(SockError::WouldBlock)
    );
}

#[test]
fn peer_without_mailbox() {
    let driver = Driver::init(config(1)).unwrap();
    let sock = datagram(&driver);
    sock.connect(&SockAddr::new(VM, 1)).unwrap();
    assert_eq!(
        sock.sendmsg(b"lost", None, MsgFlags::empty()),
        Err(SockError::WouldBlock)
    );
}

#[test]
fn secondary_replies() {
    let seen = Arc::new(AtomicUsize::new(0));
    let count = seen.clone();
    let mut reply = None;
    let mut started = false;
    let guest = move |ctx: &mut GuestCtx<'_>, ret: FfaValue| {
        if !started {
            started = true;
            return GuestExit::MsgWait { timeout: SLEEP_INDEFINITE };
        }
        if ret.func == FFA_MSG_SEND_32 {
            let mut msg = vec![0u8; ret.msg_send_size() as usize];
            ctx.read_rx(&mut msg).unwrap();
            // Back to the sender: swap the ports, shout the payload.
            let (src, rest) = msg.split_at_mut(8);
            src.swap_with_slice(&mut rest[..8]);
            msg[HEADER_SIZE..].make_ascii_uppercase();
            count.fetch_add(1, Ordering::SeqCst);
            reply = Some(msg);
            return GuestExit::RxRelease;
        }
        match reply.take() {
            Some(msg) => {
                ctx.write_tx(&msg).unwrap();
                GuestExit::MsgSend { to: PRIMARY_VM_ID, size: msg.len() as u32, notify: false }
            }
            None => GuestExit::MsgWait { timeout: SLEEP_INDEFINITE },
        }
    };
    let driver = Driver::init_with_guests(config(1), |core| {
        map_mailbox(core, VM)?;
        core.set_guest(VM, 0, Box::new(guest))
    })
    .unwrap();

    // Wait for the guest to block on its mailbox.
    let vcpu = driver.dispatcher().vcpu(VM, 0).unwrap();
    assert!(wait_until(|| vcpu.is_waiting_for_message()));

    let sock = datagram(&driver);
    sock.connect(&SockAddr::new(VM, 7)).unwrap();
    sock.sendmsg(b"ping", None, MsgFlags::empty()).unwrap();
    let mut buf = [0u8; 16];
    let (len, flags) = sock.recvmsg(&mut buf, MsgFlags::empty()).unwrap();
    assert_eq!(&buf[..len], b"PING");
    assert!(flags.is_empty());
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    // Another socket to the same port does not see replies meant for `sock`.
    let other = datagram(&driver);
    other.connect(&SockAddr::new(VM, 7)).unwrap();
    assert!(wait_until(|| vcpu.is_waiting_for_message()));
    sock.sendmsg(b"again", None, MsgFlags::empty()).unwrap();
    let (len, _) = sock.recvmsg(&mut buf, MsgFlags::empty()).unwrap();
    assert_eq!(&buf[..len], b"AGAIN");
    assert_eq!(
        other.recvmsg(&mut buf, MsgFlags::DONTWAIT),
        Err(SockError::WouldBlock)
    );
}

#[test]
fn released_socket_stops_receiving() {
    let driver = Driver::init(config(0)).unwrap();
    let (a, b) = loopback_pair(&driver);
    b.release();
    // Delivered nowhere, but still a successful send.
    assert_eq!(a.sendmsg(b"gone", None, MsgFlags::empty()), Ok(4));
    let c = datagram(&driver);
    c.connect(&SockAddr::new(PRIMARY_VM_ID, 2)).unwrap();
    assert_eq!(c.local_port(), Some(3));
}
