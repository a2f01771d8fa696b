mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{init_logger, TestHal};
use peregrine::config::{CoreConfig, VmConfig, PAGE_SIZE, SLEEP_INDEFINITE};
use peregrine::ffa::*;
use peregrine::guest::{GuestCtx, GuestExit};
use peregrine::vcpu::{InterruptType, MAILBOX_WRITABLE_INTID, VIRTUAL_TIMER_INTID};
use peregrine::vm::{VmId, PRIMARY_VM_ID};
use peregrine::Core;
use serial_test::serial;

const A: VmId = 2;
const B: VmId = 3;

fn new_core() -> Core<TestHal> {
    init_logger();
    let config = CoreConfig {
        pool_pages: 128,
        ..CoreConfig::default()
    }
    .with_secondary(VmConfig::secondary(0xa, 1, 8))
    .with_secondary(VmConfig::secondary(0xb, 1, 8));
    let core = Core::new(&config).unwrap();
    for id in [PRIMARY_VM_ID, A, B] {
        let base = core.vms().find(id).unwrap().ipa_mem().start;
        assert_eq!(core.rxtx_map(id, base, base.add(PAGE_SIZE), 1), FfaValue::success());
    }
    core
}

#[test]
#[serial]
fn mailbox_state_machine() {
    let core = new_core();
    // EMPTY: nothing to read or release.
    assert_eq!(core.msg_poll(B), FfaValue::error(FfaError::Retry));
    assert_eq!(core.rx_release(B), FfaValue::error(FfaError::Denied));

    // EMPTY -> RECEIVED.
    core.write_tx(A, 0, b"12345").unwrap();
    assert_eq!(core.msg_send(A, B, 5, false), FfaValue::success());
    assert_eq!(core.msg_send(PRIMARY_VM_ID, B, 1, false), FfaValue::error(FfaError::Busy));

    // RECEIVED -> READ.
    let msg = core.msg_poll(B);
    assert_eq!(msg.func, FFA_MSG_SEND_32);
    assert_eq!(msg.msg_send_sender(), A);
    assert_eq!(msg.msg_send_receiver(), B);
    assert_eq!(core.msg_poll(B), FfaValue::error(FfaError::Retry));
    assert_eq!(core.msg_send(A, B, 5, false), FfaValue::error(FfaError::Busy));

    // READ -> EMPTY.
    assert_eq!(core.rx_release(B), FfaValue::success());
    assert_eq!(core.rx_release(B), FfaValue::error(FfaError::Denied));
    assert_eq!(core.msg_send(A, B, 5, false), FfaValue::success());
}

#[test]
#[serial]
fn waiter_is_notified_once() {
    let core = new_core();
    let seen = Arc::new(Mutex::new(Vec::new()));

    // B's mailbox is full.
    assert_eq!(core.msg_send(PRIMARY_VM_ID, B, 0, false), FfaValue::success());

    let log = seen.clone();
    let mut step = 0;
    core.set_guest(
        A,
        0,
        Box::new(move |ctx: &mut GuestCtx<'_>, ret: FfaValue| {
            step += 1;
            match step {
                1 => {
                    assert!(ctx.interrupt_enable(MAILBOX_WRITABLE_INTID, true, InterruptType::Irq));
                    ctx.write_tx(b"hi").unwrap();
                    GuestExit::MsgSend { to: B, size: 2, notify: true }
                }
                2 => {
                    assert_eq!(ret.error_code(), Some(FfaError::Busy));
                    GuestExit::WaitForInterrupt { timeout: SLEEP_INDEFINITE }
                }
                3 => {
                    assert_eq!(ret.func, FFA_INTERRUPT_32);
                    let intid = ctx.interrupt_get();
                    let writable = ctx.mailbox_writable_get().map_or(0, |id| id as u32);
                    log.lock().unwrap().extend([intid, writable]);
                    GuestExit::MsgSend { to: B, size: 2, notify: true }
                }
                _ => GuestExit::Yield,
            }
        }),
    )
    .unwrap();
    core.set_guest(
        B,
        0,
        Box::new(|_: &mut GuestCtx<'_>, ret: FfaValue| {
            if ret.func == FFA_MSG_SEND_32 {
                GuestExit::RxRelease
            } else {
                GuestExit::MsgWait { timeout: SLEEP_INDEFINITE }
            }
        }),
    )
    .unwrap();

    let ret = core.run(PRIMARY_VM_ID, A, 0);
    assert_eq!(ret.func, PG_FFA_RUN_WAIT_FOR_INTERRUPT);
    assert_eq!(ret.sleep_time(), SLEEP_INDEFINITE);
    assert!(core.vms().find(B).unwrap().lock().mailbox.is_waiting(A));

    // B takes its message and releases the buffer.
    let ret = core.run(PRIMARY_VM_ID, B, 0);
    assert_eq!(ret.func, FFA_RX_RELEASE_32);
    assert_eq!(ret.arg1, B as u64);
    {
        let a = core.vms().find(A).unwrap().lock();
        assert!(a.mailbox.is_ready(B));
        assert_eq!(a.mailbox.ready_count(), 1);
    }

    // The primary learns who to notify, once.
    assert_eq!(core.mailbox_waiter_get(PRIMARY_VM_ID, B), A as i64);
    assert_eq!(core.mailbox_waiter_get(PRIMARY_VM_ID, B), -1);
    assert_eq!(core.interrupt_inject(PRIMARY_VM_ID, A, 0, MAILBOX_WRITABLE_INTID), 1);

    let ret = core.run(PRIMARY_VM_ID, A, 0);
    assert_eq!(ret.func, FFA_MSG_SEND_32);
    assert_eq!((ret.msg_send_sender(), ret.msg_send_receiver()), (A, B));
    assert_eq!(*seen.lock().unwrap(), [MAILBOX_WRITABLE_INTID, B as u32]);
    assert_eq!(core.mailbox_writable_get(A), -1);
}

#[test]
#[serial]
fn message_to_primary_is_handed_over() {
    let core = new_core();
    core.set_guest(
        A,
        0,
        Box::new(|ctx: &mut GuestCtx<'_>, ret: FfaValue| {
            if ret.func == FFA_SUCCESS_32 {
                return GuestExit::Yield;
            }
            ctx.write_tx(b"to primary").unwrap();
            GuestExit::MsgSend { to: PRIMARY_VM_ID, size: 10, notify: false }
        }),
    )
    .unwrap();
    let ret = core.run(PRIMARY_VM_ID, A, 0);
    assert_eq!(ret.func, FFA_MSG_SEND_32);
    assert_eq!(ret.msg_send_size(), 10);

    let mut buf = [0u8; 10];
    assert_eq!(core.read_rx(PRIMARY_VM_ID, 0, &mut buf), Ok(10));
    assert_eq!(&buf, b"to primary");
    // Already read by the primary: only release is left.
    assert_eq!(core.msg_poll(PRIMARY_VM_ID), FfaValue::error(FfaError::Retry));
    assert_eq!(core.rx_release(PRIMARY_VM_ID), FfaValue::success());
    assert_eq!(core.run(PRIMARY_VM_ID, A, 0).func, FFA_YIELD_32);
}

#[test]
#[serial]
fn wfi_timer_expires() {
    let core = new_core();
    let woke = Arc::new(Mutex::new(None));
    let result = woke.clone();
    let mut step = 0;
    core.set_guest(
        A,
        0,
        Box::new(move |ctx: &mut GuestCtx<'_>, _ret: FfaValue| {
            step += 1;
            if step == 1 {
                ctx.interrupt_enable(VIRTUAL_TIMER_INTID, true, InterruptType::Irq);
                GuestExit::WaitForInterrupt { timeout: 10_000 }
            } else {
                *result.lock().unwrap() = Some((Instant::now(), ctx.interrupt_get()));
                GuestExit::Yield
            }
        }),
    )
    .unwrap();

    let start = Instant::now();
    let ret = core.run(PRIMARY_VM_ID, A, 0);
    assert_eq!(ret.func, PG_FFA_RUN_WAIT_FOR_INTERRUPT);
    assert_eq!(ret.sleep_time(), 10_000);
    assert_eq!((ret.vm_id(), ret.vcpu_index()), (A, 0));

    std::thread::sleep(Duration::from_millis(1));
    let ret = core.run(PRIMARY_VM_ID, A, 0);
    assert_eq!(ret.func, FFA_YIELD_32);
    let (at, intid) = woke.lock().unwrap().take().unwrap();
    assert!(at.duration_since(start) >= Duration::from_nanos(10_000));
    assert_eq!(intid, VIRTUAL_TIMER_INTID);
}

#[test]
#[serial]
fn page_fault_resumes_or_aborts() {
    let core = new_core();
    let base = core.vms().find(A).unwrap().ipa_mem().start;
    let mut step = 0;
    core.set_guest(
        A,
        0,
        Box::new(move |_: &mut GuestCtx<'_>, _: FfaValue| {
            step += 1;
            match step {
                // Mapped read-write: a spurious fault, retried.
                1 => GuestExit::PageFault {
                    ipa: base.add(3 * PAGE_SIZE),
                    mode: peregrine::mm::Mode::W,
                },
                2 => GuestExit::Yield,
                _ => GuestExit::PageFault {
                    ipa: peregrine::Ipaddr::new(0x10),
                    mode: peregrine::mm::Mode::R,
                },
            }
        }),
    )
    .unwrap();
    assert_eq!(core.run(PRIMARY_VM_ID, A, 0).func, FFA_YIELD_32);
    assert_eq!(core.run(PRIMARY_VM_ID, A, 0), FfaValue::error(FfaError::Aborted));
    assert!(core.vms().find(A).unwrap().is_aborting());
}
