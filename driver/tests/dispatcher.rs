mod common;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use common::{config, map_mailbox, wait_until};
use parking_lot::Mutex;
use peregrine::config::SLEEP_INDEFINITE;
use peregrine::ffa::{FfaValue, FFA_INTERRUPT_32, FFA_MSG_SEND_32};
use peregrine::guest::{GuestCtx, GuestExit};
use peregrine::vcpu::{InterruptType, VIRTUAL_TIMER_INTID};
use pg_driver::timer::current_time_nanos;
use pg_driver::Driver;
use serial_test::serial;

const DOORBELL_INTID: u32 = 5;

#[test]
#[serial]
fn timer_wakes_wfi() {
    let slept = Arc::new(AtomicU64::new(0));
    let woke_by = Arc::new(AtomicU32::new(0));
    let (slept2, woke_by2) = (slept.clone(), woke_by.clone());
    let mut start = None;
    let guest = move |ctx: &mut GuestCtx<'_>, ret: FfaValue| {
        let t0 = match start {
            Some(t0) => t0,
            None => {
                ctx.interrupt_enable(VIRTUAL_TIMER_INTID, true, InterruptType::Irq);
                start = Some(current_time_nanos());
                return GuestExit::WaitForInterrupt { timeout: 10_000 };
            }
        };
        if ret.func == FFA_INTERRUPT_32 && woke_by2.load(Ordering::SeqCst) == 0 {
            // Read the clock before publishing the intid the test waits on.
            slept2.store(current_time_nanos() - t0, Ordering::SeqCst);
            woke_by2.store(ctx.interrupt_get(), Ordering::SeqCst);
        }
        GuestExit::WaitForInterrupt { timeout: SLEEP_INDEFINITE }
    };
    let _driver =
        Driver::init_with_guests(config(1), |core| core.set_guest(2, 0, Box::new(guest))).unwrap();

    assert!(wait_until(|| woke_by.load(Ordering::SeqCst) != 0));
    assert_eq!(woke_by.load(Ordering::SeqCst), VIRTUAL_TIMER_INTID);
    assert!(slept.load(Ordering::SeqCst) >= 10_000);
}

#[test]
#[serial]
fn repeated_interrupts_all_wake() {
    let count = Arc::new(AtomicU32::new(0));
    let seen = count.clone();
    let mut started = false;
    let guest = move |ctx: &mut GuestCtx<'_>, ret: FfaValue| {
        if !started {
            started = true;
            ctx.interrupt_enable(DOORBELL_INTID, true, InterruptType::Irq);
        } else if ret.func == FFA_INTERRUPT_32 && ctx.interrupt_get() == DOORBELL_INTID {
            seen.fetch_add(1, Ordering::SeqCst);
        }
        GuestExit::WaitForInterrupt { timeout: SLEEP_INDEFINITE }
    };
    let driver =
        Driver::init_with_guests(config(1), |core| core.set_guest(2, 0, Box::new(guest))).unwrap();

    let host = driver.dispatcher();
    for i in 1..=200 {
        host.interrupt_vm(2, DOORBELL_INTID);
        assert!(
            wait_until(|| count.load(Ordering::SeqCst) == i),
            "interrupt {} was lost",
            i
        );
    }
}

#[test]
#[serial]
fn secondaries_message_each_other() {
    let received = Arc::new(Mutex::new(Vec::new()));
    let inbox = received.clone();

    let mut sent = false;
    let sender = move |ctx: &mut GuestCtx<'_>, _: FfaValue| {
        if sent {
            return GuestExit::WaitForInterrupt { timeout: SLEEP_INDEFINITE };
        }
        sent = true;
        ctx.write_tx(b"from two").unwrap();
        GuestExit::MsgSend { to: 3, size: 8, notify: false }
    };
    let receiver = move |ctx: &mut GuestCtx<'_>, ret: FfaValue| {
        if ret.func == FFA_MSG_SEND_32 {
            assert_eq!(ret.msg_send_sender(), 2);
            let mut buf = vec![0u8; ret.msg_send_size() as usize];
            ctx.read_rx(&mut buf).unwrap();
            inbox.lock().push(buf);
            return GuestExit::RxRelease;
        }
        GuestExit::MsgWait { timeout: SLEEP_INDEFINITE }
    };

    let _driver = Driver::init_with_guests(config(2), |core| {
        map_mailbox(core, 2)?;
        map_mailbox(core, 3)?;
        core.set_guest(2, 0, Box::new(sender))?;
        core.set_guest(3, 0, Box::new(receiver))
    })
    .unwrap();

    assert!(wait_until(|| !received.lock().is_empty()));
    assert_eq!(received.lock()[0], b"from two");
}

#[test]
fn aborted_vm_stays_down() {
    let runs = Arc::new(AtomicU32::new(0));
    let counted = runs.clone();
    let guest = move |_: &mut GuestCtx<'_>, _: FfaValue| {
        counted.fetch_add(1, Ordering::SeqCst);
        GuestExit::Abort
    };
    let driver =
        Driver::init_with_guests(config(1), |core| core.set_guest(2, 0, Box::new(guest))).unwrap();

    let vm = driver.core().vms().find(2).unwrap();
    assert!(wait_until(|| vm.is_aborting()));
    let vcpu = driver.dispatcher().vcpu(2, 0).unwrap();
    assert!(wait_until(|| vcpu.is_sleeping()));
    // Waking it only gets it told again that the VM is gone.
    driver.dispatcher().interrupt_vm(2, DOORBELL_INTID);
    driver.dispatcher().handle_wake_up_request(2, 0);
    assert!(wait_until(|| vcpu.is_sleeping()));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn shutdown_stops_busy_workers() {
    let guest = |_: &mut GuestCtx<'_>, _: FfaValue| GuestExit::Yield;
    let mut driver = Driver::init_with_guests(config(2), |core| {
        core.set_guest(2, 0, Box::new(guest))?;
        core.set_guest(3, 0, Box::new(guest))
    })
    .unwrap();
    assert_eq!(driver.dispatcher().vms().len(), 2);

    driver.shutdown();
    assert!(driver.dispatcher().should_stop());
    // Idempotent.
    driver.shutdown();
}

#[test]
fn wake_requests_for_unknown_vcpus_are_ignored() {
    let driver = Driver::init(config(1)).unwrap();
    let host = driver.dispatcher();
    host.handle_wake_up_request(1, 0);
    host.handle_wake_up_request(2, 7);
    host.handle_wake_up_request(9, 0);
    host.interrupt_vm(9, DOORBELL_INTID);
    host.deliver_message(9);
    // The idle vCPU of VM 2 is still parked.
    let vcpu = host.vcpu(2, 0).unwrap();
    assert!(wait_until(|| vcpu.is_sleeping()));
}
