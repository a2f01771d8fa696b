#[macro_use]
extern crate log;

use peregrine::config::{CoreConfig, VmConfig, PAGE_SIZE, SLEEP_INDEFINITE};
use peregrine::ffa::{FfaError, FfaValue, FFA_INTERRUPT_32, FFA_MSG_SEND_32};
use peregrine::guest::{Guest, GuestCtx, GuestExit};
use peregrine::vcpu::{InterruptType, MAILBOX_READABLE_INTID};
use peregrine::vm::{VmId, FIRST_SECONDARY_VM_ID, PRIMARY_VM_ID};
use peregrine::PgError;
use pg_driver::socket::HEADER_SIZE;
use pg_driver::{logging, println};
use pg_driver::{Driver, DriverConfig, DriverError, MsgFlags, SockAddr, SockType};

const LOGO: &str = r"
    ____                                 _
   / __ \___  ________  ____ ________(_)___  ___
  / /_/ / _ \/ ___/ _ \/ __ `/ ___/ / / __ \/ _ \
 / ____/  __/ /  /  __/ /_/ / /  / / / / / /  __/
/_/    \___/_/   \___/\__, /_/  /_/_/_/ /_/\___/
                     /____/
";

const ECHO_VM_ID: VmId = FIRST_SECONDARY_VM_ID;
const ECHO_PORT: u64 = 7;

/// Sends every datagram back where it came from.
#[derive(Default)]
struct Echo {
    started: bool,
    reply: Option<Vec<u8>>,
    sending: bool,
}

impl Guest for Echo {
    fn resume(&mut self, ctx: &mut GuestCtx<'_>, ret: FfaValue) -> GuestExit {
        if !self.started {
            self.started = true;
            ctx.interrupt_enable(MAILBOX_READABLE_INTID, true, InterruptType::Irq);
            return GuestExit::MsgWait {
                timeout: SLEEP_INDEFINITE,
            };
        }
        if self.sending {
            self.sending = false;
            if ret.error_code() == Some(FfaError::Busy) {
                return GuestExit::Yield;
            }
            self.reply = None;
        }
        match ret.func {
            FFA_MSG_SEND_32 => {
                let mut msg = vec![0; ret.msg_send_size() as usize];
                if ctx.read_rx(&mut msg).is_ok() && msg.len() >= HEADER_SIZE {
                    let (src, dst) = msg.split_at_mut(8);
                    src.swap_with_slice(&mut dst[..8]);
                    self.reply = Some(msg);
                }
                return GuestExit::RxRelease;
            }
            FFA_INTERRUPT_32 => {
                ctx.interrupt_get();
            }
            _ => {}
        }
        if let Some(reply) = &self.reply {
            if ctx.write_tx(reply).is_ok() {
                self.sending = true;
                return GuestExit::MsgSend {
                    to: PRIMARY_VM_ID,
                    size: reply.len() as u32,
                    notify: false,
                };
            }
        }
        GuestExit::MsgWait {
            timeout: SLEEP_INDEFINITE,
        }
    }
}

fn main() -> Result<(), DriverError> {
    logging::init();
    println!("{}", LOGO);
    println!(
        "\
        log_level = {}\n\
        ",
        std::env::var("LOG").unwrap_or_default(),
    );

    let config = DriverConfig {
        core: CoreConfig::default().with_secondary(VmConfig::secondary(0xec40, 1, 16)),
        ..DriverConfig::default()
    };
    let mut driver = Driver::init_with_guests(config, |core| {
        let base = core
            .vms()
            .find(ECHO_VM_ID)
            .ok_or(PgError::InvalidParam)?
            .ipa_mem()
            .start;
        if let Some(err) = core.rxtx_map(ECHO_VM_ID, base, base.add(PAGE_SIZE), 1).error_code() {
            return Err(err.into());
        }
        core.set_guest(ECHO_VM_ID, 0, Box::new(Echo::default()))
    })?;

    let sock = driver.socket(SockType::Datagram, 0, true)?;
    sock.connect(&SockAddr::new(ECHO_VM_ID, ECHO_PORT))?;
    for word in ["hello", "peregrine"] {
        sock.sendmsg(word.as_bytes(), None, MsgFlags::empty())?;
        let mut buf = [0u8; 64];
        let (len, flags) = sock.recvmsg(&mut buf, MsgFlags::empty())?;
        println!(
            "VM {} echoed {:?} {:?}",
            ECHO_VM_ID,
            String::from_utf8_lossy(&buf[..len]),
            flags
        );
    }
    sock.release();

    driver.shutdown();
    info!("done");
    Ok(())
}
