// Run Controller (C5): boot sequencing, snapshot save/load, signal
// wiring, and the fetch/execute loop to exit-diagnostic mapping (§4.4).
//
// Grounded on simctl.c's `mon()`/`boot()` functions almost one-to-one
// (same boot precedence: load_core -> load_file -> drivea.cpm sector
// 0, same signal roles) and emulator.rs's `Emulator` struct shape for
// owning CPU + memory + peripherals as one value instead of globals.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::termios::{self, LocalFlags, SetArg, Termios};

use crate::config::RunOptions;
use crate::cpu::decode::{step, StepOutcome, StopReason};
use crate::cpu::{Cpu, InterruptMode, PendingInterrupt};
use crate::error::Z80CoreError;
use crate::memory::{Bus, Memory};
use crate::peripherals::Peripherals;

// The `extern "C"` handlers below can only reach process-wide statics, so
// the flags handed out to `Peripherals`/the run loop are stashed here by
// `install_signal_handlers` rather than being freshly allocated per call.
static SIGINT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
static SIGQUIT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_sigint(_sig: libc::c_int) {
    if let Some(flag) = SIGINT_FLAG.get() {
        flag.store(true, Ordering::SeqCst);
    }
}
extern "C" fn on_sigquit(_sig: libc::c_int) {
    if let Some(flag) = SIGQUIT_FLAG.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

/// Puts stdin into cbreak mode (no line buffering, no echo) for the
/// console peripheral's byte-at-a-time reads, restoring the prior
/// settings when dropped. A non-tty stdin (piped input, as in the test
/// suite) is left alone.
struct TermGuard(Option<Termios>);

impl TermGuard {
    fn enter() -> TermGuard {
        let stdin = std::io::stdin();
        let Ok(original) = termios::tcgetattr(&stdin) else {
            return TermGuard(None);
        };
        let mut raw = original.clone();
        raw.local_flags.remove(LocalFlags::ICANON | LocalFlags::ECHO);
        let _ = termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw);
        TermGuard(Some(original))
    }
}

impl Drop for TermGuard {
    fn drop(&mut self) {
        if let Some(original) = &self.0 {
            let stdin = std::io::stdin();
            let _ = termios::tcsetattr(&stdin, SetArg::TCSANOW, original);
        }
    }
}

/// Installs the process-wide SIGINT/SIGQUIT dispositions and returns
/// the atomics peripherals should read (console 0's emergency bytes,
/// the run loop's stop condition).
fn install_signal_handlers() -> (Arc<AtomicBool>, Arc<AtomicBool>) {
    let sigint = SIGINT_FLAG.get_or_init(|| Arc::new(AtomicBool::new(false))).clone();
    let sigquit = SIGQUIT_FLAG.get_or_init(|| Arc::new(AtomicBool::new(false))).clone();

    let int_action = SigAction::new(SigHandler::Handler(on_sigint), SaFlags::SA_RESTART, SigSet::empty());
    let quit_action = SigAction::new(SigHandler::Handler(on_sigquit), SaFlags::SA_RESTART, SigSet::empty());
    // SAFETY: handlers only store to a static atomic, the minimal
    // signal-safe operation.
    unsafe {
        let _ = sigaction(Signal::SIGINT, &int_action);
        let _ = sigaction(Signal::SIGQUIT, &quit_action);
    }
    (sigint, sigquit)
}

/// The `core.z80` snapshot: registers in the order specified, followed
/// by the full 64 KiB RAM image.
fn save_snapshot(path: &Path, cpu: &Cpu, mem: &Memory) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    let iff = (cpu.iff1 as u8) | ((cpu.iff2 as u8) << 1);
    let bytes = [
        cpu.regs.a, cpu.regs.f, cpu.regs.b, cpu.regs.c, cpu.regs.d, cpu.regs.e, cpu.regs.h, cpu.regs.l,
        cpu.shadow.a, cpu.shadow.f, cpu.shadow.b, cpu.shadow.c, cpu.shadow.d, cpu.shadow.e, cpu.shadow.h, cpu.shadow.l,
        cpu.i, iff, cpu.r,
    ];
    file.write_all(&bytes)?;
    file.write_all(&cpu.pc.to_le_bytes())?;
    file.write_all(&cpu.sp.to_le_bytes())?;
    file.write_all(&cpu.ix.to_le_bytes())?;
    file.write_all(&cpu.iy.to_le_bytes())?;
    file.write_all(mem.as_slice())?;
    Ok(())
}

fn load_snapshot(path: &Path, cpu: &mut Cpu, mem: &mut Memory) -> Result<(), Z80CoreError> {
    let mut file = File::open(path).map_err(Z80CoreError::Io)?;
    let mut header = [0u8; 19];
    file.read_exact(&mut header)
        .map_err(|_| Z80CoreError::BadSnapshot(path.to_path_buf()))?;
    cpu.regs.a = header[0];
    cpu.regs.f = header[1];
    cpu.regs.b = header[2];
    cpu.regs.c = header[3];
    cpu.regs.d = header[4];
    cpu.regs.e = header[5];
    cpu.regs.h = header[6];
    cpu.regs.l = header[7];
    cpu.shadow.a = header[8];
    cpu.shadow.f = header[9];
    cpu.shadow.b = header[10];
    cpu.shadow.c = header[11];
    cpu.shadow.d = header[12];
    cpu.shadow.e = header[13];
    cpu.shadow.h = header[14];
    cpu.shadow.l = header[15];
    cpu.i = header[16];
    cpu.iff1 = header[17] & 0x01 != 0;
    cpu.iff2 = header[17] & 0x02 != 0;
    cpu.r = header[18];

    let mut word = [0u8; 2];
    file.read_exact(&mut word).map_err(|_| Z80CoreError::BadSnapshot(path.to_path_buf()))?;
    cpu.pc = u16::from_le_bytes(word);
    file.read_exact(&mut word).map_err(|_| Z80CoreError::BadSnapshot(path.to_path_buf()))?;
    cpu.sp = u16::from_le_bytes(word);
    file.read_exact(&mut word).map_err(|_| Z80CoreError::BadSnapshot(path.to_path_buf()))?;
    cpu.ix = u16::from_le_bytes(word);
    file.read_exact(&mut word).map_err(|_| Z80CoreError::BadSnapshot(path.to_path_buf()))?;
    cpu.iy = u16::from_le_bytes(word);

    let mut ram = vec![0u8; crate::memory::MEM_SIZE];
    file.read_exact(&mut ram)
        .map_err(|_| Z80CoreError::BadSnapshot(path.to_path_buf()))?;
    mem.load(0, &ram);
    Ok(())
}

fn boot(options: &RunOptions, disks_dir: &Path, cpu: &mut Cpu, mem: &mut Memory) -> Result<(), Z80CoreError> {
    if options.load_core {
        load_snapshot(&PathBuf::from("core.z80"), cpu, mem)?;
        return Ok(());
    }
    if let Some(path) = &options.exec_file {
        let bytes = std::fs::read(path).map_err(Z80CoreError::Io)?;
        mem.load(0, &bytes);
        return Ok(());
    }
    let boot_path = disks_dir.join("drivea.cpm");
    let mut file = File::open(&boot_path).map_err(Z80CoreError::Io)?;
    let mut sector = [0u8; 128];
    file.read_exact(&mut sector).map_err(Z80CoreError::Io)?;
    mem.load(0, &sector);
    Ok(())
}

/// Formats the §7 trailing diagnostic line for a given stop reason and
/// the PC the stopping instruction was fetched from. Exposed (not just
/// used internally) so callers driving the CPU loop themselves — as the
/// black-box integration tests do — can check the exact wording without
/// going through a full `run()`.
pub fn exit_message(reason: &StopReason, pc: u16) -> String {
    match reason {
        StopReason::OpHalt => format!("HALT Op-Code reached at {:04X}", pc),
        StopReason::IoTrap => format!("I/O Trap at {:04X}", pc),
        StopReason::IoError => format!("Fatal I/O Error at {:04X}", pc),
        StopReason::OpTrap(bytes) => {
            let hex: Vec<String> = bytes.iter().map(|b| format!("{:02x}", b)).collect();
            format!("Op-code trap at {:04X} {}", pc, hex.join(" "))
        }
        StopReason::UserInt => format!("User Interrupt at {:04X}", pc),
    }
}

/// Drives the CPU until a `StopReason` is hit or SIGQUIT set the
/// user-stop flag, then prints the exit diagnostic. Returns `Ok(())`
/// on any of the `StopReason` terminations (those are clean exits,
/// §7 class 2/3), or `Err` for class-1 config failures discovered
/// mid-run (MMU misconfiguration).
pub fn run(options: RunOptions, disks_dir: &Path, run_dir: &Path) -> Result<(), Z80CoreError> {
    let _term_guard = TermGuard::enter();
    let (sigint, sigquit) = install_signal_handlers();

    let mut cpu = Cpu::new();
    let mut mem = Memory::new(options.ram_fill);
    let mut peripherals = Peripherals::new(disks_dir, run_dir, options.trap_unbound_io, sigint, sigquit.clone())?;

    boot(&options, disks_dir, &mut cpu, &mut mem)?;
    if options.load_core {
        cpu.im = InterruptMode::Mode1;
    }

    loop {
        if sigquit.load(Ordering::SeqCst) {
            log::info!("{}", exit_message(&StopReason::UserInt, cpu.pc));
            break;
        }
        if peripherals.timer().take_tick() && cpu.pending_interrupt == PendingInterrupt::None {
            cpu.pending_interrupt = PendingInterrupt::Int(0xFF);
        }

        let entry_pc = cpu.pc;
        match step(&mut cpu, &mut mem, &mut peripherals) {
            StepOutcome::Continue => {}
            StepOutcome::Stop(reason) => {
                if matches!(reason, StopReason::IoError) {
                    if let Some(fault) = peripherals.take_mmu_fault() {
                        return Err(Z80CoreError::MmuMisconfigured(fault));
                    }
                }
                log::info!("{}", exit_message(&reason, entry_pc));
                break;
            }
        }
    }

    if options.save_core {
        save_snapshot(&PathBuf::from("core.z80"), &cpu, &mem).map_err(Z80CoreError::Io)?;
    }
    Ok(())
}
