// The peripheral set (C3), aggregated behind one `IoBus` implementor
// (§4.3's port map table).
//
// Grounded on iosim.c's `init_io()` (one function filling every port's
// handler pair) and memory.rs's `MemorySystem::new` composition style
// (one owner struct holding every device, constructed once at startup).

pub mod clock;
pub mod console;
pub mod fdc;
pub mod mmu_port;
pub mod socket;
pub mod timer;

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::error::Z80CoreError;
use crate::io::{IoBus, IoEvent};
use crate::memory::mmu::{Mmu, MmuError};
use crate::memory::Bus;

pub struct Peripherals {
    pub mmu: Mmu,
    fdc: fdc::Fdc,
    clock: clock::Clock,
    timer: timer::Timer,
    console: console::Console,
    printer: console::Printer,
    aux: console::Aux,
    sockets: socket::Sockets,
    trap_unbound: bool,
    mmu_fault: Option<MmuError>,
}

impl Peripherals {
    pub fn new(
        disks_dir: &Path,
        run_dir: &Path,
        trap_unbound: bool,
        sigint: Arc<AtomicBool>,
        sigquit: Arc<AtomicBool>,
    ) -> Result<Peripherals, Z80CoreError> {
        let fdc = fdc::Fdc::new(disks_dir).map_err(|e| Z80CoreError::DiskOpenFailure {
            path: disks_dir.to_path_buf(),
            source: e,
        })?;
        if !fdc.has_drive_a() {
            return Err(Z80CoreError::MissingDriveA(disks_dir.join("drivea.cpm")));
        }

        let printer_path: PathBuf = run_dir.join("printer.cpm");
        let printer = console::Printer::new(&printer_path)?;
        let aux = console::Aux::new(&run_dir.join("auxin"), &run_dir.join("auxout"));

        let server_confs = socket::parse_server_conf(&run_dir.join("net_server.conf"))
            .unwrap_or_default();
        let client_conf = socket::parse_client_conf(&run_dir.join("net_client.conf"))
            .unwrap_or(None);
        let sockets = socket::Sockets::new(&server_confs, client_conf).map_err(|f| {
            Z80CoreError::SocketBindFailure { index: f.index, port: f.port, source: f.source }
        })?;

        Ok(Peripherals {
            mmu: Mmu::new(),
            fdc,
            clock: clock::Clock::new(),
            timer: timer::Timer::new(),
            console: console::Console::new(sigint, sigquit),
            printer,
            aux,
            sockets,
            trap_unbound,
            mmu_fault: None,
        })
    }

    pub fn timer(&self) -> &timer::Timer {
        &self.timer
    }

    /// Drains a fatal MMU misconfiguration recorded by the last `OUT`
    /// to ports 20/21/22, if any. The run controller checks this after
    /// seeing `StopReason::IoError` to tell a class-1 config failure
    /// (exit 1 via `Z80CoreError`) apart from an ordinary class-3
    /// peripheral runtime error (clean "Fatal I/O Error" exit).
    pub fn take_mmu_fault(&mut self) -> Option<MmuError> {
        self.mmu_fault.take()
    }

    fn trap_or_zero(&self) -> (u8, IoEvent) {
        if self.trap_unbound {
            (0, IoEvent::Trap)
        } else {
            (0, IoEvent::None)
        }
    }
    fn trap_or_ignore(&self) -> IoEvent {
        if self.trap_unbound {
            IoEvent::Trap
        } else {
            IoEvent::None
        }
    }
}

impl IoBus for Peripherals {
    fn io_in(&mut self, port: u8, mem: &mut dyn Bus) -> (u8, IoEvent) {
        let _ = mem;
        match port {
            0 => (self.console.status(), IoEvent::None),
            1 => (self.console.read_data(), IoEvent::None),
            2 => (self.printer.status(), IoEvent::None),
            3 => (self.printer.read_data(), IoEvent::None),
            4 => (self.aux.status(), IoEvent::None),
            5 => (self.aux.read_data(), IoEvent::None),
            10 => (self.fdc.drive, IoEvent::None),
            11 => (self.fdc.track, IoEvent::None),
            12 => (self.fdc.sector_low_read(), IoEvent::None),
            13 => (0, IoEvent::None), // command register is write-only; reading it is bound but a no-op
            14 => (self.fdc.status, IoEvent::None),
            15 => (self.fdc.dma_lo, IoEvent::None),
            16 => (self.fdc.dma_hi, IoEvent::None),
            17 => (self.fdc.sector_high_read(), IoEvent::None),
            20 => (mmu_port::init_in(&self.mmu), IoEvent::None),
            21 => (mmu_port::select_in(&self.mmu), IoEvent::None),
            22 => (mmu_port::segsize_in(&self.mmu), IoEvent::None),
            25 => (0, IoEvent::None), // clock command register is write-only
            26 => (self.clock.read_data(), IoEvent::None),
            27 => (self.timer.enabled(), IoEvent::None),
            28 => (0, IoEvent::None),
            40 => (self.sockets.server_status(0), IoEvent::None),
            41 => (self.sockets.server_read(0), IoEvent::None),
            42 => (self.sockets.server_status(1), IoEvent::None),
            43 => (self.sockets.server_read(1), IoEvent::None),
            44 => (self.sockets.server_status(2), IoEvent::None),
            45 => (self.sockets.server_read(2), IoEvent::None),
            46 => (self.sockets.server_status(3), IoEvent::None),
            47 => (self.sockets.server_read(3), IoEvent::None),
            50 => (self.sockets.client_status(), IoEvent::None),
            51 => (self.sockets.client_read(), IoEvent::None),
            _ => self.trap_or_zero(),
        }
    }

    fn io_out(&mut self, port: u8, val: u8, mem: &mut dyn Bus) -> IoEvent {
        match port {
            0 => IoEvent::None, // console status/data direction register, bound but a no-op
            1 => {
                self.console.write_data(val);
                IoEvent::None
            }
            2 => IoEvent::None, // printer status/data direction register, bound but a no-op
            3 => {
                self.printer.write_data(val);
                IoEvent::None
            }
            4 => {
                self.aux.set_status(val);
                IoEvent::None
            }
            5 => {
                self.aux.write_data(val);
                IoEvent::None
            }
            10 => {
                self.fdc.select_drive(val);
                IoEvent::None
            }
            11 => {
                self.fdc.set_track(val);
                IoEvent::None
            }
            12 => {
                self.fdc.set_sector_lo(val);
                IoEvent::None
            }
            13 => {
                self.fdc.command(val, mem);
                IoEvent::None
            }
            15 => {
                self.fdc.set_dma_lo(val);
                IoEvent::None
            }
            16 => {
                self.fdc.set_dma_hi(val);
                IoEvent::None
            }
            17 => {
                self.fdc.set_sector_hi(val);
                IoEvent::None
            }
            14 => IoEvent::None, // FDC status register is read-only; OUT is bound but a no-op
            20 => match mmu_port::init_out(&mut self.mmu, val) {
                Ok(()) => IoEvent::None,
                Err(e) => {
                    self.mmu_fault = Some(e);
                    IoEvent::FatalError
                }
            },
            21 => match mmu_port::select_out(&mut self.mmu, val, mem) {
                Ok(()) => IoEvent::None,
                Err(e) => {
                    self.mmu_fault = Some(e);
                    IoEvent::FatalError
                }
            },
            22 => match mmu_port::segsize_out(&mut self.mmu, val) {
                Ok(()) => IoEvent::None,
                Err(e) => {
                    self.mmu_fault = Some(e);
                    IoEvent::FatalError
                }
            },
            25 => {
                self.clock.set_command(val);
                IoEvent::None
            }
            26 => IoEvent::None, // clock data register is read-only; OUT is bound but always ignored
            27 => {
                self.timer.set_enabled(val);
                IoEvent::None
            }
            28 => {
                timer::busy_delay();
                IoEvent::None
            }
            40 => IoEvent::None, // server slot 0 status register is read-only; OUT is bound but a no-op
            41 => {
                self.sockets.server_write(0, val);
                IoEvent::None
            }
            42 => IoEvent::None, // server slot 1 status register is read-only; OUT is bound but a no-op
            43 => {
                self.sockets.server_write(1, val);
                IoEvent::None
            }
            44 => IoEvent::None, // server slot 2 status register is read-only; OUT is bound but a no-op
            45 => {
                self.sockets.server_write(2, val);
                IoEvent::None
            }
            46 => IoEvent::None, // server slot 3 status register is read-only; OUT is bound but a no-op
            47 => {
                self.sockets.server_write(3, val);
                IoEvent::None
            }
            50 => IoEvent::None, // client status register is read-only; OUT is bound but a no-op
            51 => {
                self.sockets.client_write(val);
                IoEvent::None
            }
            _ => self.trap_or_ignore(),
        }
    }
}
