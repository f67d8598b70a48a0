// Console 0 (local TTY), printer, and AUX (§4.3.4).
//
// Grounded on iosim.c's `con_status_in`/`con_data_in/out`,
// `lpt_data_out`, `aux_status_in`/`aux_data_in/out` handlers. Raw-mode
// terminal setup (done once, by the run controller, not here) is
// grounded on simctl.c's `mon()` termios flag clearing, re-expressed
// via `nix::sys::termios`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Console 0: reconciles the status/data port pair against a one-byte
/// look-ahead and the two signal-synthesized emergency bytes.
pub struct Console {
    buffered: Option<u8>,
    sigint: Arc<AtomicBool>,
    sigquit: Arc<AtomicBool>,
}

impl Console {
    pub fn new(sigint: Arc<AtomicBool>, sigquit: Arc<AtomicBool>) -> Console {
        Console { buffered: None, sigint, sigquit }
    }

    /// `IN 0`: byte available if buffered, or a pending emergency flag.
    pub fn status(&self) -> u8 {
        let ready = self.buffered.is_some()
            || self.sigint.load(Ordering::SeqCst)
            || self.sigquit.load(Ordering::SeqCst);
        if ready {
            0xFF
        } else {
            0x00
        }
    }

    /// `IN 1`: CR is not filtered for the TTY, unlike printer/AUX/socket.
    pub fn read_data(&mut self) -> u8 {
        if let Some(b) = self.buffered.take() {
            return b;
        }
        if self.sigint.swap(false, Ordering::SeqCst) {
            return 0x03;
        }
        if self.sigquit.swap(false, Ordering::SeqCst) {
            return 0x1C;
        }
        let mut buf = [0u8; 1];
        match std::io::stdin().read_exact(&mut buf) {
            Ok(()) => buf[0],
            Err(_) => 0,
        }
    }

    /// `OUT 1, v`: one byte to stdout, flushed every write.
    pub fn write_data(&self, v: u8) {
        let mut out = std::io::stdout();
        let _ = out.write_all(&[v]);
        let _ = out.flush();
    }
}

/// Printer: permanently ready, appends to `printer.cpm`, `\r` filtered.
pub struct Printer {
    file: File,
}

impl Printer {
    pub fn new(path: &Path) -> std::io::Result<Printer> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o644)
            .open(path)?;
        Ok(Printer { file })
    }

    pub fn status(&self) -> u8 {
        1
    }
    pub fn read_data(&self) -> u8 {
        0
    }
    pub fn write_data(&mut self, v: u8) {
        if v != b'\r' {
            let _ = self.file.write_all(&[v]);
        }
    }
}

/// AUX: two named pipes, `auxin` (non-blocking read) and `auxout`
/// (write), with a sticky EOF flag exposed on the status port.
pub struct Aux {
    input: Option<File>,
    output: Option<File>,
    eof: bool,
}

impl Aux {
    pub fn new(auxin: &Path, auxout: &Path) -> Aux {
        let input = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(auxin)
            .ok();
        let output = OpenOptions::new().write(true).open(auxout).ok();
        let eof = input.is_none();
        Aux { input, output, eof }
    }

    /// `IN 4`
    pub fn status(&self) -> u8 {
        if self.eof {
            0xFF
        } else {
            0
        }
    }
    /// `OUT 4, v`: overwrites the EOF flag directly.
    pub fn set_status(&mut self, v: u8) {
        self.eof = v != 0;
    }

    /// `IN 5`
    pub fn read_data(&mut self) -> u8 {
        if self.eof {
            return 0x1A;
        }
        let Some(input) = self.input.as_mut() else {
            self.eof = true;
            return 0x1A;
        };
        let mut buf = [0u8; 1];
        match input.read(&mut buf) {
            Ok(1) => buf[0],
            Ok(_) => {
                self.eof = true;
                0x1A
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => 0,
            Err(_) => {
                self.eof = true;
                0x1A
            }
        }
    }

    /// `OUT 5, v`: `\r` dropped.
    pub fn write_data(&mut self, v: u8) {
        if v != b'\r' {
            if let Some(output) = self.output.as_mut() {
                let _ = output.write_all(&[v]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_status_reflects_sigquit_flag() {
        let sigint = Arc::new(AtomicBool::new(false));
        let sigquit = Arc::new(AtomicBool::new(true));
        let console = Console::new(sigint, sigquit);
        assert_eq!(console.status(), 0xFF);
    }

    #[test]
    fn console_status_is_zero_when_nothing_pending() {
        let sigint = Arc::new(AtomicBool::new(false));
        let sigquit = Arc::new(AtomicBool::new(false));
        let console = Console::new(sigint, sigquit);
        assert_eq!(console.status(), 0x00);
    }

    #[test]
    fn console_read_data_prefers_sigint_over_sigquit() {
        let sigint = Arc::new(AtomicBool::new(true));
        let sigquit = Arc::new(AtomicBool::new(true));
        let mut console = Console::new(sigint, sigquit);
        assert_eq!(console.read_data(), 0x03);
    }

    #[test]
    fn printer_filters_carriage_return() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("printer.cpm");
        let mut printer = Printer::new(&path).unwrap();
        printer.write_data(b'A');
        printer.write_data(b'\r');
        printer.write_data(b'B');
        drop(printer);
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, b"AB");
    }

    #[test]
    fn aux_with_no_backing_pipes_reports_eof() {
        let dir = tempfile::tempdir().unwrap();
        let mut aux = Aux::new(&dir.path().join("auxin"), &dir.path().join("auxout"));
        assert_eq!(aux.status(), 0xFF);
        assert_eq!(aux.read_data(), 0x1A);
    }
}
