// Four listener sockets + one client socket, with telnet option
// negotiation and CR/IAC filtering (§4.3.5).
//
// Grounded on iosim.c's `NETWORKING` section (`ss`/`ssc`/`cs` statics,
// the `SIGIO` poll handler, telnet negotiation bytes). The `SIGIO`
// wakeup itself is realized here as a zero-timeout `poll()` performed
// at each status-port access rather than a literal signal handler: the
// CPU loop already samples peripheral state only at instruction/port
// boundaries (Design Notes' "signal-driven mutation -> atomically
// updated flags observed at instruction boundaries"), so polling at
// the same boundary the status port is read achieves the same
// observable behavior without a second, racier notification path.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::path::Path;

const TELNET_NEGOTIATION: [u8; 6] = [0xFF, 0xFB, 0x03, 0xFF, 0xFB, 0x01];
const IAC: u8 = 0xFF;
const CR: u8 = 0x0D;

/// Zero-timeout `poll()` on one fd for readable/writable/hangup,
/// returning raw `POLL*` bits. Used instead of `nix`'s `poll` wrapper
/// (whose timeout type has churned across `nix` releases) for a single
/// stable call shape.
fn poll_one(raw_fd: std::os::fd::RawFd, events: libc::c_short) -> libc::c_short {
    let mut pfd = libc::pollfd { fd: raw_fd, events, revents: 0 };
    // SAFETY: `pfd` is a single valid pollfd on the stack, `nfds` matches.
    let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
    if rc <= 0 {
        0
    } else {
        pfd.revents
    }
}

pub struct ServerConfig {
    pub index: u8,
    pub telnet: bool,
    pub port: u16,
}

pub fn parse_server_conf(path: &Path) -> std::io::Result<Vec<ServerConfig>> {
    let file = File::open(path)?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(idx), Some(telnet), Some(port)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if let (Ok(idx), Ok(telnet), Ok(port)) =
            (idx.parse::<u8>(), telnet.parse::<u8>(), port.parse::<u16>())
        {
            out.push(ServerConfig { index: idx, telnet: telnet != 0, port });
        }
    }
    Ok(out)
}

pub struct ClientConfig {
    pub host: String,
    pub port: u16,
}

pub fn parse_client_conf(path: &Path) -> std::io::Result<Option<ClientConfig>> {
    let file = File::open(path)?;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let _ignored = parts.next();
        if let (Some(host), Some(port)) = (parts.next(), parts.next()) {
            if let Ok(port) = port.parse::<u16>() {
                return Ok(Some(ClientConfig { host: host.to_string(), port }));
            }
        }
    }
    Ok(None)
}

/// A listener socket failed to bind; `init_server_socket` in the
/// reference implementation treats this as fatal (`perror`, `exit(1)`).
pub struct BindFailure {
    pub index: u8,
    pub port: u16,
    pub source: std::io::Error,
}

struct ServerSlot {
    telnet: bool,
    listener: Option<TcpListener>,
    client: Option<TcpStream>,
}

impl ServerSlot {
    fn disabled() -> ServerSlot {
        ServerSlot { telnet: false, listener: None, client: None }
    }

    fn bind(cfg: &ServerConfig) -> std::io::Result<ServerSlot> {
        let listener = TcpListener::bind(("0.0.0.0", cfg.port))?;
        listener.set_nonblocking(true)?;
        Ok(ServerSlot { telnet: cfg.telnet, listener: Some(listener), client: None })
    }

    /// Accepts a pending connection if one is waiting and no client is
    /// currently attached (one-client-at-a-time policy: later arrivals
    /// are simply dropped by letting the accepted socket go out of
    /// scope). Sends the telnet negotiation sequence on acceptance.
    fn poll_accept(&mut self) {
        let Some(listener) = &self.listener else { return };
        if self.client.is_some() {
            // Still drain the backlog so subsequent connections don't
            // queue up against a slot that's already occupied.
            if let Ok((stream, _)) = listener.accept() {
                drop(stream);
            }
            return;
        }
        if let Ok((mut stream, _)) = listener.accept() {
            let _ = stream.set_nonblocking(false);
            if self.telnet {
                let _ = stream.write_all(&TELNET_NEGOTIATION);
            }
            self.client = Some(stream);
        }
    }

    /// Status bits: bit 0 readable, bit 1 writable; POLLHUP drops the
    /// client.
    fn status(&mut self) -> u8 {
        self.poll_accept();
        let Some(stream) = &self.client else { return 0 };
        let revents = poll_one(stream.as_raw_fd(), libc::POLLIN | libc::POLLOUT);
        if revents & (libc::POLLHUP | libc::POLLERR) != 0 {
            self.client = None;
            return 0;
        }
        let mut bits = 0u8;
        if revents & libc::POLLIN != 0 {
            bits |= 0b01;
        }
        if revents & libc::POLLOUT != 0 {
            bits |= 0b10;
        }
        bits
    }

    /// Blocking one-byte read. CR and IAC are only filtered when this
    /// slot is in telnet mode; a raw (non-telnet) socket passes every
    /// byte through unmodified. `EAGAIN`/`EINTR` close the client
    /// without raising a fatal error.
    fn read_data(&mut self) -> u8 {
        loop {
            let telnet = self.telnet;
            let Some(stream) = &mut self.client else { return 0 };
            let mut buf = [0u8; 1];
            match stream.read_exact(&mut buf) {
                Ok(()) => {
                    if telnet && buf[0] == CR {
                        let mut discard = [0u8; 1];
                        let _ = stream.read_exact(&mut discard);
                        continue;
                    }
                    if telnet && buf[0] == IAC {
                        let mut discard = [0u8; 2];
                        let _ = stream.read_exact(&mut discard);
                        continue;
                    }
                    return buf[0];
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::Interrupted =>
                {
                    self.client = None;
                    return 0;
                }
                Err(_) => {
                    self.client = None;
                    return 0;
                }
            }
        }
    }

    fn write_data(&mut self, v: u8) {
        if let Some(stream) = &mut self.client {
            if stream.write_all(&[v]).is_err() {
                self.client = None;
            }
        }
    }
}

pub struct Sockets {
    slots: [ServerSlot; 4],
    client_host: Option<ClientConfig>,
    client: Option<TcpStream>,
}

impl Sockets {
    pub fn new(
        server_confs: &[ServerConfig],
        client_conf: Option<ClientConfig>,
    ) -> Result<Sockets, BindFailure> {
        let mut slots = [
            ServerSlot::disabled(),
            ServerSlot::disabled(),
            ServerSlot::disabled(),
            ServerSlot::disabled(),
        ];
        for cfg in server_confs {
            if cfg.index >= 1 && cfg.index <= 4 {
                let slot = ServerSlot::bind(cfg).map_err(|source| BindFailure {
                    index: cfg.index,
                    port: cfg.port,
                    source,
                })?;
                slots[(cfg.index - 1) as usize] = slot;
            }
        }
        Ok(Sockets { slots, client_host: client_conf, client: None })
    }

    pub fn server_status(&mut self, idx: usize) -> u8 {
        self.slots[idx].status()
    }
    pub fn server_read(&mut self, idx: usize) -> u8 {
        self.slots[idx].read_data()
    }
    pub fn server_write(&mut self, idx: usize, v: u8) {
        self.slots[idx].write_data(v)
    }

    fn ensure_client_connected(&mut self) {
        if self.client.is_some() {
            return;
        }
        if let Some(cfg) = &self.client_host {
            if let Ok(stream) = TcpStream::connect((cfg.host.as_str(), cfg.port)) {
                self.client = Some(stream);
            }
        }
    }

    pub fn client_status(&mut self) -> u8 {
        self.ensure_client_connected();
        let Some(stream) = &self.client else { return 0 };
        let revents = poll_one(stream.as_raw_fd(), libc::POLLIN | libc::POLLOUT);
        if revents & (libc::POLLHUP | libc::POLLERR) != 0 {
            self.client = None;
            return 0;
        }
        let mut bits = 0u8;
        if revents & libc::POLLIN != 0 {
            bits |= 0b01;
        }
        if revents & libc::POLLOUT != 0 {
            bits |= 0b10;
        }
        bits
    }

    pub fn client_read(&mut self) -> u8 {
        self.ensure_client_connected();
        let Some(stream) = &mut self.client else { return 0 };
        let mut buf = [0u8; 1];
        match stream.read_exact(&mut buf) {
            Ok(()) => buf[0],
            Err(_) => {
                self.client = None;
                0
            }
        }
    }
    pub fn client_write(&mut self, v: u8) {
        self.ensure_client_connected();
        if let Some(stream) = &mut self.client {
            if stream.write_all(&[v]).is_err() {
                self.client = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_failure_on_an_already_bound_port_is_surfaced() {
        let hog = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = hog.local_addr().unwrap().port();

        let confs = vec![ServerConfig { index: 1, telnet: false, port }];
        let err = Sockets::new(&confs, None).err().unwrap();
        assert_eq!(err.index, 1);
        assert_eq!(err.port, port);
    }

    #[test]
    fn parses_server_conf_skipping_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net_server.conf");
        std::fs::write(&path, "# comment\n1 1 4001\n2 0 4002\n").unwrap();
        let cfgs = parse_server_conf(&path).unwrap();
        assert_eq!(cfgs.len(), 2);
        assert_eq!(cfgs[0].index, 1);
        assert!(cfgs[0].telnet);
        assert_eq!(cfgs[1].port, 4002);
        assert!(!cfgs[1].telnet);
    }

    #[test]
    fn parses_client_conf_ignoring_first_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net_client.conf");
        std::fs::write(&path, "anything localhost 5001\n").unwrap();
        let cfg = parse_client_conf(&path).unwrap().unwrap();
        assert_eq!(cfg.host, "localhost");
        assert_eq!(cfg.port, 5001);
    }

    #[test]
    fn telnet_handshake_and_cr_lf_collapse_over_loopback() {
        let cfg = ServerConfig { index: 1, telnet: true, port: 0 };
        // Bind to an ephemeral port for the test instead of a fixed one.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        listener.set_nonblocking(true).unwrap();
        let mut slot = ServerSlot { telnet: cfg.telnet, listener: Some(listener), client: None };

        let client = TcpStream::connect(addr).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        slot.poll_accept();
        assert!(slot.client.is_some());

        let mut client = client;
        let mut negotiation = [0u8; 6];
        client.read_exact(&mut negotiation).unwrap();
        assert_eq!(negotiation, TELNET_NEGOTIATION);

        client.write_all(b"A\r\nB").unwrap();
        client.flush().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(slot.read_data(), b'A');
        assert_eq!(slot.read_data(), b'B');
    }

    #[test]
    fn non_telnet_slot_passes_cr_and_iac_through_unfiltered() {
        let cfg = ServerConfig { index: 1, telnet: false, port: 0 };
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        listener.set_nonblocking(true).unwrap();
        let mut slot = ServerSlot { telnet: cfg.telnet, listener: Some(listener), client: None };

        let mut client = TcpStream::connect(addr).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        slot.poll_accept();
        assert!(slot.client.is_some());

        client.write_all(&[b'A', CR, IAC, b'B']).unwrap();
        client.flush().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(slot.read_data(), b'A');
        assert_eq!(slot.read_data(), CR);
        assert_eq!(slot.read_data(), IAC);
        assert_eq!(slot.read_data(), b'B');
    }
}
