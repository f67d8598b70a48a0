// FDC + DMA (§4.3.1): 16 drives, 128-byte sector transfers against
// backing files.
//
// Grounded on iosim.c's `struct dskdef disks[16]` table and its
// seek/read/write command handler (status codes 1-7 on `OUT 13`).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::memory::Bus;

pub const SECTOR_BYTES: usize = 128;
pub const DRIVE_COUNT: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub tracks: u16,
    pub sectors: u16,
}

/// IBM 8" single-sided single-density: drives A-D's default.
pub const GEOM_8IN_SSSD: Geometry = Geometry { tracks: 77, sectors: 26 };
/// The two hard-disk slots' (I, J) default geometry (255 * 128 * 128 bytes).
pub const GEOM_HARD_DISK: Geometry = Geometry { tracks: 255, sectors: 128 };
/// The one large-disk slot's (P) default geometry (256 * 16384 * 128 bytes).
pub const GEOM_LARGE_DISK: Geometry = Geometry { tracks: 256, sectors: 16384 };
/// Drives with no default geometry (E-H, K-O): any track/sector access
/// against them fails, matching the reference table leaving them unset.
const GEOM_ABSENT: Geometry = Geometry { tracks: 0, sectors: 0 };

/// Mirrors `disks[16]` (A through P) exactly: only A-D, I, J and P have
/// a usable default geometry.
const DEFAULT_GEOMS: [Geometry; DRIVE_COUNT] = [
    GEOM_8IN_SSSD, GEOM_8IN_SSSD, GEOM_8IN_SSSD, GEOM_8IN_SSSD, // A-D
    GEOM_ABSENT, GEOM_ABSENT, GEOM_ABSENT, GEOM_ABSENT, // E-H
    GEOM_HARD_DISK, GEOM_HARD_DISK, // I, J
    GEOM_ABSENT, GEOM_ABSENT, GEOM_ABSENT, GEOM_ABSENT, GEOM_ABSENT, // K-O
    GEOM_LARGE_DISK, // P
];

pub struct Drive {
    pub geometry: Geometry,
    file: Option<File>,
}

impl Drive {
    fn absent() -> Drive {
        Drive { geometry: GEOM_8IN_SSSD, file: None }
    }

    fn open(path: &Path, geometry: Geometry) -> std::io::Result<Drive> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Drive { geometry, file: Some(file) })
    }
}

pub struct Fdc {
    drives: Vec<Drive>,
    pub drive: u8,
    pub track: u8,
    sector: u16,
    pub status: u8,
    pub dma_lo: u8,
    pub dma_hi: u8,
}

impl Fdc {
    /// Opens `disks/drive<a..p>.cpm` for each of the 16 drives that
    /// exists on disk; drives with no backing file are left absent and
    /// every FDC command against them reports status 1. Drive A (index
    /// 0) not existing is a fatal init condition, checked by the
    /// caller via `has_drive_a`.
    pub fn new(disks_dir: &Path) -> std::io::Result<Fdc> {
        let mut drives = Vec::with_capacity(DRIVE_COUNT);
        for i in 0..DRIVE_COUNT {
            let letter = (b'a' + i as u8) as char;
            let path: PathBuf = disks_dir.join(format!("drive{}.cpm", letter));
            let geometry = DEFAULT_GEOMS[i];
            match Drive::open(&path, geometry) {
                Ok(drive) => drives.push(drive),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => drives.push(Drive::absent()),
                Err(e) => return Err(e),
            }
        }
        Ok(Fdc {
            drives,
            drive: 0,
            track: 0,
            sector: 0,
            status: 0,
            dma_lo: 0,
            dma_hi: 0,
        })
    }

    pub fn has_drive_a(&self) -> bool {
        self.drives[0].file.is_some()
    }

    pub fn select_drive(&mut self, d: u8) {
        self.drive = d;
    }
    pub fn set_track(&mut self, t: u8) {
        self.track = t;
    }
    pub fn set_sector_lo(&mut self, lo: u8) {
        self.sector = (self.sector & 0xff00) | (lo as u16);
    }
    pub fn set_sector_hi(&mut self, hi: u8) {
        self.sector = (self.sector & 0x00ff) | ((hi as u16) << 8);
    }
    pub fn sector_low_read(&self) -> u8 {
        (self.sector & 0xff) as u8
    }
    /// Reading port 17 (sector high) always returns 0. This preserves
    /// the reference implementation's truncate-before-shift bug rather
    /// than fixing it: software in the wild is reported to depend on
    /// it, so the full 16-bit `sector` field is kept internally but
    /// this accessor never exposes its high byte.
    pub fn sector_high_read(&self) -> u8 {
        0
    }
    pub fn set_dma_lo(&mut self, v: u8) {
        self.dma_lo = v;
    }
    pub fn set_dma_hi(&mut self, v: u8) {
        self.dma_hi = v;
    }
    fn dma_addr(&self) -> u16 {
        ((self.dma_hi as u16) << 8) | (self.dma_lo as u16)
    }

    /// `OUT 13, cmd`: runs the seek + transfer, updating `status`.
    pub fn command(&mut self, cmd: u8, mem: &mut dyn Bus) {
        let drive = match self.drives.get_mut(self.drive as usize) {
            Some(d) if d.file.is_some() => d,
            _ => {
                self.status = 1;
                return;
            }
        };
        // Off-by-one preserved deliberately: `>` not `>=` (see
        // DESIGN.md's Open Question disposition).
        if self.track as u16 > drive.geometry.tracks {
            self.status = 2;
            return;
        }
        if self.sector > drive.geometry.sectors {
            self.status = 3;
            return;
        }

        let offset = (self.track as u64 * drive.geometry.sectors as u64
            + self.sector as u64
            - 1)
            * SECTOR_BYTES as u64;
        let file = drive.file.as_mut().unwrap();
        if file.seek(SeekFrom::Start(offset)).is_err() {
            self.status = 4;
            return;
        }

        let dma = self.dma_addr();
        match cmd {
            0 => {
                let mut buf = [0u8; SECTOR_BYTES];
                match file.read_exact(&mut buf) {
                    Ok(()) => {
                        for (i, byte) in buf.iter().enumerate() {
                            mem.write8(dma.wrapping_add(i as u16), *byte);
                        }
                        self.status = 0;
                    }
                    Err(_) => self.status = 5,
                }
            }
            1 => {
                let mut buf = [0u8; SECTOR_BYTES];
                for (i, byte) in buf.iter_mut().enumerate() {
                    *byte = mem.read8(dma.wrapping_add(i as u16));
                }
                match file.write_all(&buf) {
                    Ok(()) => self.status = 0,
                    Err(_) => self.status = 6,
                }
            }
            _ => self.status = 7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Memory;
    use tempfile::tempdir;

    fn make_disk(dir: &Path, name: &str, geometry: Geometry) {
        let size = geometry.tracks as usize * geometry.sectors as usize * SECTOR_BYTES;
        std::fs::write(dir.join(name), vec![0xE5u8; size]).unwrap();
    }

    #[test]
    fn missing_drive_a_reports_illegal_drive() {
        let dir = tempdir().unwrap();
        let fdc = Fdc::new(dir.path()).unwrap();
        assert!(!fdc.has_drive_a());
        let mut fdc = fdc;
        let mut mem = Memory::new(0);
        fdc.command(0, &mut mem);
        assert_eq!(fdc.status, 1);
    }

    #[test]
    fn read_after_write_round_trips_a_sector() {
        let dir = tempdir().unwrap();
        make_disk(dir.path(), "drivea.cpm", GEOM_8IN_SSSD);
        let mut fdc = Fdc::new(dir.path()).unwrap();
        assert!(fdc.has_drive_a());

        let mut mem = Memory::new(0);
        for i in 0..SECTOR_BYTES {
            mem.write8(0x8000 + i as u16, (i % 251) as u8);
        }
        fdc.select_drive(0);
        fdc.set_track(0);
        fdc.set_sector_lo(1);
        fdc.set_dma_hi(0x80);
        fdc.set_dma_lo(0x00);
        fdc.command(1, &mut mem);
        assert_eq!(fdc.status, 0);

        let mut mem2 = Memory::new(0);
        fdc.command(0, &mut mem2);
        assert_eq!(fdc.status, 0);
        for i in 0..SECTOR_BYTES {
            assert_eq!(mem2.read8(0x8000 + i as u16), (i % 251) as u8);
        }
    }

    #[test]
    fn track_equal_to_geometry_is_accepted_off_by_one() {
        let dir = tempdir().unwrap();
        make_disk(dir.path(), "drivea.cpm", Geometry { tracks: 1, sectors: 1 });
        let mut fdc = Fdc::new(dir.path()).unwrap();
        let mut mem = Memory::new(0);
        fdc.set_track(1); // == tracks, not < tracks
        fdc.set_sector_lo(1);
        fdc.command(0, &mut mem);
        assert_eq!(fdc.status, 0);
    }

    #[test]
    fn sector_high_port_always_reads_zero() {
        let dir = tempdir().unwrap();
        let mut fdc = Fdc::new(dir.path()).unwrap();
        fdc.set_sector_hi(0xAB);
        assert_eq!(fdc.sector_high_read(), 0);
    }

    #[test]
    fn default_geometry_table_mirrors_the_sixteen_drive_letters() {
        // A-D: 77x26, E-H: absent, I/J: 255x128, K-O: absent, P: 256x16384.
        for i in 0..4 {
            assert_eq!(DEFAULT_GEOMS[i].tracks, 77);
            assert_eq!(DEFAULT_GEOMS[i].sectors, 26);
        }
        for i in 4..8 {
            assert_eq!(DEFAULT_GEOMS[i], GEOM_ABSENT);
        }
        assert_eq!(DEFAULT_GEOMS[8], GEOM_HARD_DISK);
        assert_eq!(DEFAULT_GEOMS[9], GEOM_HARD_DISK);
        for i in 10..15 {
            assert_eq!(DEFAULT_GEOMS[i], GEOM_ABSENT);
        }
        assert_eq!(DEFAULT_GEOMS[15], GEOM_LARGE_DISK);
    }
}
