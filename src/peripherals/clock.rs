// Battery-backed clock (§4.3.2): BCD seconds/minutes/hours plus a
// 16-bit day counter relative to 1978-01-01, read off the host
// wall-clock.
//
// Grounded on iosim.c's `clkc_out`/`clkd_in` command-register pattern;
// the BCD/day-counter math is re-derived with `chrono` instead of
// libc's `struct tm`.

use chrono::{Datelike, Local, Timelike};

/// Day counter epoch: 1978-01-01 reads back as day 1.
const EPOCH_YEAR: i32 = 1978;

fn to_bcd(v: u32) -> u8 {
    (((v / 10) % 10) * 16 + (v % 10)) as u8
}

/// Days since `EPOCH_YEAR`-01-01, inclusive, using the reference
/// implementation's own leap-year rule (every year divisible by 4 gets
/// a 366th day, with no century exception) rather than `chrono`'s true
/// Gregorian calendar — the two diverge for dates >= 2100-03-01, and
/// matching the documented ground truth matters more than calendar
/// correctness here.
fn days_since_epoch(year: i32, ordinal: u32) -> u32 {
    let mut days: u32 = 0;
    let mut y = EPOCH_YEAR;
    while y < year {
        days += 365;
        if y % 4 == 0 {
            days += 1;
        }
        y += 1;
    }
    days + ordinal
}

pub struct Clock {
    command: u8,
}

impl Clock {
    pub fn new() -> Clock {
        Clock { command: 0 }
    }

    /// `OUT 25, cmd`
    pub fn set_command(&mut self, cmd: u8) {
        self.command = cmd;
    }

    /// `IN 26`: writes to the data port are ignored, this is the only
    /// data-port operation that does anything.
    pub fn read_data(&self) -> u8 {
        let now = Local::now().naive_local();
        match self.command {
            0 => to_bcd(now.second()),
            1 => to_bcd(now.minute()),
            2 => to_bcd(now.hour()),
            3 | 4 => {
                let days = days_since_epoch(now.year(), now.ordinal());
                if self.command == 3 {
                    (days & 0xff) as u8
                } else {
                    ((days >> 8) & 0xff) as u8
                }
            }
            _ => 0,
        }
    }
}

impl Default for Clock {
    fn default() -> Clock {
        Clock::new()
    }
}
