// CLI-flag parsing (§6 "CLI surface"): `-s -l -i -mN -fN -x<path> -h`.
//
// Grounded on the teacher's main.rs `getopts::Options` usage (same
// optflag/optopt shape, usage printed to stdout on `-h`), trimmed of
// the ROM-variant selection that doesn't apply here.

use std::path::PathBuf;

pub struct RunOptions {
    /// `-s`: write `core.z80` on exit.
    pub save_core: bool,
    /// `-l`: restore CPU + RAM from `core.z80` instead of booting drive A.
    pub load_core: bool,
    /// `-i`: an access to an unbound port raises `IOTRAP` instead of
    /// being silently ignored.
    pub trap_unbound_io: bool,
    /// `-mN`: fill byte for freshly allocated RAM.
    pub ram_fill: u8,
    /// `-fN`: nominal CPU speed in MHz, used only for speed pacing.
    pub mhz: Option<u32>,
    /// `-x<path>`: load and run this file instead of drive A's boot
    /// sector.
    pub exec_file: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> RunOptions {
        RunOptions {
            save_core: false,
            load_core: false,
            trap_unbound_io: false,
            ram_fill: 0,
            mhz: None,
            exec_file: None,
        }
    }
}

/// Returned by `parse` when `-h`/`--help` was given: usage text only,
/// nothing to run.
pub enum ParseOutcome {
    Run(RunOptions),
    ShowHelp(String),
}

pub fn parse(progname: &str, args: &[String]) -> Result<ParseOutcome, String> {
    let mut opts = getopts::Options::new();
    opts.optflag("s", "", "Save CPU/RAM state to core.z80 on exit.");
    opts.optflag("l", "", "Load CPU/RAM state from core.z80 on start.");
    opts.optflag("i", "", "Trap accesses to unbound I/O ports.");
    opts.optopt("m", "", "Fill byte for freshly allocated RAM.", "N");
    opts.optopt("f", "", "Nominal CPU speed in MHz.", "N");
    opts.optopt("x", "", "Load and run <path> instead of booting drive A.", "PATH");
    opts.optflag("h", "help", "Show this help listing.");

    let matches = opts
        .parse(args)
        .map_err(|e| format!("{}: argument parsing error: {}", progname, e))?;

    if matches.opt_present("h") {
        let brief = format!("Usage: {} [options]", progname);
        return Ok(ParseOutcome::ShowHelp(opts.usage(&brief)));
    }

    let mut options = RunOptions::default();
    options.save_core = matches.opt_present("s");
    options.load_core = matches.opt_present("l");
    options.trap_unbound_io = matches.opt_present("i");

    if let Some(raw) = matches.opt_str("m") {
        options.ram_fill = parse_u8(&raw).map_err(|e| format!("-m: {}", e))?;
    }
    if let Some(raw) = matches.opt_str("f") {
        options.mhz = Some(raw.parse::<u32>().map_err(|_| format!("-f: not a number: {}", raw))?);
    }
    if let Some(raw) = matches.opt_str("x") {
        options.exec_file = Some(PathBuf::from(raw));
    }

    Ok(ParseOutcome::Run(options))
}

fn parse_u8(raw: &str) -> Result<u8, String> {
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16).map_err(|_| format!("not a byte: {}", raw))
    } else {
        raw.parse::<u8>().map_err(|_| format!("not a byte: {}", raw))
    }
}
