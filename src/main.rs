use std::env;
use std::path::{self, PathBuf};

use z80cpm_rs::config;
use z80cpm_rs::run;

fn get_progname(arg0: &path::Path) -> String {
    match arg0.file_name() {
        Some(name_osstr) => name_osstr.to_string_lossy().into_owned(),
        None => "z80cpm-rs".to_owned(),
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let progname = get_progname(args[0].as_ref());

    let options = match config::parse(&progname, &args[1..])
        .map_err(|message| anyhow::anyhow!(message))?
    {
        config::ParseOutcome::Run(options) => options,
        config::ParseOutcome::ShowHelp(usage) => {
            print!("{}", usage);
            return Ok(());
        }
    };

    let disks_dir = PathBuf::from("disks");
    let run_dir = PathBuf::from(".");

    run::run(options, &disks_dir, &run_dir)?;
    Ok(())
}
