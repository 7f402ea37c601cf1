//! Replays allocation traces against the system heap and reports how the
//! pools evolve.

use std::{
    fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
    process,
};

use argh::FromArgs;
use log::LevelFilter;
use snafu::{ResultExt as _, ensure_whatever};
use sys_heap::HeapConfig;

use self::{
    report::{GenericError, Report},
    runner::{Options, Session},
};

mod logger;
mod report;
mod runner;
mod script;

/// Replay allocation trace scripts against a fixed-pool heap.
#[derive(Debug, FromArgs)]
struct Args {
    /// trace scripts to replay, each against a fresh heap
    #[argh(positional)]
    traces: Vec<PathBuf>,
    /// size of the main pool in bytes
    #[argh(option, default = "64 * 1024")]
    main_size: usize,
    /// size of the temp pool in bytes, 0 for none
    #[argh(option, default = "16 * 1024")]
    temp_size: usize,
    /// dump both pools after every command
    #[argh(switch)]
    dump: bool,
    /// check heap integrity after every command
    #[argh(switch)]
    verify: bool,
    /// log level: off, error, warn, info, debug or trace
    #[argh(option, default = "LevelFilter::Warn")]
    log_level: LevelFilter,
}

fn main() {
    let args: Args = argh::from_env();
    logger::init(args.log_level);

    if let Err(err) = run(&args) {
        eprintln!("{}", Report::new(&err));
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), GenericError> {
    ensure_whatever!(!args.traces.is_empty(), "no trace scripts given");
    for path in &args.traces {
        replay(args, path)
            .with_whatever_context(|_| format!("failed to replay trace, path={}", path.display()))?;
    }
    Ok(())
}

fn replay(args: &Args, path: &Path) -> Result<(), GenericError> {
    let script = fs::read_to_string(path).whatever_context("failed to read trace script")?;
    let lines = script::parse(&script).whatever_context("failed to parse trace script")?;

    let config = HeapConfig {
        main_size: args.main_size,
        temp_size: args.temp_size,
    };
    let options = Options {
        dump: args.dump,
        verify: args.verify,
    };
    let mut session = Session::new(config, options)?;

    let mut stdout = io::stdout().lock();
    writeln!(stdout, "Trace: {}", path.display()).whatever_context("failed to write output")?;
    session.run(&lines, &mut stdout)?;
    session.finish(&mut stdout)?;
    Ok(())
}
