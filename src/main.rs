//! Entry point of the init process. Nothing in here may end the process
//! early: the kernel panics when PID 1 exits.

use std::env;

use clap::Parser;

use initsd::config::{normalize_args, BootPaths, Opts};
use initsd::logger;
use initsd::sequencer::BootSequencer;
use initsd::syscall::create_syscall;

const BANNER: &str = "Welcome to initsd!";

fn main() {
    let argv: Vec<String> = env::args_os()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();

    let opts = match Opts::try_parse_from(normalize_args(env::args_os())) {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("initsd: ignoring arguments: {}", e);
            Opts::default()
        }
    };

    if let Err(e) = logger::init(opts.verbose, opts.log.clone()) {
        eprintln!("log init failed: {:?}", e);
    }

    log::info!("{}", argv.join(" ! "));
    println!("{}", BANNER);

    // The kernel command line is read by the sequencer once /proc is mounted.
    let report = BootSequencer::new(opts, BootPaths::default(), create_syscall()).run();
    log::debug!("{:?}", report);
}
