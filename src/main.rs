use anyhow::{Context, Result};
use clap::Parser;
use drs4_daq::*;
use log::{error, info, LevelFilter};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode,
    WriteLogger,
};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    process::ExitCode,
};
use time::OffsetDateTime;

#[derive(Parser, Debug)]
#[command(author, version, about = "Acquire triggered events from a chain of DRS4 boards", long_about = None)]
struct Args {
    /// TOML configuration file; missing keys fall back to defaults
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
    /// Run against simulated boards instead of hardware
    #[arg(short, long)]
    simulate: bool,
    /// Number of simulated boards
    #[arg(short, long)]
    boards: Option<usize>,
    /// More output, repeat for trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
    /// Also write the log to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Args {
    fn level(&self) -> LevelFilter {
        if self.quiet {
            return LevelFilter::Warn;
        }
        match self.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

fn init_logging(args: &Args) -> Result<()> {
    let config = ConfigBuilder::new()
        .set_time_offset_to_local()
        .unwrap_or_else(|builder| builder)
        .build();
    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        args.level(),
        config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if let Some(path) = &args.log_file {
        let file = File::create(path)
            .with_context(|| format!("creating log file {}", path.display()))?;
        loggers.push(WriteLogger::new(LevelFilter::Debug, config, file));
    }
    CombinedLogger::init(loggers).context("installing logger")?;
    Ok(())
}

fn acquire<D: BoardDiscovery>(
    mut discovery: D,
    conf: &Conf,
    cancel: CancelToken,
) -> Result<RunSummary> {
    let boards = discovery.discover()?;
    let trigger = TriggerSpec::from(&conf.trigger_settings);
    let chain = configure_chain(boards, &conf.board_settings, &trigger)?;

    let dir = Path::new(&conf.run_settings.output_dir);
    fs::create_dir_all(dir)
        .map_err(DaqError::from)
        .with_context(|| format!("creating output directory {}", dir.display()))?;
    let start = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let path = dir.join(output_filename(conf, start));
    let file = File::create(&path)
        .map_err(DaqError::from)
        .with_context(|| format!("creating {}", path.display()))?;
    info!("Writing events to {}", path.display());

    let mut session = AcquisitionSession::new(
        chain,
        file,
        SessionSettings::from(conf),
        SystemClock::new(),
        cancel,
    )?;
    let summary = session.run()?;
    info!(
        "Wrote {} events ({} bytes, {} fake triggers) to {}",
        summary.events,
        summary.bytes,
        summary.spurious,
        path.display()
    );
    Ok(summary)
}

fn run(args: &Args) -> Result<()> {
    let mut conf = Conf::load(&args.config)
        .with_context(|| format!("loading configuration {}", args.config.display()))?;
    if args.simulate {
        conf.run_settings.simulate = true;
    }
    if let Some(n) = args.boards {
        conf.run_settings.sim_boards = n;
        conf.validate()?;
    }

    let cancel = CancelToken::new();
    cancel_on_sigint(&cancel)?;

    if conf.run_settings.simulate {
        info!("Simulating {} board(s)", conf.run_settings.sim_boards);
        acquire(SimDiscovery::new(conf.run_settings.sim_boards), &conf, cancel)?;
        Ok(())
    } else {
        // hardware access needs the vendor library, which this build has no binding for
        Err(DaqError::NoBoards.into())
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = init_logging(&args) {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            let code = e.downcast_ref::<DaqError>().map_or(1, DaqError::exit_code);
            ExitCode::from(code)
        }
    }
}
