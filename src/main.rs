use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use crossbeam_channel::tick;
use nix::unistd::Uid;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use flamespy::bpf::system::SystemLoader;
use flamespy::kallsyms::KallsymsCache;
use flamespy::session::{ProfileSample, Session, SessionOptions};
use flamespy::targets::{StaticTargetFinder, Target};

#[derive(clap::ValueEnum, Debug, Clone)]
enum LoggingLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Samples every on-CPU stack on the host and prints folded stacks, one
/// line per aggregated sample, ready for flame graph tooling.
#[derive(Parser, Debug)]
struct Cli {
    /// Compiled profiler BPF object file.
    #[arg(long, default_value = "flamespy.bpf.o")]
    bpf_object: PathBuf,

    /// Per-CPU sampling frequency in Hz.
    #[arg(long, default_value_t = 97)]
    sample_rate: u32,

    /// Seconds between harvests.
    #[arg(long, default_value_t = 5)]
    interval: u64,

    /// Stop after this many harvests; 0 keeps going.
    #[arg(long, default_value_t = 0)]
    rounds: u64,

    /// Skip user stacks and only walk kernel stacks.
    #[arg(long)]
    kernel_only: bool,

    /// Render unknown symbols as module+offset.
    #[arg(long)]
    unknown_symbol_module_offset: bool,

    /// Render unresolved addresses as raw instruction pointers.
    #[arg(long)]
    unknown_symbol_address: bool,

    /// Service name attached to every sample.
    #[arg(long, default_value = "host")]
    service_name: String,

    #[arg(long, value_enum, default_value = "info")]
    logging: LoggingLevel,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(match cli.logging {
            LoggingLevel::Trace => Level::TRACE,
            LoggingLevel::Debug => Level::DEBUG,
            LoggingLevel::Info => Level::INFO,
            LoggingLevel::Warn => Level::WARN,
            LoggingLevel::Error => Level::ERROR,
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if !Uid::current().is_root() {
        error!("root permissions are required to attach the profiler");
        std::process::exit(1);
    }

    let options = SessionOptions {
        collect_user: !cli.kernel_only,
        collect_kernel: true,
        unknown_symbol_module_offset: cli.unknown_symbol_module_offset,
        unknown_symbol_address: cli.unknown_symbol_address,
        sample_rate: cli.sample_rate,
        ..SessionOptions::default()
    };

    let session = Session::new(
        Arc::new(StaticTargetFinder::new(Target::service(&cli.service_name))),
        Box::new(KallsymsCache::default()),
        Box::new(SystemLoader::new(cli.bpf_object)),
        None,
        options,
    );
    session.start()?;
    info!("profiler started, harvesting every {}s", cli.interval);

    let harvest = tick(Duration::from_secs(cli.interval.max(1)));
    let mut round = 0u64;
    loop {
        if harvest.recv().is_err() {
            break;
        }
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let result = session.collect_profiles(&mut |sample: ProfileSample<'_>| {
            // Folded stacks want root first; samples arrive leaf first with
            // the comm last.
            let mut line = String::new();
            for frame in sample.stack.iter().rev() {
                if !line.is_empty() {
                    line.push(';');
                }
                line.push_str(frame);
            }
            let _ = writeln!(out, "{line} {}", sample.value);
        });
        if let Err(err) = result {
            error!("collecting profiles: {err}");
        }
        round += 1;
        if cli.rounds != 0 && round >= cli.rounds {
            break;
        }
    }

    session.stop();
    Ok(())
}
