use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use metarestore::settings::{AppConfig, RecoveryModeSetting};
use metarestore::workload;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Management,
    Data,
    Both,
}

impl From<ModeArg> for RecoveryModeSetting {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Management => RecoveryModeSetting::Management,
            ModeArg::Data => RecoveryModeSetting::Data,
            ModeArg::Both => RecoveryModeSetting::Both,
        }
    }
}

#[derive(Parser, Debug)]
#[clap(version, about)]
/// Run the metacluster restore workload against a simulated metacluster
struct Args {
    /// whether to be verbose
    #[arg(short = 'v')]
    verbose: bool,

    /// path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// seed for every random choice in the run
    #[arg(long, env = "METARESTORE_SEED", default_value = "42")]
    seed: u64,

    /// pin the recovery mode instead of drawing it from the seed
    #[arg(long = "recovery-mode", value_enum)]
    recovery_mode: Option<ModeArg>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.verbose {
        println!("DEBUG {args:?}");
    }

    let mut cfg = AppConfig::load(args.config.as_deref())?;
    if let Some(mode) = args.recovery_mode {
        cfg.workload.recovery_mode = Some(mode.into());
    }
    metarestore::trace::init(cfg.logging.format)?;

    let report = workload::run_simulation(&cfg, args.seed).await?;
    if args.verbose {
        println!("DEBUG {report:?}");
    }
    Ok(())
}
