use std::io;
use std::process;
use std::sync::Arc;

use anyhow::Result;
use clap::CommandFactory;
use tracing::error;

use envstrap::cli::{self, Cli};
use envstrap::executor::RealCommandExecutor;

fn main() -> Result<()> {
    let args = cli::parse_args()?;

    envstrap::init_logging(args.command.log_level())?;

    let result = match &args.command {
        cli::Commands::Apply(opts) => {
            let executor = Arc::new(RealCommandExecutor {
                dry_run: opts.dry_run,
            });
            envstrap::run_apply(opts, executor).map(|_| ())
        }
        cli::Commands::Validate(opts) => envstrap::run_validate(opts),
        cli::Commands::Completions(opts) => {
            let mut cmd = Cli::command();
            clap_complete::generate(opts.shell, &mut cmd, env!("CARGO_PKG_NAME"), &mut io::stdout());
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        process::exit(1);
    }

    Ok(())
}
