use clap::Parser;
use passvault::cli::commands::write::WriteArgs;
use passvault::cli::{self, Cli, Commands};
use passvault::errors::Result;
use passvault::vault::VaultEngine;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(&cli) {
        passvault::cli::output::error(&e.to_string());
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let (settings, config_dir) = cli::load_settings(cli)?;

    let filter = cli::log_filter(cli.verbose, &settings);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(std::io::stderr)
        .init();

    let engine = VaultEngine::from_settings(&settings, &config_dir)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let result = dispatch(cli, &engine).await;
        engine.shutdown().await;
        result
    })
}

async fn dispatch(cli: &Cli, engine: &VaultEngine) -> Result<()> {
    match &cli.command {
        Commands::Create {
            user,
            data,
            hex,
        } => cli::commands::create::execute(engine, user, data.as_deref(), *hex).await,
        Commands::Read { user, output } => {
            cli::commands::read::execute(engine, user, output.as_deref()).await
        }
        Commands::Write {
            user,
            data,
            hex,
            if_unmodified_since,
            if_modified_since,
            upgrade,
        } => {
            let args = WriteArgs {
                data,
                hex: *hex,
                if_unmodified_since: if_unmodified_since.as_deref(),
                if_modified_since: if_modified_since.as_deref(),
                upgrade: *upgrade,
            };
            cli::commands::write::execute(engine, user, args).await
        }
        Commands::Passwd { user, data, hex } => {
            cli::commands::passwd::execute(engine, user, data.as_deref(), *hex).await
        }
        Commands::Info { user } => cli::commands::info::execute(engine, user).await,
    }
}
