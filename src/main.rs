mod args;
mod commands;

use args::{Cli, Commands};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("svcmgr=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = commands::Context::load(cli.services_dir, cli.json)?;

    match cli.command {
        Commands::List => commands::services::cmd_list(&ctx).await?,
        Commands::Health { name } => commands::services::cmd_health(&ctx, &name).await?,
        Commands::Start { name } => commands::services::cmd_start(&ctx, &name).await?,
        Commands::Stop { name } => commands::services::cmd_stop(&ctx, &name).await?,
        Commands::Restart { name } => commands::services::cmd_restart(&ctx, &name).await?,
        Commands::Toggle { name } => commands::services::cmd_toggle(&ctx, &name).await?,
        Commands::Call {
            name,
            method,
            params,
            timeout,
        } => commands::services::cmd_call(&ctx, &name, &method, &params, timeout).await?,
        Commands::Methods { name } => commands::services::cmd_methods(&ctx, &name).await?,
        Commands::Watch => commands::services::cmd_watch(&ctx).await?,
        Commands::Packages => commands::packages::cmd_packages(&ctx)?,
        Commands::Install { name } => commands::packages::cmd_install(&ctx, &name).await?,
        Commands::Uninstall { name } => commands::packages::cmd_uninstall(&ctx, &name).await?,
    }

    Ok(())
}
