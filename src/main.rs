use clap::Parser;
use provisioner::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Merge config file, environment and CLI overrides
    let config = cli.load_config()?;

    // Initialize logging
    cli.init_logging(&config)?;

    // Execute command
    cli.execute(config).await?;

    Ok(())
}
