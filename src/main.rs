use clap::Parser;
use sentinel_mail::cli::{self, Cli};
use std::process;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        eprintln!("\nFor help, run: sentinel-mail --help");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    // Install default crypto provider for rustls.
    // Needed because multiple dependencies pull in different crypto backends.
    // On non-Windows platforms, use aws-lc-rs (better performance, FIPS support).
    // On Windows, use ring (better compatibility, no NASM/CMake required).
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sentinel_mail=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sentinel_mail=info,warn,error"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    cli::execute(&cli).await?;

    Ok(())
}
