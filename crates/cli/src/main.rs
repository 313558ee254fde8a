use clap::Parser;
use tracing::error;

mod args;
mod run;

#[tokio::main]
async fn main() {
  let cli = args::Cli::parse();

  sockbridge_core::logging::init();

  let config = match sockbridge_core::config::load(cli.config_path.as_deref(), cli.overrides()) {
    Ok(config) => config,
    Err(err) => {
      error!(error = %err, "invalid configuration");
      std::process::exit(1);
    }
  };

  if cli.generate_key_pair {
    if let Err(err) =
      sockbridge_core::keys::generate_key_pair(&config.identity_path, Some(&config.authorized_keys_path))
    {
      error!(error = %err, "key pair generation failed");
      std::process::exit(1);
    }
  }

  if let Err(err) = run::run(config).await {
    error!(error = format!("{err:#}"), "relay failed");
    std::process::exit(1);
  }
}
