//! Role dispatch: the VM side serves SSH, the host side forwards into it.

#[cfg(windows)]
mod forward;
#[cfg(unix)]
mod serve;

use sockbridge_core::config::Config;

pub async fn run(config: Config) -> anyhow::Result<()> {
  #[cfg(unix)]
  {
    serve::run(config).await
  }
  #[cfg(windows)]
  {
    forward::run(config).await
  }
}
