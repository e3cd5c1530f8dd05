use tracing_subscriber::EnvFilter;

/// Installs a stderr fmt subscriber. Stdout is left to operator-facing output.
pub fn init_tracing() {
  let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let _ = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_writer(std::io::stderr)
    .with_target(false)
    .try_init();
}
