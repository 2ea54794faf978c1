//! Runtime configuration.
//!
//! Settings resolve in this order (highest priority first): programmatic
//! builder methods, `VIGIL_*` environment variables, built-in defaults.
//! Unparseable environment values are logged and ignored.

use tracing::warn;

/// Environment variable overriding the quantum size.
pub const ENV_QUANTA: &str = "VIGIL_QUANTA";
/// Environment variable overriding the worker-domain count.
pub const ENV_DOMAINS: &str = "VIGIL_DOMAINS";

/// Default scheduling slices granted per activation.
pub const DEFAULT_QUANTA: u32 = 1;

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Scheduling slices a task may consume before a forced yield.
    pub quanta: u32,
    /// Number of worker domains, excluding domain 0.
    pub domains: usize,
    /// Seed for deterministic dispatch choices.
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            quanta: DEFAULT_QUANTA,
            domains: default_domains(),
            seed: 0,
        }
    }
}

impl Config {
    /// Builds the configuration from defaults plus environment overrides.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(quanta) = read_env::<u32>(ENV_QUANTA) {
            config.quanta = quanta.max(1);
        }
        if let Some(domains) = read_env::<usize>(ENV_DOMAINS) {
            config.domains = domains;
        }
        config
    }
}

/// Default worker count: available parallelism minus the main domain.
fn default_domains() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
}

fn read_env<T: std::str::FromStr>(var: &str) -> Option<T> {
    let raw = std::env::var(var).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}
