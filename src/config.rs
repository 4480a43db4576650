use anyhow::Context;
use std::net::Ipv4Addr;
use std::time::Duration;

pub const DEFAULT_BOOTSTRAP: &[&str] = &["router.bittorrent.com:6881", "dht.transmissionbt.com:6881"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Log,
    Json,
}

#[derive(Clone, Debug)]
pub struct Config {
    // DHT
    pub address: Ipv4Addr,
    pub port: u16,
    pub bootstrap_nodes: Vec<String>,
    pub walk_interval: Duration,
    pub ack_backlog_factor: usize,
    pub public_nodes_only: bool,

    // Fetch
    pub timeout: Duration,
    pub max_connecting_sockets: usize,
    pub dedup_ttl: Duration,
    pub dedup_capacity: usize,

    // Output
    pub output: OutputFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::UNSPECIFIED,
            port: 6219,
            bootstrap_nodes: DEFAULT_BOOTSTRAP.iter().map(|s| s.to_string()).collect(),
            walk_interval: Duration::from_millis(1000),
            ack_backlog_factor: 2,
            public_nodes_only: true,
            timeout: Duration::from_millis(5000),
            max_connecting_sockets: 20,
            dedup_ttl: Duration::from_secs(10 * 60),
            dedup_capacity: 100_000,
            output: OutputFormat::Log,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // If a .env file exists, load it. If not, keep going.
        // Precedence: process env > .env > code defaults.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let env = Env(lookup);
        let defaults = Self::default();

        let address = match env.opt_string("DHTSCOUT_ADDRESS") {
            Some(s) => s
                .parse::<Ipv4Addr>()
                .with_context(|| format!("parse DHTSCOUT_ADDRESS: {s}"))?,
            None => defaults.address,
        };

        let output = match env.opt_string("DHTSCOUT_OUTPUT").as_deref() {
            None => defaults.output,
            Some(v) if v.eq_ignore_ascii_case("log") => OutputFormat::Log,
            Some(v) if v.eq_ignore_ascii_case("json") => OutputFormat::Json,
            Some(other) => anyhow::bail!("DHTSCOUT_OUTPUT must be `log` or `json`, got `{other}`"),
        };

        Ok(Self {
            address,
            port: env.u16("DHTSCOUT_PORT", defaults.port),
            bootstrap_nodes: env.csv_strings("DHTSCOUT_BOOTSTRAP", DEFAULT_BOOTSTRAP),
            walk_interval: Duration::from_millis(env.u64("DHTSCOUT_WALK_INTERVAL_MS", 1000).max(1)),
            ack_backlog_factor: env.usize("DHTSCOUT_ACK_BACKLOG_FACTOR", defaults.ack_backlog_factor),
            public_nodes_only: env.enabled("DHTSCOUT_PUBLIC_NODES_ONLY", defaults.public_nodes_only),
            timeout: Duration::from_millis(env.u64("DHTSCOUT_TIMEOUT_MS", 5000)),
            max_connecting_sockets: env
                .usize("DHTSCOUT_MAX_CONNECTING_SOCKETS", defaults.max_connecting_sockets)
                .max(1),
            dedup_ttl: Duration::from_secs(env.u64("DHTSCOUT_DEDUP_TTL_SECS", 10 * 60)),
            dedup_capacity: env.usize("DHTSCOUT_DEDUP_CAPACITY", defaults.dedup_capacity).max(1),
            output,
        })
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn opt_string(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn parsed<T: std::str::FromStr>(&self, name: &str, default: T) -> T {
        self.opt_string(name)
            .and_then(|v| v.parse::<T>().ok())
            .unwrap_or(default)
    }

    fn u64(&self, name: &str, default: u64) -> u64 {
        self.parsed(name, default)
    }

    fn u16(&self, name: &str, default: u16) -> u16 {
        self.parsed(name, default)
    }

    fn usize(&self, name: &str, default: usize) -> usize {
        self.parsed(name, default)
    }

    fn csv_strings(&self, name: &str, defaults: &[&str]) -> Vec<String> {
        if let Some(s) = self.opt_string(name) {
            let v: Vec<String> = s
                .split(',')
                .map(|x| x.trim().to_string())
                .filter(|x| !x.is_empty())
                .collect();
            if !v.is_empty() {
                return v;
            }
        }
        defaults.iter().map(|s| s.to_string()).collect()
    }

    fn enabled(&self, name: &str, default: bool) -> bool {
        match self.opt_string(name) {
            None => default,
            Some(v) => {
                let v = v.to_ascii_lowercase();
                if matches!(v.as_str(), "0" | "false" | "off" | "no") {
                    return false;
                }
                if matches!(v.as_str(), "1" | "true" | "on" | "yes") {
                    return true;
                }
                default
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let cfg = config_from(&[]).unwrap();
        assert_eq!(cfg.address, Ipv4Addr::UNSPECIFIED);
        assert_eq!(cfg.port, 6219);
        assert_eq!(cfg.timeout, Duration::from_millis(5000));
        assert_eq!(cfg.max_connecting_sockets, 20);
        assert_eq!(cfg.bootstrap_nodes.len(), 2);
        assert_eq!(cfg.dedup_capacity, 100_000);
        assert_eq!(cfg.dedup_ttl, Duration::from_secs(600));
        assert_eq!(cfg.output, OutputFormat::Log);
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = config_from(&[
            ("DHTSCOUT_ADDRESS", "127.0.0.1"),
            ("DHTSCOUT_PORT", "7000"),
            ("DHTSCOUT_BOOTSTRAP", " a.example:1 , ,b.example:2"),
            ("DHTSCOUT_TIMEOUT_MS", "250"),
            ("DHTSCOUT_MAX_CONNECTING_SOCKETS", "0"),
            ("DHTSCOUT_PUBLIC_NODES_ONLY", "off"),
            ("DHTSCOUT_OUTPUT", "JSON"),
        ])
        .unwrap();
        assert_eq!(cfg.address, Ipv4Addr::LOCALHOST);
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.bootstrap_nodes, vec!["a.example:1", "b.example:2"]);
        assert_eq!(cfg.timeout, Duration::from_millis(250));
        assert_eq!(cfg.max_connecting_sockets, 1);
        assert!(!cfg.public_nodes_only);
        assert_eq!(cfg.output, OutputFormat::Json);
    }

    #[test]
    fn unparsable_numbers_fall_back_to_defaults() {
        let cfg = config_from(&[("DHTSCOUT_PORT", "not-a-port"), ("DHTSCOUT_PUBLIC_NODES_ONLY", "maybe")]).unwrap();
        assert_eq!(cfg.port, 6219);
        assert!(cfg.public_nodes_only);
    }

    #[test]
    fn bad_address_or_output_is_an_error() {
        assert!(config_from(&[("DHTSCOUT_ADDRESS", "::1")]).is_err());
        assert!(config_from(&[("DHTSCOUT_OUTPUT", "xml")]).is_err());
    }
}
