use serde::Deserialize;

/// Where certificate material comes from.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum SecretProviderKind {
    /// PEM chain, key and validity metadata in a directory
    File,
    /// Locally issued certificates, development only
    SelfSigned,
}

impl SecretProviderKind {
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "self-signed" | "self_signed" | "selfsigned" => Self::SelfSigned,
            _ => Self::File,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    // Routing document
    pub routing_config: String,
    pub config_poll_secs: u64,

    // Listeners
    pub bind_host: String,
    pub drain_timeout_secs: u64,

    // Dispatch
    pub unknown_grace_secs: Option<u64>,
    pub affinity_ttl_secs: u64,
    pub affinity_gc_interval_secs: u64,

    // Certificates
    pub secret_provider: SecretProviderKind,
    pub cert_dir: String,
    pub cert_poll_secs: u64,
    pub self_signed_names: Vec<String>,
    pub self_signed_validity_days: u32,
    /// 0 disables the secret cache
    pub secret_cache_ttl_secs: u64,
    pub secret_env_fallback: bool,

    // Admin API
    pub admin_enabled: bool,
    pub admin_listen_addr: String,

    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            routing_config: "routing.json".to_string(),
            config_poll_secs: 5,
            bind_host: "0.0.0.0".to_string(),
            drain_timeout_secs: 30,
            unknown_grace_secs: None,
            affinity_ttl_secs: 3600,
            affinity_gc_interval_secs: 60,
            secret_provider: SecretProviderKind::File,
            cert_dir: "certs".to_string(),
            cert_poll_secs: 3600,
            self_signed_names: vec!["localhost".to_string()],
            self_signed_validity_days: 90,
            secret_cache_ttl_secs: 300,
            secret_env_fallback: true,
            admin_enabled: true,
            admin_listen_addr: "127.0.0.1:9090".to_string(),
            debug: false,
        }
    }
}

fn flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

fn number<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

pub fn load_config() -> anyhow::Result<Config> {
    let defaults = Config::default();

    let routing_config =
        std::env::var("EDGEGW_ROUTING_CONFIG").unwrap_or(defaults.routing_config);

    let config_poll_secs = number("EDGEGW_CONFIG_POLL_SECS", defaults.config_poll_secs);

    let bind_host = std::env::var("EDGEGW_BIND_HOST").unwrap_or(defaults.bind_host);

    let drain_timeout_secs = number("EDGEGW_DRAIN_TIMEOUT_SECS", defaults.drain_timeout_secs);

    // unset or unparsable: Unknown targets stay eligible indefinitely
    let unknown_grace_secs = std::env::var("EDGEGW_UNKNOWN_GRACE_SECS")
        .ok()
        .and_then(|v| v.trim().parse().ok());

    let affinity_ttl_secs = number("EDGEGW_AFFINITY_TTL_SECS", defaults.affinity_ttl_secs);

    let affinity_gc_interval_secs = number(
        "EDGEGW_AFFINITY_GC_INTERVAL_SECS",
        defaults.affinity_gc_interval_secs,
    );

    let secret_provider = std::env::var("EDGEGW_SECRET_PROVIDER")
        .map(|v| SecretProviderKind::from_str(&v))
        .unwrap_or(defaults.secret_provider);

    let cert_dir = std::env::var("EDGEGW_CERT_DIR").unwrap_or(defaults.cert_dir);

    let cert_poll_secs = number("EDGEGW_CERT_POLL_SECS", defaults.cert_poll_secs);

    let self_signed_names = std::env::var("EDGEGW_SELF_SIGNED_NAMES")
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or(defaults.self_signed_names);

    let self_signed_validity_days = number(
        "EDGEGW_SELF_SIGNED_VALIDITY_DAYS",
        defaults.self_signed_validity_days,
    );

    let secret_cache_ttl_secs =
        number("EDGEGW_SECRET_CACHE_TTL_SECS", defaults.secret_cache_ttl_secs);

    let secret_env_fallback = flag("EDGEGW_SECRET_ENV_FALLBACK", defaults.secret_env_fallback);

    let admin_enabled = flag("EDGEGW_ADMIN_ENABLED", defaults.admin_enabled);

    let admin_listen_addr =
        std::env::var("EDGEGW_ADMIN_LISTEN_ADDR").unwrap_or(defaults.admin_listen_addr);

    let debug = std::env::var("DEBUG").is_ok();

    Ok(Config {
        routing_config,
        config_poll_secs,
        bind_host,
        drain_timeout_secs,
        unknown_grace_secs,
        affinity_ttl_secs,
        affinity_gc_interval_secs,
        secret_provider,
        cert_dir,
        cert_poll_secs,
        self_signed_names,
        self_signed_validity_days,
        secret_cache_ttl_secs,
        secret_env_fallback,
        admin_enabled,
        admin_listen_addr,
        debug,
    })
}
