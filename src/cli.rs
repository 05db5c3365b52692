use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "pulse-collector")]
#[command(version)]
#[command(about = "Continuous Modbus TCP telemetry collector for multi-channel pulse counters")]
pub struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "collector.toml")]
    pub config: String,

    /// Log filter in tracing env-filter syntax (e.g. "info,pulse_collector=debug")
    #[arg(long, default_value = "info")]
    pub log: String,

    /// Validate and echo the effective configuration, then exit
    #[arg(long)]
    pub print_config: bool,

    /// Poll simulated devices instead of real Modbus TCP endpoints
    #[arg(long)]
    pub sim: bool,

    /// Override the bind address for the /health and /metrics endpoints
    #[arg(long)]
    pub http_addr: Option<String>,
}

/// CLI override wins over the config file.
pub fn resolve_http_addr(args: &Args, configured: &str) -> String {
    match &args.http_addr {
        Some(addr) => addr.clone(),
        None => configured.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_minimal() {
        let args = Args::parse_from(["pulse-collector"]);
        assert_eq!(args.config, "collector.toml");
        assert_eq!(args.log, "info");
        assert!(!args.print_config);
        assert!(!args.sim);
        assert!(args.http_addr.is_none());
    }

    #[test]
    fn test_args_parse_full() {
        let args = Args::parse_from([
            "pulse-collector",
            "--config",
            "/etc/pulse/plant.toml",
            "--log",
            "debug",
            "--sim",
            "--http-addr",
            "0.0.0.0:9464",
        ]);
        assert_eq!(args.config, "/etc/pulse/plant.toml");
        assert_eq!(args.log, "debug");
        assert!(args.sim);
        assert_eq!(args.http_addr.as_deref(), Some("0.0.0.0:9464"));
    }

    #[test]
    fn test_resolve_http_addr_prefers_cli() {
        let args = Args::parse_from(["pulse-collector", "--http-addr", "1.2.3.4:1"]);
        assert_eq!(resolve_http_addr(&args, "127.0.0.1:9464"), "1.2.3.4:1");
    }

    #[test]
    fn test_resolve_http_addr_falls_back_to_config() {
        let args = Args::parse_from(["pulse-collector"]);
        assert_eq!(resolve_http_addr(&args, "127.0.0.1:9464"), "127.0.0.1:9464");
    }
}
