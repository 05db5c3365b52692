use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use colored::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pulse_collector::cli::{resolve_http_addr, Args};
use pulse_collector::config::CollectorConfig;
use pulse_collector::influx::InfluxSink;
use pulse_collector::modbus::{ModbusTransport, SimTransport};
use pulse_collector::sink::{LogSink, TimeSeriesSink};
use pulse_collector::{Collector, TransportFactory};

fn print_banner(cfg: &CollectorConfig, sim: bool) {
    println!("{}", "PULSE COLLECTOR".bright_cyan().bold());
    println!(
        "{}: {} device(s), poll every {} ms",
        "Fleet".bright_yellow(),
        cfg.devices.len(),
        cfg.poll_interval_ms
    );
    println!(
        "{}: batch {} readings, flush every {} ms",
        "Sink".bright_yellow(),
        cfg.batch_size,
        cfg.flush_interval_ms
    );
    println!(
        "{}: http://{}/health  http://{}/metrics",
        "Observability".bright_yellow(),
        cfg.http_addr,
        cfg.http_addr
    );
    if sim {
        println!("{}", "Simulation mode: no hardware will be contacted".bright_magenta());
    }
    println!("{}", "=".repeat(50).bright_blue());
}

fn print_config(cfg: &CollectorConfig) {
    println!("{}", "Effective configuration".bright_cyan().bold());
    println!(
        "  poll_interval_ms={} batch_size={} flush_interval_ms={} max_retries={}",
        cfg.poll_interval_ms, cfg.batch_size, cfg.flush_interval_ms, cfg.max_retries
    );
    println!(
        "  rate_window_samples={} warn_threshold={} offline_threshold={}",
        cfg.rate_window_samples, cfg.warn_threshold, cfg.offline_threshold
    );
    println!("  http_addr={}", cfg.http_addr);
    match &cfg.influx {
        Some(influx) => println!("  influx: {} bucket={}", influx.url, influx.bucket),
        None => println!("  influx: (none — batches go to the log sink)"),
    }
    for device in &cfg.devices {
        let status = match device.validate(cfg) {
            Ok(()) => "ok".bright_green().to_string(),
            Err(e) => format!("{} {}", "REJECTED:".bright_red(), e),
        };
        println!(
            "  device {} @ {} unit {} — {} channel(s) [{}]",
            device.device_id.bright_white(),
            device.addr(),
            device.unit_id,
            device.channels.len(),
            status
        );
        for ch in &device.channels {
            println!(
                "    ch{} reg {}..+{} {} scale={} offset={} unit={:?}{}",
                ch.channel_number,
                ch.start_register,
                ch.register_count,
                ch.counter_width.as_str(),
                ch.scale_factor,
                ch.offset,
                ch.unit,
                if ch.enabled { "" } else { " (disabled)" }
            );
        }
    }
}

/// Simulated fleet: one deterministic counter per configured channel.
fn sim_factory() -> TransportFactory {
    Box::new(|device, _global| {
        let mut sim = SimTransport::new(Duration::from_millis(2));
        for (i, ch) in device.enabled_channels().enumerate() {
            sim = sim.with_channel(ch.start_register, 1000 * (i as u64 + 1), 25.0 * (i as f64 + 1.0));
        }
        Box::new(sim) as Box<dyn ModbusTransport>
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut cfg = CollectorConfig::load(&args.config)?;
    cfg.http_addr = resolve_http_addr(&args, &cfg.http_addr);

    if args.print_config {
        print_config(&cfg);
        return Ok(());
    }

    print_banner(&cfg, args.sim);

    let sink: Arc<dyn TimeSeriesSink> = match &cfg.influx {
        Some(influx_cfg) => {
            info!(url = %influx_cfg.url, bucket = %influx_cfg.bucket, "using influx sink");
            Arc::new(InfluxSink::new(influx_cfg)?)
        }
        None => {
            warn!("no [influx] section configured, batches will only be logged");
            Arc::new(LogSink)
        }
    };

    let collector = if args.sim {
        Collector::with_transport_factory(cfg, sink, sim_factory())?
    } else {
        Collector::new(cfg, sink)?
    };

    let handle = collector.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{}", "Stopping (final flush in progress)...".bright_yellow());
            handle.shutdown();
        }
    });

    collector.run().await?;
    Ok(())
}
