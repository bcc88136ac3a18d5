use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ims_sip_proxy::cdr::CdrRecorder;
use ims_sip_proxy::config::{self, SharedConfig};
use ims_sip_proxy::proxy::ProxyCore;
use ims_sip_proxy::timer;
use ims_sip_proxy::transport::UdpTransport;

#[derive(Parser)]
#[command(name = "sip-proxyd", about = "RFC 3261 SIP proxy with registrar and CDR recording")]
struct Args {
    /// JSON configuration file
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let cfg = match config::load_from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(errors) = cfg.validate() {
        eprintln!("Configuration validation failed:");
        for err in &errors {
            eprintln!("  - {}", err);
        }
        std::process::exit(1);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.as_filter())),
        )
        .init();

    let bind_ip: IpAddr = cfg
        .server_ip
        .parse()
        .expect("server_ip validated as an IP address");
    let bind_port = cfg.server_port;

    let transport = match UdpTransport::bind(bind_ip, bind_port).await {
        Ok(t) => t,
        Err(e) => {
            // The only fatal startup error.
            eprintln!("Failed to bind UDP socket on {}:{}: {}", bind_ip, bind_port, e);
            std::process::exit(1);
        }
    };
    tracing::info!(tag = "NETWORK", addr = %format!("{}:{}", bind_ip, bind_port), "listening");

    let cdr = Arc::new(CdrRecorder::new(&cfg.cdr_dir, cfg.cdr_merge_mode));
    let shared_config = Arc::new(SharedConfig::new(cfg));
    let transport = Arc::new(transport);
    let core = Arc::new(ProxyCore::new(
        transport.clone(),
        shared_config.clone(),
        cdr.clone(),
    ));

    tokio::spawn(timer::run_sweeper(core.clone(), timer::SWEEP_INTERVAL));

    // SIGHUP republishes the config snapshot; bind ip/port changes still
    // require a restart.
    #[cfg(unix)]
    {
        let shared = shared_config.clone();
        let cdr = cdr.clone();
        let path = args.config.clone();
        tokio::spawn(async move {
            let mut hup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(tag = "NETWORK", error = %e, "SIGHUP handler unavailable");
                    return;
                }
            };
            while hup.recv().await.is_some() {
                match config::load_from_file(&path) {
                    Ok(next) => match next.validate() {
                        Ok(()) => {
                            cdr.set_merge_mode(next.cdr_merge_mode);
                            shared.store(next);
                            tracing::info!(tag = "NETWORK", "config snapshot replaced");
                        }
                        Err(errors) => {
                            tracing::error!(tag = "NETWORK", ?errors, "reload rejected");
                        }
                    },
                    Err(e) => tracing::error!(tag = "NETWORK", error = %e, "reload failed"),
                }
            }
        });
    }

    // Receive loop. Datagrams are handled inline so two datagrams from the
    // same peer keep their arrival order.
    loop {
        tokio::select! {
            received = transport.recv_from() => {
                match received {
                    Ok((data, from)) => core.handle_datagram(&data, from).await,
                    Err(e) => tracing::error!(tag = "NETWORK", error = %e, "recv failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    // No call lifetime is silently lost on shutdown.
    cdr.flush_all(true);
}
