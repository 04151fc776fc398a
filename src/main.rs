//! tlsproxy - Main entry point
//!
//! Exposes a plain HTTP backend over HTTPS

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tlsproxy::config::parse_log_level;
use tlsproxy::{
    serve, Args, CertificateBundle, CertificateOrigin, CertificateSource, ProxyConfig, ReverseProxy,
};
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    FmtSubscriber::builder()
        .with_max_level(parse_log_level(&args.log_level))
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    // Validate before touching the filesystem or the network
    let config = ProxyConfig::from_args(&args)?;

    let bundle = match &config.certificate {
        CertificateSource::Files { cert, key } => {
            CertificateBundle::load_pem(cert, key).context("cannot load cert")?
        }
        CertificateSource::SelfSigned { identity } => {
            CertificateBundle::generate_self_signed(identity).context("cannot generate cert")?
        }
    };

    let origin = match bundle.origin() {
        CertificateOrigin::Loaded => "given",
        CertificateOrigin::Generated => "generated",
    };

    info!(
        "starting proxying {} on {} with {} cert",
        config.backend, config.listen, origin
    );

    let handler = Arc::new(ReverseProxy::new(config.backend.clone()));
    serve(&config.listen, bundle, handler).await?;

    Ok(())
}
