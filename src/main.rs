use clap::Parser;
use tracing::{debug, info, warn};

use liveward::config::Config;

#[derive(Parser)]
#[command(version)]
struct Args {
    /// Set config file path
    #[arg(short, long)]
    config: Option<String>,
}

async fn shutdown_signal() {
    let _str = liveward::signal::wait_for_stop_signal().await;
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let cfg = Config::parse(args.config);

    liveward::log::set(format!(
        "liveward={},engine={},tower_http=warn",
        cfg.log.level, cfg.log.level
    ));
    warn!("set log level : {}", cfg.log.level);
    debug!("config : {:?}", cfg);

    let listener = tokio::net::TcpListener::bind(cfg.http.listen)
        .await
        .unwrap();
    info!(
        "health surface listening on {}",
        listener.local_addr().unwrap()
    );

    liveward::server_up(cfg, listener, shutdown_signal()).await;
    info!("supervisor shutdown");
}
