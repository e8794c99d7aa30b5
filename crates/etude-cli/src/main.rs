use anyhow::Context;
use clap::Parser;
use etude_core::{Config, Server};
use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "etude")]
#[command(about = "Serve static files over HTTP/1.1 from an epoll reactor")]
#[command(version)]
struct Cli {
    /// Address to bind, e.g. 0.0.0.0
    address: String,
    /// Port to listen on
    port: u16,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ETUDE_LOG_FORMAT=json switches to machine-readable logs.
    match std::env::var("ETUDE_LOG_FORMAT").as_deref() {
        Ok("json") => etude_core::init_logging_json(),
        _ => etude_core::init_logging(),
    }

    let config = Config::from_env().context("loading configuration")?;
    let addr = if cli.address.contains(':') {
        format!("[{}]:{}", cli.address, cli.port)
    } else {
        format!("{}:{}", cli.address, cli.port)
    };

    let server = Server::bind(&addr, config).with_context(|| format!("binding {}", addr))?;
    server.shutdown_on_ctrl_c()?;
    server.serve()?;

    tracing::info!("bye");
    Ok(())
}
