//! area-dix
//!
//! Drives the input core from a JSON script of dispatch messages and reports
//! what each client was sent.
//!
//! Usage: `area-dix [--config PATH] SCRIPT`

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use area_dix::config::Config;
use area_dix::dispatch::{self, DispatchMsg, DispatchTx, Dispatcher};
use area_dix::dix::{DeviceId, InputClass, RecordingSink, Server, WindowTree, Xid};

const ROOT_WINDOW: Xid = Xid(1);

struct Args {
    config: Option<PathBuf>,
    script: PathBuf,
}

fn parse_args() -> Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut config = None;
    let mut script = None;
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            config = Some(PathBuf::from(args.next().context("--config needs a path")?));
        } else {
            script = Some(PathBuf::from(arg));
        }
    }
    let script = script.context("usage: area-dix [--config PATH] SCRIPT")?;
    Ok(Args { config, script })
}

/// Core pointer and keyboard, paired, so scripts start from a usable seat
async fn add_core_devices(tx: &DispatchTx) -> Result<()> {
    let devices = [
        DispatchMsg::AddDevice {
            name: "core pointer".into(),
            class: InputClass::Pointer,
            master: None,
            pair_with: None,
        },
        DispatchMsg::AddDevice {
            name: "core keyboard".into(),
            class: InputClass::Keyboard,
            master: None,
            pair_with: Some(DeviceId(1)),
        },
    ];
    for msg in devices {
        tx.send(msg)
            .await
            .map_err(|_| anyhow::anyhow!("Dispatch loop stopped early"))?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.filter.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting area-dix");

    let content = std::fs::read_to_string(&args.script)
        .with_context(|| format!("Failed to read script {:?}", args.script))?;
    let messages: Vec<DispatchMsg> =
        serde_json::from_str(&content).context("Failed to parse script")?;

    let sink = RecordingSink::new();
    let server = Server::new(
        config.core_options(),
        Box::new(WindowTree::new(ROOT_WINDOW)),
        Box::new(sink.clone()),
    )
    .context("Failed to initialize input core")?;

    let (tx, rx) = dispatch::channel();
    let dispatcher = tokio::spawn(Dispatcher::new(server, rx).run());

    add_core_devices(&tx).await?;
    let total = messages.len();
    let feed = async move {
        for msg in messages {
            tx.send(msg)
                .await
                .map_err(|_| anyhow::anyhow!("Dispatch loop stopped early"))?;
        }
        Ok::<_, anyhow::Error>(())
    };

    tokio::select! {
        result = feed => {
            if let Err(e) = result {
                error!("Script replay failed: {}", e);
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, abandoning script");
            dispatcher.abort();
            return Ok(());
        }
    }

    let server = dispatcher.await.context("Dispatch task failed")?;
    info!(
        messages = total,
        inconsistencies = server.inconsistencies(),
        "Script finished"
    );

    for (client, count) in sink.summary() {
        println!("client {}: {} items", client.0, count);
        for item in sink.sent(client) {
            println!("  {}", serde_json::to_string(&item)?);
        }
    }

    Ok(())
}
