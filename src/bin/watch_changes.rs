use clap::Parser;
use media_watch::{BridgeConfig, ChangeBridge, StreamItem};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;
use tracing::{error, info};

/// Print media storage change notifications as JSON lines.
#[derive(Debug, Parser)]
#[command(name = "watch_changes", version)]
struct Args {
    /// Root of the media tree to watch (defaults to ~/Pictures)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Only watch direct children of the root
    #[arg(long)]
    non_recursive: bool,

    /// Coalescing window applied by the watcher, 0 disables it
    #[arg(long, default_value_t = 0)]
    debounce_ms: u64,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    media_watch::log::init_tracing(args.log_file.as_deref(), &args.log_level)?;

    let mut config = BridgeConfig::default()
        .recursive(!args.non_recursive)
        .debounce_ms(args.debounce_ms);
    if let Some(root) = args.root {
        config = config.with_root(root);
    }

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            running.store(false, Ordering::SeqCst);
        })?;
    }

    let bridge = ChangeBridge::with_notify(config);
    let stream = bridge.subscribe()?;
    info!("Watching {} (Ctrl-C to stop)", bridge.scope().root.display());

    while running.load(Ordering::SeqCst) {
        match stream.recv_timeout(Duration::from_millis(200)) {
            Ok(StreamItem::Event(event)) => println!("{}", event.to_json()?),
            Ok(StreamItem::Failed(message)) => {
                error!("Subscription failed: {}", message);
                break;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    bridge.detach();
    info!("Stopped watching");
    Ok(())
}
