use log::{error, info, warn};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{StreamExt, StreamMap};

use sysgpio::{AppConfig, EdgeDetect, GpioManager, Pin, SysfsGateway};

#[cfg(feature = "hardware-gpio")]
use sysgpio::KernelSysfs;
#[cfg(not(feature = "hardware-gpio"))]
use sysgpio::MockSysfs;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SYSGPIO_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = AppConfig::load_from_file(&config_path)
        .unwrap_or_else(|e| panic!("Failed to load config: {e}"));

    let gateway = {
        #[cfg(feature = "hardware-gpio")]
        {
            Arc::new(KernelSysfs::new())
        }
        #[cfg(not(feature = "hardware-gpio"))]
        {
            Arc::new(MockSysfs::new(&config.sysfs))
        }
    };

    let manager = GpioManager::new(Arc::new(config.sysfs.clone()), gateway);
    run(&manager, &config).await;
    Ok(())
}

async fn run<G: SysfsGateway>(manager: &GpioManager<G>, config: &AppConfig) {
    let mut pins: Vec<Pin<G>> = Vec::new();
    let mut streams = StreamMap::new();

    for (id, pin_cfg) in &config.gpios {
        let pin = match manager.export(pin_cfg.line, Some(pin_cfg.direction)) {
            Ok(pin) => pin,
            Err(e) => {
                error!("Failed to export {} (gpio{}): {e}", pin_cfg.name, pin_cfg.line);
                continue;
            }
        };

        if pin_cfg.edge != EdgeDetect::None {
            let (tx, rx) = mpsc::channel(config.event_buffer_capacity);
            match pin.start_event_channel(pin_cfg.edge, tx) {
                Ok(_) => {
                    info!("Watching {} edges on {} (gpio{})", pin_cfg.edge, pin_cfg.name, pin_cfg.line);
                    streams.insert(*id, ReceiverStream::new(rx));
                }
                Err(e) => error!("Failed to watch {}: {e}", pin_cfg.name),
            }
        }
        pins.push(pin);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
            event = streams.next(), if !streams.is_empty() => {
                let Some((id, event)) = event else { break; };
                info!("gpio {id}: value {} at {}", event.value, event.timestamp_ms);
                if let Ok(text) = serde_json::to_string(&serde_json::json!({
                    "pin_id": id,
                    "value": event.value,
                    "timestamp_ms": event.timestamp_ms,
                })) {
                    println!("{text}");
                }
            }
        }
    }

    for pin in pins {
        if let Err(e) = pin.close() {
            warn!("Failed to release gpio{}: {e}", pin.line());
        }
    }
}
