use anyhow::Context;
use clap::Parser;
use pin_hub::client::{Gesture, SwitchClient, ValueClient};
use pin_hub::config::Config;
use pin_hub::consts;
use pin_hub::driver::EmulatedBank;
use pin_hub::message::{PinFlavour, RegisterRequest, WriteRequest};
use pin_hub::pin::registry::PinRegistry;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "config.yaml")]
    config_path: String,

    // Controller entry the demo pins ride; first controller by name when omitted.
    #[arg(long)]
    controller: Option<String>,

    // Demo pins
    #[arg(long, default_value = "4")]
    switch_pin: String,
    #[arg(long, default_value = "18")]
    light_pin: String,

    // Seconds between emulated presses
    #[arg(long, default_value_t = 10)]
    press_period: u64,
}

fn init_log() {
    let timer = fmt::time::ChronoLocal::new("%H:%M:%S%.3f".to_string());

    // Configure a custom event formatter
    let format = fmt::format()
        .with_level(true)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_source_location(true)
        .with_timer(timer)
        .compact();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::DEBUG.into())
        .from_env()
        .expect("RUST_LOG configuration is valid");

    fmt().event_format(format).with_env_filter(filter).init();
}

/// Register the demo pins and wait for their links to open.
async fn init_pins(hub: &PinRegistry, args: &Args) -> anyhow::Result<(SwitchClient, ValueClient)> {
    let mut req = RegisterRequest::new(&args.switch_pin, consts::TYPE_DIN);
    req.flavour = PinFlavour::Switch;
    req.caption = Some("demo switch".to_string());
    let (link, info) = hub.register(req).await?;
    let switch = SwitchClient::new(link, &info);

    let mut req = RegisterRequest::new(&args.light_pin, consts::TYPE_PWM);
    req.flavour = PinFlavour::Light;
    req.caption = Some("demo light".to_string());
    let (link, info) = hub.register(req).await?;
    info!(
        "Light {} opened at {:?} with caps {:?}",
        args.light_pin, info.value, info.caps
    );
    let light = ValueClient::new(link, &info);

    Ok((switch, light))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_log();
    let args = Args::parse();

    let config = Config::from_file(&args.config_path)?;
    info!(
        "Starting {} {}. Args: {:?} Config: {:?}",
        consts::HUB_NAME,
        consts::HUB_VERSION,
        args,
        config
    );

    // Every configured controller gets its own registry; the demo pins ride one of them.
    let mut hubs: Vec<Arc<PinRegistry>> = Vec::new();
    let mut hub: Option<Arc<PinRegistry>> = None;
    for (name, controller) in &config.controllers {
        let types: Vec<&str> = controller.types.iter().map(String::as_str).collect();
        let bank = Arc::new(EmulatedBank::new(&types));
        let registry = Arc::new(PinRegistry::start(name, controller, bank));
        let serve = match &args.controller {
            Some(wanted) => wanted == name,
            None => hub.is_none(),
        };
        if serve {
            hub = Some(registry.clone());
        }
        hubs.push(registry);
    }
    let hub = hub.with_context(|| match &args.controller {
        Some(name) => format!("no controller {} in config", name),
        None => "config has no controllers".to_string(),
    })?;

    let (mut switch, mut light) = init_pins(&hub, &args).await?;

    info!("pin-hub initialized.");

    // Gestures -> light writes
    let task_entry = async move {
        loop {
            tokio::select! {
                gesture = switch.gesture() => {
                    let gesture = if let Some(gesture) = gesture {
                        gesture
                    } else {
                        // The controller side died.
                        break;
                    };
                    let level = match gesture {
                        Gesture::Tap { count: 1, .. } => Some(consts::LIGHT_DEFAULT_ON),
                        Gesture::Tap { .. } => Some(1.0),
                        Gesture::Hold { .. } => Some(0.0),
                        Gesture::Press { at } => {
                            debug!("Switch {} pressed at {}", switch.index(), at);
                            None
                        }
                        Gesture::Release { .. } => None,
                    };
                    if let Some(level) = level {
                        info!("Dimming {} to {}", light.index(), level);
                        let req = WriteRequest::dim(level, consts::LIGHT_DIM_SPEED_MS);
                        if let Err(err) = light.write(req).await {
                            warn!("Light write failed: {}", err);
                        }
                    }
                }
                value = light.changed() => {
                    let value = if let Some(value) = value {
                        value
                    } else {
                        // The controller side died.
                        break;
                    };
                    info!("Light {} now {:?} (aim {:?})", light.index(), value, light.aim());
                }
            }
        }
        info!("Entry task finishing");
        Err::<(), ()>(())
    };

    // State log
    let mut state = hub.watch_state();
    let task_state = async move {
        while state.changed().await.is_ok() {
            let snapshot = state.borrow_and_update().clone();
            debug!(
                "State: {}",
                serde_json::to_string(&snapshot).unwrap_or_default()
            );
        }
        info!("State watcher finishing");
        Err::<(), ()>(())
    };

    let presser = hub.clone();
    let index = args.switch_pin.clone();
    tokio::spawn(async move {
        let mut round: u32 = 0;
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(args.press_period)).await;
            round += 1;

            // Raw 0 is a pressed contact.
            if round % 5 == 0 {
                info!("Emulating a hold on pin {}", index);
                if presser.emulate(&index, 0).await.is_err() {
                    // Registry died.
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(1300)).await;
                if presser.emulate(&index, 1).await.is_err() {
                    break;
                }
                continue;
            }

            let taps = if round % 3 == 0 { 2 } else { 1 };
            info!("Emulating {} tap(s) on pin {}", taps, index);
            for _ in 0..taps {
                if presser.emulate(&index, 0).await.is_err() {
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(120)).await;
                if presser.emulate(&index, 1).await.is_err() {
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(120)).await;
            }
        }
    });

    // Wait for tasks. If any side dies this should close the program.
    let _ = tokio::try_join!(task_entry, task_state);
    Ok(())
}
