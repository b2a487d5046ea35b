use std::io::Write;
use std::sync::Arc;
use wireless_adb_starter::adb::AdbKeyProvider;
use wireless_adb_starter::args::{Args, ArgsError, print_help};
use wireless_adb_starter::config::{DiscoveryMode, StarterConfig};
use wireless_adb_starter::starter::{
    AndroidShellPlatform, BootstrapState, BootstrapTrigger, DiscoveryBackend, DiscoveryFactory, FixedPortDiscovery,
    LifecycleOptions, MdnsDiscovery, Platform, StarterError, StarterEvent, StarterParts, StaticPortDiscovery,
    spawn_lifecycle,
};

fn main() {
    let args = match Args::parse() {
        Ok(Some(args)) => args,
        Ok(None) => return,
        Err(e) => {
            eprintln!("❌ {e}");
            if matches!(e, ArgsError::Unknown(_)) {
                print_help();
            }
            std::process::exit(2);
        }
    };

    let level = if args.debug_mode { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ {e}");
            std::process::exit(2);
        }
    };

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("❌ Failed to start runtime: {e}");
            std::process::exit(2);
        }
    };
    let code = rt.block_on(run(config));
    std::process::exit(code);
}

fn load_config(args: &Args) -> Result<StarterConfig, StarterError> {
    let mut config = match &args.config_path {
        Some(path) => StarterConfig::load(path)?,
        None => StarterConfig::default(),
    };
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.fixed_port = Some(port);
    }
    if let Some(path) = &args.key_path {
        config.key_path = Some(path.clone());
    }
    if let Some(secs) = args.port_wait_timeout_secs {
        config.port_wait_timeout_secs = Some(secs);
    }
    if args.static_port {
        config.discovery = DiscoveryMode::StaticProperty;
    }
    Ok(config)
}

fn discovery_factory(config: &StarterConfig, platform: Arc<dyn Platform>) -> DiscoveryFactory {
    if let Some(port) = config.fixed_port {
        return Box::new(move || -> Box<dyn DiscoveryBackend> { Box::new(FixedPortDiscovery::new(port)) });
    }
    match config.discovery {
        DiscoveryMode::Mdns => {
            let service = config.mdns_service_type.clone();
            let host = config.host.clone();
            Box::new(move || -> Box<dyn DiscoveryBackend> {
                Box::new(MdnsDiscovery::new(service.clone(), &host, Arc::clone(&platform)))
            })
        }
        DiscoveryMode::StaticProperty => {
            let property = config.static_port_property.clone();
            Box::new(move || -> Box<dyn DiscoveryBackend> {
                Box::new(StaticPortDiscovery::new(Arc::clone(&platform), property.clone()))
            })
        }
    }
}

async fn run(config: StarterConfig) -> i32 {
    let store = match config.key_store() {
        Ok(store) => store,
        Err(e) => {
            eprintln!("❌ {e}");
            return 2;
        }
    };
    log::debug!("🔑 Using key file {}", store.path().display());

    let platform: Arc<dyn Platform> = Arc::new(AndroidShellPlatform::new(config.clone()));
    let parts = StarterParts {
        options: LifecycleOptions::from_config(&config),
        platform: Arc::clone(&platform),
        keys: Arc::new(AdbKeyProvider::new(Box::new(store), config.key_label.clone())),
        discovery: discovery_factory(&config, platform),
    };

    let (handle, mut events, join) = spawn_lifecycle(parts);
    if let Err(e) = handle.start(BootstrapTrigger::default()) {
        eprintln!("❌ {e}");
        return 1;
    }

    let mut final_state = BootstrapState::Failed;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(StarterEvent::Output(text)) => {
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
                Some(StarterEvent::StateChanged(_)) => {}
                Some(StarterEvent::StartRejected { reason }) => {
                    eprintln!("❌ Start rejected: {reason}");
                    break;
                }
                Some(StarterEvent::Finished { state, .. }) => {
                    final_state = state;
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                log::info!("🛑 Interrupted, cleaning up");
                handle.shutdown();
            }
        }
    }

    handle.shutdown();
    if let Err(e) = join.await {
        log::error!("❌ Lifecycle worker failed: {e}");
    }

    match final_state {
        BootstrapState::Completed => 0,
        _ => 1,
    }
}
