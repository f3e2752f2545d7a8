mod args;

use log::{debug, error, info, warn};
use lvmcache::collaborators::{
    SystemBlockSizeProbe, SystemDeviceMapperAdmin, SystemLvDeviceNodeProbe,
    SystemMultipathEnumerator, SystemOwnershipAdmin, SystemProcessInfoLookup,
};
use lvmcache::{config, LvmCacheBuilder};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::process;
use std::sync::Arc;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() {
    env_logger::init();
    info!("starting lvmcached v{}", VERSION);

    let mut signals = Signals::new([SIGINT, SIGTERM]).expect("cannot init signals");

    let args = args::parse();
    debug!("args: {:?}", args);

    let config = config::load(args.config_path).unwrap_or_else(|err| {
        error!("cannot init configuration: {}, falling back to defaults", err);
        config::Config::default()
    });
    debug!("config: {:?}", config);

    let cache = LvmCacheBuilder::new(
        Arc::new(SystemMultipathEnumerator),
        Arc::new(SystemDeviceMapperAdmin),
        Arc::new(SystemProcessInfoLookup),
        Arc::new(SystemBlockSizeProbe),
        Arc::new(SystemOwnershipAdmin),
        Arc::new(SystemLvDeviceNodeProbe),
    )
    .with_config(&config)
    .build();

    if let Err(err) = cache.bootstrap_and_deactivate_unused(|_lv| true) {
        error!("cannot bootstrap lvm cache: {}", err);
        exit(1);
    }
    info!("lvm cache bootstrapped");

    for sig in signals.forever() {
        warn!("received signal {:?}", sig);
        match sig {
            SIGINT | SIGTERM => exit(0),
            unmanaged_sig => {
                error!("unmanaged signal {}", unmanaged_sig);
            }
        }
    }
}

fn exit(code: i32) -> ! {
    info!("exiting lvmcached v{} with code {}", VERSION, code);
    process::exit(code)
}
