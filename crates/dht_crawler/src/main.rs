use dht_crawler::{Config, DhtEngine, FileInfoHashLog, InfoHashObserver, NullObserver};
use log::{error, info};
use std::sync::Arc;

const INFO_HASH_LOG_PATH: &str = "info_hashes.log";

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = Config::default();
    let observer: Arc<dyn InfoHashObserver> = match FileInfoHashLog::open(INFO_HASH_LOG_PATH) {
        Ok(log) => Arc::new(log),
        Err(e) => {
            error!("could not open {}: {}, discarding info-hashes", INFO_HASH_LOG_PATH, e);
            Arc::new(NullObserver)
        }
    };

    let mut engine = match DhtEngine::bind(config, observer).await {
        Ok(engine) => engine,
        Err(e) => {
            error!("failed to start dht engine: {}", e);
            std::process::exit(1);
        }
    };

    info!("dht engine listening on {:?}", engine.local_addr());
    engine.bootstrap().await;

    tokio::select! {
        result = engine.run() => {
            if let Err(e) = result {
                error!("dht engine stopped: {}", e);
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
    }
}
