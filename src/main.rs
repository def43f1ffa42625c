use relaylink::{
    Config, GatewayEvent, GatewaySocket,
    common::{
        banner::{BannerInfo, print_banner},
        logger,
        types::AnyResult,
    },
};
use tracing::{debug, info, warn};

/// Environment variable holding the bot token.
const TOKEN_ENV: &str = "RELAYLINK_TOKEN";

#[tokio::main]
async fn main() -> AnyResult<()> {
    let config = Config::load()?;
    logger::init(config.logging.as_ref());
    print_banner(&BannerInfo::default(), &config.gateway.url);

    let token = std::env::var(TOKEN_ENV).map_err(|_| format!("{TOKEN_ENV} is not set"))?;
    let (gateway, mut events) = GatewaySocket::new(token, &config)?;
    gateway.connect()?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(GatewayEvent::Killed) | None => break,
                Some(GatewayEvent::Warn(error)) => warn!("{}", error),
                Some(GatewayEvent::Dispatch { name, .. }) => debug!("Dispatch {}", name),
                Some(GatewayEvent::Packet(_)) => {}
                Some(event) => info!("Gateway event: {}", event.name()),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                gateway.kill();
            }
        }
    }

    Ok(())
}
