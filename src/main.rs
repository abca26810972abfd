use clap::Parser;
use craftrelay::{ids, Endpoint, GameEvents, Packet, PacketHandler, Proxy, ProxyConfig};
use log::{info, warn, LevelFilter};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

/// Transparent intercepting relay for game clients.
///
/// Every option can also be set with a `CRAFTRELAY_` environment variable.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Cli {
    /// Address to accept clients on
    #[arg(long, env = "CRAFTRELAY_LISTEN_HOST", default_value = craftrelay::DEFAULT_LOCAL_HOST)]
    listen_host: String,

    #[arg(long, env = "CRAFTRELAY_LISTEN_PORT", default_value_t = craftrelay::DEFAULT_LOCAL_PORT)]
    listen_port: u16,

    /// Upstream server address
    #[arg(long, env = "CRAFTRELAY_REMOTE_HOST", default_value = craftrelay::DEFAULT_REMOTE_HOST)]
    remote_host: String,

    #[arg(long, env = "CRAFTRELAY_REMOTE_PORT", default_value_t = craftrelay::DEFAULT_REMOTE_PORT)]
    remote_port: u16,

    /// Seconds to wait for the upstream connection
    #[arg(long, env = "CRAFTRELAY_CONNECT_TIMEOUT", default_value_t = craftrelay::DEFAULT_CONNECT_TIMEOUT.as_secs())]
    connect_timeout: u64,

    #[arg(long, env = "CRAFTRELAY_LOG_LEVEL", default_value_t = LevelFilter::Info)]
    log_level: LevelFilter,

    /// Pin the time of day every client sees (0..24000)
    #[arg(long, env = "CRAFTRELAY_TIME_OF_DAY")]
    time_of_day: Option<i64>,

    /// Chat message broadcast when a session enters the game
    #[arg(long, env = "CRAFTRELAY_WELCOME")]
    welcome: Option<String>,
}

impl Cli {
    fn config(&self) -> ProxyConfig {
        let mut config = ProxyConfig::new(
            Endpoint::new(self.listen_host.clone(), self.listen_port),
            Endpoint::new(self.remote_host.clone(), self.remote_port),
        );
        config.connect_timeout = Duration::from_secs(self.connect_timeout);
        config
    }
}

fn install_hooks(proxy: &Arc<Proxy>, cli: &Cli) {
    if let Some(time) = cli.time_of_day {
        // 上游的时间更新总会被丢弃，由这里发送替代包
        proxy.events().add_listener([PacketHandler::new(ids::UPDATE_TIME, 0, move |ctx, p| {
            let world_age = p.reader().get_i64()?;
            let packet = Packet::builder(ids::UPDATE_TIME)
                .put_i64(world_age)
                // 负值会停止客户端的昼夜循环
                .put_i64(-time.rem_euclid(24000))
                .build();
            ctx.client().write_packet(packet);
            Ok(())
        })]);
    }

    let welcome = cli.welcome.clone();
    let weak = Arc::downgrade(proxy);
    GameEvents::new()
        .on_game_start(move || {
            info!("game started");
            if let (Some(text), Some(proxy)) = (welcome.as_deref(), weak.upgrade()) {
                proxy.broadcast(text);
            }
            Ok(())
        })
        .on_chat(|msg| {
            info!("chat: {}", msg.json);
            Ok(())
        })
        .on_kick(|reason| {
            warn!("kicked: {}", reason);
            Ok(())
        })
        .on_death(|| {
            info!("player died");
            Ok(())
        })
        .attach(proxy.events());
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    use env_logger::Builder;

    let cli = Cli::parse();

    Builder::from_default_env()
        .filter(None, cli.log_level)
        .init();

    let proxy = Arc::new(Proxy::new(cli.config()));
    install_hooks(&proxy, &cli);

    {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted");
                proxy.kill();
            }
        });
    }

    proxy.load().await?;
    proxy.network().join().await;
    info!("bye");
    Ok(())
}
