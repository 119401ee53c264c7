//! CLI for Peril
//!
//! Subcommands:
//! - `setup`: declare the exchanges and the dead-letter queue
//! - `pause` / `resume`: broadcast the playing state on the direct exchange
//! - `log`: publish one game log line
//! - `logs`: print game logs until Ctrl-C

use clap::Parser;
use tracing::{error, info};

use peril_pubsub::config::{Settings, load_config};
use peril_pubsub::routing::{GAME_LOG_SLUG, GameLog, PAUSE_KEY, PlayingState, routing_key, wildcard};
use peril_pubsub::transport::amqp::AmqpConnection;
use peril_pubsub::utils::logging;
use peril_pubsub::{AckType, Binding, PubSubClient, QueueDurability};

#[derive(Parser)]
#[command(name = "peril")]
enum Command {
    /// Declare exchanges and the dead-letter queue
    Setup,
    /// Pause the game for every player
    Pause,
    /// Resume the game for every player
    Resume,
    /// Publish a game log line
    Log {
        #[arg(long)]
        username: String,
        #[arg(long)]
        message: String,
    },
    /// Consume game logs and print them until interrupted
    Logs,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Could not load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&settings.logging.level);

    if let Err(e) = run(cmd, settings).await {
        error!("peril failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cmd: Command, settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let connection = AmqpConnection::connect_with_settings(&settings.amqp).await?;
    let client = PubSubClient::new(connection, settings).await?;

    match cmd {
        Command::Setup => client.declare_exchanges().await?,
        Command::Pause => publish_state(&client, true).await?,
        Command::Resume => publish_state(&client, false).await?,
        Command::Log { username, message } => {
            let log = GameLog::now(&username, message);
            let topic = client.settings().exchanges.topic.clone();
            client
                .publish_binary(&topic, &routing_key(GAME_LOG_SLUG, &username), &log)
                .await?;
            info!("Logged for {username}");
        }
        Command::Logs => tail_logs(&client).await?,
    }

    client.close().await?;
    Ok(())
}

async fn publish_state(
    client: &PubSubClient<AmqpConnection>,
    is_paused: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let direct = client.settings().exchanges.direct.clone();
    client
        .publish_json(&direct, PAUSE_KEY, &PlayingState { is_paused })
        .await?;
    info!("Sent playing state (paused: {is_paused})");
    Ok(())
}

async fn tail_logs(client: &PubSubClient<AmqpConnection>) -> Result<(), Box<dyn std::error::Error>> {
    let binding = Binding::new(
        &client.settings().exchanges.topic,
        GAME_LOG_SLUG,
        wildcard(GAME_LOG_SLUG),
        QueueDurability::Durable,
    );
    let subscription = client
        .subscribe_binary::<GameLog, _>(&binding, |log: GameLog| async move {
            println!(
                "{} {}: {}",
                log.current_time.to_rfc3339(),
                log.username,
                log.message
            );
            AckType::Ack
        })
        .await?;

    info!("Waiting for logs on {}. Press Ctrl-C to stop.", subscription.queue());
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully.");

    let stats = subscription.shutdown().await;
    info!(
        "Handled {} log(s), {} requeued, {} discarded",
        stats.acked, stats.requeued, stats.discarded
    );
    Ok(())
}
