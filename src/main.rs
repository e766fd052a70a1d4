use color_eyre::{eyre::eyre, Result};
use opennode::config::NodeConfig;
use opennode::mqtt::{MqttClient, RumqttTransport, Transport};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn main() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;

    let path = NodeConfig::resolve_path(std::env::args().nth(1));
    let created = NodeConfig::ensure_default(&path)?;
    let config = NodeConfig::load(&path)?;

    setup_logging(config.node.log_level.as_deref());
    if created {
        warn!("No configuration found, wrote defaults to {}", path.display());
    }
    info!("Using configuration at {}", path.display());

    config
        .validate()
        .map_err(|e| eyre!("Invalid configuration in {}: {}", path.display(), e))?;

    let transport = RumqttTransport::new(&config.broker);
    let mut client =
        MqttClient::new(transport, config.retry.clone()).with_kinds(config.topic_kinds());

    let failed = config.register_topics(&mut client);
    if failed > 0 {
        warn!("{} topic registration(s) failed, continuing with the rest", failed);
    }

    info!("Connecting to MQTT broker {}", config.broker);
    if !client.connect() {
        error!("Broker not reachable yet, retrying from the control loop");
    }

    run(&mut client, &config);

    info!("Shutting down: {}", client.status());
    shutdown(&mut client);
    Ok(())
}

fn setup_logging(level: Option<&str>) {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", level.unwrap_or("info"))
    }
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}

/// Cooperative control loop: one bounded wait per iteration.
fn run<T: Transport>(client: &mut MqttClient<T>, config: &NodeConfig) {
    let poll = Duration::from_millis(config.node.poll_timeout_ms);
    let mut iteration: u64 = 0;
    loop {
        if let Some(max) = config.node.max_iterations {
            if iteration >= max {
                info!("Reached {} loop iterations", max);
                break;
            }
        }
        iteration += 1;

        let was_connected = client.connected();
        client.wait_for_messages(poll);
        if was_connected && !client.connected() {
            warn!("Lost broker connection: {}", client.status());
        }
    }
}

fn shutdown<T: Transport>(client: &mut MqttClient<T>) {
    let subscribed: Vec<String> = client
        .subscribe_topics()
        .map(|record| record.name().to_string())
        .collect();
    for name in subscribed {
        client.remove_subscribe_topic(&name);
    }

    let published: Vec<String> = client
        .publish_topics()
        .map(|record| record.name().to_string())
        .collect();
    for name in published {
        client.remove_publish_topic(&name);
    }

    client.disconnect();
}
