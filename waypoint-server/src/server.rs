//! Combined server runner.
//!
//! Binds both channels, spawns one task per accepted connection and
//! drives the periodic engine housekeeping tick until shutdown.

use crate::client;
use crate::config::Config;
use crate::control;
use crate::error::ServerError;
use crate::gateway::Gateway;
use crate::HOUSEKEEPING_INTERVAL_SECS;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use waypoint_core::time;

/// The waypoint gateway server.
pub struct GatewayServer {
    config: Config,
    gateway: Arc<Gateway>,
    shutdown: broadcast::Sender<()>,
}

impl GatewayServer {
    pub fn new(config: Config) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let gateway = Arc::new(Gateway::new(config.control.add_stats));
        Self {
            config,
            gateway,
            shutdown,
        }
    }

    /// Shared gateway state, e.g. for diagnostics.
    pub fn gateway(&self) -> Arc<Gateway> {
        self.gateway.clone()
    }

    /// Runs both channels until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let control_listener = TcpListener::bind(self.config.control.bind_addr()).await?;
        let client_listener = TcpListener::bind(self.config.client.bind_addr()).await?;

        tracing::info!(
            "control channel listening on {}:{}",
            self.config.control.host,
            self.config.control.port
        );
        tracing::info!(
            "client channel listening on {}:{}",
            self.config.client.host,
            self.config.client.port
        );

        let mut housekeeping =
            tokio::time::interval(Duration::from_secs(HOUSEKEEPING_INTERVAL_SECS));
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = control_listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = self.gateway.clone();
                            let config = self.config.control.clone();
                            tokio::spawn(control::handle_connection(gateway, stream, addr, config));
                        }
                        Err(err) => tracing::error!(%err, "control accept error"),
                    }
                }
                result = client_listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = self.gateway.clone();
                            tokio::spawn(client::handle_connection(gateway, stream, addr));
                        }
                        Err(err) => tracing::error!(%err, "client accept error"),
                    }
                }
                _ = housekeeping.tick() => {
                    self.gateway.engine().housekeeping(time::unix_now());
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("server shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let config = Config {
            client: crate::config::ChannelConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            control: crate::config::ControlConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let server = Arc::new(GatewayServer::new(config));

        let runner = server.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        server.shutdown();
        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }
}
