//! The connection hub: one process face over many peers.
//!
//! The hub owns the set of live connections and keeps every registered
//! channel hosted on all of them, present and future. Routing strategies
//! build on top of its `connections` snapshot and its add/remove events.

use crate::connection::{Connection, Options};
use crate::logerr;
use crate::server::ChannelHandler;
use crate::transport::Transport;
use log::{debug, error, info};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub enum HubEvent {
    Added(Connection),
    Removed(Uuid),
}

enum HubCommand {
    Accepted {
        connection: Connection,
    },
    Disconnected {
        id: Uuid,
    },
    RegisterChannel {
        name: String,
        handler: Arc<dyn ChannelHandler>,
    },
    Connections {
        result: oneshot::Sender<Vec<Connection>>,
    },
    Dispose,
}

/// Handle on a running hub. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionHub {
    commands: mpsc::Sender<HubCommand>,
    events: broadcast::Sender<HubEvent>,
    options: Options,
}

impl ConnectionHub {
    pub fn start() -> ConnectionHub {
        ConnectionHub::start_with(Options::default())
    }

    pub fn start_with(options: Options) -> ConnectionHub {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (event_tx, _) = broadcast::channel(64);

        tokio::spawn(command_loop(cmd_rx, cmd_tx.clone(), event_tx.clone()));

        ConnectionHub {
            commands: cmd_tx,
            events: event_tx,
            options,
        }
    }

    /// Feed one freshly connected client in. The accept handshake runs on
    /// its own task; once the peer context arrived the connection joins
    /// the live set with every known channel registered.
    pub fn client_connected<T: Transport>(&self, transport: T) {
        let commands = self.commands.clone();
        let options = self.options.clone();

        tokio::spawn(async move {
            match Connection::accept_with(transport, options).await {
                Ok(connection) => {
                    logerr!(commands.send(HubCommand::Accepted { connection }).await);
                }
                Err(e) => error!("client handshake failed: {e}"),
            }
        });
    }

    /// Host a channel on every live connection and on all future ones.
    pub async fn register_channel(&self, name: &str, handler: Arc<dyn ChannelHandler>) {
        logerr!(
            self.commands
                .send(HubCommand::RegisterChannel {
                    name: name.to_owned(),
                    handler,
                })
                .await
        );
    }

    /// Snapshot of the live connections.
    pub async fn connections(&self) -> Vec<Connection> {
        let (tx, rx) = oneshot::channel();

        logerr!(self.commands.send(HubCommand::Connections { result: tx }).await);

        rx.await.unwrap_or_default()
    }

    /// Add/remove notifications. Subscribe before scanning
    /// [`ConnectionHub::connections`] to not miss a concurrent add.
    pub fn events(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    /// Dispose every connection and stop the hub.
    pub async fn dispose(&self) {
        logerr!(self.commands.send(HubCommand::Dispose).await);
    }
}

async fn command_loop(
    mut commands: mpsc::Receiver<HubCommand>,
    loopback: mpsc::Sender<HubCommand>,
    events: broadcast::Sender<HubEvent>,
) {
    let mut live = HashMap::<Uuid, Connection>::new();
    let mut channels = HashMap::<String, Arc<dyn ChannelHandler>>::new();

    while let Some(command) = commands.recv().await {
        match command {
            HubCommand::Accepted { connection } => {
                info!("connection {} joined", connection.id());

                for (name, handler) in &channels {
                    connection.register_channel(name, handler.clone());
                }

                // The watcher turns transport loss into a removal; an
                // explicit dispose travels the same road.
                let watched = connection.clone();
                let loopback = loopback.clone();
                tokio::spawn(async move {
                    watched.closed().await;
                    let _ = loopback
                        .send(HubCommand::Disconnected { id: watched.id() })
                        .await;
                });

                live.insert(connection.id(), connection.clone());
                let _ = events.send(HubEvent::Added(connection));
            }
            HubCommand::Disconnected { id } => {
                if let Some(connection) = live.remove(&id) {
                    info!("connection {id} left");

                    connection.dispose();
                    let _ = events.send(HubEvent::Removed(id));
                }
            }
            HubCommand::RegisterChannel { name, handler } => {
                debug!("hosting channel {name} on {} connection(s)", live.len());

                for connection in live.values() {
                    connection.register_channel(&name, handler.clone());
                }

                channels.insert(name, handler);
            }
            HubCommand::Connections { result } => {
                let _ = result.send(live.values().cloned().collect());
            }
            HubCommand::Dispose => {
                for (_, connection) in live.drain() {
                    connection.dispose();
                }

                break;
            }
        }
    }
}
