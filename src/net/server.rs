//! The server engine: the single inbound listener.
//!
//! Each accepted connection runs in its own task: handshake (with the
//! whitelist consulted mid-handshake), then a request/reply loop feeding
//! the command layer. The authenticator is refreshed lazily whenever the
//! settings version has moved, so peer-table edits apply to the next
//! connection without a listener restart.

use crate::commands::Commands;
use crate::keystore::KeyPair;
use crate::net::authenticator::Authenticator;
use crate::net::encrypted::EncryptedStream;
use crate::node::SharedState;
use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct ServerEngine {
    state: Arc<SharedState>,
    commands: Commands,
    server_pair: KeyPair,
    authenticator: Arc<Authenticator>,
    stop: watch::Receiver<bool>,
    listener: TcpListener,
}

impl ServerEngine {
    /// Bind the listener. Failure here is fatal to node startup.
    pub async fn bind(
        state: Arc<SharedState>,
        commands: Commands,
        server_pair: KeyPair,
        authenticator: Arc<Authenticator>,
        stop: watch::Receiver<bool>,
    ) -> io::Result<Self> {
        let (ip, port) = {
            let settings = state.settings.read().unwrap();
            (settings.app_ip.clone(), settings.app_port)
        };
        let listener = TcpListener::bind((ip.as_str(), port)).await?;
        info!("server listening for encrypted connections @ {}:{}", ip, port);
        Ok(Self {
            state,
            commands,
            server_pair,
            authenticator,
            stop,
            listener,
        })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(mut self) {
        info!("server engine started");
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!("inbound connection from {}", addr);
                            self.spawn_connection(stream);
                        }
                        Err(e) => warn!("accept failed: {}", e),
                    }
                }
                _ = self.stop.changed() => {
                    if *self.stop.borrow() {
                        break;
                    }
                }
            }
        }
        info!("server engine stopped");
    }

    fn spawn_connection(&self, stream: TcpStream) {
        let state = self.state.clone();
        let commands = self.commands.clone();
        let server_pair = self.server_pair.clone();
        let authenticator = self.authenticator.clone();
        let mut stop = self.stop.clone();

        tokio::spawn(async move {
            // Pick up any peer-table change before trusting the whitelist.
            authenticator.refresh_if_stale(state.settings_version.load(Ordering::Acquire));

            let auth = authenticator.clone();
            let stream = match EncryptedStream::accept(stream, &server_pair, move |key| {
                auth.is_allowed(key)
            })
            .await
            {
                Ok(s) => s,
                Err(e) => {
                    warn!("inbound handshake rejected: {}", e);
                    return;
                }
            };

            // The whitelisted key belongs to exactly one peer record; the
            // identity claimed inside packets must match it.
            let expected_id = {
                let key_hex = hex::encode(stream.remote_static);
                let settings = state.settings.read().unwrap();
                settings
                    .peers
                    .iter()
                    .find(|(_, p)| p.enabled && p.clientkey == key_hex)
                    .map(|(id, _)| id.clone())
            };
            let peer_addr = stream.peer_addr;
            let (mut reader, mut writer) = stream.split();

            loop {
                let frame = tokio::select! {
                    read = reader.read() => match read {
                        Ok(f) => f,
                        Err(e) => {
                            debug!("connection from {} closed: {}", peer_addr, e);
                            return;
                        }
                    },
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            return;
                        }
                        continue;
                    }
                };

                state.download_limiter.add(frame.len());
                let (identity, reply) = commands.process_request(&frame);

                let Some(identity) = identity else {
                    // Malformed frame: warned already, no reply goes out.
                    continue;
                };
                if let Some(expected) = &expected_id {
                    if &identity != expected {
                        warn!(
                            "{} claimed identity {} but its key belongs to {}",
                            peer_addr, identity, expected
                        );
                        continue;
                    }
                }
                state.mark_server_seen(&identity);

                if let Some(reply) = reply {
                    state.upload_limiter.add(reply.len());
                    if let Err(e) = writer.write(&reply).await {
                        debug!("reply to {} failed: {}", peer_addr, e);
                        return;
                    }
                }
            }
        });
    }
}
