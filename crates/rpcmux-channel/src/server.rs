//! Listening sockets owned by a runtime.

use std::collections::BTreeMap;
use std::path::Path;

use rpcmux_event::{Interest, Registry, SocketAddress, SocketWatcher, Source, Token};
use tracing::{debug, info, warn};

use crate::channel::ChannelId;
use crate::error::{ChannelError, Result};
use crate::runtime::{IoOwner, Runtime, StreamOptions};

struct Server {
    watcher: SocketWatcher,
    token: Token,
}

/// Listeners keyed by normalized address.
#[derive(Default)]
pub struct ServerRegistry {
    servers: BTreeMap<String, Server>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.servers.contains_key(address)
    }

    /// Listening addresses, sorted.
    pub fn addresses(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Whether `address` is one of ours. TCP matches only the exact
    /// normalized `host:port` string; other aliases of a host are not detected.
    fn owns(&self, address: &SocketAddress) -> bool {
        match address {
            SocketAddress::Pipe(path) => self.owns_path(path),
            SocketAddress::Tcp { .. } => self.servers.contains_key(&address.to_string()),
        }
    }

    fn owns_path(&self, path: &Path) -> bool {
        self.servers
            .values()
            .any(|server| !server.watcher.is_tcp() && Path::new(server.watcher.address()) == path)
    }

    fn remove(&mut self, address: &str, registry: &Registry) -> bool {
        match self.servers.remove(address) {
            Some(mut server) => {
                let _ = server.watcher.deregister(registry);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.servers.keys()).finish()
    }
}

fn normalize(address: &str) -> Result<SocketAddress> {
    Ok(SocketAddress::parse(address)?.normalize())
}

impl Runtime {
    /// Listen on `address` and return the address actually bound (a TCP
    /// address with port 0 reports the chosen port).
    ///
    /// The first successful listen exports the address through the
    /// configured environment variable, unless it is already set.
    pub fn server_start(&mut self, address: &str) -> Result<String> {
        let parsed = normalize(address)?;
        let requested = parsed.to_string();
        if self.servers.contains(&requested) {
            return Err(ChannelError::AlreadyListening(requested));
        }

        let mut watcher = SocketWatcher::bind(&parsed)?;
        let bound = watcher.address().to_string();
        if self.servers.contains(&bound) {
            return Err(ChannelError::AlreadyListening(bound));
        }
        let token = self.event_loop.next_token();
        watcher.register(self.event_loop.registry(), token, Interest::READABLE)?;
        self.io.insert(token, IoOwner::Server(bound.clone()));
        self.servers
            .servers
            .insert(bound.clone(), Server { watcher, token });

        if std::env::var_os(&self.config.listen_env_var).is_none() {
            std::env::set_var(&self.config.listen_env_var, &bound);
        }
        info!(address = %bound, "server listening");
        Ok(bound)
    }

    /// Stop listening on `address`. Connections already accepted stay open.
    pub fn server_stop(&mut self, address: &str) -> bool {
        let key = match normalize(address) {
            Ok(parsed) => parsed.to_string(),
            Err(_) => return false,
        };
        let token = match self.servers.servers.get(&key) {
            Some(server) => server.token,
            None => {
                debug!(address = %key, "not listening");
                return false;
            }
        };
        self.servers.remove(&key, self.event_loop.registry());
        self.io.remove(&token);

        if std::env::var(&self.config.listen_env_var).is_ok_and(|value| value == key) {
            std::env::remove_var(&self.config.listen_env_var);
        }
        info!(address = %key, "server stopped");
        true
    }

    /// Addresses currently listened on.
    pub fn server_addresses(&self) -> Vec<String> {
        self.servers.addresses()
    }

    /// Whether `address` is a socket path this runtime listens on.
    pub fn server_owns_pipe_address(&self, address: &str) -> bool {
        match normalize(address) {
            Ok(SocketAddress::Pipe(path)) => self.servers.owns_path(&path),
            _ => false,
        }
    }

    /// Start the initial server: `address` if given, otherwise the one in
    /// the configured environment variable. Returns the bound address, or
    /// `None` when there is nothing to listen on.
    pub fn server_init(&mut self, address: Option<&str>) -> Result<Option<String>> {
        let from_env = std::env::var(&self.config.listen_env_var)
            .ok()
            .filter(|value| !value.is_empty());
        let Some(address) = address.map(str::to_string).or(from_env) else {
            return Ok(None);
        };
        self.server_start(&address).map(Some)
    }

    pub(crate) fn close_all_servers(&mut self) {
        for address in self.servers.addresses() {
            self.server_stop(&address);
        }
    }

    pub(crate) fn accept_connections(&mut self, address: &str) {
        loop {
            let accepted = match self.servers.servers.get(address) {
                Some(server) => server.watcher.accept(),
                None => return,
            };
            match accepted {
                Ok(Some(handle)) => {
                    match self.create_socket_channel(handle, address.to_string(), StreamOptions::rpc()) {
                        Ok(id) => info!(id, address, "accepted rpc connection"),
                        Err(err) => warn!(address, error = %err, "failed to set up connection"),
                    }
                }
                Ok(None) => return,
                Err(err) => {
                    warn!(address, error = %err, "accept failed");
                    return;
                }
            }
        }
    }

    /// Connect to `address`. An rpc connection to an address this runtime
    /// listens on itself yields a loopback channel: a call over a real
    /// connection to ourselves would wait on events that never run.
    pub fn connect(&mut self, address: &str, options: StreamOptions) -> Result<ChannelId> {
        let parsed = normalize(address)?;
        if options.rpc && self.servers.owns(&parsed) {
            info!(address = %parsed, "connecting to own address, using loopback");
            return Ok(self.open_loopback());
        }
        let handle = rpcmux_event::connect(&parsed, self.config.connect_timeout)?;
        let id = self.create_socket_channel(handle, parsed.to_string(), options)?;
        info!(id, address = %parsed, "connected");
        Ok(id)
    }
}
