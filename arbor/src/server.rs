use std::{
    collections::VecDeque,
    future::Future,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::Result;
use clap::ValueEnum;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    broadcaster::{Broadcaster, ConnectionPeer, Peer, PeerId},
    error::{StreamError, TreeError},
    io::ProtocolReadWriter,
    message::ChatMessage,
    protocol::{Frame, ProtocolMessage},
    tree::MessageTree,
};

/// Whether a NEW_MESSAGE is broadcast back to the connection that sent it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum EchoPolicy {
    #[default]
    All,
    ExcludeOrigin,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub echo: EchoPolicy,
    /// Broadcast a system message whenever a client connects.
    pub announce_joins: bool,
    /// How many recent message ids a WELCOME advertises.
    pub recent_capacity: usize,
    /// Frames buffered per connection before it is dropped as too slow.
    pub outbound_queue: usize,
    pub system_author: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            echo: EchoPolicy::All,
            announce_joins: false,
            recent_capacity: 25,
            outbound_queue: 256,
            system_author: "arbor".to_string(),
        }
    }
}

/// Creates the root message every conversation hangs from and returns its id.
pub fn seed_root(tree: &MessageTree, content: &str, author: &str) -> Result<String, TreeError> {
    let mut root = ChatMessage::new(content);
    root.author = author.to_string();
    root.assign_id();
    let id = root.id.clone();
    tree.add(root)?;
    Ok(id)
}

pub struct Server {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    pub fn new(
        listener: TcpListener,
        config: ServerConfig,
        tree: Arc<MessageTree>,
        root_id: String,
    ) -> Self {
        Self {
            listener,
            state: Arc::new(ServerState::new(config, tree, root_id)),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state);
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_shutdown(state: &ServerState) {
    info!(peers = state.broadcaster.len(), "server shutting down");
    state.broadcaster.close_all();
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ServerState>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, state),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, state: &Arc<ServerState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, peer, state).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}

struct ServerState {
    tree: Arc<MessageTree>,
    broadcaster: Broadcaster,
    recent: Mutex<VecDeque<String>>,
    root_id: String,
    config: ServerConfig,
}

impl ServerState {
    fn new(config: ServerConfig, tree: Arc<MessageTree>, root_id: String) -> Self {
        Self {
            tree,
            broadcaster: Broadcaster::new(),
            recent: Mutex::new(VecDeque::with_capacity(config.recent_capacity)),
            root_id,
            config,
        }
    }

    fn welcome(&self) -> ProtocolMessage {
        let recent = self
            .recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        ProtocolMessage::welcome(self.root_id.clone(), recent)
    }

    fn remember(&self, id: String) {
        if self.config.recent_capacity == 0 {
            return;
        }
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        if recent.contains(&id) {
            return;
        }
        if recent.len() == self.config.recent_capacity {
            recent.pop_front();
        }
        recent.push_back(id);
    }

    fn dispatch(&self, envelope: ProtocolMessage, origin: PeerId) {
        if !envelope.is_valid() {
            debug!(peer = origin, kind = %envelope.kind(), "dropping invalid envelope");
            return;
        }

        match envelope {
            ProtocolMessage::Query { requested_id } => self.answer_query(&requested_id, origin),
            ProtocolMessage::NewMessage(message) => self.accept_message(message, origin),
            ignored => debug!(peer = origin, kind = %ignored.kind(), "ignoring envelope"),
        }
    }

    fn answer_query(&self, id: &str, origin: PeerId) {
        let Some(message) = self.tree.get(id) else {
            debug!(peer = origin, id, "query for unknown message");
            return;
        };
        if let Some(frame) = encode(&ProtocolMessage::NewMessage(message)) {
            self.broadcaster.send_to(&frame, origin);
        }
    }

    fn accept_message(&self, message: ChatMessage, origin: PeerId) {
        if let Err(error) = self.tree.add(message.clone()) {
            warn!(peer = origin, %error, "rejecting message");
            return;
        }
        self.remember(message.id.clone());

        let Some(frame) = encode(&ProtocolMessage::NewMessage(message)) else {
            return;
        };
        let delivered = match self.config.echo {
            EchoPolicy::All => self.broadcaster.send(&frame),
            EchoPolicy::ExcludeOrigin => self.broadcaster.send_except(&frame, origin),
        };
        debug!(peer = origin, delivered, "broadcast new message");
    }

    fn announce_join(&self, peer: SocketAddr) {
        let mut announcement = ChatMessage::new(format!("{peer} has joined"));
        announcement.parent_id = self.root_id.clone();
        announcement.author = self.config.system_author.clone();
        announcement.assign_id();

        if let Err(error) = self.tree.add(announcement.clone()) {
            warn!(%error, "failed to record join announcement");
            return;
        }
        self.remember(announcement.id.clone());
        if let Some(frame) = encode(&ProtocolMessage::NewMessage(announcement)) {
            self.broadcaster.send(&frame);
        }
    }
}

fn encode(envelope: &ProtocolMessage) -> Option<Frame> {
    match envelope.encode() {
        Ok(frame) => Some(frame),
        Err(error) => {
            warn!(%error, "failed to encode envelope");
            None
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ServerState>,
) -> Result<()> {
    let connection = Arc::new(ProtocolReadWriter::new(stream)?);
    let (sink, outbound) = ConnectionPeer::new(state.config.outbound_queue);

    // Queue the WELCOME before registering so no broadcast can overtake it.
    if let Some(frame) = encode(&state.welcome()) {
        sink.write(&frame)?;
    }
    let peer_id = state.broadcaster.add(Arc::new(sink));
    let pump = tokio::spawn(pump_outbound(Arc::clone(&connection), outbound));

    info!(peer = %peer, peer_id, "client joined");
    if state.config.announce_joins {
        state.announce_join(peer);
    }

    let result = run_session(&state, &connection, peer_id).await;

    state.broadcaster.remove(peer_id);
    if let Err(error) = pump.await {
        debug!(?error, "outbound pump ended abnormally");
    }
    info!(peer = %peer, peer_id, "client disconnected");

    result
}

async fn run_session(
    state: &ServerState,
    connection: &ProtocolReadWriter,
    peer_id: PeerId,
) -> Result<()> {
    loop {
        match connection.read().await {
            Ok(envelope) => state.dispatch(envelope, peer_id),
            Err(StreamError::Eof | StreamError::Stopped) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    }
}

async fn pump_outbound(connection: Arc<ProtocolReadWriter>, mut outbound: mpsc::Receiver<Frame>) {
    while let Some(frame) = outbound.recv().await {
        if let Err(error) = connection.write_frame(frame).await {
            debug!(?error, "failed to deliver frame to client");
            break;
        }
    }
    match connection.close().await {
        Ok(()) | Err(StreamError::AlreadyClosed) => {}
        Err(error) => debug!(?error, "failed to close client connection"),
    }
}
