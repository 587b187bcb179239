use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    io::ProtocolReadWriter,
    message::ChatMessage,
    protocol::ProtocolMessage,
    store::MessageStore,
    tree::MessageTree,
};

/// How far up the thread the terminal client looks for missing ancestors.
const THREAD_DEPTH: usize = 1024;

/// Receiving ends of the sinks a [`ClientSession`] feeds.
pub struct SessionChannels {
    /// Ids of messages the session wants fetched with QUERY envelopes.
    pub needed: mpsc::UnboundedReceiver<String>,
    /// Messages seen for the first time, ready to render.
    pub inbound: mpsc::UnboundedReceiver<ChatMessage>,
}

/// Client-side view of a server's conversation tree.
///
/// The session only learns about messages the server pushes or answers.
/// Whenever it notices a gap it emits the missing id on the `needed` sink;
/// turning those into QUERY envelopes is up to the caller.
pub struct ClientSession {
    tree: Arc<MessageTree>,
    username: String,
    root: Option<String>,
    needed: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedSender<ChatMessage>,
}

impl ClientSession {
    pub fn new(tree: Arc<MessageTree>, username: impl Into<String>) -> (Self, SessionChannels) {
        let (needed, needed_rx) = mpsc::unbounded_channel();
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let session = Self {
            tree,
            username: username.into(),
            root: None,
            needed,
            inbound,
        };
        (
            session,
            SessionChannels {
                needed: needed_rx,
                inbound: inbound_rx,
            },
        )
    }

    pub fn tree(&self) -> &Arc<MessageTree> {
        &self.tree
    }

    /// Root id announced by the server's WELCOME, once received.
    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    pub fn handle(&mut self, envelope: ProtocolMessage) {
        if !envelope.is_valid() {
            debug!(kind = %envelope.kind(), "ignoring invalid envelope");
            return;
        }

        match envelope {
            ProtocolMessage::Welcome { root, recent, .. } => {
                for id in std::iter::once(&root).chain(recent.iter()) {
                    if !self.tree.store().contains(id) {
                        self.request(id.clone());
                    }
                }
                self.root = Some(root);
            }
            ProtocolMessage::NewMessage(message) => {
                let seen = self.tree.store().contains(&message.id);
                match self.tree.add(message.clone()) {
                    Ok(()) if !seen => {
                        let _ = self.inbound.send(message);
                    }
                    Ok(()) => {}
                    Err(error) => warn!(%error, "discarding message from server"),
                }
            }
            ProtocolMessage::Meta(meta) => debug!(?meta, "server metadata"),
            ignored => debug!(kind = %ignored.kind(), "ignoring envelope"),
        }
    }

    /// Known thread ending at `leaf_id`, leaf first.
    ///
    /// If the walk stops at a missing ancestor, that id is emitted on the
    /// `needed` sink.
    pub fn thread(&self, leaf_id: &str, max_length: usize) -> Vec<ChatMessage> {
        let chain = self.tree.ancestor_chain(leaf_id, max_length);
        if let Some(id) = chain.needed {
            self.request(id);
        }
        chain.messages
    }

    /// Builds a new message from this session's user, ready to send.
    pub fn compose(&self, parent_id: &str, content: &str) -> ChatMessage {
        let mut message = ChatMessage::new(content);
        message.parent_id = parent_id.to_string();
        message.author = self.username.clone();
        message.assign_id();
        message
    }

    fn request(&self, id: String) {
        debug!(%id, "requesting message");
        let _ = self.needed.send(id);
    }
}

/// Line-oriented terminal client.
pub async fn run(args: ClientArgs) -> Result<()> {
    let stream = TcpStream::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    info!("connected to {}", args.server);

    let connection = Arc::new(ProtocolReadWriter::new(stream)?);
    let tree = Arc::new(MessageTree::new(Arc::new(MessageStore::new())));
    let (mut session, channels) = ClientSession::new(tree, args.username);
    let SessionChannels { needed, mut inbound } = channels;

    let mut envelopes = spawn_reader(Arc::clone(&connection));
    tokio::spawn(pump_queries(Arc::clone(&connection), needed));

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    let mut leaf: Option<String> = None;

    loop {
        select! {
            envelope = envelopes.recv() => {
                match envelope {
                    Some(envelope) => session.handle(envelope),
                    None => {
                        write_stdout("*** server closed the connection").await?;
                        break;
                    }
                }
            }
            Some(message) = inbound.recv() => {
                if leaf.is_none() || leaf.as_deref() == Some(message.parent_id.as_str()) {
                    leaf = Some(message.id.clone());
                }
                write_stdout(&format!("<{}> {}", message.author, message.content)).await?;
                if let Some(leaf) = &leaf {
                    session.thread(leaf, THREAD_DEPTH);
                }
            }
            bytes_read = stdin.read_line(&mut input) => {
                if bytes_read? == 0 {
                    break;
                }
                let keep_going =
                    handle_input(input.trim_end(), &mut session, &connection, &mut leaf).await?;
                input.clear();
                if !keep_going {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    if let Err(error) = connection.close().await {
        debug!(?error, "connection already closed");
    }
    Ok(())
}

async fn handle_input(
    text: &str,
    session: &mut ClientSession,
    connection: &ProtocolReadWriter,
    leaf: &mut Option<String>,
) -> Result<bool> {
    if text.is_empty() {
        return Ok(true);
    }
    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }
    if text.eq_ignore_ascii_case("/thread") {
        let Some(current) = leaf.as_deref() else {
            write_stdout("*** no messages yet").await?;
            return Ok(true);
        };
        for message in session.thread(current, THREAD_DEPTH).iter().rev() {
            write_stdout(&format!("<{}> {}", message.author, message.content)).await?;
        }
        return Ok(true);
    }

    let Some(parent) = leaf.clone().or_else(|| session.root().map(str::to_string)) else {
        write_stderr("!!! not welcomed by the server yet").await?;
        return Ok(true);
    };
    let message = session.compose(&parent, text);
    *leaf = Some(message.id.clone());
    let envelope = ProtocolMessage::NewMessage(message);
    connection.write(&envelope).await?;
    session.handle(envelope);
    Ok(true)
}

/// Forwards envelopes into a channel so the main loop can `select!` on them
/// without abandoning a half-finished read.
fn spawn_reader(connection: Arc<ProtocolReadWriter>) -> mpsc::Receiver<ProtocolMessage> {
    let (envelopes, inbox) = mpsc::channel(64);
    tokio::spawn(async move {
        loop {
            match connection.read().await {
                Ok(envelope) => {
                    if envelopes.send(envelope).await.is_err() {
                        break;
                    }
                }
                Err(error) => {
                    debug!(?error, "reader stopped");
                    break;
                }
            }
        }
    });
    inbox
}

async fn pump_queries(
    connection: Arc<ProtocolReadWriter>,
    mut needed: mpsc::UnboundedReceiver<String>,
) {
    while let Some(id) = needed.recv().await {
        if let Err(error) = connection.write(&ProtocolMessage::query(id)).await {
            warn!(?error, "failed to send query");
            if error.is_terminal() {
                break;
            }
        }
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (ClientSession, SessionChannels) {
        let tree = Arc::new(MessageTree::new(Arc::new(MessageStore::new())));
        ClientSession::new(tree, "alice")
    }

    fn message(id: &str, parent: &str) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            parent_id: parent.into(),
            content: format!("content of {id}"),
            author: "bob".into(),
            created_at: 1,
        }
    }

    fn drain(needed: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut ids = Vec::new();
        while let Ok(id) = needed.try_recv() {
            ids.push(id);
        }
        ids
    }

    #[test]
    fn welcome_requests_unknown_root_and_recent_ids() {
        let (mut session, mut channels) = session();
        session.tree().add(message("r2", "root")).unwrap();

        session.handle(ProtocolMessage::welcome("root", vec!["r1".into(), "r2".into()]));

        assert_eq!(session.root(), Some("root"));
        assert_eq!(drain(&mut channels.needed), vec!["root", "r1"]);
    }

    #[test]
    fn new_messages_reach_inbound_once() {
        let (mut session, mut channels) = session();
        let incoming = message("a", "");
        session.handle(ProtocolMessage::NewMessage(incoming.clone()));
        session.handle(ProtocolMessage::NewMessage(incoming.clone()));

        assert_eq!(channels.inbound.try_recv().ok(), Some(incoming));
        assert!(channels.inbound.try_recv().is_err());
        assert_eq!(session.tree().children(""), vec!["a".to_string()]);
    }

    #[test]
    fn thread_backfills_one_ancestor_at_a_time() {
        let (mut session, mut channels) = session();
        session.handle(ProtocolMessage::NewMessage(message("c", "b")));

        assert_eq!(session.thread("c", 10).len(), 1);
        assert_eq!(drain(&mut channels.needed), vec!["b"]);

        session.handle(ProtocolMessage::NewMessage(message("b", "a")));
        assert_eq!(session.thread("c", 10).len(), 2);
        assert_eq!(drain(&mut channels.needed), vec!["a"]);

        session.handle(ProtocolMessage::NewMessage(message("a", "")));
        assert_eq!(session.thread("c", 10).len(), 3);
        assert!(drain(&mut channels.needed).is_empty());
    }

    #[test]
    fn invalid_and_query_envelopes_are_ignored() {
        let (mut session, mut channels) = session();
        let mut invalid = message("x", "");
        invalid.content.clear();
        session.handle(ProtocolMessage::NewMessage(invalid));
        session.handle(ProtocolMessage::query("x"));
        session.handle(ProtocolMessage::Unknown { kind: 42 });

        assert!(session.tree().get("x").is_none());
        assert!(channels.inbound.try_recv().is_err());
        assert!(session.root().is_none());
    }

    #[test]
    fn compose_builds_a_sendable_reply() {
        let (session, _channels) = session();
        let reply = session.compose("parent", "hello there");
        assert_eq!(reply.parent_id, "parent");
        assert_eq!(reply.author, "alice");
        assert!(!reply.id.is_empty());
        assert!(ProtocolMessage::NewMessage(reply).is_valid());
    }
}
