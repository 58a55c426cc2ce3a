//! Peer gossip: block broadcast and chain exchange over WebSockets.
//!
//! Each node accepts long-lived bidirectional connections on its gossip
//! port and dials every configured peer, reconnecting with a fixed
//! backoff. On connection open (either direction) a node sends its full
//! chain in one `CHAIN` message; afterwards two message kinds flow:
//!
//! - `CHAIN {chain}`: the recipient re-validates the candidate and, if it
//!   is strictly longer than the local chain, replaces it atomically.
//! - `BLOCK {block}`: the recipient validates the block and appends it;
//!   a fresh insert is re-broadcast to all connected sockets.
//!
//! There is no ordering across connections; convergence relies on the
//! `CHAIN` exchange on (re)connect. Gossip failures close the affected
//! socket and remove it from the peer set, never touching local state.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};
use tracing::{debug, info, warn};

use crate::crypto;
use crate::store::{AppendOutcome, LedgerStore, ReplaceOutcome, StoreError};
use crate::types::{Block, BlockDraft, CreatorId};
use crate::validation::{self, validate_chain};

/// Delay between reconnect attempts to a configured peer.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// The framed JSON messages exchanged between peers.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PeerMessage {
    #[serde(rename = "CHAIN")]
    Chain { chain: Vec<Block> },
    #[serde(rename = "BLOCK")]
    Block { block: Block },
}

/// Gossip-level error type.
#[derive(Debug)]
pub enum GossipError {
    Io(String),
    Protocol(String),
    Store(StoreError),
}

impl fmt::Display for GossipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GossipError::Io(msg) => write!(f, "gossip I/O error: {msg}"),
            GossipError::Protocol(msg) => write!(f, "gossip protocol error: {msg}"),
            GossipError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for GossipError {}

impl From<StoreError> for GossipError {
    fn from(e: StoreError) -> Self {
        GossipError::Store(e)
    }
}

/// Peer gossip instance: one per node, shared with the HTTP layer.
pub struct PeerGossip<S> {
    store: Arc<S>,
    /// Connected sockets by connection id; broadcasts snapshot this map.
    peers: Mutex<HashMap<u64, mpsc::UnboundedSender<Message>>>,
    next_conn_id: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S> PeerGossip<S>
where
    S: LedgerStore,
{
    pub fn new(store: Arc<S>) -> Arc<Self> {
        Arc::new(Self {
            store,
            peers: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Binds the gossip listener and dials the configured peers.
    ///
    /// Returns the bound address (useful with port 0 in tests).
    pub async fn start(
        self: &Arc<Self>,
        listen_port: u16,
        peers: &[String],
    ) -> Result<SocketAddr, GossipError> {
        let listener = TcpListener::bind(("0.0.0.0", listen_port))
            .await
            .map_err(|e| GossipError::Io(format!("failed to bind gossip port {listen_port}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| GossipError::Io(e.to_string()))?;
        info!(%local_addr, "gossip listening");

        let acceptor = {
            let gossip = self.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer_addr)) => {
                            debug!(%peer_addr, "inbound gossip connection");
                            let gossip_for_task = gossip.clone();
                            let conn = tokio::spawn(async move {
                                match accept_async(stream).await {
                                    Ok(ws) => gossip_for_task.clone().run_socket(ws).await,
                                    Err(e) => warn!(%peer_addr, "websocket handshake failed: {e}"),
                                }
                            });
                            gossip.tasks.lock().expect("task list poisoned").push(conn);
                        }
                        Err(e) => {
                            warn!("gossip accept failed: {e}");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            })
        };
        self.tasks.lock().expect("task list poisoned").push(acceptor);

        for peer in peers {
            let gossip = self.clone();
            let endpoint = peer.clone();
            let dialer = tokio::spawn(async move {
                loop {
                    match connect_async(endpoint.as_str()).await {
                        Ok((ws, _)) => {
                            info!(peer = %endpoint, "connected to peer");
                            gossip.clone().run_socket(ws).await;
                            info!(peer = %endpoint, "peer connection closed");
                        }
                        Err(e) => debug!(peer = %endpoint, "peer dial failed: {e}"),
                    }
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            });
            self.tasks.lock().expect("task list poisoned").push(dialer);
        }

        Ok(local_addr)
    }

    /// Number of currently connected sockets.
    pub fn peer_count(&self) -> usize {
        self.peers.lock().expect("peer set poisoned").len()
    }

    /// Broadcasts a freshly appended block to every connected socket.
    ///
    /// Best-effort: sockets that refuse the message are dropped from the
    /// peer set.
    pub fn broadcast_block(&self, block: &Block) {
        let msg = PeerMessage::Block {
            block: block.clone(),
        };
        self.broadcast(&msg);
    }

    /// Closes all sockets and stops the background tasks.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().expect("task list poisoned").drain(..) {
            task.abort();
        }
        self.peers.lock().expect("peer set poisoned").clear();
        info!("gossip shut down");
    }

    fn broadcast(&self, msg: &PeerMessage) {
        let text = match serde_json::to_string(msg) {
            Ok(text) => text,
            Err(e) => {
                warn!("failed to encode gossip message: {e}");
                return;
            }
        };

        let mut peers = self.peers.lock().expect("peer set poisoned");
        peers.retain(|conn_id, tx| {
            let alive = tx.send(Message::Text(text.clone())).is_ok();
            if !alive {
                debug!(conn_id, "dropping dead gossip socket");
            }
            alive
        });
    }

    /// Drives one WebSocket connection: registers it, sends the full
    /// chain, then processes inbound messages until the socket closes.
    async fn run_socket<T>(self: Arc<Self>, ws: WebSocketStream<T>)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.peers.lock().expect("peer set poisoned").insert(conn_id, tx.clone());

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        // Full chain exchange on connection open.
        match self.store.load_chain().await {
            Ok(chain) => {
                let msg = PeerMessage::Chain { chain };
                match serde_json::to_string(&msg) {
                    Ok(text) => {
                        let _ = tx.send(Message::Text(text));
                    }
                    Err(e) => warn!(conn_id, "failed to encode chain message: {e}"),
                }
            }
            Err(e) => warn!(conn_id, "failed to load chain for handshake: {e}"),
        }

        while let Some(frame) = stream.next().await {
            let raw = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!(conn_id, "non-UTF-8 gossip frame dropped");
                        continue;
                    }
                },
                Ok(Message::Close(_)) | Err(_) => break,
                // Ping/pong and partial frames are transport noise.
                Ok(_) => continue,
            };

            if let Err(e) = self.handle_message(&raw).await {
                warn!(conn_id, "gossip message failed: {e}");
            }
        }

        self.peers.lock().expect("peer set poisoned").remove(&conn_id);
        writer.abort();
        debug!(conn_id, "gossip socket closed");
    }

    /// Parses and applies one inbound gossip message.
    async fn handle_message(self: &Arc<Self>, raw: &str) -> Result<(), GossipError> {
        let msg: PeerMessage = serde_json::from_str(raw)
            .map_err(|e| GossipError::Protocol(format!("unparsable message: {e}")))?;

        match msg {
            PeerMessage::Chain { chain } => self.handle_chain(chain).await,
            PeerMessage::Block { block } => self.handle_block(block).await,
        }
    }

    /// Longest-chain rule: a strictly longer, fully valid candidate
    /// replaces the local chain; everything else is ignored.
    async fn handle_chain(&self, candidate: Vec<Block>) -> Result<(), GossipError> {
        let local_len = self.store.block_count().await?;
        if candidate.len() as u64 <= local_len {
            debug!(
                candidate = candidate.len(),
                local = local_len,
                "ignoring chain that is not longer"
            );
            return Ok(());
        }

        let keys = self.creator_keys(&candidate).await?;
        if let Err(e) = validate_chain(&candidate, &keys) {
            return Err(GossipError::Protocol(format!("rejected candidate chain: {e}")));
        }

        match self.store.replace_chain(candidate).await? {
            ReplaceOutcome::Accepted => {
                info!("local chain replaced by longer peer chain");
                Ok(())
            }
            ReplaceOutcome::Rejected(reason) => {
                // Lost a race against a concurrent append; the next CHAIN
                // exchange settles it.
                debug!("chain replacement rejected: {reason}");
                Ok(())
            }
        }
    }

    /// Validates and appends one gossiped block, re-broadcasting fresh
    /// inserts.
    async fn handle_block(self: &Arc<Self>, block: Block) -> Result<(), GossipError> {
        validation::check_hash(&block.block_hash, &block.canonical_hash_input())
            .map_err(|e| GossipError::Protocol(e.to_string()))?;
        validation::check_pow(&block.block_hash, block.difficulty)
            .map_err(|e| GossipError::Protocol(e.to_string()))?;

        let key = match block.creator_id {
            Some(id) => self.lookup_key(id).await?,
            None => None,
        };
        validation::check_shape(
            &block.encrypted_data,
            &block.data_iv,
            &block.encrypted_data_key,
            block.data_size,
            key.as_ref().map(crypto::key_size_bytes),
        )
        .map_err(|e| GossipError::Protocol(e.to_string()))?;
        if let Some(key) = &key {
            validation::check_signature(key, &block.block_hash, &block.signature)
                .map_err(|e| GossipError::Protocol(e.to_string()))?;
        }

        match self.store.append_block(BlockDraft::from(block)).await? {
            AppendOutcome::Inserted(inserted) => {
                debug!(block_number = inserted.block_number, "gossiped block appended");
                self.broadcast_block(&inserted);
                Ok(())
            }
            AppendOutcome::Duplicate(_) => {
                // Already known; do not re-broadcast or the cluster loops.
                Ok(())
            }
            AppendOutcome::Rejected(constraint) => {
                // Fork or out-of-order delivery; the CHAIN exchange on the
                // next reconnect converges the peers.
                debug!("gossiped block rejected: {constraint}");
                Ok(())
            }
        }
    }

    async fn lookup_key(&self, id: CreatorId) -> Result<Option<RsaPublicKey>, GossipError> {
        match self.store.creator_by_id(id).await? {
            None => Ok(None),
            Some(creator) => crypto::parse_public_key_pem(&creator.public_key_pem)
                .map(Some)
                .map_err(|e| GossipError::Protocol(format!("creator key unusable: {e}"))),
        }
    }

    /// Public keys of the locally registered creators referenced by a
    /// candidate chain; unknown creators are simply absent.
    async fn creator_keys(
        &self,
        blocks: &[Block],
    ) -> Result<HashMap<CreatorId, RsaPublicKey>, GossipError> {
        let mut keys = HashMap::new();
        for id in blocks.iter().filter_map(|b| b.creator_id) {
            if keys.contains_key(&id) {
                continue;
            }
            if let Some(key) = self.lookup_key(id).await? {
                keys.insert(id, key);
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::client::seal_and_mine;
    use crate::crypto::testkeys;
    use crate::store::MemLedgerStore;
    use crate::types::NewCreator;
    use chrono::Utc;

    async fn store_with_chain(len: usize) -> Arc<MemLedgerStore> {
        let store = Arc::new(MemLedgerStore::new());
        let creator = store
            .create_creator(NewCreator {
                display_name: "alice".to_string(),
                public_key_pem: testkeys::public_key_pem(),
            })
            .await
            .expect("register creator");

        let (private, public) = testkeys::keypair();
        for i in 0..len {
            let previous = store.latest_block().await.map(|b| b.block_hash);
            let draft = seal_and_mine(
                format!("record {i}").as_bytes(),
                creator.creator_id,
                public,
                private,
                previous,
                1,
                Utc::now(),
            )
            .expect("mine");
            store.append_block(draft).await.expect("append");
        }
        store
    }

    async fn wait_until<F, Fut>(mut probe: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if probe().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not reached within 5s");
    }

    #[test]
    fn peer_messages_use_the_wire_tags() {
        let chain = PeerMessage::Chain { chain: Vec::new() };
        let json = serde_json::to_string(&chain).unwrap();
        assert!(json.contains("\"type\":\"CHAIN\""));
        assert!(json.contains("\"chain\":[]"));

        let parsed: PeerMessage = serde_json::from_str(r#"{"type":"CHAIN","chain":[]}"#).unwrap();
        assert!(matches!(parsed, PeerMessage::Chain { chain } if chain.is_empty()));

        assert!(serde_json::from_str::<PeerMessage>(r#"{"type":"NOISE"}"#).is_err());
    }

    #[tokio::test]
    async fn shorter_or_equal_chains_are_ignored() {
        let store = store_with_chain(2).await;
        let gossip = PeerGossip::new(store.clone());

        let equal = store.load_chain().await.unwrap();
        let msg = serde_json::to_string(&PeerMessage::Chain { chain: equal }).unwrap();
        gossip.handle_message(&msg).await.expect("handled");
        assert_eq!(store.block_count().await.unwrap(), 2);

        let shorter = vec![store.load_chain().await.unwrap().remove(0)];
        let msg = serde_json::to_string(&PeerMessage::Chain { chain: shorter }).unwrap();
        gossip.handle_message(&msg).await.expect("handled");
        assert_eq!(store.block_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn longer_valid_chain_replaces_local() {
        let local = store_with_chain(1).await;
        let remote = store_with_chain(3).await;
        let gossip = PeerGossip::new(local.clone());

        let candidate = remote.load_chain().await.unwrap();
        let tip_hash = candidate.last().unwrap().block_hash.clone();
        let msg = serde_json::to_string(&PeerMessage::Chain { chain: candidate }).unwrap();
        gossip.handle_message(&msg).await.expect("handled");

        assert_eq!(local.block_count().await.unwrap(), 3);
        assert_eq!(local.latest_block().await.unwrap().block_hash, tip_hash);
    }

    #[tokio::test]
    async fn longer_forged_chain_is_rejected() {
        let local = store_with_chain(1).await;
        let remote = store_with_chain(3).await;
        let gossip = PeerGossip::new(local.clone());

        let mut candidate = remote.load_chain().await.unwrap();
        candidate[2].block_hash = crate::types::BlockHash::from(
            "0000000000000000000000000000000000000000000000000000000000001234",
        );
        let msg = serde_json::to_string(&PeerMessage::Chain { chain: candidate }).unwrap();

        assert!(gossip.handle_message(&msg).await.is_err());
        assert_eq!(local.block_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn gossiped_block_appends_when_it_extends_the_tip() {
        let local = store_with_chain(1).await;
        let gossip = PeerGossip::new(local.clone());

        // A remote node with the same genesis mines block 2.
        let remote = Arc::new(MemLedgerStore::new());
        let chain = local.load_chain().await.unwrap();
        remote.replace_chain(chain).await.expect("seed remote");
        let remote_store = store_extend(&remote).await;

        let msg = serde_json::to_string(&PeerMessage::Block {
            block: remote_store.clone(),
        })
        .unwrap();
        gossip.handle_message(&msg).await.expect("handled");

        assert_eq!(local.block_count().await.unwrap(), 2);
        assert_eq!(local.latest_block().await.unwrap().block_hash, remote_store.block_hash);
    }

    /// Mines one more block on top of a store's tip and returns it.
    async fn store_extend(store: &Arc<MemLedgerStore>) -> Block {
        let (private, public) = testkeys::keypair();
        let previous = store.latest_block().await.map(|b| b.block_hash);
        let draft = seal_and_mine(
            b"extension",
            crate::types::CreatorId::generate(),
            public,
            private,
            previous,
            1,
            Utc::now(),
        )
        .expect("mine");
        match store.append_block(draft).await.expect("append") {
            AppendOutcome::Inserted(b) => b,
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tampered_gossiped_block_is_rejected() {
        let local = store_with_chain(1).await;
        let gossip = PeerGossip::new(local.clone());

        let remote = Arc::new(MemLedgerStore::new());
        remote
            .replace_chain(local.load_chain().await.unwrap())
            .await
            .expect("seed remote");
        let mut block = store_extend(&remote).await;
        block.nonce += 1;

        let msg = serde_json::to_string(&PeerMessage::Block { block }).unwrap();
        assert!(gossip.handle_message(&msg).await.is_err());
        assert_eq!(local.block_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn nodes_converge_over_real_sockets() {
        // Node A holds a 2-block chain; node B starts empty and dials A.
        let store_a = store_with_chain(2).await;
        let store_b = Arc::new(MemLedgerStore::new());

        let gossip_a = PeerGossip::new(store_a.clone());
        let addr_a = gossip_a.start(0, &[]).await.expect("start node a");

        let gossip_b = PeerGossip::new(store_b.clone());
        let peer_url = format!("ws://127.0.0.1:{}", addr_a.port());
        gossip_b.start(0, &[peer_url]).await.expect("start node b");

        // The CHAIN handshake replaces B's empty chain.
        wait_until(|| {
            let store_b = store_b.clone();
            async move { store_b.block_count().await.unwrap() == 2 }
        })
        .await;

        // A block broadcast from A reaches B.
        let block = store_extend(&store_a).await;
        gossip_a.broadcast_block(&block);
        wait_until(|| {
            let store_b = store_b.clone();
            async move { store_b.block_count().await.unwrap() == 3 }
        })
        .await;
        assert_eq!(
            store_b.latest_block().await.unwrap().block_hash,
            block.block_hash
        );

        assert!(gossip_a.peer_count() >= 1);
        assert!(gossip_b.peer_count() >= 1);

        gossip_a.shutdown();
        gossip_b.shutdown();
        assert_eq!(gossip_a.peer_count(), 0);
    }
}
