//! # High-Level Node API
//!
//! [`FsNode`] is the entry point of the crate. It owns nothing but a command
//! channel into the dispatch actor, so it is cheap to clone and can be handed
//! to every transport session and client connection.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = FsNode::spawn(Keypair::generate(), FsConfig::default(), collaborators);
//!
//! // Peers come and go as the transport reports them.
//! node.peer_connected(peer).await?;
//! node.handle_peer_message(peer, bytes).await?;
//!
//! // Local clients search and receive results on their own channel.
//! let mut session = node.connect_client().await?;
//! node.start_search(session.id, search).await?;
//! while let Some(result) = session.results.recv().await {
//!     println!("got {} bytes", result.data.len());
//! }
//! ```

use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};

use crate::block::Key;
use crate::config::FsConfig;
use crate::context::Telemetry;
use crate::dispatch::{Collaborators, Command, FsActor};
use crate::identity::{Identity, Keypair, LocationClaim};
use crate::messages::{ClientRequest, ClientResponse, ClientResult, IndexStart, IndexedFile, LocSignResponse, StartSearch};
use crate::peers::PeerSnapshot;
use crate::pending::ClientId;

fn closed<T>(_: T) -> anyhow::Error {
    anyhow!("fs actor closed")
}

/// A connected local client and the channel its results arrive on.
#[derive(Debug)]
pub struct ClientSession {
    pub id: ClientId,
    pub results: mpsc::Receiver<ClientResult>,
}

/// Handle to a running routing node.
#[derive(Clone, Debug)]
pub struct FsNode {
    identity: Identity,
    cmd_tx: mpsc::Sender<Command>,
}

impl FsNode {
    /// Start the dispatch actor on the current runtime.
    pub fn spawn(keypair: Keypair, config: FsConfig, collaborators: Collaborators) -> Self {
        let identity = keypair.identity();
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_channel_capacity);
        let actor = FsActor::new(keypair, config, collaborators, cmd_tx.clone());
        tokio::spawn(actor.run(cmd_rx));
        Self { identity, cmd_tx }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).await.map_err(closed)?;
        rx.await.map_err(closed)
    }

    async fn notify(&self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(closed)
    }

    // =========================================================================
    // Clients
    // =========================================================================

    pub async fn connect_client(&self) -> Result<ClientSession> {
        let (id, results) = self.request(Command::ConnectClient).await?;
        Ok(ClientSession { id, results })
    }

    /// Cancels every request the client still has pending.
    pub async fn disconnect_client(&self, client: ClientId) -> Result<()> {
        self.notify(Command::DisconnectClient(client)).await
    }

    /// Start a search. Resolves once local processing of the search is over;
    /// results keep arriving on the client's channel afterwards.
    pub async fn start_search(&self, client: ClientId, search: StartSearch) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.notify(Command::StartSearch(client, search, tx)).await?;
        rx.await.map_err(|_| anyhow!("search rejected"))
    }

    pub async fn index_start(&self, request: IndexStart) -> Result<ClientResponse> {
        self.request(|tx| Command::IndexStart(request, tx)).await
    }

    pub async fn index_list(&self) -> Result<Vec<IndexedFile>> {
        match self.request(Command::IndexList).await? {
            ClientResponse::IndexList(files) => Ok(files),
            other => Err(anyhow!("unexpected response {other:?}")),
        }
    }

    pub async fn unindex(&self, file_id: Key) -> Result<()> {
        self.request(|tx| Command::Unindex(file_id, tx)).await.map(drop)
    }

    /// Sign a location claim with the node's key.
    pub async fn loc_sign(&self, claim: LocationClaim) -> Result<LocSignResponse> {
        let (tx, rx) = oneshot::channel();
        self.notify(Command::LocSign(claim, tx)).await?;
        match rx.await.map_err(|_| anyhow!("location claim rejected"))? {
            ClientResponse::LocSign(response) => Ok(response),
            other => Err(anyhow!("unexpected response {other:?}")),
        }
    }

    /// Route one decoded client message. Searches answer with `None`; their
    /// results arrive on the session channel.
    pub async fn handle_client(&self, client: ClientId, request: ClientRequest) -> Result<Option<ClientResponse>> {
        match request {
            ClientRequest::StartSearch(search) => self.start_search(client, search).await.map(|()| None),
            ClientRequest::IndexStart(request) => self.index_start(request).await.map(Some),
            ClientRequest::IndexList => self.index_list().await.map(|files| Some(ClientResponse::IndexList(files))),
            ClientRequest::Unindex { file_id } => self.unindex(file_id).await.map(|()| Some(ClientResponse::UnindexOk)),
            ClientRequest::LocSign(claim) => self.loc_sign(claim).await.map(|r| Some(ClientResponse::LocSign(r))),
        }
    }

    // =========================================================================
    // Peers
    // =========================================================================

    pub async fn peer_connected(&self, peer: Identity) -> Result<()> {
        self.request(|tx| Command::PeerConnected(peer, tx)).await??;
        Ok(())
    }

    pub async fn peer_disconnected(&self, peer: Identity) -> Result<()> {
        self.notify(Command::PeerDisconnected(peer)).await
    }

    /// Feed one message received from `from`. Returns an error wrapping a
    /// [`Violation`](crate::Violation) if the peer broke the protocol; the
    /// transport should then drop the session.
    pub async fn handle_peer_message(&self, from: Identity, bytes: Vec<u8>) -> Result<()> {
        self.request(|tx| Command::PeerMessage(from, bytes, tx)).await??;
        Ok(())
    }

    pub async fn latency_report(&self, peer: Identity, latency: Duration) -> Result<()> {
        self.notify(Command::LatencyReport(peer, latency)).await
    }

    // =========================================================================
    // Observability
    // =========================================================================

    pub async fn telemetry(&self) -> Result<Telemetry> {
        self.request(Command::Telemetry).await
    }

    pub async fn peers(&self) -> Result<Vec<PeerSnapshot>> {
        self.request(Command::Peers).await
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}
