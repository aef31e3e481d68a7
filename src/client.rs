use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::{error, info, warn};
use tokio::{net::TcpStream, sync::Mutex, task::JoinSet};

use crate::{
    config::Config,
    error::{Error, Result},
    piece,
    protocol::PeerConnection,
    torrent::Torrent,
    tracker::{Peer, Tracker},
};

// connects to a single peer and performs only the handshake.
// returns the remote peer id.
pub async fn handshake(torrent: &Torrent, addr: SocketAddr, config: &Config) -> Result<[u8; 20]> {
    let mut session =
        PeerConnection::connect(addr, torrent.info_hash, config.peer_id, config.peer_timeout)
            .await?;
    let remote_id = session.handshake().await?;
    session.shutdown().await;
    Ok(remote_id)
}

// a worker owns at most one live session at a time and moves on to the
// next peer in the list whenever the current one fails it
struct Worker {
    torrent: Arc<Torrent>,
    config: Config,
    peers: Arc<Vec<Peer>>,
    next_peer: usize,
    session: Option<PeerConnection<TcpStream>>,
}

impl Worker {
    fn new(
        torrent: Arc<Torrent>,
        config: Config,
        peers: Arc<Vec<Peer>>,
        first_peer: usize,
    ) -> Worker {
        let next_peer = first_peer % peers.len().max(1);
        Worker {
            torrent,
            config,
            peers,
            next_peer,
            session: None,
        }
    }

    // handshake + bitfield/interested/unchoke against the current peer,
    // unless a ready session is already open
    async fn ensure_session(&mut self) -> Result<&mut PeerConnection<TcpStream>> {
        let session = match self.session.take() {
            Some(session) => session,
            None => {
                let peer = self.peers[self.next_peer];
                let mut session = PeerConnection::connect(
                    peer.addr(),
                    self.torrent.info_hash,
                    self.config.peer_id,
                    self.config.peer_timeout,
                )
                .await?;
                session.handshake().await?;
                session.prepare().await?;
                info!("session with {} ready", peer);
                session
            }
        };

        Ok(self.session.insert(session))
    }

    async fn try_fetch(&mut self, index: usize) -> Result<Vec<u8>> {
        let block_size = self.config.block_size;
        let depth = self.config.pipeline_depth;
        let torrent = Arc::clone(&self.torrent);
        let session = self.ensure_session().await?;
        piece::download_piece(session, &torrent, index, block_size, depth).await
    }

    // downloads one piece, trying each discovered peer at most once.
    // only connection level failures move on to another peer, a piece
    // that fails its hash check is final.
    async fn fetch(&mut self, index: usize) -> Result<Vec<u8>> {
        let mut last_error = Error::NoPeers;

        for _ in 0..self.peers.len() {
            match self.try_fetch(index).await {
                Ok(data) => return Ok(data),
                Err(e) if e.is_peer_failure() => {
                    let peer = self.peers[self.next_peer];
                    warn!("piece {}: peer {} failed ({}), trying next peer", index, peer, e);
                    self.session = None;
                    self.next_peer = (self.next_peer + 1) % self.peers.len();
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }

    async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.shutdown().await;
        }
    }
}

// drives a whole download: hands piece indices out to a fixed pool of
// workers and stitches the verified pieces back together in order
pub struct PieceManager {
    torrent: Arc<Torrent>,
    config: Config,
    peers: Arc<Vec<Peer>>,
}

impl PieceManager {
    // asks the tracker for peers once and keeps that list for the whole run
    pub async fn from_tracker(torrent: Torrent, config: Config) -> Result<PieceManager> {
        let peers = Tracker::new(&config).announce(&torrent).await?;
        PieceManager::with_peers(torrent, config, peers)
    }

    pub fn with_peers(torrent: Torrent, config: Config, peers: Vec<Peer>) -> Result<PieceManager> {
        if peers.is_empty() {
            return Err(Error::NoPeers);
        }

        Ok(PieceManager {
            torrent: Arc::new(torrent),
            config,
            peers: Arc::new(peers),
        })
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub async fn download_piece(&self, index: usize) -> Result<Vec<u8>> {
        self.torrent.piece_size(index)?;

        let mut worker = Worker::new(
            Arc::clone(&self.torrent),
            self.config.clone(),
            Arc::clone(&self.peers),
            0,
        );
        let result = worker.fetch(index).await;
        worker.close().await;
        result
    }

    // downloads every piece with at most max_concurrent_pieces in flight.
    // all workers are joined before anything is assembled, and the first
    // failure recorded fails the whole download.
    pub async fn download(&self) -> Result<Vec<u8>> {
        let total = self.torrent.num_pieces();
        let queue = Arc::new(Mutex::new((0..total).collect::<VecDeque<usize>>()));
        let failed = Arc::new(AtomicBool::new(false));
        let worker_count = self.config.max_concurrent_pieces.max(1).min(total);

        info!(
            "downloading {} pieces from {} peers with {} workers",
            total,
            self.peers.len(),
            worker_count
        );

        let mut workers = JoinSet::new();
        for id in 0..worker_count {
            let mut worker = Worker::new(
                Arc::clone(&self.torrent),
                self.config.clone(),
                Arc::clone(&self.peers),
                id,
            );
            let queue = Arc::clone(&queue);
            let failed = Arc::clone(&failed);

            workers.spawn(async move {
                let mut done = Vec::new();
                let outcome = loop {
                    if failed.load(Ordering::SeqCst) {
                        break Ok(());
                    }
                    let Some(index) = queue.lock().await.pop_front() else {
                        break Ok(());
                    };

                    match worker.fetch(index).await {
                        Ok(data) => {
                            info!("piece {} downloaded ({} bytes)", index, data.len());
                            done.push((index, data));
                        }
                        Err(e) => {
                            failed.store(true, Ordering::SeqCst);
                            break Err((index, e));
                        }
                    }
                };
                worker.close().await;
                outcome.map(|_| done)
            });
        }

        let mut pieces: Vec<Option<Vec<u8>>> = vec![None; total];
        let mut first_error = None;

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(done)) => {
                    for (index, data) in done {
                        pieces[index] = Some(data);
                    }
                }
                Ok(Err((index, e))) => {
                    error!("piece {} failed: {}", index, e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => {
                    error!("download worker crashed: {}", e);
                    if first_error.is_none() {
                        first_error = Some(Error::Io(std::io::Error::other(e)));
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        let mut output = Vec::with_capacity(self.torrent.length as usize);
        for (index, piece) in pieces.into_iter().enumerate() {
            let piece = piece.ok_or_else(|| {
                Error::InvalidState(format!("piece {} missing after download", index))
            })?;
            output.extend_from_slice(&piece);
        }

        info!("download finished, {} bytes", output.len());
        Ok(output)
    }
}
