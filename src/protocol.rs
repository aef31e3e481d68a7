use std::{future::Future, net::SocketAddr, time::Duration};

use log::debug;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

use crate::error::{Error, Result};

pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

// largest frame we are willing to buffer. a piece message carries one block
// plus 9 bytes of header, a bitfield needs one bit per piece.
const MAX_MESSAGE_LEN: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl MessageType {
    pub fn name(self) -> &'static str {
        match self {
            MessageType::Choke => "choke",
            MessageType::Unchoke => "unchoke",
            MessageType::Interested => "interested",
            MessageType::NotInterested => "not interested",
            MessageType::Have => "have",
            MessageType::Bitfield => "bitfield",
            MessageType::Request => "request",
            MessageType::Piece => "piece",
            MessageType::Cancel => "cancel",
            MessageType::Port => "port",
        }
    }
}

// one post-handshake frame. keep-alives never become a Message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: u8,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageType, payload: Vec<u8>) -> Message {
        Message { id: kind as u8, payload }
    }

    pub fn request(index: u32, begin: u32, length: u32) -> Message {
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&index.to_be_bytes());
        payload.extend_from_slice(&begin.to_be_bytes());
        payload.extend_from_slice(&length.to_be_bytes());
        Message::new(MessageType::Request, payload)
    }

    // length prefix covers the id byte and the payload
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + self.payload.len());
        buf.extend_from_slice(&(self.payload.len() as u32 + 1).to_be_bytes());
        buf.push(self.id);
        buf.extend_from_slice(&self.payload);
        buf
    }

    fn expect_kind(self, kind: MessageType) -> Result<Message> {
        if self.id != kind as u8 {
            return Err(Error::UnexpectedMessage { expected: kind.name(), got: self.id });
        }
        Ok(self)
    }
}

// a block carried by a piece message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockData {
    pub index: u32,
    pub begin: u32,
    pub data: Vec<u8>,
}

impl BlockData {
    pub fn from_payload(mut payload: Vec<u8>) -> Result<BlockData> {
        if payload.len() < 8 {
            return Err(Error::InvalidMessage(format!(
                "piece payload of {} bytes is too short",
                payload.len()
            )));
        }
        let index = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let begin = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
        let data = payload.split_off(8);
        Ok(BlockData { index, begin, data })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Handshaking,
    AwaitingBitfield,
    Interested,
    AwaitingUnchoke,
    Ready,
    RequestSent,
    AwaitingBlock,
    Closed,
}

pub fn build_handshake(info_hash: &[u8; 20], peer_id: &[u8; 20]) -> [u8; HANDSHAKE_LEN] {
    let mut buf = [0u8; HANDSHAKE_LEN];
    buf[0] = PROTOCOL.len() as u8;
    buf[1..20].copy_from_slice(PROTOCOL);
    // bytes 20..28 are the reserved extension bits, all left at zero
    buf[28..48].copy_from_slice(info_hash);
    buf[48..68].copy_from_slice(peer_id);
    buf
}

// a session with one remote peer over one byte stream.
// every read and write is bounded by the timeout and turns into
// PeerTimeout when it expires.
pub struct PeerConnection<S> {
    stream: S,
    state: SessionState,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    remote_id: Option<[u8; 20]>,
    timeout: Duration,
}

impl PeerConnection<TcpStream> {
    pub async fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        io_timeout: Duration,
    ) -> Result<Self> {
        let stream = timeout(io_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::PeerTimeout)??;
        debug!("connected to {}", addr);
        Ok(PeerConnection::new(stream, info_hash, peer_id, io_timeout))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> PeerConnection<S> {
    pub fn new(stream: S, info_hash: [u8; 20], peer_id: [u8; 20], io_timeout: Duration) -> Self {
        PeerConnection {
            stream,
            state: SessionState::Disconnected,
            info_hash,
            peer_id,
            remote_id: None,
            timeout: io_timeout,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn remote_id(&self) -> Option<[u8; 20]> {
        self.remote_id
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        bounded(self.timeout, self.stream.write_all(bytes)).await
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        bounded(self.timeout, self.stream.read_exact(buf)).await?;
        Ok(())
    }

    // sends our 68 byte handshake and reads the peer's. returns the remote
    // peer id taken from the last 20 bytes.
    pub async fn handshake(&mut self) -> Result<[u8; 20]> {
        self.state = SessionState::Handshaking;

        let ours = build_handshake(&self.info_hash, &self.peer_id);
        self.write_all(&ours).await?;

        let mut theirs = [0u8; HANDSHAKE_LEN];
        self.read_exact(&mut theirs).await?;

        if theirs[0] as usize != PROTOCOL.len() || &theirs[1..20] != PROTOCOL {
            self.state = SessionState::Closed;
            return Err(Error::HandshakeFailed(format!(
                "unexpected protocol name {:?}",
                String::from_utf8_lossy(&theirs[1..20])
            )));
        }

        let mut remote_id = [0u8; 20];
        remote_id.copy_from_slice(&theirs[48..68]);
        self.remote_id = Some(remote_id);
        self.state = SessionState::AwaitingBitfield;

        debug!("handshake complete, remote peer id {}", hex::encode(remote_id));
        Ok(remote_id)
    }

    pub async fn send_message(&mut self, message: &Message) -> Result<()> {
        self.write_all(&message.encode()).await
    }

    // reads one frame. Ok(None) is a keep-alive.
    pub async fn read_message(&mut self) -> Result<Option<Message>> {
        let mut len_buf = [0u8; 4];
        self.read_exact(&mut len_buf).await?;
        let length = u32::from_be_bytes(len_buf) as usize;

        if length == 0 {
            debug!("received keep-alive");
            return Ok(None);
        }

        if length > MAX_MESSAGE_LEN {
            return Err(Error::InvalidMessage(format!("message of {} bytes is too large", length)));
        }

        let mut body = vec![0u8; length];
        self.read_exact(&mut body).await?;
        let payload = body.split_off(1);

        Ok(Some(Message { id: body[0], payload }))
    }

    // next real message, skipping any keep-alives in front of it
    pub async fn next_message(&mut self) -> Result<Message> {
        loop {
            if let Some(message) = self.read_message().await? {
                return Ok(message);
            }
        }
    }

    async fn expect_message(&mut self, kind: MessageType) -> Result<Message> {
        match self.next_message().await?.expect_kind(kind) {
            Ok(message) => Ok(message),
            Err(e) => {
                self.state = SessionState::Closed;
                Err(e)
            }
        }
    }

    // bitfield, interested, unchoke. after this the peer accepts requests.
    pub async fn prepare(&mut self) -> Result<()> {
        if self.state != SessionState::AwaitingBitfield {
            return Err(Error::InvalidState(format!(
                "session is {:?}, not awaiting bitfield",
                self.state
            )));
        }

        let bitfield = self.expect_message(MessageType::Bitfield).await?;
        debug!("received bitfield of {} bytes", bitfield.payload.len());

        self.state = SessionState::Interested;
        self.send_message(&Message::new(MessageType::Interested, Vec::new()))
            .await?;

        self.state = SessionState::AwaitingUnchoke;
        self.expect_message(MessageType::Unchoke).await?;

        self.state = SessionState::Ready;
        Ok(())
    }

    pub async fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        self.send_message(&Message::request(index, begin, length)).await?;
        self.state = SessionState::RequestSent;
        Ok(())
    }

    pub async fn receive_block(&mut self) -> Result<BlockData> {
        self.state = SessionState::AwaitingBlock;
        let message = self.expect_message(MessageType::Piece).await?;
        let block = BlockData::from_payload(message.payload)?;
        self.state = SessionState::Ready;
        Ok(block)
    }

    // one request/response round for a single block
    pub async fn request_block(&mut self, index: u32, begin: u32, length: u32) -> Result<BlockData> {
        self.send_request(index, begin, length).await?;
        self.receive_block().await
    }

    pub async fn shutdown(&mut self) {
        if let Err(e) = bounded(self.timeout, self.stream.shutdown()).await {
            debug!("error while closing session: {}", e);
        }
        self.state = SessionState::Closed;
    }
}

async fn bounded<T>(dur: Duration, fut: impl Future<Output = std::io::Result<T>>) -> Result<T> {
    match timeout(dur, fut).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(Error::PeerTimeout),
    }
}
