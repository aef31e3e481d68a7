use std::{fmt, net::{Ipv4Addr, SocketAddr, SocketAddrV4}};

use log::{debug, info};
use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use reqwest::Client;

use crate::{
    bencoding::{decoder, Bencode},
    config::Config,
    error::{Error, Result},
    torrent::Torrent,
};

const COMPACT_PEER_LEN: usize = 6;

// an announce reply is a small dict, anything past this is not a tracker
const MAX_RESPONSE_LEN: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Peer {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Peer {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl From<SocketAddrV4> for Peer {
    fn from(addr: SocketAddrV4) -> Self {
        Peer { ip: *addr.ip(), port: addr.port() }
    }
}

#[derive(Debug)]
pub struct TrackerResponse {
    pub interval: Option<i64>,
    pub complete: Option<i64>,
    pub incomplete: Option<i64>,
    pub peers: Vec<Peer>,
}

fn protocol_error(msg: impl Into<String>) -> Error {
    Error::TrackerProtocolError(msg.into())
}

// each peer is 6 bytes: 4 for the ipv4 address and 2 for the big endian port
pub fn parse_peers(data: &[u8]) -> Result<Vec<Peer>> {
    if data.len() % COMPACT_PEER_LEN != 0 {
        return Err(protocol_error(format!(
            "peers field length {} is not a multiple of 6",
            data.len()
        )));
    }

    Ok(data
        .chunks_exact(COMPACT_PEER_LEN)
        .map(|chunk| Peer {
            ip: Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]),
            port: u16::from_be_bytes([chunk[4], chunk[5]]),
        })
        .collect())
}

impl TrackerResponse {
    // parses the raw body the tracker sent back
    pub fn from_bytes(body: &[u8]) -> Result<TrackerResponse> {
        let bencode = decoder::decode_all(body)
            .map_err(|e| protocol_error(format!("response is not valid bencode: {}", e)))?;

        let dict = match bencode {
            Bencode::Dict(d) => d,
            _ => return Err(protocol_error("response is not a dictionary")),
        };

        // a tracker refusing the announce says why in "failure reason"
        if let Some(reason) = dict.get(&b"failure reason"[..]) {
            let reason = match reason {
                Bencode::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
                _ => "unknown failure".to_string(),
            };
            return Err(protocol_error(format!("tracker refused announce: {}", reason)));
        }

        let int_field = |key: &[u8]| match dict.get(key) {
            Some(Bencode::Int(i)) => Some(*i),
            _ => None,
        };

        let raw_peers = match dict.get(&b"peers"[..]) {
            Some(Bencode::Bytes(b)) => b,
            Some(_) => return Err(protocol_error("peers is not a compact byte string")),
            None => return Err(protocol_error("response has no peers")),
        };

        Ok(TrackerResponse {
            interval: int_field(b"interval"),
            complete: int_field(b"complete"),
            incomplete: int_field(b"incomplete"),
            peers: parse_peers(raw_peers)?,
        })
    }
}

pub struct Tracker {
    peer_id: [u8; 20],
    port: u16,
    http_client: Client,
    timeout: std::time::Duration,
}

impl Tracker {
    pub fn new(config: &Config) -> Tracker {
        Tracker {
            peer_id: config.peer_id,
            port: config.port,
            http_client: Client::new(),
            timeout: config.tracker_timeout,
        }
    }

    // builds the announce url. info_hash and peer_id are raw bytes, so they
    // get percent encoded rather than hex encoded.
    pub fn announce_url(&self, torrent: &Torrent) -> String {
        let separator = if torrent.announce.contains('?') { '&' } else { '?' };
        format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&left={}&compact=1",
            torrent.announce,
            separator,
            percent_encode(&torrent.info_hash, NON_ALPHANUMERIC),
            percent_encode(&self.peer_id, NON_ALPHANUMERIC),
            self.port,
            torrent.length,
        )
    }

    // a single announce. there is no retry, any failure is returned as is.
    pub async fn announce(&self, torrent: &Torrent) -> Result<Vec<Peer>> {
        let url = self.announce_url(torrent);
        debug!("announcing to {}", url);

        let mut res = self
            .http_client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(Error::TrackerUnreachable)?;

        let status = res.status();
        if !status.is_success() {
            return Err(protocol_error(format!("tracker answered with status {}", status)));
        }

        if res.content_length().is_some_and(|len| len > MAX_RESPONSE_LEN as u64) {
            return Err(protocol_error("tracker response is too large"));
        }

        let mut body = Vec::new();
        while let Some(chunk) = res.chunk().await.map_err(Error::TrackerUnreachable)? {
            if body.len() + chunk.len() > MAX_RESPONSE_LEN {
                return Err(protocol_error("tracker response is too large"));
            }
            body.extend_from_slice(&chunk);
        }
        let response = TrackerResponse::from_bytes(&body)?;

        info!(
            "tracker returned {} peers (interval: {:?}, seeders: {:?}, leechers: {:?})",
            response.peers.len(),
            response.interval,
            response.complete,
            response.incomplete
        );

        Ok(response.peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_peers() {
        let data = [
            192, 168, 1, 1, 0x1A, 0xE1, // 192.168.1.1:6881
            10, 0, 0, 1, 0x00, 0x50, // 10.0.0.1:80
        ];
        let peers = parse_peers(&data).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].to_string(), "192.168.1.1:6881");
        assert_eq!(peers[1], Peer { ip: Ipv4Addr::new(10, 0, 0, 1), port: 80 });
        assert!(parse_peers(&[]).unwrap().is_empty());
    }

    #[test]
    fn rejects_ragged_peer_string() {
        assert!(matches!(
            parse_peers(&[1, 2, 3, 4, 5, 6, 7]),
            Err(Error::TrackerProtocolError(_))
        ));
    }

    #[test]
    fn parses_response_body() {
        let body = b"d8:completei3e10:incompletei1e8:intervali60e5:peers6:\x7f\x00\x00\x01\x1a\xe1e";
        let response = TrackerResponse::from_bytes(body).unwrap();
        assert_eq!(response.interval, Some(60));
        assert_eq!(response.complete, Some(3));
        assert_eq!(response.incomplete, Some(1));
        assert_eq!(response.peers, vec![Peer { ip: Ipv4Addr::LOCALHOST, port: 6881 }]);
    }

    #[test]
    fn response_without_interval_is_fine() {
        let response = TrackerResponse::from_bytes(b"d5:peers0:e").unwrap();
        assert_eq!(response.interval, None);
        assert!(response.peers.is_empty());
    }

    #[test]
    fn bad_responses_are_protocol_errors() {
        let bodies: [&[u8]; 5] = [
            b"not bencode",
            b"li1ee",
            b"d8:intervali60ee",
            b"d5:peersli1eee",
            b"d5:peers5:abcdee",
        ];
        for body in bodies {
            assert!(
                matches!(TrackerResponse::from_bytes(body), Err(Error::TrackerProtocolError(_))),
                "{}",
                String::from_utf8_lossy(body)
            );
        }
    }

    #[test]
    fn deeply_nested_body_is_a_protocol_error() {
        let mut body = vec![b'l'; 50_000];
        body.extend(vec![b'e'; 50_000]);
        assert!(matches!(
            TrackerResponse::from_bytes(&body),
            Err(Error::TrackerProtocolError(_))
        ));
    }

    #[test]
    fn failure_reason_is_reported() {
        let err = TrackerResponse::from_bytes(b"d14:failure reason12:unregisterede").unwrap_err();
        assert!(err.to_string().contains("unregistered"));
    }

    #[test]
    fn announce_url_carries_raw_info_hash() {
        let mut config = Config::default();
        config.peer_id = *b"-RB0100-123456789012";
        let tracker = Tracker::new(&config);
        let mut info_hash = [0u8; 20];
        info_hash[0] = 0xd6;
        info_hash[1] = b'A';
        let torrent = Torrent {
            announce: "http://tracker.test/announce".to_string(),
            name: None,
            length: 1234,
            piece_length: 16,
            pieces: vec![],
            info_hash,
        };

        let url = tracker.announce_url(&torrent);
        assert!(url.starts_with("http://tracker.test/announce?info_hash=%D6A%00%00"));
        assert!(url.contains("&peer_id=%2DRB0100%2D123456789012"));
        assert!(url.contains("&port=6881&uploaded=0&downloaded=0&left=1234&compact=1"));
    }

    // answers a single request with a body of body_len bytes, without
    // announcing its length up front
    async fn serve_once(body_len: usize) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let head = "HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n";
            let _ = stream.write_all(head.as_bytes()).await;
            let _ = stream.write_all(&vec![b'l'; body_len]).await;
            let _ = stream.shutdown().await;
        });
        format!("http://{}/announce", addr)
    }

    #[tokio::test]
    async fn oversized_response_is_refused() {
        let torrent = Torrent {
            announce: serve_once(MAX_RESPONSE_LEN + 4096).await,
            name: None,
            length: 1,
            piece_length: 1,
            pieces: vec![[0; 20]],
            info_hash: [0; 20],
        };
        let err = Tracker::new(&Config::default()).announce(&torrent).await.unwrap_err();
        assert!(err.to_string().contains("too large"), "{}", err);
    }

    #[tokio::test]
    async fn unreachable_tracker() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let tracker = Tracker::new(&Config::default());
        let torrent = Torrent {
            announce: format!("http://{}/announce", addr),
            name: None,
            length: 1,
            piece_length: 1,
            pieces: vec![[0; 20]],
            info_hash: [0; 20],
        };
        assert!(matches!(
            tracker.announce(&torrent).await,
            Err(Error::TrackerUnreachable(_))
        ));
    }
}
