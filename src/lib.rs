pub mod bencoding;
pub mod client;
pub mod config;
pub mod error;
pub mod piece;
pub mod protocol;
pub mod torrent;
pub mod tracker;

pub use {
    bencoding::{Bencode, BencodeError},
    client::PieceManager,
    config::Config,
    error::{Error, Result},
    torrent::Torrent,
    tracker::{Peer, Tracker},
};
