use std::collections::VecDeque;

use log::debug;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    error::{Error, Result},
    protocol::{BlockData, PeerConnection},
    torrent::Torrent,
};

// a block is the smallest unit requested from a peer.
// offset and length locate it inside its piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub offset: u32,
    pub length: u32,
}

// one piece of the torrent, split into blocks of block_size bytes.
// only the last block may be shorter.
#[derive(Debug, Clone)]
pub struct Piece {
    pub index: usize,
    pub length: u32,
    pub hash: [u8; 20],
    blocks: Vec<Block>,
}

impl Piece {
    pub fn new(torrent: &Torrent, index: usize, block_size: u32) -> Result<Piece> {
        let size = torrent.piece_size(index)?;
        let length = u32::try_from(size).map_err(|_| {
            Error::InvalidTorrentDescriptor(format!("piece length {} does not fit in 32 bits", size))
        })?;
        let block_size = block_size.max(1);

        let blocks = (0..length)
            .step_by(block_size as usize)
            .map(|offset| Block {
                offset,
                length: block_size.min(length - offset),
            })
            .collect();

        Ok(Piece {
            index,
            length,
            hash: torrent.pieces[index],
            blocks,
        })
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    // check the reassembled buffer against the hash from the metainfo
    pub fn is_hash_matching(&self, data: &[u8]) -> bool {
        let calculated: [u8; 20] = Sha1::digest(data).into();
        calculated == self.hash
    }
}

// piece buffer being filled in place. blocks may arrive in any order since
// every response carries its own offset.
struct PieceBuffer<'a> {
    piece: &'a Piece,
    data: Vec<u8>,
    received: Vec<bool>,
    outstanding: Vec<bool>,
}

impl<'a> PieceBuffer<'a> {
    fn new(piece: &'a Piece) -> Self {
        PieceBuffer {
            piece,
            data: vec![0; piece.length as usize],
            received: vec![false; piece.blocks.len()],
            outstanding: vec![false; piece.blocks.len()],
        }
    }

    fn mark_requested(&mut self, slot: usize) {
        self.outstanding[slot] = true;
    }

    // copy a block in at its offset, refusing anything we did not ask for
    fn block_received(&mut self, block: BlockData) -> Result<()> {
        if block.index as usize != self.piece.index {
            return Err(Error::InvalidMessage(format!(
                "got block for piece {} while downloading piece {}",
                block.index, self.piece.index
            )));
        }

        let slot = self
            .piece
            .blocks
            .iter()
            .position(|b| b.offset == block.begin)
            .filter(|&slot| self.outstanding[slot])
            .ok_or_else(|| {
                Error::InvalidMessage(format!("unrequested block at offset {}", block.begin))
            })?;

        let expected = self.piece.blocks[slot];
        if block.data.len() != expected.length as usize {
            return Err(Error::InvalidMessage(format!(
                "block at offset {} has {} bytes, expected {}",
                block.begin,
                block.data.len(),
                expected.length
            )));
        }

        let start = expected.offset as usize;
        self.data[start..start + block.data.len()].copy_from_slice(&block.data);
        self.outstanding[slot] = false;
        self.received[slot] = true;
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.received.iter().all(|&r| r)
    }
}

// downloads a single piece over a session that has already been prepared.
// at most pipeline_depth requests are in flight at once, a depth of 1
// requests blocks strictly one after another.
pub async fn download_piece<S>(
    session: &mut PeerConnection<S>,
    torrent: &Torrent,
    index: usize,
    block_size: u32,
    pipeline_depth: usize,
) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let piece = Piece::new(torrent, index, block_size)?;
    let mut buffer = PieceBuffer::new(&piece);
    let mut pending: VecDeque<usize> = (0..piece.blocks.len()).collect();
    let mut in_flight = 0;
    let depth = pipeline_depth.max(1);

    while !buffer.is_complete() {
        while in_flight < depth {
            let Some(slot) = pending.pop_front() else { break };
            let block = piece.blocks[slot];
            session
                .send_request(index as u32, block.offset, block.length)
                .await?;
            buffer.mark_requested(slot);
            in_flight += 1;
        }

        let block = session.receive_block().await?;
        debug!(
            "piece {}: received {} bytes at offset {}",
            index,
            block.data.len(),
            block.begin
        );
        buffer.block_received(block)?;
        in_flight -= 1;
    }

    if !piece.is_hash_matching(&buffer.data) {
        return Err(Error::PieceHashMismatch { index });
    }

    Ok(buffer.data)
}
