use std::path::Path;

use sha1::{Digest, Sha1};

use crate::bencoding::{decoder, encoder, Bencode};
use crate::error::{Error, Result};

pub const HASH_LEN: usize = 20;

// metainfo for a single file torrent.
// built once from the descriptor bytes and never changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Torrent {
    pub announce: String,
    pub name: Option<String>,
    pub length: u64,
    pub piece_length: u64,
    pub pieces: Vec<[u8; HASH_LEN]>,
    pub info_hash: [u8; HASH_LEN],
}

// get the sha1 hash of the bencode of the info dict.
// the decoder only accepts sorted keys and canonical integers, so
// re-encoding the decoded value reproduces the original bytes.
pub fn get_sha1_info_hash(info: &Bencode) -> [u8; HASH_LEN] {
    let encoded = encoder::encode(info);
    Sha1::digest(&encoded).into()
}

fn invalid(msg: &str) -> Error {
    Error::InvalidTorrentDescriptor(msg.to_string())
}

impl Torrent {
    pub fn parse(raw: &[u8]) -> Result<Torrent> {
        let bencode = decoder::decode_all(raw)?;
        Torrent::from_bencode(&bencode)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Torrent> {
        let raw = tokio::fs::read(path).await?;
        Torrent::parse(&raw)
    }

    // extracts the fields we care about from a decoded descriptor.
    // anything else in the dict (or in info) is ignored but still hashed.
    pub fn from_bencode(bencode: &Bencode) -> Result<Torrent> {
        let dict = match bencode {
            Bencode::Dict(d) => d,
            _ => return Err(invalid("top level value is not a dictionary")),
        };

        let announce = match dict.get(&b"announce"[..]) {
            Some(Bencode::Bytes(b)) => String::from_utf8(b.clone())
                .map_err(|_| invalid("announce url is not valid utf-8"))?,
            _ => return Err(invalid("missing or invalid announce url")),
        };

        let info_bencode = dict
            .get(&b"info"[..])
            .ok_or_else(|| invalid("missing info dictionary"))?;
        let info = match info_bencode {
            Bencode::Dict(d) => d,
            _ => return Err(invalid("info is not a dictionary")),
        };

        let name = match info.get(&b"name"[..]) {
            Some(Bencode::Bytes(b)) => Some(String::from_utf8_lossy(b).into_owned()),
            Some(_) => return Err(invalid("name is not a string")),
            None => None,
        };

        let length = match info.get(&b"length"[..]) {
            Some(Bencode::Int(i)) if *i >= 0 => *i as u64,
            Some(Bencode::Int(_)) => return Err(invalid("length is negative")),
            _ => return Err(invalid("missing or invalid length")),
        };

        let piece_length = match info.get(&b"piece length"[..]) {
            Some(Bencode::Int(i)) if *i > 0 => *i as u64,
            Some(Bencode::Int(_)) => return Err(invalid("piece length must be positive")),
            _ => return Err(invalid("missing or invalid piece length")),
        };

        let pieces = match info.get(&b"pieces"[..]) {
            Some(Bencode::Bytes(b)) => b,
            _ => return Err(invalid("missing or invalid pieces")),
        };
        if pieces.len() % HASH_LEN != 0 {
            return Err(invalid("pieces length is not a multiple of 20"));
        }

        let pieces: Vec<[u8; HASH_LEN]> = pieces
            .chunks_exact(HASH_LEN)
            .map(|chunk| {
                let mut hash = [0u8; HASH_LEN];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        // piece sizes are derived from length, so there has to be exactly
        // one hash per piece_length slice of the file
        let expected = length.div_ceil(piece_length);
        if pieces.len() as u64 != expected {
            return Err(Error::InvalidTorrentDescriptor(format!(
                "{} piece hashes for {} bytes in pieces of {} (expected {})",
                pieces.len(),
                length,
                piece_length,
                expected
            )));
        }

        Ok(Torrent {
            info_hash: get_sha1_info_hash(info_bencode),
            announce,
            name,
            length,
            piece_length,
            pieces,
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    // every piece is piece_length long except the last one, which holds
    // whatever is left over (or a full piece if the length divides evenly)
    pub fn piece_size(&self, index: usize) -> Result<u64> {
        let count = self.num_pieces();
        if index >= count {
            return Err(Error::InvalidPieceIndex { index, count });
        }

        if index + 1 < count {
            return Ok(self.piece_length);
        }

        match self.length % self.piece_length {
            0 => Ok(self.piece_length),
            rem => Ok(rem),
        }
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn piece_hashes_hex(&self) -> Vec<String> {
        self.pieces.iter().map(hex::encode).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;

    // builds descriptor bytes for a file with the given content, used by
    // tests across the crate
    pub(crate) fn descriptor_for(announce: &str, data: &[u8], piece_length: usize) -> Vec<u8> {
        let pieces: Vec<u8> = data
            .chunks(piece_length)
            .flat_map(|chunk| Sha1::digest(chunk).to_vec())
            .collect();

        let mut info = BTreeMap::new();
        info.insert(b"length".to_vec(), Bencode::Int(data.len() as i64));
        info.insert(b"name".to_vec(), Bencode::from("sample.txt"));
        info.insert(b"piece length".to_vec(), Bencode::Int(piece_length as i64));
        info.insert(b"pieces".to_vec(), Bencode::Bytes(pieces));

        let mut root = BTreeMap::new();
        root.insert(b"announce".to_vec(), Bencode::from(announce));
        root.insert(b"info".to_vec(), Bencode::Dict(info));
        encoder::encode(&Bencode::Dict(root))
    }

    fn sample() -> Vec<u8> {
        let data: Vec<u8> = (0..100u8).collect();
        descriptor_for("http://tracker.test/announce", &data, 32)
    }

    #[test]
    fn parses_single_file_descriptor() {
        let torrent = Torrent::parse(&sample()).unwrap();
        assert_eq!(torrent.announce, "http://tracker.test/announce");
        assert_eq!(torrent.name.as_deref(), Some("sample.txt"));
        assert_eq!(torrent.length, 100);
        assert_eq!(torrent.piece_length, 32);
        assert_eq!(torrent.num_pieces(), 4);
        assert_eq!(torrent.piece_hashes_hex()[0].len(), 40);
    }

    #[test]
    fn last_piece_holds_remainder() {
        let torrent = Torrent::parse(&sample()).unwrap();
        assert_eq!(torrent.piece_size(0).unwrap(), 32);
        assert_eq!(torrent.piece_size(2).unwrap(), 32);
        assert_eq!(torrent.piece_size(3).unwrap(), 4);
        assert!(matches!(
            torrent.piece_size(4),
            Err(Error::InvalidPieceIndex { index: 4, count: 4 })
        ));
    }

    #[test]
    fn last_piece_is_full_when_length_divides_evenly() {
        let data = vec![7u8; 64];
        let torrent = Torrent::parse(&descriptor_for("http://t/a", &data, 32)).unwrap();
        assert_eq!(torrent.piece_size(1).unwrap(), 32);
    }

    #[test]
    fn info_hash_is_deterministic() {
        let raw = sample();
        let a = Torrent::parse(&raw).unwrap();
        let b = Torrent::parse(&raw).unwrap();
        assert_eq!(a.info_hash, b.info_hash);
    }

    #[test]
    fn info_hash_matches_hash_of_raw_info_bytes() {
        let raw = sample();
        let torrent = Torrent::parse(&raw).unwrap();

        // the info value starts after "4:info" and runs up to the final 'e'
        let start = raw.windows(6).position(|w| w == b"4:info").unwrap() + 6;
        let info_bytes = &raw[start..raw.len() - 1];
        let expected: [u8; 20] = Sha1::digest(info_bytes).into();
        assert_eq!(torrent.info_hash, expected);
    }

    #[test]
    fn changing_info_changes_hash_but_announce_does_not() {
        let data: Vec<u8> = (0..100u8).collect();
        let base = Torrent::parse(&descriptor_for("http://a/announce", &data, 32)).unwrap();
        let other_tracker = Torrent::parse(&descriptor_for("http://b/announce", &data, 32)).unwrap();
        assert_eq!(base.info_hash, other_tracker.info_hash);

        let mut raw = descriptor_for("http://a/announce", &data, 32);
        let pos = raw.windows(10).position(|w| w == b"sample.txt").unwrap();
        raw[pos] = b'S';
        let renamed = Torrent::parse(&raw).unwrap();
        assert_ne!(base.info_hash, renamed.info_hash);
    }

    #[test]
    fn unknown_info_fields_are_hashed() {
        let raw = b"d8:announce8:http://x4:infod6:lengthi1e4:name1:a12:piece lengthi1e6:pieces20:aaaaaaaaaaaaaaaaaaaa7:privatei1eee";
        let torrent = Torrent::parse(raw).unwrap();
        let start = raw.windows(6).position(|w| w == b"4:info").unwrap() + 6;
        let expected: [u8; 20] = Sha1::digest(&raw[start..raw.len() - 1]).into();
        assert_eq!(torrent.info_hash, expected);
    }

    #[test]
    fn rejects_bad_descriptors() {
        let cases: [&[u8]; 10] = [
            b"li1ee",
            b"d4:infod6:lengthi1e12:piece lengthi1e6:pieces0:ee",
            b"d8:announcei1e4:infod6:lengthi1e12:piece lengthi1e6:pieces0:ee",
            b"d8:announce1:x4:infoi1ee",
            b"d8:announce1:x4:infod12:piece lengthi1e6:pieces0:ee",
            b"d8:announce1:x4:infod6:lengthi1e12:piece lengthi0e6:pieces0:ee",
            b"d8:announce1:x4:infod6:lengthi1e12:piece lengthi1e6:pieces3:abcee",
            // one hash short, one hash too many, and a huge length behind a single hash
            b"d8:announce1:x4:infod6:lengthi2e12:piece lengthi1e6:pieces20:aaaaaaaaaaaaaaaaaaaaee",
            b"d8:announce1:x4:infod6:lengthi0e12:piece lengthi1e6:pieces20:aaaaaaaaaaaaaaaaaaaaee",
            b"d8:announce1:x4:infod6:lengthi4611686018427387904e12:piece lengthi32e6:pieces20:aaaaaaaaaaaaaaaaaaaaee",
        ];
        for raw in cases {
            assert!(
                matches!(Torrent::parse(raw), Err(Error::InvalidTorrentDescriptor(_))),
                "{}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn piece_sizes_add_up_to_length() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut raw = descriptor_for("http://t/a", &data, 32);
        let torrent = Torrent::parse(&raw).unwrap();
        let total: u64 = (0..torrent.num_pieces())
            .map(|i| torrent.piece_size(i).unwrap())
            .sum();
        assert_eq!(total, torrent.length);

        // same descriptor with a fifth hash appended to pieces
        let pos = raw.windows(9).position(|w| w == b"6:pieces8").unwrap();
        raw.splice(pos..pos + 11, b"6:pieces100:".iter().copied());
        let end = raw.len() - 2;
        raw.splice(end..end, [b'z'; 20]);
        assert!(matches!(
            Torrent::parse(&raw),
            Err(Error::InvalidTorrentDescriptor(_))
        ));
    }

    #[test]
    fn codec_errors_surface_as_malformed_input() {
        assert!(matches!(
            Torrent::parse(b"d8:announce"),
            Err(Error::MalformedInput(_))
        ));
    }
}
