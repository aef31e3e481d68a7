use std::time::Duration;

use rand::Rng;

pub const BLOCK_SIZE: u32 = 2_u32.pow(14);
pub const DEFAULT_PORT: u16 = 6881;
pub const MAX_CONCURRENT_PIECES: usize = 5;

// runtime knobs shared by the tracker, the peer sessions and the piece manager
#[derive(Debug, Clone)]
pub struct Config {
    pub peer_id: [u8; 20],
    pub port: u16,
    pub max_concurrent_pieces: usize,
    pub pipeline_depth: usize,
    pub block_size: u32,
    pub peer_timeout: Duration,
    pub tracker_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            peer_id: calculate_peer_id(),
            port: DEFAULT_PORT,
            max_concurrent_pieces: MAX_CONCURRENT_PIECES,
            pipeline_depth: 1,
            block_size: BLOCK_SIZE,
            peer_timeout: Duration::from_secs(30),
            tracker_timeout: Duration::from_secs(10),
        }
    }
}

// client code followed by 12 random digits. generated once per config so
// the tracker and every peer see the same id for the whole run.
pub fn calculate_peer_id() -> [u8; 20] {
    let client_code = "-RB0100-";
    let mut rng = rand::rng();
    let random_digits: u64 = rng.random_range(100_000_000_000..=999_999_999_999);

    let mut id = [0u8; 20];
    id.copy_from_slice(format!("{}{}", client_code, random_digits).as_bytes());
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_has_client_prefix() {
        let id = calculate_peer_id();
        assert_eq!(&id[..8], b"-RB0100-");
        assert!(id[8..].iter().all(u8::is_ascii_digit));
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.block_size, 16 * 1024);
        assert_eq!(config.max_concurrent_pieces, 5);
        assert_eq!(config.pipeline_depth, 1);
    }
}
