use rand::Rng;

/// 20 bytes of cryptographically secure random data, generated once per run.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    rand::thread_rng().fill(&mut peer_id);
    peer_id
}
