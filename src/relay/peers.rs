//! Peer association table and forwarding state machine
//!
//! The table binds ephemeral WireGuard session indices and admitted
//! identities to observed source addresses. Handshake messages are admitted
//! by MAC1 alone: MAC1 is the only outer-header authenticator computable
//! without a private key, and it cannot be forged without the admitted
//! public key it is derived from.
//!
//! All four mappings live under a single mutex. The table is small, the
//! critical sections are hash lookups and short list scans, and one lock
//! trivially preserves the cross-mapping invariants. Send I/O never happens
//! while the lock is held: forwarding targets are collected first, then the
//! lock is released before the socket is touched.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::RelayError;
use crate::relay::key::{derive_mac1_key, KeyPair, Mac1Key, PublicKey};
use crate::relay::packet::{verify_mac1, Packet, SessionIndex};
use crate::relay::sender::PacketSender;

/// An observed peer endpoint
///
/// A single instance is shared between `endpoint_by_index` and
/// `endpoints_by_key`, so refreshing `last_seen` through one index is
/// observed through the other.
#[derive(Debug)]
pub struct PeerEndpoint {
    addr: SocketAddr,
    last_seen: Mutex<Instant>,
}

impl PeerEndpoint {
    fn new(addr: SocketAddr, now: Instant) -> Self {
        Self {
            addr,
            last_seen: Mutex::new(now),
        }
    }

    /// The address packets for this peer are forwarded to
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn touch(&self, now: Instant) {
        *self.last_seen.lock() = now;
    }

    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.duration_since(*self.last_seen.lock()) >= ttl
    }
}

/// The four association mappings, all guarded by one mutex in `PeerManager`
#[derive(Default)]
struct PeerTable {
    /// Admitted public key -> precomputed MAC1 key. Read-only after startup.
    mac1_keys: HashMap<PublicKey, Mac1Key>,
    /// Admitted public key -> configured counterpart key(s). Read-only after
    /// startup.
    partners: HashMap<PublicKey, Vec<PublicKey>>,
    /// Public key -> live endpoints claiming that identity, deduped by
    /// address.
    endpoints_by_key: HashMap<PublicKey, Vec<Arc<PeerEndpoint>>>,
    /// Session index -> endpoint, used to forward non-initiation messages.
    endpoint_by_index: HashMap<SessionIndex, Arc<PeerEndpoint>>,
}

impl PeerTable {
    fn add_key_pair(&mut self, pair: &KeyPair) {
        self.mac1_keys
            .insert(pair.key1, derive_mac1_key(&pair.key1));
        self.mac1_keys
            .insert(pair.key2, derive_mac1_key(&pair.key2));

        append_unique(self.partners.entry(pair.key1).or_default(), pair.key2);
        append_unique(self.partners.entry(pair.key2).or_default(), pair.key1);
    }

    /// Scan every admitted MAC1 key against the handshake message; the first
    /// match identifies the admitted key the message was built for.
    ///
    /// Linear in the number of admitted keys, which is fine: handshakes are
    /// rare next to transport data, and transport data never reaches this
    /// path.
    fn check_mac1(&self, payload: &[u8]) -> Result<PublicKey, RelayError> {
        for (public_key, mac1_key) in &self.mac1_keys {
            if verify_mac1(mac1_key, payload) {
                return Ok(*public_key);
            }
        }
        Err(RelayError::authentication_failed("mac1 verification failed"))
    }

    /// Record the source of a handshake initiation
    ///
    /// A known sender index only refreshes `last_seen`; the stored address
    /// is never replaced, which bounds the damage of a spoofed initiation
    /// with a guessed index. A new index creates the endpoint and, when the
    /// authenticated key has exactly one partner, files it under the
    /// partner's identity.
    fn register_initiation(
        &mut self,
        src: SocketAddr,
        sender_index: SessionIndex,
        public_key: PublicKey,
        now: Instant,
    ) -> Result<(), RelayError> {
        if let Some(existing) = self.endpoint_by_index.get(&sender_index) {
            debug!("Sender index {}: refreshing peer {}", sender_index, existing.addr());
            existing.touch(now);
            return Ok(());
        }

        let partners = self
            .partners
            .get(&public_key)
            .ok_or_else(|| RelayError::peer_not_found("paired public key not found"))?;

        let endpoint = Arc::new(PeerEndpoint::new(src, now));

        if let [partner] = partners.as_slice() {
            let partner = *partner;
            let list = self.endpoints_by_key.entry(partner).or_default();
            if !list.iter().any(|pe| pe.addr() == src) {
                list.push(Arc::clone(&endpoint));
            }
            debug!(
                "Sender index {}: added peer {} for public key {}",
                sender_index, src, partner
            );
        } else {
            debug!("Multiple paired public keys found for {}", public_key);
        }

        self.endpoint_by_index.insert(sender_index, endpoint);
        Ok(())
    }

    /// Record the source of a handshake response
    ///
    /// Only the session index is learned here; the responder's identity list
    /// is populated by its own initiations.
    fn register_response(
        &mut self,
        src: SocketAddr,
        sender_index: SessionIndex,
        public_key: PublicKey,
        now: Instant,
    ) {
        if !self.endpoint_by_index.contains_key(&sender_index) {
            debug!(
                "Sender index {}: added peer {} for public key {}",
                sender_index, src, public_key
            );
            self.endpoint_by_index
                .insert(sender_index, Arc::new(PeerEndpoint::new(src, now)));
        }
    }

    fn endpoints_for(&self, public_key: &PublicKey) -> Vec<SocketAddr> {
        self.endpoints_by_key
            .get(public_key)
            .map(|endpoints| endpoints.iter().map(|pe| pe.addr()).collect())
            .unwrap_or_default()
    }

    fn lookup_index(&self, index: SessionIndex) -> Option<SocketAddr> {
        self.endpoint_by_index.get(&index).map(|pe| pe.addr())
    }

    fn sweep(&mut self, now: Instant, ttl: Duration) {
        self.endpoints_by_key.retain(|public_key, endpoints| {
            endpoints.retain(|pe| {
                let keep = !pe.is_expired(now, ttl);
                if !keep {
                    debug!("Removing expired peer {}", pe.addr());
                }
                keep
            });
            if endpoints.is_empty() {
                debug!("Removing public key {} with no live peers", public_key);
                false
            } else {
                true
            }
        });

        self.endpoint_by_index.retain(|index, pe| {
            let keep = !pe.is_expired(now, ttl);
            if !keep {
                debug!("Removing expired sender index {}", index);
            }
            keep
        });
    }
}

fn append_unique(list: &mut Vec<PublicKey>, value: PublicKey) {
    if !list.contains(&value) {
        list.push(value);
    }
}

/// Owns the association table and drives the per-message-type forwarding
/// state machine
pub struct PeerManager {
    table: Mutex<PeerTable>,
    sender: Arc<dyn PacketSender>,
    peer_expiration: Duration,
}

impl PeerManager {
    /// Build the manager from the admitted key pairs
    ///
    /// MAC1 keys are derived once here and never change afterwards.
    #[must_use]
    pub fn new(
        sender: Arc<dyn PacketSender>,
        key_pairs: &[KeyPair],
        peer_expiration: Duration,
    ) -> Self {
        let mut table = PeerTable::default();
        for pair in key_pairs {
            table.add_key_pair(pair);
        }

        Self {
            table: Mutex::new(table),
            sender,
            peer_expiration,
        }
    }

    /// Classify, authenticate, and forward one received datagram
    ///
    /// The datagram is forwarded byte-for-byte; the relay never rewrites.
    ///
    /// # Errors
    ///
    /// Returns the per-packet `RelayError` kinds; callers log and drop.
    pub async fn handle_packet(&self, src: SocketAddr, payload: &[u8]) -> Result<(), RelayError> {
        match Packet::parse(payload)? {
            Packet::Initiation { sender, .. } => {
                debug!("Received handshake initiation: size={} bytes", payload.len());

                let targets = {
                    let mut table = self.table.lock();
                    let public_key = table.check_mac1(payload)?;
                    table.register_initiation(src, sender, public_key, Instant::now())?;
                    // Broadcast to every live endpoint of the authenticated
                    // identity; the counterpart may roam across several.
                    table.endpoints_for(&public_key)
                };

                for addr in targets {
                    self.forward(addr, payload).await?;
                }
                Ok(())
            }
            Packet::Response { sender, receiver, .. } => {
                debug!("Received handshake response: size={} bytes", payload.len());

                let target = {
                    let mut table = self.table.lock();
                    let public_key = table.check_mac1(payload)?;
                    table.register_response(src, sender, public_key, Instant::now());
                    table.lookup_index(receiver).ok_or_else(|| {
                        RelayError::peer_not_found(format!(
                            "no peer found for receiver index: {receiver}"
                        ))
                    })?
                };

                self.forward(target, payload).await
            }
            Packet::CookieReply { receiver, .. } | Packet::Transport { receiver, .. } => {
                let target = self.table.lock().lookup_index(receiver).ok_or_else(|| {
                    RelayError::peer_not_found(format!(
                        "no peer found for receiver index: {receiver}"
                    ))
                })?;

                self.forward(target, payload).await
            }
        }
    }

    async fn forward(&self, to: SocketAddr, payload: &[u8]) -> Result<(), RelayError> {
        self.sender.send(to, payload).await?;
        debug!(
            "Packet forwarded: destination={}, size={} bytes",
            to,
            payload.len()
        );
        Ok(())
    }

    /// Evict every association idle for at least `peer_expiration`
    ///
    /// # Errors
    ///
    /// Returns `RelayError::InvalidExpiration` without touching the table if
    /// the configured expiration is not positive.
    pub fn cleanup_peers(&self) -> Result<(), RelayError> {
        if self.peer_expiration.is_zero() {
            return Err(RelayError::InvalidExpiration(self.peer_expiration));
        }

        self.table.lock().sweep(Instant::now(), self.peer_expiration);
        Ok(())
    }

    /// Configured counterpart keys of an admitted key
    #[must_use]
    pub fn partners_of(&self, public_key: &PublicKey) -> Vec<PublicKey> {
        self.table
            .lock()
            .partners
            .get(public_key)
            .cloned()
            .unwrap_or_default()
    }

    /// Live endpoint addresses currently filed under a public key
    #[must_use]
    pub fn known_endpoints(&self, public_key: &PublicKey) -> Vec<SocketAddr> {
        self.table.lock().endpoints_for(public_key)
    }

    /// Endpoint address associated with a session index, if any
    #[must_use]
    pub fn endpoint_for_index(&self, index: SessionIndex) -> Option<SocketAddr> {
        self.table.lock().lookup_index(index)
    }

    /// Number of admitted public keys
    #[must_use]
    pub fn admitted_key_count(&self) -> usize {
        self.table.lock().mac1_keys.len()
    }

    /// Number of live session-index associations
    #[must_use]
    pub fn association_count(&self) -> usize {
        self.table.lock().endpoint_by_index.len()
    }
}

#[async_trait::async_trait]
impl crate::relay::worker::PacketHandler for PeerManager {
    async fn handle_packet(&self, src: SocketAddr, payload: &[u8]) -> Result<(), RelayError> {
        PeerManager::handle_packet(self, src, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::packet::{
        compute_mac1, INITIATION_LEN, MAC_LEN, MESSAGE_TYPE_INITIATION, MESSAGE_TYPE_RESPONSE,
        RESPONSE_LEN,
    };
    use async_trait::async_trait;

    /// Records every send instead of touching the network
    #[derive(Default)]
    struct MockSender {
        sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    impl MockSender {
        fn sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl PacketSender for MockSender {
        async fn send(&self, to: SocketAddr, payload: &[u8]) -> Result<(), RelayError> {
            self.sent.lock().push((to, payload.to_vec()));
            Ok(())
        }
    }

    fn key(tag: u8) -> PublicKey {
        PublicKey([tag; 32])
    }

    fn pair(a: u8, b: u8) -> KeyPair {
        KeyPair {
            key1: key(a),
            key2: key(b),
        }
    }

    fn manager(pairs: &[KeyPair]) -> (Arc<MockSender>, PeerManager) {
        let sender = Arc::new(MockSender::default());
        let pm = PeerManager::new(sender.clone(), pairs, Duration::from_secs(180));
        (sender, pm)
    }

    /// Build an initiation whose MAC1 authenticates against `for_key`
    fn initiation(for_key: &PublicKey, sender_index: [u8; 4]) -> Vec<u8> {
        let mut payload = vec![0u8; INITIATION_LEN];
        payload[0] = MESSAGE_TYPE_INITIATION;
        payload[4..8].copy_from_slice(&sender_index);

        let mac1_start = INITIATION_LEN - 2 * MAC_LEN;
        let mac = compute_mac1(&derive_mac1_key(for_key), &payload[..mac1_start]);
        payload[mac1_start..mac1_start + MAC_LEN].copy_from_slice(&mac);
        payload
    }

    /// Build a response whose MAC1 authenticates against `for_key`
    fn response(for_key: &PublicKey, sender_index: [u8; 4], receiver_index: [u8; 4]) -> Vec<u8> {
        let mut payload = vec![0u8; RESPONSE_LEN];
        payload[0] = MESSAGE_TYPE_RESPONSE;
        payload[4..8].copy_from_slice(&sender_index);
        payload[8..12].copy_from_slice(&receiver_index);

        let mac1_start = RESPONSE_LEN - 2 * MAC_LEN;
        let mac = compute_mac1(&derive_mac1_key(for_key), &payload[..mac1_start]);
        payload[mac1_start..mac1_start + MAC_LEN].copy_from_slice(&mac);
        payload
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_pair_installation_is_symmetric_and_deduped() {
        let (_, pm) = manager(&[pair(1, 2), pair(1, 2), pair(2, 1), pair(1, 3)]);

        assert_eq!(pm.partners_of(&key(1)), vec![key(2), key(3)]);
        assert_eq!(pm.partners_of(&key(2)), vec![key(1)]);
        assert_eq!(pm.partners_of(&key(3)), vec![key(1)]);
        assert_eq!(pm.admitted_key_count(), 3);
    }

    #[tokio::test]
    async fn test_initiation_records_index_and_partner_endpoint() {
        let (_, pm) = manager(&[pair(1, 2)]);

        pm.handle_packet(addr("1.2.3.4:5000"), &initiation(&key(2), [0x11, 0x22, 0x33, 0x44]))
            .await
            .unwrap();

        let sid = SessionIndex([0x11, 0x22, 0x33, 0x44]);
        assert_eq!(pm.endpoint_for_index(sid), Some(addr("1.2.3.4:5000")));
        // Endpoint is filed under the partner of the authenticated key
        assert_eq!(pm.known_endpoints(&key(1)), vec![addr("1.2.3.4:5000")]);
        assert!(pm.known_endpoints(&key(2)).is_empty());
    }

    #[tokio::test]
    async fn test_initiation_with_multiple_partners_skips_endpoint_list() {
        let (_, pm) = manager(&[pair(1, 2), pair(1, 3)]);

        // Key 1 has two partners, so the endpoint list stays untouched
        pm.handle_packet(addr("1.2.3.4:5000"), &initiation(&key(1), [0xaa, 0, 0, 1]))
            .await
            .unwrap();

        assert!(pm.known_endpoints(&key(2)).is_empty());
        assert!(pm.known_endpoints(&key(3)).is_empty());
        // The session index association is still created
        assert_eq!(
            pm.endpoint_for_index(SessionIndex([0xaa, 0, 0, 1])),
            Some(addr("1.2.3.4:5000"))
        );
    }

    #[tokio::test]
    async fn test_known_sender_index_never_replaces_address() {
        let (_, pm) = manager(&[pair(1, 2)]);
        let sid = [0x11, 0x22, 0x33, 0x44];

        pm.handle_packet(addr("1.2.3.4:5000"), &initiation(&key(2), sid))
            .await
            .unwrap();
        pm.handle_packet(addr("9.9.9.9:9999"), &initiation(&key(2), sid))
            .await
            .unwrap();

        assert_eq!(
            pm.endpoint_for_index(SessionIndex(sid)),
            Some(addr("1.2.3.4:5000"))
        );
        assert_eq!(pm.known_endpoints(&key(1)), vec![addr("1.2.3.4:5000")]);
    }

    #[tokio::test]
    async fn test_initiation_broadcasts_to_authenticated_identity() {
        let (sender, pm) = manager(&[pair(1, 2)]);

        // Key 1's endpoint becomes known through its own initiation (filed
        // under its identity as the partner of key 2)
        pm.handle_packet(addr("10.0.0.1:1111"), &initiation(&key(2), [1, 0, 0, 1]))
            .await
            .unwrap();
        assert!(sender.sent().is_empty());

        // An initiation for key 1 now reaches that endpoint
        let packet = initiation(&key(1), [2, 0, 0, 2]);
        pm.handle_packet(addr("5.6.7.8:6000"), &packet).await.unwrap();

        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, addr("10.0.0.1:1111"));
        assert_eq!(sent[0].1, packet);
    }

    #[tokio::test]
    async fn test_rejected_packets_leave_table_unmutated() {
        let (sender, pm) = manager(&[pair(1, 2)]);

        // Unknown type
        let err = pm
            .handle_packet(addr("1.2.3.4:5000"), &[0x00, 0x00, 0x00, 0x00])
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidPacket(_)));

        // Bad length
        let mut short = vec![0u8; 101];
        short[0] = MESSAGE_TYPE_INITIATION;
        let err = pm.handle_packet(addr("1.2.3.4:5000"), &short).await.unwrap_err();
        assert!(matches!(err, RelayError::InvalidPacket(_)));

        // Valid length, zeroed MAC1
        let mut forged = vec![0u8; INITIATION_LEN];
        forged[0] = MESSAGE_TYPE_INITIATION;
        forged[4..8].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd]);
        let err = pm.handle_packet(addr("1.2.3.4:5000"), &forged).await.unwrap_err();
        assert!(matches!(err, RelayError::AuthenticationFailed(_)));

        assert_eq!(pm.association_count(), 0);
        assert!(pm.known_endpoints(&key(1)).is_empty());
        assert!(pm.known_endpoints(&key(2)).is_empty());
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_response_learns_index_and_forwards_to_receiver() {
        let (sender, pm) = manager(&[pair(1, 2)]);

        pm.handle_packet(addr("1.2.3.4:5000"), &initiation(&key(2), [0x11, 0x22, 0x33, 0x44]))
            .await
            .unwrap();

        let packet = response(&key(1), [0x55, 0x66, 0x77, 0x88], [0x11, 0x22, 0x33, 0x44]);
        pm.handle_packet(addr("5.6.7.8:6000"), &packet).await.unwrap();

        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, addr("1.2.3.4:5000"));
        assert_eq!(sent[0].1, packet);
        assert_eq!(
            pm.endpoint_for_index(SessionIndex([0x55, 0x66, 0x77, 0x88])),
            Some(addr("5.6.7.8:6000"))
        );
    }

    #[tokio::test]
    async fn test_response_to_unknown_receiver_is_dropped() {
        let (sender, pm) = manager(&[pair(1, 2)]);

        let packet = response(&key(1), [0x55, 0x66, 0x77, 0x88], [0x11, 0x22, 0x33, 0x44]);
        let err = pm.handle_packet(addr("5.6.7.8:6000"), &packet).await.unwrap_err();

        assert!(matches!(err, RelayError::PeerNotFound(_)));
        assert!(sender.sent().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_evicts_idle_associations_everywhere() {
        let sender = Arc::new(MockSender::default());
        let pm = PeerManager::new(sender, &[pair(1, 2)], Duration::from_millis(30));

        pm.handle_packet(addr("1.2.3.4:5000"), &initiation(&key(2), [1, 2, 3, 4]))
            .await
            .unwrap();
        assert_eq!(pm.association_count(), 1);

        std::thread::sleep(Duration::from_millis(50));
        pm.cleanup_peers().unwrap();

        assert_eq!(pm.association_count(), 0);
        assert!(pm.known_endpoints(&key(1)).is_empty());
        assert_eq!(pm.endpoint_for_index(SessionIndex([1, 2, 3, 4])), None);
    }

    #[tokio::test]
    async fn test_sweep_keeps_fresh_associations() {
        let sender = Arc::new(MockSender::default());
        let pm = PeerManager::new(sender, &[pair(1, 2)], Duration::from_secs(60));

        pm.handle_packet(addr("1.2.3.4:5000"), &initiation(&key(2), [1, 2, 3, 4]))
            .await
            .unwrap();

        pm.cleanup_peers().unwrap();
        assert_eq!(pm.association_count(), 1);
        assert_eq!(pm.known_endpoints(&key(1)).len(), 1);
    }

    #[test]
    fn test_sweep_rejects_zero_expiration() {
        let sender = Arc::new(MockSender::default());
        let pm = PeerManager::new(sender, &[pair(1, 2)], Duration::ZERO);

        let err = pm.cleanup_peers().unwrap_err();
        assert!(matches!(err, RelayError::InvalidExpiration(_)));
    }
}
