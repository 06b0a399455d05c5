//! The relay engine
//!
//! Receive path, packet classification, MAC1 admission, the peer
//! association table, and the forwarding pipeline.

pub mod key;
pub mod packet;
pub mod peers;
pub mod sender;
pub mod server;
pub mod worker;

pub use key::{decode_public_key, derive_mac1_key, load_key_pairs, KeyPair, Mac1Key, PublicKey};
pub use packet::{compute_mac1, verify_mac1, Packet, SessionIndex};
pub use peers::{PeerEndpoint, PeerManager};
pub use sender::{PacketSender, UdpPacketSender};
pub use server::{RelayServer, READ_DEADLINE, SWEEP_INTERVAL};
pub use worker::{PacketHandler, WorkerPool, WorkerPoolStats, WorkerPoolStatsSnapshot};
