//! Networking: topic discovery and the per-peer request channel.

mod rpc;
mod swarm;

pub use rpc::{read_frame, RpcChannel};
pub use swarm::{Swarm, SwarmEvent, TopicReceiver};
