//! Address derivation between the three listeners of a node.
//!
//! For a node whose Raft address is `host:P`, peers reach its gRPC listener
//! at `host:P+200` and clients reach HTTP at `host:P-100`. The offsets are
//! part of the external contract: admin tooling and peers derive one address
//! from another.

/// Port offset from the Raft listener to the gRPC listener.
pub const GRPC_PORT_OFFSET: u16 = 200;

/// Port offset from the Raft listener down to the HTTP listener.
pub const HTTP_PORT_OFFSET: u16 = 100;

fn shift_port(host_and_port: &str, delta: i32) -> Option<String> {
    let (host, port) = host_and_port.rsplit_once(':')?;
    let port: i32 = port.parse().ok()?;
    let shifted = port + delta;
    if !(1..=u16::MAX as i32).contains(&shifted) {
        return None;
    }
    Some(format!("{}:{}", host, shifted))
}

/// Derives the gRPC address from a Raft address (`host:P` → `host:P+200`).
pub fn grpc_address(raft_address: &str) -> Option<String> {
    shift_port(raft_address, GRPC_PORT_OFFSET as i32)
}

/// Derives the HTTP address from a Raft address (`host:P` → `host:P-100`).
pub fn http_address(raft_address: &str) -> Option<String> {
    shift_port(raft_address, -(HTTP_PORT_OFFSET as i32))
}
