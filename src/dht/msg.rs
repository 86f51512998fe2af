//! KRPC message construction and parsing, plus the compact peer and node
//! codecs of the DHT wire format.
//!
//! Messages are bencoded dictionaries with a 2 byte transaction id `t`, a
//! type tag `y` of `q`/`r`/`e`, and either `q`+`a` (queries) or `r`
//! (responses). Compact formats: 6 bytes per IPv4 peer, 18 per IPv6 peer,
//! 26 per IPv4 node, 38 per IPv6 node.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use serde_bencode::value::Value;

use crate::{
    error::{Error, Result},
    InfoHash,
};

use super::routing::NodeId;

/// A 2 byte transaction id correlating queries and responses.
pub(crate) type TransactionId = [u8; 2];

fn dict(entries: Vec<(&str, Value)>) -> Value {
    let mut map = HashMap::new();
    for (key, value) in entries {
        map.insert(key.as_bytes().to_vec(), value);
    }
    Value::Dict(map)
}

fn bytes(value: &[u8]) -> Value {
    Value::Bytes(value.to_vec())
}

/// Builds a query message with the given name and arguments. Read-only
/// nodes mark every outgoing query with `ro: 1` (BEP-43).
fn query(
    tid: TransactionId,
    name: &str,
    mut args: Vec<(&'static str, Value)>,
    read_only: bool,
) -> Result<Vec<u8>> {
    if read_only {
        args.push(("ro", Value::Int(1)));
    }
    let msg = dict(vec![
        ("t", bytes(&tid)),
        ("y", bytes(b"q")),
        ("q", bytes(name.as_bytes())),
        ("a", dict(args)),
    ]);
    serde_bencode::to_bytes(&msg).map_err(Error::from)
}

pub(crate) fn ping_query(
    tid: TransactionId,
    own_id: &NodeId,
    read_only: bool,
) -> Result<Vec<u8>> {
    query(
        tid,
        "ping",
        vec![("id", bytes(own_id.as_bytes()))],
        read_only,
    )
}

pub(crate) fn find_node_query(
    tid: TransactionId,
    own_id: &NodeId,
    target: &NodeId,
    read_only: bool,
) -> Result<Vec<u8>> {
    query(
        tid,
        "find_node",
        vec![
            ("id", bytes(own_id.as_bytes())),
            ("target", bytes(target.as_bytes())),
        ],
        read_only,
    )
}

pub(crate) fn get_peers_query(
    tid: TransactionId,
    own_id: &NodeId,
    info_hash: &InfoHash,
    read_only: bool,
) -> Result<Vec<u8>> {
    query(
        tid,
        "get_peers",
        vec![
            ("id", bytes(own_id.as_bytes())),
            ("info_hash", bytes(info_hash)),
        ],
        read_only,
    )
}

pub(crate) fn announce_peer_query(
    tid: TransactionId,
    own_id: &NodeId,
    info_hash: &InfoHash,
    port: u16,
    token: &[u8],
    read_only: bool,
) -> Result<Vec<u8>> {
    query(
        tid,
        "announce_peer",
        vec![
            ("id", bytes(own_id.as_bytes())),
            ("info_hash", bytes(info_hash)),
            ("port", Value::Int(port as i64)),
            ("token", bytes(token)),
        ],
        read_only,
    )
}

/// Builds the response to an incoming query.
pub(crate) fn response(
    tid: &[u8],
    fields: Vec<(&'static str, Value)>,
) -> Result<Vec<u8>> {
    let msg = dict(vec![
        ("t", bytes(tid)),
        ("y", bytes(b"r")),
        ("r", dict(fields)),
    ]);
    serde_bencode::to_bytes(&msg).map_err(Error::from)
}

/// Builds a KRPC error message.
pub(crate) fn error_response(
    tid: &[u8],
    code: i64,
    message: &str,
) -> Result<Vec<u8>> {
    let msg = dict(vec![
        ("t", bytes(tid)),
        ("y", bytes(b"e")),
        (
            "e",
            Value::List(vec![
                Value::Int(code),
                bytes(message.as_bytes()),
            ]),
        ),
    ]);
    serde_bencode::to_bytes(&msg).map_err(Error::from)
}

pub(crate) fn id_value(fields: &HashMap<Vec<u8>, Value>) -> Option<NodeId> {
    match fields.get(b"id".as_slice()) {
        Some(Value::Bytes(id)) if id.len() == 20 => {
            let mut bytes = [0u8; 20];
            bytes.copy_from_slice(id);
            Some(NodeId(bytes))
        }
        _ => None,
    }
}

/// A parsed incoming KRPC message.
#[derive(Debug)]
pub(crate) struct KrpcMessage {
    pub tid: Vec<u8>,
    pub kind: KrpcKind,
}

#[derive(Debug)]
pub(crate) enum KrpcKind {
    Query {
        name: Vec<u8>,
        args: HashMap<Vec<u8>, Value>,
        read_only: bool,
    },
    Response(KrpcResponse),
    Error {
        code: i64,
        message: String,
    },
}

/// The interesting fields of a KRPC response.
#[derive(Debug, Default)]
pub(crate) struct KrpcResponse {
    pub id: Option<NodeId>,
    pub token: Option<Vec<u8>>,
    /// Compact peer entries from `values`.
    pub peers: Vec<SocketAddr>,
    /// Compact node entries from `nodes` (IPv4) and `nodes6` (IPv6).
    pub nodes: Vec<(NodeId, SocketAddr)>,
}

/// Parses an incoming datagram into a KRPC message.
pub(crate) fn parse_message(data: &[u8]) -> Result<KrpcMessage> {
    let value: Value = serde_bencode::from_bytes(data)?;
    let top = match value {
        Value::Dict(top) => top,
        _ => {
            return Err(Error::Validation(
                "krpc message is not a dictionary".into(),
            ))
        }
    };

    let tid = match top.get(b"t".as_slice()) {
        Some(Value::Bytes(tid)) => tid.clone(),
        _ => {
            return Err(Error::Validation(
                "krpc message without transaction id".into(),
            ))
        }
    };

    let kind = match top.get(b"y".as_slice()) {
        Some(Value::Bytes(y)) if y == b"q" => parse_query(&top)?,
        Some(Value::Bytes(y)) if y == b"r" => parse_response(&top)?,
        Some(Value::Bytes(y)) if y == b"e" => parse_error(&top),
        _ => {
            return Err(Error::Validation(
                "krpc message with unknown type".into(),
            ))
        }
    };

    Ok(KrpcMessage { tid, kind })
}

fn parse_query(top: &HashMap<Vec<u8>, Value>) -> Result<KrpcKind> {
    let name = match top.get(b"q".as_slice()) {
        Some(Value::Bytes(name)) => name.clone(),
        _ => return Err(Error::Validation("query without name".into())),
    };
    let args = match top.get(b"a".as_slice()) {
        Some(Value::Dict(args)) => args.clone(),
        _ => HashMap::new(),
    };
    let read_only =
        matches!(args.get(b"ro".as_slice()), Some(Value::Int(1)));
    Ok(KrpcKind::Query {
        name,
        args,
        read_only,
    })
}

fn parse_response(top: &HashMap<Vec<u8>, Value>) -> Result<KrpcKind> {
    let fields = match top.get(b"r".as_slice()) {
        Some(Value::Dict(fields)) => fields,
        _ => {
            return Err(Error::Validation(
                "response without response dict".into(),
            ))
        }
    };

    let mut response = KrpcResponse {
        id: id_value(fields),
        ..KrpcResponse::default()
    };

    if let Some(Value::Bytes(token)) = fields.get(b"token".as_slice()) {
        response.token = Some(token.clone());
    }

    if let Some(Value::List(values)) = fields.get(b"values".as_slice()) {
        for value in values {
            if let Value::Bytes(peer) = value {
                if let Some(addr) = decode_compact_peer(peer) {
                    response.peers.push(addr);
                }
            }
        }
    }

    if let Some(Value::Bytes(nodes)) = fields.get(b"nodes".as_slice()) {
        response.nodes.extend(decode_compact_nodes(nodes));
    }
    if let Some(Value::Bytes(nodes)) = fields.get(b"nodes6".as_slice()) {
        response.nodes.extend(decode_compact_nodes6(nodes));
    }

    Ok(KrpcKind::Response(response))
}

fn parse_error(top: &HashMap<Vec<u8>, Value>) -> KrpcKind {
    let (code, message) = match top.get(b"e".as_slice()) {
        Some(Value::List(items)) => {
            let code = match items.first() {
                Some(Value::Int(code)) => *code,
                _ => 0,
            };
            let message = match items.get(1) {
                Some(Value::Bytes(msg)) => {
                    String::from_utf8_lossy(msg).into_owned()
                }
                _ => String::new(),
            };
            (code, message)
        }
        _ => (0, String::new()),
    };
    KrpcKind::Error { code, message }
}

/// Encodes a peer as its compact form: 6 bytes for IPv4, 18 for IPv6.
pub(crate) fn encode_compact_peer(addr: &SocketAddr) -> Vec<u8> {
    let mut out = Vec::new();
    match addr.ip() {
        IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

/// Decodes a compact peer entry; both the 6 byte IPv4 and the 18 byte IPv6
/// forms are understood.
pub(crate) fn decode_compact_peer(data: &[u8]) -> Option<SocketAddr> {
    match data.len() {
        6 => {
            let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
            let port = u16::from_be_bytes([data[4], data[5]]);
            Some(SocketAddr::from((ip, port)))
        }
        18 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([data[16], data[17]]);
            Some(SocketAddr::from((ip, port)))
        }
        _ => None,
    }
}

/// Encodes nodes in the 26 byte IPv4 compact node form. IPv6 addresses are
/// skipped; they belong in `nodes6`.
pub(crate) fn encode_compact_nodes(
    nodes: &[(NodeId, SocketAddr)],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * 26);
    for (id, addr) in nodes {
        if let IpAddr::V4(ip) = addr.ip() {
            out.extend_from_slice(id.as_bytes());
            out.extend_from_slice(&ip.octets());
            out.extend_from_slice(&addr.port().to_be_bytes());
        }
    }
    out
}

/// Decodes 26 byte IPv4 compact node entries; a trailing partial entry is
/// ignored.
pub(crate) fn decode_compact_nodes(
    data: &[u8],
) -> Vec<(NodeId, SocketAddr)> {
    let mut nodes = Vec::with_capacity(data.len() / 26);
    for chunk in data.chunks_exact(26) {
        let mut id = [0u8; 20];
        id.copy_from_slice(&chunk[..20]);
        if let Some(addr) = decode_compact_peer(&chunk[20..]) {
            nodes.push((NodeId(id), addr));
        }
    }
    nodes
}

/// Decodes 38 byte IPv6 compact node entries.
pub(crate) fn decode_compact_nodes6(
    data: &[u8],
) -> Vec<(NodeId, SocketAddr)> {
    let mut nodes = Vec::with_capacity(data.len() / 38);
    for chunk in data.chunks_exact(38) {
        let mut id = [0u8; 20];
        id.copy_from_slice(&chunk[..20]);
        if let Some(addr) = decode_compact_peer(&chunk[20..]) {
            nodes.push((NodeId(id), addr));
        }
    }
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn v4(a: u8, port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, a], port))
    }

    #[test]
    fn test_compact_peer_roundtrip() {
        let addr = v4(1, 6881);
        let encoded = encode_compact_peer(&addr);
        assert_eq!(encoded.len(), 6);
        assert_eq!(decode_compact_peer(&encoded), Some(addr));

        let addr6: SocketAddr =
            "[2001:db8::1]:6881".parse().unwrap();
        let encoded = encode_compact_peer(&addr6);
        assert_eq!(encoded.len(), 18);
        assert_eq!(decode_compact_peer(&encoded), Some(addr6));

        assert_eq!(decode_compact_peer(&[0; 5]), None);
    }

    #[test]
    fn test_compact_nodes_roundtrip() {
        let nodes = vec![
            (NodeId([1; 20]), v4(1, 1000)),
            (NodeId([2; 20]), v4(2, 2000)),
        ];
        let encoded = encode_compact_nodes(&nodes);
        assert_eq!(encoded.len(), 52);
        assert_eq!(decode_compact_nodes(&encoded), nodes);

        // a trailing partial entry is ignored
        let mut truncated = encoded;
        truncated.extend_from_slice(&[0; 10]);
        assert_eq!(decode_compact_nodes(&truncated).len(), 2);
    }

    #[test]
    fn test_query_parse_roundtrip() {
        let own = NodeId([7; 20]);
        let target = NodeId([9; 20]);
        let data =
            find_node_query([0x12, 0x34], &own, &target, false).unwrap();
        let msg = parse_message(&data).unwrap();
        assert_eq!(msg.tid, vec![0x12, 0x34]);
        match msg.kind {
            KrpcKind::Query {
                name,
                args,
                read_only,
            } => {
                assert_eq!(name, b"find_node");
                assert!(!read_only);
                assert_eq!(id_value(&args), Some(own));
                assert_eq!(
                    args.get(b"target".as_slice()),
                    Some(&Value::Bytes(target.as_bytes().to_vec()))
                );
            }
            other => panic!("expected query, got {:?}", other),
        }
    }

    #[test]
    fn test_read_only_marker() {
        let own = NodeId([7; 20]);
        let data = ping_query([0, 1], &own, true).unwrap();
        let msg = parse_message(&data).unwrap();
        match msg.kind {
            KrpcKind::Query { read_only, .. } => assert!(read_only),
            other => panic!("expected query, got {:?}", other),
        }
    }

    #[test]
    fn test_get_peers_response_parse() {
        let responder = NodeId([3; 20]);
        let peers = vec![v4(1, 6881), v4(2, 51413)];
        let values: Vec<Value> = peers
            .iter()
            .map(|p| Value::Bytes(encode_compact_peer(p)))
            .collect();
        let nodes = vec![(NodeId([4; 20]), v4(9, 9000))];
        let data = response(
            &[0xaa, 0xbb],
            vec![
                ("id", Value::Bytes(responder.as_bytes().to_vec())),
                ("token", Value::Bytes(b"tok".to_vec())),
                ("values", Value::List(values)),
                ("nodes", Value::Bytes(encode_compact_nodes(&nodes))),
            ],
        )
        .unwrap();

        let msg = parse_message(&data).unwrap();
        match msg.kind {
            KrpcKind::Response(parsed) => {
                assert_eq!(parsed.id, Some(responder));
                assert_eq!(parsed.token, Some(b"tok".to_vec()));
                assert_eq!(parsed.peers, peers);
                assert_eq!(parsed.nodes, nodes);
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_error_parse() {
        let data = error_response(&[0, 0], 203, "Protocol Error").unwrap();
        let msg = parse_message(&data).unwrap();
        match msg.kind {
            KrpcKind::Error { code, message } => {
                assert_eq!(code, 203);
                assert_eq!(message, "Protocol Error");
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(parse_message(b"not bencode").is_err());
        assert!(parse_message(b"i42e").is_err());
    }
}
