//! Conversion of descriptors into kernel proxy entries

use super::descriptor::ProxyDescriptor;
use crate::kernel::KernelNode;
use serde_json::{Map, Value};
use tracing::debug;

/// Turns a descriptor into something the kernel can run.
///
/// `None` marks the descriptor incompatible; it then skips every kernel stage.
pub trait NodeConverter: Send + Sync {
    fn convert(&self, index: usize, descriptor: &ProxyDescriptor) -> Option<KernelNode>;
}

/// Subscription bookkeeping keys that mean nothing to the kernel
const METADATA_KEYS: [&str; 3] = ["collectionName", "subName", "id"];

/// Protocol types the kernel supports, with the fields each one cannot do without
const SUPPORTED: &[(&str, &[&str])] = &[
    ("ss", &["cipher", "password"]),
    ("ssr", &["cipher", "password", "obfs", "protocol"]),
    ("vmess", &["uuid"]),
    ("vless", &["uuid"]),
    ("trojan", &["password"]),
    ("hysteria", &[]),
    ("hysteria2", &[]),
    ("tuic", &[]),
    ("wireguard", &["private-key"]),
    ("socks5", &[]),
    ("http", &[]),
    ("snell", &["psk"]),
    ("anytls", &["password"]),
    ("mieru", &[]),
    ("ssh", &[]),
];

/// Converter producing mihomo (Clash.Meta) proxy entries
#[derive(Debug, Clone, Copy, Default)]
pub struct ClashMetaConverter;

impl ClashMetaConverter {
    pub fn new() -> Self {
        Self
    }

    fn canonical_type(kind: &str) -> &str {
        match kind {
            "socks" => "socks5",
            "hy2" => "hysteria2",
            "shadowsocks" => "ss",
            other => other,
        }
    }
}

impl NodeConverter for ClashMetaConverter {
    fn convert(&self, index: usize, descriptor: &ProxyDescriptor) -> Option<KernelNode> {
        let name = descriptor.name();
        let Some(kind) = descriptor.get("type").and_then(Value::as_str) else {
            debug!(name, "descriptor has no type");
            return None;
        };
        let kind = Self::canonical_type(&kind.to_ascii_lowercase()).to_string();
        let Some((_, required)) = SUPPORTED.iter().find(|(t, _)| *t == kind) else {
            debug!(name, kind = %kind, "unsupported proxy type");
            return None;
        };

        let server = descriptor.server().map(str::trim).unwrap_or_default();
        if server.is_empty() {
            debug!(name, "descriptor has no server");
            return None;
        }
        let Some(port) = descriptor.get("port").and_then(parse_port) else {
            debug!(name, "descriptor has no valid port");
            return None;
        };
        if let Some(missing) = required.iter().find(|f| !has_value(descriptor.get(f))) {
            debug!(name, kind = %kind, field = *missing, "required field missing");
            return None;
        }

        let mut fields: Map<String, Value> = descriptor
            .fields()
            .iter()
            .filter(|(k, _)| !k.starts_with('_') && !METADATA_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        fields.insert("type".to_string(), Value::String(kind));
        fields.insert("server".to_string(), Value::String(server.to_string()));
        fields.insert("port".to_string(), Value::from(port));

        Some(KernelNode::new(index, fields))
    }
}

fn parse_port(value: &Value) -> Option<u16> {
    let port = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<u16>().ok(),
        _ => None,
    }?;
    (port != 0).then_some(port)
}

fn has_value(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn convert(value: Value) -> Option<KernelNode> {
        let descriptor = ProxyDescriptor::from_value(value).unwrap();
        ClashMetaConverter::new().convert(7, &descriptor)
    }

    #[test]
    fn test_converts_supported_node() {
        let node = convert(json!({
            "name": "香港 01",
            "type": "ss",
            "server": " hk.example ",
            "port": "8388",
            "cipher": "aes-128-gcm",
            "password": "p",
            "udp": true,
            "_geo": {"country": "HK"},
            "collectionName": "all",
            "subName": "sub",
            "id": "abc"
        }))
        .unwrap();

        assert_eq!(node.id, "proxy_7");
        assert_eq!(node.index, 7);
        assert_eq!(node.server(), Some("hk.example"));
        assert_eq!(node.fields["port"], json!(8388));
        assert_eq!(node.fields["udp"], json!(true));
        for key in ["name", "_geo", "collectionName", "subName", "id"] {
            assert!(!node.fields.contains_key(key), "{}", key);
        }
    }

    #[test]
    fn test_type_aliases() {
        let node = convert(json!({"type": "SOCKS", "server": "s", "port": 1080})).unwrap();
        assert_eq!(node.kind(), Some("socks5"));
        let node = convert(json!({"type": "hy2", "server": "s", "port": 443})).unwrap();
        assert_eq!(node.kind(), Some("hysteria2"));
    }

    #[test]
    fn test_rejects_incompatible() {
        assert!(convert(json!({"type": "naive", "server": "s", "port": 443})).is_none());
        assert!(convert(json!({"server": "s", "port": 443})).is_none());
        assert!(convert(json!({"type": "http", "server": "", "port": 443})).is_none());
        assert!(convert(json!({"type": "http", "server": "s", "port": 0})).is_none());
        assert!(convert(json!({"type": "http", "server": "s", "port": 70000})).is_none());
        assert!(convert(json!({"type": "http", "server": "s"})).is_none());
        assert!(convert(json!({"type": "vmess", "server": "s", "port": 443})).is_none());
        assert!(convert(json!({"type": "trojan", "server": "s", "port": 443, "password": ""})).is_none());
    }
}
