//! Kernel configuration documents
//!
//! The kernel reads a YAML document. Only a small fixed shape is ever needed, so
//! it is written line by line: scalars are rendered directly and nested values
//! as JSON flow collections, which YAML accepts verbatim.

use serde_json::{Map, Value};
use std::fmt::Write;

/// Name of the `select` group every generated config routes through.
pub const SELECT_GROUP: &str = "PROXY";

/// One proxy entry as the kernel sees it.
///
/// The display name of a node may contain characters that break the config
/// format or the controller's URL paths, so the kernel only ever sees the
/// synthetic `proxy_<index>` id.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelNode {
    pub id: String,
    /// Position of the originating descriptor in the input list
    pub index: usize,
    pub fields: Map<String, Value>,
}

impl KernelNode {
    pub fn new(index: usize, mut fields: Map<String, Value>) -> Self {
        let id = format!("proxy_{}", index);
        fields.remove("name");
        Self { id, index, fields }
    }

    pub fn server(&self) -> Option<&str> {
        self.fields.get("server").and_then(Value::as_str)
    }

    pub fn kind(&self) -> Option<&str> {
        self.fields.get("type").and_then(Value::as_str)
    }

    /// The entry as a JSON object, with `name` set to the synthetic id.
    pub fn to_json(&self) -> Value {
        let mut fields = self.fields.clone();
        fields.insert("name".to_string(), Value::String(self.id.clone()));
        Value::Object(fields)
    }

    fn render(&self, out: &mut String) {
        let _ = writeln!(out, "  - name: {}", quote(&self.id));
        for (key, value) in &self.fields {
            if value.is_null() {
                continue;
            }
            let _ = writeln!(out, "    {}: {}", quote(key), render_value(value));
        }
    }
}

/// Controller endpoint settings
#[derive(Debug, Clone, PartialEq)]
struct ControllerSettings {
    port: u16,
    secret: Option<String>,
}

/// A complete kernel configuration
#[derive(Debug, Clone)]
pub struct KernelConfig {
    mixed_port: u16,
    controller: Option<ControllerSettings>,
    nodes: Vec<KernelNode>,
    log_level: String,
}

impl KernelConfig {
    pub fn new(mixed_port: u16) -> Self {
        Self {
            mixed_port,
            controller: None,
            nodes: Vec::new(),
            log_level: "warning".to_string(),
        }
    }

    pub fn with_controller(mut self, port: u16, secret: Option<String>) -> Self {
        self.controller = Some(ControllerSettings { port, secret });
        self
    }

    pub fn with_nodes(mut self, nodes: Vec<KernelNode>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_log_level(mut self, level: &str) -> Self {
        self.log_level = level.to_string();
        self
    }

    pub fn mixed_port(&self) -> u16 {
        self.mixed_port
    }

    pub fn controller_port(&self) -> Option<u16> {
        self.controller.as_ref().map(|c| c.port)
    }

    pub fn nodes(&self) -> &[KernelNode] {
        &self.nodes
    }

    /// Render the YAML document.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "mixed-port: {}", self.mixed_port);
        out.push_str("allow-lan: false\n");
        let _ = writeln!(out, "log-level: {}", self.log_level);
        out.push_str("ipv6: false\n");
        if let Some(controller) = &self.controller {
            let _ = writeln!(out, "external-controller: 127.0.0.1:{}", controller.port);
            if let Some(secret) = &controller.secret {
                let _ = writeln!(out, "secret: {}", quote(secret));
            }
        }

        out.push('\n');
        if self.nodes.is_empty() {
            out.push_str("proxies: []\n");
        } else {
            out.push_str("proxies:\n");
            for node in &self.nodes {
                node.render(&mut out);
            }
        }

        out.push_str("\nproxy-groups:\n");
        let _ = writeln!(out, "  - name: {}", SELECT_GROUP);
        out.push_str("    type: select\n");
        out.push_str("    proxies:\n");
        if self.nodes.is_empty() {
            out.push_str("      - DIRECT\n");
        }
        for node in &self.nodes {
            let _ = writeln!(out, "      - {}", quote(&node.id));
        }

        out.push_str("\nrules:\n");
        let _ = writeln!(out, "  - MATCH,{}", SELECT_GROUP);
        out
    }
}

/// Double-quoted scalar; JSON string escapes are valid YAML.
fn quote(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => quote(s),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => "null".to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(index: usize, value: Value) -> KernelNode {
        let Value::Object(fields) = value else {
            panic!("not an object");
        };
        KernelNode::new(index, fields)
    }

    #[test]
    fn test_kernel_node_uses_synthetic_id() {
        let n = node(
            3,
            json!({"name": "香港 01 \"fast\"", "type": "ss", "server": "1.2.3.4", "port": 8388}),
        );
        assert_eq!(n.id, "proxy_3");
        assert_eq!(n.index, 3);
        assert!(!n.fields.contains_key("name"));
        assert_eq!(n.server(), Some("1.2.3.4"));
        assert_eq!(n.kind(), Some("ss"));
        assert_eq!(n.to_json()["name"], "proxy_3");
    }

    #[test]
    fn test_render_values() {
        assert_eq!(render_value(&json!("a\"b\\c")), r#""a\"b\\c""#);
        assert_eq!(render_value(&json!(443)), "443");
        assert_eq!(render_value(&json!(true)), "true");
        assert_eq!(render_value(&json!(["h2", "http/1.1"])), r#"["h2","http/1.1"]"#);
        let nested = json!({"path": "/ws", "headers": {"Host": "a.b"}});
        let rendered: Value = serde_json::from_str(&render_value(&nested)).unwrap();
        assert_eq!(rendered, nested);
    }

    #[test]
    fn test_render_shared_config() {
        let config = KernelConfig::new(14000)
            .with_controller(9090, Some("s3cret".to_string()))
            .with_nodes(vec![
                node(0, json!({"type": "ss", "server": "1.1.1.1", "port": 443, "udp": true})),
                node(2, json!({"type": "trojan", "server": "a.example", "port": 443, "alpn": ["h2"]})),
            ]);
        let text = config.render();

        assert!(text.starts_with("mixed-port: 14000\n"));
        assert!(text.contains("external-controller: 127.0.0.1:9090\n"));
        assert!(text.contains("secret: \"s3cret\"\n"));
        assert!(text.contains("  - name: \"proxy_0\"\n"));
        assert!(text.contains("    \"server\": \"1.1.1.1\"\n"));
        assert!(text.contains("    \"port\": 443\n"));
        assert!(text.contains("    \"alpn\": [\"h2\"]\n"));
        assert!(text.contains("    \"udp\": true\n"));
        assert!(text.contains("  - name: PROXY\n    type: select\n    proxies:\n      - \"proxy_0\"\n      - \"proxy_2\"\n"));
        assert!(text.ends_with("rules:\n  - MATCH,PROXY\n"));
        assert_eq!(config.controller_port(), Some(9090));
    }

    #[test]
    fn test_render_single_node_without_controller() {
        let config = KernelConfig::new(14001)
            .with_nodes(vec![node(5, json!({"type": "vmess", "server": "v.example", "port": 443}))]);
        let text = config.render();
        assert!(!text.contains("external-controller"));
        assert!(text.contains("      - \"proxy_5\"\n"));
        assert_eq!(config.controller_port(), None);
    }

    #[test]
    fn test_render_quotes_keys() {
        let config = KernelConfig::new(14002).with_nodes(vec![node(
            0,
            json!({"type": "ss", "server": "s", "port": 1, "odd: key #1": "v\nw"}),
        )]);
        let text = config.render();
        assert!(text.contains("    \"odd: key #1\": \"v\\nw\"\n"));
        assert!(!text.contains("    odd: key"));
    }

    #[test]
    fn test_render_empty_config_routes_direct() {
        let text = KernelConfig::new(14000).render();
        assert!(text.contains("proxies: []\n"));
        assert!(text.contains("      - DIRECT\n"));
    }
}
