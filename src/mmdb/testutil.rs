//! Synthetic database writer used by tests

use super::METADATA_MARKER;

/// Encodes tagged values into a byte buffer.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn pad_to(&mut self, len: usize) {
        self.buf.resize(len, 0);
    }

    fn control(&mut self, kind: u8, size: usize) {
        let (bits, extra): (u8, Vec<u8>) = if size < 29 {
            (size as u8, Vec::new())
        } else if size < 285 {
            (29, vec![(size - 29) as u8])
        } else if size < 65_821 {
            (30, ((size - 285) as u16).to_be_bytes().to_vec())
        } else {
            (31, ((size - 65_821) as u32).to_be_bytes()[1..].to_vec())
        };
        if kind <= 7 {
            self.buf.push((kind << 5) | bits);
        } else {
            self.buf.push(bits);
            self.buf.push(kind - 7);
        }
        self.buf.extend(extra);
    }

    /// Returns the offset the value was written at.
    pub fn string(&mut self, s: &str) -> usize {
        let at = self.len();
        self.control(2, s.len());
        self.buf.extend_from_slice(s.as_bytes());
        at
    }

    pub fn double(&mut self, v: f64) {
        self.control(3, 8);
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn float(&mut self, v: f32) {
        self.control(15, 4);
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn unsigned(&mut self, kind: u8, v: u64) {
        let bytes = v.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        self.control(kind, bytes.len() - skip);
        self.buf.extend_from_slice(&bytes[skip..]);
    }

    pub fn uint16(&mut self, v: u16) {
        self.unsigned(5, u64::from(v));
    }

    pub fn uint32(&mut self, v: u32) {
        self.unsigned(6, u64::from(v));
    }

    pub fn int32(&mut self, v: i32) {
        self.control(8, 4);
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn boolean(&mut self, v: bool) {
        self.control(14, usize::from(v));
    }

    pub fn map(&mut self, entries: usize) {
        self.control(7, entries);
    }

    pub fn array(&mut self, items: usize) {
        self.control(11, items);
    }

    pub fn pointer(&mut self, target: usize) {
        if target < 2048 {
            self.buf.push(0x20 | (target >> 8) as u8);
            self.buf.push(target as u8);
        } else if target < 526_336 {
            let t = target - 2048;
            self.buf.push(0x20 | (1 << 3) | (t >> 16) as u8);
            self.buf.extend_from_slice(&(t as u16).to_be_bytes());
        } else if target < 526_336 + (1 << 27) {
            let t = target - 526_336;
            self.buf.push(0x20 | (2 << 3) | (t >> 24) as u8);
            self.buf.extend_from_slice(&(t as u32).to_be_bytes()[1..]);
        } else {
            self.buf.push(0x20 | (3 << 3));
            self.buf.extend_from_slice(&(target as u32).to_be_bytes());
        }
    }
}

#[derive(Clone, Copy)]
enum Child {
    Empty,
    Node(u32),
    Data(usize),
}

/// Builds a search tree by inserting prefixes that point at data offsets.
pub struct TreeBuilder {
    nodes: Vec<[Child; 2]>,
    record_size: u16,
    ip_version: u16,
}

impl TreeBuilder {
    pub fn new(record_size: u16, ip_version: u16) -> Self {
        Self {
            nodes: vec![[Child::Empty; 2]],
            record_size,
            ip_version,
        }
    }

    /// Insert an IPv4 prefix. For IPv6 trees it lands in the `::a.b.c.d` subtree.
    pub fn insert_v4(&mut self, ip: [u8; 4], prefix_len: u32, data_offset: usize) {
        let addr = u128::from(u32::from_be_bytes(ip));
        let (bits, len) = if self.ip_version == 6 {
            (addr, 96 + prefix_len)
        } else {
            (addr << 96, prefix_len)
        };
        self.insert(bits, len, data_offset);
    }

    fn insert(&mut self, bits: u128, len: u32, data_offset: usize) {
        let mut node = 0usize;
        for depth in 0..len {
            let bit = ((bits >> (127 - depth)) & 1) as usize;
            if depth + 1 == len {
                self.nodes[node][bit] = Child::Data(data_offset);
                return;
            }
            node = match self.nodes[node][bit] {
                Child::Node(next) => next as usize,
                _ => {
                    self.nodes.push([Child::Empty; 2]);
                    let next = self.nodes.len() - 1;
                    self.nodes[node][bit] = Child::Node(next as u32);
                    next
                }
            };
        }
    }

    pub fn node_count(&self) -> u32 {
        self.nodes.len() as u32
    }

    /// Assemble tree, separator, data section and metadata into a database.
    pub fn build(&self, data: &[u8]) -> Vec<u8> {
        let count = self.node_count();
        let resolve = |child: Child| match child {
            Child::Empty => count,
            Child::Node(n) => n,
            Child::Data(offset) => count + 16 + offset as u32,
        };

        let mut out = Vec::new();
        for [left, right] in &self.nodes {
            encode_node(&mut out, self.record_size, resolve(*left), resolve(*right));
        }
        out.extend_from_slice(&[0u8; 16]);
        out.extend_from_slice(data);
        out.extend_from_slice(METADATA_MARKER);
        out.extend(metadata(count, self.record_size, self.ip_version));
        out
    }
}

pub fn encode_node(out: &mut Vec<u8>, record_size: u16, left: u32, right: u32) {
    match record_size {
        24 => {
            out.extend_from_slice(&left.to_be_bytes()[1..]);
            out.extend_from_slice(&right.to_be_bytes()[1..]);
        }
        28 => {
            out.extend_from_slice(&left.to_be_bytes()[1..]);
            out.push((((left >> 24) & 0x0f) << 4) as u8 | ((right >> 24) & 0x0f) as u8);
            out.extend_from_slice(&right.to_be_bytes()[1..]);
        }
        32 => {
            out.extend_from_slice(&left.to_be_bytes());
            out.extend_from_slice(&right.to_be_bytes());
        }
        other => panic!("unsupported record size {}", other),
    }
}

pub fn metadata(node_count: u32, record_size: u16, ip_version: u16) -> Vec<u8> {
    let mut w = Writer::new();
    w.map(5);
    w.string("node_count");
    w.uint32(node_count);
    w.string("record_size");
    w.uint16(record_size);
    w.string("ip_version");
    w.uint16(ip_version);
    w.string("database_type");
    w.string("Test-Country");
    w.string("languages");
    w.array(1);
    w.string("en");
    w.into_bytes()
}

/// A country record shaped like the GeoLite2 country database.
pub fn country_record(w: &mut Writer, iso_code: &str, en: &str, localized: Option<(&str, &str)>) {
    w.map(1);
    w.string("country");
    w.map(2);
    w.string("iso_code");
    w.string(iso_code);
    w.string("names");
    w.map(if localized.is_some() { 2 } else { 1 });
    w.string("en");
    w.string(en);
    if let Some((lang, name)) = localized {
        w.string(lang);
        w.string(name);
    }
}

/// An ASN record shaped like the GeoLite2 ASN database.
pub fn asn_record(w: &mut Writer, number: u32, organization: &str) {
    w.map(2);
    w.string("autonomous_system_number");
    w.uint32(number);
    w.string("autonomous_system_organization");
    w.string(organization);
}
