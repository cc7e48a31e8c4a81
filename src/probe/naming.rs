//! Renaming located nodes from a template

use super::geo::GeoRecord;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Template used when the caller supplies none
pub const DEFAULT_TEMPLATE: &str = "{country} {seq}";

/// Rendered by `{flag}` when the country code is missing or malformed
const UNKNOWN_FLAG: &str = "\u{1F3F3}\u{FE0F}";

const REGIONAL_INDICATOR_A: u32 = 0x1F1E6;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown placeholder `{{{0}}}`")]
    UnknownPlaceholder(String),

    #[error("unclosed placeholder starting at byte {0}")]
    Unclosed(usize),
}

/// The values a template can refer to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
    Country,
    /// ISO country code
    Code,
    /// Flag emoji of the country code, a white flag when there is none
    Flag,
    City,
    /// Position within the node's group, zero padded
    Seq,
    /// ISP, falling back to the organisation
    Isp,
    Org,
    /// `AS<number>`
    Asn,
    /// Name before renaming
    Name,
    /// Best delay, `<n>ms`
    Latency,
}

impl Placeholder {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "country" => Self::Country,
            "code" => Self::Code,
            "flag" => Self::Flag,
            "city" => Self::City,
            "seq" => Self::Seq,
            "isp" => Self::Isp,
            "org" => Self::Org,
            "asn" => Self::Asn,
            "name" => Self::Name,
            "latency" => Self::Latency,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Field(Placeholder),
}

/// Everything a template can be rendered from
#[derive(Debug, Clone, Copy)]
pub struct NameContext<'a> {
    pub geo: &'a GeoRecord,
    pub seq: Option<&'a str>,
    pub name: &'a str,
    pub latency_ms: Option<u64>,
}

/// A parsed name template such as `"{country} {seq} {isp}"`.
///
/// Only the placeholders of [`Placeholder`] are recognised. Anything else in
/// braces is rejected at parse time, so a template can never do more than
/// look fields up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl NameTemplate {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut consumed = 0;

        while let Some(open) = rest.find('{') {
            if open > 0 {
                segments.push(Segment::Literal(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or(TemplateError::Unclosed(consumed + open))?;
            let name = after[..close].trim();
            let field = Placeholder::parse(name)
                .ok_or_else(|| TemplateError::UnknownPlaceholder(name.to_string()))?;
            segments.push(Segment::Field(field));

            let advance = open + 1 + close + 1;
            consumed += advance;
            rest = &rest[advance..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn uses(&self, placeholder: Placeholder) -> bool {
        self.segments.contains(&Segment::Field(placeholder))
    }

    /// Render with empty values for missing fields, collapsing runs of
    /// whitespace and trimming the result.
    pub fn render(&self, ctx: &NameContext<'_>) -> String {
        let geo = ctx.geo;
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(field) => {
                    let value = match field {
                        Placeholder::Country => geo.country.clone(),
                        Placeholder::Code => geo.country_code.clone().unwrap_or_default(),
                        Placeholder::Flag => geo
                            .country_code
                            .as_deref()
                            .and_then(flag_emoji)
                            .unwrap_or_else(|| UNKNOWN_FLAG.to_string()),
                        Placeholder::City => geo.city.clone().unwrap_or_default(),
                        Placeholder::Seq => ctx.seq.unwrap_or_default().to_string(),
                        Placeholder::Isp | Placeholder::Org => geo.isp.clone().unwrap_or_default(),
                        Placeholder::Asn => geo.asn.map(|n| format!("AS{}", n)).unwrap_or_default(),
                        Placeholder::Name => ctx.name.to_string(),
                        Placeholder::Latency => ctx
                            .latency_ms
                            .map(|ms| format!("{}ms", ms))
                            .unwrap_or_default(),
                    };
                    out.push_str(&value);
                }
            }
        }
        out.split_whitespace().collect::<Vec<_>>().join(" ")
    }
}

/// Regional indicator pair for a two-letter country code.
pub fn flag_emoji(code: &str) -> Option<String> {
    let code = code.trim();
    if code.len() != 2 || !code.bytes().all(|b| b.is_ascii_alphabetic()) {
        return None;
    }
    code.bytes()
        .map(|b| char::from_u32(REGIONAL_INDICATOR_A + u32::from(b.to_ascii_uppercase() - b'A')))
        .collect()
}

impl Default for NameTemplate {
    fn default() -> Self {
        Self {
            source: DEFAULT_TEMPLATE.to_string(),
            segments: vec![
                Segment::Field(Placeholder::Country),
                Segment::Literal(" ".to_string()),
                Segment::Field(Placeholder::Seq),
            ],
        }
    }
}

impl FromStr for NameTemplate {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for NameTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// One located node waiting for its new name
#[derive(Debug, Clone, Copy)]
pub struct NamingInput<'a> {
    pub name: &'a str,
    pub geo: &'a GeoRecord,
    pub latency_ms: Option<u64>,
}

/// Assigns names to a batch of located nodes.
///
/// Nodes are grouped by country (and city, if enabled). Members of a group
/// larger than one are numbered in input order; numbering starts from one on
/// every call.
#[derive(Debug, Clone, Default)]
pub struct Namer {
    template: NameTemplate,
    group_by_city: bool,
    append_isp: bool,
}

impl Namer {
    pub fn new(template: NameTemplate) -> Self {
        Self {
            template,
            ..Default::default()
        }
    }

    pub fn with_group_by_city(mut self, enabled: bool) -> Self {
        self.group_by_city = enabled;
        self
    }

    /// Append the ISP to templates that do not mention it already.
    pub fn with_append_isp(mut self, enabled: bool) -> Self {
        self.append_isp = enabled;
        self
    }

    fn group_key<'a>(&self, geo: &'a GeoRecord) -> (&'a str, Option<&'a str>) {
        let city = if self.group_by_city {
            geo.city.as_deref()
        } else {
            None
        };
        (geo.country.as_str(), city)
    }

    /// New name for every input, in input order. A name that renders empty
    /// falls back to the original one.
    pub fn assign(&self, nodes: &[NamingInput<'_>]) -> Vec<String> {
        let mut sizes: HashMap<(&str, Option<&str>), usize> = HashMap::new();
        for node in nodes {
            *sizes.entry(self.group_key(node.geo)).or_default() += 1;
        }

        let append_isp = self.append_isp
            && !self.template.uses(Placeholder::Isp)
            && !self.template.uses(Placeholder::Org);

        let mut cursors: HashMap<(&str, Option<&str>), usize> = HashMap::new();
        nodes
            .iter()
            .map(|node| {
                let key = self.group_key(node.geo);
                let size = sizes.get(&key).copied().unwrap_or(1);
                let seq = (size > 1).then(|| {
                    let cursor = cursors.entry(key).or_default();
                    *cursor += 1;
                    let width = size.to_string().len().max(2);
                    format!("{:0width$}", *cursor, width = width)
                });

                let ctx = NameContext {
                    geo: node.geo,
                    seq: seq.as_deref(),
                    name: node.name,
                    latency_ms: node.latency_ms,
                };
                let mut name = self.template.render(&ctx);
                if append_isp {
                    if let Some(isp) = node.geo.isp.as_deref().filter(|s| !s.trim().is_empty()) {
                        name = format!("{} {}", name, isp.trim()).trim().to_string();
                    }
                }
                if name.is_empty() {
                    node.name.to_string()
                } else {
                    name
                }
            })
            .collect()
    }
}
