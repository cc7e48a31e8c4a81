//! Reading and writing descriptor lists

use super::descriptor::ProxyDescriptor;
use crate::Result;
use anyhow::{anyhow, Context};
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Parser for descriptor lists stored as JSON
pub struct DescriptorParser;

impl DescriptorParser {
    /// Parse descriptors from JSON text.
    ///
    /// Accepts either a bare array or an object with a `proxies` array, which
    /// is how kernel configs and subscription exports usually look. Entries
    /// that are not objects are skipped.
    pub fn parse_str(content: &str) -> Result<Vec<ProxyDescriptor>> {
        let value: Value = serde_json::from_str(content).context("input is not valid JSON")?;
        let entries = match value {
            Value::Array(entries) => entries,
            Value::Object(mut object) => match object.remove("proxies") {
                Some(Value::Array(entries)) => entries,
                _ => return Err(anyhow!("expected an array or an object with a \"proxies\" array")),
            },
            _ => return Err(anyhow!("expected an array or an object with a \"proxies\" array")),
        };

        Ok(entries
            .into_iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                let descriptor = ProxyDescriptor::from_value(entry);
                if descriptor.is_none() {
                    warn!(index, "skipping entry that is not an object");
                }
                descriptor
            })
            .collect())
    }

    /// Parse descriptors from a file
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<Vec<ProxyDescriptor>> {
        let path = path.as_ref();
        let content =
            fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse_str(&content)
    }

    /// Serialise descriptors as a JSON array
    pub fn to_string(descriptors: &[ProxyDescriptor], pretty: bool) -> Result<String> {
        let text = if pretty {
            serde_json::to_string_pretty(descriptors)?
        } else {
            serde_json::to_string(descriptors)?
        };
        Ok(text)
    }

    /// Save descriptors to a file
    pub fn save_to_file<P: AsRef<Path>>(
        descriptors: &[ProxyDescriptor],
        path: P,
        pretty: bool,
    ) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, Self::to_string(descriptors, pretty)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}
