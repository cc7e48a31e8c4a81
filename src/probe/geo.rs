//! Geolocation records and the sources they are obtained from

use crate::http::HttpClient;
use crate::mmdb::decoder::Value as DbValue;
use crate::mmdb::error::DecodeError;
use crate::mmdb::Database;
use crate::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error};

/// Default remote geolocation API
pub const DEFAULT_GEO_API: &str =
    "http://ip-api.com/json?fields=status,message,country,countryCode,city,isp,org,as";

/// Default service answering with the caller's public IP as plain text
pub const DEFAULT_IP_URL: &str = "http://checkip.amazonaws.com";

/// Country bucket for nodes whose egress could not be resolved
pub const UNKNOWN_COUNTRY: &str = "unknown";

static AS_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^AS(\d+)\s*(.*)$").expect("Invalid AS number regex"));

/// Geographic and network identity of an egress address.
///
/// Every source is normalised into this shape, so naming never needs to know
/// where a record came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GeoRecord {
    pub country: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    /// ISP or organisation operating the address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asn: Option<u32>,
}

impl GeoRecord {
    pub fn new(country: impl Into<String>) -> Self {
        Self {
            country: country.into(),
            ..Default::default()
        }
    }

    pub fn unknown() -> Self {
        Self::new(UNKNOWN_COUNTRY)
    }

    pub fn is_unknown(&self) -> bool {
        self.country == UNKNOWN_COUNTRY
    }

    pub fn with_isp(mut self, isp: impl Into<String>) -> Self {
        self.isp = Some(isp.into());
        self
    }

    pub fn with_city(mut self, city: impl Into<String>) -> Self {
        self.city = Some(city.into());
        self
    }

    /// Normalise a geolocation API response.
    ///
    /// Understands the field names of the common free APIs. Returns `None` for
    /// `"status": "fail"` replies and replies without any country.
    pub fn from_api(body: &Value) -> Option<Self> {
        if body.get("status").and_then(Value::as_str) == Some("fail") {
            let reason = body.get("message").and_then(Value::as_str).unwrap_or_default();
            debug!(reason, "geolocation API reported failure");
            return None;
        }

        let text = |key: &str| {
            body.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let first = |keys: &[&str]| keys.iter().find_map(|k| text(*k));

        let country_code = first(&["countryCode", "country_code"]);
        let country = first(&["country", "country_name"]).or_else(|| country_code.clone())?;

        let as_field = first(&["as"]);
        let (as_number, as_name) = match as_field.as_deref().and_then(|s| AS_NUMBER.captures(s)) {
            Some(caps) => (
                caps[1].parse::<u32>().ok(),
                Some(caps[2].trim().to_string()).filter(|s| !s.is_empty()),
            ),
            None => (None, as_field.clone()),
        };

        let isp = first(&["isp", "org", "organization", "aso", "asn_org", "asn_organization"])
            .map(|s| strip_as_prefix(&s))
            .or(as_name);

        let asn = match body.get("asn") {
            Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Some(Value::String(s)) => parse_as_number(s),
            _ => None,
        }
        .or(as_number)
        .or_else(|| text("org").as_deref().and_then(parse_as_number));

        Some(Self {
            country,
            country_code,
            city: text("city"),
            isp,
            asn,
        })
    }
}

impl std::fmt::Display for GeoRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<&str> = [Some(self.country.as_str()), self.city.as_deref(), self.isp.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}

fn parse_as_number(s: &str) -> Option<u32> {
    let s = s.trim();
    AS_NUMBER
        .captures(s)
        .and_then(|caps| caps[1].parse().ok())
        .or_else(|| s.parse().ok())
}

/// `"AS15169 Google LLC"` becomes `"Google LLC"`; anything else is kept.
fn strip_as_prefix(s: &str) -> String {
    match AS_NUMBER.captures(s) {
        Some(caps) if !caps[2].trim().is_empty() => caps[2].trim().to_string(),
        _ => s.to_string(),
    }
}

/// The country and (optional) ASN databases used for offline lookups
#[derive(Debug)]
pub struct GeoDatabases {
    country: Database,
    asn: Option<Database>,
}

impl GeoDatabases {
    pub fn new(country: Database, asn: Option<Database>) -> Self {
        Self { country, asn }
    }

    /// Load both database files. Any format error aborts.
    pub fn open<P: AsRef<Path>>(country: P, asn: Option<P>) -> Result<Self> {
        let country = Database::open(country.as_ref())?;
        let asn = asn.map(|p| Database::open(p.as_ref())).transpose()?;
        Ok(Self::new(country, asn))
    }

    pub fn country_db(&self) -> &Database {
        &self.country
    }

    pub fn asn_db(&self) -> Option<&Database> {
        self.asn.as_ref()
    }

    /// Look up `ip`, preferring country names in `lang` and falling back to
    /// English and then the ISO code.
    pub fn lookup(&self, ip: Ipv4Addr, lang: &str) -> std::result::Result<Option<GeoRecord>, DecodeError> {
        let Some(record) = self.country.lookup(ip)? else {
            return Ok(None);
        };
        let country_value = record
            .get("country")
            .or_else(|| record.get("registered_country"));
        let Some(country_value) = country_value else {
            return Ok(None);
        };

        let country_code = country_value.get("iso_code").and_then(DbValue::as_str);
        let name = localized_name(country_value, lang).or(country_code);
        let Some(name) = name else {
            return Ok(None);
        };

        let mut geo = GeoRecord::new(name);
        geo.country_code = country_code.map(str::to_string);
        geo.city = record
            .get("city")
            .and_then(|city| localized_name(city, lang))
            .map(str::to_string);

        if let Some(asn_db) = &self.asn {
            if let Some(asn) = asn_db.lookup(ip)? {
                geo.isp = asn
                    .get("autonomous_system_organization")
                    .and_then(DbValue::as_str)
                    .map(str::to_string);
                geo.asn = asn
                    .get("autonomous_system_number")
                    .and_then(DbValue::as_u64)
                    .and_then(|n| u32::try_from(n).ok());
            }
        }
        Ok(Some(geo))
    }
}

fn localized_name<'a>(value: &'a DbValue, lang: &str) -> Option<&'a str> {
    let names = value.get("names")?;
    names
        .get(lang)
        .or_else(|| names.get("en"))
        .and_then(DbValue::as_str)
        .filter(|s| !s.is_empty())
}

/// Where geolocation answers come from. Queries are always issued through a
/// client routed over the node under test.
#[derive(Debug, Clone)]
pub enum GeoSource {
    /// A JSON geolocation API reporting on the caller's address
    RemoteApi { url: String },
    /// Ask `ip_url` for the egress address, then look it up offline
    LocalDatabase {
        ip_url: String,
        databases: Arc<GeoDatabases>,
        lang: String,
    },
}

impl GeoSource {
    pub fn remote(url: impl Into<String>) -> Self {
        Self::RemoteApi { url: url.into() }
    }

    pub fn local(ip_url: impl Into<String>, databases: Arc<GeoDatabases>, lang: impl Into<String>) -> Self {
        Self::LocalDatabase {
            ip_url: ip_url.into(),
            databases,
            lang: lang.into(),
        }
    }

    /// Identifies the source in cache keys, so answers from different
    /// sources never mix.
    pub fn cache_tag(&self) -> String {
        match self {
            Self::RemoteApi { url } => url.clone(),
            Self::LocalDatabase {
                ip_url,
                databases,
                lang,
            } => format!(
                "local:{}:{}:{}",
                databases
                    .country_db()
                    .metadata()
                    .database_type
                    .as_deref()
                    .unwrap_or("mmdb"),
                lang,
                ip_url
            ),
        }
    }

    /// Resolve the egress seen by `client`. `None` if it cannot be resolved.
    pub async fn fetch(&self, client: &HttpClient) -> Option<GeoRecord> {
        match self {
            Self::RemoteApi { url } => {
                let response = match client.get_text(url).await {
                    Ok(r) => r,
                    Err(e) => {
                        debug!(error = %e, "geolocation request failed");
                        return None;
                    }
                };
                if !response.is_success() {
                    debug!(status = response.status, "geolocation API returned an error status");
                    return None;
                }
                match serde_json::from_str::<Value>(&response.body) {
                    Ok(body) => GeoRecord::from_api(&body),
                    Err(e) => {
                        debug!(error = %e, "geolocation API returned invalid JSON");
                        None
                    }
                }
            }
            Self::LocalDatabase {
                ip_url,
                databases,
                lang,
            } => {
                let response = match client.get_text(ip_url).await {
                    Ok(r) if r.is_success() => r,
                    Ok(r) => {
                        debug!(status = r.status, "egress IP service returned an error status");
                        return None;
                    }
                    Err(e) => {
                        debug!(error = %e, "egress IP request failed");
                        return None;
                    }
                };
                let Ok(ip) = response.body.trim().parse::<Ipv4Addr>() else {
                    debug!(body = %response.body.trim(), "egress IP is not IPv4");
                    return None;
                };
                match databases.lookup(ip, lang) {
                    Ok(geo) => geo,
                    Err(e) => {
                        error!(ip = %ip, error = %e, "geolocation database lookup failed");
                        None
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::serve;
    use crate::http::HttpConfig;
    use crate::mmdb::testutil::{asn_record, country_record, TreeBuilder, Writer};
    use axum::{routing::get, Router};
    use serde_json::json;

    fn country_db() -> Database {
        let mut w = Writer::new();
        let us = w.len();
        country_record(&mut w, "US", "United States", Some(("zh-CN", "美国")));
        let jp = w.len();
        country_record(&mut w, "JP", "Japan", None);

        let mut tree = TreeBuilder::new(24, 4);
        tree.insert_v4([1, 2, 3, 4], 32, us);
        tree.insert_v4([5, 6, 7, 0], 24, jp);
        Database::load(tree.build(&w.into_bytes())).unwrap()
    }

    fn asn_db() -> Database {
        let mut w = Writer::new();
        let google = w.len();
        asn_record(&mut w, 15169, "Google LLC");
        let mut tree = TreeBuilder::new(24, 4);
        tree.insert_v4([1, 2, 3, 0], 24, google);
        Database::load(tree.build(&w.into_bytes())).unwrap()
    }

    #[test]
    fn test_from_ip_api() {
        let body = json!({
            "status": "success",
            "country": "United States",
            "countryCode": "US",
            "city": "Ashburn",
            "isp": "Google LLC",
            "org": "Google Cloud",
            "as": "AS15169 Google LLC"
        });
        let geo = GeoRecord::from_api(&body).unwrap();
        assert_eq!(geo.country, "United States");
        assert_eq!(geo.country_code.as_deref(), Some("US"));
        assert_eq!(geo.city.as_deref(), Some("Ashburn"));
        assert_eq!(geo.isp.as_deref(), Some("Google LLC"));
        assert_eq!(geo.asn, Some(15169));
    }

    #[test]
    fn test_from_other_api_shapes() {
        let ipinfo = json!({"ip": "8.8.8.8", "country": "US", "org": "AS15169 Google LLC"});
        let geo = GeoRecord::from_api(&ipinfo).unwrap();
        assert_eq!(geo.country, "US");
        assert_eq!(geo.isp.as_deref(), Some("Google LLC"));
        assert_eq!(geo.asn, Some(15169));

        let ipapi_co = json!({"country_name": "Japan", "country_code": "JP", "asn": "AS2516", "org": "KDDI"});
        let geo = GeoRecord::from_api(&ipapi_co).unwrap();
        assert_eq!(geo.country, "Japan");
        assert_eq!(geo.country_code.as_deref(), Some("JP"));
        assert_eq!(geo.asn, Some(2516));
        assert_eq!(geo.isp.as_deref(), Some("KDDI"));

        let only_as = json!({"countryCode": "DE", "as": "AS3320 Deutsche Telekom AG"});
        let geo = GeoRecord::from_api(&only_as).unwrap();
        assert_eq!(geo.country, "DE");
        assert_eq!(geo.isp.as_deref(), Some("Deutsche Telekom AG"));

        let aso = json!({"country": "France", "aso": "OVH SAS", "asn": 16276});
        let geo = GeoRecord::from_api(&aso).unwrap();
        assert_eq!(geo.isp.as_deref(), Some("OVH SAS"));
        assert_eq!(geo.asn, Some(16276));
    }

    #[test]
    fn test_from_api_unresolved() {
        assert!(GeoRecord::from_api(&json!({"status": "fail", "message": "reserved range"})).is_none());
        assert!(GeoRecord::from_api(&json!({"isp": "x", "country": ""})).is_none());
    }

    #[test]
    fn test_serde_and_display() {
        let geo = GeoRecord::new("Japan").with_city("Tokyo").with_isp("IIJ");
        assert_eq!(geo.to_string(), "Japan, Tokyo, IIJ");
        assert_eq!(
            serde_json::to_value(&geo).unwrap(),
            json!({"country": "Japan", "city": "Tokyo", "isp": "IIJ"})
        );
        assert!(GeoRecord::unknown().is_unknown());
        assert_eq!(GeoRecord::unknown().to_string(), "unknown");
    }

    #[test]
    fn test_local_lookup() {
        let dbs = GeoDatabases::new(country_db(), Some(asn_db()));

        let us = dbs.lookup(Ipv4Addr::new(1, 2, 3, 4), "zh-CN").unwrap().unwrap();
        assert_eq!(us.country, "美国");
        assert_eq!(us.country_code.as_deref(), Some("US"));
        assert_eq!(us.isp.as_deref(), Some("Google LLC"));
        assert_eq!(us.asn, Some(15169));

        let jp = dbs.lookup(Ipv4Addr::new(5, 6, 7, 200), "zh-CN").unwrap().unwrap();
        assert_eq!(jp.country, "Japan");
        assert_eq!(jp.isp, None);

        assert_eq!(dbs.lookup(Ipv4Addr::new(9, 9, 9, 9), "en").unwrap(), None);
    }

    #[tokio::test]
    async fn test_fetch_remote_api() {
        let app = Router::new()
            .route(
                "/json",
                get(|| async { r#"{"status":"success","country":"Japan","countryCode":"JP","isp":"IIJ"}"# }),
            )
            .route("/broken", get(|| async { "<html>" }));
        let addr = serve(app).await;
        let client = HttpClient::new(HttpConfig::default()).unwrap();

        let geo = GeoSource::remote(format!("http://{}/json", addr))
            .fetch(&client)
            .await
            .unwrap();
        assert_eq!(geo.country, "Japan");
        assert_eq!(geo.isp.as_deref(), Some("IIJ"));

        let broken = GeoSource::remote(format!("http://{}/broken", addr));
        assert!(broken.fetch(&client).await.is_none());
    }

    #[tokio::test]
    async fn test_fetch_local_database() {
        let app = Router::new()
            .route("/ip", get(|| async { "5.6.7.8\n" }))
            .route("/ipv6", get(|| async { "2001:db8::1\n" }));
        let addr = serve(app).await;
        let client = HttpClient::new(HttpConfig::default()).unwrap();
        let dbs = Arc::new(GeoDatabases::new(country_db(), None));

        let source = GeoSource::local(format!("http://{}/ip", addr), Arc::clone(&dbs), "en");
        let geo = source.fetch(&client).await.unwrap();
        assert_eq!(geo.country, "Japan");
        assert!(source.cache_tag().starts_with("local:Test-Country:en:"));

        let v6 = GeoSource::local(format!("http://{}/ipv6", addr), dbs, "en");
        assert!(v6.fetch(&client).await.is_none());
    }
}
