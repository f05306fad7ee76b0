//! Probe geolocation helpers built on the HTTP exchange.
//!
//! The probe's public IP comes from Ubuntu's GeoIP lookup service: perform a
//! GET on `ubuntu_get_url()` and hand the `Response` to `probe_ip`. Country
//! code and network owner then come from a local MaxMind database through
//! `Mmdb`.

use std::net::IpAddr;
use std::path::Path;

use maxminddb::Reader;
use serde::Deserialize;
use tracing::debug;

use crate::error::BindingError;
use crate::http::Response;

/// Ubuntu's GeoIP lookup endpoint, answering with an XML document.
pub const UBUNTU_LOOKUP_URL: &str = "https://geoip.ubuntu.com/lookup";

pub fn ubuntu_get_url() -> &'static str {
    UBUNTU_LOOKUP_URL
}

/// Extract the probe IP from a GeoIP lookup response.
///
/// Fails with `MissingField("probe IP")` unless the exchange succeeded with
/// status 200 and the body holds a well-formed `<Ip>` element.
pub fn probe_ip(response: &Response) -> Result<String, BindingError> {
    const FIELD: &str = "probe IP";
    if !response.is_success() || response.status_code()? != 200 {
        return Err(BindingError::MissingField(FIELD));
    }
    parse_probe_ip(&response.body()?).ok_or(BindingError::MissingField(FIELD))
}

/// Pull the address out of the first `<Ip>...</Ip>` element. Whitespace is
/// dropped and hex digits are lowercased.
pub fn parse_probe_ip(body: &[u8]) -> Option<String> {
    const OPEN: &[u8] = b"<Ip>";
    const CLOSE: &[u8] = b"</Ip>";
    let start = find(body, OPEN)? + OPEN.len();
    let len = find(&body[start..], CLOSE)?;
    let ip: String = body[start..start + len]
        .iter()
        .filter(|b| !b.is_ascii_whitespace())
        .map(|b| b.to_ascii_lowercase() as char)
        .collect();
    let allowed = |c: char| c.is_ascii_hexdigit() || c == '.' || c == ':';
    if !ip.chars().all(allowed) || ip.parse::<IpAddr>().is_err() {
        debug!(%ip, "rejecting malformed probe IP");
        return None;
    }
    Some(ip)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[derive(Deserialize)]
struct CountryRecord {
    registered_country: Option<IsoCode>,
}

#[derive(Deserialize)]
struct IsoCode {
    iso_code: Option<String>,
}

#[derive(Deserialize)]
struct AsnRecord {
    autonomous_system_number: Option<u32>,
    autonomous_system_organization: Option<String>,
}

/// An open MaxMind database. Lookups yield `None` for unknown or malformed
/// addresses and for records lacking the field.
pub struct Mmdb {
    reader: Reader<Vec<u8>>,
}

impl Mmdb {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BindingError> {
        let path = path.as_ref();
        let reader = Reader::open_readfile(path).map_err(|err| BindingError::DatabaseOpen {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        debug!(path = %path.display(), "opened GeoIP database");
        Ok(Self { reader })
    }

    /// Country code of the network the address is registered to.
    pub fn lookup_cc(&self, ip: &str) -> Option<String> {
        self.lookup::<CountryRecord>(ip)?
            .registered_country?
            .iso_code
    }

    /// Autonomous system number announcing the address.
    pub fn lookup_asn(&self, ip: &str) -> Option<u32> {
        self.lookup::<AsnRecord>(ip)?.autonomous_system_number
    }

    /// Organization owning the autonomous system.
    pub fn lookup_org(&self, ip: &str) -> Option<String> {
        self.lookup::<AsnRecord>(ip)?.autonomous_system_organization
    }

    fn lookup<T: for<'de> Deserialize<'de>>(&self, ip: &str) -> Option<T> {
        let ip: IpAddr = ip.trim().parse().ok()?;
        self.reader.lookup(ip).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_DB: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../test-vectors/geoip-test.mmdb");

    #[test]
    fn lookup_url_is_ubuntu() {
        assert_eq!(ubuntu_get_url(), "https://geoip.ubuntu.com/lookup");
    }

    #[test]
    fn probe_ip_is_read_from_xml() {
        let body = b"<Response>\n  <Ip>130.25.90.231</Ip>\n  <Status>OK</Status>\n</Response>";
        assert_eq!(parse_probe_ip(body).unwrap(), "130.25.90.231");
    }

    #[test]
    fn ipv6_probe_ip_is_normalized() {
        let body = b"<Response><Ip> 2001:DB8::1 </Ip></Response>";
        assert_eq!(parse_probe_ip(body).unwrap(), "2001:db8::1");
    }

    #[test]
    fn missing_or_malformed_ip_is_rejected() {
        assert!(parse_probe_ip(b"<Response><Status>OK</Status></Response>").is_none());
        assert!(parse_probe_ip(b"<Response><Ip>1.2.3.4").is_none());
        assert!(parse_probe_ip(b"<Ip><script>1.2.3.4</script></Ip>").is_none());
        assert!(parse_probe_ip(b"<Ip>1.2.3</Ip>").is_none());
        assert!(parse_probe_ip(b"").is_none());
    }

    #[test]
    fn database_lookups() {
        let db = Mmdb::open(TEST_DB).unwrap();
        assert_eq!(db.lookup_cc("1.2.3.4").as_deref(), Some("IT"));
        assert_eq!(db.lookup_asn("1.2.3.4"), Some(30722));
        assert_eq!(db.lookup_org("1.2.3.4").as_deref(), Some("Vodafone Italia S.p.A."));
        assert_eq!(db.lookup_cc("81.2.69.160").as_deref(), Some("GB"));
        assert_eq!(db.lookup_asn("81.2.69.160"), None);
        assert_eq!(db.lookup_org("81.2.69.160"), None);
    }

    #[test]
    fn unknown_addresses_have_no_record() {
        let db = Mmdb::open(TEST_DB).unwrap();
        assert_eq!(db.lookup_cc("8.8.8.8"), None);
        assert_eq!(db.lookup_asn("not an ip"), None);
    }

    #[test]
    fn missing_database_cannot_be_opened() {
        let err = Mmdb::open("/nonexistent/geoip.mmdb").err().unwrap();
        assert!(matches!(err, BindingError::DatabaseOpen { .. }));
    }
}
