use std::net::{Ipv4Addr, Ipv6Addr};

use url::Url;

use crate::error::ProxyError;

const PROVIDER_ID_MIN: usize = 3;
const PROVIDER_ID_MAX: usize = 64;

/// Check if an IPv4 address is private, loopback, or otherwise non-routable.
pub fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    ip.is_loopback()          // 127.0.0.0/8
        || ip.is_private()    // 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16
        || ip.is_link_local() // 169.254.0.0/16
        || ip.is_broadcast()  // 255.255.255.255
        || ip.is_unspecified() // 0.0.0.0
        || ip.octets()[0] == 100 && (ip.octets()[1] & 0xC0) == 64 // 100.64.0.0/10 (CGNAT)
}

/// Check if an IPv6 address is private, loopback, or otherwise non-routable.
pub fn is_private_ipv6(ip: &Ipv6Addr) -> bool {
    ip.is_loopback()       // ::1
        || ip.is_unspecified() // ::
        || {
            let segments = ip.segments();
            // fc00::/7 (unique local)
            (segments[0] & 0xFE00) == 0xFC00
            // fe80::/10 (link-local)
            || (segments[0] & 0xFFC0) == 0xFE80
            || match ip.to_ipv4_mapped() {
                Some(v4) => is_private_ipv4(&v4),
                None => false,
            }
        }
}

/// Provider ids appear in the monetized URL path: 3-64 ASCII alphanumerics,
/// `-` or `_`.
pub fn validate_provider_id(id: &str) -> Result<(), ProxyError> {
    if id.len() < PROVIDER_ID_MIN || id.len() > PROVIDER_ID_MAX {
        return Err(ProxyError::InvalidPayload(format!(
            "providerId must be {PROVIDER_ID_MIN}-{PROVIDER_ID_MAX} characters"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ProxyError::InvalidPayload(
            "providerId may contain only letters, digits, '-' and '_'".to_string(),
        ));
    }
    Ok(())
}

/// Validate an upstream tool server URL: http(s) with a host. Localhost and
/// private addresses are refused unless `allow_private` is set.
pub fn validate_upstream_url(url: &str, allow_private: bool) -> Result<Url, ProxyError> {
    let parsed = Url::parse(url)
        .map_err(|_| ProxyError::InvalidPayload("upstreamUrl is not a valid URL".to_string()))?;

    if parsed.scheme() != "https" && parsed.scheme() != "http" {
        return Err(ProxyError::InvalidPayload(
            "upstreamUrl must use http or https".to_string(),
        ));
    }

    let host = parsed.host().ok_or_else(|| {
        ProxyError::InvalidPayload("upstreamUrl must have a host".to_string())
    })?;

    if allow_private {
        return Ok(parsed);
    }

    let private = match host {
        url::Host::Ipv4(ip) => is_private_ipv4(&ip),
        url::Host::Ipv6(ip) => is_private_ipv6(&ip),
        url::Host::Domain(domain) => {
            let domain = domain.to_lowercase();
            domain == "localhost"
                || domain.ends_with(".localhost")
                || domain.ends_with(".local")
                || domain.ends_with(".internal")
        }
    };
    if private {
        return Err(ProxyError::InvalidPayload(
            "upstreamUrl cannot point at localhost or a private network".to_string(),
        ));
    }

    Ok(parsed)
}
