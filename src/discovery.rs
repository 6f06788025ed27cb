use std::net::{IpAddr, Ipv4Addr};

/// Marker prefix that lets a scanner tell a sync endpoint code apart from
/// unrelated QR content.
pub const TOKEN_PREFIX: &str = "record-list-for-sync";

/// Encodes a sync endpoint as the QR payload `<prefix>:http://<ip>:<port>`.
pub fn encode_endpoint(ip: &str, port: u16) -> String {
  format!("{TOKEN_PREFIX}:http://{ip}:{port}")
}

/// Returns the endpoint URL iff the token carries the exact prefix. Any
/// other scanned content is a non-match, not an error.
pub fn decode_endpoint(token: &str) -> Option<String> {
  let url = token.strip_prefix(TOKEN_PREFIX)?.strip_prefix(':')?;
  if url.is_empty() {
    return None;
  }
  Some(url.to_string())
}

/// Picks the host's LAN-reachable IPv4 address: first private-range
/// address over all interfaces, skipping loopback and non-IPv4 entries.
pub fn local_lan_ipv4() -> Option<Ipv4Addr> {
  let interfaces = local_ip_address::list_afinet_netifas().ok()?;
  for (_name, ip) in interfaces {
    if let IpAddr::V4(v4) = ip {
      if v4.is_loopback() {
        continue;
      }
      if v4.is_private() {
        return Some(v4);
      }
    }
  }
  None
}

/// String form with the `0.0.0.0` fallback; callers must treat that value
/// as "no usable LAN address" when hosting.
pub fn local_ip_string() -> String {
  local_lan_ipv4()
    .map(|ip| ip.to_string())
    .unwrap_or_else(|| "0.0.0.0".to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn endpoint_round_trip() {
    let token = encode_endpoint("192.168.1.23", 8080);
    assert_eq!(token, "record-list-for-sync:http://192.168.1.23:8080");
    assert_eq!(decode_endpoint(&token).as_deref(), Some("http://192.168.1.23:8080"));
  }

  #[test]
  fn unrelated_content_is_a_silent_non_match() {
    assert_eq!(decode_endpoint("https://example.com/menu"), None);
    assert_eq!(decode_endpoint("WIFI:T:WPA;S:cafe;P:pass;;"), None);
    assert_eq!(decode_endpoint(""), None);
  }

  #[test]
  fn prefix_must_match_exactly() {
    assert_eq!(decode_endpoint("record-list-for-syncX:http://10.0.0.2:80"), None);
    assert_eq!(decode_endpoint("record-list-for-sync"), None);
    assert_eq!(decode_endpoint("record-list-for-sync:"), None);
    assert_eq!(decode_endpoint("Record-List-For-Sync:http://10.0.0.2:80"), None);
  }
}
