//! Input validation for values that end up in rule text
//!
//! Everything here runs at the boundary (CLI flags, scenario files, parsed
//! client output) so the rule model only ever holds valid values.

use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a port range.
///
/// # Errors
///
/// Returns `Err` if:
/// - Either port is 0
/// - Start port is greater than end port
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16), String> {
    validate_port(start)?;
    validate_port(end)?;

    if start > end {
        Err("Start port must be less than or equal to end port".to_string())
    } else {
        Ok((start, end))
    }
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - 1 to 15 characters (IFNAMSIZ - 1)
/// - ASCII alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Interface name cannot be empty".to_string());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Informational warning for a Meshnet peer address outside 100.64.0.0/10.
///
/// Does not block validation: the check still runs, it just cannot match
/// any daemon-installed FORWARD rule.
pub fn check_meshnet_peer(ip: Ipv4Addr) -> Option<String> {
    let octets = ip.octets();
    if octets[0] == 100 && (64..=127).contains(&octets[1]) {
        None
    } else {
        Some(format!("{ip} is outside the Meshnet range 100.64.0.0/10"))
    }
}

/// Informational warning for allowlisted subnets the daemon treats specially.
pub fn check_allowlisted_subnet(network: Ipv4Network) -> Option<String> {
    if network.prefix() == 0 {
        return Some("Allowlisting 0.0.0.0/0 bypasses the VPN for all traffic".to_string());
    }
    if network.network().octets()[0] == 127 {
        return Some("Loopback range (127.x) - loopback traffic never reaches these rules".to_string());
    }
    if network.network().octets()[0] == 100 && (64..=127).contains(&network.network().octets()[1]) {
        return Some("Overlaps the Meshnet range 100.64.0.0/10".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_port_zero() {
        assert!(validate_port(0).is_err());
    }

    #[test]
    fn test_validate_port_valid() {
        assert_eq!(validate_port(1).unwrap(), 1);
        assert_eq!(validate_port(53).unwrap(), 53);
        assert_eq!(validate_port(65535).unwrap(), 65535);
    }

    #[test]
    fn test_validate_port_range_valid() {
        assert_eq!(validate_port_range(80, 80).unwrap(), (80, 80));
        assert_eq!(validate_port_range(3000, 3100).unwrap(), (3000, 3100));
    }

    #[test]
    fn test_validate_port_range_invalid() {
        assert!(validate_port_range(0, 100).is_err());
        assert!(validate_port_range(100, 0).is_err());
        assert!(validate_port_range(100, 50).is_err());
    }

    #[test]
    fn test_validate_interface_valid() {
        assert!(validate_interface("eth0").is_ok());
        assert!(validate_interface("br0.100").is_ok());
        assert!(validate_interface("nordlynx").is_ok());
        assert!(validate_interface("enp3s0").is_ok());
    }

    #[test]
    fn test_validate_interface_invalid() {
        assert!(validate_interface("").is_err());
        assert!(validate_interface(".").is_err());
        assert!(validate_interface("..").is_err());
        assert!(validate_interface("eth0 ; rm -rf /").is_err());
        assert!(validate_interface("test|pipe").is_err());
        assert!(validate_interface(&"a".repeat(16)).is_err());
        assert!(validate_interface(&"a".repeat(15)).is_ok());
    }

    #[test]
    fn test_check_meshnet_peer() {
        assert!(check_meshnet_peer(Ipv4Addr::new(100, 64, 0, 5)).is_none());
        assert!(check_meshnet_peer(Ipv4Addr::new(100, 127, 255, 1)).is_none());
        assert!(check_meshnet_peer(Ipv4Addr::new(100, 128, 0, 1)).is_some());
        assert!(check_meshnet_peer(Ipv4Addr::new(192, 168, 1, 2)).is_some());
    }

    #[test]
    fn test_check_allowlisted_subnet() {
        let net = |s: &str| s.parse::<Ipv4Network>().unwrap();
        assert!(check_allowlisted_subnet(net("0.0.0.0/0")).is_some());
        assert!(check_allowlisted_subnet(net("127.0.0.0/8")).is_some());
        assert!(check_allowlisted_subnet(net("100.100.0.0/16")).is_some());
        assert!(check_allowlisted_subnet(net("192.168.1.0/24")).is_none());
    }
}
