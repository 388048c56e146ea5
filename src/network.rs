use std::fmt::{Display, Formatter};
use std::net::IpAddr;

use ipnet::IpNet;
use rand::Rng;

use crate::errors::CommandError;

/// Address family spanned by the CIDRs a machine is attached to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IpFamily {
    IPv4,
    IPv6,
    DualStack,
}

impl Display for IpFamily {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            IpFamily::IPv4 => "IPv4",
            IpFamily::IPv6 => "IPv6",
            IpFamily::DualStack => "IPv4+IPv6",
        })
    }
}

impl IpFamily {
    pub fn has_ipv6(&self) -> bool {
        matches!(self, IpFamily::IPv6 | IpFamily::DualStack)
    }
}

impl std::str::FromStr for IpFamily {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "ipv4" => Ok(IpFamily::IPv4),
            "ipv6" => Ok(IpFamily::IPv6),
            "ipv4+ipv6" | "dualstack" | "dual-stack" => Ok(IpFamily::DualStack),
            _ => Err(()),
        }
    }
}

pub fn parse_cidr(cidr: &str) -> Result<IpNet, CommandError> {
    cidr.trim()
        .parse::<IpNet>()
        .map_err(|e| CommandError::new(format!("Cannot parse CIDR `{cidr}`"), Some(e.to_string())))
}

/// Returns the dotted/colon netmask of a CIDR, e.g. `10.0.0.0/16` -> `255.255.0.0`.
pub fn cidr_netmask(cidr: &str) -> Result<String, CommandError> {
    Ok(parse_cidr(cidr)?.netmask().to_string())
}

pub fn ip_family_of_cidrs(cidrs: &[String]) -> Result<IpFamily, CommandError> {
    let mut has_v4 = false;
    let mut has_v6 = false;

    for cidr in cidrs {
        match parse_cidr(cidr)? {
            IpNet::V4(_) => has_v4 = true,
            IpNet::V6(_) => has_v6 = true,
        }
    }

    match (has_v4, has_v6) {
        (true, true) => Ok(IpFamily::DualStack),
        (true, false) => Ok(IpFamily::IPv4),
        (false, true) => Ok(IpFamily::IPv6),
        (false, false) => Err(CommandError::new_from_safe_message(
            "Cannot detect IP family: no CIDR given".to_string(),
        )),
    }
}

pub fn is_link_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => ip.is_link_local(),
        IpAddr::V6(ip) => (ip.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Random locally-administered unicast MAC: bit 0x02 of the first octet set,
/// multicast bit 0x01 cleared.
pub fn random_local_mac() -> String {
    let mut octets: [u8; 6] = rand::rng().random();
    octets[0] = (octets[0] | 0x02) & 0xfe;
    octets.iter().map(|o| format!("{o:02x}")).collect::<Vec<_>>().join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_netmask() {
        // setup:
        let test_cases = vec![
            ("10.0.0.0/16", "255.255.0.0"),
            ("192.168.1.0/24", "255.255.255.0"),
            ("172.16.0.0/12", "255.240.0.0"),
        ];

        for (cidr, expected) in test_cases {
            // execute & verify:
            assert_eq!(cidr_netmask(cidr).unwrap(), expected);
        }

        assert!(cidr_netmask("not-a-cidr").is_err());
    }

    #[test]
    fn test_ip_family_of_cidrs() {
        // execute & verify:
        assert_eq!(
            ip_family_of_cidrs(&["10.0.0.0/16".to_string()]).unwrap(),
            IpFamily::IPv4
        );
        assert_eq!(
            ip_family_of_cidrs(&["fd00::/64".to_string()]).unwrap(),
            IpFamily::IPv6
        );
        assert_eq!(
            ip_family_of_cidrs(&["10.0.0.0/16".to_string(), "fd00::/64".to_string()]).unwrap(),
            IpFamily::DualStack
        );
        assert!(ip_family_of_cidrs(&[]).is_err());
    }

    #[test]
    fn test_is_link_local() {
        // execute & verify:
        assert!(is_link_local("169.254.10.1".parse().unwrap()));
        assert!(is_link_local("fe80::1".parse().unwrap()));
        assert!(!is_link_local("10.0.0.1".parse().unwrap()));
        assert!(!is_link_local("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_random_local_mac_flags() {
        for _ in 0..64 {
            // execute:
            let mac = random_local_mac();

            // verify:
            let octets: Vec<u8> = mac.split(':').map(|o| u8::from_str_radix(o, 16).unwrap()).collect();
            assert_eq!(octets.len(), 6);
            assert_eq!(octets[0] & 0x02, 0x02, "locally-administered bit must be set");
            assert_eq!(octets[0] & 0x01, 0x00, "multicast bit must be cleared");
        }
    }
}
