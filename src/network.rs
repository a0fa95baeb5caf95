//! Parsing of textual network addresses into CIDR ranges.

use ipnet::IpNet;
use std::net::IpAddr;
use thiserror::Error;

/// Error returned when a line cannot be turned into a network range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    /// The input is not an address, has an out-of-range octet, or carries
    /// a prefix length wider than the address family allows.
    #[error("malformed address: {0:?}")]
    Malformed(String),
}

/// Parse an address or CIDR block into a network range.
///
/// An address given without a prefix length is treated as a single host
/// (`/32` for IPv4, `/128` for IPv6). The returned network always has its
/// host bits cleared, so `192.168.1.7/24` parses as `192.168.1.0/24`.
pub fn parse_network(input: &str) -> Result<IpNet, AddressError> {
    let text = input.trim();
    let malformed = || AddressError::Malformed(text.to_string());

    let net = match text.split_once('/') {
        Some((addr, prefix)) => {
            let addr: IpAddr = addr.parse().map_err(|_| malformed())?;
            if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed());
            }
            let prefix: u8 = prefix.parse().map_err(|_| malformed())?;
            IpNet::new(addr, prefix).map_err(|_| malformed())?
        }
        None => {
            let addr: IpAddr = text.parse().map_err(|_| malformed())?;
            let host = if addr.is_ipv4() { 32 } else { 128 };
            IpNet::new(addr, host).map_err(|_| malformed())?
        }
    };

    Ok(net.trunc())
}
