//! Data types for addresses of nodes in DICOM networks.

use std::{
    net::{AddrParseError, SocketAddr, ToSocketAddrs},
    str::FromStr,
};

use snafu::{ResultExt, Snafu};

/// A full address to a DICOM node:
/// an application entity title plus a network socket address.
///
/// These addresses can be serialized and parsed
/// with the syntax `{ae_title}@{socket_address}`.
///
/// # Example
///
/// ```
/// # use dicom_dul::FullAeAddr;
/// # use std::net::SocketAddr;
/// #
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: FullAeAddr = "STORE-SCP@127.0.0.1:104".parse()?;
/// assert_eq!(addr.ae_title(), "STORE-SCP");
/// assert_eq!(addr.socket_addr(), SocketAddr::from(([127, 0, 0, 1], 104)));
/// assert_eq!(&addr.to_string(), "STORE-SCP@127.0.0.1:104");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FullAeAddr {
    ae_title: String,
    socket_addr: SocketAddr,
}

impl FullAeAddr {
    /// Create an AE address from its constituent parts.
    pub fn new(ae_title: impl Into<String>, socket_addr: SocketAddr) -> Self {
        FullAeAddr {
            ae_title: ae_title.into(),
            socket_addr,
        }
    }

    /// Retrieve the application entity title portion.
    pub fn ae_title(&self) -> &str {
        &self.ae_title
    }

    /// Retrieve the socket address portion.
    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }
}

impl From<(String, SocketAddr)> for FullAeAddr {
    fn from((ae_title, socket_addr): (String, SocketAddr)) -> Self {
        Self::new(ae_title, socket_addr)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Snafu)]
pub enum ParseAeAddressError {
    /// Missing `@` in full AE address
    MissingPart,

    /// The application entity title portion is empty
    EmptyAeTitle,

    /// Could not parse socket address
    ParseSocketAddress { source: AddrParseError },
}

impl FromStr for FullAeAddr {
    type Err = ParseAeAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ae_title, addr) = s.split_once('@').ok_or(ParseAeAddressError::MissingPart)?;
        if ae_title.trim().is_empty() {
            return Err(ParseAeAddressError::EmptyAeTitle);
        }
        Ok(FullAeAddr {
            ae_title: ae_title.to_string(),
            socket_addr: addr.parse().context(ParseSocketAddressSnafu)?,
        })
    }
}

impl ToSocketAddrs for FullAeAddr {
    type Iter = std::option::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        self.socket_addr.to_socket_addrs()
    }
}

impl std::fmt::Display for FullAeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.ae_title)?;
        f.write_str("@")?;
        std::fmt::Display::fmt(&self.socket_addr, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_ae_addr() {
        let addr: FullAeAddr = "QUERY-SCP@192.168.1.8:1045".parse().unwrap();
        assert_eq!(addr.ae_title(), "QUERY-SCP");
        assert_eq!(
            addr.socket_addr(),
            SocketAddr::from(([192, 168, 1, 8], 1045))
        );
        assert_eq!(addr.to_string(), "QUERY-SCP@192.168.1.8:1045");
    }

    #[test]
    fn reject_malformed_ae_addr() {
        assert!(matches!(
            "192.168.1.8:1045".parse::<FullAeAddr>(),
            Err(ParseAeAddressError::MissingPart)
        ));
        assert!(matches!(
            "@192.168.1.8:1045".parse::<FullAeAddr>(),
            Err(ParseAeAddressError::EmptyAeTitle)
        ));
        assert!(matches!(
            "SCP@nonsense".parse::<FullAeAddr>(),
            Err(ParseAeAddressError::ParseSocketAddress { .. })
        ));
    }
}
