//! Bootstrap token: `<8 hex ip>:<4 hex port>:<64 hex id>`, shared out of band.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;

use crate::identity::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapToken {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub id: NodeId,
}

impl BootstrapToken {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from((self.ip, self.port))
    }
}

impl fmt::Display for BootstrapToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}:{:04x}:{}", u32::from(self.ip), self.port, self.id)
    }
}

impl FromStr for BootstrapToken {
    type Err = BootstrapTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split(':');
        let (Some(ip), Some(port), Some(id), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(BootstrapTokenError::Shape);
        };
        if ip.len() != 8 || port.len() != 4 || id.len() != 64 {
            return Err(BootstrapTokenError::Shape);
        }
        let ip = u32::from_str_radix(ip, 16).map_err(|_| BootstrapTokenError::Ip)?;
        let port = u16::from_str_radix(port, 16).map_err(|_| BootstrapTokenError::Port)?;
        let id = id.parse().map_err(|_| BootstrapTokenError::Id)?;
        Ok(Self {
            ip: Ipv4Addr::from(ip),
            port,
            id,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapTokenError {
    #[error("expected <8 hex ip>:<4 hex port>:<64 hex id>")]
    Shape,
    #[error("invalid ip")]
    Ip,
    #[error("invalid port")]
    Port,
    #[error("invalid node id")]
    Id,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    #[test]
    fn format_and_parse() {
        let id = Identity::generate().id();
        let token = BootstrapToken {
            ip: Ipv4Addr::new(192, 168, 1, 20),
            port: 0x0dab,
            id,
        };
        let s = token.to_string();
        assert!(s.starts_with("c0a80114:0dab:"));
        assert_eq!(s.parse::<BootstrapToken>().unwrap(), token);
        assert_eq!(token.addr(), "192.168.1.20:3499".parse().unwrap());
    }

    #[test]
    fn rejects_bad_tokens() {
        let id = Identity::generate().id();
        assert!(matches!(
            "c0a80114:0dab".parse::<BootstrapToken>(),
            Err(BootstrapTokenError::Shape)
        ));
        assert!(matches!(
            format!("c0a8011:0dab:{id}").parse::<BootstrapToken>(),
            Err(BootstrapTokenError::Shape)
        ));
        assert!(matches!(
            format!("zza80114:0dab:{id}").parse::<BootstrapToken>(),
            Err(BootstrapTokenError::Ip)
        ));
        assert!(matches!(
            format!("c0a80114:0dab:{id}:extra").parse::<BootstrapToken>(),
            Err(BootstrapTokenError::Shape)
        ));
        let bad_id = "g".repeat(64);
        assert!(matches!(
            format!("c0a80114:0dab:{bad_id}").parse::<BootstrapToken>(),
            Err(BootstrapTokenError::Id)
        ));
    }
}
