use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Address family of a prefix or next-hop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn af(self) -> u8 {
        match self {
            Family::V4 => libc::AF_INET as u8,
            Family::V6 => libc::AF_INET6 as u8,
        }
    }

    pub fn from_af(af: u8) -> Option<Family> {
        match af as i32 {
            libc::AF_INET => Some(Family::V4),
            libc::AF_INET6 => Some(Family::V6),
            _ => None,
        }
    }

    pub fn max_mask_len(self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }

    pub fn unspecified(self) -> IpAddr {
        match self {
            Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

/// An address with a prefix length, used both as a destination prefix and
/// (with `mask_len == 0`) as a neighbour address key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AfAddr {
    pub addr: IpAddr,
    pub mask_len: u8,
}

impl AfAddr {
    pub fn new(addr: IpAddr, mask_len: u8) -> AfAddr {
        AfAddr { addr, mask_len }
    }

    /// The family's all-zero address with a zero mask.
    pub fn unspec(family: Family) -> AfAddr {
        AfAddr {
            addr: family.unspecified(),
            mask_len: 0,
        }
    }

    /// Neighbour key form: same address, mask stripped.
    pub fn host(addr: IpAddr) -> AfAddr {
        AfAddr { addr, mask_len: 0 }
    }

    pub fn family(&self) -> Family {
        match self.addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

impl From<cidr::IpCidr> for AfAddr {
    fn from(cidr: cidr::IpCidr) -> AfAddr {
        AfAddr {
            addr: cidr.first_address(),
            mask_len: cidr.network_length(),
        }
    }
}

impl fmt::Display for AfAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.mask_len)
    }
}

impl fmt::Debug for AfAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.mask_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cidr_conversion() -> anyhow::Result<()> {
        let a: AfAddr = "192.0.2.128/25".parse::<cidr::IpCidr>()?.into();
        assert_eq!(a.family(), Family::V4);
        assert_eq!(a.mask_len, 25);
        assert_eq!(a.to_string(), "192.0.2.128/25");

        let b: AfAddr = "2001:db8::/48".parse::<cidr::IpCidr>()?.into();
        assert_eq!(b.family(), Family::V6);
        assert_eq!(b.mask_len, 48);

        // a bare address takes the family's full mask
        let c: AfAddr = "198.51.100.7".parse::<cidr::IpCidr>()?.into();
        assert_eq!(c.mask_len, 32);

        Ok(())
    }

    #[test]
    fn unspec_is_family_specific() {
        assert_ne!(AfAddr::unspec(Family::V4), AfAddr::unspec(Family::V6));
        assert_eq!(AfAddr::unspec(Family::V4).mask_len, 0);
    }
}
