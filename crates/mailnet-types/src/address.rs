//! [`MailboxAddr`] – globally unique mailbox address.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MailError;

/// A 32-bit mailbox address.
///
/// The address packs four 8-bit fields, most significant first:
///
/// | Bits | Field | Meaning |
/// |---|---|---|
/// | 31..24 | `system` | robot / machine id |
/// | 23..16 | `class` | module class (camera, ladar, chassis, ...) |
/// | 15..8 | `instance` | instance of that class |
/// | 7..0 | `local` | mailbox number inside the module |
///
/// Address `0` is reserved for the router itself; frames addressed to it
/// carry [`Control`][crate::Control] commands.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MailboxAddr(pub u32);

impl MailboxAddr {
    /// The router's own address.
    pub const ROUTER: MailboxAddr = MailboxAddr(0);

    /// Build an address from its four fields.
    pub const fn compose(system: u8, class: u8, instance: u8, local: u8) -> Self {
        MailboxAddr(
            (system as u32) << 24 | (class as u32) << 16 | (instance as u32) << 8 | local as u32,
        )
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn system(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub const fn class(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub const fn instance(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn local(self) -> u8 {
        self.0 as u8
    }

    /// `true` for the reserved router address.
    pub const fn is_router(self) -> bool {
        self.0 == 0
    }

    /// Same module, different mailbox number.
    pub const fn with_local(self, local: u8) -> Self {
        MailboxAddr((self.0 & 0xffff_ff00) | local as u32)
    }
}

impl From<u32> for MailboxAddr {
    fn from(raw: u32) -> Self {
        MailboxAddr(raw)
    }
}

impl fmt::Display for MailboxAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}.{:02x}.{:02x}.{:02x}",
            self.system(),
            self.class(),
            self.instance(),
            self.local()
        )
    }
}

impl fmt::Debug for MailboxAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MailboxAddr({self})")
    }
}

/// Accepts the dotted form produced by `Display` (`"01.0a.00.02"`, hex
/// fields), a `0x`-prefixed hex number, or a plain decimal number.
impl FromStr for MailboxAddr {
    type Err = MailError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || MailError::Invalid(format!("bad mailbox address '{s}'"));

        if s.contains('.') {
            let fields: Vec<&str> = s.split('.').collect();
            if fields.len() != 4 {
                return Err(invalid());
            }
            let mut parts = [0u8; 4];
            for (part, field) in parts.iter_mut().zip(fields) {
                *part = u8::from_str_radix(field, 16).map_err(|_| invalid())?;
            }
            return Ok(MailboxAddr::compose(parts[0], parts[1], parts[2], parts[3]));
        }

        let raw = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => s.parse::<u32>(),
        };
        raw.map(MailboxAddr).map_err(|_| invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_and_split_fields() {
        let addr = MailboxAddr::compose(1, 0x20, 3, 4);
        assert_eq!(addr.raw(), 0x0120_0304);
        assert_eq!(addr.system(), 1);
        assert_eq!(addr.class(), 0x20);
        assert_eq!(addr.instance(), 3);
        assert_eq!(addr.local(), 4);
    }

    #[test]
    fn display_is_dotted_hex() {
        let addr = MailboxAddr::compose(1, 0x20, 3, 0xff);
        assert_eq!(addr.to_string(), "01.20.03.ff");
    }

    #[test]
    fn parse_accepts_all_three_forms() {
        let expected = MailboxAddr::compose(1, 2, 3, 4);
        assert_eq!("01.02.03.04".parse::<MailboxAddr>().unwrap(), expected);
        assert_eq!("0x01020304".parse::<MailboxAddr>().unwrap(), expected);
        assert_eq!("16909060".parse::<MailboxAddr>().unwrap(), expected);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("1.2.3".parse::<MailboxAddr>().is_err());
        assert!("zz.00.00.00".parse::<MailboxAddr>().is_err());
        assert!("hello".parse::<MailboxAddr>().is_err());
    }

    #[test]
    fn with_local_keeps_module_fields() {
        let cmd = MailboxAddr::compose(1, 2, 3, 0);
        let data = cmd.with_local(1);
        assert_eq!(data, MailboxAddr::compose(1, 2, 3, 1));
        assert!(MailboxAddr::ROUTER.is_router());
        assert!(!data.is_router());
    }

    #[test]
    fn serializes_as_bare_number() {
        let json = serde_json::to_string(&MailboxAddr(42)).unwrap();
        assert_eq!(json, "42");
    }
}
