//! Textual endpoint locators for out-of-band exchange.
//!
//! `eth://aa:bb:cc:dd:ee:ff:00000003` names endpoint 3 on the interface with
//! that hardware address.

use std::fmt;
use std::str::FromStr;

use ethmsg_link::MacAddr;

use crate::error::{Result, WireError};

pub const LOCATOR_PREFIX: &str = "eth://";

/// Exact length of a locator: prefix + 17-char MAC + `:` + 8 hex digits.
pub const LOCATOR_LEN: usize = LOCATOR_PREFIX.len() + 17 + 1 + 8;

/// A remote endpoint address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Locator {
    pub mac: MacAddr,
    pub endpoint_id: u32,
}

impl Locator {
    pub fn new(mac: MacAddr, endpoint_id: u32) -> Self {
        Self { mac, endpoint_id }
    }

    pub fn parse(s: &str) -> Result<Self> {
        s.parse()
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{LOCATOR_PREFIX}{}:{:08x}", self.mac, self.endpoint_id)
    }
}

impl FromStr for Locator {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || WireError::InvalidLocator(s.to_string());

        if s.len() != LOCATOR_LEN || !s.is_ascii() {
            return Err(invalid());
        }
        let rest = s.strip_prefix(LOCATOR_PREFIX).ok_or_else(invalid)?;
        let (mac, id) = rest.split_at(17);
        let id = id.strip_prefix(':').ok_or_else(invalid)?;

        let mac: MacAddr = mac.parse().map_err(|_| invalid())?;
        if !id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let endpoint_id = u32::from_str_radix(id, 16).map_err(|_| invalid())?;

        Ok(Self { mac, endpoint_id })
    }
}
