//! Encoding and decoding of the POSIX terminal modes carried in `pty-req`
//! channel requests, as defined in
//! [RFC4254 section 8](https://datatracker.ietf.org/doc/html/rfc4254#section-8).

use std::collections::BTreeMap;

use crate::{Error, Result};

/// The opcode terminating an encoded terminal modes string.
pub const PTY_OP_END: u8 = 0;

/// The first opcode of the range reserved for future extension.
pub const PTY_OP_RESERVED: u8 = 160;

/// A set of POSIX terminal modes, keyed by opcode.
///
/// On the wire, modes are a concatenation of `(u8 opcode, u32 value)` pairs
/// terminated by a single [`PTY_OP_END`] byte; [`Modes::encode`] and
/// [`Modes::decode`] match this layout bit-for-bit.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Modes(BTreeMap<u8, u32>);

impl Modes {
    /// Create an empty set of terminal modes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the value for a mode opcode.
    ///
    /// The opcode must lie strictly between [`PTY_OP_END`] and [`PTY_OP_RESERVED`].
    pub fn set(&mut self, opcode: u8, value: u32) -> Result<()> {
        if opcode <= PTY_OP_END || opcode >= PTY_OP_RESERVED {
            return Err(Error::InvalidPtyMode(opcode));
        }

        self.0.insert(opcode, value);

        Ok(())
    }

    /// Get the value for a mode opcode, if it was set.
    pub fn get(&self, opcode: u8) -> Option<u32> {
        self.0.get(&opcode).copied()
    }

    /// Whether no modes are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the `(opcode, value)` pairs, in ascending opcode order.
    pub fn iter(&self) -> impl Iterator<Item = (u8, u32)> + '_ {
        self.0.iter().map(|(&opcode, &value)| (opcode, value))
    }

    /// Encode the modes to their wire representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.0.len() * 5 + 1);

        for (&opcode, &value) in &self.0 {
            bytes.push(opcode);
            bytes.extend(value.to_be_bytes());
        }
        bytes.push(PTY_OP_END);

        bytes
    }

    /// Decode modes from their wire representation.
    ///
    /// Decoding stops at [`PTY_OP_END`] or at any opcode in the reserved
    /// range; a pair truncated mid-value is a protocol error.
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        let mut modes = BTreeMap::new();

        while let Some((&opcode, rest)) = bytes.split_first() {
            if opcode == PTY_OP_END || opcode >= PTY_OP_RESERVED {
                break;
            }

            match rest.split_first_chunk() {
                Some((value, rest)) => {
                    modes.insert(opcode, u32::from_be_bytes(*value));
                    bytes = rest;
                }
                None => return Err(Error::Protocol("Invalid pty modes string")),
            }
        }

        Ok(Self(modes))
    }
}
