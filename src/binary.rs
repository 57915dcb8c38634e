//! Structures definitions & traits to manipulate them.

use binrw::{
    BinRead, BinWrite,
    meta::{ReadEndian, WriteEndian},
};

/// A trait representing a _message payload_ in the SSH protocol.
pub trait Packet:
    for<'r> BinRead<Args<'r> = ()> + ReadEndian + for<'w> BinWrite<Args<'w> = ()> + WriteEndian
{
    /// Convert from _binary wire format_, requiring the whole buffer to be consumed.
    fn from_bytes(bytes: impl AsRef<[u8]>) -> Result<Self, Error> {
        let bytes = bytes.as_ref();
        let (packet, size) = Self::from_bytes_prefix(bytes)?;

        if size < bytes.len() {
            return Err(Error::Trailing(bytes.len() - size));
        }

        Ok(packet)
    }

    /// Convert from _binary wire format_, returning the decoded packet
    /// and the amount of bytes it occupied at the front of the buffer.
    fn from_bytes_prefix(bytes: impl AsRef<[u8]>) -> Result<(Self, usize), Error> {
        let mut cursor = std::io::Cursor::new(bytes.as_ref());
        let packet = Self::read(&mut cursor)?;

        Ok((packet, cursor.position() as usize))
    }

    /// Convert to _binary wire format_.
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        self.write(&mut buf).unwrap_or_else(|err| {
            panic!(
                "failed to serialize `{}`: {err}",
                std::any::type_name::<Self>()
            )
        });

        buf.into_inner()
    }
}

/// An error that can occur while converting from and to _binary wire format_.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The buffer did not contain a well-formed message.
    #[error(transparent)]
    Decode(#[from] binrw::Error),

    /// The buffer contained bytes past the end of a well-formed message.
    #[error("{0} trailing bytes after a complete message")]
    Trailing(usize),
}
