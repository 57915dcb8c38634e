use binrw::binrw;

use super::Bytes;

/// Errors which can occur when attempting to interpret a string as ASCII characters.
#[derive(Debug, thiserror::Error)]
#[error("the input data wasn't ASCII-formatted")]
pub struct AsciiError {}

/// A `string` as defined in the SSH protocol, restricted to valid **ASCII**.
///
/// see <https://datatracker.ietf.org/doc/html/rfc4251#section-5>.
#[binrw]
#[derive(Default, Clone)]
#[br(assert(self_0.as_ref().is_ascii()))]
pub struct Ascii<'b>(Bytes<'b>);

impl<'b> Ascii<'b> {
    /// Create an [`Ascii`] string from a [`String`].
    pub fn owned(value: String) -> Result<Self, AsciiError> {
        if value.is_ascii() {
            Ok(Self(Bytes::owned(value.into_bytes())))
        } else {
            Err(AsciiError {})
        }
    }

    /// Create an [`Ascii`] string from a [`&str`].
    pub fn borrowed(value: &'b str) -> Result<Self, AsciiError> {
        if value.is_ascii() {
            Ok(Self(Bytes::borrowed(value.as_bytes())))
        } else {
            Err(AsciiError {})
        }
    }

    /// Create an [`Ascii`] string from a static [`&str`], validated at compile time
    /// when used in `const` position.
    pub const fn from_static(value: &'static str) -> Ascii<'static> {
        assert!(value.is_ascii(), "the input data wasn't ASCII-formatted");

        Ascii(Bytes::borrowed(value.as_bytes()))
    }

    /// Convert the [`Ascii`] string into a [`String`].
    pub fn into_string(self) -> String {
        String::from_utf8(self.0.into_vec())
            .unwrap_or_else(|_| panic!("the data wasn't ASCII-formatted"))
    }
}

impl std::fmt::Debug for Ascii<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Ascii").field(&self.as_ref()).finish()
    }
}

impl std::fmt::Display for Ascii<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl AsRef<str> for Ascii<'_> {
    fn as_ref(&self) -> &str {
        std::str::from_utf8(self.0.as_ref()).expect("the data wasn't ASCII-formatted")
    }
}

impl PartialEq for Ascii<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Ascii<'_> {}

impl TryFrom<String> for Ascii<'_> {
    type Error = AsciiError;

    fn try_from(value: String) -> Result<Self, AsciiError> {
        Self::owned(value)
    }
}

impl<'b> TryFrom<&'b str> for Ascii<'b> {
    type Error = AsciiError;

    fn try_from(value: &'b str) -> Result<Self, Self::Error> {
        Self::borrowed(value)
    }
}
