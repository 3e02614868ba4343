//! Fixed-size identifiers used across the wire and in process state.

use std::fmt;
use std::str::FromStr;

/// Fills `buf` with process-local entropy.
///
/// Chains the std hasher over the PID, current nanoseconds, and a running
/// counter. Not cryptographic — collision resistance across a fleet comes
/// from the id width, not the generator.
fn fill_entropy(buf: &mut [u8]) {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::time::{SystemTime, UNIX_EPOCH};

    let state = RandomState::new();
    let mut seed = {
        let mut h = state.build_hasher();
        h.write_u64(u64::from(std::process::id()));
        h.write_u128(
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos(),
        );
        h.finish()
    };

    for chunk in buf.chunks_mut(8) {
        let mut h = state.build_hasher();
        h.write_u64(seed);
        seed = h.finish();
        let bytes = seed.to_be_bytes();
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }
}

/// Parses a lowercase-hex string into a fixed-size byte array.
fn parse_hex<const N: usize>(s: &str) -> Result<[u8; N], String> {
    if s.len() != N * 2 {
        return Err(format!("expected {} hex chars, got {}", N * 2, s.len()));
    }
    let mut out = [0u8; N];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
            .map_err(|_| format!("invalid hex at offset {}", i * 2))?;
    }
    Ok(out)
}

/// Declares a fixed-width binary identifier with hex display/parse.
macro_rules! wire_id {
    ($(#[$doc:meta])* $name:ident, $width:expr) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; $width]);

        impl $name {
            /// Byte width of this identifier.
            pub const WIDTH: usize = $width;

            /// Generates a fresh random identifier.
            pub fn generate() -> Self {
                let mut buf = [0u8; $width];
                fill_entropy(&mut buf);
                Self(buf)
            }

            /// Wraps raw bytes.
            pub const fn from_bytes(bytes: [u8; $width]) -> Self {
                Self(bytes)
            }

            /// Returns the raw bytes.
            pub const fn as_bytes(&self) -> &[u8; $width] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for b in &self.0 {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self)
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                parse_hex(s).map(Self)
            }
        }
    };
}

wire_id!(
    /// 32-byte task identifier, assigned at submission.
    TaskId,
    32
);

wire_id!(
    /// 16-byte compute-node identifier.
    NodeId,
    16
);

wire_id!(
    /// 16-byte submitting-client identifier.
    ClientId,
    16
);

wire_id!(
    /// 16-byte worker-VM identifier, local to one compute node.
    VmId,
    16
);
