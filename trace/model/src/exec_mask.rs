use bitvec::field::BitField;
use bitvec::BitArr;
use serde::{Deserialize, Serialize};

pub type Inner = BitArr!(for super::WAVEFRONT_SIZE, in u64);

/// Wavefront execution mask.
///
/// Bitmask where a 1 at position i means that lane i executed the instrumented instruction.
#[derive(Debug, Default, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ExecMask(Inner);

impl ExecMask {
    /// Execution mask with all lanes inactive
    pub const ZERO: Self = ExecMask(Inner::ZERO);

    #[must_use]
    pub fn all_ones() -> Self {
        Self::ZERO.inverted()
    }

    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0.load()
    }

    #[must_use]
    pub fn inverted(mut self) -> Self {
        self.0 = !self.0;
        self
    }

    /// Lane ids of the active lanes, in ascending order.
    ///
    /// The instrumentation emits one data item per active lane in exactly this order.
    pub fn active_lanes(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter_ones()
    }

    #[must_use]
    pub fn num_active(&self) -> usize {
        self.0.count_ones()
    }
}

impl From<u64> for ExecMask {
    fn from(value: u64) -> Self {
        let mut exec_mask = Inner::ZERO;
        exec_mask.store(value);
        Self(exec_mask)
    }
}

impl std::ops::Deref for ExecMask {
    type Target = Inner;
    fn deref(&self) -> &Inner {
        &self.0
    }
}

impl std::ops::DerefMut for ExecMask {
    fn deref_mut(&mut self) -> &mut Inner {
        &mut self.0
    }
}

impl Serialize for ExecMask {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.as_u64())
    }
}

struct Visitor;

impl<'de> serde::de::Visitor<'de> for Visitor {
    type Value = ExecMask;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter.write_str("an unsigned 64-bit integer")
    }

    fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(ExecMask::from(value))
    }

    fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        u64::try_from(value)
            .map(ExecMask::from)
            .map_err(|_| E::invalid_value(serde::de::Unexpected::Signed(value), &self))
    }
}

impl<'de> Deserialize<'de> for ExecMask {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_u64(Visitor)
    }
}

impl std::fmt::Display for ExecMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_bit_string())
    }
}

/// Format as a binary string.
pub trait ToBitString {
    fn to_bit_string(&self) -> String;
}

impl<A, O> ToBitString for bitvec::slice::BitSlice<A, O>
where
    A: bitvec::store::BitStore,
    O: bitvec::order::BitOrder,
{
    fn to_bit_string(&self) -> String {
        self.iter()
            .rev()
            .map(|b| if *b { "1" } else { "0" })
            .collect::<Vec<_>>()
            .join("")
    }
}
