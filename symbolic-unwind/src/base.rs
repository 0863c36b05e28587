//! Basic definitions necessary for stack unwinding.
use std::fmt::{Debug, Display};

/// Abstracts over the [endianness](https://en.wikipedia.org/wiki/Endianness) of stack memory.
///
/// This only tells whether data is big-endian. Reading values is up to [`RegisterValue`].
pub trait Endianness: Debug + Clone + Copy {
    /// Returns true if this is big-endian (i.e. most significant bytes first).
    fn is_big_endian(self) -> bool;
}

/// Big-endian data representation, known at compile time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BigEndian;

impl Endianness for BigEndian {
    fn is_big_endian(self) -> bool {
        true
    }
}

/// Little-endian data representation, known at compile time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LittleEndian;

impl Endianness for LittleEndian {
    fn is_big_endian(self) -> bool {
        false
    }
}

/// Endianness that can be selected at run time.
///
/// Defaults to the endianness of the target platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEndian {
    /// Big-endian data representation.
    Big,
    /// Little-endian data representation.
    Little,
}

impl Default for RuntimeEndian {
    #[cfg(target_endian = "little")]
    fn default() -> Self {
        Self::Little
    }

    #[cfg(target_endian = "big")]
    fn default() -> Self {
        Self::Big
    }
}

impl Endianness for RuntimeEndian {
    fn is_big_endian(self) -> bool {
        self == Self::Big
    }
}

/// An unsigned machine word that register values and addresses are represented as.
///
/// Arithmetic wraps around like it does on the CPU. Division and remainder by zero are reported
/// as `None` instead of panicking, since rules come from untrusted input.
pub trait RegisterValue: Copy + Sized + Debug + Display + Eq + Ord {
    /// The number of bytes that need to be read to produce one value of this type.
    const WIDTH: usize;

    /// Reads a value of this type from the start of `bytes`.
    ///
    /// Fails if there are not enough bytes in the slice.
    fn read_bytes<E: Endianness>(bytes: &[u8], endian: E) -> Option<Self>;

    /// Converts a signed literal, wrapping negative values around.
    fn from_i64(value: i64) -> Self;

    /// Converts an unsigned literal, truncating it to the width of this type.
    fn from_u64(value: u64) -> Self;

    /// Widens this value to `u64`.
    fn into_u64(self) -> u64;

    /// Wrapping addition.
    fn add(self, other: Self) -> Self;

    /// Wrapping subtraction.
    fn sub(self, other: Self) -> Self;

    /// Wrapping multiplication.
    fn mul(self, other: Self) -> Self;

    /// Division, `None` if `other` is zero.
    fn div(self, other: Self) -> Option<Self>;

    /// Remainder, `None` if `other` is zero.
    fn rem(self, other: Self) -> Option<Self>;
}

macro_rules! impl_register_value {
    ($ty:ty) => {
        impl RegisterValue for $ty {
            const WIDTH: usize = std::mem::size_of::<$ty>();

            fn read_bytes<E: Endianness>(bytes: &[u8], endian: E) -> Option<Self> {
                let bytes: [u8; Self::WIDTH] = bytes.get(..Self::WIDTH)?.try_into().ok()?;
                if endian.is_big_endian() {
                    Some(Self::from_be_bytes(bytes))
                } else {
                    Some(Self::from_le_bytes(bytes))
                }
            }

            fn from_i64(value: i64) -> Self {
                value as $ty
            }

            fn from_u64(value: u64) -> Self {
                value as $ty
            }

            fn into_u64(self) -> u64 {
                self as u64
            }

            fn add(self, other: Self) -> Self {
                self.wrapping_add(other)
            }

            fn sub(self, other: Self) -> Self {
                self.wrapping_sub(other)
            }

            fn mul(self, other: Self) -> Self {
                self.wrapping_mul(other)
            }

            fn div(self, other: Self) -> Option<Self> {
                self.checked_div(other)
            }

            fn rem(self, other: Self) -> Option<Self> {
                self.checked_rem(other)
            }
        }
    };
}

impl_register_value!(u32);
impl_register_value!(u64);

/// A view into a region of memory, given by a slice and a base address.
#[derive(Clone, Copy, Debug)]
pub struct MemoryRegion<'a> {
    /// The starting address of the memory region.
    pub base_addr: u64,

    /// The contents of the memory region.
    pub contents: &'a [u8],
}

impl<'a> MemoryRegion<'a> {
    /// This memory region's base address.
    pub fn base_addr(&self) -> u64 {
        self.base_addr
    }

    /// This memory region's length in bytes.
    pub fn len(&self) -> usize {
        self.contents.len()
    }

    /// Returns true if this memory region's size is 0.
    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    /// The end of this region, exclusive.
    pub fn end_addr(&self) -> u64 {
        self.base_addr.saturating_add(self.contents.len() as u64)
    }

    /// Determines whether `address` lies within this region.
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base_addr && address < self.end_addr()
    }

    /// Reads the value saved at `address` as a value of type `A`.
    ///
    /// Fails if not enough bytes are available at `address`.
    pub fn get<A: RegisterValue, E: Endianness>(&self, address: u64, endian: E) -> Option<A> {
        let index = usize::try_from(address.checked_sub(self.base_addr)?).ok()?;
        A::read_bytes(self.contents.get(index..)?, endian)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_get() {
        let memory = MemoryRegion {
            base_addr: 0x100,
            contents: &[1, 0, 0, 0, 2, 0, 0, 0],
        };

        assert_eq!(memory.get::<u32, _>(0x100, LittleEndian), Some(1));
        assert_eq!(memory.get::<u32, _>(0x104, LittleEndian), Some(2));
        assert_eq!(memory.get::<u32, _>(0x100, BigEndian), Some(0x0100_0000));
        assert_eq!(memory.get::<u64, _>(0x100, LittleEndian), Some(0x2_0000_0001));
        assert_eq!(memory.get::<u32, _>(0x105, LittleEndian), None);
        assert_eq!(memory.get::<u32, _>(0xff, LittleEndian), None);
        assert!(memory.contains(0x107));
        assert!(!memory.contains(0x108));
    }

    #[test]
    fn test_wrapping_arithmetic() {
        assert_eq!(u32::from_i64(-8), 0xffff_fff8);
        assert_eq!(RegisterValue::add(0x1000u32, u32::from_i64(-8)), 0xff8);
        assert_eq!(RegisterValue::div(5u64, 0), None);
        assert_eq!(RegisterValue::rem(5u64, 3), Some(2));
    }
}
