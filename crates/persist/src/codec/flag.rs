//! Integer-backed enumerations and flag sets with an explicit width tag.
//!
//! ```text
//! u8 tag   0=i8 1=u8 2=i16 3=u16 4=i32 5=u32 6=i64 7=u64 255=unsupported
//! value    1/1/2/2/4/4/8/8 bytes; nothing for 255
//! ```
//!
//! The tag records the width the producer used, so a reader whose type is backed by a
//! different integer width still decodes the value, converting it into its own width.

use std::io::{Read, Write};

use super::{BinaryReader, BinaryWriter};
use crate::error::{PersistError, Result};

/// Tag written for representations the format has no width for. No payload follows.
pub const UNSUPPORTED_WIDTH_TAG: u8 = 255;

/// Underlying integer width of a persisted enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FlagWidth {
    I8 = 0,
    U8 = 1,
    I16 = 2,
    U16 = 3,
    I32 = 4,
    U32 = 5,
    I64 = 6,
    U64 = 7,
}

impl FlagWidth {
    pub const ALL: [FlagWidth; 8] = [
        Self::I8,
        Self::U8,
        Self::I16,
        Self::U16,
        Self::I32,
        Self::U32,
        Self::I64,
        Self::U64,
    ];

    pub const fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(usize::from(tag)).copied()
    }

    pub const fn byte_len(self) -> usize {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 => 4,
            Self::I64 | Self::U64 => 8,
        }
    }
}

/// An integer type that can back a persisted enumeration.
///
/// Values travel as 64-bit two's complement: signed widths sign-extend on the way out and
/// every width truncates on the way in.
pub trait FlagRepr: Copy + Default + PartialEq + std::fmt::Debug + 'static {
    /// `None` for representations the wire format cannot carry.
    const WIDTH: Option<FlagWidth>;

    fn to_wire(self) -> u64;

    fn from_wire(raw: u64) -> Self;
}

macro_rules! flag_repr {
    ($($ty:ty => $width:expr, $wide:ty;)+) => {
        $(
            impl FlagRepr for $ty {
                const WIDTH: Option<FlagWidth> = $width;

                fn to_wire(self) -> u64 {
                    self as $wide as u64
                }

                fn from_wire(raw: u64) -> Self {
                    raw as Self
                }
            }
        )+
    };
}

flag_repr! {
    i8 => Some(FlagWidth::I8), i64;
    u8 => Some(FlagWidth::U8), u64;
    i16 => Some(FlagWidth::I16), i64;
    u16 => Some(FlagWidth::U16), u64;
    i32 => Some(FlagWidth::I32), i64;
    u32 => Some(FlagWidth::U32), u64;
    i64 => Some(FlagWidth::I64), i64;
    u64 => Some(FlagWidth::U64), u64;
    i128 => None, i128;
    u128 => None, u128;
}

/// An enumeration or flag set that can be written with [`BinaryWriter::write_flag`].
///
/// Implement it with [`impl_persist_enum!`](crate::impl_persist_enum) for C-like enums and
/// [`impl_persist_flags!`](crate::impl_persist_flags) for `bitflags` types.
pub trait PersistFlag: Sized + Default {
    type Repr: FlagRepr;

    /// Flag sets accept any bit combination; plain enums only their declared values.
    const IS_FLAGS: bool;

    fn to_repr(&self) -> Self::Repr;

    /// The declared value equal to `repr`, if any.
    fn from_defined(repr: Self::Repr) -> Option<Self>;

    /// Arbitrary bit combination; only consulted for flag sets.
    fn from_any_bits(_repr: Self::Repr) -> Option<Self> {
        None
    }
}

impl<W: Write> BinaryWriter<W> {
    pub fn write_flag<E: PersistFlag>(&mut self, value: &E) -> Result<()> {
        let raw = value.to_repr().to_wire();
        let Some(width) = E::Repr::WIDTH else {
            tracing::debug!(
                repr = std::any::type_name::<E::Repr>(),
                "flag width not supported, writing sentinel"
            );
            return self.write_u8(UNSUPPORTED_WIDTH_TAG);
        };
        self.write_u8(width.tag())?;
        match width {
            FlagWidth::I8 => self.write_i8(raw as i8),
            FlagWidth::U8 => self.write_u8(raw as u8),
            FlagWidth::I16 => self.write_i16(raw as i16),
            FlagWidth::U16 => self.write_u16(raw as u16),
            FlagWidth::I32 => self.write_i32(raw as i32),
            FlagWidth::U32 => self.write_u32(raw as u32),
            FlagWidth::I64 => self.write_i64(raw as i64),
            FlagWidth::U64 => self.write_u64(raw),
        }
    }
}

impl<R: Read> BinaryReader<R> {
    /// Read a tagged value into `E`. Values `E` does not declare (and, for flag sets, that
    /// cannot be represented) decode to `E::default()`, as does the unsupported-width tag.
    pub fn read_flag<E: PersistFlag>(&mut self) -> Result<E> {
        let tag = self.read_u8()?;
        if tag == UNSUPPORTED_WIDTH_TAG {
            return Ok(E::default());
        }
        let width = FlagWidth::from_tag(tag)
            .ok_or_else(|| PersistError::invalid(format!("unknown flag width tag {tag}")))?;
        let raw = match width {
            FlagWidth::I8 => self.read_i8()? as i64 as u64,
            FlagWidth::U8 => u64::from(self.read_u8()?),
            FlagWidth::I16 => self.read_i16()? as i64 as u64,
            FlagWidth::U16 => u64::from(self.read_u16()?),
            FlagWidth::I32 => self.read_i32()? as i64 as u64,
            FlagWidth::U32 => u64::from(self.read_u32()?),
            FlagWidth::I64 => self.read_i64()? as u64,
            FlagWidth::U64 => self.read_u64()?,
        };
        let repr = E::Repr::from_wire(raw);
        let decoded = E::from_defined(repr).or_else(|| {
            if E::IS_FLAGS {
                E::from_any_bits(repr)
            } else {
                None
            }
        });
        Ok(decoded.unwrap_or_else(|| {
            tracing::debug!(
                ?repr,
                target_type = std::any::type_name::<E>(),
                "undefined enum value, using default"
            );
            E::default()
        }))
    }
}

/// Implement [`PersistFlag`] for a fieldless enum with an explicit `#[repr]`.
///
/// ```ignore
/// #[derive(Clone, Copy, Default)]
/// #[repr(u8)]
/// enum Facing { #[default] North, East, South, West }
/// impl_persist_enum!(Facing, u8, [North, East, South, West]);
/// ```
#[macro_export]
macro_rules! impl_persist_enum {
    ($ty:ty, $repr:ty, [$($variant:ident),+ $(,)?]) => {
        impl $crate::codec::PersistFlag for $ty {
            type Repr = $repr;
            const IS_FLAGS: bool = false;

            fn to_repr(&self) -> $repr {
                *self as $repr
            }

            fn from_defined(repr: $repr) -> Option<Self> {
                $(
                    if repr == <$ty>::$variant as $repr {
                        return Some(<$ty>::$variant);
                    }
                )+
                None
            }
        }
    };
}

/// Implement [`PersistFlag`] for a `bitflags` type. Unknown bits are retained.
#[macro_export]
macro_rules! impl_persist_flags {
    ($ty:ty, $repr:ty) => {
        impl $crate::codec::PersistFlag for $ty {
            type Repr = $repr;
            const IS_FLAGS: bool = true;

            fn to_repr(&self) -> $repr {
                self.bits()
            }

            fn from_defined(repr: $repr) -> Option<Self> {
                <$ty>::from_bits(repr)
            }

            fn from_any_bits(repr: $repr) -> Option<Self> {
                Some(<$ty>::from_bits_retain(repr))
            }
        }
    };
}
