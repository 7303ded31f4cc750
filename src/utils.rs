//! Small helpers reused across the stack: hex-dump `Debug` wrappers and a
//! macro for primitive-backed enums with a catch-all unknown variant.

use std::fmt;

/// Creates an enum that can be converted from and to a primitive type, with
/// invalid values becoming a catch-all `Unknown` variant.
///
/// Used for wire enums (memory region types, log variable types, bootloader
/// target types) where the firmware may report a value this crate's released
/// version predates.
macro_rules! enum_with_unknown {
    (
        $( #[$enum_attr:meta] )*
        $v:vis enum $name:ident($ty:ty) {
            $(
              $( #[$variant_attr:meta] )*
              $variant:ident = $value:expr $(,)*
            ),*
        }
    ) => {
        $( #[$enum_attr] )*
        $v enum $name {
            $(
              $( #[$variant_attr] )*
              $variant,
            )*
            Unknown($ty)
        }

        impl ::std::convert::From<$ty> for $name {
            fn from(value: $ty) -> Self {
                match value {
                    $( $value => $name::$variant, )*
                    other => $name::Unknown(other)
                }
            }
        }

        impl ::std::convert::From<$name> for $ty {
            fn from(value: $name) -> Self {
                match value {
                    $( $name::$variant => $value, )*
                    $name::Unknown(other) => other
                }
            }
        }
    }
}

/// `Debug`-formats its contents as a hexadecimal byte slice: `[de, ad, be, ef]`.
#[derive(Copy, Clone)]
pub struct HexSlice<T>(pub T)
where
    T: AsRef<[u8]>;

impl<T: AsRef<[u8]>> fmt::Debug for HexSlice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, byte) in self.0.as_ref().iter().enumerate() {
            if i != 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        f.write_str("]")
    }
}

impl<T: AsRef<[u8]>> AsRef<T> for HexSlice<T> {
    fn as_ref(&self) -> &T {
        &self.0
    }
}

/// A fixed-width sliding-window mean, used for link quality and
/// available generically since the source reuses the same windowed-average
/// utility in more than one place.
#[derive(Debug, Clone)]
pub struct SlidingMean<const N: usize> {
    samples: [f64; N],
    len: usize,
    next: usize,
}

impl<const N: usize> Default for SlidingMean<N> {
    fn default() -> Self {
        SlidingMean {
            samples: [0.0; N],
            len: 0,
            next: 0,
        }
    }
}

impl<const N: usize> SlidingMean<N> {
    /// Creates an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a new sample, evicting the oldest once the window is full.
    pub fn push(&mut self, sample: f64) {
        self.samples[self.next] = sample;
        self.next = (self.next + 1) % N;
        if self.len < N {
            self.len += 1;
        }
    }

    /// Returns the mean of all samples currently in the window, or `0.0` if empty.
    pub fn mean(&self) -> f64 {
        if self.len == 0 {
            return 0.0;
        }
        self.samples[..self.len].iter().sum::<f64>() / self.len as f64
    }

    /// Number of samples currently held (≤ `N`).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    enum_with_unknown! {
        #[derive(Debug, Copy, Clone, PartialEq, Eq)]
        pub enum Dummy(u8) {
            A = 1,
            B = 2,
        }
    }

    #[test]
    fn enum_with_unknown_round_trips() {
        assert_eq!(Dummy::from(1), Dummy::A);
        assert_eq!(Dummy::from(7), Dummy::Unknown(7));
        assert_eq!(u8::from(Dummy::B), 2);
        assert_eq!(u8::from(Dummy::Unknown(9)), 9);
    }

    #[test]
    fn hex_slice_formats_lowercase_hex() {
        assert_eq!(format!("{:?}", HexSlice([0xDE, 0xAD])), "[de, ad]");
    }

    #[test]
    fn sliding_mean_evicts_oldest() {
        let mut m: SlidingMean<3> = SlidingMean::new();
        m.push(1.0);
        m.push(2.0);
        m.push(3.0);
        assert_eq!(m.mean(), 2.0);
        m.push(9.0); // evicts the 1.0
        assert_eq!(m.mean(), (2.0 + 3.0 + 9.0) / 3.0);
    }
}
