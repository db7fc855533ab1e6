#![macro_use]
#![allow(unused_macros)]

#[cfg(all(feature = "defmt", feature = "log"))]
compile_error!("You may not enable both `defmt` and `log` features.");

/// Forward to `log` or `defmt`, whichever is enabled. Arguments are still
/// evaluated with neither.
macro_rules! emit {
    ($level:ident, $s:literal $(, $x:expr)* $(,)?) => {
        {
            #[cfg(feature = "log")]
            ::log::$level!($s $(, $x)*);
            #[cfg(feature = "defmt")]
            ::defmt::$level!($s $(, $x)*);
            #[cfg(not(any(feature = "log", feature = "defmt")))]
            let _ = ($( & $x ),*);
        }
    };
}

macro_rules! trace {
    ($($t:tt)*) => { emit!(trace, $($t)*) };
}

macro_rules! debug {
    ($($t:tt)*) => { emit!(debug, $($t)*) };
}

macro_rules! info {
    ($($t:tt)*) => { emit!(info, $($t)*) };
}

macro_rules! warn {
    ($($t:tt)*) => { emit!(warn, $($t)*) };
}

macro_rules! error {
    ($($t:tt)*) => { emit!(error, $($t)*) };
}

macro_rules! unreachable {
    ($($x:tt)*) => {
        {
            #[cfg(not(feature = "defmt"))]
            ::core::unreachable!($($x)*);
            #[cfg(feature = "defmt")]
            ::defmt::unreachable!($($x)*);
        }
    };
}

/// Raw octets on the wire, printed as hex.
pub(crate) struct Hex<'a>(pub &'a [u8]);

impl core::fmt::Debug for Hex<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for byte in self.0 {
            write!(f, "{:02X} ", byte)?;
        }
        Ok(())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Hex<'_> {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{=[u8]:02X}", self.0)
    }
}
