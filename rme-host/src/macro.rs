#[macro_export]
macro_rules! define_interface {
    (command {$($variant:ident = $val:expr),*,}) => {
        $(pub const $variant: usize = $val;)*
        pub fn to_str(code: usize) -> alloc::string::String {
            use alloc::string::ToString;
            use alloc::format;
            match code {
                $($variant => stringify!($variant).to_string()),*,
                _ => format!("Undefined {:#X}", code)
            }
        }
    };
}

#[macro_export]
macro_rules! define_mask {
    ($end:expr, $beg:expr) => {
        ((1 << $end) - (1 << $beg) + (1 << $end))
    };
}

#[macro_export]
macro_rules! define_bitfield {
    ($field:ident, [$($end:tt-$beg:tt)|*]) => {
        #[allow(non_upper_case_globals)]
        pub const $field: u64 = $( $crate::define_mask!($end, $beg) )|*;
    };
}

/// Defines a u64 wrapper with named bitfields.
/// `get_masked_value` and `set_masked_value` shift by the mask's lowest bit.
#[macro_export]
macro_rules! define_bits {
    ($name:ident, $($field:ident $bits:tt),*) => {
        #[allow(non_snake_case)]
        #[derive(Copy, Clone, Default, PartialEq, Eq)]
        #[repr(C)]
        pub struct $name(u64);

        impl $name {
            #[inline(always)]
            pub const fn new(data: u64) -> $name {
                $name(data)
            }

            #[inline(always)]
            pub fn get(&self) -> u64 {
                self.0
            }

            #[inline(always)]
            pub fn get_masked_value(&self, mask: u64) -> u64 {
                (self.0 & mask) >> (mask.trailing_zeros())
            }

            #[inline(always)]
            pub fn set_masked_value(&mut self, mask: u64, val: u64) -> &mut Self {
                self.0 = (self.0 & !mask) | ((val << (mask.trailing_zeros())) & mask);
                self
            }

            #[inline(always)]
            pub fn set_bits(&mut self, mask: u64) -> &mut Self {
                self.0 |= mask;
                self
            }

            $( $crate::define_bitfield!($field, $bits); )*
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}({:#X})", stringify!($name), self.0)
            }
        }
    };
}

#[macro_export]
macro_rules! const_assert {
    ($cond:expr) => {
        // Causes overflow if condition is false
        let _ = [(); 0 - (!($cond) as usize)];
    };
}

#[macro_export]
macro_rules! const_assert_eq {
    ($left:expr, $right:expr) => {
        const _: () = {
            $crate::const_assert!($left == $right);
        };
    };
}
