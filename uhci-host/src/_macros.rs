macro_rules! define_int_type {
    ($name:ident, $ty:ty) => {
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name($ty);

        impl $name {
            pub const fn new(value: $ty) -> Self {
                Self(value)
            }

            pub const fn raw(&self) -> $ty {
                self.0
            }
        }

        impl From<$ty> for $name {
            fn from(value: $ty) -> Self {
                Self(value)
            }
        }

        impl From<$name> for $ty {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl core::ops::Add<$ty> for $name {
            type Output = Self;

            fn add(self, rhs: $ty) -> Self {
                Self(self.0 + rhs)
            }
        }

        impl core::fmt::LowerHex for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}
