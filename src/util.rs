/// Returns a string representation of the specified type.
macro_rules! name_of {
    ($t:ty) => {{
        type _T = $t; // Allows $t to be recognized as a type for refactoring
        stringify!($t)
    }};
}
pub(crate) use name_of;

/// Implements `Display` for types that already implement `Debug`.
macro_rules! impl_display_via_debug {
    ($($t:ty),* $(,)?) => {$(
        impl ::std::fmt::Display for $t {
            #[inline(always)]
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                ::std::fmt::Debug::fmt(self, f)
            }
        }
    )*};
}
pub(crate) use impl_display_via_debug;
