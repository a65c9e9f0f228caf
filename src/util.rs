/// Returns the name of type `$t`, checked at compile time.
macro_rules! name_of {
    ($t:ty) => {{
        type _T = $t;
        stringify!($t)
    }};
}
pub(crate) use name_of;

/// Implements `Display` for types that already implement `Debug`.
#[macro_export]
macro_rules! impl_display_via_debug {
    ($($t:ty),* $(,)?) => {$(
        impl ::core::fmt::Display for $t {
            #[inline(always)]
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                ::core::fmt::Debug::fmt(self, f)
            }
        }
    )*};
}
