#![macro_use]

/// Define an owning wrapper around a fabric handle.
///
/// The wrapper releases the handle with the named [`Fabric`](crate::fabric::Fabric)
/// method, either explicitly through `destroy`, which reports failure, or on
/// drop, which logs failure and moves on.
macro_rules! fabric_resource {
    ($(#[$meta:meta])* $name:ident, $handle:ident, $release:ident, $what:literal) => {
        $(#[$meta])*
        pub struct $name<F: $crate::fabric::Fabric> {
            fabric: F,
            raw: F::$handle,
            live: bool,
        }

        impl<F: $crate::fabric::Fabric> $name<F> {
            pub(crate) fn from_raw(fabric: F, raw: F::$handle) -> Self {
                Self {
                    fabric,
                    raw,
                    live: true,
                }
            }

            /// Get the underlying fabric handle.
            #[inline]
            pub fn as_raw(&self) -> F::$handle {
                self.raw
            }

            /// Get the fabric this resource lives on.
            #[inline]
            pub fn fabric(&self) -> &F {
                &self.fabric
            }

            #[doc = concat!("Destroy the ", $what, ", reporting failure.")]
            pub fn destroy(mut self) -> $crate::error::Result<()> {
                self.live = false;
                self.fabric
                    .$release(self.raw)
                    .map_err($crate::error::Error::transport(concat!("destroy ", $what)))
            }
        }

        impl<F: $crate::fabric::Fabric> Drop for $name<F> {
            fn drop(&mut self) {
                if self.live {
                    if let Err(e) = self.fabric.$release(self.raw) {
                        log::warn!("cannot destroy {} {:?} on drop: {}", $what, self.raw, e);
                    }
                }
            }
        }

        impl<F: $crate::fabric::Fabric> ::std::fmt::Debug for $name<F> {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                write!(f, concat!(stringify!($name), "<{:?}>"), self.raw)
            }
        }
    };
}
