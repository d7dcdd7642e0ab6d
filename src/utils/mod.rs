/// Define owning wrappers around fabric handles.
pub(crate) mod boilerplate;

/// Provide interoperability with C return values.
#[cfg_attr(not(feature = "verbs"), allow(dead_code))]
pub(crate) mod interop;
