//! Internal macros and test helpers.

macro_rules! trace {
    ($($t:tt)*) => { tracing::trace!($($t)*) }
}

#[cfg(all(not(test), not(hyphae_ultraverbose)))]
macro_rules! test_dbg {
    ($e:expr) => {
        $e
    };
}

#[cfg(any(test, hyphae_ultraverbose))]
macro_rules! test_dbg {
    ($e:expr) => {
        match $e {
            e => {
                tracing::debug!(
                    location = %core::panic::Location::caller(),
                    "{} = {:?}",
                    stringify!($e),
                    &e
                );
                e
            }
        }
    };
}

#[cfg(all(not(test), not(hyphae_ultraverbose)))]
macro_rules! test_debug {
    ($($t:tt)*) => {};
}

#[cfg(any(test, hyphae_ultraverbose))]
macro_rules! test_debug {
    ($($t:tt)*) => { tracing::debug!($($t)*) }
}

#[cfg(all(not(test), not(hyphae_ultraverbose)))]
macro_rules! test_trace {
    ($($t:tt)*) => {};
}

#[cfg(any(test, hyphae_ultraverbose))]
macro_rules! test_trace {
    ($($t:tt)*) => { tracing::trace!($($t)*) }
}

/// Halts the process with a diagnostic. See [`crate::fatal`].
macro_rules! fatal {
    ($($arg:tt)+) => {
        $crate::fatal::fatal_error(format_args!($($arg)+))
    };
}

macro_rules! loom_const_fn {
    (
        $(#[$meta:meta])*
        $vis:vis fn $name:ident($($arg:ident: $T:ty),*) -> $Ret:ty $body:block
    ) => {
        $(#[$meta])*
        #[cfg(not(loom))]
        $vis const fn $name($($arg: $T),*) -> $Ret $body

        $(#[$meta])*
        #[cfg(loom)]
        $vis fn $name($($arg: $T),*) -> $Ret $body
    }
}
