//! Built-in logger implementation.
//!
//! Uses the `env_logger` crate behind the Cargo feature "builtin_env_logger"
//! (enabled by default) and is initialized when a device is created. An
//! embedder that registers its own implementation with the `log` crate should
//! disable the feature.

/// Attempt to initialize the built-in env_logger.
/// Does nothing if the "builtin_env_logger" feature is disabled.
#[cfg(feature = "builtin_env_logger")]
pub(crate) fn try_init() {
    let result = env_logger::try_init_from_env(
        // By default, show info level logging.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    match result {
        Ok(()) => debug!("initialized the built-in logger"),
        // `log::SetLoggerError` only means a logger was already installed.
        Err(e) => debug!("built-in env_logger not installed: {e}"),
    }
}

#[cfg(not(feature = "builtin_env_logger"))]
pub(crate) fn try_init() {}
