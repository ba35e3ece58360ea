/// Irreversible actions the engine triggers but does not implement.
///
/// The binary supplies the real host power-off and process exit; tests
/// supply recorders.
pub trait ActionDispatcher: Send + Sync {
    /// Power off the host. An error means the request was not accepted and
    /// may be retried.
    fn shutdown_host(&self) -> std::io::Result<()>;

    /// End the current process. Production implementations do not return.
    fn terminate_self(&self);
}
