use futures::future::BoxFuture;

/// External service a step may call into (CRM, email, SMS, ...).
///
/// The engine never drives these itself; steps and agents own their
/// collaborators and are responsible for the `initialize`/`close` calls.
pub trait Integration: Send + Sync + 'static {
    /// Integration name, used in logs and error details.
    fn name(&self) -> &str;

    /// Establish connections or authenticate. Called once before use.
    fn initialize(&self) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Release resources. Called once when the owner shuts down.
    fn close(&self) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}
