use crate::error::Result;
use crate::store::Store;

const STOP_KEY: &str = "stop";

/// The shared stop flag. Any process can raise it; every worker polls it at
/// the top of its loop and exits cooperatively once it reads `true`.
#[derive(Debug, Clone)]
pub struct ControlChannel {
    store: Store,
}

impl ControlChannel {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Make sure the flag row exists without clobbering a raised flag.
    ///
    /// With `reset` the flag is cleared instead. Returns the flag value after
    /// the call.
    pub async fn ensure(&self, reset: bool) -> Result<bool> {
        if reset {
            self.clear_stop().await?;
            return Ok(false);
        }

        sqlx::query("INSERT OR IGNORE INTO control (key, value) VALUES (?1, 'false')")
            .bind(STOP_KEY)
            .execute(self.store.pool())
            .await?;

        self.is_stop_requested().await
    }

    /// A missing row reads as "not stopped".
    pub async fn is_stop_requested(&self) -> Result<bool> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM control WHERE key = ?1")
            .bind(STOP_KEY)
            .fetch_optional(self.store.pool())
            .await?;

        Ok(matches!(value.as_deref(), Some("true")))
    }

    pub async fn request_stop(&self) -> Result<()> {
        self.write(true).await
    }

    pub async fn clear_stop(&self) -> Result<()> {
        self.write(false).await
    }

    async fn write(&self, stop: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO control (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(STOP_KEY)
        .bind(if stop { "true" } else { "false" })
        .execute(self.store.pool())
        .await?;

        tracing::debug!(stop, "Control flag written");
        Ok(())
    }
}
