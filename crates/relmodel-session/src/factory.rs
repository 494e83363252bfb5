//! Session factory: registered drivers plus the one configured data source.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use relmodel_core::{DataSourceConfig, Driver, Error, Result};

use crate::session::Session;

/// Opens sessions against a data source configured once.
///
/// ```ignore
/// let mut factory = SessionFactory::new();
/// factory.register_driver(SqliteDriver);
/// factory.configure(DataSourceConfig::new("sqlite", ":memory:"))?;
/// let session = factory.session()?;
/// ```
#[derive(Default)]
pub struct SessionFactory {
    drivers: HashMap<String, Arc<dyn Driver>>,
    config: Option<DataSourceConfig>,
}

impl SessionFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `driver` available under its name. A driver registered under
    /// the same name is replaced.
    pub fn register_driver(&mut self, driver: impl Driver + 'static) -> &mut Self {
        let name = driver.name().to_string();
        tracing::debug!(driver = %name, "Registered driver");
        self.drivers.insert(name, Arc::new(driver));
        self
    }

    /// Set the data source. Fails if one is already configured; call
    /// [`reset`](Self::reset) first to replace it.
    pub fn configure(&mut self, config: DataSourceConfig) -> Result<()> {
        if let Some(current) = &self.config {
            return Err(Error::config(format!(
                "data source already configured (driver '{}', url '{}'); reset before reconfiguring",
                current.driver, current.url
            )));
        }
        tracing::info!(driver = %config.driver, url = %config.url, "Configured data source");
        self.config = Some(config);
        Ok(())
    }

    /// Forget the configured data source.
    pub fn reset(&mut self) {
        if self.config.take().is_some() {
            tracing::info!("Data source configuration reset");
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    pub fn config(&self) -> Option<&DataSourceConfig> {
        self.config.as_ref()
    }

    /// Open a session on a new connection to the configured data source.
    pub fn session(&self) -> Result<Session> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| Error::config("no data source configured; call configure first"))?;
        let driver = self.drivers.get(&config.driver).ok_or_else(|| {
            Error::config(format!("no driver registered under '{}'", config.driver))
        })?;
        let conn = driver.connect(config)?;
        tracing::debug!(driver = %config.driver, "Opened session");
        Ok(Session::new(conn))
    }
}

impl fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut drivers: Vec<&str> = self.drivers.keys().map(String::as_str).collect();
        drivers.sort_unstable();
        f.debug_struct("SessionFactory")
            .field("drivers", &drivers)
            .field("config", &self.config)
            .finish()
    }
}
