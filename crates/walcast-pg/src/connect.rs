//! Connection settings and the control-plane client.
//!
//! Slot management runs over a regular tokio-postgres connection. The
//! replication stream uses its own connection (see `replication::connection`)
//! opened from the same connection string.

use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use tokio_postgres::config::Host;
use tokio_postgres::Client;
use tokio_postgres_rustls_improved::MakeRustlsConnect;
use tracing::{debug, error};

use crate::error::{PgError, PgResult};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where and how to open the replication connection.
#[derive(Clone)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<Vec<u8>>,
    pub database: String,
    pub application_name: String,
    pub tls: bool,
    pub connect_timeout: Duration,
}

impl std::fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("application_name", &self.application_name)
            .field("tls", &self.tls)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl ConnectionTarget {
    /// Parse a libpq key/value string or a postgres:// URL.
    pub fn parse(connection_string: &str) -> PgResult<Self> {
        let config: tokio_postgres::Config = connection_string
            .parse()
            .map_err(|e| PgError::Connection(format!("invalid connection string: {}", e)))?;

        let host = match config.get_hosts().first() {
            Some(Host::Tcp(host)) => host.clone(),
            Some(_) => {
                return Err(PgError::Connection(
                    "unix socket hosts are not supported for replication".into(),
                ))
            }
            None => "localhost".to_string(),
        };

        let user = config.get_user().unwrap_or("postgres").to_string();
        let database = config
            .get_dbname()
            .map(str::to_string)
            .unwrap_or_else(|| user.clone());

        let target = Self {
            host,
            port: config.get_ports().first().copied().unwrap_or(5432),
            user,
            password: config.get_password().map(<[u8]>::to_vec),
            database,
            application_name: config
                .get_application_name()
                .unwrap_or("walcast")
                .to_string(),
            tls: requires_tls(connection_string),
            connect_timeout: config
                .get_connect_timeout()
                .copied()
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        };

        debug!(
            host = %target.host,
            port = target.port,
            user = %target.user,
            database = %target.database,
            tls = target.tls,
            "Parsed replication connection parameters"
        );

        Ok(target)
    }
}

/// Open the control-plane connection used for slot management.
/// Spawns the connection task and returns only the client.
pub async fn connect_control(connection_string: &str) -> PgResult<Client> {
    if requires_tls(connection_string) {
        let (client, connection) = tokio_postgres::connect(connection_string, tls_connector()?)
            .await
            .map_err(|e| PgError::Connection(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "Postgres control connection error");
            }
        });

        Ok(client)
    } else {
        let (client, connection) = tokio_postgres::connect(connection_string, tokio_postgres::NoTls)
            .await
            .map_err(|e| PgError::Connection(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "Postgres control connection error");
            }
        });

        Ok(client)
    }
}

/// rustls connector trusting the webpki root set.
pub(crate) fn tls_connector() -> PgResult<MakeRustlsConnect> {
    let config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| PgError::Connection(format!("TLS config error: {}", e)))?
            .with_root_certificates(root_certs())
            .with_no_client_auth();

    Ok(MakeRustlsConnect::new(config))
}

/// Get root certificates from webpki-roots.
fn root_certs() -> rustls::RootCertStore {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

/// Check if the connection string requires TLS.
pub fn requires_tls(connection_string: &str) -> bool {
    connection_string.contains("sslmode=require")
        || connection_string.contains("sslmode=verify-ca")
        || connection_string.contains("sslmode=verify-full")
}
