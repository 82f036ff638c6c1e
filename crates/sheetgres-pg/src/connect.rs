//! Postgres connection setup.
//!
//! Every engine connection negotiates TLS from the `sslmode` in the
//! connection string and is initialized with the session settings the sync
//! statements rely on: a bounded statement time (timed-out statements
//! surface as transient errors and are retried) and an application_name
//! the operator can spot in pg_stat_activity.

use std::future::Future;
use std::sync::Arc;

use rustls::ClientConfig;
use tokio_postgres::Client;
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::error;

use crate::error::{PgError, PgResult};

const SESSION_SETUP: &str = "\
    SET statement_timeout = '10s'; \
    SET application_name = 'sheetgres';";

/// Connect, spawn the connection driver, and prepare the session.
pub async fn connect_postgres(connection_string: &str) -> PgResult<Client> {
    let client = match sslmode(connection_string) {
        Some("require") | Some("verify-ca") | Some("verify-full") => {
            let tls = MakeRustlsConnect::new(tls_config()?);
            let (client, connection) = tokio_postgres::connect(connection_string, tls)
                .await
                .map_err(|e| PgError::Connection(e.to_string()))?;
            spawn_driver(connection);
            client
        }
        _ => {
            let (client, connection) =
                tokio_postgres::connect(connection_string, tokio_postgres::NoTls)
                    .await
                    .map_err(|e| PgError::Connection(e.to_string()))?;
            spawn_driver(connection);
            client
        }
    };

    client
        .batch_execute(SESSION_SETUP)
        .await
        .map_err(|e| PgError::Connection(format!("session setup failed: {}", e)))?;

    Ok(client)
}

/// The connection object drives all traffic for its client; it runs as its
/// own task until the client is dropped.
fn spawn_driver<F>(connection: F)
where
    F: Future<Output = Result<(), tokio_postgres::Error>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!(error = %e, "Postgres connection error");
        }
    });
}

fn tls_config() -> PgResult<ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| PgError::Connection(format!("TLS config error: {}", e)))
        .map(|builder| builder.with_root_certificates(roots).with_no_client_auth())
}

/// Extract the `sslmode` value from either URI (`...?sslmode=require`) or
/// key-value (`host=h sslmode=require`) connection strings.
fn sslmode(connection_string: &str) -> Option<&str> {
    connection_string
        .split(['?', '&', ' '])
        .find_map(|part| part.strip_prefix("sslmode="))
}
