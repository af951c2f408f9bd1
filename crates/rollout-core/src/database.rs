//! Database engine boundary: schema scripts, reset, dump and restore.
//!
//! The orchestrator never keeps a connection open. Every call shells out to
//! the engine's own client tools for the duration of one operation.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::DatabaseConfig;
use crate::error::{Result, RolloutError};

/// Connection parameters for a site's database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseTarget {
    /// Connection string, or `env:NAME` to read it from the environment
    /// when an operation starts.
    pub url: String,
}

impl DatabaseTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn resolve(&self) -> Result<String> {
        match self.url.strip_prefix("env:") {
            Some(var) => std::env::var(var).map_err(|_| RolloutError::MissingEnv(var.to_string())),
            None => Ok(self.url.clone()),
        }
    }
}

#[async_trait]
pub trait DatabaseEngine: Send + Sync {
    /// Run one migration script as a single transaction.
    async fn apply(&self, url: &str, script: &Path) -> Result<()>;
    /// Drop and recreate the schema.
    async fn reset(&self, url: &str) -> Result<()>;
    /// Dump the database to `dest`; returns the dump size in bytes.
    async fn dump(&self, url: &str, dest: &Path) -> Result<u64>;
    async fn restore(&self, url: &str, src: &Path) -> Result<()>;
}

/// A connection string split so the password never appears in argv.
#[derive(Debug, PartialEq, Eq)]
struct Connection {
    /// Passed as `-d`; without the password.
    conninfo: String,
    /// Passed as `PGPASSWORD`.
    password: Option<String>,
}

impl Connection {
    /// Keyword-style conninfo strings are not URLs and pass through as-is.
    fn parse(url: &str) -> Self {
        let Ok(mut parsed) = reqwest::Url::parse(url) else {
            return Self {
                conninfo: url.to_string(),
                password: None,
            };
        };
        let password = parsed.password().map(|raw| {
            urlencoding::decode(raw)
                .map(|decoded| decoded.into_owned())
                .unwrap_or_else(|_| raw.to_string())
        });
        if password.is_some() {
            let _ = parsed.set_password(None);
        }
        Self {
            conninfo: parsed.to_string(),
            password,
        }
    }
}

/// PostgreSQL through `psql`, `pg_dump` and `pg_restore`.
pub struct Postgres {
    config: DatabaseConfig,
}

impl Postgres {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }

    async fn run(&self, bin: &str, url: &str, args: &[&str]) -> Result<()> {
        let path = which::which(bin).map_err(|_| RolloutError::ToolNotInstalled(bin.to_string()))?;
        let conn = Connection::parse(url);
        let mut command = Command::new(path);
        command.arg("-d").arg(&conn.conninfo).args(args).stdin(Stdio::null());
        if let Some(password) = &conn.password {
            command.env("PGPASSWORD", password);
        }
        let output = command.output().await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(RolloutError::external(
            "database",
            format!("{bin} failed: {}", stderr.trim()),
        ))
    }
}

#[async_trait]
impl DatabaseEngine for Postgres {
    async fn apply(&self, url: &str, script: &Path) -> Result<()> {
        let script = script.to_string_lossy();
        self.run(
            &self.config.psql_bin,
            url,
            &[
                "--no-psqlrc",
                "--single-transaction",
                "-v",
                "ON_ERROR_STOP=1",
                "-f",
                &script,
            ],
        )
        .await
    }

    async fn reset(&self, url: &str) -> Result<()> {
        self.run(
            &self.config.psql_bin,
            url,
            &[
                "--no-psqlrc",
                "-v",
                "ON_ERROR_STOP=1",
                "-c",
                "DROP SCHEMA IF EXISTS public CASCADE; CREATE SCHEMA public;",
            ],
        )
        .await
    }

    async fn dump(&self, url: &str, dest: &Path) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let dest_str = dest.to_string_lossy();
        self.run(
            &self.config.pg_dump_bin,
            url,
            &["--format=custom", "--no-owner", "-f", &dest_str],
        )
        .await?;
        Ok(std::fs::metadata(dest)?.len())
    }

    async fn restore(&self, url: &str, src: &Path) -> Result<()> {
        let src = src.to_string_lossy();
        self.run(
            &self.config.pg_restore_bin,
            url,
            &[
                "--clean",
                "--if-exists",
                "--no-owner",
                "--single-transaction",
                &src,
            ],
        )
        .await
    }
}
