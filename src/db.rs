//! Database connection helper.
//!
//! Nothing persists yet: no route and no view calls this. It exists so a
//! future location store has a single place to get its connection from.

use color_eyre::eyre::{eyre, Result, WrapErr};
use rusqlite::Connection;
use tracing::{error, info};

pub const DB_URI_VAR: &str = "DB_URI";

/// Opens the SQLite database named by `DB_URI`.
pub fn connect_from_env() -> Result<Connection> {
    let uri = std::env::var(DB_URI_VAR).map_err(|_| eyre!("{} is not set", DB_URI_VAR))?;
    connect(&uri)
}

pub fn connect(uri: &str) -> Result<Connection> {
    match Connection::open(uri) {
        Ok(conn) => {
            info!("DB connected");
            Ok(conn)
        }
        Err(e) => {
            error!("DB connection failed: {}", e);
            Err(e).wrap_err_with(|| format!("could not open database at {}", uri))
        }
    }
}
