use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::model::{Forwarding, Tunnel};

#[derive(Debug, Error)]
pub enum Error {
    #[error("row not found")]
    NotFound,
    #[error("uniqueness constraint violated: {0}")]
    Constraint(String),
    #[error("database error: {0}")]
    Sqlite(rusqlite::Error),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::QueryReturnedNoRows => Error::NotFound,
            rusqlite::Error::SqliteFailure(failure, message)
                if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::Constraint(message.clone().unwrap_or_else(|| "constraint violation".to_string()))
            }
            _ => Error::Sqlite(e),
        }
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tunnels (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    server     TEXT    NOT NULL UNIQUE,
    client     TEXT    NOT NULL,
    key        TEXT    NOT NULL UNIQUE,
    active     INTEGER NOT NULL DEFAULT 0,
    created_at TEXT    NOT NULL,
    updated_at TEXT    NOT NULL
);
CREATE TABLE IF NOT EXISTS forwardings (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    tunnel_id  INTEGER NOT NULL REFERENCES tunnels (id),
    dst_addr   TEXT    NOT NULL,
    dst_port   INTEGER NOT NULL,
    loc_port   INTEGER NOT NULL UNIQUE,
    active     INTEGER NOT NULL DEFAULT 0,
    created_at TEXT    NOT NULL,
    updated_at TEXT    NOT NULL
);
";

/// Single source of truth for desired state. All access runs under the
/// engine's process-wide lock; the UNIQUE constraints are the last line of
/// defense, not the concurrency story.
pub struct Store {
    conn: Connection,
}

fn parse_addr(value: String) -> rusqlite::Result<Ipv4Addr> {
    value
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn tunnel_from_row(row: &Row<'_>) -> rusqlite::Result<Tunnel> {
    Ok(Tunnel {
        id: row.get("id")?,
        server: parse_addr(row.get("server")?)?,
        client: parse_addr(row.get("client")?)?,
        key: row.get("key")?,
        active: row.get("active")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn forwarding_from_row(row: &Row<'_>) -> rusqlite::Result<Forwarding> {
    Ok(Forwarding {
        id: row.get("id")?,
        tunnel_id: row.get("tunnel_id")?,
        dst_addr: parse_addr(row.get("dst_addr")?)?,
        dst_port: row.get("dst_port")?,
        loc_port: row.get("loc_port")?,
        active: row.get("active")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, Error> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Store { conn })
    }

    pub fn insert_tunnel(&mut self, server: Ipv4Addr, client: Ipv4Addr, key: &str) -> Result<Tunnel, Error> {
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO tunnels (server, client, key, active, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?4)",
            params![server.to_string(), client.to_string(), key, now],
        )?;
        self.get_tunnel(self.conn.last_insert_rowid())
    }

    pub fn get_tunnel(&self, id: i64) -> Result<Tunnel, Error> {
        let tunnel = self
            .conn
            .query_row("SELECT * FROM tunnels WHERE id = ?1", params![id], tunnel_from_row)?;
        Ok(tunnel)
    }

    pub fn list_tunnels(&self) -> Result<Vec<Tunnel>, Error> {
        let mut stmt = self.conn.prepare("SELECT * FROM tunnels ORDER BY id")?;
        let tunnels = stmt
            .query_map([], tunnel_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tunnels)
    }

    pub fn set_tunnel_active(&mut self, id: i64, active: bool) -> Result<Tunnel, Error> {
        let changed = self.conn.execute(
            "UPDATE tunnels SET active = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, active, Utc::now()],
        )?;
        if changed == 0 {
            return Err(Error::NotFound);
        }
        self.get_tunnel(id)
    }

    pub fn delete_tunnel(&mut self, id: i64) -> Result<(), Error> {
        let deleted = self.conn.execute("DELETE FROM tunnels WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    /// Every address either side of a tunnel occupies, for the allocator.
    pub fn used_addresses(&self) -> Result<HashSet<Ipv4Addr>, Error> {
        let mut stmt = self.conn.prepare("SELECT server, client FROM tunnels")?;
        let mut used = HashSet::new();
        let rows = stmt.query_map([], |row| {
            Ok((parse_addr(row.get(0)?)?, parse_addr(row.get(1)?)?))
        })?;
        for row in rows {
            let (server, client) = row?;
            used.insert(server);
            used.insert(client);
        }
        Ok(used)
    }

    pub fn insert_forwarding(
        &mut self,
        tunnel_id: i64,
        dst_addr: Ipv4Addr,
        dst_port: u16,
        loc_port: u16,
    ) -> Result<Forwarding, Error> {
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO forwardings (tunnel_id, dst_addr, dst_port, loc_port, active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
            params![tunnel_id, dst_addr.to_string(), dst_port, loc_port, now],
        )?;
        self.get_forwarding(self.conn.last_insert_rowid())
    }

    pub fn get_forwarding(&self, id: i64) -> Result<Forwarding, Error> {
        let forwarding = self.conn.query_row(
            "SELECT * FROM forwardings WHERE id = ?1",
            params![id],
            forwarding_from_row,
        )?;
        Ok(forwarding)
    }

    /// The dedup lookup: one forwarding per (tunnel, destination) triple.
    pub fn find_forwarding(
        &self,
        tunnel_id: i64,
        dst_addr: Ipv4Addr,
        dst_port: u16,
    ) -> Result<Option<Forwarding>, Error> {
        let forwarding = self
            .conn
            .query_row(
                "SELECT * FROM forwardings WHERE tunnel_id = ?1 AND dst_addr = ?2 AND dst_port = ?3
                 ORDER BY id LIMIT 1",
                params![tunnel_id, dst_addr.to_string(), dst_port],
                forwarding_from_row,
            )
            .optional()?;
        Ok(forwarding)
    }

    /// Forwardings of one tunnel in creation order.
    pub fn forwardings_for(&self, tunnel_id: i64) -> Result<Vec<Forwarding>, Error> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM forwardings WHERE tunnel_id = ?1 ORDER BY id")?;
        let forwardings = stmt
            .query_map(params![tunnel_id], forwarding_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(forwardings)
    }

    /// Flips desired state and refreshes the last-touch timestamp.
    pub fn set_forwarding_active(&mut self, id: i64, active: bool) -> Result<Forwarding, Error> {
        let changed = self.conn.execute(
            "UPDATE forwardings SET active = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, active, Utc::now()],
        )?;
        if changed == 0 {
            return Err(Error::NotFound);
        }
        self.get_forwarding(id)
    }

    pub fn delete_forwarding(&mut self, id: i64) -> Result<(), Error> {
        let deleted = self
            .conn
            .execute("DELETE FROM forwardings WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    pub fn used_ports(&self) -> Result<HashSet<u16>, Error> {
        let mut stmt = self.conn.prepare("SELECT loc_port FROM forwardings")?;
        let ports = stmt
            .query_map([], |row| row.get::<_, u16>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(ports)
    }

    /// Forwardings untouched since `cutoff`, optionally per tunnel.
    pub fn stale_forwardings(
        &self,
        cutoff: DateTime<Utc>,
        tunnels: Option<&[i64]>,
    ) -> Result<Vec<Forwarding>, Error> {
        let mut stmt = self
            .conn
            .prepare("SELECT * FROM forwardings WHERE updated_at < ?1 ORDER BY id")?;
        let forwardings = stmt
            .query_map(params![cutoff], forwarding_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(forwardings
            .into_iter()
            .filter(|f| tunnels.is_none_or(|ids| ids.contains(&f.tunnel_id)))
            .collect())
    }

    /// Used by tests to age rows; real timestamps come from mutations.
    #[cfg(test)]
    pub fn backdate_forwarding(&mut self, id: i64, updated_at: DateTime<Utc>) -> Result<(), Error> {
        self.conn.execute(
            "UPDATE forwardings SET updated_at = ?2 WHERE id = ?1",
            params![id, updated_at],
        )?;
        Ok(())
    }
}
