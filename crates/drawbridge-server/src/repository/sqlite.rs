//! SQLite-backed repository.

use std::path::Path;
use std::sync::Mutex;

use drawbridge_core::{DrawbridgeError, DrawbridgeResult};
use rusqlite::{params, Connection, OptionalExtension};

use crate::events::Event;

use super::{DeviceRecord, NewService, Repository, ServiceRecord, StoredDeviceCert};

/// Repository over a single SQLite database file.
pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> DrawbridgeResult<Self> {
        let conn = Connection::open(path).map_err(store_err)?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> DrawbridgeResult<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> DrawbridgeResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS drawbridge_config(
                name TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS services(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                host TEXT NOT NULL,
                port INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS emissary_client(
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT UNIQUE NOT NULL,
                drawbridge_certificate TEXT UNIQUE NOT NULL,
                revoked INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS emissary_client_event(
                id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                device_ip TEXT NOT NULL,
                type TEXT NOT NULL,
                target_service TEXT,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_emissary_client_event_device_id
                ON emissary_client_event (device_id);
            "#,
        )
        .map_err(store_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> DrawbridgeResult<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| DrawbridgeError::Store("repository lock poisoned".into()))?;
        f(&conn).map_err(store_err)
    }
}

fn store_err(e: rusqlite::Error) -> DrawbridgeError {
    DrawbridgeError::Store(e.to_string())
}

impl Repository for SqliteRepository {
    fn get_setting(&self, key: &str) -> DrawbridgeResult<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM drawbridge_config WHERE name = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    fn put_setting(&self, key: &str, value: &str) -> DrawbridgeResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO drawbridge_config(name, value) VALUES(?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map(|_| ())
        })
    }

    fn list_services(&self) -> DrawbridgeResult<Vec<ServiceRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, description, host, port FROM services ORDER BY id ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(ServiceRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    host: row.get(3)?,
                    port: row.get(4)?,
                })
            })?;
            rows.collect()
        })
    }

    fn insert_service(&self, service: &NewService) -> DrawbridgeResult<ServiceRecord> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO services(name, description, host, port) VALUES(?1, ?2, ?3, ?4)",
                params![service.name, service.description, service.host, service.port],
            )?;
            let id = conn.last_insert_rowid() as u16;
            Ok(ServiceRecord {
                id,
                name: service.name.clone(),
                description: service.description.clone(),
                host: service.host.clone(),
                port: service.port,
            })
        })
    }

    fn update_service(&self, service: &ServiceRecord) -> DrawbridgeResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE services SET name = ?2, description = ?3, host = ?4, port = ?5
                 WHERE id = ?1",
                params![
                    service.id,
                    service.name,
                    service.description,
                    service.host,
                    service.port
                ],
            )
            .map(|_| ())
        })
    }

    fn delete_service(&self, id: u16) -> DrawbridgeResult<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM services WHERE id = ?1", params![id])
                .map(|_| ())
        })
    }

    fn list_device_certs(&self) -> DrawbridgeResult<Vec<StoredDeviceCert>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT drawbridge_certificate, id, revoked FROM emissary_client")?;
            let rows = stmt.query_map([], |row| {
                Ok(StoredDeviceCert {
                    certificate_pem: row.get(0)?,
                    device_id: row.get(1)?,
                    revoked: row.get::<_, i64>(2)? != 0,
                })
            })?;
            rows.collect()
        })
    }

    fn create_device(&self, device: &DeviceRecord) -> DrawbridgeResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO emissary_client(id, name, drawbridge_certificate, revoked)
                 VALUES(?1, ?2, ?3, ?4)",
                params![
                    device.id,
                    device.name,
                    device.certificate_pem,
                    device.revoked as i64
                ],
            )
            .map(|_| ())
        })
    }

    fn set_device_revoked(&self, device_id: &str, revoked: bool) -> DrawbridgeResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE emissary_client SET revoked = ?2 WHERE id = ?1",
                params![device_id, revoked as i64],
            )
            .map(|_| ())
        })
    }

    fn append_event(&self, event: &Event) -> DrawbridgeResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO emissary_client_event(id, device_id, device_ip, type, target_service, timestamp)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.id,
                    event.device_id,
                    event.source_ip,
                    event.request.as_str(),
                    event.target_service.map(|id| id.to_string()),
                    event.timestamp
                ],
            )
            .map(|_| ())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drawbridge_core::frame::RequestKind;

    #[test]
    fn settings_round_trip() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        assert_eq!(repo.get_setting("listening_address").unwrap(), None);
        repo.put_setting("listening_address", "10.0.0.5").unwrap();
        assert_eq!(
            repo.get_setting("listening_address").unwrap().as_deref(),
            Some("10.0.0.5")
        );
        repo.put_setting("listening_address", "10.0.0.6").unwrap();
        assert_eq!(
            repo.get_setting("listening_address").unwrap().as_deref(),
            Some("10.0.0.6")
        );
    }

    #[test]
    fn services_are_listed_in_id_order() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        for name in ["web", "db", "cache"] {
            repo.insert_service(&NewService {
                name: name.into(),
                description: String::new(),
                host: "127.0.0.1".into(),
                port: 8000,
            })
            .unwrap();
        }
        let services = repo.list_services().unwrap();
        let ids: Vec<u16> = services.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        repo.delete_service(2).unwrap();
        assert_eq!(repo.list_services().unwrap().len(), 2);
    }

    #[test]
    fn device_revocation_flag_round_trips() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        repo.create_device(&DeviceRecord {
            id: "dev-1".into(),
            name: "swift-otter".into(),
            certificate_pem: "PEM".into(),
            revoked: false,
        })
        .unwrap();

        repo.set_device_revoked("dev-1", true).unwrap();
        let certs = repo.list_device_certs().unwrap();
        assert_eq!(certs.len(), 1);
        assert!(certs[0].revoked);
        assert_eq!(certs[0].device_id, "dev-1");

        repo.set_device_revoked("dev-1", false).unwrap();
        assert!(!repo.list_device_certs().unwrap()[0].revoked);
    }

    #[test]
    fn events_append() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        let event = Event::new("dev-1", "203.0.113.9", RequestKind::Connect, Some(2));
        repo.append_event(&event).unwrap();
    }
}
