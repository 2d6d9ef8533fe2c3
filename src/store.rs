//! SQLite-backed persistence for captured requests and responses.
//!
//! Wraps a single `rusqlite::Connection` in `Arc<Mutex<..>>` to realize the
//! process-wide write-serialization lock from spec §5: only one INSERT (and
//! its `last_insert_rowid()` read) runs at a time, so concurrently captured
//! requests still get correctly assigned, collision-free ids.

use crate::error::ProxyError;
use crate::request::Request;
use crate::response::Response;
use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS request (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    method TEXT, host TEXT, port INTEGER, path TEXT,
    get_params TEXT, headers TEXT, cookies TEXT,
    body BLOB, post_params TEXT, is_https BOOLEAN
);
CREATE TABLE IF NOT EXISTS response (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id INTEGER REFERENCES request(id),
    code INTEGER, message TEXT, headers TEXT, set_cookie TEXT, body BLOB
);
";

pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).context("failed to open SQLite database")?;
        conn.execute_batch(SCHEMA).context("failed to apply schema")?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        conn.execute_batch(SCHEMA).context("failed to apply schema")?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert the request row, returning the assigned id. The only
    /// mutation the message model performs on the store, per spec §4.2.
    pub fn save_request(&self, request: &Request) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO request (method, host, port, path, get_params, headers, cookies, body, post_params, is_https)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                request.method,
                request.host,
                request.port,
                request.path,
                serde_json::to_string(&request.get_params)?,
                serde_json::to_string(&request.headers)?,
                serde_json::to_string(&request.cookies)?,
                request.body.as_ref(),
                serde_json::to_string(&request.post_params)?,
                request.is_https,
            ],
        )
        .map_err(|e| ProxyError::DbWriteFailure(e.to_string()))?;

        Ok(conn.last_insert_rowid())
    }

    pub fn save_response(&self, response: &Response) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO response (request_id, code, message, headers, set_cookie, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                response.request_id,
                response.status_code,
                response.reason_phrase,
                serde_json::to_string(&response.headers)?,
                serde_json::to_string(&response.set_cookie)?,
                response.body.as_ref(),
            ],
        )
        .map_err(|e| ProxyError::DbWriteFailure(e.to_string()))?;

        Ok(conn.last_insert_rowid())
    }

    pub fn get_request(&self, id: i64) -> Result<Request> {
        let conn = self.lock();
        conn.query_row("SELECT * FROM request WHERE id = ?1", params![id], |row| {
            Request::from_row(row)
        })
        .map_err(|_| ProxyError::NotFound(format!("no request with id {id}")).into())
    }

    pub fn list_requests(&self) -> Result<Vec<Request>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM request ORDER BY id")?;
        let rows = stmt
            .query_map([], Request::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read request rows")?;
        Ok(rows)
    }

    pub fn get_response(&self, id: i64) -> Result<Response> {
        let conn = self.lock();
        conn.query_row("SELECT * FROM response WHERE id = ?1", params![id], |row| {
            Response::from_row(row)
        })
        .map_err(|_| ProxyError::NotFound(format!("no response with id {id}")).into())
    }

    pub fn list_responses(&self) -> Result<Vec<Response>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM response ORDER BY id")?;
        let rows = stmt
            .query_map([], Response::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read response rows")?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{OrderedMap, ParamValue};
    use bytes::Bytes;

    fn sample_request() -> Request {
        let mut get_params = OrderedMap::new();
        get_params.insert("id", ParamValue::Single("7".to_string()));
        let mut headers = OrderedMap::new();
        headers.insert_ci("Host", "example.com");

        Request::from_fields(
            "GET",
            "example.com",
            80,
            "/a",
            get_params,
            headers,
            OrderedMap::new(),
            Bytes::new(),
            OrderedMap::new(),
            false,
        )
    }

    #[test]
    fn save_and_load_request_round_trips_fields() {
        let store = Store::open_in_memory().unwrap();
        let mut request = sample_request();
        let id = request.save(&store).unwrap();

        let loaded = store.get_request(id).unwrap();
        assert_eq!(loaded.method, "GET");
        assert_eq!(loaded.host, "example.com");
        assert_eq!(loaded.path, "/a");
        assert_eq!(
            loaded.get_params.get("id"),
            Some(&ParamValue::Single("7".to_string()))
        );
        assert!(!loaded.is_https);
    }

    #[test]
    fn get_request_missing_id_returns_not_found() {
        let store = Store::open_in_memory().unwrap();
        let result = store.get_request(999);
        assert!(result.is_err());
    }

    #[test]
    fn save_response_returns_incrementing_ids() {
        let store = Store::open_in_memory().unwrap();
        let mut request = sample_request();
        let request_id = request.save(&store).unwrap();

        let mut r1 = Response {
            id: None,
            request_id,
            status_code: 200,
            reason_phrase: "OK".to_string(),
            headers: OrderedMap::new(),
            set_cookie: OrderedMap::new(),
            body: Bytes::new(),
            body_decode_failed: false,
        };
        let mut r2 = r1.clone();

        let id1 = r1.save(&store).unwrap();
        let id2 = r2.save(&store).unwrap();
        assert_ne!(id1, id2);
    }

    #[test]
    fn list_requests_returns_insertion_order() {
        let store = Store::open_in_memory().unwrap();
        let mut a = sample_request();
        a.path = "/a".to_string();
        let mut b = sample_request();
        b.path = "/b".to_string();

        a.save(&store).unwrap();
        b.save(&store).unwrap();

        let all = store.list_requests().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].path, "/a");
        assert_eq!(all[1].path, "/b");
    }
}
