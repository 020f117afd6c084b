//! Schema-configurable vector collection with auto-embedding on a
//! designated text field.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::task;

/// Fixed embedding dimension (matches the original's `text-embedding-ada-002`).
pub const VECTOR_DIMENSION: usize = 1536;

const EMBED_MAX_ATTEMPTS: u32 = 5;
const EMBED_BASE_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum VectorError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store worker thread panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("record for key {0:?} is corrupt")]
    Corrupt(String, #[source] serde_json::Error),
    #[error("embedding provider returned {got} dimensions, expected {expected}")]
    DimensionMismatch { got: usize, expected: usize },
    #[error("embedding provider unavailable after {attempts} attempts: {source}")]
    EmbeddingUnavailable {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
}

/// A record that can be embedded and stored. `key` is the primary key the
/// caller addresses it by; `embedding_text` is the field auto-embedded on
/// upsert.
pub trait Embeddable: serde::Serialize + serde::de::DeserializeOwned + Clone + Send + Sync + 'static {
    fn key(&self) -> String;
    fn embedding_text(&self) -> &str;
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
    fn dimensions(&self) -> usize {
        VECTOR_DIMENSION
    }
}

async fn embed_with_retry(
    provider: &dyn EmbeddingProvider,
    text: &str,
) -> Result<Vec<f32>, VectorError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match provider.embed(text).await {
            Ok(vector) => return Ok(vector),
            Err(err) if attempt < EMBED_MAX_ATTEMPTS => {
                let backoff = EMBED_BASE_BACKOFF * 2u32.pow(attempt - 1);
                tracing::warn!(attempt, %err, "embedding call failed, retrying");
                tokio::time::sleep(backoff).await;
            }
            Err(err) => {
                return Err(VectorError::EmbeddingUnavailable {
                    attempts: attempt,
                    source: err,
                })
            }
        }
    }
}

fn embedding_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// An OpenAI-compatible `/embeddings` endpoint. Construction does not hit
/// the network; failures surface only from `embed`.
pub struct OpenAiEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiEmbeddingProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: api_key.into(),
            model: "text-embedding-ada-002".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

#[derive(serde::Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(serde::Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(serde::Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let resp = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: text,
            })
            .send()
            .await?
            .error_for_status()?
            .json::<EmbeddingResponse>()
            .await?;

        resp.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| anyhow::anyhow!("embedding response had no data"))
    }
}

/// Deterministic hash-based embedding, no network call. Used when no real
/// embedding provider is configured (local agent runs, tests).
#[derive(Clone)]
pub struct StubEmbeddingProvider {
    dims: usize,
}

impl StubEmbeddingProvider {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn hash_to_unit_range(text: &str, index: usize) -> f32 {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(index.to_le_bytes());
        let hash = hasher.finalize();
        let value = u32::from_le_bytes([hash[0], hash[1], hash[2], hash[3]]);
        (value as f32 / u32::MAX as f32) * 2.0 - 1.0
    }
}

impl Default for StubEmbeddingProvider {
    fn default() -> Self {
        Self::new(VECTOR_DIMENSION)
    }
}

#[async_trait]
impl EmbeddingProvider for StubEmbeddingProvider {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        Ok((0..self.dims).map(|index| Self::hash_to_unit_range(text, index)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

fn init_sqlite_vec() {
    use rusqlite::ffi::{sqlite3, sqlite3_api_routines, sqlite3_auto_extension};

    type Sqlite3AutoExtFn =
        unsafe extern "C" fn(*mut sqlite3, *mut *mut i8, *const sqlite3_api_routines) -> i32;

    unsafe {
        sqlite3_auto_extension(Some(std::mem::transmute::<*const (), Sqlite3AutoExtFn>(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
    }
}

/// One collection of `T` records, auto-embedded on `upsert`.
pub struct VectorStore<T: Embeddable> {
    db: Arc<Mutex<Connection>>,
    embedder: Arc<dyn EmbeddingProvider>,
    table: String,
    _marker: PhantomData<T>,
}

impl<T: Embeddable> VectorStore<T> {
    pub fn open(
        path: &str,
        collection: &str,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self, VectorError> {
        init_sqlite_vec();
        let conn = Connection::open(path)?;
        Self::from_connection(conn, collection, embedder)
    }

    pub fn open_in_memory(
        collection: &str,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self, VectorError> {
        init_sqlite_vec();
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, collection, embedder)
    }

    fn from_connection(
        conn: Connection,
        collection: &str,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self, VectorError> {
        let table = conclave_schema_free_sanitize(collection);
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                    rowid INTEGER PRIMARY KEY, \
                    key TEXT UNIQUE NOT NULL, \
                    document TEXT NOT NULL\
                )"
            ),
            [],
        )?;
        conn.execute(
            &format!(
                "CREATE VIRTUAL TABLE IF NOT EXISTS {table}_vec USING vec0(embedding float[{}])",
                embedder.dimensions()
            ),
            [],
        )?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            embedder,
            table,
            _marker: PhantomData,
        })
    }

    pub async fn upsert(&self, record: T) -> Result<(), VectorError> {
        let embedding = embed_with_retry(self.embedder.as_ref(), record.embedding_text()).await?;
        if embedding.len() != self.embedder.dimensions() {
            return Err(VectorError::DimensionMismatch {
                got: embedding.len(),
                expected: self.embedder.dimensions(),
            });
        }

        let key = record.key();
        let document = serde_json::to_string(&record)
            .expect("serializing a well-formed record to JSON cannot fail");
        let blob = embedding_to_blob(&embedding);
        let table = self.table.clone();
        let db = Arc::clone(&self.db);

        task::spawn_blocking(move || {
            let mut conn = db.lock().expect("vector store mutex poisoned");
            let tx = conn.transaction()?;
            let existing_rowid: Option<i64> = tx
                .query_row(
                    &format!("SELECT rowid FROM {table} WHERE key = ?1"),
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;

            let rowid = if let Some(rowid) = existing_rowid {
                tx.execute(
                    &format!("UPDATE {table} SET document = ?2 WHERE rowid = ?1"),
                    params![rowid, document],
                )?;
                tx.execute(
                    &format!("DELETE FROM {table}_vec WHERE rowid = ?1"),
                    params![rowid],
                )?;
                rowid
            } else {
                tx.execute(
                    &format!("INSERT INTO {table} (key, document) VALUES (?1, ?2)"),
                    params![key, document],
                )?;
                tx.last_insert_rowid()
            };

            tx.execute(
                &format!("INSERT INTO {table}_vec (rowid, embedding) VALUES (?1, ?2)"),
                params![rowid, blob],
            )?;
            tx.commit()?;
            Ok::<(), rusqlite::Error>(())
        })
        .await??;

        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<T>, VectorError> {
        let table = self.table.clone();
        let key_owned = key.to_owned();
        let db = Arc::clone(&self.db);
        let document: Option<String> = task::spawn_blocking(move || {
            let conn = db.lock().expect("vector store mutex poisoned");
            conn.query_row(
                &format!("SELECT document FROM {table} WHERE key = ?1"),
                params![key_owned],
                |row| row.get(0),
            )
            .optional()
        })
        .await??;

        match document {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| VectorError::Corrupt(key.to_owned(), e)),
        }
    }

    pub async fn contains(&self, key: &str) -> Result<bool, VectorError> {
        Ok(self.get(key).await?.is_some())
    }

    pub async fn delete(&self, key: &str) -> Result<(), VectorError> {
        let table = self.table.clone();
        let key_owned = key.to_owned();
        let db = Arc::clone(&self.db);
        task::spawn_blocking(move || {
            let conn = db.lock().expect("vector store mutex poisoned");
            let rowid: Option<i64> = conn
                .query_row(
                    &format!("SELECT rowid FROM {table} WHERE key = ?1"),
                    params![key_owned],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(rowid) = rowid {
                conn.execute(
                    &format!("DELETE FROM {table}_vec WHERE rowid = ?1"),
                    params![rowid],
                )?;
                conn.execute(&format!("DELETE FROM {table} WHERE rowid = ?1"), params![rowid])?;
            }
            Ok::<(), rusqlite::Error>(())
        })
        .await??;
        Ok(())
    }

    pub async fn len(&self) -> Result<usize, VectorError> {
        let table = self.table.clone();
        let db = Arc::clone(&self.db);
        let count: i64 = task::spawn_blocking(move || {
            let conn = db.lock().expect("vector store mutex poisoned");
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        })
        .await??;
        Ok(count as usize)
    }

    /// Runs one nearest-neighbour query per `query_texts` and deduplicates
    /// hits by key across the batch, stable first-seen order.
    pub async fn search(&self, query_texts: &[String], top_k: usize) -> Result<Vec<T>, VectorError> {
        let mut seen = std::collections::HashSet::new();
        let mut ordered = Vec::new();

        for text in query_texts {
            let embedding = embed_with_retry(self.embedder.as_ref(), text).await?;
            let blob = embedding_to_blob(&embedding);
            let table = self.table.clone();
            let db = Arc::clone(&self.db);
            let rows: Vec<(String, String)> = task::spawn_blocking(move || {
                let conn = db.lock().expect("vector store mutex poisoned");
                let mut stmt = conn.prepare(&format!(
                    "SELECT t.key, t.document FROM {table}_vec v \
                     JOIN {table} t ON t.rowid = v.rowid \
                     WHERE v.embedding MATCH ?1 AND k = ?2 \
                     ORDER BY v.distance"
                ))?;
                let rows = stmt
                    .query_map(params![blob, top_k as i64], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok::<_, rusqlite::Error>(rows)
            })
            .await??;

            for (key, document) in rows {
                if seen.insert(key.clone()) {
                    let record: T = serde_json::from_str(&document)
                        .map_err(|e| VectorError::Corrupt(key, e))?;
                    ordered.push(record);
                }
            }
        }

        Ok(ordered)
    }
}

/// Sanitises a collection name into a safe SQL identifier. Duplicated from
/// `conclave_schema::sanitize_name` rather than taken as a dependency: this
/// crate has no other reason to depend on the shared schema crate, and the
/// rule (alphanumeric-or-underscore) is a one-liner.
fn conclave_schema_free_sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}
