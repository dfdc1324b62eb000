use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio_rusqlite::Connection;

use super::repository::{
    CursorPage, CursorQuery, Document, DocumentChunk, DocumentId, DocumentRepository, NewChunk,
    NewDocument, RepositoryError, ScoredChunk,
};
use super::vector::{self, to_blob};

type DocumentRow = (i64, String, String, String);
type ChunkRow = (i64, i64, String, Option<String>);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS documents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        content TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS document_chunks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        document_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
        chunk TEXT NOT NULL,
        metadata TEXT,
        embedding BLOB NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_document_chunks_document_id
        ON document_chunks(document_id);
";

/// Document store backed by SQLite, with cosine ranking done in SQL.
#[derive(Clone)]
pub struct SqliteDocumentRepository {
    conn: Arc<Connection>,
}

impl SqliteDocumentRepository {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RepositoryError::Connection(e.to_string()))?;
        }

        let conn = Connection::open(path)
            .await
            .map_err(|e| RepositoryError::Connection(e.to_string()))?;
        Self::with_connection(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, RepositoryError> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| RepositoryError::Connection(e.to_string()))?;
        Self::with_connection(conn).await
    }

    async fn with_connection(conn: Connection) -> Result<Self, RepositoryError> {
        let repo = Self {
            conn: Arc::new(conn),
        };
        repo.initialize().await?;
        Ok(repo)
    }

    async fn initialize(&self) -> Result<(), RepositoryError> {
        self.conn
            .call(|conn| {
                vector::register_functions(conn)?;
                // Cascading chunk deletes depend on this being on for the connection.
                conn.execute_batch("PRAGMA foreign_keys = ON;")?;
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await?;

        info!("Document store initialized");
        Ok(())
    }
}

fn insert_chunks(
    conn: &rusqlite::Connection,
    document_id: DocumentId,
    chunks: &[NewChunk],
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO document_chunks (document_id, chunk, metadata, embedding)
         VALUES (?1, ?2, ?3, ?4)",
    )?;

    for chunk in chunks {
        stmt.execute(params![
            document_id,
            chunk.chunk,
            chunk.metadata,
            to_blob(&chunk.embedding)
        ])?;
    }

    Ok(())
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("bad timestamp {:?}: {}", value, e)))
}

fn decode_document((id, content, created_at, updated_at): DocumentRow) -> Result<Document, RepositoryError> {
    Ok(Document {
        id,
        content,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn decode_chunk((id, document_id, chunk, metadata): ChunkRow) -> DocumentChunk {
    DocumentChunk {
        id,
        document_id,
        chunk,
        metadata,
    }
}

#[async_trait]
impl DocumentRepository for SqliteDocumentRepository {
    async fn save_document(&self, document: NewDocument) -> Result<DocumentId, RepositoryError> {
        let NewDocument { content, chunks } = document;
        let now = Utc::now().to_rfc3339();

        let id = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO documents (content, created_at, updated_at) VALUES (?1, ?2, ?2)",
                    params![content, now],
                )?;
                let document_id = tx.last_insert_rowid();
                insert_chunks(&tx, document_id, &chunks)?;
                tx.commit()?;
                Ok(document_id)
            })
            .await?;

        Ok(id)
    }

    async fn replace_document(
        &self,
        id: DocumentId,
        document: NewDocument,
    ) -> Result<bool, RepositoryError> {
        let NewDocument { content, chunks } = document;
        let now = Utc::now().to_rfc3339();

        let replaced = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let updated = tx.execute(
                    "UPDATE documents SET content = ?1, updated_at = ?2 WHERE id = ?3",
                    params![content, now, id],
                )?;
                if updated == 0 {
                    return Ok(false);
                }

                tx.execute("DELETE FROM document_chunks WHERE document_id = ?1", [id])?;
                insert_chunks(&tx, id, &chunks)?;
                tx.commit()?;
                Ok(true)
            })
            .await?;

        Ok(replaced)
    }

    async fn get_document(&self, id: DocumentId) -> Result<Option<Document>, RepositoryError> {
        let row: Option<DocumentRow> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, content, created_at, updated_at FROM documents WHERE id = ?1",
                )?;
                let mut rows = stmt.query([id])?;

                if let Some(row) = rows.next()? {
                    Ok(Some((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
                } else {
                    Ok(None)
                }
            })
            .await?;

        row.map(decode_document).transpose()
    }

    async fn get_relevant_chunks(
        &self,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<ScoredChunk>, RepositoryError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let dimensions = query.len();
        let query = to_blob(query);
        let (mismatch, rows) = self
            .conn
            .call(move |conn| {
                // Any stored vector of another width would fail inside the distance function.
                let mismatch: Option<i64> = conn
                    .query_row(
                        "SELECT length(embedding) FROM document_chunks
                         WHERE length(embedding) != ?1 LIMIT 1",
                        [query.len() as i64],
                        |row| row.get(0),
                    )
                    .optional()?;
                if mismatch.is_some() {
                    return Ok((mismatch, Vec::new()));
                }

                let mut stmt = conn.prepare(
                    "SELECT id, document_id, chunk, metadata,
                            vector_distance_cos(embedding, ?1) AS distance
                     FROM document_chunks
                     ORDER BY distance ASC, id ASC
                     LIMIT ?2",
                )?;

                let rows = stmt.query_map(params![query, top_k as i64], |row| {
                    Ok((
                        (row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?),
                        row.get::<_, f64>(4)?,
                    ))
                })?;

                let mut scored: Vec<(ChunkRow, f64)> = Vec::new();
                for row in rows {
                    scored.push(row?);
                }
                Ok((None, scored))
            })
            .await?;

        if let Some(bytes) = mismatch {
            return Err(RepositoryError::DimensionMismatch {
                expected: bytes as usize / 4,
                actual: dimensions,
            });
        }

        Ok(rows
            .into_iter()
            .map(|(row, distance)| ScoredChunk {
                chunk: decode_chunk(row),
                distance: distance as f32,
            })
            .collect())
    }

    async fn delete_document(&self, id: DocumentId) -> Result<bool, RepositoryError> {
        let deleted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let removed = tx.execute("DELETE FROM documents WHERE id = ?1", [id])?;
                tx.commit()?;
                Ok(removed > 0)
            })
            .await?;

        Ok(deleted)
    }

    async fn list_documents(
        &self,
        query: CursorQuery,
    ) -> Result<CursorPage<Document>, RepositoryError> {
        let page_size = query.page_size();
        let last_id = query.last_id();

        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, content, created_at, updated_at
                     FROM documents
                     WHERE ?1 IS NULL OR id < ?1
                     ORDER BY id DESC
                     LIMIT ?2",
                )?;

                // One extra row tells us whether another page exists.
                let rows = stmt.query_map(params![last_id, (page_size + 1) as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?;

                let mut documents: Vec<DocumentRow> = Vec::new();
                for row in rows {
                    documents.push(row?);
                }
                Ok(documents)
            })
            .await?;

        let documents = rows
            .into_iter()
            .map(decode_document)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CursorPage::from_overfetch(documents, page_size, |doc| doc.id))
    }

    async fn list_chunks(
        &self,
        document_id: DocumentId,
    ) -> Result<Vec<DocumentChunk>, RepositoryError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, document_id, chunk, metadata
                     FROM document_chunks
                     WHERE document_id = ?1
                     ORDER BY id ASC",
                )?;

                let rows = stmt.query_map([document_id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?;

                let mut chunks: Vec<ChunkRow> = Vec::new();
                for row in rows {
                    chunks.push(row?);
                }
                Ok(chunks)
            })
            .await?;

        Ok(rows.into_iter().map(decode_chunk).collect())
    }
}
