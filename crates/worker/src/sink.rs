//! Content storage for processed pages.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use tracing::instrument;

use crate::services::{ContentSink, PageRef, PageStage, ServiceError};

/// Table definitions. Idempotent.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS page_extractions (
    document_id TEXT NOT NULL,
    page        INTEGER NOT NULL CHECK (page >= 1),
    text        TEXT NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (document_id, page)
);

CREATE TABLE IF NOT EXISTS page_generations (
    document_id TEXT NOT NULL,
    page        INTEGER NOT NULL CHECK (page >= 1),
    content     JSONB NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (document_id, page)
);

CREATE TABLE IF NOT EXISTS document_page_cache (
    document_id TEXT NOT NULL,
    page        INTEGER NOT NULL CHECK (page >= 1),
    stage       TEXT NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (document_id, page)
);
"#;

#[derive(Debug, Clone)]
pub struct PostgresContentSink {
    pool: PgPool,
}

impl PostgresContentSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), ServiceError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error("migrate", e))?;
        Ok(())
    }
}

fn storage_error(operation: &str, err: sqlx::Error) -> ServiceError {
    ServiceError::Storage(format!("{operation} failed: {err}"))
}

fn page_number(page: &PageRef) -> Result<i32, ServiceError> {
    i32::try_from(page.page)
        .map_err(|_| ServiceError::InvalidInput(format!("page {} out of range", page.page)))
}

#[async_trait]
impl ContentSink for PostgresContentSink {
    #[instrument(skip(self, text), fields(page = %page), err)]
    async fn store_extraction(&self, page: &PageRef, text: &str) -> Result<(), ServiceError> {
        sqlx::query(
            "INSERT INTO page_extractions (document_id, page, text) VALUES ($1, $2, $3) \
             ON CONFLICT (document_id, page) DO UPDATE SET text = EXCLUDED.text, updated_at = now()",
        )
        .bind(&page.document_id)
        .bind(page_number(page)?)
        .bind(text)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error("store_extraction", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(page = %page), err)]
    async fn load_extraction(&self, page: &PageRef) -> Result<Option<String>, ServiceError> {
        let row = sqlx::query("SELECT text FROM page_extractions WHERE document_id = $1 AND page = $2")
            .bind(&page.document_id)
            .bind(page_number(page)?)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage_error("load_extraction", e))?;

        row.map(|r| r.try_get::<String, _>("text"))
            .transpose()
            .map_err(|e| storage_error("load_extraction", e))
    }

    #[instrument(skip(self, content), fields(page = %page), err)]
    async fn store_generation(&self, page: &PageRef, content: &JsonValue) -> Result<(), ServiceError> {
        sqlx::query(
            "INSERT INTO page_generations (document_id, page, content) VALUES ($1, $2, $3) \
             ON CONFLICT (document_id, page) DO UPDATE SET content = EXCLUDED.content, updated_at = now()",
        )
        .bind(&page.document_id)
        .bind(page_number(page)?)
        .bind(content)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error("store_generation", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(page = %page), err)]
    async fn update_cache(&self, page: &PageRef, stage: PageStage) -> Result<(), ServiceError> {
        sqlx::query(
            "INSERT INTO document_page_cache (document_id, page, stage) VALUES ($1, $2, $3) \
             ON CONFLICT (document_id, page) DO UPDATE SET stage = EXCLUDED.stage, updated_at = now()",
        )
        .bind(&page.document_id)
        .bind(page_number(page)?)
        .bind(stage.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error("update_cache", e))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Pages {
    extractions: HashMap<PageRef, String>,
    generations: HashMap<PageRef, JsonValue>,
    cache: HashMap<PageRef, PageStage>,
}

/// Single-process sink for tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryContentSink {
    pages: RwLock<Pages>,
}

impl InMemoryContentSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extraction(&self, page: &PageRef) -> Option<String> {
        self.pages.read().ok()?.extractions.get(page).cloned()
    }

    pub fn generation(&self, page: &PageRef) -> Option<JsonValue> {
        self.pages.read().ok()?.generations.get(page).cloned()
    }

    pub fn cache_stage(&self, page: &PageRef) -> Option<PageStage> {
        self.pages.read().ok()?.cache.get(page).copied()
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Pages>, ServiceError> {
        self.pages
            .write()
            .map_err(|_| ServiceError::Storage("content sink lock poisoned".to_string()))
    }
}

#[async_trait]
impl ContentSink for InMemoryContentSink {
    async fn store_extraction(&self, page: &PageRef, text: &str) -> Result<(), ServiceError> {
        self.write()?.extractions.insert(page.clone(), text.to_string());
        Ok(())
    }

    async fn load_extraction(&self, page: &PageRef) -> Result<Option<String>, ServiceError> {
        let pages = self
            .pages
            .read()
            .map_err(|_| ServiceError::Storage("content sink lock poisoned".to_string()))?;
        Ok(pages.extractions.get(page).cloned())
    }

    async fn store_generation(&self, page: &PageRef, content: &JsonValue) -> Result<(), ServiceError> {
        self.write()?.generations.insert(page.clone(), content.clone());
        Ok(())
    }

    async fn update_cache(&self, page: &PageRef, stage: PageStage) -> Result<(), ServiceError> {
        self.write()?.cache.insert(page.clone(), stage);
        Ok(())
    }
}
