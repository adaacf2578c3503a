use async_trait::async_trait;
use sqlx::PgPool;

use crate::fs::error::{StoreError, StoreResult};
use crate::fs::path::ancestor_paths;
use crate::types::{LayerId, RecordId};

use super::models::{Item, ItemRecord, ItemType};
use super::pattern::{directory_prefix, escape_like_literal, to_sql_like};
use super::traits::LayerDatabase;

/// [`LayerDatabase`] over the `item_records` table.
#[derive(Clone)]
pub struct PgLayerDatabase {
    pool: PgPool,
}

impl PgLayerDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn current_record(&self, path: &str) -> StoreResult<Option<ItemRecord>> {
        let record = sqlx::query_as::<_, ItemRecord>(
            r#"
            SELECT record_id, layer_id, path, item_type, content
            FROM item_records
            WHERE path = $1
            ORDER BY layer_id DESC
            LIMIT 1
            "#,
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_under(&self, directory_path: &str, recursive: bool) -> StoreResult<Vec<Item>> {
        if !directory_path.is_empty() {
            match self.current_record(directory_path).await? {
                None => return Err(StoreError::NotFound(directory_path.to_string())),
                Some(record) if record.item_type == ItemType::File => {
                    return Err(StoreError::NotDirectory(directory_path.to_string()));
                }
                Some(_) => {}
            }
        }

        let prefix = escape_like_literal(&directory_prefix(directory_path));
        let descendants = format!("{}_%", prefix);
        // Matches nothing when listing recursively.
        let grandchildren = if recursive { String::new() } else { format!("{}%/%", prefix) };

        let rows = sqlx::query_as::<_, (String, ItemType)>(
            r#"
            SELECT r.path, r.item_type
            FROM item_records r
            WHERE r.path LIKE $1 ESCAPE '\'
              AND NOT (r.path LIKE $2 ESCAPE '\')
              AND r.layer_id = (
                  SELECT MAX(m.layer_id) FROM item_records m WHERE m.path = r.path
              )
            ORDER BY r.path
            "#,
        )
        .bind(&descendants)
        .bind(&grandchildren)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(path, item_type)| Item::new(path, item_type)).collect())
    }
}

#[async_trait]
impl LayerDatabase for PgLayerDatabase {
    async fn save_records(&self, records: Vec<ItemRecord>) -> StoreResult<Vec<ItemRecord>> {
        let mut tx = self.pool.begin().await?;
        let mut saved = Vec::with_capacity(records.len());

        for record in records {
            let updated = match record.id {
                Some(id) => {
                    sqlx::query_as::<_, ItemRecord>(
                        r#"
                        UPDATE item_records
                        SET layer_id = $2, path = $3, item_type = $4, content = $5
                        WHERE record_id = $1
                        RETURNING record_id, layer_id, path, item_type, content
                        "#,
                    )
                    .bind(id)
                    .bind(record.layer_id)
                    .bind(&record.path)
                    .bind(record.item_type)
                    .bind(&record.content)
                    .fetch_optional(&mut *tx)
                    .await?
                }
                None => None,
            };

            let row = match updated {
                Some(row) => row,
                None => {
                    sqlx::query_as::<_, ItemRecord>(
                        r#"
                        INSERT INTO item_records (layer_id, path, item_type, content)
                        VALUES ($1, $2, $3, $4)
                        ON CONFLICT (layer_id, path)
                        DO UPDATE SET item_type = EXCLUDED.item_type, content = EXCLUDED.content
                        RETURNING record_id, layer_id, path, item_type, content
                        "#,
                    )
                    .bind(record.layer_id)
                    .bind(&record.path)
                    .bind(record.item_type)
                    .bind(&record.content)
                    .fetch_one(&mut *tx)
                    .await?
                }
            };
            saved.push(row);
        }

        tx.commit().await?;
        tracing::debug!(count = saved.len(), "Saved item records");
        Ok(saved)
    }

    async fn delete_records_by_id(&self, ids: Vec<RecordId>) -> StoreResult<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let result = sqlx::query(
            r#"
            DELETE FROM item_records
            WHERE record_id = ANY($1)
            "#,
        )
        .bind(&ids)
        .execute(&self.pool)
        .await?;

        tracing::debug!(deleted = result.rows_affected(), "Deleted item records");
        Ok(())
    }

    async fn get_all_records(&self) -> StoreResult<Vec<ItemRecord>> {
        let records = sqlx::query_as::<_, ItemRecord>(
            r#"
            SELECT record_id, layer_id, path, item_type, content
            FROM item_records
            ORDER BY record_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_directory(&self, directory_path: &str) -> StoreResult<Vec<Item>> {
        self.list_under(directory_path, false).await
    }

    async fn list_recursive(&self, directory_path: &str) -> StoreResult<Vec<Item>> {
        self.list_under(directory_path, true).await
    }

    async fn add_directory(&self, layer_id: LayerId, path: &str) -> StoreResult<Vec<ItemRecord>> {
        let prefixes = ancestor_paths(path);
        let mut tx = self.pool.begin().await?;

        let occupied: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT path
            FROM item_records
            WHERE path = ANY($1) AND item_type = 'file'
            LIMIT 1
            "#,
        )
        .bind(&prefixes)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some((file_path,)) = occupied {
            return Err(StoreError::InvalidArgument(format!(
                "Path {} is already occupied by a file",
                file_path
            )));
        }

        let mut created = Vec::new();
        for prefix in &prefixes {
            let record = sqlx::query_as::<_, ItemRecord>(
                r#"
                INSERT INTO item_records (layer_id, path, item_type)
                VALUES ($1, $2, $3)
                ON CONFLICT (layer_id, path) DO NOTHING
                RETURNING record_id, layer_id, path, item_type, content
                "#,
            )
            .bind(layer_id)
            .bind(prefix)
            .bind(ItemType::Directory)
            .fetch_optional(&mut *tx)
            .await?;

            created.extend(record);
        }

        tx.commit().await?;

        if !created.is_empty() {
            tracing::debug!(layer_id, path = %path, created = created.len(), "Added directory records");
        }
        Ok(created)
    }

    async fn find_layers_containing(&self, path: &str) -> StoreResult<Vec<LayerId>> {
        let rows: Vec<(LayerId,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT layer_id
            FROM item_records
            WHERE path = $1
            ORDER BY layer_id
            "#,
        )
        .bind(path)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn get_records_by_path(&self, path: &str) -> StoreResult<Vec<ItemRecord>> {
        let records = sqlx::query_as::<_, ItemRecord>(
            r#"
            SELECT record_id, layer_id, path, item_type, content
            FROM item_records
            WHERE path = $1
            ORDER BY layer_id DESC
            "#,
        )
        .bind(path)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn exists_path_like(&self, pattern: &str) -> StoreResult<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(SELECT 1 FROM item_records WHERE path LIKE $1 ESCAPE '\')
            "#,
        )
        .bind(to_sql_like(pattern))
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn list_layer_ids(&self) -> StoreResult<Vec<LayerId>> {
        let rows: Vec<(LayerId,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT layer_id
            FROM item_records
            ORDER BY layer_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn get_records_by_layer_id(&self, layer_id: LayerId) -> StoreResult<Vec<ItemRecord>> {
        let records = sqlx::query_as::<_, ItemRecord>(
            r#"
            SELECT record_id, layer_id, path, item_type, content
            FROM item_records
            WHERE layer_id = $1
            ORDER BY path
            "#,
        )
        .bind(layer_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}
