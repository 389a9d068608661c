//! Database access behind a trait.
//!
//! The migrator talks to PostgreSQL only through [`CacheDriver`], so
//! tests substitute a recording driver and never need a live server.
//! [`PgDriver`] is the production implementation over a synchronous
//! [`postgres::Client`].

use std::fmt;

use postgres::Client;
use postgres::error::SqlState;

use crate::ast::TableId;
use crate::meta::CacheMeta;
use crate::objects::{CacheColumn, CacheIndexArtifact, DatabaseFunction, DatabaseTrigger};
use crate::schema::{ColumnDef, SchemaSnapshot, TableDef};

/// A database-level failure, keeping the SQLSTATE so callers can treat
/// specific conditions (dependent objects on drop, say) as benign.
#[derive(Debug, Clone)]
pub struct DbError {
    pub code: Option<String>,
    pub message: String,
}

impl DbError {
    pub fn message(message: impl Into<String>) -> Self {
        DbError {
            code: None,
            message: message.into(),
        }
    }

    /// `2BP01`: the object still has dependents and cannot be dropped.
    pub fn is_dependent_objects(&self) -> bool {
        self.code.as_deref() == Some(SqlState::DEPENDENT_OBJECTS_STILL_EXIST.code())
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} ({code})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl From<postgres::Error> for DbError {
    fn from(err: postgres::Error) -> Self {
        DbError {
            code: err.code().map(|c| c.code().to_string()),
            message: err.to_string(),
        }
    }
}

/// Everything the migrator needs from the database.
pub trait CacheDriver {
    /// Tables and columns of every user schema.
    fn load_schema(&mut self) -> Result<SchemaSnapshot, DbError>;

    fn load_cache_meta(&mut self) -> Result<Vec<CacheMeta>, DbError>;
    fn save_cache_meta(&mut self, meta: &CacheMeta) -> Result<(), DbError>;
    fn delete_cache_meta(&mut self, cache_name: &str) -> Result<(), DbError>;

    fn create_or_replace_function(&mut self, function: &DatabaseFunction) -> Result<(), DbError>;
    fn force_drop_function(&mut self, function: &DatabaseFunction) -> Result<(), DbError>;
    fn create_trigger(&mut self, trigger: &DatabaseTrigger) -> Result<(), DbError>;
    fn force_drop_trigger(&mut self, trigger: &DatabaseTrigger) -> Result<(), DbError>;

    fn create_column(&mut self, column: &CacheColumn) -> Result<(), DbError>;
    fn drop_column(&mut self, table: &TableId, column: &str) -> Result<(), DbError>;
    fn create_index(&mut self, index: &CacheIndexArtifact) -> Result<(), DbError>;

    /// Run one backfill batch, returning the number of rows updated.
    fn update_cache_batch(&mut self, sql: &str) -> Result<u64, DbError>;
}

/// Production driver over a blocking connection.
pub struct PgDriver {
    client: Client,
}

const META_TABLE_DDL: &str = "create table if not exists public.pg_denorm_cache (\n\
    name text primary key,\n\
    for_table text not null,\n\
    definition text not null,\n\
    signature text not null,\n\
    level int not null default 0,\n\
    columns jsonb not null,\n\
    applied_at timestamptz not null\n\
);\n\
alter table public.pg_denorm_cache\n\
    add column if not exists level int not null default 0";

impl PgDriver {
    /// Wrap a connected client, creating the metadata table if missing.
    pub fn new(mut client: Client) -> Result<Self, DbError> {
        client.batch_execute(META_TABLE_DDL)?;
        Ok(PgDriver { client })
    }
}

impl CacheDriver for PgDriver {
    fn load_schema(&mut self) -> Result<SchemaSnapshot, DbError> {
        let rows = self.client.query(
            "select table_schema, table_name, column_name,\n\
             case when data_type = 'ARRAY' then substring(udt_name from 2) || '[]'\n\
                  else udt_name end as type_name\n\
             from information_schema.columns\n\
             where table_schema not in ('pg_catalog', 'information_schema')\n\
             order by table_schema, table_name, ordinal_position",
            &[],
        )?;
        let mut snapshot = SchemaSnapshot::new();
        let mut current: Option<TableDef> = None;
        for row in rows {
            let schema: String = row.get(0);
            let table: String = row.get(1);
            let id = TableId::new(&schema, &table);
            if current.as_ref().map(|t| &t.id) != Some(&id) {
                if let Some(done) = current.take() {
                    snapshot.add_table(done);
                }
                current = Some(TableDef {
                    id,
                    columns: Vec::new(),
                });
            }
            if let Some(current) = current.as_mut() {
                let name: String = row.get(2);
                let type_name: String = row.get(3);
                current.columns.push(ColumnDef::new(&name, &type_name));
            }
        }
        if let Some(done) = current {
            snapshot.add_table(done);
        }
        Ok(snapshot)
    }

    fn load_cache_meta(&mut self) -> Result<Vec<CacheMeta>, DbError> {
        let rows = self.client.query(
            "select name, for_table, definition, signature, level, columns, applied_at\n\
             from public.pg_denorm_cache order by name",
            &[],
        )?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let columns: serde_json::Value = row.get(5);
            let columns: Vec<String> = serde_json::from_value(columns)
                .map_err(|e| DbError::message(format!("corrupt cache metadata: {e}")))?;
            let level: i32 = row.get(4);
            out.push(CacheMeta {
                name: row.get(0),
                for_table: row.get(1),
                definition: row.get(2),
                signature: row.get(3),
                level: level as usize,
                columns,
                applied_at: row.get(6),
            });
        }
        Ok(out)
    }

    fn save_cache_meta(&mut self, meta: &CacheMeta) -> Result<(), DbError> {
        let columns = serde_json::to_value(&meta.columns)
            .map_err(|e| DbError::message(format!("cache metadata encoding: {e}")))?;
        let level = meta.level as i32;
        self.client.execute(
            "insert into public.pg_denorm_cache\n\
             (name, for_table, definition, signature, level, columns, applied_at)\n\
             values ($1, $2, $3, $4, $5, $6, $7)\n\
             on conflict (name) do update set\n\
             for_table = excluded.for_table, definition = excluded.definition,\n\
             signature = excluded.signature, level = excluded.level,\n\
             columns = excluded.columns, applied_at = excluded.applied_at",
            &[
                &meta.name,
                &meta.for_table,
                &meta.definition,
                &meta.signature,
                &level,
                &columns,
                &meta.applied_at,
            ],
        )?;
        Ok(())
    }

    fn delete_cache_meta(&mut self, cache_name: &str) -> Result<(), DbError> {
        self.client.execute(
            "delete from public.pg_denorm_cache where name = $1",
            &[&cache_name],
        )?;
        Ok(())
    }

    fn create_or_replace_function(&mut self, function: &DatabaseFunction) -> Result<(), DbError> {
        self.client.batch_execute(&function.to_sql())?;
        Ok(())
    }

    fn force_drop_function(&mut self, function: &DatabaseFunction) -> Result<(), DbError> {
        self.client.batch_execute(&function.drop_sql())?;
        Ok(())
    }

    fn create_trigger(&mut self, trigger: &DatabaseTrigger) -> Result<(), DbError> {
        self.client.batch_execute(&trigger.to_sql())?;
        Ok(())
    }

    fn force_drop_trigger(&mut self, trigger: &DatabaseTrigger) -> Result<(), DbError> {
        self.client.batch_execute(&trigger.drop_sql())?;
        Ok(())
    }

    fn create_column(&mut self, column: &CacheColumn) -> Result<(), DbError> {
        self.client.batch_execute(&column.add_sql())?;
        Ok(())
    }

    fn drop_column(&mut self, table: &TableId, column: &str) -> Result<(), DbError> {
        self.client.batch_execute(&format!(
            "alter table {table} drop column if exists {column}"
        ))?;
        Ok(())
    }

    fn create_index(&mut self, index: &CacheIndexArtifact) -> Result<(), DbError> {
        self.client.batch_execute(&index.to_sql())?;
        Ok(())
    }

    fn update_cache_batch(&mut self, sql: &str) -> Result<u64, DbError> {
        Ok(self.client.execute(sql, &[])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependent_objects_detection() {
        let err = DbError {
            code: Some("2BP01".to_string()),
            message: "cannot drop function".to_string(),
        };
        assert!(err.is_dependent_objects());
        assert!(!DbError::message("boom").is_dependent_objects());
    }

    #[test]
    fn test_display_includes_code() {
        let err = DbError {
            code: Some("42703".to_string()),
            message: "column does not exist".to_string(),
        };
        assert_eq!(err.to_string(), "column does not exist (42703)");
    }
}
