use std::{path::PathBuf, str::FromStr};

use sqlx::{
    Pool, Sqlite, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};

pub mod models;

#[derive(Clone)]
pub struct DBService {
    pub pool: Pool<Sqlite>,
}

impl DBService {
    pub async fn new(database_url: &str) -> Result<DBService, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(10).connect_with(options).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(DBService { pool })
    }

    /// `sqlite://<data_dir>/gitfix.sqlite`, used when `DATABASE_URL` is unset.
    pub fn default_database_url(data_dir: &PathBuf) -> String {
        format!("sqlite://{}", data_dir.join("gitfix.sqlite").to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrates_on_fresh_database() {
        let dir = tempfile::tempdir().unwrap();
        let url = DBService::default_database_url(&dir.path().to_path_buf());
        let db = DBService::new(&url).await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }
}
