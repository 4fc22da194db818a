use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

use crate::transcribe::TranscribeConfig;

pub type DbPool = SqlitePool;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserSetting {
    pub user_id: String,
    pub guild_id: String,
    pub transcribe_name: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct TranscribeConfigRow {
    min_audio_seconds: f64,
    interval_ms: i64,
    chunk_s: i64,
}

pub async fn init_db(database_url: &str) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

pub async fn get_user_setting(
    pool: &DbPool,
    user_id: &str,
    guild_id: &str,
) -> Result<Option<UserSetting>, sqlx::Error> {
    let setting = sqlx::query_as::<_, UserSetting>(
        "SELECT * FROM user_settings WHERE user_id = ? AND guild_id = ?",
    )
    .bind(user_id)
    .bind(guild_id)
    .fetch_optional(pool)
    .await?;

    Ok(setting)
}

pub async fn set_transcribe_name(
    pool: &DbPool,
    user_id: &str,
    guild_id: &str,
    transcribe_name: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO user_settings (user_id, guild_id, transcribe_name, updated_at)
        VALUES (?, ?, ?, datetime('now'))
        ON CONFLICT(user_id, guild_id)
        DO UPDATE SET transcribe_name = excluded.transcribe_name, updated_at = datetime('now')
        "#,
    )
    .bind(user_id)
    .bind(guild_id)
    .bind(transcribe_name)
    .execute(pool)
    .await?;

    Ok(())
}

/// Per-guild transcription tunables; defaults when the guild has no row.
pub async fn get_transcribe_config(
    pool: &DbPool,
    guild_id: &str,
) -> Result<TranscribeConfig, sqlx::Error> {
    let row = sqlx::query_as::<_, TranscribeConfigRow>(
        "SELECT min_audio_seconds, interval_ms, chunk_s FROM transcribe_config WHERE guild_id = ?",
    )
    .bind(guild_id)
    .fetch_optional(pool)
    .await?;

    Ok(match row {
        Some(row) => TranscribeConfig {
            min_audio_seconds: row.min_audio_seconds,
            sweep_interval_ms: row.interval_ms.max(0) as u64,
            chunk_seconds: row.chunk_s.clamp(0, u32::MAX as i64) as u32,
        },
        None => TranscribeConfig::default(),
    })
}

pub async fn set_transcribe_config(
    pool: &DbPool,
    guild_id: &str,
    config: &TranscribeConfig,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO transcribe_config (guild_id, min_audio_seconds, interval_ms, chunk_s)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(guild_id)
        DO UPDATE SET
            min_audio_seconds = excluded.min_audio_seconds,
            interval_ms = excluded.interval_ms,
            chunk_s = excluded.chunk_s
        "#,
    )
    .bind(guild_id)
    .bind(config.min_audio_seconds)
    .bind(config.sweep_interval_ms as i64)
    .bind(config.chunk_seconds as i64)
    .execute(pool)
    .await?;

    Ok(())
}
