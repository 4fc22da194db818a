use crate::db;
use crate::transcribe::config::{
    CHUNK_SECONDS_RANGE, MIN_AUDIO_SECONDS_RANGE, SWEEP_INTERVAL_MS_RANGE,
};
use crate::Context;
use crate::Error;

/// View or change the per-guild transcription tunables.
///
/// Changes apply to a running session at its next sweep tick.
#[poise::command(
    prefix_command,
    slash_command,
    rename = "transcribe-config",
    subcommands("view", "set"),
    guild_only
)]
pub async fn transcribe_config(ctx: Context<'_>) -> Result<(), Error> {
    ctx.say("Use `/transcribe-config view` or `/transcribe-config set`.")
        .await?;
    Ok(())
}

#[poise::command(prefix_command, slash_command, guild_only)]
pub async fn view(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx
        .guild_id()
        .ok_or("This command must be used in a guild")?
        .to_string();

    let cfg = db::get_transcribe_config(&ctx.data().db, &guild_id).await?;
    ctx.say(format!(
        "Transcribe settings:\n\
        min_audio_seconds={}\n\
        interval_ms={}\n\
        chunk_seconds={}",
        cfg.min_audio_seconds, cfg.sweep_interval_ms, cfg.chunk_seconds
    ))
    .await?;
    Ok(())
}

#[poise::command(prefix_command, slash_command, guild_only)]
pub async fn set(
    ctx: Context<'_>,
    #[description = "Minimum seconds of audio before transcribing (0.1-20)"]
    min_audio_seconds: Option<f64>,
    #[description = "How often buffers are checked, in milliseconds (200-60000)"]
    interval_ms: Option<i64>,
    #[description = "Chunk length hint fed to the recognizer, in seconds (1-30)"]
    chunk_seconds: Option<i64>,
) -> Result<(), Error> {
    let guild_id = ctx
        .guild_id()
        .ok_or("This command must be used in a guild")?
        .to_string();

    if let Some(min) = min_audio_seconds {
        if min < MIN_AUDIO_SECONDS_RANGE.0 || min > MIN_AUDIO_SECONDS_RANGE.1 {
            ctx.say(format!(
                "min_audio_seconds must be between {} and {} seconds",
                MIN_AUDIO_SECONDS_RANGE.0, MIN_AUDIO_SECONDS_RANGE.1
            ))
            .await?;
            return Ok(());
        }
    }
    if let Some(interval) = interval_ms {
        if interval < SWEEP_INTERVAL_MS_RANGE.0 as i64 || interval > SWEEP_INTERVAL_MS_RANGE.1 as i64
        {
            ctx.say(format!(
                "interval_ms must be between {} and {} ms",
                SWEEP_INTERVAL_MS_RANGE.0, SWEEP_INTERVAL_MS_RANGE.1
            ))
            .await?;
            return Ok(());
        }
    }
    if let Some(chunk) = chunk_seconds {
        if chunk < CHUNK_SECONDS_RANGE.0 as i64 || chunk > CHUNK_SECONDS_RANGE.1 as i64 {
            ctx.say(format!(
                "chunk_seconds must be between {} and {} seconds",
                CHUNK_SECONDS_RANGE.0, CHUNK_SECONDS_RANGE.1
            ))
            .await?;
            return Ok(());
        }
    }

    let mut cfg = db::get_transcribe_config(&ctx.data().db, &guild_id).await?;
    if let Some(min) = min_audio_seconds {
        cfg.min_audio_seconds = min;
    }
    if let Some(interval) = interval_ms {
        cfg.sweep_interval_ms = interval as u64;
    }
    if let Some(chunk) = chunk_seconds {
        cfg.chunk_seconds = chunk as u32;
    }
    db::set_transcribe_config(&ctx.data().db, &guild_id, &cfg).await?;

    ctx.say(format!(
        "Updated transcribe settings for this server: \
        min_audio_seconds={}, interval_ms={}, chunk_seconds={}",
        cfg.min_audio_seconds, cfg.sweep_interval_ms, cfg.chunk_seconds
    ))
    .await?;
    Ok(())
}
