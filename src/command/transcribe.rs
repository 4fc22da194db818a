use crate::transcribe::{
    ChannelSink, DbConfigSource, DbSpeakerNames, GatewayNames, SessionError, SessionWorker,
};
use crate::voice::VoiceFrameSource;
use crate::Context;
use crate::Error;
use songbird::CoreEvent;
use std::sync::Arc;
use tracing::{error, info};

/// Toggle real-time voice transcription for this guild.
///
/// Starting joins the caller's voice channel and publishes live,
/// per-speaker subtitle lines into the invoking text channel; invoking the
/// command again stops the session and leaves the channel.
#[poise::command(prefix_command, slash_command, rename = "transcribe", guild_only)]
pub async fn transcribe(ctx: Context<'_>) -> Result<(), Error> {
    let guild_id = ctx
        .guild_id()
        .ok_or("This command must be used in a guild")?;
    let guild_id_u64 = guild_id.get();

    let manager = songbird::get(ctx.serenity_context())
        .await
        .ok_or("Songbird voice client not initialized")?
        .clone();

    if ctx.data().registry.is_active(guild_id_u64) {
        ctx.data().registry.stop(guild_id_u64);
        if let Err(e) = manager.remove(guild_id).await {
            error!("Failed to leave voice channel: {:?}", e);
        }
        ctx.say("Stopped real-time transcription.").await?;
        return Ok(());
    }

    let voice_channel_id = {
        let cache = &ctx.serenity_context().cache;
        cache.guild(guild_id).and_then(|guild| {
            guild
                .voice_states
                .get(&ctx.author().id)
                .and_then(|vs| vs.channel_id)
        })
    };
    let Some(voice_channel_id) = voice_channel_id else {
        ctx.say("You need to be in a voice channel to start transcription.")
            .await?;
        return Ok(());
    };

    ctx.defer().await?;

    // Engine load failure is non-fatal: the session runs, buffers are
    // swept and discarded, and no text appears.
    let engine = ctx.data().engine().await;
    let engine_loaded = engine.is_some();

    let db = ctx.data().db.clone();
    let http = ctx.serenity_context().http.clone();
    let sink = Arc::new(ChannelSink::new(http.clone(), ctx.channel_id()));
    let names = Arc::new(DbSpeakerNames::new(
        db.clone(),
        guild_id_u64,
        Arc::new(GatewayNames::new(http, guild_id_u64)),
    ));
    let handle = SessionWorker::spawn(
        guild_id_u64,
        engine,
        sink,
        Arc::new(DbConfigSource::new(db)),
        names,
    );
    let sender = handle.sender();

    // Reserve the guild slot before touching the voice connection, so a
    // racing second start cannot move a live session's channel
    if let Err(SessionError::AlreadyActive) = ctx.data().registry.insert(handle) {
        ctx.say("Transcription is already active on this guild.")
            .await?;
        return Ok(());
    }

    let call = match manager.join(guild_id, voice_channel_id).await {
        Ok(call) => call,
        Err(e) => {
            ctx.data().registry.stop(guild_id_u64);
            error!("Failed to join voice channel: {:?}", e);
            ctx.say(format!("Failed to join voice channel: {:?}", e))
                .await?;
            return Ok(());
        }
    };

    info!(
        "Joined voice channel {} in guild {}",
        voice_channel_id, guild_id
    );

    let source = VoiceFrameSource::new(sender);
    {
        let mut call = call.lock().await;
        call.add_global_event(CoreEvent::SpeakingStateUpdate.into(), source.clone());
        call.add_global_event(CoreEvent::VoiceTick.into(), source.clone());
        call.add_global_event(CoreEvent::ClientDisconnect.into(), source);
    }

    if engine_loaded {
        ctx.say("🎧 Started real-time transcription in this channel.")
            .await?;
    } else {
        ctx.say(
            "🎧 Joined the voice channel, but the speech model failed to load - \
            no text will be produced. Check the logs.",
        )
        .await?;
    }
    Ok(())
}
