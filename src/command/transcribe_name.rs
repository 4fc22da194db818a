use crate::db;
use crate::Context;
use crate::Error;

/// Set the name transcripts use for you on this server.
#[poise::command(prefix_command, slash_command, rename = "set-transcribe-name", guild_only)]
pub async fn set_transcribe_name(
    ctx: Context<'_>,
    #[description = "The name shown on your transcript lines"] new_name: String,
) -> Result<(), Error> {
    let user_id = ctx.author().id.to_string();
    let guild_id = ctx
        .guild_id()
        .ok_or("This command must be used in a guild")?
        .to_string();

    db::set_transcribe_name(&ctx.data().db, &user_id, &guild_id, &new_name).await?;

    ctx.say(format!("Set transcription name to {new_name}!"))
        .await?;
    Ok(())
}

#[poise::command(prefix_command, slash_command, rename = "get-transcribe-name", guild_only)]
pub async fn get_transcribe_name(ctx: Context<'_>) -> Result<(), Error> {
    let user_id = ctx.author().id.to_string();
    let guild_id = ctx
        .guild_id()
        .ok_or("This command must be used in a guild")?
        .to_string();

    let user_setting = db::get_user_setting(&ctx.data().db, &user_id, &guild_id).await?;

    match user_setting.and_then(|s| s.transcribe_name) {
        Some(name) => {
            ctx.say(format!("Transcription name is {name}!")).await?;
        }
        None => {
            ctx.say("No transcription name set on this server.").await?;
        }
    }

    Ok(())
}
