use anyhow::Context as _;
use dotenvy::dotenv;
use poise::serenity_prelude as serenity;
use serenity::{Client, GatewayIntents};
use songbird::{driver::DecodeMode, Config, SerenityInit};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{error, info};

mod command;
mod db;
mod transcribe;
mod voice;

use command::{get_transcribe_name, set_transcribe_name, transcribe_config};
use db::DbPool;
use transcribe::{SessionRegistry, SpeechRecognizer, WhisperEngine, WhisperModel};

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;

pub struct Data {
    pub db: DbPool,
    pub registry: Arc<SessionRegistry>,
    engine: OnceCell<Option<Arc<WhisperEngine>>>,
}

impl Data {
    pub fn new(db: DbPool) -> Self {
        Self {
            db,
            registry: Arc::new(SessionRegistry::new()),
            engine: OnceCell::new(),
        }
    }

    /// Speech engine, loaded once on first use. A load failure is logged
    /// here and surfaces as `None` to every session; sessions still start.
    pub async fn engine(&self) -> Option<Arc<dyn SpeechRecognizer>> {
        self.engine
            .get_or_init(|| async {
                let model = std::env::var("WHISPER_MODEL")
                    .ok()
                    .and_then(|s| s.parse::<WhisperModel>().ok())
                    .unwrap_or(WhisperModel::Tiny);

                match tokio::task::spawn_blocking(move || WhisperEngine::load(model)).await {
                    Ok(Ok(engine)) => Some(Arc::new(engine)),
                    Ok(Err(e)) => {
                        error!("Failed to load Whisper model: {}", e);
                        None
                    }
                    Err(e) => {
                        error!("Whisper load task panicked: {}", e);
                        None
                    }
                }
            })
            .await
            .clone()
            .map(|engine| engine as Arc<dyn SpeechRecognizer>)
    }
}

async fn on_error(error: poise::FrameworkError<'_, Data, Error>) {
    match error {
        poise::FrameworkError::Setup { error, .. } => panic!("Failed to start bot: {:?}", error),
        poise::FrameworkError::Command { error, ctx, .. } => {
            error!("Error in command `{}`: {:?}", ctx.command().name, error);
        }
        error => {
            if let Err(e) = poise::builtins::on_error(error).await {
                error!("Error while handling error: {}", e);
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    let database_url =
        std::env::var("DATABASE_URL").context("Set DATABASE_URL environment variable")?;
    let db_pool = db::init_db(&database_url)
        .await
        .context("Failed to initialize database")?;
    info!("Database initialized successfully");

    let options = poise::FrameworkOptions {
        commands: vec![
            command::transcribe(),
            transcribe_config(),
            set_transcribe_name(),
            get_transcribe_name(),
        ],
        prefix_options: poise::PrefixFrameworkOptions {
            prefix: Some("/".into()),
            ..Default::default()
        },
        on_error: |error| Box::pin(on_error(error)),
        ..Default::default()
    };

    let token = std::env::var("DISCORD_TOKEN").context("Set DISCORD_TOKEN environment variable")?;

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_VOICE_STATES;

    let framework = poise::Framework::builder()
        .setup(move |ctx, ready, framework| {
            let db = db_pool.clone();
            Box::pin(async move {
                info!("Logged in as {}", ready.user.name);
                poise::builtins::register_globally(ctx, &framework.options().commands).await?;

                if let Ok(guild_id_str) = std::env::var("GUILD_ID") {
                    if let Ok(guild_id) = guild_id_str.parse::<u64>() {
                        let guild_id = serenity::GuildId::new(guild_id);
                        poise::builtins::register_in_guild(
                            ctx,
                            &framework.options().commands,
                            guild_id,
                        )
                        .await?;
                        info!("Registered commands for guild {}", guild_id);
                    } else {
                        error!("Invalid GUILD_ID format: {}", guild_id_str);
                    }
                }

                Ok(Data::new(db))
            })
        })
        .options(options)
        .build();

    // Decoded PCM from the driver; the transcription pipeline consumes
    // 48 kHz stereo s16 directly from voice ticks.
    let songbird_config = Config::default().decode_mode(DecodeMode::Decode);

    let mut client = Client::builder(token, intents)
        .framework(framework)
        .register_songbird_from_config(songbird_config)
        .await?;

    client.start().await?;
    Ok(())
}
