use crate::calendar::manager::Manager;
use crate::calendar::reconciler_task;
use crate::calendar::scheduler::Notifier;
use crate::{cfg::Config, commands};
use anyhow::Context;
use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use log::error;
use poise::serenity_prelude::{self as serenity, ChannelId, ClientBuilder, GatewayIntents};
use poise::CreateReply;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::Receiver;
use tokio::{signal, sync::broadcast::Sender};

pub type CommandContext<'a> = poise::Context<'a, Arc<Data>, anyhow::Error>;

// User data, which is stored and accessible in all command invocations
pub struct Data {
    pub config: Arc<Config>,
    pub manager: Arc<Manager>,
}

pub struct Bot {
    pub data: Arc<Data>,
    pub shutdown: Receiver<()>,
    shutdown_send: Sender<()>,
}

/// Announcement capability of the scheduler, backed by the discord http
/// client.
struct DiscordNotifier {
    http: Arc<serenity::Http>,
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn send_message(&self, channel: ChannelId, content: String) -> Result<(), anyhow::Error> {
        channel
            .say(self.http.as_ref(), content)
            .await
            .context("failed to send a message")?;
        Ok(())
    }
}

/// Sends a message through `shutdown_send` when a stop signal is detected.
/// Used to start the bot stop sequence.
async fn wait_for_stop_signal(bot: Arc<Bot>) -> Result<(), anyhow::Error> {
    let mut shutdown = bot.shutdown.resubscribe();
    tokio::select! {
        result = signal::ctrl_c() => {
            match result {
                Ok(()) => {
                    bot.shutdown_send
                        .send(())
                        .context("failed to send a shutdown signal")?;
                    Ok(())
                }
                Err(err) => Err(anyhow::anyhow!(err)),
            }
        },
        _ = shutdown.recv() => { Ok(()) }
    }
}

async fn on_error(error: poise::FrameworkError<'_, Arc<Data>, anyhow::Error>) {
    match error {
        poise::FrameworkError::Setup { error, .. } => panic!("Failed to start bot: {:?}", error),
        poise::FrameworkError::Command { error, ctx, .. } => {
            let f = CreateReply::default()
                .ephemeral(true)
                .content(format!("{:?}", error));
            std::mem::drop(ctx.send(f).await);
            error!("Error in command `{}`: {:?}", ctx.command().name, error);
        }
        error => {
            if let Err(e) = poise::builtins::on_error(error).await {
                error!("Error while handling error: {}", e);
            }
        }
    }
}

/// Keeps the stored calendars in step with the guilds discord reports:
/// joining a guild registers a calendar, a removal drops it along with its
/// timers, and departed members or deleted roles disappear from the
/// permission entries.
async fn platform_event(
    _ctx: &serenity::Context,
    event: &serenity::FullEvent,
    _framework: poise::FrameworkContext<'_, Arc<Data>, anyhow::Error>,
    data: &Arc<Data>,
) -> Result<(), anyhow::Error> {
    match event {
        serenity::FullEvent::GuildCreate { guild, .. } => {
            data.manager.ensure_calendar(guild.id).await?;
        }
        serenity::FullEvent::GuildDelete { incomplete, .. } => {
            // unavailable means an outage on discord's side, not a removal
            if !incomplete.unavailable {
                data.manager.remove_guild(incomplete.id).await?;
            }
        }
        serenity::FullEvent::GuildMemberRemoval { guild_id, user, .. } => {
            data.manager.forget_user(*guild_id, user.id).await?;
        }
        serenity::FullEvent::GuildRoleDelete {
            guild_id,
            removed_role_id,
            ..
        } => {
            data.manager.forget_role(*guild_id, *removed_role_id).await?;
        }
        _ => {}
    }
    Ok(())
}

impl Bot {
    pub async fn new(config: Arc<Config>) -> Result<Arc<Self>, anyhow::Error> {
        // Theses signals are used to stop the many tasks trigered.
        // this is called by the task listening for a stop signal.
        let (shutdown_send, shutdown) = tokio::sync::broadcast::channel(1);

        let http = Arc::new(serenity::Http::new(&config.discord.token));
        let manager = Arc::new(Manager::new(
            config.clone(),
            Arc::new(DiscordNotifier { http }),
        )?);

        let data = Arc::new(Data {
            config: config.clone(),
            manager,
        });

        Ok(Arc::new(Self {
            data,
            shutdown,
            shutdown_send,
        }))
    }

    pub async fn start(self: Arc<Self>) -> Result<(), anyhow::Error> {
        let mut shutdown = self.shutdown.resubscribe();
        let mut tasks = FuturesUnordered::new();

        let options = poise::FrameworkOptions {
            commands: vec![
                commands::help(),
                commands::init(),
                commands::event::root(),
                commands::settings::root(),
                commands::perms::root(),
            ],
            prefix_options: poise::PrefixFrameworkOptions {
                prefix: None,
                dynamic_prefix: Some(|ctx| {
                    Box::pin(async move {
                        let Some(guild_id) = ctx.guild_id else {
                            return Ok(None);
                        };
                        Ok(ctx
                            .data
                            .manager
                            .snapshot(guild_id)
                            .await
                            .map(|calendar| calendar.prefix))
                    })
                }),
                edit_tracker: Some(Arc::new(poise::EditTracker::for_timespan(
                    Duration::from_secs(3600),
                ))),
                mention_as_prefix: true,
                ..Default::default()
            },
            event_handler: |ctx, event, framework, data| {
                Box::pin(platform_event(ctx, event, framework, data))
            },
            on_error: |error| Box::pin(on_error(error)),
            ..Default::default()
        };
        let data = self.data.clone();
        let framework = poise::Framework::builder()
            .options(options)
            .setup(move |ctx, _ready, framework| {
                Box::pin(async move {
                    poise::builtins::register_globally(ctx, &framework.options().commands).await?;
                    Ok(data)
                })
            })
            .build();
        let client = ClientBuilder::new(
            self.data.config.discord.token.clone(),
            GatewayIntents::non_privileged(),
        )
        .framework(framework);

        let mut client = client.await.context("failed to create the client")?;

        tasks.push(tokio::spawn(async move {
            // wait until the bot terminates or a shutdown signal is received.
            tokio::select! {
                result = client.start_autosharded() => {
                    if let Err(err) = result {
                        error!("Client error: {}", err);
                    }
                },
                _ = shutdown.recv() => {
                    // shutdown the bot properly
                    client.shard_manager.shutdown_all().await;
                }
            };
        }));
        let self_clone = self.clone();
        tasks.push(tokio::spawn(async {
            if let Err(err) = reconciler_task(self_clone).await {
                error!("Reconciler error: {:?}", err);
            }
        }));
        let self_clone = self.clone();
        tasks.push(tokio::spawn(async {
            let _ = wait_for_stop_signal(self_clone).await;
        }));

        // wait for a task to finish.
        let task = tasks
            .next()
            .await
            .context("no tasks started, illegal state")?
            .context("failed to join task");

        // when a task is finished, we must terminate all the others,
        // hence we send a signal talling all tasks to stop processing
        // and return.
        self.shutdown_send.send(())?;

        while let Some(operation) = tasks.next().await {
            operation.context("failed to join task")?;
        }

        task?;
        Ok(())
    }
}
