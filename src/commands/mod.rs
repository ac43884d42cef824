use poise::CreateReply;

use crate::bot::CommandContext;
use crate::calendar::calendar::Calendar;
use crate::calendar::manager::InitOutcome;

pub mod event;
pub mod perms;
pub mod settings;

pub(crate) const TIMEZONE_NOT_SET: &str =
    "This guild has no calendar yet. Run `/init <timezone>` first.";
pub(crate) const PERMISSION_DENIED: &str = "You are not allowed to run this command.";
pub(crate) const EVENT_NOT_FOUND: &str = "Event not found.";

/// Ephemeral reply shorthand; almost every command answer goes through
/// this.
pub(crate) async fn respond(
    ctx: CommandContext<'_>,
    content: impl Into<String>,
) -> Result<(), anyhow::Error> {
    ctx.send(CreateReply::default().ephemeral(true).content(content.into()))
        .await?;
    Ok(())
}

/// Resolves the caller against a calendar's denial lists. The guild owner
/// always passes.
pub(crate) async fn authorized(
    ctx: CommandContext<'_>,
    calendar: &Calendar,
    node: &str,
) -> bool {
    let user_id = ctx.author().id;
    let roles = ctx
        .author_member()
        .await
        .map(|member| member.roles.clone())
        .unwrap_or_default();
    let is_owner = ctx
        .guild()
        .map(|guild| guild.owner_id == user_id)
        .unwrap_or(false);

    calendar.check_perm(node, user_id, &roles, is_owner)
}

#[poise::command(slash_command, track_edits)]
/// Show the command overview
pub async fn help(
    ctx: CommandContext<'_>,
    #[description = "Command to get help for"] command: Option<String>,
) -> Result<(), anyhow::Error> {
    poise::builtins::help(
        ctx,
        command.as_deref(),
        poise::builtins::HelpConfiguration::default(),
    )
    .await?;
    Ok(())
}

#[poise::command(slash_command, guild_only)]
/// Set up this guild's calendar: timezone and default announcement channel
pub async fn init(
    ctx: CommandContext<'_>,
    #[description = "Calendar timezone, e.g. Europe/Paris"] timezone: String,
) -> Result<(), anyhow::Error> {
    let Some(guild_id) = ctx.guild_id() else {
        return respond(ctx, "This command only works in a guild.").await;
    };

    let outcome = ctx
        .data()
        .manager
        .init_calendar(guild_id, ctx.channel_id(), &timezone)
        .await?;

    match outcome {
        InitOutcome::AlreadyInitialized => {
            respond(ctx, "The calendar timezone is already set.").await
        }
        InitOutcome::UnknownZone => respond(ctx, "Timezone not found.").await,
        InitOutcome::Initialized => {
            respond(
                ctx,
                format!(
                    "Set calendar timezone to {} and default channel to <#{}>.",
                    timezone,
                    ctx.channel_id()
                ),
            )
            .await
        }
    }
}
