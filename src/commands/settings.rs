use poise::serenity_prelude as serenity;

use crate::bot::CommandContext;
use crate::calendar::calendar::Calendar;
use crate::calendar::manager::TimezoneOutcome;

use super::{authorized, respond, PERMISSION_DENIED, TIMEZONE_NOT_SET};

#[poise::command(
    slash_command,
    rename = "settings",
    guild_only,
    subcommands("view", "prefix", "defaultchannel", "timezone")
)]
pub async fn root(_: CommandContext<'_>) -> Result<(), anyhow::Error> {
    unreachable!();
}

async fn guild_calendar(ctx: CommandContext<'_>) -> Result<Option<Calendar>, anyhow::Error> {
    let Some(guild_id) = ctx.guild_id() else {
        respond(ctx, TIMEZONE_NOT_SET).await?;
        return Ok(None);
    };
    match ctx.data().manager.snapshot(guild_id).await {
        Some(calendar) => Ok(Some(calendar)),
        None => {
            respond(ctx, TIMEZONE_NOT_SET).await?;
            Ok(None)
        }
    }
}

fn format_zone(calendar: &Calendar) -> String {
    calendar
        .timezone
        .map(|tz| tz.to_string())
        .unwrap_or_else(|| "not set".to_string())
}

#[poise::command(slash_command)]
/// Show this guild's calendar settings
pub async fn view(ctx: CommandContext<'_>) -> Result<(), anyhow::Error> {
    let Some(calendar) = guild_calendar(ctx).await? else {
        return Ok(());
    };

    let channel = calendar
        .default_channel
        .map(|id| format!("<#{}>", id))
        .unwrap_or_else(|| "not set".to_string());

    respond(
        ctx,
        format!(
            "**Settings**\nprefix: `{}`\ndefaultchannel: {}\ntimezone: {}",
            calendar.prefix,
            channel,
            format_zone(&calendar),
        ),
    )
    .await
}

#[poise::command(slash_command)]
/// Show or change the command prefix
pub async fn prefix(
    ctx: CommandContext<'_>,
    #[description = "New prefix"] prefix: Option<String>,
) -> Result<(), anyhow::Error> {
    let Some(calendar) = guild_calendar(ctx).await? else {
        return Ok(());
    };

    let Some(prefix) = prefix else {
        if !authorized(ctx, &calendar, "prefix.show").await {
            return respond(ctx, PERMISSION_DENIED).await;
        }
        return respond(ctx, format!("Current prefix: `{}`", calendar.prefix)).await;
    };

    if !authorized(ctx, &calendar, "prefix.modify").await {
        return respond(ctx, PERMISSION_DENIED).await;
    }
    ctx.data()
        .manager
        .update_prefix(calendar.guild_id, prefix.clone())
        .await?;
    respond(ctx, format!("Prefix set to `{}`.", prefix)).await
}

#[poise::command(slash_command)]
/// Show or change the announcement channel
pub async fn defaultchannel(
    ctx: CommandContext<'_>,
    #[description = "New announcement channel"] channel: Option<serenity::GuildChannel>,
) -> Result<(), anyhow::Error> {
    let Some(calendar) = guild_calendar(ctx).await? else {
        return Ok(());
    };

    let Some(channel) = channel else {
        if !authorized(ctx, &calendar, "defaultchannel.show").await {
            return respond(ctx, PERMISSION_DENIED).await;
        }
        let current = calendar
            .default_channel
            .map(|id| format!("<#{}>", id))
            .unwrap_or_else(|| "not set".to_string());
        return respond(ctx, format!("Current default channel: {}", current)).await;
    };

    if !authorized(ctx, &calendar, "defaultchannel.modify").await {
        return respond(ctx, PERMISSION_DENIED).await;
    }
    ctx.data()
        .manager
        .update_default_channel(calendar.guild_id, channel.id)
        .await?;
    respond(
        ctx,
        format!("Updated default channel to <#{}>.", channel.id),
    )
    .await
}

#[poise::command(slash_command)]
/// Show or change the calendar timezone
pub async fn timezone(
    ctx: CommandContext<'_>,
    #[description = "New timezone, e.g. America/New_York"] timezone: Option<String>,
) -> Result<(), anyhow::Error> {
    let Some(calendar) = guild_calendar(ctx).await? else {
        return Ok(());
    };

    let Some(zone) = timezone else {
        if !authorized(ctx, &calendar, "timezone.show").await {
            return respond(ctx, PERMISSION_DENIED).await;
        }
        return respond(ctx, format!("Current timezone: {}", format_zone(&calendar))).await;
    };

    if !authorized(ctx, &calendar, "timezone.modify").await {
        return respond(ctx, PERMISSION_DENIED).await;
    }

    let outcome = ctx
        .data()
        .manager
        .update_timezone(calendar.guild_id, &zone)
        .await?;

    match outcome {
        TimezoneOutcome::UnknownZone => respond(ctx, "Timezone not found.").await,
        TimezoneOutcome::NotInitialized => respond(ctx, TIMEZONE_NOT_SET).await,
        TimezoneOutcome::RejectedPast => {
            respond(
                ctx,
                format!(
                    "Cannot update the timezone: an event would start or end \
                     in the past if it were changed to {}.",
                    zone
                ),
            )
            .await
        }
        TimezoneOutcome::Updated => respond(ctx, format!("Updated timezone to {}.", zone)).await,
    }
}
