use chrono::Utc;
use chrono_tz::Tz;

use crate::bot::CommandContext;
use crate::calendar::calendar::Calendar;
use crate::calendar::{CalendarError, Event, RepeatPatch};
use crate::parse;

use super::{authorized, respond, EVENT_NOT_FOUND, PERMISSION_DENIED, TIMEZONE_NOT_SET};

const ADD_USAGE: &str =
    "Usage: `/event add <name> --start <date> [--end <date>] [--desc <text>] [--repeat d|w|m]`";
const UPDATE_USAGE: &str = "Usage: `/event update <index> [<name>] [--start <date>] \
                            [--end <date>] [--desc <text>] [--repeat d|w|m|off]`";

#[poise::command(
    slash_command,
    rename = "event",
    guild_only,
    subcommands("add", "list", "delete", "update")
)]
pub async fn root(_: CommandContext<'_>) -> Result<(), anyhow::Error> {
    unreachable!();
}

/// Initialized calendar of the current guild, or `None` after replying
/// with the setup hint.
async fn initialized_calendar(
    ctx: CommandContext<'_>,
) -> Result<Option<(Calendar, Tz)>, anyhow::Error> {
    let Some(guild_id) = ctx.guild_id() else {
        respond(ctx, TIMEZONE_NOT_SET).await?;
        return Ok(None);
    };
    match ctx.data().manager.snapshot(guild_id).await {
        Some(calendar) => match calendar.timezone {
            Some(tz) => Ok(Some((calendar, tz))),
            None => {
                respond(ctx, TIMEZONE_NOT_SET).await?;
                Ok(None)
            }
        },
        None => {
            respond(ctx, TIMEZONE_NOT_SET).await?;
            Ok(None)
        }
    }
}

fn described(event: &Event) -> String {
    let mut line = format!(
        "**{}**, <t:{}> to <t:{}>",
        event.name,
        event.start.timestamp(),
        event.end.timestamp()
    );
    if let Some(repeat) = event.repeat {
        line.push_str(&format!(" (repeats {})", repeat.describe()));
    }
    line
}

#[poise::command(slash_command)]
/// Create an event
pub async fn add(
    ctx: CommandContext<'_>,
    #[description = "Event text: name --start <date> [--end <date>] [--desc ...] [--repeat d|w|m]"]
    text: String,
) -> Result<(), anyhow::Error> {
    let now = Utc::now();
    let Some((calendar, timezone)) = initialized_calendar(ctx).await? else {
        return Ok(());
    };
    if !authorized(ctx, &calendar, "event.create").await {
        return respond(ctx, PERMISSION_DENIED).await;
    }

    let draft = match parse::parse(&text, timezone, now) {
        Ok(draft) => draft,
        Err(err) => return respond(ctx, format!("{}\n{}", err, ADD_USAGE)).await,
    };

    let (Some(_), Some(start)) = (&draft.name, draft.start) else {
        return respond(ctx, format!("Could not read an event from that.\n{}", ADD_USAGE)).await;
    };
    if matches!(draft.repeat, Some(RepeatPatch::Off)) {
        return respond(ctx, ADD_USAGE).await;
    }
    if start < now {
        return respond(ctx, "Cannot create an event starting in the past.").await;
    }

    let event = ctx.data().manager.add_event(calendar.guild_id, draft).await?;
    respond(ctx, format!("New event created: {}", described(&event))).await
}

#[poise::command(slash_command)]
/// List this guild's events
pub async fn list(ctx: CommandContext<'_>) -> Result<(), anyhow::Error> {
    let Some((calendar, timezone)) = initialized_calendar(ctx).await? else {
        return Ok(());
    };
    if !authorized(ctx, &calendar, "event.list").await {
        return respond(ctx, PERMISSION_DENIED).await;
    }

    let now = Utc::now();
    let mut out = String::from("```css\n");

    if calendar.events.is_empty() {
        out.push_str("No events found!\n");
    } else {
        let mut header_written = false;
        for (i, event) in calendar.events.iter().enumerate() {
            if event.start > now && !header_written {
                out.push_str("\n[Upcoming Events]\n\n");
                header_written = true;
            } else if i == 0 && event.start <= now {
                out.push_str("[Active Events]\n\n");
            }

            out.push_str(&format!(
                "{} : {} /* {} to {} */\n",
                i + 1,
                event.name,
                event.start.with_timezone(&timezone).format("%Y-%m-%d %H:%M"),
                event.end.with_timezone(&timezone).format("%Y-%m-%d %H:%M"),
            ));
            if let Some(description) = &event.description {
                out.push_str(&format!("    # {}\n", description));
            }
            if let Some(repeat) = event.repeat {
                out.push_str(&format!("    # Repeat: {}\n", repeat.describe()));
            }
        }
    }
    out.push_str("```");

    ctx.say(out).await?;
    Ok(())
}

#[poise::command(slash_command)]
/// Delete an event by its list index
pub async fn delete(
    ctx: CommandContext<'_>,
    #[description = "Event number as shown by /event list"] index: u32,
) -> Result<(), anyhow::Error> {
    let Some((calendar, _)) = initialized_calendar(ctx).await? else {
        return Ok(());
    };
    if !authorized(ctx, &calendar, "event.delete").await {
        return respond(ctx, PERMISSION_DENIED).await;
    }
    if index == 0 {
        return respond(ctx, EVENT_NOT_FOUND).await;
    }

    match ctx
        .data()
        .manager
        .delete_event(calendar.guild_id, (index - 1) as usize)
        .await
    {
        Ok(event) => respond(ctx, format!("Event deleted: {}", described(&event))).await,
        Err(err) if is_not_found(&err) => respond(ctx, EVENT_NOT_FOUND).await,
        Err(err) => Err(err),
    }
}

#[poise::command(slash_command)]
/// Update an event by its list index
pub async fn update(
    ctx: CommandContext<'_>,
    #[description = "Event number as shown by /event list"] index: u32,
    #[description = "Changes: [name] [--start <date>] [--end <date>] [--desc ...] [--repeat d|w|m|off]"]
    text: String,
) -> Result<(), anyhow::Error> {
    let now = Utc::now();
    let Some((calendar, timezone)) = initialized_calendar(ctx).await? else {
        return Ok(());
    };
    if !authorized(ctx, &calendar, "event.update").await {
        return respond(ctx, PERMISSION_DENIED).await;
    }

    let draft = match parse::parse(&text, timezone, now) {
        Ok(draft) => draft,
        Err(err) => return respond(ctx, format!("{}\n{}", err, UPDATE_USAGE)).await,
    };
    if draft == crate::calendar::EventDraft::default() {
        return respond(ctx, UPDATE_USAGE).await;
    }

    let Some(position) = (index as usize).checked_sub(1) else {
        return respond(ctx, EVENT_NOT_FOUND).await;
    };
    let Some(existing) = calendar.events.get(position) else {
        return respond(ctx, EVENT_NOT_FOUND).await;
    };

    if let Some(start) = draft.start {
        if start < now {
            return respond(ctx, "Cannot move an event's start into the past.").await;
        }
        if existing.start <= now {
            return respond(ctx, "Cannot move the start of an event that is already active.")
                .await;
        }
    }

    match ctx
        .data()
        .manager
        .update_event(calendar.guild_id, position, &draft)
        .await
    {
        Ok(event) => respond(ctx, format!("Event updated: {}", described(&event))).await,
        Err(err) if is_not_found(&err) => respond(ctx, EVENT_NOT_FOUND).await,
        Err(err) => Err(err),
    }
}

fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<CalendarError>(), Some(CalendarError::NotFound))
}
