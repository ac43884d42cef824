use futures::{Stream, StreamExt};
use poise::serenity_prelude as serenity;

use crate::bot::CommandContext;
use crate::calendar::calendar::{Calendar, NODES};
use crate::calendar::manager::PermTarget;

use super::{authorized, respond, PERMISSION_DENIED, TIMEZONE_NOT_SET};

async fn autocomplete_node<'a>(
    _ctx: CommandContext<'_>,
    partial: &'a str,
) -> impl Stream<Item = String> + 'a {
    futures::stream::iter(NODES)
        .filter(move |name| futures::future::ready(name.starts_with(partial)))
        .map(|name| name.to_string())
}

#[derive(Debug, Clone, Copy, poise::ChoiceParameter)]
pub enum PermAction {
    #[name = "allow"]
    Allow,
    #[name = "deny"]
    Deny,
}

#[poise::command(
    slash_command,
    rename = "perms",
    guild_only,
    subcommands("modify", "nodes", "show")
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

#[poise::command(slash_command)]
/// Allow or deny a permission node for a role or a user
pub async fn modify(
    ctx: CommandContext<'_>,
    #[description = "allow or deny"] action: PermAction,
    #[description = "Permission node, see /perms nodes"]
    #[autocomplete = "autocomplete_node"]
    node: String,
    #[description = "Role to modify"] role: Option<serenity::Role>,
    #[description = "User to modify"] user: Option<serenity::User>,
) -> Result<(), anyhow::Error> {
    let Some(calendar) = guild_calendar(ctx).await? else {
        return Ok(());
    };
    if !authorized(ctx, &calendar, "perms.modify").await {
        return respond(ctx, PERMISSION_DENIED).await;
    }
    if !NODES.contains(&node.as_str()) {
        return respond(ctx, "Permission node not found, see `/perms nodes`.").await;
    }

    let target = match (role, user) {
        (Some(role), None) => PermTarget::Role(role.id),
        (None, Some(user)) => PermTarget::User(user.id),
        _ => {
            return respond(ctx, "Name exactly one role or one user.").await;
        }
    };

    let deny = matches!(action, PermAction::Deny);
    ctx.data()
        .manager
        .set_perm(calendar.guild_id, &node, target, deny)
        .await?;

    let verb = if deny { "Denied" } else { "Allowed" };
    let subject = match target {
        PermTarget::Role(id) => format!("<@&{}>", id),
        PermTarget::User(id) => format!("<@{}>", id),
    };
    respond(ctx, format!("{} `{}` for {}.", verb, node, subject)).await
}

#[poise::command(slash_command)]
/// List every permission node
pub async fn nodes(ctx: CommandContext<'_>) -> Result<(), anyhow::Error> {
    let Some(calendar) = guild_calendar(ctx).await? else {
        return Ok(());
    };
    if !authorized(ctx, &calendar, "perms.nodes").await {
        return respond(ctx, PERMISSION_DENIED).await;
    }

    let mut out = String::from("```css\n");
    for node in NODES {
        out.push_str(node);
        out.push('\n');
    }
    out.push_str("```");
    respond(ctx, out).await
}

#[poise::command(slash_command)]
/// Show who is denied on a permission node
pub async fn show(
    ctx: CommandContext<'_>,
    #[description = "Permission node, see /perms nodes"]
    #[autocomplete = "autocomplete_node"]
    node: String,
) -> Result<(), anyhow::Error> {
    let Some(calendar) = guild_calendar(ctx).await? else {
        return Ok(());
    };
    if !authorized(ctx, &calendar, "perms.show").await {
        return respond(ctx, PERMISSION_DENIED).await;
    }
    if !NODES.contains(&node.as_str()) {
        return respond(ctx, "Permission node not found, see `/perms nodes`.").await;
    }

    let entry = calendar.permissions.iter().find(|perm| perm.node == node);

    let roles = entry
        .filter(|perm| !perm.denied_roles.is_empty())
        .map(|perm| {
            perm.denied_roles
                .iter()
                .map(|id| format!("<@&{}>", id))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_else(|| "None".to_string());
    let users = entry
        .filter(|perm| !perm.denied_users.is_empty())
        .map(|perm| {
            perm.denied_users
                .iter()
                .map(|id| format!("<@{}>", id))
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_else(|| "None".to_string());

    respond(
        ctx,
        format!(
            "**Node:** `{}`\n**Denied roles:** {}\n**Denied users:** {}",
            node, roles, users
        ),
    )
    .await
}
