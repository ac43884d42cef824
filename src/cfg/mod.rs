use serde::Deserialize;

#[derive(Deserialize, Debug, Clone, Default)]
/// Configuration regarding the discord bot configuration
/// this includes the token of the discord bot.
pub struct DiscordConfig {
    pub token: String,
}

#[derive(Deserialize, Debug, Clone)]
/// Tuning of the event scheduler and of the reconciliation pass.
/// Check each field for the documentation and usages.
pub struct SchedulerConfig {
    /// How far ahead of its start/end instant an event gets a resident
    /// timer. Events further out are picked up by a later reconciliation
    /// pass. Humantime syntax.
    #[serde(default = "default_lookahead")]
    pub lookahead: String,
    /// Specifies the time between reconciliation passes.
    /// This uses the cron syntax.
    #[serde(default = "default_reconcile")]
    pub reconcile: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lookahead: default_lookahead(),
            reconcile: default_reconcile(),
        }
    }
}

fn default_lookahead() -> String {
    "2h".to_string()
}

fn default_reconcile() -> String {
    // hourly, on the hour
    "0 * * * *".to_string()
}

#[derive(Deserialize, Debug, Clone)]
/// Tuning of the per-guild mutation lease.
/// All fields use the humantime syntax.
pub struct LockConfig {
    /// Pause between two claim attempts.
    #[serde(default = "default_lock_delay")]
    pub delay: String,
    /// Wall-clock budget for acquiring a lease before the operation is
    /// abandoned.
    #[serde(default = "default_lock_timeout")]
    pub timeout: String,
    /// Lifetime of a granted lease. An expired lease can be claimed by
    /// another task even if the holder never released it.
    #[serde(default = "default_lock_expiry")]
    pub expiry: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            delay: default_lock_delay(),
            timeout: default_lock_timeout(),
            expiry: default_lock_expiry(),
        }
    }
}

fn default_lock_delay() -> String {
    "50ms".to_string()
}

fn default_lock_timeout() -> String {
    "5s".to_string()
}

fn default_lock_expiry() -> String {
    "30s".to_string()
}

#[derive(Deserialize, Debug, Clone, Default)]
/// Specifies the configuration for the database.
pub struct StorageConfig {
    /// Relative or absolute path to the database file.
    /// this file is versionned and need to be saved on a real disk.
    pub path: String,
}

#[derive(Deserialize, Debug, Clone)]
/// Miscellaneous bot behaviour.
pub struct BotConfig {
    /// Prefix given to freshly registered guilds. Each guild can change
    /// its own afterwards.
    #[serde(default = "default_prefix")]
    pub default_prefix: String,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            default_prefix: default_prefix(),
        }
    }
}

fn default_prefix() -> String {
    "+".to_string()
}

#[derive(Deserialize, Debug, Clone, Default)]
/// Main configuration structure
/// This does not have any particular meaning; It just contains
/// all the configuration blocks.
pub struct Config {
    pub discord: DiscordConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub lock: LockConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub bot: BotConfig,
}
