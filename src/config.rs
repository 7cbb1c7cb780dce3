use std::{
    collections::HashMap,
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::rank::StyleRank;

const APP_DIR: &str = "arena-rewards";
/// Upper bound for any single configured reward, in tokens.
const MAX_REWARD_TOKENS: Decimal = Decimal::from_parts(1_000_000, 0, 0, false, 0);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StyleConfig {
    pub kill_points: f64,
    pub variety_bonus: f64,
    pub meter_max: f64,
    pub idle_secs: f64,
    pub decay_per_sec: f64,
}

impl Default for StyleConfig {
    fn default() -> Self {
        Self {
            kill_points: 100.0,
            variety_bonus: 0.5,
            meter_max: 3000.0,
            idle_secs: 5.0,
            decay_per_sec: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComboConfig {
    /// Allowed seconds from chain start for the kill after the n-th one.
    /// The last entry applies to every longer chain.
    pub windows_secs: Vec<f64>,
}

impl Default for ComboConfig {
    fn default() -> Self {
        Self {
            windows_secs: vec![3.0, 4.0, 5.0, 6.0],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreakMilestone {
    pub kills: u32,
    pub name: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComboAmounts {
    pub double: Decimal,
    pub triple: Decimal,
    pub ultra: Decimal,
    pub godlike: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    pub kill: Decimal,
    pub match_win: Decimal,
    pub first_blood: Decimal,
    pub headshot: Decimal,
    pub midair: Decimal,
    pub melee: Decimal,
    pub boss_kill: Decimal,
    pub boss_names: Vec<String>,
    pub revenge: Decimal,
    pub domination: Decimal,
    pub domination_kills: u32,
    pub longshot: Decimal,
    pub longshot_distance: f32,
    pub streak_milestones: Vec<StreakMilestone>,
    pub combo_fractions: ComboAmounts,
    pub combo_bonus_per_kill: Decimal,
    pub custom_bonus_cap: Decimal,
}

impl Default for ComboAmounts {
    fn default() -> Self {
        Self {
            double: Decimal::new(10, 2),
            triple: Decimal::new(25, 2),
            ultra: Decimal::new(50, 2),
            godlike: Decimal::ONE,
        }
    }
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            kill: Decimal::new(1, 3),
            match_win: Decimal::new(1, 2),
            first_blood: Decimal::new(5, 3),
            headshot: Decimal::new(5, 4),
            midair: Decimal::new(2, 3),
            melee: Decimal::new(1, 3),
            boss_kill: Decimal::new(3, 3),
            boss_names: vec!["Boris".to_owned(), "Sophia".to_owned()],
            revenge: Decimal::new(1, 3),
            domination: Decimal::new(3, 3),
            domination_kills: 4,
            longshot: Decimal::new(1, 3),
            longshot_distance: 1500.0,
            streak_milestones: vec![
                milestone(5, "KILLING SPREE", Decimal::new(5, 3)),
                milestone(10, "RAMPAGE", Decimal::new(1, 2)),
                milestone(15, "DOMINATING", Decimal::new(15, 3)),
                milestone(20, "UNSTOPPABLE", Decimal::new(2, 2)),
                milestone(25, "GODLIKE", Decimal::new(25, 3)),
            ],
            combo_fractions: ComboAmounts::default(),
            combo_bonus_per_kill: Decimal::new(1, 3),
            custom_bonus_cap: Decimal::ONE,
        }
    }
}

impl RewardConfig {
    /// Every configured token amount, named as in the config file.
    fn amounts(&self) -> Vec<(String, Decimal)> {
        let fixed = [
            ("kill", self.kill),
            ("match_win", self.match_win),
            ("first_blood", self.first_blood),
            ("headshot", self.headshot),
            ("midair", self.midair),
            ("melee", self.melee),
            ("boss_kill", self.boss_kill),
            ("revenge", self.revenge),
            ("domination", self.domination),
            ("longshot", self.longshot),
            ("combo_bonus_per_kill", self.combo_bonus_per_kill),
            ("custom_bonus_cap", self.custom_bonus_cap),
            ("combo_fractions.double", self.combo_fractions.double),
            ("combo_fractions.triple", self.combo_fractions.triple),
            ("combo_fractions.ultra", self.combo_fractions.ultra),
            ("combo_fractions.godlike", self.combo_fractions.godlike),
        ];
        let mut out: Vec<(String, Decimal)> = fixed
            .into_iter()
            .map(|(name, value)| (name.to_owned(), value))
            .collect();
        out.extend(
            self.streak_milestones
                .iter()
                .map(|m| (format!("streak_milestones[{}]", m.kills), m.amount)),
        );
        out
    }
}

fn milestone(kills: u32, name: &str, amount: Decimal) -> StreakMilestone {
    StreakMilestone {
        kills,
        name: name.to_owned(),
        amount,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub url: Option<String>,
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub queue_len: usize,
    pub grace_ms: u64,
    pub min_rank: StyleRank,
    pub footer: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: 2_000,
            max_attempts: 3,
            backoff_ms: 250,
            queue_len: 64,
            grace_ms: 2_000,
            min_rank: StyleRank::S,
            footer: "RustChain Arena".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub ledger_path: Option<String>,
    pub log_path: Option<String>,
    pub log_from_start: bool,
    pub log_poll_ms: u64,
    pub source_ws: Option<String>,
    pub http_enabled: bool,
    pub http_bind: String,
    pub player_idle_evict_secs: u64,
    pub wallets: HashMap<String, String>,
    pub style: StyleConfig,
    pub combo: ComboConfig,
    pub rewards: RewardConfig,
    pub webhook: WebhookConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            ledger_path: None,
            log_path: None,
            log_from_start: false,
            log_poll_ms: 100,
            source_ws: None,
            http_enabled: true,
            http_bind: "127.0.0.1:38480".to_owned(),
            player_idle_evict_secs: 600,
            wallets: HashMap::new(),
            style: StyleConfig::default(),
            combo: ComboConfig::default(),
            rewards: RewardConfig::default(),
            webhook: WebhookConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn load(path_override: Option<&Path>) -> Result<(Self, PathBuf)> {
        let (mut config, path) = match path_override {
            Some(path) => (Self::load_from(path)?, path.to_path_buf()),
            None => Self::load_or_create()?,
        };
        let dotenv = DotenvValues::discover();
        for applied in config.apply_env_overrides(&dotenv) {
            info!(
                key = applied.key,
                origin = applied.origin.as_str(),
                dotenv = ?dotenv.source,
                "config value overridden"
            );
        }
        config.validate()?;
        Ok((config, path))
    }

    pub fn load_or_create() -> Result<(Self, PathBuf)> {
        let config_dir = app_config_dir()?;
        let config_path = config_dir.join("config.json");
        if !config_path.exists() {
            let default = Self::default();
            default.save(&config_path)?;
            info!(path = %config_path.display(), "wrote default config");
            return Ok((default, config_path));
        }
        Ok((Self::load_from(&config_path)?, config_path))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        serde_json::from_str::<Self>(&text)
            .with_context(|| format!("invalid json in {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let payload = serde_json::to_string_pretty(self).context("failed serializing config")?;
        fs::write(path, payload).with_context(|| format!("failed writing {}", path.display()))?;
        Ok(())
    }

    /// Applies `DISCORD_WEBHOOK`, `ARENA_LOG_PATH` and `ARENA_LEDGER_PATH`
    /// and returns the keys that changed something. Values are never logged.
    pub fn apply_env_overrides(&mut self, dotenv: &DotenvValues) -> Vec<AppliedOverride> {
        let targets: [(&'static str, &mut Option<String>); 3] = [
            ("DISCORD_WEBHOOK", &mut self.webhook.url),
            ("ARENA_LOG_PATH", &mut self.log_path),
            ("ARENA_LEDGER_PATH", &mut self.ledger_path),
        ];
        let mut applied = Vec::new();
        for (key, slot) in targets {
            let Some((value, origin)) = dotenv.resolve(key) else {
                continue;
            };
            if slot.as_deref() != Some(value.as_str()) {
                *slot = Some(value);
                applied.push(AppliedOverride { key, origin });
            }
        }
        applied
    }

    pub fn validate(&self) -> Result<()> {
        if self.http_enabled && self.http_bind.trim().parse::<SocketAddr>().is_err() {
            bail!("invalid http_bind: {}", self.http_bind);
        }
        let style = &self.style;
        if !(style.kill_points > 0.0) || !(style.meter_max >= style.kill_points) {
            bail!("style.kill_points must be positive and not exceed style.meter_max");
        }
        if !(style.decay_per_sec > 0.0) || !(style.idle_secs >= 0.0) {
            bail!("style.decay_per_sec must be positive and style.idle_secs non-negative");
        }
        if !(style.variety_bonus >= 0.0) {
            bail!("style.variety_bonus must be non-negative");
        }
        let windows = &self.combo.windows_secs;
        if windows.is_empty() || windows.iter().any(|value| !(*value > 0.0)) {
            bail!("combo.windows_secs must be a non-empty list of positive seconds");
        }
        if windows.windows(2).any(|pair| pair[1] < pair[0]) {
            bail!("combo.windows_secs must be non-decreasing (measured from chain start)");
        }
        if self.webhook.max_attempts == 0 || self.webhook.max_attempts > 10 {
            bail!("webhook.max_attempts must be between 1 and 10");
        }
        if self.webhook.queue_len == 0 {
            bail!("webhook.queue_len must be at least 1");
        }
        if self.rewards.domination_kills < 2 {
            bail!("rewards.domination_kills must be at least 2");
        }
        for (name, value) in self.rewards.amounts() {
            if value < Decimal::ZERO || value > MAX_REWARD_TOKENS {
                bail!("rewards.{name} must be between 0 and {MAX_REWARD_TOKENS}");
            }
        }
        Ok(())
    }

    pub fn ledger_path(&self) -> Result<PathBuf> {
        match self
            .ledger_path
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(app_config_dir()?.join("rewards.db")),
        }
    }

    pub fn wallet_for(&self, player: &str) -> String {
        self.wallets
            .get(player)
            .cloned()
            .unwrap_or_else(|| format!("arena-{}", player.to_lowercase()))
    }
}

fn app_config_dir() -> Result<PathBuf> {
    let dir = dirs::config_dir()
        .context("unable to locate OS config directory")?
        .join(APP_DIR);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed creating config dir at {}", dir.display()))?;
    Ok(dir)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideOrigin {
    Process,
    Dotenv,
}

impl OverrideOrigin {
    fn as_str(self) -> &'static str {
        match self {
            OverrideOrigin::Process => "environment",
            OverrideOrigin::Dotenv => ".env",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedOverride {
    pub key: &'static str,
    pub origin: OverrideOrigin,
}

/// Values read from the first `.env` file found next to the config or in
/// the working directory. Process variables always win over these.
#[derive(Debug, Clone, Default)]
pub struct DotenvValues {
    source: Option<PathBuf>,
    values: HashMap<String, String>,
}

impl DotenvValues {
    pub fn discover() -> Self {
        let candidates = [
            dirs::config_dir().map(|dir| dir.join(APP_DIR).join(".env")),
            std::env::current_dir().ok().map(|dir| dir.join(".env")),
        ];
        for path in candidates.into_iter().flatten() {
            if !path.is_file() {
                continue;
            }
            match fs::read_to_string(&path) {
                Ok(text) => {
                    let values = parse_dotenv(&text);
                    info!(path = %path.display(), entries = values.len(), "read .env overrides");
                    return Self {
                        source: Some(path),
                        values,
                    };
                }
                Err(err) => warn!(?err, path = %path.display(), "skipping unreadable .env"),
            }
        }
        Self::default()
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            source: None,
            values: pairs
                .into_iter()
                .map(|(key, value)| (key.to_owned(), value.to_owned()))
                .collect(),
        }
    }

    fn resolve(&self, key: &str) -> Option<(String, OverrideOrigin)> {
        let from_process = std::env::var(key).ok().map(|value| (value, OverrideOrigin::Process));
        from_process
            .or_else(|| {
                self.values
                    .get(key)
                    .map(|value| (value.clone(), OverrideOrigin::Dotenv))
            })
            .map(|(value, origin)| (value.trim().to_owned(), origin))
            .filter(|(value, _)| !value.is_empty())
    }
}

/// `KEY=value` lines; `export` prefixes, `#` comments and one level of
/// matching quotes are accepted. Unquoted values drop a trailing ` # note`.
fn parse_dotenv(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|raw| {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() || key.contains(char::is_whitespace) {
                return None;
            }
            Some((key.to_owned(), unquote(value.trim())))
        })
        .collect()
}

fn unquote(value: &str) -> String {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner.to_owned();
        }
    }
    match value.find(" #") {
        Some(idx) => value[..idx].trim_end().to_owned(),
        None => value.to_owned(),
    }
}
