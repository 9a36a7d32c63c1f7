//! Data-source collaborators.
//!
//! External providers are visible to the sync core only through the
//! [`DataSource`] trait: discover the raider universe, fetch records for a
//! list of ids, fetch inventory for owned raiders, and fetch per-raider
//! timers. [`HttpSource`] is the production implementation speaking to the
//! game REST API and the private inventory API; test doubles implement the
//! trait directly.

use std::collections::HashMap;
use std::time::Duration;

use chrono::DateTime;
use reqwest::blocking::Client;
use serde::Deserialize;

use crate::config::{Config, StatVec, STAT_NAMES};
use crate::error::{Result, SyncError};
use crate::progress::Reporter;

/// Quest status meanings: 1 is outbound, 2 is returning, everything else idle
pub const QUEST_STATUS_OUTBOUND: i64 = 1;
pub const QUEST_STATUS_RETURNING: i64 = 2;

/// One raider's attribute set, replaced wholesale per import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaiderRecord {
    pub id: i64,
    pub name: String,
    pub image: String,
    pub race: String,
    pub generation: i64,
    pub birthday: i64,
    pub experience: i64,
    pub level: i64,
    pub stats: StatVec,
}

/// One inventory item as reported by a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryItem {
    pub name: String,
    pub slot: String,
    pub equipped: bool,
    pub stats: StatVec,
}

/// Per-raider metadata: raid counters plus the full inventory list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaiderMeta {
    pub raider_id: i64,
    pub raids_remaining: i64,
    pub last_raided: i64,
    pub last_endless: Option<i64>,
    pub inventory: Vec<InventoryItem>,
}

/// Recruiting timer: next allowed recruit time (epoch seconds, 0 = now) and
/// current cost
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecruitTimer {
    pub next: i64,
    pub cost: i64,
}

/// Quest state for one raider; absent fields do not apply to the status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestState {
    pub raider_id: i64,
    pub status: i64,
    pub contract: Option<String>,
    pub started_on: Option<i64>,
    pub return_divisor: Option<i64>,
    pub returns_on: Option<i64>,
    pub reward_time: Option<i64>,
}

impl QuestState {
    /// State for a raider not on any quest
    pub fn idle(raider_id: i64) -> Self {
        QuestState {
            raider_id,
            status: 0,
            contract: None,
            started_on: None,
            return_divisor: None,
            returns_on: None,
            reward_time: None,
        }
    }
}

/// Result of discovering the raider universe
#[derive(Debug, Clone, Default)]
pub struct DiscoveredIds {
    pub owned: Vec<i64>,
    pub questing: Vec<i64>,
}

/// Narrow interface the sync core sees of any data provider
pub trait DataSource: Send + Sync {
    /// Discover the authoritative raider id universe
    fn discover_ids(&self, rep: &Reporter<'_>) -> Result<DiscoveredIds>;

    /// Fetch attribute records for the given ids
    fn fetch_raiders(&self, ids: &[i64], rep: &Reporter<'_>) -> Result<Vec<RaiderRecord>>;

    /// Fetch raid counters and inventory for one raider
    fn fetch_raider_meta(&self, raider_id: i64, rep: &Reporter<'_>) -> Result<RaiderMeta>;

    /// Fetch inventory for every owned, non-questing raider
    fn fetch_owned_inventory(&self, rep: &Reporter<'_>) -> Result<Vec<RaiderMeta>>;

    /// Fetch the recruiting timer for one raider
    fn fetch_recruiting(&self, raider_id: i64, rep: &Reporter<'_>) -> Result<RecruitTimer>;

    /// Fetch quest state for one raider. `on_quest` short-circuits the
    /// on-quest probe when discovery already answered it.
    fn fetch_quest(
        &self,
        raider_id: i64,
        on_quest: Option<bool>,
        rep: &Reporter<'_>,
    ) -> Result<QuestState>;
}

/// Parse an ISO-8601/RFC-3339 timestamp into epoch seconds
pub fn iso_to_secs(value: &str) -> Result<i64> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.timestamp())
        .map_err(|_| SyncError::BadTimestamp(value.to_string()))
}

// ── Wire formats ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct IdListFile {
    ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct WireAttribute {
    trait_type: String,
    #[serde(default)]
    value: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireRaider {
    id: i64,
    name: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    attributes: Vec<WireAttribute>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireItem {
    name: String,
    slot: String,
    #[serde(default)]
    stats: Option<HashMap<String, i64>>,
}

#[derive(Debug, Deserialize)]
struct WireInventoryEntry {
    #[serde(default)]
    equipped: bool,
    item: WireItem,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMeta {
    token_id: i64,
    #[serde(default)]
    raids_remaining: i64,
    #[serde(default)]
    last_raided: Option<String>,
    #[serde(default)]
    last_endless: Option<String>,
    #[serde(default)]
    inventory: Vec<WireInventoryEntry>,
}

#[derive(Debug, Deserialize)]
struct WireMetaEnvelope {
    raiders: Vec<WireMeta>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRecruit {
    #[serde(default)]
    can_recruit: bool,
    #[serde(default)]
    next_recruit_in: i64,
    cost: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireQuest {
    #[serde(default)]
    on_quest: bool,
    #[serde(default)]
    status: i64,
    #[serde(default)]
    contract: Option<String>,
    #[serde(default)]
    time_till_home: Option<i64>,
    #[serde(default)]
    time_questing: Option<i64>,
    #[serde(default)]
    return_home_time_divisor: Option<i64>,
    #[serde(default)]
    reward_time: Option<i64>,
}

fn stat_index(trait_type: &str) -> Option<usize> {
    STAT_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(trait_type))
}

fn value_i64(value: &serde_json::Value) -> i64 {
    match value {
        serde_json::Value::Number(n) => n.as_i64().unwrap_or(0),
        serde_json::Value::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

impl WireRaider {
    fn into_record(self) -> RaiderRecord {
        // Display names arrive as "[generation tag] Name"
        let name = match self.name.split_once("] ") {
            Some((_, rest)) => rest.to_string(),
            None => self.name,
        };

        let mut record = RaiderRecord {
            id: self.id,
            name,
            image: self.image,
            race: String::new(),
            generation: 0,
            birthday: 0,
            experience: 0,
            level: 0,
            stats: [0; 6],
        };
        for attr in &self.attributes {
            let Some(value) = &attr.value else { continue };
            if let Some(i) = stat_index(&attr.trait_type) {
                record.stats[i] = value_i64(value);
                continue;
            }
            match attr.trait_type.as_str() {
                "Race" => record.race = value.as_str().unwrap_or_default().to_string(),
                "Generation" => record.generation = value_i64(value),
                "Birthday" => record.birthday = value_i64(value),
                "Experience" => record.experience = value_i64(value),
                "Level" => record.level = value_i64(value),
                _ => {}
            }
        }
        record
    }
}

impl WireMeta {
    fn into_meta(self) -> Result<RaiderMeta> {
        let last_raided = match &self.last_raided {
            Some(ts) => iso_to_secs(ts)?,
            None => 0,
        };
        let last_endless = match &self.last_endless {
            Some(ts) => Some(iso_to_secs(ts)?),
            None => None,
        };
        let inventory = self
            .inventory
            .into_iter()
            .map(|entry| {
                let mut stats: StatVec = [0; 6];
                if let Some(wire_stats) = &entry.item.stats {
                    for (i, name) in STAT_NAMES.iter().enumerate() {
                        stats[i] = wire_stats.get(*name).copied().unwrap_or(0);
                    }
                }
                InventoryItem {
                    name: entry.item.name,
                    slot: entry.item.slot,
                    equipped: entry.equipped,
                    stats,
                }
            })
            .collect();
        Ok(RaiderMeta {
            raider_id: self.token_id,
            raids_remaining: self.raids_remaining,
            last_raided,
            last_endless,
            inventory,
        })
    }
}

// ── Production HTTP implementation ─────────────────────────────────────────

/// Data source backed by the game REST API and the private inventory API
pub struct HttpSource {
    client: Client,
    api_url: String,
    inventory_url: String,
    api_key: Option<String>,
}

impl HttpSource {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .user_agent("raider_sync/1.0")
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(HttpSource {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            inventory_url: config.inventory_url.trim_end_matches('/').to_string(),
            api_key: config.game_api_key.clone(),
        })
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let mut req = self.client.get(url).query(query);
        if let Some(key) = &self.api_key {
            req = req.query(&[("key", key.as_str())]);
        }
        let resp = req.send()?;
        if !resp.status().is_success() {
            return Err(SyncError::HttpStatus(resp.status()));
        }
        Ok(resp.json()?)
    }
}

impl DataSource for HttpSource {
    fn discover_ids(&self, rep: &Reporter<'_>) -> Result<DiscoveredIds> {
        rep.message("querying owned raiders")?;
        let owned: IdListFile = self.get_json(&format!("{}/raiders/owned", self.api_url), &[])?;
        rep.message(&format!("found {} owned raiders", owned.ids.len()))?;

        rep.message("querying questing raiders")?;
        let questing: IdListFile =
            self.get_json(&format!("{}/raiders/questing", self.api_url), &[])?;
        rep.message(&format!("found {} questing raiders", questing.ids.len()))?;

        Ok(DiscoveredIds {
            owned: owned.ids,
            questing: questing.ids,
        })
    }

    fn fetch_raiders(&self, ids: &[i64], rep: &Reporter<'_>) -> Result<Vec<RaiderRecord>> {
        let query: Vec<(&str, String)> =
            ids.iter().map(|id| ("ids[]", id.to_string())).collect();
        let raiders: Vec<WireRaider> =
            self.get_json(&format!("{}/raiders/", self.api_url), &query)?;
        rep.tick()?;
        Ok(raiders.into_iter().map(WireRaider::into_record).collect())
    }

    fn fetch_raider_meta(&self, raider_id: i64, rep: &Reporter<'_>) -> Result<RaiderMeta> {
        let meta: WireMeta =
            self.get_json(&format!("{}/game/raider/{}", self.api_url, raider_id), &[])?;
        rep.tick()?;
        meta.into_meta()
    }

    fn fetch_owned_inventory(&self, rep: &Reporter<'_>) -> Result<Vec<RaiderMeta>> {
        let envelope: WireMetaEnvelope =
            self.get_json(&format!("{}/raiders", self.inventory_url), &[])?;
        rep.tick()?;
        envelope
            .raiders
            .into_iter()
            .map(WireMeta::into_meta)
            .collect()
    }

    fn fetch_recruiting(&self, raider_id: i64, rep: &Reporter<'_>) -> Result<RecruitTimer> {
        let wire: WireRecruit = self.get_json(
            &format!("{}/game/recruiting/{}", self.api_url, raider_id),
            &[],
        )?;
        rep.tick()?;
        let next = if wire.can_recruit {
            0
        } else {
            chrono::Utc::now().timestamp() + wire.next_recruit_in
        };
        Ok(RecruitTimer {
            next,
            cost: wire.cost,
        })
    }

    fn fetch_quest(
        &self,
        raider_id: i64,
        on_quest: Option<bool>,
        rep: &Reporter<'_>,
    ) -> Result<QuestState> {
        let wire: WireQuest =
            self.get_json(&format!("{}/game/quest/{}", self.api_url, raider_id), &[])?;
        rep.tick()?;

        if !on_quest.unwrap_or(wire.on_quest) {
            return Ok(QuestState::idle(raider_id));
        }

        let mut quest = QuestState {
            raider_id,
            status: wire.status,
            contract: wire.contract,
            started_on: None,
            return_divisor: None,
            returns_on: None,
            reward_time: None,
        };
        let now = chrono::Utc::now().timestamp();
        match wire.status {
            QUEST_STATUS_RETURNING => {
                let delta = wire.time_till_home.unwrap_or(-1);
                quest.returns_on = Some(if delta <= 0 { 0 } else { now + delta });
            }
            QUEST_STATUS_OUTBOUND => {
                quest.started_on = wire.time_questing.map(|d| now - d);
                quest.return_divisor = wire.return_home_time_divisor;
                quest.reward_time = wire.reward_time;
            }
            _ => {}
        }
        Ok(quest)
    }
}
