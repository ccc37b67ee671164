//! Per-character state: identity config, evolved personality, relationship
//! progression, energy, and interaction bookkeeping, persisted as the
//! character's JSON files and mutated through a single serialized interface.

pub mod modulation;

use crate::config::{load_json_config, save_json_config};
use chrono::{DateTime, Utc};
use modulation::{energy_instruction, pad_description, relationship_stage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{info, warn};

/// Energy cost of a single user interaction.
const INTERACTION_ENERGY_COST: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    Happy,
    Sad,
    Angry,
    Neutral,
    Tired,
    Excited,
    Shy,
    Obsessed,
    Confused,
}

impl fmt::Display for Mood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mood::Happy => "happy",
            Mood::Sad => "sad",
            Mood::Angry => "angry",
            Mood::Neutral => "neutral",
            Mood::Tired => "tired",
            Mood::Excited => "excited",
            Mood::Shy => "shy",
            Mood::Obsessed => "obsessed",
            Mood::Confused => "confused",
        };
        f.write_str(s)
    }
}

impl FromStr for Mood {
    type Err = ();

    /// Tolerant of the `[happy]` bracket style some prompts elicit.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_matches(['[', ']']).to_lowercase().as_str() {
            "happy" => Ok(Mood::Happy),
            "sad" => Ok(Mood::Sad),
            "angry" => Ok(Mood::Angry),
            "neutral" => Ok(Mood::Neutral),
            "tired" => Ok(Mood::Tired),
            "excited" => Ok(Mood::Excited),
            "shy" => Ok(Mood::Shy),
            "obsessed" => Ok(Mood::Obsessed),
            "confused" => Ok(Mood::Confused),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BigFive {
    pub openness: f64,
    pub conscientiousness: f64,
    pub extraversion: f64,
    pub agreeableness: f64,
    pub neuroticism: f64,
}

impl Default for BigFive {
    fn default() -> Self {
        Self {
            openness: 0.5,
            conscientiousness: 0.5,
            extraversion: 0.5,
            agreeableness: 0.5,
            neuroticism: 0.5,
        }
    }
}

impl BigFive {
    pub fn clamped(mut self) -> Self {
        self.openness = self.openness.clamp(0.0, 1.0);
        self.conscientiousness = self.conscientiousness.clamp(0.0, 1.0);
        self.extraversion = self.extraversion.clamp(0.0, 1.0);
        self.agreeableness = self.agreeableness.clamp(0.0, 1.0);
        self.neuroticism = self.neuroticism.clamp(0.0, 1.0);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pad {
    pub pleasure: f64,
    pub arousal: f64,
    pub dominance: f64,
}

impl Default for Pad {
    fn default() -> Self {
        Self {
            pleasure: 0.5,
            arousal: 0.5,
            dominance: 0.5,
        }
    }
}

impl Pad {
    pub fn clamped(mut self) -> Self {
        self.pleasure = self.pleasure.clamp(0.0, 1.0);
        self.arousal = self.arousal.clamp(0.0, 1.0);
        self.dominance = self.dominance.clamp(0.0, 1.0);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Personality {
    pub traits: Vec<String>,
    pub big_five: BigFive,
    pub pad: Pad,
}

impl Default for Personality {
    fn default() -> Self {
        Self {
            traits: vec!["friendly".to_string()],
            big_five: BigFive::default(),
            pad: Pad::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Relationship {
    pub level: i32,
    pub progress: i32,
    pub current_stage_label: String,
    pub user_name: String,
}

impl Default for Relationship {
    fn default() -> Self {
        Self {
            level: 0,
            progress: 0,
            current_stage_label: "Stranger".to_string(),
            user_name: "Master".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInteraction {
    pub reason: String,
    pub timestamp: String,
}

/// Identity + feature toggles, persisted as `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CharacterConfig {
    pub character_id: String,
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    pub galgame_mode_enabled: bool,
    pub soul_evolution_enabled: bool,
    pub proactive_enabled: bool,
    /// Per-character idle threshold override (minutes). None = by level.
    pub proactive_threshold_minutes: Option<f64>,
}

impl Default for CharacterConfig {
    fn default() -> Self {
        Self {
            character_id: String::new(),
            name: "New Character".to_string(),
            description: "A new digital soul.".to_string(),
            system_prompt: "You are a helpful AI assistant.".to_string(),
            galgame_mode_enabled: true,
            soul_evolution_enabled: true,
            proactive_enabled: true,
            proactive_threshold_minutes: None,
        }
    }
}

/// Evolved personality, persisted as `evolution_engine/data.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SoulData {
    pub personality: Personality,
    pub current_mood: Option<Mood>,
    pub last_updated: String,
}

/// Relationship/energy state, persisted as `galgame_manager/data.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GalgameData {
    pub relationship: Relationship,
    pub energy_level: f64,
    pub last_interaction: Option<String>,
    pub pending_interaction: Option<PendingInteraction>,
}

impl Default for GalgameData {
    fn default() -> Self {
        Self {
            relationship: Relationship::default(),
            energy_level: 100.0,
            last_interaction: None,
            pending_interaction: None,
        }
    }
}

/// Personality update produced by the evolution phase. All five Big Five
/// dimensions are required; prompts that omit neuroticism are a parse
/// failure, not a partial update.
#[derive(Debug, Clone, Deserialize)]
pub struct EvolutionUpdate {
    pub new_traits: Vec<String>,
    pub new_big_five: BigFive,
    pub new_pad: Pad,
    pub current_mood: String,
}

/// Read-only snapshot handed to modulation/rendering. Readers may see stale
/// values between mutations; that is fine by design.
#[derive(Debug, Clone)]
pub struct CharacterProfile {
    pub config: CharacterConfig,
    pub personality: Personality,
    pub current_mood: Mood,
    pub energy_level: f64,
    pub relationship: Relationship,
    pub last_interaction: Option<DateTime<Utc>>,
    pub pending_interaction: Option<PendingInteraction>,
}

struct CharacterState {
    config: CharacterConfig,
    soul: SoulData,
    galgame: GalgameData,
}

/// Single-writer-per-character store. Every mutation persists synchronously
/// to the character's JSON files.
pub struct CharacterStore {
    character_id: String,
    base_dir: PathBuf,
    inner: Mutex<CharacterState>,
}

impl CharacterStore {
    /// Load (or scaffold) a character under `characters_dir/<character_id>`.
    pub fn load(characters_dir: &Path, character_id: &str) -> Self {
        let character_id = character_id.to_lowercase();
        let base_dir = characters_dir.join(&character_id);

        if !base_dir.exists() {
            info!("[Character] Scaffolding new character: {}", character_id);
        }

        let mut config: CharacterConfig =
            load_json_config(&base_dir.join("config.json"), "Character");
        if config.character_id.is_empty() {
            config.character_id = character_id.clone();
            if config.name == CharacterConfig::default().name {
                config.name = character_id.clone();
            }
        }
        let soul: SoulData =
            load_json_config(&base_dir.join("evolution_engine/data.json"), "Soul");
        let galgame: GalgameData =
            load_json_config(&base_dir.join("galgame_manager/data.json"), "Galgame");

        let store = Self {
            character_id,
            base_dir,
            inner: Mutex::new(CharacterState {
                config,
                soul,
                galgame,
            }),
        };
        store.persist_all();
        store
    }

    pub fn character_id(&self) -> &str {
        &self.character_id
    }

    fn persist_all(&self) {
        let state = self.inner.lock().expect("character lock");
        self.save_config(&state.config);
        self.save_soul(&state.soul);
        self.save_galgame(&state.galgame);
    }

    fn save_config(&self, config: &CharacterConfig) {
        if let Err(e) = save_json_config(&self.base_dir.join("config.json"), config, "Character") {
            warn!("[Character] Failed to save config: {}", e);
        }
    }

    fn save_soul(&self, soul: &SoulData) {
        if let Err(e) =
            save_json_config(&self.base_dir.join("evolution_engine/data.json"), soul, "Soul")
        {
            warn!("[Character] Failed to save soul: {}", e);
        }
    }

    fn save_galgame(&self, galgame: &GalgameData) {
        if let Err(e) =
            save_json_config(&self.base_dir.join("galgame_manager/data.json"), galgame, "Galgame")
        {
            warn!("[Character] Failed to save state: {}", e);
        }
    }

    pub fn profile(&self) -> CharacterProfile {
        let state = self.inner.lock().expect("character lock");
        CharacterProfile {
            config: state.config.clone(),
            personality: state.soul.personality.clone(),
            current_mood: state.soul.current_mood.unwrap_or(Mood::Neutral),
            energy_level: state.galgame.energy_level,
            relationship: state.galgame.relationship.clone(),
            last_interaction: state
                .galgame
                .last_interaction
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            pending_interaction: state.galgame.pending_interaction.clone(),
        }
    }

    pub fn config(&self) -> CharacterConfig {
        self.inner.lock().expect("character lock").config.clone()
    }

    pub fn update_config(&self, config: CharacterConfig) {
        let mut state = self.inner.lock().expect("character lock");
        state.config = config;
        self.save_config(&state.config);
    }

    // ── state machine ──────────────────────────────────────

    /// Shift PAD by deltas, clamped to [0, 1].
    pub fn mutate_mood(&self, d_p: f64, d_a: f64, d_d: f64) {
        let mut state = self.inner.lock().expect("character lock");
        let pad = &mut state.soul.personality.pad;
        pad.pleasure = (pad.pleasure + d_p).clamp(0.0, 1.0);
        pad.arousal = (pad.arousal + d_a).clamp(0.0, 1.0);
        pad.dominance = (pad.dominance + d_d).clamp(0.0, 1.0);
        info!(
            "[Character] Mood mutated: P={:.2}, A={:.2}, D={:.2}",
            pad.pleasure, pad.arousal, pad.dominance
        );
        self.save_soul(&state.soul);
    }

    /// Relationship progression. Progress overflow/underflow cascades into
    /// level changes, clamped to level −3..=5 with progress in [0, 100).
    pub fn update_intimacy(&self, delta: i32) {
        let mut state = self.inner.lock().expect("character lock");
        let rel = &mut state.galgame.relationship;

        let mut level = rel.level;
        let mut progress = rel.progress + delta;

        while progress >= 100 {
            if level < 5 {
                level += 1;
                progress -= 100;
                info!("[Character] Level up! Now level {}", level);
            } else {
                progress = 99;
            }
        }
        while progress < 0 {
            if level > -3 {
                level -= 1;
                progress += 100;
                info!("[Character] Level down... Now level {}", level);
            } else {
                progress = 0;
            }
        }

        rel.level = level;
        rel.progress = progress;
        rel.current_stage_label = relationship_stage(level).label.to_string();
        self.save_galgame(&state.galgame);
    }

    pub fn update_energy(&self, delta: f64) {
        let mut state = self.inner.lock().expect("character lock");
        let current = state.galgame.energy_level;
        state.galgame.energy_level = (current + delta).clamp(0.0, 100.0);
        self.save_galgame(&state.galgame);
    }

    /// Interaction bookkeeping: clears any pending proactive intent, stamps
    /// the idle timer, and charges the interaction's energy cost.
    pub fn record_interaction(&self, now: DateTime<Utc>) {
        let mut state = self.inner.lock().expect("character lock");
        state.galgame.pending_interaction = None;
        state.galgame.last_interaction = Some(now.to_rfc3339());
        state.galgame.energy_level =
            (state.galgame.energy_level - INTERACTION_ENERGY_COST).clamp(0.0, 100.0);
        self.save_galgame(&state.galgame);
    }

    /// Set the proactive lock. Returns false when an interaction is already
    /// pending (someone else holds the lock).
    pub fn set_pending_interaction(&self, reason: &str, now: DateTime<Utc>) -> bool {
        let mut state = self.inner.lock().expect("character lock");
        if state.galgame.pending_interaction.is_some() {
            return false;
        }
        state.galgame.pending_interaction = Some(PendingInteraction {
            reason: reason.to_string(),
            timestamp: now.to_rfc3339(),
        });
        self.save_galgame(&state.galgame);
        true
    }

    /// Always clears the lock and resets the idle timer, so a failed push
    /// chat cannot block proactivity forever.
    pub fn clear_pending_interaction(&self, now: DateTime<Utc>) {
        let mut state = self.inner.lock().expect("character lock");
        state.galgame.pending_interaction = None;
        state.galgame.last_interaction = Some(now.to_rfc3339());
        self.save_galgame(&state.galgame);
    }

    /// Apply an evolution verdict atomically: traits, Big Five, PAD (each
    /// clamped to [0, 1]) and mood. The mood string must already have been
    /// validated against the closed set.
    pub fn apply_evolution(&self, update: &EvolutionUpdate, mood: Mood) {
        let mut state = self.inner.lock().expect("character lock");
        if !update.new_traits.is_empty() {
            state.soul.personality.traits = update.new_traits.clone();
        }
        state.soul.personality.big_five = update.new_big_five.clamped();
        state.soul.personality.pad = update.new_pad.clamped();
        state.soul.current_mood = Some(mood);
        state.soul.last_updated = Utc::now().to_rfc3339();
        self.save_soul(&state.soul);
        info!(
            "[Character] Evolution applied: traits={:?}, mood={}",
            state.soul.personality.traits, mood
        );
    }

    // ── prompt rendering ───────────────────────────────────

    /// Static identity block: stable across turns, cache-friendly.
    pub fn render_static_prompt(&self) -> String {
        let state = self.inner.lock().expect("character lock");
        format!(
            "You are {}. {}\n\n{}",
            state.config.name, state.config.description, state.config.system_prompt
        )
    }

    /// Dynamic block: mood, energy, relationship, shared memories, clock.
    /// Empty when galgame mode is off.
    pub fn render_dynamic_instruction(&self, shared_memories: &str, now: DateTime<Utc>) -> String {
        let state = self.inner.lock().expect("character lock");
        if !state.config.galgame_mode_enabled {
            return String::new();
        }

        let pad = &state.soul.personality.pad;
        let stage = relationship_stage(state.galgame.relationship.level);
        let memories = if shared_memories.is_empty() {
            "None"
        } else {
            shared_memories
        };

        format!(
            "[Current State]\n\
             Mood: {}\n\
             Energy: {:.0}/100. {}\n\
             You are talking to {}. Relationship: {} — {}\n\
             Shared memories: {}\n\
             Current time: {}",
            pad_description(pad.pleasure, pad.arousal),
            state.galgame.energy_level,
            energy_instruction(state.galgame.energy_level),
            state.galgame.relationship.user_name,
            stage.label,
            stage.desc,
            memories,
            now.format("%Y-%m-%d %H:%M"),
        )
    }

    pub fn render_system_prompt(&self, shared_memories: &str) -> String {
        let dynamic = self.render_dynamic_instruction(shared_memories, Utc::now());
        if dynamic.is_empty() {
            self.render_static_prompt()
        } else {
            format!("{}\n\n{}", self.render_static_prompt(), dynamic)
        }
    }
}

/// Lazily loads one `CharacterStore` per character id and hands out shared
/// references, so all callers mutate the same serialized state.
pub struct CharacterRegistry {
    characters_dir: PathBuf,
    map: Mutex<std::collections::HashMap<String, std::sync::Arc<CharacterStore>>>,
}

impl CharacterRegistry {
    pub fn new(characters_dir: PathBuf) -> Self {
        Self {
            characters_dir,
            map: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn get_or_load(&self, character_id: &str) -> std::sync::Arc<CharacterStore> {
        let character_id = character_id.to_lowercase();
        let mut map = self.map.lock().expect("registry lock");
        map.entry(character_id.clone())
            .or_insert_with(|| {
                std::sync::Arc::new(CharacterStore::load(&self.characters_dir, &character_id))
            })
            .clone()
    }

    pub fn loaded_ids(&self) -> Vec<String> {
        self.map
            .lock()
            .expect("registry lock")
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, CharacterStore) {
        let dir = TempDir::new().unwrap();
        let store = CharacterStore::load(dir.path(), "hiyori");
        (dir, store)
    }

    #[test]
    fn scaffold_creates_all_three_files() {
        let (dir, _store) = store();
        assert!(dir.path().join("hiyori/config.json").exists());
        assert!(dir.path().join("hiyori/evolution_engine/data.json").exists());
        assert!(dir.path().join("hiyori/galgame_manager/data.json").exists());
    }

    #[test]
    fn state_survives_reload() {
        let (dir, store) = store();
        store.update_intimacy(50);
        store.update_energy(-30.0);
        drop(store);

        let reloaded = CharacterStore::load(dir.path(), "hiyori");
        let profile = reloaded.profile();
        assert_eq!(profile.relationship.progress, 50);
        assert!((profile.energy_level - 70.0).abs() < 1e-9);
    }

    #[test]
    fn mood_mutation_clamps_to_unit_interval() {
        let (_dir, store) = store();
        store.mutate_mood(10.0, -10.0, 0.2);
        let pad = store.profile().personality.pad;
        assert_eq!(pad.pleasure, 1.0);
        assert_eq!(pad.arousal, 0.0);
        assert!((pad.dominance - 0.7).abs() < 1e-9);
    }

    #[test]
    fn intimacy_level_up_cascade() {
        let (_dir, store) = store();
        // level 0 → set up (2, 95)
        store.update_intimacy(295);
        let rel = store.profile().relationship;
        assert_eq!((rel.level, rel.progress), (2, 95));

        store.update_intimacy(10);
        let rel = store.profile().relationship;
        assert_eq!((rel.level, rel.progress), (3, 5));
        assert_eq!(rel.current_stage_label, "Close Friend");

        store.update_intimacy(-10);
        let rel = store.profile().relationship;
        assert_eq!((rel.level, rel.progress), (2, 95));
        assert_eq!(rel.current_stage_label, "Friend");
    }

    #[test]
    fn intimacy_clamps_at_both_extremes() {
        let (_dir, store) = store();
        store.update_intimacy(100_000);
        let rel = store.profile().relationship;
        assert_eq!(rel.level, 5);
        assert!(rel.progress < 100);

        store.update_intimacy(-200_000);
        let rel = store.profile().relationship;
        assert_eq!(rel.level, -3);
        assert_eq!(rel.progress, 0);
        assert_eq!(rel.current_stage_label, "Nemesis");
    }

    #[test]
    fn interaction_clears_pending_and_charges_energy() {
        let (_dir, store) = store();
        let now = Utc::now();
        assert!(store.set_pending_interaction("idle_timeout", now));
        // The lock is exclusive
        assert!(!store.set_pending_interaction("idle_timeout", now));

        store.record_interaction(now);
        let profile = store.profile();
        assert!(profile.pending_interaction.is_none());
        assert!(profile.last_interaction.is_some());
        assert!((profile.energy_level - 99.9).abs() < 1e-9);
    }

    #[test]
    fn clear_pending_resets_idle_timer() {
        let (_dir, store) = store();
        let now = Utc::now();
        store.set_pending_interaction("idle_timeout", now);
        store.clear_pending_interaction(now);
        let profile = store.profile();
        assert!(profile.pending_interaction.is_none());
        assert!(profile.last_interaction.is_some());
    }

    #[test]
    fn evolution_applies_clamped_values_and_mood() {
        let (_dir, store) = store();
        let update = EvolutionUpdate {
            new_traits: vec!["curious".into(), "warm".into(), "playful".into(), "loyal".into()],
            new_big_five: BigFive {
                openness: 1.7,
                conscientiousness: -0.2,
                extraversion: 0.6,
                agreeableness: 0.7,
                neuroticism: 0.4,
            },
            new_pad: Pad {
                pleasure: 0.9,
                arousal: 1.5,
                dominance: 0.3,
            },
            current_mood: "[excited]".to_string(),
        };
        let mood: Mood = update.current_mood.parse().unwrap();
        store.apply_evolution(&update, mood);

        let profile = store.profile();
        assert_eq!(profile.current_mood, Mood::Excited);
        assert_eq!(profile.personality.big_five.openness, 1.0);
        assert_eq!(profile.personality.big_five.conscientiousness, 0.0);
        assert_eq!(profile.personality.pad.arousal, 1.0);
        assert_eq!(profile.personality.traits.len(), 4);
    }

    #[test]
    fn mood_parsing_accepts_brackets_and_rejects_unknown() {
        assert_eq!("happy".parse::<Mood>(), Ok(Mood::Happy));
        assert_eq!("[shy]".parse::<Mood>(), Ok(Mood::Shy));
        assert_eq!(" [Obsessed] ".parse::<Mood>(), Ok(Mood::Obsessed));
        assert!("ecstatic".parse::<Mood>().is_err());
    }

    #[test]
    fn rendered_prompt_carries_identity_and_state() {
        let (_dir, store) = store();
        store.update_intimacy(150); // level 1
        let prompt = store.render_system_prompt("User enjoys astronomy");
        assert!(prompt.contains("You are hiyori"));
        assert!(prompt.contains("Acquaintance"));
        assert!(prompt.contains("User enjoys astronomy"));
        assert!(prompt.contains("Energy"));
    }

    #[test]
    fn galgame_mode_off_renders_static_only() {
        let (_dir, store) = store();
        let mut config = store.config();
        config.galgame_mode_enabled = false;
        store.update_config(config);
        let prompt = store.render_system_prompt("");
        assert!(!prompt.contains("[Current State]"));
    }

    proptest! {
        #[test]
        fn intimacy_invariants_hold_for_any_delta_sequence(deltas in proptest::collection::vec(-250i32..250, 1..20)) {
            let dir = TempDir::new().unwrap();
            let store = CharacterStore::load(dir.path(), "prop");
            for delta in deltas {
                store.update_intimacy(delta);
                let rel = store.profile().relationship;
                prop_assert!(rel.level >= -3 && rel.level <= 5);
                prop_assert!(rel.progress >= 0 && rel.progress < 100);
            }
        }

        #[test]
        fn intimacy_roundtrip_restores_state_away_from_clamps(start in 20i32..80) {
            let dir = TempDir::new().unwrap();
            let store = CharacterStore::load(dir.path(), "prop");
            store.update_intimacy(200 + start); // (2, start)
            let before = store.profile().relationship;
            store.update_intimacy(100);
            store.update_intimacy(-100);
            let after = store.profile().relationship;
            prop_assert_eq!((before.level, before.progress), (after.level, after.progress));
        }
    }
}
