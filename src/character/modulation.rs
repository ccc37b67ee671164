//! Character state → LM decoding parameters.
//!
//! Bipolar social tension model over relationship levels −3..5: both deep
//! attachment and open hostility expand expression bandwidth; indifference
//! and strangeness contract it. Big Five sets the baseline, PAD drives the
//! dynamic shifts, neuroticism amplifies them, energy throttles everything.

use super::{BigFive, Pad};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f64,
    pub top_p: f64,
    pub presence_penalty: f64,
    pub frequency_penalty: f64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 1.0,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelationshipStage {
    pub label: &'static str,
    pub desc: &'static str,
}

/// Per-level offsets: (temperature, top_p, presence_penalty, frequency_penalty).
fn relationship_offsets(level: i32) -> (f64, f64, f64, f64) {
    match level {
        -3 => (0.50, 0.20, 0.60, 0.40),  // Nemesis
        -2 => (0.25, 0.10, 0.30, 0.20),  // Hostile
        -1 => (-0.30, -0.20, -0.20, -0.10), // Indifferent
        0 => (0.00, 0.00, 0.00, 0.00),   // Stranger
        1 => (0.10, 0.05, 0.05, 0.00),   // Acquaintance
        2 => (0.20, 0.10, 0.10, 0.05),   // Friend
        3 => (0.35, 0.15, 0.25, 0.10),   // Close Friend
        4 => (0.50, 0.25, 0.40, 0.20),   // Ambiguous
        5 => (0.70, 0.35, 0.60, 0.30),   // Soulmate
        _ => (0.0, 0.0, 0.0, 0.0),
    }
}

pub fn relationship_stage(level: i32) -> RelationshipStage {
    match level {
        -3 => RelationshipStage {
            label: "Nemesis",
            desc: "Bone-chilling coldness. Words carry sharp edges without disguise; not just rejection, but a spiritual banishment.",
        },
        -2 => RelationshipStage {
            label: "Hostile",
            desc: "Full of guard and rejection. Hostile to every approach, words with thorns, unwilling to show any softness.",
        },
        -1 => RelationshipStage {
            label: "Indifferent",
            desc: "Stagnant water without ripples. Responses limited to mechanical info exchange, no emotional fluctuation.",
        },
        1 => RelationshipStage {
            label: "Acquaintance",
            desc: "A passerby who occasionally stops to chat. Some warmth, willing to share trivia, but boundaries stay clear.",
        },
        2 => RelationshipStage {
            label: "Friend",
            desc: "Comfortable company. Defenses drop, daily joys and sorrows are shared, silence is no longer awkward.",
        },
        3 => RelationshipStage {
            label: "Close Friend",
            desc: "Resonance of souls. The unspoken is understood; a safe harbor where vulnerability can be shown frankly.",
        },
        4 => RelationshipStage {
            label: "Ambiguous",
            desc: "More than friends, subtle tension in the air. Every eye contact carries a current; unnecessary reasons to get closer keep appearing.",
        },
        5 => RelationshipStage {
            label: "Soulmate",
            desc: "Deep connection beyond language. Not constant sweet talk, but deep understanding and the certainty of 'I am here'.",
        },
        _ => RelationshipStage {
            label: "Stranger",
            desc: "Polite but distant. A perfect mask observing social etiquette; conversations feel like talking through glass.",
        },
    }
}

/// Maps energy level (0–100) to tone and length instructions.
pub fn energy_instruction(energy: f64) -> &'static str {
    if energy >= 80.0 {
        "Energy is HIGH. Speak enthusiastically, use exclamation marks, and be verbose! Expanded sentences."
    } else if energy >= 40.0 {
        "Energy is NORMAL. Speak typically, balanced sentence length."
    } else {
        "Energy is LOW. Speak softly, briefly, and maybe complain about being tired. Use short sentences."
    }
}

/// Converts PAD (pleasure, arousal) to an adjective for prompt injection.
pub fn pad_description(pleasure: f64, arousal: f64) -> &'static str {
    if pleasure > 0.7 {
        if arousal > 0.6 {
            "Excited/Joyful"
        } else {
            "Content/Relaxed"
        }
    } else if pleasure < 0.3 {
        if arousal > 0.6 {
            "Angry/Anxious"
        } else {
            "Sad/Depressed"
        }
    } else if arousal > 0.7 {
        "Alert"
    } else {
        "Neutral/Calm"
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Compute decoding parameters from the character's full state.
/// `energy_level` is the raw 0–100 value.
pub fn calculate_generation_params(
    base: GenerationParams,
    big_five: &BigFive,
    pad: &Pad,
    energy_level: f64,
    rel_level: i32,
) -> GenerationParams {
    let energy = energy_level / 100.0;

    // A. Personality baseline from Big Five
    let mut b5_temp_base = (big_five.openness - 0.5) * 0.4;
    let mut b5_top_p_base = (big_five.openness - 0.5) * 0.2;

    b5_temp_base -= (big_five.conscientiousness - 0.5) * 0.3;
    b5_top_p_base -= (big_five.conscientiousness - 0.5) * 0.2;

    let mut b5_pp_base = (big_five.extraversion - 0.5) * 0.4;
    b5_pp_base -= (big_five.agreeableness - 0.5) * 0.2;
    let b5_fp_base = (big_five.agreeableness - 0.5) * 0.3;

    // Neuroticism amplifies emotional swings
    let emotional_instability = 1.0 + (big_five.neuroticism - 0.5) * 1.5;

    // B. Dynamic emotion shifts from PAD
    let mood_temp_shift = (pad.pleasure - 0.5) * 0.4;
    let mood_top_p_shift = (pad.arousal - 0.5) * 0.3;
    let mood_pp_shift = (pad.dominance - 0.5) * 0.5;
    let mood_fp_shift = (pad.dominance - 0.5) * 0.3;

    let rel_offsets = relationship_offsets(rel_level);

    // C. Energy constraint
    let energy_mod = if energy < 0.2 {
        0.4
    } else if energy > 0.8 {
        1.2
    } else {
        1.0
    };
    let dynamic_factor = energy_mod * emotional_instability;

    let mut temperature =
        base.temperature + b5_temp_base + mood_temp_shift * dynamic_factor + rel_offsets.0;
    let mut top_p = base.top_p + b5_top_p_base + mood_top_p_shift * dynamic_factor + rel_offsets.1;
    let presence_penalty =
        base.presence_penalty + b5_pp_base + mood_pp_shift * dynamic_factor + rel_offsets.2;
    let frequency_penalty =
        base.frequency_penalty + b5_fp_base + mood_fp_shift * dynamic_factor + rel_offsets.3;

    // D. Hard clips: the social mask of early levels
    if rel_level == 0 {
        temperature = temperature.min(0.8);
        top_p = top_p.min(0.8);
    } else if rel_level == -1 {
        temperature = temperature.min(0.6);
    }

    GenerationParams {
        temperature: round2(temperature.clamp(0.1, 2.0)),
        top_p: round2(top_p.clamp(0.1, 1.0)),
        presence_penalty: round2(presence_penalty.clamp(-2.0, 2.0)),
        frequency_penalty: round2(frequency_penalty.clamp(-2.0, 2.0)),
    }
}
