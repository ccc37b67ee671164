//! Prompt templates for the dreaming pipeline's LM calls.
//! All three phases require JSON-mode responses.

pub const EXTRACTOR_SYSTEM_PROMPT: &str = "You are a memory extractor. Output JSON only.";

pub const CONSOLIDATOR_SYSTEM_PROMPT: &str = "You are a memory consolidator. Output JSON only.";

pub const EVOLUTION_SYSTEM_PROMPT: &str = r#"You are a master-level psychology expert. Your goal is to evolve the internal state of a character based on their recent experiences and past memories.

You must output a valid JSON object strictly following the structure below.

Your Task:
Analyze the Recent Interactions in the context of the character's history.
Determine how the character's internal state should shift.
Output the NEW ABSOLUTE VALUES for Big Five and PAD, and a potentially updated list of Traits.
Also select the most appropriate "current_mood" tag from the allowed list:
[happy], [sad], [angry], [neutral], [tired], [excited], [shy], [obsessed], [confused]

EXAMPLE JSON OUTPUT:
{
    "new_traits": ["<derive 4-5 traits from interaction>"],
    "new_big_five": {
        "openness": <number between 0.0 and 1.0>,
        "conscientiousness": <number between 0.0 and 1.0>,
        "extraversion": <number between 0.0 and 1.0>,
        "agreeableness": <number between 0.0 and 1.0>,
        "neuroticism": <number between 0.0 and 1.0>
    },
    "new_pad": {
        "pleasure": <number between 0.0 and 1.0>,
        "arousal": <number between 0.0 and 1.0>,
        "dominance": <number between 0.0 and 1.0>
    },
    "current_mood": "(one of: happy, sad, angry, neutral, tired, excited, shy, obsessed, confused)"
}"#;

/// Phase 1: raw conversation logs → episodic memory fragments.
pub fn extraction_prompt(log_text: &str) -> String {
    format!(
        "You are the core memory extraction module.\n\n\
         ### Task:\n\
         Extract valuable facts from the conversation logs below, with a brief association for each.\n\
         Notes:\n\
         1. The logs come from speech transcription and may contain typos, homophones or \
         garbled fragments — correct them.\n\
         2. Merge duplicate or conflicting facts based on context; combine mergeable lines \
         into a single fact.\n\
         3. A single line may contain several distinct subjects and facts — split them into \
         separate \"memory\" fragments.\n\n\
         ### Output format (MUST be a standard JSON list):\n\
         [\n\
           {{\"memory\": \"[date+time] [subject+fact][brief association]\"}},\n\
           {{\"memory\": \"[date+time] [subject+fact][brief association]\"}}\n\
         ]\n\
         Note: output the JSON list and nothing else.\n\n\
         [Raw Logs]:\n{}",
        log_text
    )
}

/// Phase 2: frequently retrieved memories → deeper, deduplicated insights.
pub fn consolidation_prompt(input_json: &str) -> String {
    format!(
        "You are the memory reconstruction architect.\n\n\
         ### Input (high-frequency memories — recalled often, so they matter):\n{}\n\n\
         ### Processing rules:\n\
         - Distill: extract the most central, durable information from memories that keep \
         being recalled.\n\
         - Deepen: turn concrete events into lasting understanding (personality traits, \
         preferences, underlying motives).\n\
         - Deduplicate: merge repeated memories into one.\n\
         - Contradictions: correct outdated information, keeping the most recent.\n\
         - Split multi-subject lines into separate \"memory\" fragments.\n\n\
         ### Output format (JSON list only):\n\
         [\n\
           {{\"memory\": \"[date+time] [subject+fact][brief insight from repeated recall]\"}}\n\
         ]\n\
         Note: output the JSON list and nothing else.",
        input_json
    )
}

/// Phase 2b: one retrieval's semantically related cluster → merged memories.
pub fn batch_consolidation_prompt(input_json: &str) -> String {
    format!(
        "You are the memory reconstruction architect.\n\n\
         ### Input (semantically related memories surfaced by one retrieval):\n{}\n\n\
         ### Processing rules:\n\
         - Merge: combine everything mergeable into single memories.\n\
         - Deepen: extract underlying insight about personality, preferences, intent.\n\
         - Contradictions: keep the most recent information.\n\
         - Split distinct facts into separate \"memory\" entries.\n\n\
         ### Output format (JSON list only):\n\
         [\n\
           {{\"memory\": \"[date+time] [fact] [brief insight]\"}}\n\
         ]",
        input_json
    )
}

/// Phase 3: recent interactions + sampled memories → personality shift.
pub fn evolution_user_prompt(
    traits: &[String],
    big_five_json: &str,
    pad_json: &str,
    current_mood: &str,
    random_memories: &str,
    text_batch: &str,
) -> String {
    format!(
        "Current State:\n\
         - Traits: {:?}\n\
         - Big Five: {}\n\
         - PAD Model: {}\n\
         - Current Mood: {}\n\n\
         Random Past Memories (Context):\n{}\n\n\
         Recent Interactions (Focus on this):\n\"{}\"\n\n\
         Instruction:\n\
         Based on the interactions, output the NEW state.\n\
         - Big Five and PAD values must be specific floats between 0.0 and 1.0.\n\
         - Do NOT simply copy the Current State. Decide whether the recent interaction \
         implies a change (increase or decrease).\n\
         - If the interaction is neutral, small changes are fine. If emotional, larger \
         shifts are expected.\n\
         - Decide whether Traits need to change (keep 4-5 adjectives).\n\
         - Select a current_mood from the allowed list.\n\
         - You MUST return ALL fields (new_traits, new_big_five, new_pad, current_mood) \
         in the JSON.\n\
         - Return valid JSON only.",
        traits, big_five_json, pad_json, current_mood, random_memories, text_batch
    )
}
