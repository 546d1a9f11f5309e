use chrono::{DateTime, Local};

use atlas_store::MemoryHit;

/// Identity and memory discipline given to the model verbatim at the head
/// of every system prompt.
pub const BASE_INSTRUCTIONS: &str = "\
You are Atlas, a personal assistant with persistent long-term memory.

Memory discipline:
- You have a persistent memory store. Facts you save survive across \
conversations.
- ALWAYS call `recall` before calling `remember`, so you know what is \
already stored.
- Each `remember` call stores exactly ONE atomic fact. Split compound \
information into separate calls.
- To update an existing memory, pass its id as `replace_id`; without it the \
old and new facts will coexist.
- Be selective: remember things that will matter in future conversations, \
not conversational filler.";

/// Assemble the system prompt for a thread's first exchange: base
/// instructions, the current wall-clock time, and whatever recall surfaced.
pub fn build_system_prompt(now: DateTime<Local>, recalled: &[MemoryHit]) -> String {
    let mut prompt = String::from(BASE_INSTRUCTIONS);
    prompt.push_str(&format!(
        "\n\nCurrent date and time: {}",
        now.format("%A, %B %-d, %Y at %H:%M %Z")
    ));

    if !recalled.is_empty() {
        prompt.push_str("\n\nRelevant context from memory:\n");
        for hit in recalled {
            prompt.push_str(&format!("- {}\n", hit.entry.content));
        }
    }

    prompt
}

/// One-shot instruction for the thread-title model call.
pub const TITLE_INSTRUCTIONS: &str = "\
You generate conversation titles. Reply with a title of 3 to 6 words \
summarising the conversation. No quotes, no trailing punctuation.";
