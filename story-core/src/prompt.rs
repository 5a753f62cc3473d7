//! Prompt assembly for story passages and next-choice requests.
//!
//! Every function here is pure: the same inputs always produce the same text.

use crate::story::{Character, StoryDefinition};

/// Instruction used for the opening passage.
pub const OPENING_INSTRUCTION: &str = "開始這個故事，描述開場場景。";

/// Build the system prompt from the story definition and the running context.
///
/// Sections appear in a fixed order: world setting, characters, plot
/// guidelines, current context, then the writing guide and tone. Empty
/// sections are left out entirely.
pub fn build_system_prompt(story: &StoryDefinition, current_context: &str) -> String {
    let mut prompt = String::new();

    if !story.world_setting.is_empty() {
        prompt.push_str(&format!("## 世界設定\n{}\n\n", story.world_setting));
    }

    if !story.characters.is_empty() {
        prompt.push_str("## 角色設定\n");
        for character in &story.characters {
            push_character(&mut prompt, character);
        }
    }

    if !story.plot_guidelines.is_empty() {
        prompt.push_str(&format!("## 劇情指引\n{}\n\n", story.plot_guidelines));
    }

    if !current_context.is_empty() {
        prompt.push_str(&format!("## 當前情境\n{current_context}\n\n"));
    }

    prompt.push_str(include_str!("prompts/writing_guide.txt"));

    if !story.tone.is_empty() {
        prompt.push_str(&format!("- 整體基調: {}\n", story.tone));
    }

    prompt
}

fn push_character(prompt: &mut String, character: &Character) {
    prompt.push_str(&format!("### {}\n", character.name));

    let fields = [
        ("性格", &character.personality),
        ("背景", &character.background),
        ("目標", &character.goals),
    ];
    for (label, value) in fields {
        if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
            prompt.push_str(&format!("{label}: {value}\n"));
        }
    }

    prompt.push('\n');
}

/// The user half of a story prompt.
///
/// With no history this is the opening instruction and `choice` is ignored.
pub fn build_continuation_prompt(history: &[String], choice: &str) -> String {
    if history.is_empty() {
        OPENING_INSTRUCTION.to_string()
    } else {
        format!("玩家選擇: {choice}\n\n請根據這個選擇繼續故事。")
    }
}

/// The complete prompt for the next passage.
pub fn build_story_prompt(story: &StoryDefinition, history: &[String], choice: &str) -> String {
    let system = build_system_prompt(story, &history.join("\n"));
    let user = build_continuation_prompt(history, choice);
    format!("{system}\n\n{user}")
}

/// Prompt asking the model for `count` choices following `current_story`.
pub fn build_choices_prompt(current_story: &str, count: usize) -> String {
    include_str!("prompts/choices.txt")
        .trim_end()
        .replace("{count}", &count.to_string())
        .replace("{story}", current_story)
}
