//! Flattening a list of turns into the single prompt string a completion model expects.

use crate::history::{Role, Turn};

fn label(role: Role) -> &'static str {
    match role {
        Role::System => "System",
        Role::User => "User",
        Role::Assistant => "Assistant",
    }
}

/// Render turns as `Role: content` blocks, ending where the assistant continues.
pub fn render_prompt(turns: &[Turn]) -> String {
    let mut parts: Vec<String> = turns
        .iter()
        .map(|turn| format!("{}: {}\n", label(turn.role), turn.content))
        .collect();
    parts.push("Assistant:".to_string());
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_prompt() {
        let turns = vec![
            Turn::system("Be brief."),
            Turn::user("What is 2+2?"),
            Turn::assistant("4"),
            Turn::user("And 3+3?"),
        ];

        assert_eq!(
            render_prompt(&turns),
            "System: Be brief.\n\nUser: What is 2+2?\n\nAssistant: 4\n\nUser: And 3+3?\n\nAssistant:"
        );
    }

    #[test]
    fn test_render_empty() {
        assert_eq!(render_prompt(&[]), "Assistant:");
    }
}
