//! Prompt templates for LLM interactions

/// Number responses for inclusion in a prompt
pub fn format_responses(responses: &[&str]) -> String {
    responses
        .iter()
        .enumerate()
        .map(|(i, text)| format!("Response {}: {}", i + 1, text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Prompt asking the model to identify high-level themes in a batch
pub fn extraction_prompt(question: &str, formatted_responses: &str) -> String {
    format!(
        r#"You are analyzing survey responses to identify high-level themes.

Question: {question}

Responses:
{formatted_responses}

Identify 2-10 high-level themes that capture the main patterns in these responses. Each theme should:
1. Represent a distinct concept or concern
2. Be broad enough to encompass multiple responses
3. Be specific enough to be actionable

For each theme provide:
1. A concise name (at most 60 characters)
2. A one-to-two sentence description of what the theme represents

Output as a JSON array:
[
  {{"name": "Theme Name", "description": "Theme description"}},
  {{"name": "Another Theme", "description": "Another description"}}
]

Focus on the underlying concerns, motivations, or challenges that multiple people are expressing, not on summarizing individual responses."#
    )
}

/// Stricter instruction appended after a parse failure
pub fn reformat_retry_prompt(question: &str, formatted_responses: &str) -> String {
    let base = extraction_prompt(question, formatted_responses);
    format!(
        "{base}\n\nIMPORTANT: your previous answer was not valid JSON. Respond with ONLY the JSON array. No prose, no markdown fences, no trailing commentary."
    )
}

/// Prompt revising a theme description against newly assigned responses
pub fn refresh_description_prompt(
    theme_name: &str,
    current_description: &str,
    formatted_responses: &str,
) -> String {
    format!(
        r#"You are updating a theme description based on new survey responses.

Existing Theme:
Name: {theme_name}
Current Description: {current_description}

New Responses:
{formatted_responses}

Update the theme description to reflect both the original theme and these new responses. The description should:
1. Maintain the core concept of the original theme
2. Incorporate insights from the new responses
3. Remain concise (one sentence)

Provide only the updated description, no other text."#
    )
}

/// Prompt naming one child cluster promoted out of a split
pub fn cluster_naming_prompt(parent_name: &str, formatted_responses: &str) -> String {
    format!(
        r#"A broad survey theme named "{parent_name}" is being narrowed down.

The following responses form one coherent sub-group of that theme:
{formatted_responses}

Provide a name and description for this sub-group as a JSON array with exactly one element:
[
  {{"name": "Sub-theme Name", "description": "What this sub-group is about"}}
]

The name must be at most 60 characters. Respond with ONLY the JSON array."#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responses_are_numbered() {
        let formatted = format_responses(&["first", "second"]);
        assert_eq!(formatted, "Response 1: first\nResponse 2: second");
    }

    #[test]
    fn extraction_prompt_carries_contract() {
        let prompt = extraction_prompt("What challenges do you face?", "Response 1: x");
        assert!(prompt.contains("What challenges do you face?"));
        assert!(prompt.contains("2-10 high-level themes"));
        assert!(prompt.contains("60 characters"));
        assert!(prompt.contains("JSON array"));
    }

    #[test]
    fn retry_prompt_is_stricter() {
        let retry = reformat_retry_prompt("q", "Response 1: x");
        assert!(retry.contains("ONLY the JSON array"));
        assert!(retry.len() > extraction_prompt("q", "Response 1: x").len());
    }

    #[test]
    fn refresh_prompt_includes_existing_description() {
        let prompt = refresh_description_prompt("API Challenges", "Problems with APIs", "Response 1: y");
        assert!(prompt.contains("API Challenges"));
        assert!(prompt.contains("Problems with APIs"));
        assert!(prompt.contains("only the updated description"));
    }
}
