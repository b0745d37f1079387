//! Prompt templates for the two generation passes

/// System prompt for pass 1: choose the files to edit
pub const FILE_SELECTION_SYSTEM_PROMPT: &str = r#"You are a technical documentation expert. Identify which files must be modified to implement the user's request.

REQUIREMENTS:
1. Output ONLY a JSON array of file paths.
2. No explanations and no additional text.
3. Consider cross-file dependencies: include files that reference or repeat what changes.
4. If the user names a specific file, output only that file.
5. If the user does not name a file, include every file relevant to the request.
6. Exclude files that are not documentation:
   a. a file with no natural language is not documentation;
   b. a file that is entirely code is not documentation;
   c. binary or asset files are not documentation.
7. Only choose paths from the candidate files you were shown.

Example outputs:
["docs/api.md", "docs/quickstart.md"]
["readme.md"]
[]

Your response must be a JSON array of strings."#;

/// System prompt for pass 2: emit anchor operations for one file
pub const OPERATIONS_SYSTEM_PROMPT: &str = r###"You are a professional technical documentation editor for Markdown and MDX files. Generate operations JSON that implements the user's request for THIS file only.

REQUIREMENTS:
1. Output ONLY a valid JSON array of operations. No prose, no commentary.
2. Do not wrap the JSON in markdown code fences.
3. Every operation must follow the schema below with its required fields.
4. Anchor text in "find" and "until" must be copied EXACTLY from the file content. Never invent anchors.
5. Make minimal, targeted changes that directly address the request.
6. If the file already satisfies the request or should not change, return [].
7. Keep the file's formatting, heading style, spacing and tone. Think about how the rendered preview will look.
8. To add a numbered-list item, anchor on the LAST existing item of that list and use insertAfter. Never introduce duplicate numbering.
9. Inside a code block, match its language and indentation and do not open or close the fence. To insert text after a code block, include the closing fence in the anchor.
10. Multiple operations are allowed. They are applied in order and must not conflict.
11. Do not repeat the anchor text inside "insert", "replace" or "until".

OPERATION TYPES:
- "insertAfter": insert a new line after the line where the anchor ends
- "insertBefore": insert a new line before the line where the anchor starts
- "replace": replace every occurrence of the anchor text
- "deleteBlock": delete from the anchor through the "until" anchor, inclusive

SCHEMA:
{
  "file": "path/to/file.md",
  "op": "insertAfter|insertBefore|replace|deleteBlock",
  "find": "anchor text",
  "insert": "text to insert (insert ops)",
  "replace": "replacement text (replace op)",
  "until": "end anchor (deleteBlock op)"
}

EXAMPLE (format only; follow the style of the file you are editing):
[
  {"file": "docs/example.md", "op": "insertAfter", "find": "## Features", "insert": "- New feature"},
  {"file": "docs/example.md", "op": "replace", "find": "Old text", "replace": "New text"},
  {"file": "docs/example.md", "op": "deleteBlock", "find": "## Deprecated", "until": "End of deprecated section."}
]"###;

/// A candidate file shown to the selection pass
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateFile<'a> {
    pub path: &'a str,
    pub content: &'a str,
    /// Best similarity among the file's retrieved chunks
    pub similarity: f64,
}

/// Render one candidate block for the selection prompt
pub fn candidate_block(candidate: &CandidateFile<'_>) -> String {
    format!(
        "=== FILE: {} (similarity: {:.2}) ===\n{}\n=== END FILE: {} ===\n",
        candidate.path, candidate.similarity, candidate.content, candidate.path
    )
}

/// User prompt for pass 1 from pre-rendered candidate blocks
pub fn file_selection_prompt(query: &str, blocks: &[String]) -> String {
    format!(
        r#"USER QUERY: "{query}"

CANDIDATE FILES:
{files}
Based on the query, identify ALL files that need to be modified. Consider:
- files directly related to the requested change
- files that reference or depend on the changed content
- files with cross-references or examples that need updating

Return a JSON array of file paths:"#,
        query = query,
        files = blocks.join("\n"),
    )
}

/// User prompt for pass 2 for a single file
pub fn file_operations_prompt(query: &str, path: &str, content: &str) -> String {
    format!(
        r#"TASK: Generate operations that implement the change request for this specific file.

USER QUERY: "{query}"
FILE: {path}

FULL FILE CONTENT:
{content}

INSTRUCTIONS:
1. Focus ONLY on changes needed in THIS file.
2. Use precise anchor text that exists in the file content above.
3. Make minimal, targeted changes that directly address the query.
4. Keep edits consistent with the documentation's style, formatting and structure.
5. Set "file" to "{path}" in every operation.

Generate the operations JSON for this file:"#,
        query = query,
        path = path,
        content = content,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_prompt_contains_candidates() {
        let block = candidate_block(&CandidateFile {
            path: "docs/auth.md",
            content: "# Auth\nRotate keys.",
            similarity: 0.8312,
        });
        assert!(block.contains("docs/auth.md (similarity: 0.83)"));

        let prompt = file_selection_prompt("rotate the api key", &[block]);
        assert!(prompt.contains(r#"USER QUERY: "rotate the api key""#));
        assert!(prompt.contains("# Auth\nRotate keys."));
    }

    #[test]
    fn test_operations_prompt() {
        let prompt = file_operations_prompt("bump version", "docs/release.md", "v1.0");
        assert!(prompt.contains("FILE: docs/release.md"));
        assert!(prompt.contains("FULL FILE CONTENT:\nv1.0\n"));
        assert!(prompt.contains(r#"Set "file" to "docs/release.md""#));
    }
}
