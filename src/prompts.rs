//! Prompt construction for file analysis.
//!
//! Each [`QualityTier`] asks for a different amount of structure. The
//! fallback prompt asks only for `summary` and `purpose` and is used when
//! the tier prompt repeatedly produced unparseable output.

use crate::llm::Message;
use crate::models::QualityTier;

const SYSTEM_PROMPT: &str = "You are a senior software engineer performing a code review. \
Analyze the provided source code file and return a structured JSON response. \
Be precise and factual. Do not invent details that are not present in the code.";

const DEPENDENCY_RULES: &str = r#"Dependency types:
- "grpc" for gRPC service calls
- "api_call" for HTTP/REST calls to other services
- "database" for database connections (Redis, PostgreSQL, etc.)
- "event" for message queues and event buses
- "import" for library and package imports
Do not list shell commands (ls, cd, mkdir, cp, echo) as dependencies."#;

const CONFIG_RULES: &str = "For configuration files (YAML, .properties, .env, JSON, TOML), \
list the actual configured values (topic names, URLs, ports, feature flags) instead of \
describing them generically.";

const LITE_SCHEMA: &str = r#"{
  "summary": "2-3 sentence summary of what this file does. Include concrete values like port numbers, routes, and service names.",
  "purpose": "One sentence describing the file's role in the project",
  "dependencies": [{"name": "package or service name", "type": "import|api_call|grpc|database|event"}]
}"#;

const NORMAL_SCHEMA: &str = r#"{
  "summary": "2-3 sentence summary of what this file does, with concrete values such as ports, HTTP routes, environment variable names and service names.",
  "purpose": "One sentence describing the file's role in the project",
  "functions": [
    {
      "name": "function name",
      "signature": "full function signature",
      "summary": "What this function does",
      "parameters": [{"name": "param", "type": "type", "description": "what it is"}],
      "returns": "return type and meaning",
      "line_start": 0,
      "line_end": 0
    }
  ],
  "classes": [
    {
      "name": "class/struct/interface name",
      "summary": "What this type represents",
      "methods": [],
      "fields": [{"name": "field", "type": "type", "description": "what it stores"}],
      "line_start": 0,
      "line_end": 0
    }
  ],
  "dependencies": [{"name": "package or service name", "type": "import|api_call|grpc|database|event"}],
  "key_logic": ["Important algorithm or business rule, with concrete values"]
}"#;

const MAX_SCHEMA: &str = r#"{
  "summary": "Detailed 3-5 sentence summary of what this file does, with concrete values such as ports, HTTP routes, environment variable names and service names.",
  "purpose": "The file's role, responsibilities, and how it fits in the project",
  "functions": [
    {
      "name": "function name",
      "signature": "full function signature",
      "summary": "Detailed description including edge cases and error handling",
      "parameters": [{"name": "param", "type": "type", "description": "detailed description"}],
      "returns": "return type, meaning, and possible error conditions",
      "line_start": 0,
      "line_end": 0
    }
  ],
  "classes": [
    {
      "name": "class/struct/interface name",
      "summary": "Detailed description including design patterns and responsibilities",
      "methods": [],
      "fields": [{"name": "field", "type": "type", "description": "detailed purpose"}],
      "line_start": 0,
      "line_end": 0
    }
  ],
  "dependencies": [{"name": "package or service name", "type": "import|api_call|grpc|database|event"}],
  "key_logic": ["Each important algorithm, business rule, error handling pattern, or cross-reference to other modules"]
}"#;

/// System + user messages for a full analysis at `tier`.
pub fn build_messages(
    tier: QualityTier,
    file_path: &str,
    content: &str,
    language: &str,
) -> Vec<Message> {
    let user = match tier {
        QualityTier::Lite => format!(
            "Analyze this {language} file and return a JSON object with exactly these fields:\n\n\
             {LITE_SCHEMA}\n\n{CONFIG_RULES}\n\n\
             File path: {file_path}\n\n```{language}\n{content}\n```"
        ),
        QualityTier::Normal => format!(
            "Analyze this {language} file and return a JSON object with exactly these fields:\n\n\
             {NORMAL_SCHEMA}\n\n{DEPENDENCY_RULES}\n\n{CONFIG_RULES}\n\n\
             Omit empty arrays. Set line numbers to 0 if unknown.\n\n\
             File path: {file_path}\n\n```{language}\n{content}\n```"
        ),
        QualityTier::Max => format!(
            "Perform a thorough analysis of this {language} file and return a JSON object \
             with exactly these fields:\n\n\
             {MAX_SCHEMA}\n\n{DEPENDENCY_RULES}\n\n{CONFIG_RULES}\n\n\
             Include all functions, methods, types, and significant constants. \
             Omit empty arrays. Set line numbers to 0 if unknown.\n\n\
             File path: {file_path}\n\n```{language}\n{content}\n```"
        ),
    };

    vec![Message::system(SYSTEM_PROMPT), Message::user(user)]
}

/// Minimal two-field prompt used as the last service call for a file.
pub fn build_fallback_messages(file_path: &str, content: &str) -> Vec<Message> {
    let user = format!(
        "Summarize this source code file in 2-3 sentences. \
         Return JSON: {{\"summary\": \"...\", \"purpose\": \"...\"}}\n\n\
         File path: {file_path}\n\n```\n{content}\n```"
    );
    vec![Message::system(SYSTEM_PROMPT), Message::user(user)]
}
