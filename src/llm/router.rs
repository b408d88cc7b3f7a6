//! Client routing: primary/fallback dispatch and hierarchy prediction.
//!
//! The router owns the configured primary and fallback clients. Callers ask
//! for a client by type name (loose substring match, primary on miss), and
//! the chat layer asks for the fallback when a stream dies.
//!
//! Hierarchy prediction is the router's second job: given a query and a
//! document's section paths, ask the model which section the query most
//! likely targets. The answer narrows dense search; any failure degrades to
//! "no prediction" and never surfaces to the caller.

use std::sync::Arc;

use super::{ChatRequest, LlmClient};

/// Candidate sections offered to the prediction prompt at most.
const MAX_CANDIDATE_HIERARCHIES: usize = 20;

/// Primary/fallback client pair with type-name dispatch.
pub struct LlmRouter {
    primary: Arc<dyn LlmClient>,
    fallback: Option<Arc<dyn LlmClient>>,
}

impl LlmRouter {
    pub fn new(primary: Arc<dyn LlmClient>, fallback: Option<Arc<dyn LlmClient>>) -> Self {
        Self { primary, fallback }
    }

    /// The configured primary client.
    pub fn primary(&self) -> Arc<dyn LlmClient> {
        self.primary.clone()
    }

    /// Look up a client by type name. Matching is a loose substring check
    /// against each client's kind; unknown or empty names fall back to the
    /// primary so callers never receive nothing.
    pub fn get_client(&self, kind: Option<&str>) -> Arc<dyn LlmClient> {
        let Some(kind) = kind.map(str::trim).filter(|k| !k.is_empty()) else {
            return self.primary();
        };
        let wanted = kind.to_lowercase();

        for client in self.clients() {
            let have = client.kind().to_lowercase();
            if have.contains(&wanted) || wanted.contains(&have) {
                return client;
            }
        }
        tracing::warn!(kind, "LLM client type not found, using primary");
        self.primary()
    }

    /// The fallback for `current`, or `current` itself when no distinct
    /// fallback is configured.
    pub fn fallback_for(&self, current: &Arc<dyn LlmClient>) -> Arc<dyn LlmClient> {
        match &self.fallback {
            Some(fallback) if !Arc::ptr_eq(fallback, current) => fallback.clone(),
            _ => current.clone(),
        }
    }

    fn clients(&self) -> Vec<Arc<dyn LlmClient>> {
        let mut clients = vec![self.primary.clone()];
        if let Some(fallback) = &self.fallback {
            clients.push(fallback.clone());
        }
        clients
    }

    /// Predict which hierarchy path a query targets.
    ///
    /// Returns the first candidate that fuzzily matches the model's reply
    /// (containment either way after quote stripping), or `None` — including
    /// on any model failure, which is logged and swallowed.
    pub async fn predict_hierarchy(
        &self,
        query: &str,
        hierarchies: &[String],
    ) -> Option<String> {
        if hierarchies.is_empty() {
            return None;
        }

        let prompt = build_router_prompt(query, hierarchies);
        let mut client = self.primary();
        if !client.is_available() {
            client = self.fallback_for(&client);
        }

        let request = ChatRequest::single(prompt, 50, 0.0);
        // temperature 0 on purpose: routing must be reproducible
        let response = match client.chat(&request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "hierarchy prediction failed");
                return None;
            }
        };

        let answer = response.trim().replace(['"', '\''], "");
        let answer = answer.trim();
        if answer.is_empty() || answer.eq_ignore_ascii_case("NONE") {
            return None;
        }

        hierarchies
            .iter()
            .find(|h| h.contains(answer) || answer.contains(h.as_str()))
            .cloned()
    }
}

fn build_router_prompt(query: &str, hierarchies: &[String]) -> String {
    let mut prompt = String::from(
        "You are a query router. Given a User Query and a list of Document Hierarchies, \
         predict which hierarchy best matches the query intent.\n\
         Return ONLY the exact string of the matching hierarchy (or the most specific part). \
         If no specific hierarchy matches, return 'NONE'.\n\nHierarchies:\n",
    );
    for hierarchy in hierarchies.iter().take(MAX_CANDIDATE_HIERARCHIES) {
        prompt.push_str("- ");
        prompt.push_str(hierarchy);
        prompt.push('\n');
    }
    prompt.push_str("\nUser Query: ");
    prompt.push_str(query);
    prompt.push_str("\nTarget Hierarchy:");
    prompt
}
