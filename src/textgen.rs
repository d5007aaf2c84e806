//! Text-generation providers and the narrative prompt format.
//!
//! The narrative stage builds a deterministic prompt from an adviser's
//! known attributes (an instruction header followed by a `Facts:` block of
//! `key: value` lines) and hands it to a [`TextProvider`]. Two providers
//! exist:
//!
//! - **`openai`** — calls the chat completions API; the response text is
//!   used verbatim as the narrative.
//! - **`template`** — offline renderer that parses the `Facts:` block back
//!   out of the prompt and produces the standard profile sentence. Used
//!   for air-gapped runs and tests; output is fully deterministic.
//!
//! The provider is selected once at startup from configuration; per-call
//! branching on provider names does not happen anywhere else.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::NarrativeConfig;
use crate::retry::{classify_http_status, ProviderError};

/// Adviser attributes a narrative prompt is built from.
#[derive(Debug, Clone, Default)]
pub struct NarrativeFacts {
    pub name: String,
    pub city: Option<String>,
    pub state: Option<String>,
    /// Display CRD; synthetic `GEN_` keys are not interesting to readers.
    pub crd_number: Option<String>,
    pub sec_number: Option<String>,
    pub aum: Option<i64>,
    pub employee_count: Option<i64>,
    pub services: Option<String>,
    pub client_types: Option<String>,
}

const FACTS_HEADER: &str = "Facts:";

/// Build the deterministic generation prompt for one adviser.
///
/// Identical attributes always produce an identical prompt, so provider
/// responses are reproducible for providers that are themselves
/// deterministic.
pub fn build_prompt(facts: &NarrativeFacts) -> String {
    let mut lines = vec![
        "Write a single-paragraph professional profile of the following \
         registered investment adviser."
            .to_string(),
        "Use only the facts provided. Do not speculate or add disclaimers."
            .to_string(),
        String::new(),
        FACTS_HEADER.to_string(),
    ];

    let mut fact = |key: &str, value: Option<String>| {
        if let Some(v) = value {
            lines.push(format!("{}: {}", key, v));
        }
    };

    fact("name", Some(facts.name.clone()));
    fact("city", facts.city.clone());
    fact("state", facts.state.clone());
    fact("crd", facts.crd_number.clone());
    fact("sec", facts.sec_number.clone());
    fact("aum", facts.aum.filter(|v| *v > 0).map(|v| v.to_string()));
    fact(
        "employees",
        facts.employee_count.filter(|v| *v > 0).map(|v| v.to_string()),
    );
    fact("services", facts.services.clone());
    fact("clients", facts.client_types.clone());

    lines.join("\n")
}

/// Trait for text-generation providers.
#[async_trait]
pub trait TextProvider: Send + Sync {
    /// Provider/model identifier recorded as narrative provenance.
    fn name(&self) -> &str;

    /// Generate narrative text for one prompt. The returned text is used
    /// verbatim; an empty response is a permanent error.
    async fn generate_text(&self, prompt: &str) -> Result<String, ProviderError>;
}

/// Create the configured [`TextProvider`]. Called once at startup; a
/// missing credential or model is a fatal configuration error.
pub fn create_provider(config: &NarrativeConfig) -> Result<Box<dyn TextProvider>> {
    match config.provider.as_str() {
        "template" => Ok(Box::new(TemplateProvider)),
        "openai" => Ok(Box::new(OpenAiTextProvider::new(config)?)),
        other => bail!("Unknown text provider: {}", other),
    }
}

// ============ Template provider ============

/// Offline narrative renderer.
///
/// Parses the `Facts:` block back out of the prompt and composes the
/// standard profile sentence from whatever facts are present.
pub struct TemplateProvider;

#[async_trait]
impl TextProvider for TemplateProvider {
    fn name(&self) -> &str {
        "template"
    }

    async fn generate_text(&self, prompt: &str) -> Result<String, ProviderError> {
        let facts = parse_facts(prompt);

        let name = facts
            .get("name")
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                ProviderError::Permanent("prompt carries no firm name fact".to_string())
            })?;

        let mut parts = vec![format!("{} is a registered investment adviser", name)];

        let location: Vec<&str> = ["city", "state"]
            .iter()
            .filter_map(|k| facts.get(*k).map(|s| s.as_str()))
            .collect();
        if !location.is_empty() {
            parts.push(format!("located in {}", location.join(", ")));
        }

        let mut identifiers = Vec::new();
        if let Some(crd) = facts.get("crd") {
            identifiers.push(format!("CRD number {}", crd));
        }
        if let Some(sec) = facts.get("sec") {
            identifiers.push(format!("SEC file number {}", sec));
        }
        if !identifiers.is_empty() {
            parts.push(format!("with {}", identifiers.join(" and ")));
        }

        if let Some(aum) = facts.get("aum").and_then(|v| v.parse::<i64>().ok()) {
            if aum > 0 {
                parts.push(format!("managing {} in assets", format_usd(aum)));
            }
        }

        if let Some(employees) = facts.get("employees") {
            parts.push(format!("with {} employees", employees));
        }

        if let Some(services) = facts.get("services") {
            parts.push(format!(
                "offering services including {}",
                services.to_lowercase()
            ));
        }

        if let Some(clients) = facts.get("clients") {
            parts.push(format!("serving {}", clients.to_lowercase()));
        }

        let narrative = format!("{}.", parts.join(". ")).replace("..", ".");
        Ok(narrative)
    }
}

/// Extract `key: value` lines following the `Facts:` header.
fn parse_facts(prompt: &str) -> HashMap<String, String> {
    let mut facts = HashMap::new();
    let mut in_facts = false;

    for line in prompt.lines() {
        if line.trim() == FACTS_HEADER {
            in_facts = true;
            continue;
        }
        if !in_facts {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            let value = value.trim();
            if !value.is_empty() {
                facts.insert(key.trim().to_string(), value.to_string());
            }
        }
    }

    facts
}

/// Format a dollar amount the way the profile text reads:
/// `$1.8 billion`, `$450.0 million`, or `$750,000`.
pub fn format_usd(amount: i64) -> String {
    if amount >= 1_000_000_000 {
        format!("${:.1} billion", amount as f64 / 1_000_000_000.0)
    } else if amount >= 1_000_000 {
        format!("${:.1} million", amount as f64 / 1_000_000.0)
    } else {
        format!("${}", group_thousands(amount))
    }
}

fn group_thousands(amount: i64) -> String {
    let digits = amount.abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    if amount < 0 {
        format!("-{}", grouped)
    } else {
        grouped
    }
}

// ============ OpenAI provider ============

/// Text generation via the OpenAI chat completions API.
///
/// Requires `OPENAI_API_KEY` in the environment and `narrative.model` in
/// config. Errors are classified for the retry combinator: 429 rate
/// limits and 5xx/network faults retry, other client errors do not.
pub struct OpenAiTextProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiTextProvider {
    pub fn new(config: &NarrativeConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("narrative.model required for OpenAI provider"))?;

        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model,
        })
    }
}

#[async_trait]
impl TextProvider for OpenAiTextProvider {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate_text(&self, prompt: &str) -> Result<String, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.2,
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_http_status(status.as_u16(), detail));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

        let text = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|t| t.as_str())
            .map(|t| t.trim().to_string())
            .unwrap_or_default();

        if text.is_empty() {
            return Err(ProviderError::Permanent(
                "empty generation response".to_string(),
            ));
        }

        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_facts() -> NarrativeFacts {
        NarrativeFacts {
            name: "Acme Capital Management LLC".to_string(),
            city: Some("St. Louis".to_string()),
            state: Some("MO".to_string()),
            crd_number: Some("100001".to_string()),
            sec_number: Some("801-12345".to_string()),
            aum: Some(1_800_000_000),
            employee_count: Some(42),
            services: Some("Financial Planning, Pension Consulting".to_string()),
            client_types: Some("High net worth individuals".to_string()),
        }
    }

    #[test]
    fn prompt_is_deterministic() {
        let facts = full_facts();
        assert_eq!(build_prompt(&facts), build_prompt(&facts));
    }

    #[test]
    fn prompt_omits_absent_facts() {
        let facts = NarrativeFacts {
            name: "Acme Capital Management LLC".to_string(),
            ..Default::default()
        };
        let prompt = build_prompt(&facts);
        assert!(prompt.contains("name: Acme Capital Management LLC"));
        assert!(!prompt.contains("city:"));
        assert!(!prompt.contains("aum:"));
    }

    #[tokio::test]
    async fn template_renders_full_profile() {
        let prompt = build_prompt(&full_facts());
        let text = TemplateProvider.generate_text(&prompt).await.unwrap();

        assert!(text.starts_with(
            "Acme Capital Management LLC is a registered investment adviser"
        ));
        assert!(text.contains("located in St. Louis, MO"));
        assert!(text.contains("CRD number 100001"));
        assert!(text.contains("SEC file number 801-12345"));
        assert!(text.contains("managing $1.8 billion in assets"));
        assert!(text.contains("with 42 employees"));
        assert!(text.contains("offering services including financial planning"));
        assert!(text.contains("serving high net worth individuals"));
        assert!(text.ends_with('.'));
        assert!(!text.contains(".."));
    }

    #[tokio::test]
    async fn template_handles_sparse_facts() {
        let facts = NarrativeFacts {
            name: "Beacon Advisers".to_string(),
            ..Default::default()
        };
        let text = TemplateProvider
            .generate_text(&build_prompt(&facts))
            .await
            .unwrap();
        assert_eq!(
            text,
            "Beacon Advisers is a registered investment adviser."
        );
    }

    #[tokio::test]
    async fn template_requires_a_name() {
        let result = TemplateProvider.generate_text("Facts:\ncity: Nowhere").await;
        assert!(matches!(result, Err(ProviderError::Permanent(_))));
    }

    #[test]
    fn usd_formatting() {
        assert_eq!(format_usd(1_800_000_000), "$1.8 billion");
        assert_eq!(format_usd(450_000_000), "$450.0 million");
        assert_eq!(format_usd(750_000), "$750,000");
        assert_eq!(format_usd(999), "$999");
    }
}
