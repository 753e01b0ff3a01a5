//! Batch product classification against the catalog taxonomy.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use dealhunt_core::BrandTier;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

/// Largest batch a single classifier call accepts.
pub const MAX_BATCH: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationInput {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub category_slug: String,
    pub subcategory_slug: Option<String>,
    pub subsubcategory_slug: Option<String>,
    pub brand_tier: BrandTier,
    pub refined_title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyNode {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub children: Vec<TaxonomyNode>,
}

/// Categories → subcategories → sub-subcategories, plus the tier rubric
/// handed to the classifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taxonomy {
    pub categories: Vec<TaxonomyNode>,
    #[serde(default)]
    pub brand_tier_rubric: String,
}

impl Taxonomy {
    /// True when the slug path exists; `None` levels are not checked.
    pub fn contains(&self, category: &str, sub: Option<&str>, subsub: Option<&str>) -> bool {
        let Some(cat) = self.categories.iter().find(|c| c.slug == category) else {
            return false;
        };
        let Some(sub) = sub else {
            return subsub.is_none();
        };
        let Some(sub_node) = cat.children.iter().find(|c| c.slug == sub) else {
            return false;
        };
        match subsub {
            Some(leaf) => sub_node.children.iter().any(|c| c.slug == leaf),
            None => true,
        }
    }

    /// Indented slug outline used in the classifier prompt.
    pub fn outline(&self) -> String {
        fn walk(out: &mut String, nodes: &[TaxonomyNode], depth: usize) {
            for node in nodes {
                out.push_str(&"  ".repeat(depth));
                out.push_str(&format!("- {} ({})\n", node.slug, node.name));
                walk(out, &node.children, depth + 1);
            }
        }
        let mut out = String::new();
        walk(&mut out, &self.categories, 0);
        out
    }
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("classifier returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("classifier response unreadable: {0}")]
    Decode(String),
    #[error("{0}")]
    Message(String),
}

/// Outcome of one classifier call. A failed batch is fatal to every record
/// in it.
#[derive(Debug)]
pub enum BatchResult {
    /// Classifications keyed by the input's position in the batch. Inputs
    /// the classifier skipped are absent.
    Classified(BTreeMap<usize, Classification>),
    Failed(ClassifierError),
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify_batch(&self, inputs: &[ClassificationInput], taxonomy: &Taxonomy)
        -> BatchResult;
}

#[derive(Debug, Deserialize)]
struct ItemsEnvelope {
    items: Vec<RawItem>,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    index: usize,
    category_slug: Option<String>,
    #[serde(default)]
    subcategory_slug: Option<String>,
    #[serde(default)]
    subsubcategory_slug: Option<String>,
    brand_tier: Option<i64>,
    #[serde(default)]
    refined_title: Option<String>,
}

/// Reads the `{"items": [...]}` payload, dropping entries whose index is
/// outside the batch, whose tier is not 1-3 or whose slug path is not in
/// the taxonomy.
pub fn parse_classifier_content(
    content: &str,
    inputs: &[ClassificationInput],
    taxonomy: &Taxonomy,
) -> Result<BTreeMap<usize, Classification>, ClassifierError> {
    let envelope: ItemsEnvelope =
        serde_json::from_str(content).map_err(|e| ClassifierError::Decode(e.to_string()))?;
    let batch_len = inputs.len();
    let mut out = BTreeMap::new();
    for item in envelope.items {
        if item.index >= batch_len {
            warn!(index = item.index, batch_len, "classifier index out of range");
            continue;
        }
        let Some(tier) = item
            .brand_tier
            .and_then(|t| u8::try_from(t).ok())
            .and_then(BrandTier::from_rank)
        else {
            warn!(index = item.index, tier = ?item.brand_tier, "classifier tier invalid");
            continue;
        };
        let Some(category_slug) = item.category_slug.filter(|s| !s.trim().is_empty()) else {
            continue;
        };
        let subcategory_slug = item.subcategory_slug.filter(|s| !s.is_empty());
        let subsubcategory_slug = item.subsubcategory_slug.filter(|s| !s.is_empty());
        if !taxonomy.contains(
            &category_slug,
            subcategory_slug.as_deref(),
            subsubcategory_slug.as_deref(),
        ) {
            warn!(
                index = item.index,
                category = %category_slug,
                subcategory = ?subcategory_slug,
                subsubcategory = ?subsubcategory_slug,
                "classifier answered outside the taxonomy"
            );
            continue;
        }
        let refined_title = item
            .refined_title
            .filter(|t| !t.trim().is_empty())
            .or_else(|| inputs.get(item.index).map(|i| i.name.clone()))
            .unwrap_or_default();
        out.insert(
            item.index,
            Classification {
                category_slug,
                subcategory_slug,
                subsubcategory_slug,
                brand_tier: tier,
                refined_title,
            },
        );
    }
    Ok(out)
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// OpenAI-compatible chat-completions classifier.
#[derive(Debug, Clone)]
pub struct LlmClassifier {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl LlmClassifier {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ClassifierError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        })
    }

    fn system_prompt(taxonomy: &Taxonomy) -> String {
        format!(
            "You classify beauty products for a deals catalog.\n\
             Use only these category slugs (category > subcategory > sub-subcategory):\n{}\n\
             Brand tiers: 1 = luxury, 2 = premium, 3 = mass market.\n{}\n\
             Reply with JSON {{\"items\": [{{\"index\", \"category_slug\", \"subcategory_slug\", \
             \"subsubcategory_slug\", \"brand_tier\", \"refined_title\"}}]}}, one item per input index.",
            taxonomy.outline(),
            taxonomy.brand_tier_rubric
        )
    }

    async fn request(
        &self,
        inputs: &[ClassificationInput],
        taxonomy: &Taxonomy,
    ) -> Result<BTreeMap<usize, Classification>, ClassifierError> {
        if inputs.len() > MAX_BATCH {
            return Err(ClassifierError::Message(format!(
                "batch of {} exceeds the {MAX_BATCH} item limit",
                inputs.len()
            )));
        }
        let indexed: Vec<_> = inputs
            .iter()
            .enumerate()
            .map(|(index, input)| json!({ "index": index, "name": input.name, "brand": input.brand, "volume": input.volume }))
            .collect();
        let body = json!({
            "model": self.model,
            "temperature": 0.0,
            "response_format": { "type": "json_object" },
            "messages": [
                ChatMessage { role: "system", content: Self::system_prompt(taxonomy) },
                ChatMessage { role: "user", content: json!({ "products": indexed }).to_string() },
            ],
        });

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| ClassifierError::Decode(e.to_string()))?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ClassifierError::Decode("no choices in response".into()))?;
        parse_classifier_content(&content, inputs, taxonomy)
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify_batch(
        &self,
        inputs: &[ClassificationInput],
        taxonomy: &Taxonomy,
    ) -> BatchResult {
        match self.request(inputs, taxonomy).await {
            Ok(map) => {
                debug!(requested = inputs.len(), classified = map.len(), "classifier batch done");
                BatchResult::Classified(map)
            }
            Err(err) => BatchResult::Failed(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(n: usize) -> Vec<ClassificationInput> {
        (0..n)
            .map(|i| ClassificationInput {
                name: format!("Produit {i}"),
                brand: None,
                volume: None,
            })
            .collect()
    }

    fn taxonomy() -> Taxonomy {
        Taxonomy {
            categories: vec![TaxonomyNode {
                slug: "parfum".into(),
                name: "Parfum".into(),
                children: vec![TaxonomyNode {
                    slug: "parfum-femme".into(),
                    name: "Parfum femme".into(),
                    children: vec![TaxonomyNode {
                        slug: "eau-de-parfum".into(),
                        name: "Eau de parfum".into(),
                        children: vec![],
                    }],
                }],
            }],
            brand_tier_rubric: String::new(),
        }
    }

    #[test]
    fn out_of_range_and_bad_tier_items_are_dropped() {
        let content = r#"{"items":[
            {"index":0,"category_slug":"parfum","subcategory_slug":"parfum-femme","brand_tier":1,"refined_title":"Libre EDP"},
            {"index":1,"category_slug":"parfum","brand_tier":4},
            {"index":7,"category_slug":"parfum","brand_tier":2},
            {"index":2,"category_slug":"parfum","brand_tier":3,"refined_title":""}
        ]}"#;
        let parsed = parse_classifier_content(content, &inputs(3), &taxonomy()).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[&0].brand_tier, BrandTier::Luxury);
        assert_eq!(parsed[&0].refined_title, "Libre EDP");
        assert_eq!(parsed[&2].refined_title, "Produit 2");
        assert!(!parsed.contains_key(&1));
    }

    #[test]
    fn slugs_outside_the_taxonomy_are_dropped() {
        let content = r#"{"items":[
            {"index":0,"category_slug":"parfum","subcategory_slug":"parfum-femme","subsubcategory_slug":"eau-de-parfum","brand_tier":1},
            {"index":1,"category_slug":"bougies","brand_tier":2},
            {"index":2,"category_slug":"parfum","subcategory_slug":"parfum-enfant","brand_tier":2},
            {"index":3,"category_slug":"parfum","subcategory_slug":"parfum-femme","subsubcategory_slug":"brume","brand_tier":1}
        ]}"#;
        let parsed = parse_classifier_content(content, &inputs(4), &taxonomy()).unwrap();
        assert_eq!(parsed.keys().copied().collect::<Vec<_>>(), vec![0]);
        assert_eq!(parsed[&0].subsubcategory_slug.as_deref(), Some("eau-de-parfum"));
    }

    #[test]
    fn malformed_content_is_a_decode_error() {
        let err = parse_classifier_content("not json", &inputs(1), &taxonomy()).unwrap_err();
        assert!(matches!(err, ClassifierError::Decode(_)));
    }

    #[test]
    fn taxonomy_paths_are_checked_level_by_level() {
        let t = taxonomy();
        assert!(t.contains("parfum", None, None));
        assert!(t.contains("parfum", Some("parfum-femme"), Some("eau-de-parfum")));
        assert!(!t.contains("parfum", Some("parfum-homme"), None));
        assert!(!t.contains("soin", None, None));
        assert!(t.outline().contains("    - eau-de-parfum (Eau de parfum)"));
    }
}
