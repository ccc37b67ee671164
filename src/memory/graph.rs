//! Knowledge-graph writes: relational triples with reinforcement semantics,
//! and insight nodes linked back to their supporting evidence edges.

use crate::embedding::Embedder;
use crate::error::MemoryError;
use crate::memory::resolver::{character_node_id, entity_id, insight_id, EntityResolver};
use crate::storage::StorageDriver;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// A structured fact lifted from dialogue: subject -[RELATION]-> object.
#[derive(Debug, Clone, Deserialize)]
pub struct KnowledgeTriple {
    pub subject: String,
    pub relation: String,
    pub object: String,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub context: Option<String>,
}

/// A higher-order conclusion distilled from repeated facts.
#[derive(Debug, Clone, Deserialize)]
pub struct InsightSpec {
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default = "default_confidence")]
    pub weight: f64,
}

fn default_confidence() -> f64 {
    0.5
}

/// Ties an insight to the fact edge it was derived from.
#[derive(Debug, Clone, Deserialize)]
pub struct EvidenceLink {
    pub insight_label: String,
    pub subject: String,
    pub relation: String,
    pub object: String,
}

pub struct GraphWriter {
    driver: Arc<StorageDriver>,
    resolver: EntityResolver,
    embedder: Option<Arc<dyn Embedder>>,
}

impl GraphWriter {
    pub fn new(
        driver: Arc<StorageDriver>,
        resolver: EntityResolver,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Self {
        Self {
            driver,
            resolver,
            embedder,
        }
    }

    /// Store a batch of triples. Per item: resolve both endpoints, upsert the
    /// nodes, then insert-or-reinforce the edge and link the observer.
    /// Individual failures are logged and skipped so one bad item never
    /// aborts the cycle.
    pub async fn add_knowledge_graph(&self, triples: &[KnowledgeTriple], observer_id: &str) {
        let now = chrono::Utc::now().timestamp();
        self.add_knowledge_graph_at(triples, observer_id, now).await;
    }

    pub async fn add_knowledge_graph_at(
        &self,
        triples: &[KnowledgeTriple],
        observer_id: &str,
        now: i64,
    ) {
        let observer = character_node_id(observer_id);

        for triple in triples {
            if let Err(e) = self.write_triple(triple, &observer, now).await {
                error!("[Graph] Graph update failed: {}", e);
            }
        }
        info!(
            "[Graph] Processed {} knowledge items for {}",
            triples.len(),
            observer_id
        );
    }

    async fn write_triple(
        &self,
        triple: &KnowledgeTriple,
        observer: &str,
        now: i64,
    ) -> Result<(), MemoryError> {
        let subject = triple.subject.trim();
        let object = triple.object.trim();
        let relation = triple.relation.trim().to_uppercase();
        if subject.is_empty() || object.is_empty() || relation.is_empty() {
            return Ok(());
        }

        let (subj_id, subj_emb) = self.resolver.resolve(subject).await?;
        let (obj_id, obj_emb) = self.resolver.resolve(object).await?;

        self.driver
            .upsert_entity(&subj_id, subject, subj_emb.as_deref(), "general", now)
            .await?;
        self.driver
            .upsert_entity(&obj_id, object, obj_emb.as_deref(), "general", now)
            .await?;

        let edge_id = match self.driver.find_edge(&subj_id, &relation, &obj_id).await? {
            Some(edge) => {
                self.driver.reinforce_edge(&edge.id, now).await?;
                edge.id
            }
            None => {
                let context = triple.context.as_deref().unwrap_or("");
                let context_emb = match (&self.embedder, context.is_empty()) {
                    (Some(embedder), false) => match embedder.embed(context).await {
                        Ok(v) => Some(v),
                        Err(e) => {
                            warn!("[Graph] Failed to embed edge context: {}", e);
                            None
                        }
                    },
                    _ => None,
                };
                self.driver
                    .insert_edge(
                        &subj_id,
                        &obj_id,
                        &relation,
                        context,
                        context_emb.as_deref(),
                        triple.weight.unwrap_or(0.5),
                        now,
                    )
                    .await?
            }
        };

        self.driver.link_observes(observer, &edge_id, now).await
    }

    /// Store insights and link each to the fact edges that support it.
    pub async fn add_insights(
        &self,
        insights: &[InsightSpec],
        evidence_chain: &[EvidenceLink],
        observer_id: &str,
    ) -> Result<(), MemoryError> {
        let now = chrono::Utc::now().timestamp();
        self.add_insights_at(insights, evidence_chain, observer_id, now)
            .await
    }

    pub async fn add_insights_at(
        &self,
        insights: &[InsightSpec],
        evidence_chain: &[EvidenceLink],
        observer_id: &str,
        now: i64,
    ) -> Result<(), MemoryError> {
        let observer = character_node_id(observer_id);

        for insight in insights {
            let label = insight.label.trim();
            if label.is_empty() {
                continue;
            }
            let node_id = insight_id(label);
            self.driver
                .upsert_insight(
                    &node_id,
                    label,
                    &insight.description,
                    insight.confidence,
                    insight.weight,
                    now,
                )
                .await?;
            self.driver.link_observes(&observer, &node_id, now).await?;
        }

        for evidence in evidence_chain {
            let relation = evidence.relation.trim().to_uppercase();
            if evidence.insight_label.trim().is_empty() || relation.is_empty() {
                continue;
            }
            let subj_id = entity_id(evidence.subject.trim());
            let obj_id = entity_id(evidence.object.trim());

            match self.driver.find_edge(&subj_id, &relation, &obj_id).await? {
                Some(edge) => {
                    let node_id = insight_id(evidence.insight_label.trim());
                    self.driver.link_derived_from(&node_id, &edge.id).await?;
                }
                None => {
                    warn!(
                        "[Graph] Evidence edge not found: {} -[{}]-> {}",
                        evidence.subject, relation, evidence.object
                    );
                }
            }
        }

        info!(
            "[Graph] Processed {} insights and linked evidence",
            insights.len()
        );
        Ok(())
    }
}
