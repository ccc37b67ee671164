//! The gardener of the knowledge graph: periodic strength decay, pruning of
//! edges that fell below the survival line, orphan cleanup, manual alias
//! merging, and (optional, off by default) LLM conflict arbitration.

use crate::config::GraphConfig;
use crate::embedding::cosine_similarity;
use crate::error::MemoryError;
use crate::llm::provider::{LlmParams, LlmProvider, Message};
use crate::llm::strip_code_fences;
use crate::memory::resolver::{entity_id, AliasMap};
use crate::storage::{RelationEdge, StorageDriver};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Default, Deserialize)]
struct ArbitrationDecision {
    #[serde(default)]
    keep: Vec<String>,
    #[serde(default)]
    delete: Vec<String>,
}

#[derive(Debug, Default)]
pub struct MaintenanceReport {
    pub decayed: u64,
    pub pruned: u64,
    pub orphans_removed: u64,
    pub conflicts_resolved: u64,
}

pub struct GraphCurator {
    driver: Arc<StorageDriver>,
    aliases: Arc<AliasMap>,
    llm: Option<Arc<dyn LlmProvider>>,
    config: GraphConfig,
}

impl GraphCurator {
    pub fn new(
        driver: Arc<StorageDriver>,
        aliases: Arc<AliasMap>,
        llm: Option<Arc<dyn LlmProvider>>,
        config: GraphConfig,
    ) -> Self {
        Self {
            driver,
            aliases,
            llm,
            config,
        }
    }

    /// Subscribe to the global ticker and run maintenance every
    /// `curator_interval_secs`, spawned off the tick handler.
    pub fn spawn(self: Arc<Self>, ticker: &crate::ticker::Ticker) -> tokio::task::JoinHandle<()> {
        let mut rx = ticker.subscribe();
        let interval = self.config.curator_interval_secs as i64;
        tokio::spawn(async move {
            let mut last_run: Option<chrono::DateTime<chrono::Utc>> = None;
            loop {
                let now = match rx.recv().await {
                    Ok(now) => now,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let due = last_run
                    .map(|t| (now - t).num_seconds() >= interval)
                    .unwrap_or(true);
                if !due {
                    continue;
                }
                last_run = Some(now);
                let curator = self.clone();
                tokio::spawn(async move {
                    curator.run_maintenance().await;
                });
            }
        })
    }

    pub async fn run_maintenance(&self) -> MaintenanceReport {
        self.run_maintenance_at(chrono::Utc::now().timestamp()).await
    }

    pub async fn run_maintenance_at(&self, now: i64) -> MaintenanceReport {
        info!("[Curator] Starting graph curation");
        let mut report = MaintenanceReport::default();

        match self
            .driver
            .decay_all_edges(
                self.config.edge_daily_decay_factor,
                self.config.decay_strength_floor,
            )
            .await
        {
            Ok(count) => report.decayed = count,
            Err(e) => error!("[Curator] Decay pass failed: {}", e),
        }

        match self.prune_weak_edges(now).await {
            Ok(count) => report.pruned = count,
            Err(e) => error!("[Curator] Pruning failed: {}", e),
        }

        match self.prune_orphan_edges().await {
            Ok(count) => report.orphans_removed = count,
            Err(e) => error!("[Curator] Orphan sweep failed: {}", e),
        }

        if self.config.conflict_arbitration_enabled {
            match self.detect_and_resolve_conflicts().await {
                Ok(count) => report.conflicts_resolved = count,
                Err(e) => error!("[Curator] Arbitration failed: {}", e),
            }
        }

        info!(
            "[Curator] Curation done: {} pruned, {} orphans, {} conflicts",
            report.pruned, report.orphans_removed, report.conflicts_resolved
        );
        report
    }

    /// Delete edges whose time-decayed strength fell below the survival
    /// threshold.
    pub async fn prune_weak_edges(&self, now: i64) -> Result<u64, MemoryError> {
        let edges = self.driver.all_edges().await?;
        let doomed: Vec<String> = edges
            .into_iter()
            .filter(|e| {
                e.effective_strength(now, self.config.edge_daily_decay_factor)
                    < self.config.edge_survival_threshold
            })
            .map(|e| e.id)
            .collect();

        if doomed.is_empty() {
            return Ok(0);
        }
        self.driver.delete_edges(&doomed).await
    }

    /// Edges whose endpoints vanished (deleted alias nodes, failed writes)
    /// are removed; writers self-heal by re-upserting on the next mention.
    pub async fn prune_orphan_edges(&self) -> Result<u64, MemoryError> {
        let orphans = self.driver.orphan_edge_ids().await?;
        if orphans.is_empty() {
            return Ok(0);
        }
        self.driver.delete_edges(&orphans).await
    }

    /// Manual trigger: fold every aliased entity into its canonical node,
    /// migrating all edge references. Returns (merged count, log lines).
    pub async fn merge_entity_duplicates(&self) -> Result<(usize, Vec<String>), MemoryError> {
        let mut merged = 0;
        let mut logs = Vec::new();
        let mut log = |msg: String| {
            info!("{}", msg);
            logs.push(msg);
        };

        log("[Merge] Starting manual entity merge...".to_string());
        self.aliases.reload();
        let pairs = self.aliases.pairs();
        if pairs.is_empty() {
            log("[Merge] No aliases defined in config.".to_string());
            return Ok((0, logs));
        }

        let now = chrono::Utc::now().timestamp();
        for (alias, canonical) in pairs {
            let alias_node = match self.driver.find_entity_by_name_ci(&alias).await? {
                Some(id) => id,
                None => {
                    let fallback = entity_id(&alias);
                    if self.driver.get_entity(&fallback).await?.is_none() {
                        log(format!("[Merge] Alias '{}' not found in DB. Skipping.", alias));
                        continue;
                    }
                    fallback
                }
            };

            let canonical_node = match self.driver.find_entity_by_name_ci(&canonical).await? {
                Some(id) => id,
                None => {
                    let id = entity_id(&canonical);
                    self.driver
                        .upsert_entity(&id, &canonical, None, "general", now)
                        .await?;
                    id
                }
            };

            if alias_node == canonical_node {
                continue;
            }

            log(format!("[Merge] Merging {} -> {}...", alias_node, canonical_node));
            self.driver
                .repoint_entity_refs(&alias_node, &canonical_node)
                .await?;
            self.driver.delete_entity(&alias_node).await?;
            log(format!("[Merge] Merged entity: {} -> {}", alias, canonical));
            merged += 1;
        }

        Ok((merged, logs))
    }

    /// Soft-conflict resolution: per subject, greedily cluster edges whose
    /// context embeddings overlap (cosine ≥ threshold), then let the LLM
    /// decide which of each cluster survives.
    pub async fn detect_and_resolve_conflicts(&self) -> Result<u64, MemoryError> {
        let llm = match self.llm {
            Some(ref l) => l.clone(),
            None => return Ok(0),
        };

        let mut resolved = 0u64;
        let edges = self.driver.all_edges().await?;

        let mut by_subject: std::collections::HashMap<String, Vec<RelationEdge>> =
            std::collections::HashMap::new();
        for edge in edges.into_iter().filter(|e| e.embedding.is_some()) {
            by_subject.entry(edge.in_id.clone()).or_default().push(edge);
        }

        for (subject, subject_edges) in by_subject {
            if subject_edges.len() < 2 {
                continue;
            }
            for cluster in cluster_edges(&subject_edges, self.config.arbitration_cluster_threshold)
            {
                if cluster.len() < 2 {
                    continue;
                }
                info!(
                    "[Curator] Conflict (semantic): {} has {} edges on a similar topic",
                    subject,
                    cluster.len()
                );
                let decision = self.arbitrate_batch(&llm, &cluster).await;
                let ids: Vec<String> = decision
                    .delete
                    .into_iter()
                    .filter(|id| cluster.iter().any(|e| e.id == *id))
                    .collect();
                resolved += self.driver.delete_edges(&ids).await?;
            }
        }

        Ok(resolved)
    }

    async fn arbitrate_batch(
        &self,
        llm: &Arc<dyn LlmProvider>,
        cluster: &[&RelationEdge],
    ) -> ArbitrationDecision {
        let candidates = cluster
            .iter()
            .map(|e| {
                format!(
                    "ID: {}\nFact: {} {} {}\nContext: \"{}\"\nLast mentioned: {}\nStrength: {:.2}",
                    e.id, e.in_id, e.relation_type, e.out_id, e.context, e.last_mentioned,
                    e.base_strength
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let prompt = format!(
            "You are the memory arbitrator for an AI. {} semantically related \
             relationships were recorded for the same entity.\n\n\
             Candidates:\n{}\n\n\
             Task:\n\
             1. Deduplicate: if several facts say substantially the same thing, keep only the \
             strongest/most precise one and mark the rest for deletion.\n\
             2. Resolve conflicts: if facts contradict, keep the truth based on recency and \
             context; mark outdated facts for deletion.\n\
             3. Complementary facts are all kept.\n\n\
             Output JSON only:\n{{\"keep\": [\"edge_id\", ...], \"delete\": [\"edge_id\", ...]}}",
            cluster.len(),
            candidates
        );

        let messages = vec![
            Message::system("Output JSON only."),
            Message::user(prompt),
        ];
        match llm.chat(messages, Some(LlmParams::json())).await {
            Ok(response) => {
                match serde_json::from_str::<ArbitrationDecision>(strip_code_fences(&response)) {
                    Ok(decision) => decision,
                    Err(e) => {
                        warn!("[Curator] Arbitration parse failed: {}", e);
                        ArbitrationDecision::default()
                    }
                }
            }
            Err(e) => {
                warn!("[Curator] Arbitration call failed: {}", e);
                ArbitrationDecision::default()
            }
        }
    }
}

/// Greedy clustering of edges by context-embedding similarity.
fn cluster_edges<'a>(edges: &'a [RelationEdge], threshold: f32) -> Vec<Vec<&'a RelationEdge>> {
    let mut clusters: Vec<Vec<&RelationEdge>> = Vec::new();
    let mut pool: Vec<&RelationEdge> = edges.iter().collect();

    while !pool.is_empty() {
        let seed = pool.remove(0);
        let seed_vec = match seed.embedding.as_ref() {
            Some(v) => v,
            None => continue,
        };
        let mut cluster = vec![seed];
        let mut rest = Vec::new();

        for candidate in pool {
            match candidate.embedding.as_ref() {
                Some(cand_vec) if cosine_similarity(seed_vec, cand_vec) >= threshold => {
                    cluster.push(candidate);
                }
                _ => rest.push(candidate),
            }
        }

        clusters.push(cluster);
        pool = rest;
    }

    clusters
}
