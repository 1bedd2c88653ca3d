//! Weighted round-robin region selection.
//!
//! Each queue owns a [`RegionWeightTable`]. The table is expanded into a
//! [`RotationList`] in which every region appears `weight` times (regions in
//! name order), and a per-queue cursor kept in a [`CursorStore`] walks that
//! list, wrapping around. Persisting the cursor keeps the split fair across
//! restarts.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{CycloneError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightDirective {
    /// Derive the weight from live spot-capacity scores.
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WeightSpec {
    Fixed(u32),
    Directive(WeightDirective),
}

impl WeightSpec {
    pub fn fixed(weight: u32) -> Self {
        WeightSpec::Fixed(weight)
    }

    pub fn auto() -> Self {
        WeightSpec::Directive(WeightDirective::Auto)
    }

    pub fn is_auto(&self) -> bool {
        matches!(self, WeightSpec::Directive(WeightDirective::Auto))
    }
}

/// Region weights of one queue. Deserializes from a map or from the legacy
/// single-string form accepted by [`RegionWeightTable::parse_legacy`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawWeightTable", into = "BTreeMap<String, WeightSpec>")]
pub struct RegionWeightTable(BTreeMap<String, WeightSpec>);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawWeightTable {
    Table(BTreeMap<String, WeightSpec>),
    Legacy(String),
}

impl TryFrom<RawWeightTable> for RegionWeightTable {
    type Error = CycloneError;

    fn try_from(raw: RawWeightTable) -> Result<Self> {
        match raw {
            RawWeightTable::Table(table) => Ok(Self(table)),
            RawWeightTable::Legacy(raw) => Self::parse_legacy(&raw),
        }
    }
}

impl From<RegionWeightTable> for BTreeMap<String, WeightSpec> {
    fn from(table: RegionWeightTable) -> Self {
        table.0
    }
}

impl RegionWeightTable {
    pub fn from_fixed<I, S>(weights: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        Self(
            weights
                .into_iter()
                .map(|(r, w)| (r.into(), WeightSpec::Fixed(w)))
                .collect(),
        )
    }

    /// Parse the legacy string form, e.g. `{'us-east-1': '3', "eu-west-1": 'auto'}`.
    pub fn parse_legacy(raw: &str) -> Result<Self> {
        let body = raw.trim().trim_start_matches('{').trim_end_matches('}');
        let mut table = BTreeMap::new();
        for entry in body.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (region, weight) = entry.split_once(':').ok_or_else(|| {
                CycloneError::Config(format!("region weight entry without ':' in {raw}"))
            })?;
            let unquote = |s: &str| s.trim().trim_matches(|c: char| c == '\'' || c == '"').to_string();
            let region = unquote(region);
            let weight = unquote(weight);
            let spec = if weight.eq_ignore_ascii_case("auto") {
                WeightSpec::auto()
            } else {
                let value = weight.parse::<u32>().map_err(|_| {
                    CycloneError::Config(format!("unparsable weight {weight:?} for {region}"))
                })?;
                WeightSpec::Fixed(value)
            };
            table.insert(region, spec);
        }
        Ok(Self(table))
    }

    pub fn insert(&mut self, region: impl Into<String>, spec: WeightSpec) {
        self.0.insert(region.into(), spec);
    }

    pub fn get(&self, region: &str) -> Option<&WeightSpec> {
        self.0.get(region)
    }

    pub fn regions(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has_auto(&self) -> bool {
        self.0.values().any(WeightSpec::is_auto)
    }

    /// Turn the table into integer weights, asking `scorer` for the regions
    /// marked `auto`. Scoring failures fall back to weight 1 per auto region.
    pub async fn resolve(&self, scorer: Option<&dyn CapacityScorer>) -> BTreeMap<String, u32> {
        let auto: Vec<String> = self
            .0
            .iter()
            .filter(|(_, spec)| spec.is_auto())
            .map(|(region, _)| region.clone())
            .collect();

        let mut scored = match (auto.is_empty(), scorer) {
            (true, _) => BTreeMap::new(),
            (false, Some(scorer)) => match scorer.placement_scores(&auto).await {
                Ok(scores) => weights_from_scores(&scores),
                Err(e) => {
                    tracing::warn!(error = %e, "Capacity scoring failed, using default weights");
                    BTreeMap::new()
                }
            },
            (false, None) => BTreeMap::new(),
        };

        self.0
            .iter()
            .map(|(region, spec)| {
                let weight = match spec {
                    WeightSpec::Fixed(w) => *w,
                    WeightSpec::Directive(WeightDirective::Auto) => {
                        scored.remove(region).unwrap_or(1)
                    }
                };
                (region.clone(), weight)
            })
            .collect()
    }
}

/// Square each score and divide by the smallest square, so the least
/// attractive region gets weight 1.
pub fn weights_from_scores(scores: &BTreeMap<String, u32>) -> BTreeMap<String, u32> {
    let squared: BTreeMap<&String, u64> = scores
        .iter()
        .filter(|(_, s)| **s > 0)
        .map(|(r, s)| (r, u64::from(*s) * u64::from(*s)))
        .collect();
    let Some(min) = squared.values().copied().min() else {
        return BTreeMap::new();
    };
    squared
        .into_iter()
        .map(|(r, sq)| (r.clone(), (sq / min) as u32))
        .collect()
}

/// Source of live spot-capacity placement scores (1 to 10 per region).
#[async_trait]
pub trait CapacityScorer: Send + Sync {
    async fn placement_scores(&self, regions: &[String]) -> Result<BTreeMap<String, u32>>;
}

/// The weighted, repeated sequence of regions consumed round-robin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationList {
    slots: Vec<String>,
}

impl RotationList {
    pub fn from_weights(weights: &BTreeMap<String, u32>) -> Self {
        let slots = weights
            .iter()
            .flat_map(|(region, w)| std::iter::repeat(region.clone()).take(*w as usize))
            .collect();
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn region_at(&self, cursor: u64) -> Option<&str> {
        if self.slots.is_empty() {
            return None;
        }
        let idx = (cursor % self.slots.len() as u64) as usize;
        Some(self.slots[idx].as_str())
    }
}

/// Durable home of the per-queue rotation cursors.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self, queue: &str) -> Result<Option<u64>>;
    async fn save(&self, queue: &str, cursor: u64) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<HashMap<String, u64>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, queue: &str) -> Result<Option<u64>> {
        let cursors = self
            .cursors
            .lock()
            .map_err(|_| CycloneError::StoreUnavailable("cursor store lock poisoned".into()))?;
        Ok(cursors.get(queue).copied())
    }

    async fn save(&self, queue: &str, cursor: u64) -> Result<()> {
        let mut cursors = self
            .cursors
            .lock()
            .map_err(|_| CycloneError::StoreUnavailable("cursor store lock poisoned".into()))?;
        cursors.insert(queue.to_string(), cursor);
        Ok(())
    }
}

/// Region selection for every configured queue.
pub struct RegionRotation {
    tables: BTreeMap<String, RegionWeightTable>,
    scorer: Option<Arc<dyn CapacityScorer>>,
    cursors: Arc<dyn CursorStore>,
    lists: Mutex<HashMap<String, RotationList>>,
}

impl RegionRotation {
    pub fn new(tables: BTreeMap<String, RegionWeightTable>, cursors: Arc<dyn CursorStore>) -> Self {
        Self {
            tables,
            scorer: None,
            cursors,
            lists: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn CapacityScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Drop the resolved lists of queues with `auto` weights so they are
    /// re-scored on next use. Fixed lists are kept.
    pub fn refresh(&self) {
        let tables = &self.tables;
        if let Ok(mut lists) = self.lists.lock() {
            lists.retain(|queue, _| !tables.get(queue).is_some_and(RegionWeightTable::has_auto));
        }
    }

    async fn list_for(&self, queue: &str) -> Result<RotationList> {
        if let Some(list) = self.lists.lock().ok().and_then(|l| l.get(queue).cloned()) {
            return Ok(list);
        }
        let table = self
            .tables
            .get(queue)
            .ok_or_else(|| CycloneError::Config(format!("no region weights for queue {queue}")))?;
        let weights = table.resolve(self.scorer.as_deref()).await;
        let list = RotationList::from_weights(&weights);
        if list.is_empty() {
            return Err(CycloneError::Config(format!(
                "rotation list of queue {queue} is empty (all weights zero)"
            )));
        }
        tracing::debug!(queue, rotation = ?list.slots, "Region rotation resolved");
        if let Ok(mut lists) = self.lists.lock() {
            lists.insert(queue.to_string(), list.clone());
        }
        Ok(list)
    }

    /// Advance the queue's cursor and return the region it lands on.
    pub async fn next_region(&self, queue: &str) -> Result<String> {
        let list = self.list_for(queue).await?;
        let cursor = match self.cursors.load(queue).await? {
            Some(cursor) => cursor,
            None => rand::thread_rng().gen_range(0..list.len() as u64),
        };
        let region = list
            .region_at(cursor)
            .ok_or_else(|| CycloneError::Config(format!("empty rotation for queue {queue}")))?
            .to_string();
        self.cursors.save(queue, cursor.wrapping_add(1)).await?;
        Ok(region)
    }
}
