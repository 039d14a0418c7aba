//! Nutrition lookup by food name
//!
//! All lookups return per-100 g values and answer `None` on a miss. Transport
//! and parse failures surface through [`NutritionLookup::try_lookup`] and are
//! logged and reported as a miss by [`NutritionLookup::lookup`]; the pipeline
//! substitutes zeros either way. Only definite answers are cached.

use crate::config::NutritionConfig;
use crate::error::{NutrilensError, Result};
use crate::types::NutritionFacts;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

/// Our nutrient key and the matching FoodData Central `nutrientName`
pub const USDA_NUTRIENT_NAMES: [(&str, &str); 7] = [
    ("calories", "Energy"),
    ("protein", "Protein"),
    ("fat", "Total lipid (fat)"),
    ("carbs", "Carbohydrate, by difference"),
    ("fiber", "Fiber, total dietary"),
    ("sugar", "Total sugars"),
    ("sodium", "Sodium, Na"),
];

/// Source of per-100 g nutrition facts
#[async_trait]
pub trait NutritionLookup: Send + Sync {
    /// Facts per 100 g for `food_name`, `None` on a miss or on failure
    async fn lookup(&self, food_name: &str) -> Option<NutritionFacts>;

    /// Like [`lookup`](Self::lookup) but keeps failures apart from misses.
    ///
    /// `Ok(None)` is a definite miss. Sources that cannot fail keep the default.
    ///
    /// # Errors
    /// - Transient source failures (transport, status, parse)
    async fn try_lookup(&self, food_name: &str) -> Result<Option<NutritionFacts>> {
        Ok(self.lookup(food_name).await)
    }
}

#[async_trait]
impl<L: NutritionLookup + ?Sized> NutritionLookup for Arc<L> {
    async fn lookup(&self, food_name: &str) -> Option<NutritionFacts> {
        (**self).lookup(food_name).await
    }

    async fn try_lookup(&self, food_name: &str) -> Result<Option<NutritionFacts>> {
        (**self).try_lookup(food_name).await
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    foods: Vec<SearchFood>,
}

#[derive(Debug, Deserialize)]
struct SearchFood {
    description: Option<String>,
    #[serde(default, rename = "foodNutrients")]
    food_nutrients: Vec<SearchNutrient>,
}

#[derive(Debug, Deserialize)]
struct SearchNutrient {
    #[serde(rename = "nutrientName")]
    nutrient_name: Option<String>,
    value: Option<f64>,
}

/// Parse a FoodData Central search response.
///
/// Only the first (most relevant) food is used. Every mapped nutrient is
/// present in the result, zero when the food does not report it.
///
/// # Errors
/// - Body is not a JSON search response
pub fn parse_usda_response(body: &str) -> Result<Option<NutritionFacts>> {
    let response: SearchResponse = serde_json::from_str(body)?;
    let Some(food) = response.foods.into_iter().next() else {
        return Ok(None);
    };

    let mut facts = NutritionFacts::new();
    for (key, _) in USDA_NUTRIENT_NAMES {
        facts.insert(key, 0.0);
    }
    for nutrient in &food.food_nutrients {
        let Some(name) = nutrient.nutrient_name.as_deref().map(str::trim) else {
            continue;
        };
        if let Some((key, _)) = USDA_NUTRIENT_NAMES
            .iter()
            .find(|(_, usda_name)| usda_name.eq_ignore_ascii_case(name))
        {
            facts.insert(*key, nutrient.value.unwrap_or(0.0));
        }
    }

    debug!(description = ?food.description, "Parsed USDA food");
    Ok(Some(facts))
}

/// USDA FoodData Central search client
#[derive(Debug, Clone)]
pub struct UsdaNutritionClient {
    client: Client,
    config: NutritionConfig,
}

impl UsdaNutritionClient {
    /// # Errors
    /// - HTTP client construction failures
    pub fn new(config: NutritionConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    #[must_use]
    pub fn has_api_key(&self) -> bool {
        self.config.api_key.is_some()
    }

    /// Search for `food_name`, surfacing errors instead of logging them
    ///
    /// # Errors
    /// - No API key configured
    /// - Transport failures or non-success status
    /// - Unparseable response body
    pub async fn search(&self, food_name: &str) -> Result<Option<NutritionFacts>> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| NutrilensError::nutrition("USDA_API_KEY is not set"))?;

        let response = self
            .client
            .get(&self.config.endpoint)
            .query(&[
                ("query", food_name),
                ("api_key", api_key),
                ("dataType", self.config.data_type.as_str()),
                ("pageSize", "1"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(NutrilensError::nutrition(format!(
                "USDA search for '{food_name}' returned HTTP {status}"
            )));
        }

        let body = response.text().await?;
        parse_usda_response(&body)
    }
}

#[async_trait]
impl NutritionLookup for UsdaNutritionClient {
    #[instrument(skip(self))]
    async fn lookup(&self, food_name: &str) -> Option<NutritionFacts> {
        match self.try_lookup(food_name).await {
            Ok(Some(facts)) => {
                info!("Nutrition found");
                Some(facts)
            },
            Ok(None) => {
                warn!("Food not found in USDA database");
                None
            },
            Err(e) => {
                warn!(error = %e, "USDA lookup failed");
                None
            },
        }
    }

    async fn try_lookup(&self, food_name: &str) -> Result<Option<NutritionFacts>> {
        if !self.has_api_key() {
            debug!("No USDA API key, skipping lookup");
            return Ok(None);
        }
        self.search(food_name).await
    }
}

/// In-memory table keyed by lowercased food name
#[derive(Debug, Clone, Default)]
pub struct StaticNutritionTable {
    entries: HashMap<String, NutritionFacts>,
}

impl StaticNutritionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_entry<S: AsRef<str>>(mut self, food_name: S, facts: NutritionFacts) -> Self {
        self.insert(food_name, facts);
        self
    }

    pub fn insert<S: AsRef<str>>(&mut self, food_name: S, facts: NutritionFacts) {
        self.entries.insert(normalize_name(food_name.as_ref()), facts);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse `{ "<food>": { "<nutrient>": number, ... }, ... }`
    ///
    /// # Errors
    /// - Malformed JSON
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: HashMap<String, NutritionFacts> = serde_json::from_str(json)?;
        let mut table = Self::new();
        for (name, facts) in raw {
            table.insert(name, facts);
        }
        Ok(table)
    }

    /// # Errors
    /// - File unreadable or malformed
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&contents)
    }
}

#[async_trait]
impl NutritionLookup for StaticNutritionTable {
    async fn lookup(&self, food_name: &str) -> Option<NutritionFacts> {
        self.entries.get(&normalize_name(food_name)).cloned()
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Default number of food names a [`CachedNutritionLookup`] remembers
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Memoises hits and definite misses of an inner lookup.
///
/// Failures of the inner lookup are never cached, so the next request retries.
pub struct CachedNutritionLookup<L> {
    inner: L,
    capacity: usize,
    cache: RwLock<HashMap<String, Option<NutritionFacts>>>,
}

impl<L> CachedNutritionLookup<L> {
    #[must_use]
    pub fn new(inner: L) -> Self {
        Self::with_capacity(inner, DEFAULT_CACHE_CAPACITY)
    }

    /// Cache holding at most `capacity` names; an arbitrary entry is evicted when full
    #[must_use]
    pub fn with_capacity(inner: L, capacity: usize) -> Self {
        Self {
            inner,
            capacity,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn cached_entries(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }
}

#[async_trait]
impl<L: NutritionLookup> NutritionLookup for CachedNutritionLookup<L> {
    async fn lookup(&self, food_name: &str) -> Option<NutritionFacts> {
        match self.try_lookup(food_name).await {
            Ok(facts) => facts,
            Err(e) => {
                warn!(food = %food_name, error = %e, "Nutrition lookup failed, not caching");
                None
            },
        }
    }

    async fn try_lookup(&self, food_name: &str) -> Result<Option<NutritionFacts>> {
        let key = normalize_name(food_name);
        if let Some(cached) = self.cache.read().await.get(&key) {
            debug!(food = %key, hit = cached.is_some(), "Nutrition cache hit");
            return Ok(cached.clone());
        }

        let result = self.inner.try_lookup(food_name).await?;
        if self.capacity > 0 {
            let mut cache = self.cache.write().await;
            if cache.len() >= self.capacity && !cache.contains_key(&key) {
                if let Some(evicted) = cache.keys().next().cloned() {
                    cache.remove(&evicted);
                }
            }
            cache.insert(key, result.clone());
        }
        Ok(result)
    }
}

/// Tries each lookup in order; the first hit wins
#[derive(Default)]
pub struct ChainedNutritionLookup {
    lookups: Vec<Arc<dyn NutritionLookup>>,
}

impl ChainedNutritionLookup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn then(mut self, lookup: Arc<dyn NutritionLookup>) -> Self {
        self.lookups.push(lookup);
        self
    }
}

#[async_trait]
impl NutritionLookup for ChainedNutritionLookup {
    async fn lookup(&self, food_name: &str) -> Option<NutritionFacts> {
        for lookup in &self.lookups {
            if let Some(facts) = lookup.lookup(food_name).await {
                return Some(facts);
            }
        }
        None
    }

    /// First hit wins; if nothing hits and any source failed, the failure is reported
    async fn try_lookup(&self, food_name: &str) -> Result<Option<NutritionFacts>> {
        let mut failure = None;
        for lookup in &self.lookups {
            match lookup.try_lookup(food_name).await {
                Ok(Some(facts)) => return Ok(Some(facts)),
                Ok(None) => {},
                Err(e) => failure = Some(e),
            }
        }
        failure.map_or(Ok(None), Err)
    }
}

/// A lookup that never finds anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoNutritionLookup;

#[async_trait]
impl NutritionLookup for NoNutritionLookup {
    async fn lookup(&self, _food_name: &str) -> Option<NutritionFacts> {
        None
    }
}
