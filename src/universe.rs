// =============================================================================
// Universe Selector (C3) -- TTL-cached ranking of tradable perpetuals
// =============================================================================

use std::time::{Duration, Instant};

use anyhow::Result;
use parking_lot::RwLock;
use tracing::info;

use crate::exchange::ExchangeClient;

/// Cache validity window for the selected universe.
pub const VOLUME_REFRESH_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);
/// Hard cap on the number of symbols carried into the pipeline.
pub const MAX_SELECTED_SYMBOLS: usize = 80;

struct CacheEntry {
    symbols: Vec<String>,
    fetched_at: Instant,
}

/// Caches the top symbols by 24h quote volume, refreshed on TTL expiry.
pub struct UniverseSelector {
    cache: RwLock<Option<CacheEntry>>,
}

impl UniverseSelector {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(None),
        }
    }

    /// Return the cached universe, refreshing it first if the TTL has
    /// elapsed. An empty universe (no perpetuals, or an exchangeInfo
    /// failure) is still cached, so repeated calls don't hammer the
    /// exchange when markets are unavailable.
    pub async fn get(&self, client: &ExchangeClient) -> Result<Vec<String>> {
        let needs_refresh = {
            let guard = self.cache.read();
            match guard.as_ref() {
                Some(entry) => entry.fetched_at.elapsed() >= VOLUME_REFRESH_INTERVAL,
                None => true,
            }
        };

        if needs_refresh {
            let symbols = self.refresh(client).await?;
            let mut guard = self.cache.write();
            *guard = Some(CacheEntry {
                symbols: symbols.clone(),
                fetched_at: Instant::now(),
            });
            return Ok(symbols);
        }

        Ok(self.cache.read().as_ref().expect("checked above").symbols.clone())
    }

    async fn refresh(&self, client: &ExchangeClient) -> Result<Vec<String>> {
        let perpetuals = client.list_perpetuals().await?;
        let volumes = client.get_24h_quote_volumes().await?;

        let mut ranked: Vec<(String, f64)> = perpetuals
            .into_iter()
            .filter_map(|(symbol, _filters)| {
                let vol = *volumes.get(&symbol)?;
                Some((symbol, vol))
            })
            .collect();

        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let total = ranked.len();
        let take = MAX_SELECTED_SYMBOLS.min(total.div_ceil(2));

        let selected: Vec<String> = ranked.into_iter().take(take).map(|(s, _)| s).collect();
        info!(total, selected = selected.len(), "universe refreshed");
        Ok(selected)
    }
}

impl Default for UniverseSelector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rank_and_take(volumes: &[(&str, f64)]) -> Vec<String> {
        let mut ranked: Vec<(String, f64)> =
            volumes.iter().map(|(s, v)| (s.to_string(), *v)).collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        let take = MAX_SELECTED_SYMBOLS.min(ranked.len().div_ceil(2));
        ranked.into_iter().take(take).map(|(s, _)| s).collect()
    }

    #[test]
    fn takes_half_rounded_up_when_under_cap() {
        let volumes = [("A", 3.0), ("B", 1.0), ("C", 2.0)];
        let top = rank_and_take(&volumes);
        assert_eq!(top, vec!["A".to_string(), "C".to_string()]);
    }

    #[test]
    fn caps_at_max_selected_symbols() {
        let volumes: Vec<(&str, f64)> = (0..200)
            .map(|i| (Box::leak(format!("S{i}").into_boxed_str()) as &str, i as f64))
            .collect();
        let top = rank_and_take(&volumes);
        assert_eq!(top.len(), MAX_SELECTED_SYMBOLS);
    }
}
