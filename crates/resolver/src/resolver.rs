use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info};

use crate::history::{normalize_context, normalize_goal, HistoryError, SelectorHistory};
use crate::variants::{is_plain_ident, GoalVariants};

/// Shadow-DOM piercing delimiter understood by the page driver.
pub const SHADOW_PIERCE: &str = ">>>";

/// What the caller intends to do with the element; shapes the tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentHint {
    Click,
    Fill,
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionSource {
    Cache,
    History,
    Literal,
    Heuristic,
}

/// Ordered candidate tiers. Each tier holds selectors of roughly equal
/// confidence; earlier tiers are always tried first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    pub tiers: Vec<Vec<String>>,
    pub source: ResolutionSource,
}

impl Resolution {
    /// Every candidate in tier order.
    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        self.tiers.iter().flatten().map(String::as_str)
    }

    pub fn primary(&self) -> Option<&str> {
        self.candidates().next()
    }

    pub fn len(&self) -> usize {
        self.tiers.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolverStats {
    pub cache_hits: u64,
    pub history_hits: u64,
    pub heuristic_runs: u64,
    pub learned: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    context: String,
    goal: String,
    hint: IntentHint,
}

/// Resolves natural-language goals into candidate selectors.
///
/// Lookup order: in-process cache, selector history, literal selectors,
/// then generated heuristic tiers. Results are cached per
/// `(page, goal, hint)` so repeated goals never regenerate tiers.
pub struct SemanticResolver {
    history: SelectorHistory,
    cache: HashMap<CacheKey, Resolution>,
    stats: ResolverStats,
}

impl SemanticResolver {
    pub fn new(history: SelectorHistory) -> Self {
        Self {
            history,
            cache: HashMap::new(),
            stats: ResolverStats::default(),
        }
    }

    pub fn history(&self) -> &SelectorHistory {
        &self.history
    }

    pub fn stats(&self) -> ResolverStats {
        self.stats
    }

    /// How many times tiers were generated from scratch.
    pub fn heuristic_computations(&self) -> u64 {
        self.stats.heuristic_runs
    }

    /// `None` means the goal cannot produce any candidate.
    pub fn resolve(&mut self, goal: &str, context_url: &str, hint: IntentHint) -> Option<Resolution> {
        let key = CacheKey {
            context: normalize_context(context_url),
            goal: normalize_goal(goal),
            hint,
        };
        if key.goal.is_empty() {
            return None;
        }

        if let Some(hit) = self.cache.get(&key) {
            self.stats.cache_hits += 1;
            debug!(goal, source = "cache", "goal resolved");
            return Some(Resolution {
                tiers: hit.tiers.clone(),
                source: ResolutionSource::Cache,
            });
        }

        let resolution = if let Some(remembered) = self.history.lookup(goal, context_url) {
            self.stats.history_hits += 1;
            let remembered = remembered.to_string();
            let mut tiers = vec![vec![remembered.clone()]];
            if !is_literal_selector(goal) {
                self.stats.heuristic_runs += 1;
                tiers.extend(
                    heuristic_tiers(goal, hint)
                        .into_iter()
                        .map(|tier| tier.into_iter().filter(|s| *s != remembered).collect::<Vec<_>>())
                        .filter(|tier| !tier.is_empty()),
                );
            }
            info!(goal, selector = %remembered, "goal resolved from history");
            Resolution {
                tiers,
                source: ResolutionSource::History,
            }
        } else if is_literal_selector(goal) {
            Resolution {
                tiers: vec![vec![goal.trim().to_string()]],
                source: ResolutionSource::Literal,
            }
        } else {
            self.stats.heuristic_runs += 1;
            let tiers = heuristic_tiers(goal, hint);
            debug!(goal, tiers = tiers.len(), "goal resolved heuristically");
            Resolution {
                tiers,
                source: ResolutionSource::Heuristic,
            }
        };

        if resolution.is_empty() {
            return None;
        }
        self.cache.insert(key, resolution.clone());
        Some(resolution)
    }

    /// Remember that `selector` satisfied `goal` on `context_url`. Updates
    /// every cached hint for the pair and persists to history.
    pub fn learn(&mut self, goal: &str, selector: &str, context_url: &str) -> Result<(), HistoryError> {
        let context = normalize_context(context_url);
        let normalized = normalize_goal(goal);
        for (key, entry) in self.cache.iter_mut() {
            if key.goal == normalized && key.context == context {
                let rest = entry
                    .tiers
                    .iter()
                    .map(|tier| tier.iter().filter(|s| *s != selector).cloned().collect::<Vec<_>>())
                    .filter(|tier| !tier.is_empty());
                let mut tiers = vec![vec![selector.to_string()]];
                tiers.extend(rest);
                entry.tiers = tiers;
                entry.source = ResolutionSource::History;
            }
        }
        self.history.record(goal, selector, context_url)?;
        self.stats.learned += 1;
        debug!(goal, selector, "selector learned");
        Ok(())
    }
}

/// Goals that already are selectors pass through untouched.
pub fn is_literal_selector(goal: &str) -> bool {
    let trimmed = goal.trim();
    trimmed.starts_with('#') || trimmed.starts_with('.') || trimmed.contains(SHADOW_PIERCE)
}

/// Build ranked tiers: exact id/name, test hooks, label/placeholder/aria,
/// then fuzzy substring and class matches.
pub fn heuristic_tiers(goal: &str, hint: IntentHint) -> Vec<Vec<String>> {
    let v = GoalVariants::new(goal);
    let ids = v.identifiers();
    if ids.is_empty() {
        return Vec::new();
    }
    let text = &v.escaped;
    let mut tiers: Vec<Vec<String>> = Vec::with_capacity(4);

    let exact = ids
        .iter()
        .flat_map(|id| {
            let id_sel = id_selector(id);
            match hint {
                IntentHint::Fill => vec![
                    format!("input{id_sel}"),
                    format!("textarea{id_sel}"),
                    format!("select{id_sel}"),
                    format!("input[name=\"{id}\"]"),
                    format!("textarea[name=\"{id}\"]"),
                    format!("select[name=\"{id}\"]"),
                ],
                IntentHint::Click => vec![
                    id_sel.clone(),
                    format!("button[name=\"{id}\"]"),
                    format!("[name=\"{id}\"]"),
                ],
                IntentHint::Generic => vec![id_sel.clone(), format!("[name=\"{id}\"]")],
            }
        })
        .collect();
    tiers.push(exact);

    let hooks = ids
        .iter()
        .flat_map(|id| {
            let mut hooks = vec![
                format!("[data-testid=\"{id}\"]"),
                format!("[data-test=\"{id}\"]"),
            ];
            if hint != IntentHint::Generic {
                hooks.push(format!("[data-test-id=\"{id}\"]"));
                hooks.push(format!("[data-qa=\"{id}\"]"));
                hooks.push(format!("[data-cy=\"{id}\"]"));
            }
            hooks
        })
        .collect();
    tiers.push(hooks);

    let labelled = match hint {
        IntentHint::Fill => vec![
            format!("[placeholder=\"{text}\" i]"),
            format!("[aria-label=\"{text}\" i]"),
            format!("label=\"{text}\""),
            format!("input[title=\"{text}\" i]"),
        ],
        IntentHint::Click => vec![
            format!("[aria-label=\"{text}\" i]"),
            format!("[role=\"button\"][aria-label=\"{text}\" i]"),
            format!("input[type=\"submit\"][value=\"{text}\" i]"),
            format!("input[type=\"button\"][value=\"{text}\" i]"),
            format!("text=\"{text}\""),
            format!("[title=\"{text}\" i]"),
        ],
        IntentHint::Generic => vec![format!("[aria-label=\"{text}\" i]")],
    };
    tiers.push(labelled);

    let fuzzy: Vec<String> = match hint {
        IntentHint::Fill => ids
            .iter()
            .flat_map(|id| {
                vec![
                    format!("input[name*=\"{id}\" i]"),
                    format!("input[id*=\"{id}\" i]"),
                    format!("textarea[name*=\"{id}\" i]"),
                    format!("select[name*=\"{id}\" i]"),
                ]
            })
            .chain(std::iter::once(format!("input[placeholder*=\"{text}\" i]")))
            .collect(),
        IntentHint::Click => std::iter::once(format!("text={text}"))
            .chain(ids.iter().flat_map(|id| {
                vec![
                    format!("button[class*=\"{id}\" i]"),
                    format!("a[class*=\"{id}\" i]"),
                    format!("[role=\"button\"][class*=\"{id}\" i]"),
                    format!("[id*=\"{id}\" i]"),
                    format!("[class*=\"{id}\" i]"),
                ]
            }))
            .collect(),
        IntentHint::Generic => Vec::new(),
    };
    if !fuzzy.is_empty() {
        tiers.push(fuzzy);
    }

    tiers
        .into_iter()
        .map(dedup)
        .filter(|tier| !tier.is_empty())
        .collect()
}

fn id_selector(id: &str) -> String {
    if is_plain_ident(id) {
        format!("#{id}")
    } else {
        format!("[id=\"{id}\"]")
    }
}

fn dedup(tier: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(tier.len());
    for selector in tier {
        if !out.contains(&selector) {
            out.push(selector);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_goals_pass_through() {
        let mut resolver = SemanticResolver::new(SelectorHistory::in_memory());
        let res = resolver
            .resolve("#checkout", "https://shop.test/", IntentHint::Click)
            .unwrap();
        assert_eq!(res.source, ResolutionSource::Literal);
        assert_eq!(res.tiers, vec![vec!["#checkout".to_string()]]);

        let pierced = resolver
            .resolve("my-app >>> button", "https://shop.test/", IntentHint::Click)
            .unwrap();
        assert_eq!(pierced.primary(), Some("my-app >>> button"));
        assert_eq!(resolver.heuristic_computations(), 0);
    }

    #[test]
    fn click_tiers_rank_exact_before_fuzzy() {
        let tiers = heuristic_tiers("Login", IntentHint::Click);
        assert_eq!(tiers[0][0], "#login");
        assert!(tiers[1].contains(&"[data-testid=\"login\"]".to_string()));
        assert!(tiers[2].contains(&"text=\"Login\"".to_string()));
        assert!(tiers[3].contains(&"[class*=\"login\" i]".to_string()));
    }

    #[test]
    fn fill_tiers_favor_form_controls() {
        let tiers = heuristic_tiers("Email Address", IntentHint::Fill);
        assert_eq!(tiers[0][0], "input#email-address");
        assert!(tiers[0].iter().all(|s| s.starts_with("input")
            || s.starts_with("textarea")
            || s.starts_with("select")));
        assert!(tiers[2].contains(&"[placeholder=\"Email Address\" i]".to_string()));
    }

    #[test]
    fn generic_hint_is_conservative() {
        let tiers = heuristic_tiers("Profile", IntentHint::Generic);
        assert_eq!(tiers.len(), 3);
        assert!(tiers.iter().flatten().all(|s| !s.contains("*=")));
    }

    #[test]
    fn empty_goal_is_a_miss() {
        let mut resolver = SemanticResolver::new(SelectorHistory::in_memory());
        assert!(resolver.resolve("   ", "https://a.test/", IntentHint::Click).is_none());
        assert!(resolver.resolve("!!!", "https://a.test/", IntentHint::Click).is_none());
    }
}
