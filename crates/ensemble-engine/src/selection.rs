use std::collections::BTreeMap;

use ensemble_core::AgentVariant;

/// Picks the variant that trades the next slice from validation Sharpe
/// ratios.
///
/// This is deliberately not an arg-max. Candidates are tried in precedence
/// order: the first must be `>=` every other candidate, each later one
/// (except the last) must be strictly `>` every other candidate, and the last
/// is the fallback. So the first variant wins ties and later ones need strict
/// dominance. The chain is kept for compatibility with earlier backtests;
/// whether the asymmetry is intended is still open for review.
///
/// A NaN metric loses every comparison, so when every candidate is NaN the
/// chain falls through to the fallback. Variants with no metric (failed
/// training) are not candidates.
#[derive(Debug, Clone)]
pub struct ModelSelector {
    precedence: Vec<AgentVariant>,
}

impl Default for ModelSelector {
    fn default() -> Self {
        Self::new(vec![
            AgentVariant::TrustRegion,
            AgentVariant::ActorCritic,
            AgentVariant::OffPolicy,
            AgentVariant::PolicyGradient,
        ])
    }
}

impl ModelSelector {
    pub fn new(precedence: Vec<AgentVariant>) -> Self {
        Self { precedence }
    }

    pub fn precedence(&self) -> &[AgentVariant] {
        &self.precedence
    }

    /// `None` only when no candidate has a metric.
    pub fn select(&self, metrics: &BTreeMap<AgentVariant, f64>) -> Option<AgentVariant> {
        let candidates: Vec<(AgentVariant, f64)> = self
            .precedence
            .iter()
            .filter_map(|v| metrics.get(v).map(|m| (*v, *m)))
            .collect();

        let ((fallback, _), rest) = candidates.split_last()?;

        for (pos, (variant, score)) in rest.iter().enumerate() {
            let mut others = candidates.iter().filter(|(v, _)| v != variant);
            let strict = pos > 0;
            let wins = others.all(|(_, other)| beats(*score, *other, strict));
            if wins {
                return Some(*variant);
            }
        }
        Some(*fallback)
    }
}

/// `a >= b` (or `a > b` when `strict`), where a NaN `a` never wins and a
/// NaN `b` always loses.
fn beats(a: f64, b: f64, strict: bool) -> bool {
    !a.is_nan() && (b.is_nan() || if strict { a > b } else { a >= b })
}
