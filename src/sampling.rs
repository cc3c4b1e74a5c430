use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Seed of the terminal distribution draw of a non-greedy chain.
pub const DEFAULT_DIST_SEED: u64 = 1_048_204_757;

/// One configurable sampling stage. Stages are applied in [`SamplerKind`]
/// order regardless of the order they were configured in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SamplerStage {
    RepetitionPenalty {
        penalty: f32,
        #[serde(default = "default_penalty_window")]
        last_n: usize,
    },
    TopK {
        k: usize,
    },
    TopP {
        p: f64,
    },
    MinP {
        p: f32,
    },
    TypicalP {
        p: f32,
    },
    Temperature {
        temperature: f64,
    },
    MirostatV2 {
        tau: f32,
        eta: f32,
    },
}

fn default_penalty_window() -> usize {
    64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    RepetitionPenalty,
    TopK,
    TopP,
    MinP,
    TypicalP,
    Temperature,
    MirostatV2,
}

impl SamplerStage {
    pub fn kind(&self) -> SamplerKind {
        match self {
            Self::RepetitionPenalty { .. } => SamplerKind::RepetitionPenalty,
            Self::TopK { .. } => SamplerKind::TopK,
            Self::TopP { .. } => SamplerKind::TopP,
            Self::MinP { .. } => SamplerKind::MinP,
            Self::TypicalP { .. } => SamplerKind::TypicalP,
            Self::Temperature { .. } => SamplerKind::Temperature,
            Self::MirostatV2 { .. } => SamplerKind::MirostatV2,
        }
    }
}

/// Sampler configuration keyed by stage kind; configuring a kind twice keeps
/// the latest parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SamplerSet {
    stages: BTreeMap<SamplerKind, SamplerStage>,
}

impl SamplerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, stage: SamplerStage) -> Option<SamplerStage> {
        self.stages.insert(stage.kind(), stage)
    }

    pub fn with(mut self, stage: SamplerStage) -> Self {
        self.insert(stage);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SamplerStage> {
        self.stages.values()
    }
}

impl FromIterator<SamplerStage> for SamplerSet {
    fn from_iter<I: IntoIterator<Item = SamplerStage>>(iter: I) -> Self {
        let mut set = Self::new();
        for stage in iter {
            set.insert(stage);
        }
        set
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChainStep {
    Stage(SamplerStage),
    Greedy,
    Dist { seed: u64 },
}

/// Ordered chain a decode context samples with.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerChain {
    steps: Vec<ChainStep>,
}

impl SamplerChain {
    pub fn from_set(set: &SamplerSet) -> Self {
        Self::from_set_seeded(set, DEFAULT_DIST_SEED)
    }

    pub fn from_set_seeded(set: &SamplerSet, seed: u64) -> Self {
        if set.is_empty() {
            return Self {
                steps: vec![ChainStep::Greedy],
            };
        }

        let mut steps: Vec<ChainStep> = set.iter().cloned().map(ChainStep::Stage).collect();
        steps.push(ChainStep::Dist { seed });
        Self { steps }
    }

    pub fn steps(&self) -> &[ChainStep] {
        &self.steps
    }

    pub fn is_greedy(&self) -> bool {
        matches!(self.steps.as_slice(), [ChainStep::Greedy])
    }

    pub fn stage(&self, kind: SamplerKind) -> Option<&SamplerStage> {
        self.steps.iter().find_map(|step| match step {
            ChainStep::Stage(stage) if stage.kind() == kind => Some(stage),
            _ => None,
        })
    }

    pub fn seed(&self) -> Option<u64> {
        self.steps.iter().find_map(|step| match step {
            ChainStep::Dist { seed } => Some(*seed),
            _ => None,
        })
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.steps
            .iter()
            .map(|step| match step {
                ChainStep::Greedy => "greedy",
                ChainStep::Dist { .. } => "dist",
                ChainStep::Stage(stage) => match stage.kind() {
                    SamplerKind::RepetitionPenalty => "repetition_penalty",
                    SamplerKind::TopK => "top_k",
                    SamplerKind::TopP => "top_p",
                    SamplerKind::MinP => "min_p",
                    SamplerKind::TypicalP => "typical_p",
                    SamplerKind::Temperature => "temperature",
                    SamplerKind::MirostatV2 => "mirostat_v2",
                },
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_builds_a_greedy_chain() {
        let chain = SamplerChain::from_set(&SamplerSet::new());
        assert!(chain.is_greedy());
        assert_eq!(chain.seed(), None);
    }

    #[test]
    fn stages_follow_canonical_order_and_end_with_dist() {
        let set: SamplerSet = vec![
            SamplerStage::Temperature { temperature: 0.7 },
            SamplerStage::TopK { k: 40 },
            SamplerStage::RepetitionPenalty {
                penalty: 1.1,
                last_n: 64,
            },
            SamplerStage::TopP { p: 0.9 },
        ]
        .into_iter()
        .collect();

        let chain = SamplerChain::from_set(&set);
        assert_eq!(
            chain.names(),
            vec!["repetition_penalty", "top_k", "top_p", "temperature", "dist"]
        );
        assert_eq!(chain.seed(), Some(DEFAULT_DIST_SEED));
    }

    #[test]
    fn reconfiguring_a_kind_replaces_it() {
        let mut set = SamplerSet::new();
        set.insert(SamplerStage::TopK { k: 10 });
        let previous = set.insert(SamplerStage::TopK { k: 20 });

        assert_eq!(previous, Some(SamplerStage::TopK { k: 10 }));
        assert_eq!(set.len(), 1);
        let chain = SamplerChain::from_set(&set);
        assert_eq!(chain.stage(SamplerKind::TopK), Some(&SamplerStage::TopK { k: 20 }));
    }

    #[test]
    fn stages_deserialize_from_tagged_tables() {
        let stage: SamplerStage =
            serde_json::from_str(r#"{"kind":"repetition_penalty","penalty":1.2}"#)
                .expect("stage should parse");
        assert_eq!(
            stage,
            SamplerStage::RepetitionPenalty {
                penalty: 1.2,
                last_n: 64
            }
        );
    }
}
