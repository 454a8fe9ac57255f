use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use common::{FieldRequirement, Record};
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::error::{OrderError, RefineError};
use crate::progress::ProgressCallback;

/// Ordering constraint a refiner declares against another, by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    RunAfter(String),
    RunBefore(String),
    /// The named refiner is dropped when both are registered.
    Conflicts(String),
}

#[async_trait]
pub trait Refiner: Send + Sync {
    fn name(&self) -> &str;

    fn rules(&self) -> Vec<Rule> {
        Vec::new()
    }

    async fn refine(
        &self,
        records: &mut [Record],
        req: FieldRequirement,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<(), RefineError>;
}

/// Refiners in an order resolved once, at construction.
pub struct Pipeline {
    stages: Vec<Arc<dyn Refiner>>,
}

impl Pipeline {
    pub fn new(refiners: Vec<Arc<dyn Refiner>>) -> Result<Self, OrderError> {
        let mut seen = HashSet::new();
        for r in &refiners {
            if !seen.insert(r.name().to_string()) {
                return Err(OrderError::Duplicate(r.name().to_string()));
            }
        }

        // conflicts are applied in registration order
        let mut dropped: HashSet<String> = HashSet::new();
        for r in &refiners {
            if dropped.contains(r.name()) {
                continue;
            }
            for rule in r.rules() {
                if let Rule::Conflicts(other) = rule {
                    if other == r.name() {
                        return Err(OrderError::SelfReference(other));
                    }
                    if seen.contains(&other) && dropped.insert(other.clone()) {
                        info!("refiner {other} disabled as it conflicts with {}", r.name());
                    }
                }
            }
        }
        let kept: Vec<Arc<dyn Refiner>> = refiners
            .into_iter()
            .filter(|r| !dropped.contains(r.name()))
            .collect();

        let position: HashMap<&str, usize> = kept
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name(), i))
            .collect();
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); kept.len()];
        let mut indegree = vec![0usize; kept.len()];
        for (i, r) in kept.iter().enumerate() {
            for rule in r.rules() {
                let (from, to) = match &rule {
                    Rule::RunAfter(name) | Rule::RunBefore(name) if name == r.name() => {
                        return Err(OrderError::SelfReference(name.clone()));
                    }
                    Rule::RunAfter(name) => match position.get(name.as_str()) {
                        Some(&j) => (j, i),
                        None => continue,
                    },
                    Rule::RunBefore(name) => match position.get(name.as_str()) {
                        Some(&j) => (i, j),
                        None => continue,
                    },
                    Rule::Conflicts(_) => continue,
                };
                edges[from].push(to);
                indegree[to] += 1;
            }
        }

        // Kahn's algorithm; the lowest registration index goes first
        let mut ready: BTreeSet<usize> = (0..kept.len()).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(kept.len());
        while let Some(i) = ready.pop_first() {
            order.push(i);
            for &to in &edges[i] {
                indegree[to] -= 1;
                if indegree[to] == 0 {
                    ready.insert(to);
                }
            }
        }
        if order.len() != kept.len() {
            let stuck = (0..kept.len())
                .filter(|i| indegree[*i] > 0)
                .map(|i| kept[i].name().to_string())
                .collect();
            return Err(OrderError::Cycle(stuck));
        }

        let mut slots: Vec<Option<Arc<dyn Refiner>>> = kept.into_iter().map(Some).collect();
        let stages: Vec<Arc<dyn Refiner>> =
            order.into_iter().filter_map(|i| slots[i].take()).collect();
        debug!(
            "refiner order: {}",
            stages
                .iter()
                .map(|s| s.name())
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        Ok(Self { stages })
    }

    pub fn order(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs every stage in order, stopping at the first failure.
    pub async fn refine(
        &self,
        records: &mut [Record],
        req: FieldRequirement,
        progress: Option<ProgressCallback>,
        cancel: &CancellationToken,
    ) -> Result<(), RefineError> {
        let req = req.implied();
        for stage in &self.stages {
            if cancel.is_cancelled() {
                return Err(RefineError::cancelled());
            }
            stage
                .refine(records, req, progress.clone(), cancel)
                .await
                .map_err(|e| {
                    debug!("refiner {} failed: {e}", stage.name());
                    e
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Named {
        name: &'static str,
        rules: Vec<Rule>,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl Refiner for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn rules(&self) -> Vec<Rule> {
            self.rules.clone()
        }

        async fn refine(
            &self,
            _records: &mut [Record],
            _req: FieldRequirement,
            _progress: Option<ProgressCallback>,
            _cancel: &CancellationToken,
        ) -> Result<(), RefineError> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                return Err(RefineError::Failed(self.name.to_string()));
            }
            Ok(())
        }
    }

    fn named(
        name: &'static str,
        rules: Vec<Rule>,
        log: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Arc<dyn Refiner> {
        Arc::new(Named {
            name,
            rules,
            log: log.clone(),
            fail: false,
        })
    }

    fn after(name: &str) -> Rule {
        Rule::RunAfter(name.to_string())
    }

    #[test]
    fn test_order_follows_rules_then_registration() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            named("systemd-updates", vec![after("packagekit")], &log),
            named("history", vec![after("packagekit")], &log),
            named("packagekit", vec![after("appstream")], &log),
            named("icons", vec![Rule::RunBefore("packagekit".to_string())], &log),
        ])
        .unwrap();
        assert_eq!(
            pipeline.order(),
            vec!["icons", "packagekit", "systemd-updates", "history"]
        );
    }

    #[test]
    fn test_cycle_is_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let err = Pipeline::new(vec![
            named("a", vec![after("b")], &log),
            named("b", vec![after("a")], &log),
            named("c", vec![], &log),
        ])
        .err()
        .unwrap();
        assert_eq!(err, OrderError::Cycle(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn test_self_reference_and_duplicates() {
        let log = Arc::new(Mutex::new(Vec::new()));
        assert!(matches!(
            Pipeline::new(vec![named("a", vec![after("a")], &log)]),
            Err(OrderError::SelfReference(_))
        ));
        assert!(matches!(
            Pipeline::new(vec![named("a", vec![], &log), named("a", vec![], &log)]),
            Err(OrderError::Duplicate(_))
        ));
    }

    #[test]
    fn test_conflicting_refiner_is_dropped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(vec![
            named("packagekit", vec![Rule::Conflicts("dpkg".to_string())], &log),
            named("dpkg", vec![Rule::Conflicts("packagekit".to_string())], &log),
        ])
        .unwrap();
        assert_eq!(pipeline.order(), vec!["packagekit"]);
    }

    #[tokio::test]
    async fn test_refine_stops_at_first_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let failing: Arc<dyn Refiner> = Arc::new(Named {
            name: "b",
            rules: vec![after("a")],
            log: log.clone(),
            fail: true,
        });
        let pipeline = Pipeline::new(vec![
            named("c", vec![after("b")], &log),
            failing,
            named("a", vec![], &log),
        ])
        .unwrap();

        let err = pipeline
            .refine(
                &mut [],
                FieldRequirement::VERSION,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, RefineError::Failed("b".to_string()));
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }
}
