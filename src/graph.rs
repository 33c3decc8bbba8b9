use crate::booster::Booster;
use crate::config::AppConfig;
use crate::models::TrainingSummary;
use anyhow::{anyhow, Context, Result};
use log::{error, info};
use polars::prelude::DataFrame;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Instant;

/// Everything an asset needs for one run. Assets open their own store
/// connection from `config.storage` and drop it before returning.
pub struct AssetContext<'a> {
    pub config: &'a AppConfig,
    pub booster: &'a dyn Booster,
    pub sql_dir: PathBuf,
    pub cutoff: Option<String>,
    pub since: Option<chrono::NaiveDate>,
    pub seed: Option<u64>,
}

/// Typed outputs flowing between assets.
#[derive(Default)]
pub struct RunState {
    pub feature_frame: Option<DataFrame>,
    pub horizon_frames: BTreeMap<&'static str, DataFrame>,
    pub inserted_rows: Option<usize>,
    pub summaries: Vec<TrainingSummary>,
}

type AssetFn = Box<dyn Fn(&AssetContext, &mut RunState) -> Result<()>>;

pub struct Asset {
    pub name: &'static str,
    pub deps: Vec<&'static str>,
    run: AssetFn,
}

impl Asset {
    pub fn new<F>(name: &'static str, deps: Vec<&'static str>, run: F) -> Self
    where
        F: Fn(&AssetContext, &mut RunState) -> Result<()> + 'static,
    {
        Self {
            name,
            deps,
            run: Box::new(run),
        }
    }
}

/// Explicit dependency graph of named assets. Validated on construction;
/// executed in topological order with per-asset timing logs.
pub struct Graph {
    assets: Vec<Asset>,
    order: Vec<usize>,
}

impl Graph {
    pub fn new(assets: Vec<Asset>) -> Result<Self> {
        let mut index_by_name: HashMap<&str, usize> = HashMap::new();
        for (idx, asset) in assets.iter().enumerate() {
            if index_by_name.insert(asset.name, idx).is_some() {
                return Err(anyhow!("duplicate asset name {}", asset.name));
            }
        }
        for asset in &assets {
            for dep in &asset.deps {
                if !index_by_name.contains_key(dep) {
                    return Err(anyhow!(
                        "asset {} depends on unknown asset {}",
                        asset.name,
                        dep
                    ));
                }
                if dep == &asset.name {
                    return Err(anyhow!("asset {} depends on itself", asset.name));
                }
            }
        }

        // Kahn's algorithm; ties resolve in declaration order so runs are
        // deterministic.
        let mut in_degree = vec![0usize; assets.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); assets.len()];
        for (idx, asset) in assets.iter().enumerate() {
            in_degree[idx] = asset.deps.len();
            for dep in &asset.deps {
                dependents[index_by_name[*dep]].push(idx);
            }
        }
        let mut ready: VecDeque<usize> = (0..assets.len())
            .filter(|idx| in_degree[*idx] == 0)
            .collect();
        let mut order = Vec::with_capacity(assets.len());
        while let Some(idx) = ready.pop_front() {
            order.push(idx);
            for dependent in &dependents[idx] {
                in_degree[*dependent] -= 1;
                if in_degree[*dependent] == 0 {
                    ready.push_back(*dependent);
                }
            }
        }
        if order.len() != assets.len() {
            let stuck: Vec<&str> = assets
                .iter()
                .enumerate()
                .filter(|(idx, _)| in_degree[*idx] > 0)
                .map(|(_, asset)| asset.name)
                .collect();
            return Err(anyhow!("asset graph has a cycle involving {:?}", stuck));
        }

        Ok(Self { assets, order })
    }

    pub fn execution_order(&self) -> Vec<&'static str> {
        self.order.iter().map(|idx| self.assets[*idx].name).collect()
    }

    /// Runs every asset in order; the first failure aborts the run.
    pub fn run(&self, ctx: &AssetContext, state: &mut RunState) -> Result<()> {
        let run_start = Instant::now();
        info!("Running asset graph: {:?}", self.execution_order());
        for idx in &self.order {
            let asset = &self.assets[*idx];
            let start = Instant::now();
            info!("Asset {} starting", asset.name);
            if let Err(err) = (asset.run)(ctx, state) {
                error!("Asset {} failed after {:?}", asset.name, start.elapsed());
                return Err(err).with_context(|| format!("asset {} failed", asset.name));
            }
            info!("Asset {} finished in {:?}", asset.name, start.elapsed());
        }
        info!("Asset graph finished in {:?}", run_start.elapsed());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booster::{BoosterParams, Dataset, FittedModel};
    use crate::config::{AppConfig, AppEnv, StorageTarget};
    use std::cell::RefCell;
    use std::rc::Rc;

    struct NoBooster;

    impl Booster for NoBooster {
        fn fit(
            &self,
            _train: &Dataset,
            _validation: &Dataset,
            _params: &BoosterParams,
        ) -> Result<Box<dyn FittedModel>> {
            Err(anyhow!("not available in graph tests"))
        }
    }

    fn probe(
        name: &'static str,
        deps: Vec<&'static str>,
        log: Rc<RefCell<Vec<&'static str>>>,
        fail: bool,
    ) -> Asset {
        Asset::new(name, deps, move |_, _| {
            log.borrow_mut().push(name);
            if fail {
                Err(anyhow!("boom"))
            } else {
                Ok(())
            }
        })
    }

    fn run_graph(graph: &Graph, log: &Rc<RefCell<Vec<&'static str>>>) -> Result<()> {
        let config = AppConfig {
            env: AppEnv::Test,
            storage: StorageTarget::InMemory,
            tiingo_token: None,
            test_size: 0.03,
            val_size: 0.05,
        };
        let booster = NoBooster;
        let ctx = AssetContext {
            config: &config,
            booster: &booster,
            sql_dir: PathBuf::from("sql"),
            cutoff: None,
            since: None,
            seed: None,
        };
        let mut state = RunState::default();
        let result = graph.run(&ctx, &mut state);
        let _ = log;
        result
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let result = Graph::new(vec![probe("a", vec!["missing"], log, false)]);
        assert!(result.is_err());
    }

    #[test]
    fn cycle_is_rejected() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let result = Graph::new(vec![
            probe("a", vec!["b"], log.clone(), false),
            probe("b", vec!["a"], log, false),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn execution_respects_dependencies() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let graph = Graph::new(vec![
            probe("sink", vec!["left", "right"], log.clone(), false),
            probe("left", vec!["root"], log.clone(), false),
            probe("right", vec!["root"], log.clone(), false),
            probe("root", vec![], log.clone(), false),
        ])
        .unwrap();
        run_graph(&graph, &log).unwrap();
        let seen = log.borrow();
        let position = |name: &str| seen.iter().position(|entry| *entry == name).unwrap();
        assert_eq!(seen.len(), 4);
        assert!(position("root") < position("left"));
        assert!(position("root") < position("right"));
        assert!(position("sink") == 3);
    }

    #[test]
    fn failure_aborts_the_run() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let graph = Graph::new(vec![
            probe("first", vec![], log.clone(), false),
            probe("second", vec!["first"], log.clone(), true),
            probe("third", vec!["second"], log.clone(), false),
        ])
        .unwrap();
        assert!(run_graph(&graph, &log).is_err());
        assert_eq!(*log.borrow(), vec!["first", "second"]);
    }
}
