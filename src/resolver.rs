//! Dependency resolution: ordering recipes so every dependency builds before
//! its dependents, and refusing cyclic recipe sets.
//!
//! The graph holds recipes in an arena addressed by integer index; edges are
//! index pairs. Kahn's algorithm produces the execution plan without touching
//! the recipe records themselves.

use crate::error::{MashError, Result};
use crate::recipe::{self, Recipe};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

/// Why one recipe depends on another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Runtime,
    Build,
    Test,
}

/// Dependency graph over an arena of recipes.
pub struct Graph {
    recipes: Vec<Recipe>,
    index: HashMap<String, usize>,
    /// edges[i] = (dependency index, kind) pairs for recipe i
    edges: Vec<Vec<(usize, EdgeKind)>>,
}

impl Graph {
    /// Build the graph. Every runtime and build dependency must resolve to
    /// a recipe in the set; test-only dependencies outside the set are
    /// dropped rather than rejected, since they never gate installation.
    pub fn build(recipes: Vec<Recipe>) -> Result<Self> {
        let index: HashMap<String, usize> = recipes
            .iter()
            .enumerate()
            .map(|(i, r)| (r.name.clone(), i))
            .collect();

        let mut edges = vec![Vec::new(); recipes.len()];
        for (i, recipe) in recipes.iter().enumerate() {
            let tagged = [
                (&recipe.dependencies, EdgeKind::Runtime),
                (&recipe.build_dependencies, EdgeKind::Build),
                (&recipe.test_dependencies, EdgeKind::Test),
            ];
            for (names, kind) in tagged {
                for name in names {
                    match index.get(name) {
                        Some(&dep) => edges[i].push((dep, kind)),
                        // test-only dependencies don't gate installation, so
                        // a test dep outside the loaded set is not an error
                        None if kind == EdgeKind::Test => continue,
                        None => return Err(MashError::RecipeNotFound(name.clone())),
                    }
                }
            }
        }

        Ok(Self {
            recipes,
            index,
            edges,
        })
    }

    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }

    pub fn recipe(&self, idx: usize) -> &Recipe {
        &self.recipes[idx]
    }

    pub fn recipes(&self) -> &[Recipe] {
        &self.recipes
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Dependency indices that must be installed before recipe `idx` can
    /// build (runtime + build edges; test edges don't gate installation).
    pub fn install_deps(&self, idx: usize) -> Vec<usize> {
        self.edges[idx]
            .iter()
            .filter(|(_, kind)| *kind != EdgeKind::Test)
            .map(|(dep, _)| *dep)
            .collect()
    }

    /// Topological order over the install edges: every dependency precedes
    /// its dependents. Fails with [`MashError::Cycle`] naming the recipes on
    /// a cycle.
    pub fn topo_order(&self) -> Result<Vec<usize>> {
        let n = self.len();
        let mut in_degree = vec![0usize; n];
        let mut dependents = vec![Vec::new(); n];

        for i in 0..n {
            for dep in self.install_deps(i) {
                in_degree[i] += 1;
                dependents[dep].push(i);
            }
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &dependent in &dependents[i] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if order.len() == n {
            Ok(order)
        } else {
            Err(MashError::Cycle {
                participants: self.extract_cycle(&in_degree),
            })
        }
    }

    /// Walk the leftover subgraph (nodes with unresolved in-degree) until a
    /// node repeats, yielding one concrete cycle for the error message.
    fn extract_cycle(&self, in_degree: &[usize]) -> Vec<String> {
        let stuck: HashSet<usize> = (0..self.len()).filter(|&i| in_degree[i] > 0).collect();
        let start = match stuck.iter().min() {
            Some(&i) => i,
            None => return vec![],
        };

        let mut path: Vec<usize> = Vec::new();
        let mut seen = HashMap::new();
        let mut current = start;

        loop {
            if let Some(&pos) = seen.get(&current) {
                let mut cycle: Vec<String> = path[pos..]
                    .iter()
                    .map(|&i| self.recipes[i].name.clone())
                    .collect();
                // close the loop for readability
                cycle.push(self.recipes[current].name.clone());
                return cycle;
            }
            seen.insert(current, path.len());
            path.push(current);

            current = match self
                .install_deps(current)
                .into_iter()
                .find(|dep| stuck.contains(dep))
            {
                Some(next) => next,
                None => return path.iter().map(|&i| self.recipes[i].name.clone()).collect(),
            };
        }
    }

    /// Partially-ordered execution plan: each batch only depends on recipes
    /// in earlier batches, so recipes inside one batch may build in parallel.
    pub fn batches(&self) -> Result<Vec<Vec<usize>>> {
        let order = self.topo_order()?;

        let mut depth = vec![0usize; self.len()];
        for &i in &order {
            for dep in self.install_deps(i) {
                depth[i] = depth[i].max(depth[dep] + 1);
            }
        }

        let max_depth = depth.iter().copied().max().unwrap_or(0);
        let mut batches = vec![Vec::new(); max_depth + 1];
        for &i in &order {
            batches[depth[i]].push(i);
        }
        batches.retain(|b| !b.is_empty());
        Ok(batches)
    }

    /// Transitive runtime closure of a recipe: what consumers need at run
    /// time. Build-only and test-only edges are excluded.
    pub fn runtime_closure(&self, root: usize) -> Vec<usize> {
        let mut closure = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        seen.insert(root);

        while let Some(i) = stack.pop() {
            for &(dep, kind) in &self.edges[i] {
                if kind == EdgeKind::Runtime && seen.insert(dep) {
                    closure.push(dep);
                    stack.push(dep);
                }
            }
        }

        closure.sort_unstable();
        closure
    }

    /// Recipes whose runtime or build dependencies include `name`.
    pub fn dependents_of(&self, name: &str) -> Vec<&Recipe> {
        self.recipes
            .iter()
            .filter(|r| {
                r.dependencies.iter().any(|d| d == name)
                    || r.build_dependencies.iter().any(|d| d == name)
            })
            .collect()
    }
}

/// Load the transitive closure of recipes needed to install `roots`, reading
/// recipe documents from `recipe_dir` on demand.
pub fn load_closure(recipe_dir: &Path, roots: &[String]) -> Result<Vec<Recipe>> {
    let mut recipes = Vec::new();
    let mut seen = HashSet::new();
    let mut queue: VecDeque<String> = roots.iter().cloned().collect();

    while let Some(name) = queue.pop_front() {
        if !seen.insert(name.clone()) {
            continue;
        }
        let recipe = recipe::load(recipe_dir, &name)?;
        for dep in recipe.install_deps() {
            queue.push_back(dep.clone());
        }
        recipes.push(recipe);
    }

    Ok(recipes)
}
