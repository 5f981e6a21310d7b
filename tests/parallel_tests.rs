// Concurrency behavior: independent recipes build in parallel inside a
// batch, and prefix writes stay serialized so conflicts are deterministic.

mod test_helpers;

use mashtun::error::MashError;
use mashtun::registry::Registry;
use mashtun::resolver::{self, Graph};
use mashtun::scheduler::{InstallOptions, Outcome, Scheduler};
use std::sync::Arc;
use test_helpers::TestEnvironment;

async fn install_with_jobs(
    env: &TestEnvironment,
    roots: &[&str],
    jobs: usize,
) -> mashtun::scheduler::InstallReport {
    let roots: Vec<String> = roots.iter().map(|s| s.to_string()).collect();
    let recipes = resolver::load_closure(&env.recipes, &roots).unwrap();
    let graph = Arc::new(Graph::build(recipes).unwrap());
    let scheduler = Scheduler::new(env.store.clone(), env.cache.clone()).unwrap();
    let options = InstallOptions { jobs, force: false };
    scheduler.install(graph, &roots, &options).await.unwrap()
}

#[tokio::test]
async fn disjoint_recipes_install_concurrently() {
    let env = TestEnvironment::new();
    env.simple_recipe("one", "1.0", &[]);
    env.simple_recipe("two", "1.0", &[]);
    env.simple_recipe("three", "1.0", &[]);

    let report = install_with_jobs(&env, &["one", "two", "three"], 3).await;
    assert_eq!(report.installed_count(), 3);

    for name in ["one", "two", "three"] {
        let payload = env.store.prefix().join(format!("share/{name}/payload.txt"));
        assert_eq!(std::fs::read_to_string(payload).unwrap(), name);
    }

    let registry = Registry::load(&env.store).unwrap();
    assert_eq!(registry.iter().count(), 3);
}

#[tokio::test]
async fn conflicting_recipes_never_both_claim_a_path() {
    let env = TestEnvironment::new();

    // both recipes install share/common/greeting.txt
    for name in ["left", "right"] {
        let (url, sha256) = env.make_archive(name, "1.0", &[("greeting.txt", name)]);
        env.write_recipe(
            name,
            &format!(
                r#"
name = "{name}"
version = "1.0"

[source]
url = "{url}"
sha256 = "{sha256}"

[phases]
install = [
    ["mkdir", "-p", "@@DESTDIR@@/share/common"],
    ["cp", "@@SRC@@/greeting.txt", "@@DESTDIR@@/share/common/greeting.txt"],
]
"#
            ),
        );
    }

    let report = install_with_jobs(&env, &["left", "right"], 2).await;
    assert_eq!(report.installed_count(), 1);

    let conflicts = report
        .outcomes
        .iter()
        .filter(|(_, o)| matches!(o, Outcome::Failed(MashError::InstallConflict { .. })))
        .count();
    assert_eq!(conflicts, 1);

    // the winner owns the path; the loser left no registry entry
    let registry = Registry::load(&env.store).unwrap();
    assert_eq!(registry.iter().count(), 1);
    let (winner, _) = registry.iter().next().unwrap();
    assert_eq!(
        registry.owner_of(std::path::Path::new("share/common/greeting.txt")),
        Some(winner.as_str())
    );
    let link = env.store.prefix().join("share/common/greeting.txt");
    assert_eq!(std::fs::read_to_string(link).unwrap(), *winner);
}

#[tokio::test]
async fn single_job_still_installs_a_whole_batch() {
    let env = TestEnvironment::new();
    env.simple_recipe("one", "1.0", &[]);
    env.simple_recipe("two", "1.0", &[]);

    let report = install_with_jobs(&env, &["one", "two"], 1).await;
    assert_eq!(report.installed_count(), 2);
}
