//! Turning store contents into executed work.
//!
//! The worker keeps no state of its own: every call re-derives what to do from
//! Intent and State. Work comes from four places:
//!
//! - intent changes (the diff between Intent and State)
//! - runs that became ready
//! - completed deployments whose inputs now resolve differently
//! - op markers left by earlier applies (`@<release>/op/<name>`)

pub mod worktree;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::is_not_found;
use crate::package::Inputs;
use crate::refs::{Ref, SubPathType};
use crate::release::{ReleaseTracker, missing_environments, release_info, resolve_release};
use crate::run::{Resolution, Run, RunType, create_run, load_run, ready_inputs, resolve_inputs};
use crate::state::{ApplyOutcome, ChangeKind, DeployIntent, DeployRecord, apply_intent, diff};
use crate::status::Status;
use crate::store::{RefAccess, RefStore};
use crate::telemetry::Tracer;

pub use worktree::{GitWorktrees, Worktree, WorktreeProvider};

/// Op that refreshes a release's missing environments.
pub const CHECK_ENVS_OP: &str = "check_envs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "change", rename_all = "snake_case")]
pub enum WorkType {
    /// Apply an Intent change to State
    Intent(ChangeKind),
    /// Advance a ready run
    Run,
    /// Redeploy because the deployment's inputs drifted
    Reconcile,
    /// Execute an op marker
    Op,
}

impl fmt::Display for WorkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Intent(change) => write!(f, "intent:{}", change),
            Self::Run => f.write_str("run"),
            Self::Reconcile => f.write_str("reconcile"),
            Self::Op => f.write_str("op"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub kind: WorkType,
    pub reference: Ref,
}

impl WorkItem {
    pub fn new(kind: WorkType, reference: Ref) -> Self {
        Self { kind, reference }
    }
}

/// Restricts which work is identified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkFilter {
    /// Package glob (`**` for everything)
    pub scope: String,
    /// Only runs touching one of these refs, when set
    pub changed: Option<Vec<Ref>>,
}

impl Default for WorkFilter {
    fn default() -> Self {
        Self {
            scope: "**".to_string(),
            changed: None,
        }
    }
}

impl WorkFilter {
    pub fn scoped(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            changed: None,
        }
    }

    pub fn with_changed(mut self, changed: Vec<Ref>) -> Self {
        self.changed = Some(changed);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WorkOutcome {
    Applied { result: ApplyOutcome },
    /// Number of functions executed
    Advanced { steps: usize },
    Reconciled { run: Ref },
    OpCompleted,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkReport {
    pub item: WorkItem,
    #[serde(flatten)]
    pub outcome: WorkOutcome,
}

impl WorkReport {
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, WorkOutcome::Failed { .. })
    }
}

/// Source checkout a work item should execute in.
type CheckoutKey = Option<(String, String)>;

#[derive(Debug)]
pub struct Worker {
    intent: RefStore,
    state: RefStore,
    tracker: ReleaseTracker,
    worktrees: Option<Arc<dyn WorktreeProvider>>,
    tracer: Tracer,
}

impl Worker {
    /// The tracker mirrors deployments into `intent`, replacing any Intent
    /// store it was built with.
    pub fn new(intent: RefStore, tracker: ReleaseTracker, tracer: Tracer) -> Self {
        Self {
            state: tracker.state().clone(),
            tracker: tracker.with_intent(intent.clone()),
            intent,
            worktrees: None,
            tracer,
        }
    }

    pub fn with_worktrees(mut self, worktrees: Arc<dyn WorktreeProvider>) -> Self {
        self.worktrees = Some(worktrees);
        self
    }

    pub fn tracker(&self) -> &ReleaseTracker {
        &self.tracker
    }

    /// Everything that could be done now within `filter`.
    pub fn identify_work(&self, filter: &WorkFilter) -> anyhow::Result<Vec<WorkItem>> {
        let span = self.tracer.span("identify_work");
        let _guard = span.enter();

        let mut work: Vec<WorkItem> = diff(&self.intent, &self.state, &filter.scope)?
            .into_iter()
            .map(|entry| WorkItem::new(WorkType::Intent(entry.change), entry.reference))
            .collect();
        work.extend(
            self.ready_runs(&filter.scope, filter.changed.as_deref())?
                .into_iter()
                .map(|run| WorkItem::new(WorkType::Run, run)),
        );
        work.extend(
            self.reconcilable_deployments(&filter.scope)?
                .into_iter()
                .map(|record| WorkItem::new(WorkType::Reconcile, record)),
        );
        work.extend(
            self.state
                .match_refs(&format!("{}/@?*/op/*", filter.scope))?
                .into_iter()
                .map(|op| WorkItem::new(WorkType::Op, op)),
        );
        info!(scope = %filter.scope, items = work.len(), "identified work");
        Ok(work)
    }

    /// Pending or paused runs that could execute now, optionally only those
    /// touching a ref in `changed`.
    pub fn ready_runs(&self, scope: &str, changed: Option<&[Ref]>) -> anyhow::Result<Vec<Ref>> {
        let pattern = format!("{}/@?*/{{deploy,task}}/*/*", scope);
        let mut ready = Vec::new();
        for (run_ref, _) in self
            .state
            .match_status(&pattern, &[Status::Pending, Status::Paused])?
        {
            let run = load_run(&self.state, &run_ref)?;
            if let Some(changed) = changed
                && !touches_any(&run_ref, &run, changed)
            {
                continue;
            }
            if ready_inputs(&self.state, &run_ref, &run)?.is_some() {
                ready.push(run_ref);
            }
        }
        debug!(scope, ready = ready.len(), "ready runs");
        Ok(ready)
    }

    /// Deploy records whose completed run would now see different inputs.
    ///
    /// Inputs that read the deployment's own documents are ignored. Deployments
    /// with outstanding runs are skipped.
    pub fn reconcilable_deployments(&self, scope: &str) -> anyhow::Result<Vec<Ref>> {
        let mut out = Vec::new();
        for record_ref in self.state.match_refs(&format!("{}/+*/deploy/*", scope))? {
            let record: DeployRecord = match self.state.get_as(&record_ref) {
                Ok(record) => record,
                Err(err) => {
                    warn!(reference = %record_ref, error = %format!("{:#}", err), "unreadable deploy record");
                    continue;
                }
            };
            if self.state.status(&record.run)? != Some(Status::Complete) {
                continue;
            }
            let Some(work_ref) = record.run.parent() else {
                continue;
            };
            if self.state.status(&work_ref)?.is_some_and(|s| s.is_outstanding()) {
                continue;
            }
            let run = load_run(&self.state, &record.run)?;
            if drifted(&self.state, &record.run, &run)? {
                debug!(reference = %record_ref, run = %record.run, "inputs drifted");
                out.push(record_ref);
            }
        }
        Ok(out)
    }

    /// Execute `work` in place. Failures are reported per item, not returned.
    pub fn execute_work(&self, work: &[WorkItem]) -> Vec<WorkReport> {
        self.execute_in(work, None)
    }

    fn execute_in(&self, work: &[WorkItem], work_dir: Option<&Path>) -> Vec<WorkReport> {
        let span = self.tracer.span("execute_work");
        let _guard = span.enter();
        work.iter()
            .map(|item| {
                let outcome = match self.execute_item(item, work_dir) {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        let error = format!("{:#}", err);
                        warn!(kind = %item.kind, reference = %item.reference, error = %error, "work failed");
                        WorkOutcome::Failed { error }
                    }
                };
                WorkReport {
                    item: item.clone(),
                    outcome,
                }
            })
            .collect()
    }

    /// Execute `work` grouped by the source checkout it belongs to, each group
    /// inside a fresh worktree at the release's commit.
    pub fn execute_work_in_clean_worktrees(&self, work: &[WorkItem]) -> Vec<WorkReport> {
        let mut groups: Vec<(CheckoutKey, Vec<WorkItem>)> = Vec::new();
        for item in work {
            let key = self.checkout_key(item);
            match groups.iter_mut().find(|(existing, _)| *existing == key) {
                Some((_, items)) => items.push(item.clone()),
                None => groups.push((key, vec![item.clone()])),
            }
        }

        let mut reports = Vec::new();
        for (key, items) in groups {
            let (Some((repo, commit)), Some(provider)) = (&key, &self.worktrees) else {
                if key.is_some() {
                    warn!(items = items.len(), "no worktree provider configured, executing in place");
                }
                reports.extend(self.execute_in(&items, None));
                continue;
            };
            match provider.checkout(repo, commit) {
                Ok(worktree) => {
                    info!(repo = %repo, commit = %commit, path = %worktree.path().display(), items = items.len(), "executing in worktree");
                    reports.extend(self.execute_in(&items, Some(worktree.path())));
                }
                Err(err) => {
                    let error = format!("{:#}", err);
                    warn!(repo = %repo, commit = %commit, error = %error, "failed to create worktree");
                    reports.extend(items.into_iter().map(|item| WorkReport {
                        item,
                        outcome: WorkOutcome::Failed {
                            error: error.clone(),
                        },
                    }));
                }
            }
        }
        reports
    }

    /// Identify then execute everything within `filter`.
    pub fn trigger_work(&self, filter: &WorkFilter) -> anyhow::Result<Vec<WorkReport>> {
        let span = self.tracer.span("trigger_work");
        let _guard = span.enter();
        let work = self.identify_work(filter)?;
        let reports = self.execute_work_in_clean_worktrees(&work);
        let failed = reports.iter().filter(|report| report.is_failure()).count();
        info!(items = reports.len(), failed, "triggered work");
        Ok(reports)
    }

    fn execute_item(&self, item: &WorkItem, work_dir: Option<&Path>) -> anyhow::Result<WorkOutcome> {
        match item.kind {
            WorkType::Intent(_) => {
                let result = apply_intent(&self.intent, &self.state, &item.reference)?;
                if let ApplyOutcome::RunQueued(run_ref) = &result {
                    self.advance(run_ref, work_dir)?;
                }
                Ok(WorkOutcome::Applied { result })
            }
            WorkType::Run => Ok(WorkOutcome::Advanced {
                steps: self.advance(&item.reference, work_dir)?,
            }),
            WorkType::Reconcile => {
                let run = self.redeploy(&item.reference)?;
                self.advance(&run, work_dir)?;
                Ok(WorkOutcome::Reconciled { run })
            }
            WorkType::Op => {
                self.execute_op(&item.reference)?;
                Ok(WorkOutcome::OpCompleted)
            }
        }
    }

    /// Execute `run_ref` until it stops being ready.
    fn advance(&self, run_ref: &Ref, work_dir: Option<&Path>) -> anyhow::Result<usize> {
        let mut steps = 0;
        while self.tracker.advance_run(run_ref, work_dir)? {
            steps += 1;
        }
        Ok(steps)
    }

    /// Queue a fresh up run with the recorded deployment's entry function.
    fn redeploy(&self, record_ref: &Ref) -> anyhow::Result<Ref> {
        let record: DeployRecord = self.state.get_as(record_ref)?;
        let previous = load_run(&self.state, &record.run)?;
        let entry = previous
            .entry()
            .ok_or_else(|| anyhow::anyhow!("Run {} has no functions", record.run))?
            .fresh_copy();
        let work_ref = record
            .run
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Deploy record {} names no run", record_ref))?;

        let tx = self.state.start_transaction();
        let run = Run::new(RunType::Up, record.release.clone(), entry);
        let run_ref = create_run(&tx, &work_ref, &run)?;
        tx.set(
            record_ref,
            "deploy",
            &DeployRecord {
                release: record.release,
                run: run_ref.clone(),
            },
        )?;
        tx.commit(&format!("Reconcile {} via {}", record_ref, run_ref))?;
        info!(reference = %record_ref, run = %run_ref, "queued reconcile run");
        Ok(run_ref)
    }

    fn execute_op(&self, op_ref: &Ref) -> anyhow::Result<()> {
        match op_ref.name() {
            Some(CHECK_ENVS_OP) => {
                let release = op_ref.release_ref();
                let mut info = release_info(&self.state, &release)?;
                let environments: Vec<String> = info
                    .work()
                    .filter(|work| work.sub_path_type == SubPathType::Deploy)
                    .filter_map(|work| work.name().map(str::to_string))
                    .collect();
                info.missing_environments =
                    missing_environments(&self.state, &info.package, environments)?;

                let tx = self.state.start_transaction();
                tx.set(&release, "release", &info)?;
                tx.delete(op_ref)?;
                tx.commit(&format!("Check environments of {}", release))?;
                debug!(%release, missing = ?info.missing_environments, "checked environments");
                Ok(())
            }
            _ => anyhow::bail!("Unknown op {}", op_ref),
        }
    }

    /// Repo and commit whose source `item` should run against, if any.
    fn checkout_key(&self, item: &WorkItem) -> CheckoutKey {
        let release = match self.release_of(item) {
            Ok(Some(release)) => release,
            Ok(None) => return None,
            Err(err) => {
                debug!(reference = %item.reference, error = %format!("{:#}", err), "no release for work item");
                return None;
            }
        };
        match release_info(&self.state, &release) {
            Ok(info) if !info.package.repo.is_empty() => Some((info.package.repo, info.commit)),
            Ok(_) => None,
            Err(err) => {
                debug!(%release, error = %format!("{:#}", err), "release info unavailable");
                None
            }
        }
    }

    fn release_of(&self, item: &WorkItem) -> anyhow::Result<Option<Ref>> {
        match item.kind {
            WorkType::Run | WorkType::Op => Ok(Some(item.reference.release_ref())),
            WorkType::Reconcile => {
                let record: DeployRecord = self.state.get_as(&item.reference)?;
                Ok(Some(record.release))
            }
            WorkType::Intent(_) if item.reference.sub_path_type == SubPathType::Deploy => {
                match self.intent.get_as::<DeployIntent>(&item.reference) {
                    Ok(declared) => resolve_release(
                        &self.state,
                        &declared.release.relative_to(&item.reference),
                    )
                    .map(Some),
                    Err(err) if is_not_found(&err) => {
                        // Removed intent: the teardown runs against the deployed release.
                        let record: DeployRecord = self
                            .state
                            .get_as(&item.reference)
                            .with_context(|| format!("No deploy record for {}", item.reference))?;
                        Ok(Some(record.release))
                    }
                    Err(err) => Err(err),
                }
            }
            WorkType::Intent(_) => Ok(None),
        }
    }
}

/// Whether the run's entry inputs resolve differently now than when it ran.
fn drifted(state: &RefStore, run_ref: &Ref, run: &Run) -> anyhow::Result<bool> {
    let Some(entry) = run.entry() else {
        return Ok(false);
    };
    let Some(recorded) = &entry.resolved_inputs else {
        return Ok(false);
    };
    let inputs: Inputs = entry
        .inputs
        .iter()
        .filter(|(_, input)| {
            !input
                .reference
                .as_ref()
                .is_some_and(|reference| is_own_deployment(&reference.relative_to(run_ref), run_ref))
        })
        .map(|(name, input)| (name.clone(), input.clone()))
        .collect();
    let Resolution::Resolved(current) = resolve_inputs(state, run_ref, &inputs)? else {
        return Ok(false);
    };
    let previous: BTreeMap<&String, &Value> = recorded
        .iter()
        .filter(|(name, _)| current.contains_key(*name))
        .collect();
    Ok(previous != current.iter().collect::<BTreeMap<_, _>>())
}

/// `reference` reads the deployment `run_ref` belongs to, in any release.
fn is_own_deployment(reference: &Ref, run_ref: &Ref) -> bool {
    let Some(environment) = run_ref.parent().and_then(|work| work.name().map(str::to_string)) else {
        return false;
    };
    reference.package_prefix() == run_ref.package_prefix()
        && reference.sub_path_type == SubPathType::Deploy
        && (reference.sub_path == environment
            || reference.sub_path.starts_with(&format!("{}/", environment)))
}

/// Whether the run depends on, reads, or is one of `changed`.
fn touches_any(run_ref: &Ref, run: &Run, changed: &[Ref]) -> bool {
    let mut touched = vec![run_ref.path()];
    if let Some(current) = run.current() {
        touched.extend(current.dependencies.iter().map(Ref::path));
        touched.extend(
            current
                .inputs
                .values()
                .filter_map(|input| input.reference.as_ref())
                .map(|reference| reference.relative_to(run_ref).path()),
        );
    }
    changed.iter().map(Ref::path).any(|changed| {
        touched.iter().any(|path| {
            *path == changed
                || path.starts_with(&format!("{}/", changed))
                || changed.starts_with(&format!("{}/", path))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{
        Deployment, FunctionContext, FunctionDef, FunctionRunner, Package, Phase, Work, WorkResult,
    };
    use crate::run::{Function, InputDescriptor, transition};
    use serde_json::json;

    fn r(s: &str) -> Ref {
        Ref::parse(s).expect("ref should parse")
    }

    fn worker() -> Worker {
        let runner: Arc<dyn FunctionRunner> = Arc::new(
            |_: &FunctionDef, _: &FunctionContext| -> anyhow::Result<WorkResult> {
                Ok(WorkResult::default())
            },
        );
        let tracker = ReleaseTracker::new(RefStore::in_memory(), runner, Tracer::disabled());
        Worker::new(RefStore::in_memory(), tracker, Tracer::disabled())
    }

    #[test]
    fn own_deployment_refs_are_detected() {
        let run_ref = r("repo/-/pkg/@abc/deploy/prod/1");
        assert!(is_own_deployment(&r("repo/-/pkg/@/deploy/prod/outputs"), &run_ref));
        assert!(is_own_deployment(&r("repo/-/pkg/@old/deploy/prod"), &run_ref));
        assert!(!is_own_deployment(&r("repo/-/pkg/@/deploy/production"), &run_ref));
        assert!(!is_own_deployment(&r("repo/-/pkg/+/custom/prod"), &run_ref));
        assert!(!is_own_deployment(&r("repo/-/other/@/deploy/prod"), &run_ref));
    }

    #[test]
    fn changed_filter_matches_inputs_and_descendants() {
        let run_ref = r("repo/-/pkg/@abc/deploy/prod/1");
        let mut inputs = Inputs::new();
        inputs.insert(
            "region".to_string(),
            InputDescriptor::from_ref(r("+/custom/region#name")),
        );
        let run = Run::new(
            RunType::Up,
            r("repo/-/pkg/@abc"),
            Function::new(FunctionDef::new("up"), inputs),
        );
        assert!(touches_any(&run_ref, &run, &[r("repo/-/pkg/+/custom/region")]));
        assert!(touches_any(&run_ref, &run, &[r("repo/-/pkg/+/custom")]));
        assert!(!touches_any(&run_ref, &run, &[r("repo/-/pkg/+/custom/zone")]));
        assert!(touches_any(&run_ref, &run, &[run_ref.clone()]));
    }

    #[test]
    fn drift_compares_recorded_inputs() {
        let state = RefStore::in_memory();
        let run_ref = r("repo/-/pkg/@abc/deploy/prod/1");
        state
            .set(&r("repo/-/pkg/+/custom/size"), "custom", &json!(2))
            .expect("set should succeed");
        let mut inputs = Inputs::new();
        inputs.insert("size".to_string(), InputDescriptor::from_ref(r("+/custom/size")));
        inputs.insert(
            "previous".to_string(),
            InputDescriptor::from_ref(r("@/deploy/prod/outputs")).with_default(json!(null)),
        );
        let mut function = Function::new(FunctionDef::new("up"), inputs);
        function.resolved_inputs = Some(BTreeMap::from([
            ("size".to_string(), json!(2)),
            ("previous".to_string(), json!({"url": "x"})),
        ]));
        let run = Run::new(RunType::Up, r("repo/-/pkg/@abc"), function);

        assert!(!drifted(&state, &run_ref, &run).expect("drift should succeed"));
        state
            .set(&r("repo/-/pkg/+/custom/size"), "custom", &json!(3))
            .expect("set should succeed");
        assert!(drifted(&state, &run_ref, &run).expect("drift should succeed"));
    }

    #[test]
    fn unknown_ops_fail_without_aborting_the_batch() {
        let worker = worker();
        let op = r("repo/-/pkg/@abc/op/defragment");
        worker
            .state
            .set(&op, "op", &json!({}))
            .expect("set should succeed");
        let reports = worker.execute_work(&[
            WorkItem::new(WorkType::Op, op.clone()),
            WorkItem::new(WorkType::Run, r("repo/-/pkg/@abc/task/missing/1")),
        ]);
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(WorkReport::is_failure));
    }

    #[test]
    fn paused_runs_wait_for_their_inputs() {
        let worker = worker();
        let work_ref = r("repo/-/pkg/@abc/task/report");
        let mut inputs = Inputs::new();
        inputs.insert("data".to_string(), InputDescriptor::from_ref(r("+/custom/data")));
        let run = Run::new(
            RunType::Call,
            r("repo/-/pkg/@abc"),
            Function::new(FunctionDef::new("report"), inputs),
        );
        let run_ref = create_run(&worker.state, &work_ref, &run).expect("create should succeed");
        transition(&worker.state, &run_ref, Status::Running).expect("transition should succeed");
        transition(&worker.state, &run_ref, Status::Paused).expect("transition should succeed");

        assert!(worker.ready_runs("**", None).expect("ready should succeed").is_empty());
        worker
            .state
            .set(&r("repo/-/pkg/+/custom/data"), "custom", &json!([1, 2]))
            .expect("set should succeed");
        assert_eq!(
            worker.ready_runs("**", None).expect("ready should succeed"),
            vec![run_ref]
        );
    }

    #[test]
    fn deployments_run_by_the_worker_stay_converged() {
        let worker = worker();
        let package = Package {
            phases: vec![Phase {
                name: String::new(),
                work: vec![Work::Deployment(Deployment {
                    environment: "staging".to_string(),
                    up: FunctionDef::new("up"),
                    down: None,
                    inputs: Inputs::new(),
                })],
            }],
        };
        let release = worker
            .tracker()
            .init_release(&Ref::package("repo", "pkg"), "abc", &package)
            .expect("init should succeed");

        let reports = worker
            .trigger_work(&WorkFilter::default())
            .expect("trigger should succeed");
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, WorkOutcome::Advanced { steps: 1 });

        let mirrored: DeployIntent = worker
            .intent
            .get_as(&r("repo/-/pkg/+/deploy/staging"))
            .expect("deploy intent should be mirrored");
        assert_eq!(mirrored.release, release);
        assert!(
            worker
                .identify_work(&WorkFilter::default())
                .expect("identify should succeed")
                .is_empty()
        );
    }
}
