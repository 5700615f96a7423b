//! Release initialization and progression.
//!
//! A release turns a [`Package`] into work documents under `@<release>` with one
//! pending run per work item, then advances those runs through the injected
//! [`FunctionRunner`] until nothing more can run.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::{is_not_found, not_found};
use crate::package::{
    Deployment, Done, FunctionContext, FunctionRunner, Outcome, Package, Work,
};
use crate::refs::{ReleaseOrIntent, Ref, SubPathType};
use crate::run::{
    Function, Resolution, Run, RunType, create_run, latest_run_ref, load_run, ready_inputs,
    resolve_inputs, save_run, transition,
};
use crate::state::{DeployIntent, DeployRecord, overrides};
use crate::status::Status;
use crate::store::{RefAccess, RefStore};
use crate::telemetry::Tracer;

/// Hex digits kept from the release hash.
const RELEASE_ID_LEN: usize = 12;

/// The release document stored at `@<release>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseInfo {
    pub id: String,
    /// `<repo>/-/<filename>/@`
    pub package: Ref,
    pub commit: String,
    pub created_at: DateTime<Utc>,
    /// Work refs per phase, in order
    pub phases: Vec<Vec<Ref>>,
    /// Environments deployed to that State does not declare
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_environments: Vec<String>,
}

impl ReleaseInfo {
    pub fn work(&self) -> impl Iterator<Item = &Ref> {
        self.phases.iter().flatten()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkStatus {
    pub work: Ref,
    pub status: Option<Status>,
    /// Newest run of this work item
    pub run: Option<Ref>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseStatus {
    pub release: Ref,
    pub status: Status,
    pub work: Vec<WorkStatus>,
}

/// Deploy and task runs of a release.
fn run_pattern(release: &Ref) -> String {
    format!("{}/{{deploy,task}}/*/*", release.path())
}

/// Deterministic release id for a package at a commit.
pub fn release_id(package: &Ref, commit: &str) -> String {
    let hash = blake3::hash(format!("{}\n{}", package.package_prefix(), commit).as_bytes());
    hash.to_hex().as_str()[..RELEASE_ID_LEN].to_string()
}

/// Follow `@`/tag links from `release` to the concrete release root.
pub fn resolve_release(access: &impl RefAccess, release: &Ref) -> anyhow::Result<Ref> {
    let resolved = access.resolve_link(&release.release_ref())?;
    if resolved.is_latest() || resolved.is_intent() {
        return Err(not_found(release.to_string()));
    }
    Ok(resolved.release_ref())
}

pub fn release_info(access: &impl RefAccess, release: &Ref) -> anyhow::Result<ReleaseInfo> {
    access
        .get_as(&release.release_ref())
        .with_context(|| format!("Failed to load release {}", release))
}

/// Statuses of every work item of `release` and their aggregate.
pub fn release_status(access: &impl RefAccess, release: &Ref) -> anyhow::Result<ReleaseStatus> {
    let release = resolve_release(access, release)?;
    let info = release_info(access, &release)?;
    let mut work = Vec::new();
    for work_ref in info.work() {
        work.push(WorkStatus {
            work: work_ref.clone(),
            status: access.status(work_ref)?,
            run: latest_run_ref(access, work_ref)?,
        });
    }
    let status = aggregate_status(work.iter().map(|item| item.status));
    Ok(ReleaseStatus {
        release,
        status,
        work,
    })
}

/// Failures dominate, then in-flight states; an empty release is complete.
pub fn aggregate_status(statuses: impl IntoIterator<Item = Option<Status>>) -> Status {
    const PRIORITY: [Status; 6] = [
        Status::Failed,
        Status::Running,
        Status::Paused,
        Status::Pending,
        Status::Cancelled,
        Status::Complete,
    ];
    let seen: BTreeSet<Status> = statuses
        .into_iter()
        .map(|status| match status {
            None | Some(Status::FailedRetried) => Status::Pending,
            Some(status) => status,
        })
        .collect();
    PRIORITY
        .into_iter()
        .find(|status| seen.contains(status))
        .unwrap_or(Status::Complete)
}

/// Reject packages that deploy to one environment twice or reuse a task name.
pub fn validate_package(package: &Package) -> anyhow::Result<()> {
    let mut environments = BTreeSet::new();
    let mut calls = BTreeSet::new();
    for (idx, phase) in package.phases.iter().enumerate() {
        for work in &phase.work {
            match work {
                Work::Deployment(deployment) => {
                    if deployment.environment.is_empty() {
                        anyhow::bail!("Phase {} has a deployment without an environment", idx + 1);
                    }
                    if !environments.insert(deployment.environment.as_str()) {
                        anyhow::bail!(
                            "Environment '{}' is deployed to more than once",
                            deployment.environment
                        );
                    }
                }
                Work::Call(call) => {
                    if call.name.is_empty() {
                        anyhow::bail!("Phase {} has a task without a name", idx + 1);
                    }
                    if !calls.insert(call.name.as_str()) {
                        anyhow::bail!("Task '{}' is declared more than once", call.name);
                    }
                }
            }
        }
    }
    Ok(())
}

/// Environments deployed by `release` that State has no document for.
pub fn missing_environments(
    access: &impl RefAccess,
    package: &Ref,
    environments: impl IntoIterator<Item = String>,
) -> anyhow::Result<Vec<String>> {
    let mut missing = Vec::new();
    for environment in environments {
        let env_ref = package
            .make_intent()
            .with_sub_path(SubPathType::Environment, environment.clone());
        if !access.exists(&env_ref)? {
            missing.push(environment);
        }
    }
    Ok(missing)
}

pub struct ReleaseTracker {
    state: RefStore,
    intent: Option<RefStore>,
    runner: Arc<dyn FunctionRunner>,
    tracer: Tracer,
}

impl ReleaseTracker {
    pub fn new(state: RefStore, runner: Arc<dyn FunctionRunner>, tracer: Tracer) -> Self {
        Self {
            state,
            intent: None,
            runner,
            tracer,
        }
    }

    /// Also mirror deploy intents into `intent` when deploy runs start.
    pub fn with_intent(mut self, intent: RefStore) -> Self {
        self.intent = Some(intent);
        self
    }

    pub fn state(&self) -> &RefStore {
        &self.state
    }

    /// Create a release of `package` at `commit`, or return the release that
    /// already exists for that commit.
    pub fn init_release(
        &self,
        package_ref: &Ref,
        commit: &str,
        package: &Package,
    ) -> anyhow::Result<Ref> {
        let span = self.tracer.span("init_release");
        let _guard = span.enter();
        validate_package(package)?;
        if commit.is_empty() || !commit.chars().all(|c| c.is_ascii_alphanumeric()) {
            anyhow::bail!("Invalid commit '{}'", commit);
        }
        let package_ref = package_ref.package_ref();

        let existing = self.state.match_refs(&format!(
            "{}/@?*/commit/{}",
            package_ref.package_prefix(),
            commit
        ))?;
        if let Some(marker) = existing.first() {
            let release = marker.release_ref();
            info!(%release, commit, "release already exists for commit");
            return Ok(release);
        }

        let id = release_id(&package_ref, commit);
        let release = package_ref.make_release(id.clone());
        let tx = self.state.start_transaction();

        let mut phases = Vec::new();
        let mut environments = Vec::new();
        let mut previous: Vec<Ref> = Vec::new();
        for phase in &package.phases {
            let mut current = Vec::new();
            for work in &phase.work {
                let (work_ref, run) = match work {
                    Work::Deployment(deployment) => {
                        let work_ref = release
                            .clone()
                            .with_sub_path(SubPathType::Deploy, deployment.environment.clone());
                        tx.set(&work_ref, "deployment", deployment)?;
                        environments.push(deployment.environment.clone());
                        let entry = Function::new(deployment.up.clone(), deployment.inputs.clone())
                            .with_dependencies(previous.clone());
                        (work_ref, Run::new(RunType::Up, release.clone(), entry))
                    }
                    Work::Call(call) => {
                        let work_ref = release
                            .clone()
                            .with_sub_path(SubPathType::Task, call.name.clone());
                        tx.set(&work_ref, "call", call)?;
                        let entry = Function::new(call.function.clone(), call.inputs.clone())
                            .with_dependencies(previous.clone());
                        (work_ref, Run::new(RunType::Call, release.clone(), entry))
                    }
                };
                create_run(&tx, &work_ref, &run)?;
                current.push(work_ref);
            }
            phases.push(current.clone());
            // An empty phase gates nothing.
            if !current.is_empty() {
                previous = current;
            }
        }

        let info = ReleaseInfo {
            id: id.clone(),
            package: package_ref.clone(),
            commit: commit.to_string(),
            created_at: Utc::now(),
            phases,
            missing_environments: missing_environments(&self.state, &package_ref, environments)?,
        };
        tx.set(&release, "release", &info)?;
        tx.set(
            &release.clone().with_sub_path(SubPathType::Commit, commit),
            "commit",
            &json!({ "release": release }),
        )?;
        tx.link(&package_ref, &release)?;
        tx.commit(&format!("Init release {} of {} at {}", id, package_ref, commit))?;
        info!(%release, commit, "initialized release");
        Ok(release)
    }

    pub fn run_to_pause(&self, release: &Ref) -> anyhow::Result<ReleaseStatus> {
        self.run_to_pause_in(release, None)
    }

    /// Execute every ready run of `release`, repeatedly, until none is ready.
    /// Functions see `work_dir` as their checkout.
    pub fn run_to_pause_in(
        &self,
        release: &Ref,
        work_dir: Option<&Path>,
    ) -> anyhow::Result<ReleaseStatus> {
        let span = self.tracer.span("run_to_pause");
        let _guard = span.enter();
        let release = resolve_release(&self.state, release)?;
        loop {
            let ready = self.filtered_next_work(&release)?;
            if ready.is_empty() {
                break;
            }
            for (run_ref, run, inputs) in ready {
                self.execute_run(&run_ref, run, inputs, work_dir)?;
            }
        }
        release_status(&self.state, &release)
    }

    /// Execute one run of any release if it is ready now. Returns whether it ran.
    pub fn advance_run(&self, run_ref: &Ref, work_dir: Option<&Path>) -> anyhow::Result<bool> {
        let Some(status) = self.state.status(run_ref)? else {
            return Err(not_found(run_ref.to_string()));
        };
        if !matches!(status, Status::Pending | Status::Paused) {
            return Ok(false);
        }
        let run = load_run(&self.state, run_ref)?;
        match ready_inputs(&self.state, run_ref, &run)? {
            Some(inputs) => {
                self.execute_run(run_ref, run, inputs, work_dir)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Pending or paused runs whose dependencies are complete and whose inputs
    /// all resolve.
    fn filtered_next_work(
        &self,
        release: &Ref,
    ) -> anyhow::Result<Vec<(Ref, Run, BTreeMap<String, Value>)>> {
        let mut ready = Vec::new();
        for (run_ref, _) in self
            .state
            .match_status(&run_pattern(release), &[Status::Pending, Status::Paused])?
        {
            let run = load_run(&self.state, &run_ref)?;
            if let Some(inputs) = ready_inputs(&self.state, &run_ref, &run)? {
                ready.push((run_ref, run, inputs));
            }
        }
        debug!(%release, ready = ready.len(), "next work");
        Ok(ready)
    }

    fn execute_run(
        &self,
        run_ref: &Ref,
        mut run: Run,
        inputs: BTreeMap<String, Value>,
        work_dir: Option<&Path>,
    ) -> anyhow::Result<()> {
        let span = self.tracer.span("execute_run");
        let _guard = span.enter();
        transition(&self.state, run_ref, Status::Running)?;

        let tx = self.state.start_transaction();
        let is_entry = run.functions.len() == 1;
        let Some(current) = run.current_mut() else {
            anyhow::bail!("Run {} has no functions", run_ref);
        };
        current.resolved_inputs = Some(inputs.clone());
        let function = current.function.clone();
        if is_entry && run.run_type == RunType::Up {
            self.mirror_deploy(&tx, run_ref, &run)?;
        }

        let context = FunctionContext {
            run: run_ref.clone(),
            release: run.release.clone(),
            run_type: run.run_type,
            inputs,
            work_dir: work_dir.map(PathBuf::from),
            span: span.clone(),
        };
        info!(run = %run_ref, function = %function.id, "executing function");
        let outcome = match self.runner.run(&function, &context) {
            Ok(result) => result.outcome(),
            Err(err) => Outcome::Failed(format!("{:#}", err)),
        };

        let status = match outcome {
            Outcome::Next(next) => {
                let step = Function::new(next.function, next.inputs);
                let status = match resolve_inputs(&tx, run_ref, &step.inputs)? {
                    Resolution::Resolved(_) => Status::Pending,
                    Resolution::Unresolved(missing) => {
                        info!(run = %run_ref, ?missing, "pausing until inputs exist");
                        Status::Paused
                    }
                };
                run.functions.push(step);
                status
            }
            Outcome::Done(done) => {
                self.complete_run(&tx, run_ref, &mut run, done)?;
                Status::Complete
            }
            Outcome::Failed(message) => {
                warn!(run = %run_ref, error = %message, "function failed");
                run.error = Some(message);
                Status::Failed
            }
        };
        save_run(&tx, run_ref, &run)?;
        transition(&tx, run_ref, status)?;
        tx.commit(&format!("Run {}: {}", run_ref, status))?;
        info!(run = %run_ref, %status, "run advanced");
        Ok(())
    }

    /// Record that `run_ref` realises its deployment: the State deploy record and,
    /// when configured, the matching Intent record.
    fn mirror_deploy(&self, access: &impl RefAccess, run_ref: &Ref, run: &Run) -> anyhow::Result<()> {
        let Some(work_ref) = run_ref.parent() else {
            return Ok(());
        };
        let Some(environment) = work_ref.name() else {
            return Ok(());
        };
        let deployment: Deployment = access.get_as(&work_ref)?;
        let Some(entry) = run.entry() else {
            return Ok(());
        };
        if entry.function != deployment.up {
            // A retried later step, not the start of a deployment.
            return Ok(());
        }
        let record_ref = work_ref
            .package_ref()
            .make_intent()
            .with_sub_path(SubPathType::Deploy, environment);
        access.set(
            &record_ref,
            "deploy",
            &DeployRecord {
                release: run.release.clone(),
                run: run_ref.clone(),
            },
        )?;

        let Some(intent) = &self.intent else {
            return Ok(());
        };
        let mirrored = DeployIntent {
            release: run.release.clone(),
            inputs: overrides(&deployment.inputs, &entry.inputs),
        };
        let current = match intent.get_as::<DeployIntent>(&record_ref) {
            Ok(current) => Some(current),
            Err(err) if is_not_found(&err) => None,
            Err(err) => return Err(err),
        };
        if current.as_ref() != Some(&mirrored) {
            intent.set(&record_ref, "deploy", &mirrored)?;
            debug!(reference = %record_ref, "mirrored deploy intent");
        }
        Ok(())
    }

    fn complete_run(
        &self,
        access: &impl RefAccess,
        run_ref: &Ref,
        run: &mut Run,
        done: Done,
    ) -> anyhow::Result<()> {
        run.outputs.extend(done.outputs);
        run.error = None;
        let Some(work_ref) = run_ref.parent() else {
            return Ok(());
        };
        access.set(&work_ref.join_sub_path("outputs"), "outputs", &run.outputs)?;

        let latest = work_ref.make_release("");
        match run.run_type {
            RunType::Up => access.link(&latest, &work_ref)?,
            RunType::Down => {
                if access.resolve_link(&latest)? == work_ref {
                    access.unlink(&latest)?;
                }
            }
            RunType::Call => {}
        }

        for tag in done.tags {
            if tag.is_empty() || tag.contains(['/', '#']) {
                warn!(run = %run_ref, tag = %tag, "ignoring invalid release tag");
                continue;
            }
            let tag_ref = run
                .release
                .package_ref()
                .with_release(ReleaseOrIntent::Release(tag));
            if let Err(err) = access.link(&tag_ref, &run.release) {
                warn!(run = %run_ref, tag = %tag_ref, error = %format!("{:#}", err), "failed to tag release");
            }
        }
        Ok(())
    }

    /// Start a fresh attempt for every failed run of `release`, then continue it.
    pub fn retry(&self, release: &Ref) -> anyhow::Result<ReleaseStatus> {
        self.retry_in(release, None)
    }

    pub fn retry_in(&self, release: &Ref, work_dir: Option<&Path>) -> anyhow::Result<ReleaseStatus> {
        let span = self.tracer.span("retry");
        let _guard = span.enter();
        let release = resolve_release(&self.state, release)?;
        let failed = self
            .state
            .match_status(&run_pattern(&release), &[Status::Failed])?;

        if !failed.is_empty() {
            let tx = self.state.start_transaction();
            for (run_ref, _) in &failed {
                let run = load_run(&tx, run_ref)?;
                let work_ref = run_ref
                    .parent()
                    .ok_or_else(|| anyhow::anyhow!("Run {} has no work ref", run_ref))?;
                let last = run
                    .current()
                    .ok_or_else(|| anyhow::anyhow!("Run {} has no functions", run_ref))?
                    .fresh_copy();
                let mut retried = Run::new(run.run_type, run.release.clone(), last);
                retried.outputs = run.outputs.clone();
                transition(&tx, run_ref, Status::FailedRetried)?;
                let new_ref = create_run(&tx, &work_ref, &retried)?;
                info!(failed = %run_ref, retry = %new_ref, "retrying run");
            }
            tx.commit(&format!("Retry {} failed runs of {}", failed.len(), release))?;
        }
        self.run_to_pause_in(&release, work_dir)
    }

    pub fn release_status(&self, release: &Ref) -> anyhow::Result<ReleaseStatus> {
        release_status(&self.state, release)
    }

    pub fn get_release_info(&self, release: &Ref) -> anyhow::Result<ReleaseInfo> {
        release_info(&self.state, release)
    }
}

impl std::fmt::Debug for ReleaseTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseTracker")
            .field("state", &self.state)
            .field("intent", &self.intent)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{FunctionDef, Phase, WorkCall, WorkResult};

    fn deploy(env: &str) -> Work {
        Work::Deployment(Deployment {
            environment: env.to_string(),
            up: FunctionDef::new(format!("up_{}", env)),
            down: None,
            inputs: Default::default(),
        })
    }

    #[test]
    fn validation_rejects_repeated_environments() {
        let package = Package {
            phases: vec![
                Phase {
                    name: "one".to_string(),
                    work: vec![deploy("staging")],
                },
                Phase {
                    name: "two".to_string(),
                    work: vec![deploy("staging")],
                },
            ],
        };
        assert!(validate_package(&package).is_err());

        let package = Package {
            phases: vec![Phase {
                name: String::new(),
                work: vec![
                    Work::Call(WorkCall {
                        name: "migrate".to_string(),
                        function: FunctionDef::new("m"),
                        inputs: Default::default(),
                    }),
                    Work::Call(WorkCall {
                        name: "migrate".to_string(),
                        function: FunctionDef::new("m"),
                        inputs: Default::default(),
                    }),
                ],
            }],
        };
        assert!(validate_package(&package).is_err());
    }

    #[test]
    fn aggregate_prefers_failures_then_activity() {
        assert_eq!(aggregate_status([]), Status::Complete);
        assert_eq!(
            aggregate_status([Some(Status::Complete), Some(Status::Pending)]),
            Status::Pending
        );
        assert_eq!(
            aggregate_status([Some(Status::Running), Some(Status::Failed)]),
            Status::Failed
        );
        assert_eq!(aggregate_status([None]), Status::Pending);
    }

    #[test]
    fn duplicate_commit_returns_existing_release() {
        let state = RefStore::in_memory();
        let runner: Arc<dyn FunctionRunner> =
            Arc::new(
                |_: &FunctionDef, _: &FunctionContext| -> anyhow::Result<WorkResult> {
                    Ok(WorkResult::default())
                },
            );
        let tracker = ReleaseTracker::new(state, runner, Tracer::disabled());
        let package = Package {
            phases: vec![Phase {
                name: String::new(),
                work: vec![deploy("staging")],
            }],
        };
        let pkg = Ref::package("repo", "pkg");
        let first = tracker
            .init_release(&pkg, "abc123", &package)
            .expect("init should succeed");
        let second = tracker
            .init_release(&pkg, "abc123", &package)
            .expect("init should succeed");
        assert_eq!(first, second);
        assert_eq!(
            tracker
                .get_release_info(&pkg)
                .expect("info should succeed")
                .missing_environments,
            vec!["staging".to_string()]
        );
    }

    #[test]
    fn runner_errors_fail_the_run() {
        let runner: Arc<dyn FunctionRunner> = Arc::new(
            |_: &FunctionDef, _: &FunctionContext| -> anyhow::Result<WorkResult> {
                anyhow::bail!("exploded")
            },
        );
        let tracker = ReleaseTracker::new(RefStore::in_memory(), runner, Tracer::disabled());
        let package = Package {
            phases: vec![Phase {
                name: String::new(),
                work: vec![deploy("staging"), deploy("prod")],
            }],
        };
        let release = tracker
            .init_release(&Ref::package("repo", "pkg"), "c1", &package)
            .expect("init should succeed");
        let status = tracker.run_to_pause(&release).expect("run should succeed");
        assert_eq!(status.status, Status::Failed);
        assert!(status.work.iter().all(|w| w.status == Some(Status::Failed)));

        let run = load_run(tracker.state(), &release.clone().with_sub_path(SubPathType::Deploy, "staging/1"))
            .expect("run should load");
        assert_eq!(run.error.as_deref(), Some("exploded"));
    }

    #[test]
    fn empty_phase_keeps_the_previous_gate() {
        let calls = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = calls.clone();
        let runner: Arc<dyn FunctionRunner> = Arc::new(
            move |function: &FunctionDef, _: &FunctionContext| -> anyhow::Result<WorkResult> {
                seen.lock().expect("lock should succeed").push(function.id.clone());
                Ok(WorkResult::err("staging is down"))
            },
        );
        let tracker = ReleaseTracker::new(RefStore::in_memory(), runner, Tracer::disabled());
        let package = Package {
            phases: vec![
                Phase {
                    name: "staging".to_string(),
                    work: vec![deploy("staging")],
                },
                Phase {
                    name: "gate".to_string(),
                    work: Vec::new(),
                },
                Phase {
                    name: "production".to_string(),
                    work: vec![deploy("prod")],
                },
            ],
        };
        let release = tracker
            .init_release(&Ref::package("repo", "pkg"), "c1", &package)
            .expect("init should succeed");

        let staging = release.clone().with_sub_path(SubPathType::Deploy, "staging");
        let prod_run = release.clone().with_sub_path(SubPathType::Deploy, "prod/1");
        assert_eq!(
            tracker
                .state()
                .get_dependencies(&prod_run)
                .expect("dependencies should load"),
            vec![staging]
        );

        let status = tracker.run_to_pause(&release).expect("run should succeed");
        assert_eq!(status.status, Status::Failed);
        assert_eq!(*calls.lock().expect("lock should succeed"), vec!["up_staging"]);
        assert_eq!(
            tracker.state().status(&prod_run).expect("status should load"),
            Some(Status::Pending)
        );
    }

    #[test]
    fn release_ids_are_stable_hex() {
        let pkg = Ref::package("repo", "pkg");
        let id = release_id(&pkg, "abc");
        assert_eq!(id.len(), RELEASE_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, release_id(&pkg, "abc"));
        assert_ne!(id, release_id(&pkg, "abd"));
    }
}
