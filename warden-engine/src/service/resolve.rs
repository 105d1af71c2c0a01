//! Start request resolution
//!
//! Turns a [`StartJob`] into the recorded command line and the list of
//! steps the orchestrator will run.

use super::job::JobError;
use super::pipeline::PlannedStep;
use crate::sandbox::CommandLine;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use warden_core::domain::job::JobKind;
use warden_core::domain::pipeline::{OnError, PipelineSpec, PipelineStep};
use warden_core::domain::policy::SecurityPolicy;
use warden_core::dto::job::StartJob;

/// Pipeline file looked up when the request names none
pub const DEFAULT_PIPELINE_FILE: &str = ".warden/pipeline.yaml";

/// Project deploy script run by `deploy` jobs when present
pub const DEPLOY_SCRIPT: &str = "scripts/deploy.sh";

/// Resolved form of a start request
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Recorded on the job row
    pub cmd: String,
    pub args: Vec<String>,
    /// Environment for every step: caller env over pipeline env
    pub env: HashMap<String, String>,
    pub on_error: OnError,
    pub steps: Vec<PlannedStep>,
}

/// Lowercases and replaces every run of characters outside `[a-z0-9._-]` with `-`
pub fn sanitize_project(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_run = false;
    for c in raw.trim().to_lowercase().chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('-');
            in_run = true;
        }
    }
    out
}

/// Validates the project id and locates its working tree
pub fn project_root(projects_dir: &Path, raw: &str) -> Result<(String, PathBuf), JobError> {
    let project = sanitize_project(raw);
    if project.is_empty() || project == "." || project == ".." {
        return Err(JobError::InvalidRequest(format!(
            "invalid project id '{}'",
            raw
        )));
    }

    let root = projects_dir.join(&project);
    if !root.is_dir() {
        return Err(JobError::ProjectNotFound(project));
    }
    Ok((project, root))
}

pub async fn resolve(
    req: &StartJob,
    project: &str,
    root: &Path,
    deploy_root: &Path,
    policy: &SecurityPolicy,
) -> Result<Resolution, JobError> {
    if req.kind == JobKind::Pipeline {
        let path = pipeline_path(root, req.pipeline_ref.as_deref())?;
        let pipeline = match load_pipeline(&path).await? {
            Some(pipeline) => pipeline,
            None => {
                tracing::debug!(
                    "No pipeline file at {}, using the default pipeline",
                    path.display()
                );
                default_pipeline(project, deploy_root)
            }
        };
        return Ok(from_pipeline(pipeline, &req.env));
    }

    let (cmd, args) = match req.cmd.as_deref().map(str::trim) {
        Some(cmd) if !cmd.is_empty() => (cmd.to_string(), req.args.clone()),
        _ => {
            let script = kind_script(req, project, root, deploy_root)?;
            shell_invocation(policy, script)
        }
    };

    let mut argv = vec![cmd.clone()];
    argv.extend(args.iter().cloned());
    let step = PipelineStep {
        name: Some(req.kind.as_str().to_string()),
        ..Default::default()
    };

    Ok(Resolution {
        cmd,
        args,
        env: req.env.clone(),
        on_error: OnError::Stop,
        steps: vec![PlannedStep {
            step,
            command: CommandLine::Argv(argv),
            weight: 100.0,
        }],
    })
}

fn from_pipeline(pipeline: PipelineSpec, caller_env: &HashMap<String, String>) -> Resolution {
    let weights = pipeline.normalized_weights();
    let mut env = pipeline.env.clone();
    env.extend(caller_env.iter().map(|(k, v)| (k.clone(), v.clone())));

    let steps = pipeline
        .steps
        .into_iter()
        .zip(weights)
        .map(|(step, weight)| PlannedStep {
            command: CommandLine::Shell(step.command().to_string()),
            step,
            weight,
        })
        .collect();

    Resolution {
        cmd: String::new(),
        args: Vec::new(),
        env,
        on_error: pipeline.on_error,
        steps,
    }
}

fn pipeline_path(root: &Path, pipeline_ref: Option<&str>) -> Result<PathBuf, JobError> {
    let relative = Path::new(
        pipeline_ref
            .filter(|r| !r.trim().is_empty())
            .unwrap_or(DEFAULT_PIPELINE_FILE),
    );

    let escapes = relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, Component::ParentDir));
    if escapes {
        return Err(JobError::InvalidRequest(format!(
            "pipeline file must stay inside the project: {}",
            relative.display()
        )));
    }

    Ok(root.join(relative))
}

/// `Ok(None)` when the file does not exist
async fn load_pipeline(path: &Path) -> Result<Option<PipelineSpec>, JobError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(JobError::InvalidRequest(format!(
                "failed to read pipeline {}: {}",
                path.display(),
                e
            )));
        }
    };

    let malformed = |reason: String| {
        JobError::InvalidRequest(format!("malformed pipeline {}: {}", path.display(), reason))
    };

    if text.trim().is_empty() {
        return Err(malformed("file is empty".to_string()));
    }
    let pipeline: PipelineSpec = serde_yaml::from_str(&text).map_err(|e| malformed(e.to_string()))?;
    if pipeline.steps.is_empty() {
        return Err(malformed("no steps defined".to_string()));
    }
    if let Some((index, step)) = pipeline
        .steps
        .iter()
        .enumerate()
        .find(|(_, s)| !s.weight.is_finite() || s.weight < 0.0)
    {
        return Err(malformed(format!(
            "step {} has invalid weight {}",
            step.display_name(index),
            step.weight
        )));
    }
    Ok(Some(pipeline))
}

/// Built-in build then deploy pipeline
pub fn default_pipeline(project: &str, deploy_root: &Path) -> PipelineSpec {
    let build = PipelineStep {
        name: Some("build".to_string()),
        cmd: Some("npm run build || true".to_string()),
        weight: 60.0,
        writes: vec!["dist/**".into(), "build/**".into(), "*.log".into()],
        ..Default::default()
    };
    let deploy = PipelineStep {
        name: Some("deploy".to_string()),
        cmd: Some(deploy_command(project, deploy_root)),
        weight: 40.0,
        binds: vec!["apps_rw".into()],
        writes: vec!["public/**".into(), "*.log".into()],
        ..Default::default()
    };

    PipelineSpec {
        steps: vec![build, deploy],
        on_error: OnError::Stop,
        env: HashMap::new(),
    }
}

fn deploy_command(project: &str, deploy_root: &Path) -> String {
    let target = shell_quote(&format!("{}/{}", deploy_root.display(), project));
    format!(
        "mkdir -p {target} && rsync -a --delete public/ {target}/",
        target = target
    )
}

fn kind_script(
    req: &StartJob,
    project: &str,
    root: &Path,
    deploy_root: &Path,
) -> Result<String, JobError> {
    let script = match req.kind {
        JobKind::Deploy => {
            if root.join(DEPLOY_SCRIPT).is_file() {
                format!("chmod +x {0} && ./{0}", DEPLOY_SCRIPT)
            } else {
                deploy_command(project, deploy_root)
            }
        }
        JobKind::Test => "npm test || echo \"no tests\"".to_string(),
        JobKind::Build => "npm run build || echo \"no build\"".to_string(),
        JobKind::Custom | JobKind::Pipeline => match req.script.as_deref().map(str::trim) {
            Some(script) if !script.is_empty() => script.to_string(),
            _ => {
                return Err(JobError::InvalidRequest(
                    "custom job requires cmd or script".to_string(),
                ));
            }
        },
    };
    Ok(script)
}

/// `(shell, [flags..., script])` from the policy shell
fn shell_invocation(policy: &SecurityPolicy, script: String) -> (String, Vec<String>) {
    match CommandLine::Shell(script).to_argv(policy).split_first() {
        Some((shell, rest)) => (shell.clone(), rest.to_vec()),
        None => (String::new(), Vec::new()),
    }
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_policy() -> SecurityPolicy {
        serde_yaml::from_str("runner: host\nshell: [/bin/sh, -c]\n").unwrap()
    }

    fn request(kind: JobKind) -> StartJob {
        StartJob {
            project: "site".into(),
            kind,
            ..Default::default()
        }
    }

    #[test]
    fn test_sanitize_project() {
        assert_eq!(sanitize_project("My Site!!"), "my-site-");
        assert_eq!(sanitize_project("blog_v2.prod"), "blog_v2.prod");
        assert_eq!(sanitize_project("a/../b"), "a-..-b");
        assert_eq!(sanitize_project("  "), "");
    }

    #[test]
    fn test_project_root_rejects_escapes_and_missing_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("site")).unwrap();

        let (project, root) = project_root(dir.path(), "Site").unwrap();
        assert_eq!(project, "site");
        assert_eq!(root, dir.path().join("site"));

        assert!(matches!(
            project_root(dir.path(), ".."),
            Err(JobError::InvalidRequest(_))
        ));
        assert!(matches!(
            project_root(dir.path(), "blog"),
            Err(JobError::ProjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_explicit_command_runs_as_argv() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(JobKind::Custom);
        req.cmd = Some("make".into());
        req.args = vec!["all".into()];

        let res = resolve(&req, "site", dir.path(), Path::new("/var/www"), &host_policy())
            .await
            .unwrap();
        assert_eq!(res.cmd, "make");
        assert_eq!(res.args, vec!["all".to_string()]);
        assert_eq!(res.steps.len(), 1);
        assert_eq!(res.steps[0].weight, 100.0);
        assert_eq!(
            res.steps[0].command,
            CommandLine::Argv(vec!["make".into(), "all".into()])
        );
    }

    #[tokio::test]
    async fn test_kind_defaults_run_through_policy_shell() {
        let dir = tempfile::tempdir().unwrap();
        let res = resolve(&request(JobKind::Test), "site", dir.path(), Path::new("/var/www"), &host_policy())
            .await
            .unwrap();

        assert_eq!(res.cmd, "/bin/sh");
        assert_eq!(res.args, vec!["-c".to_string(), "npm test || echo \"no tests\"".to_string()]);
    }

    #[tokio::test]
    async fn test_deploy_prefers_project_script() {
        let dir = tempfile::tempdir().unwrap();
        let policy = host_policy();
        let deploy_root = Path::new("/var/www/apps");

        let res = resolve(&request(JobKind::Deploy), "site", dir.path(), deploy_root, &policy)
            .await
            .unwrap();
        assert_eq!(
            res.args[1],
            "mkdir -p '/var/www/apps/site' && rsync -a --delete public/ '/var/www/apps/site'/"
        );

        std::fs::create_dir(dir.path().join("scripts")).unwrap();
        std::fs::write(dir.path().join(DEPLOY_SCRIPT), "#!/bin/sh\n").unwrap();
        let res = resolve(&request(JobKind::Deploy), "site", dir.path(), deploy_root, &policy)
            .await
            .unwrap();
        assert_eq!(res.args[1], "chmod +x scripts/deploy.sh && ./scripts/deploy.sh");
    }

    #[tokio::test]
    async fn test_custom_without_cmd_or_script_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve(&request(JobKind::Custom), "site", dir.path(), Path::new("/"), &host_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidRequest(_)));

        let mut req = request(JobKind::Custom);
        req.script = Some("echo hi".into());
        let res = resolve(&req, "site", dir.path(), Path::new("/"), &host_policy())
            .await
            .unwrap();
        assert_eq!(res.args, vec!["-c".to_string(), "echo hi".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_pipeline_file_uses_default_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let res = resolve(&request(JobKind::Pipeline), "site", dir.path(), Path::new("/var/www/apps"), &host_policy())
            .await
            .unwrap();

        let names: Vec<String> = res
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| s.step.display_name(i))
            .collect();
        assert_eq!(names, vec!["build".to_string(), "deploy".to_string()]);
        assert_eq!(res.steps[0].weight, 60.0);
        assert_eq!(res.steps[1].weight, 40.0);
        assert_eq!(res.cmd, "");
    }

    #[tokio::test]
    async fn test_pipeline_file_is_loaded_with_env_layering() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".warden")).unwrap();
        std::fs::write(
            dir.path().join(DEFAULT_PIPELINE_FILE),
            r#"
on_error: continue
env:
  STAGE: ci
  MODE: pipeline
steps:
  - cmd: echo one
    weight: 1
  - name: two
    weight: 3
"#,
        )
        .unwrap();

        let mut req = request(JobKind::Pipeline);
        req.env = HashMap::from([("MODE".to_string(), "caller".to_string())]);
        let res = resolve(&req, "site", dir.path(), Path::new("/"), &host_policy())
            .await
            .unwrap();

        assert_eq!(res.on_error, OnError::Continue);
        assert_eq!(res.env.get("STAGE").map(String::as_str), Some("ci"));
        assert_eq!(res.env.get("MODE").map(String::as_str), Some("caller"));
        assert_eq!(res.steps[0].command, CommandLine::Shell("echo one".into()));
        assert_eq!(res.steps[1].command, CommandLine::Shell("true".into()));
        assert_eq!(res.steps[0].weight, 25.0);
        assert_eq!(res.steps[1].weight, 75.0);
    }

    #[tokio::test]
    async fn test_malformed_or_escaping_pipeline_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.yaml"), "steps: [unclosed").unwrap();

        let mut req = request(JobKind::Pipeline);
        req.pipeline_ref = Some("bad.yaml".into());
        let err = resolve(&req, "site", dir.path(), Path::new("/"), &host_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidRequest(_)));

        req.pipeline_ref = Some("../other/pipeline.yaml".into());
        let err = resolve(&req, "site", dir.path(), Path::new("/"), &host_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_negative_weights_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("weights.yaml"),
            "steps:\n  - cmd: \"true\"\n    weight: 50\n  - cmd: \"true\"\n    weight: -50\n",
        )
        .unwrap();

        let mut req = request(JobKind::Pipeline);
        req.pipeline_ref = Some("weights.yaml".into());
        let err = resolve(&req, "site", dir.path(), Path::new("/"), &host_policy())
            .await
            .unwrap_err();
        match err {
            JobError::InvalidRequest(msg) => assert!(msg.contains("invalid weight -50"), "{}", msg),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
