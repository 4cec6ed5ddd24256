use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use serde_json::{Value, json};
use tempfile::TempDir;
use wiremock::matchers::{method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sbomflow::checkout::{Checkout, LocalDirCheckout, LocalRepository};
use sbomflow::event::{PullRequestAction, PullRequestEvent, PushEvent, Repository, User};
use sbomflow::orchestrator::comment::MARKER;
use sbomflow::orchestrator::{Completion, SkipReason};
use sbomflow::repo_config::RepoConfig;
use sbomflow::reporting::VulnerabilityReport;
use sbomflow::sbom::HostEnvironment;
use sbomflow::settings::Settings;
use sbomflow::tracking::Project;
use sbomflow::{EventOutcome, Orchestrator};

const NAMED_GENERATOR: &str = r#"for last; do :; done
printf '{"bomFormat":"CycloneDX","specVersion":"1.4","metadata":{"component":{"group":"acme","name":"%s","version":"1.0"}},"components":[]}' "$last" > sbom.json
"#;

const SCORER: &str = "echo \"7.5 $3\"\n";

/// Fails for the `web` sub-project and generates every other one.
const WEB_FAILING_GENERATOR: &str = r#"for last; do :; done
case "$last" in *-web) exit 1;; esac
printf '{"bomFormat":"CycloneDX","specVersion":"1.4","metadata":{"component":{"group":"acme","name":"%s","version":"1.0"}},"components":[]}' "$last" > sbom.json
"#;

/// Copies like `LocalDirCheckout` and remembers where each checkout went.
struct RecordingCheckout {
    inner: LocalDirCheckout,
    paths: Arc<Mutex<Vec<PathBuf>>>,
}

#[async_trait]
impl Checkout for RecordingCheckout {
    async fn checkout(&self, repository: &Repository, git_ref: &str) -> anyhow::Result<LocalRepository> {
        let local = self.inner.checkout(repository, git_ref).await?;
        self.paths.lock().unwrap().push(local.path().to_path_buf());
        Ok(local)
    }
}

struct Fixture {
    tools: TempDir,
    source: TempDir,
    dtrack: MockServer,
    github: MockServer,
}

impl Fixture {
    async fn new(generator_script: &str) -> Self {
        let tools = tempfile::tempdir().unwrap();
        std::fs::write(tools.path().join("fake-cdxgen.sh"), generator_script).unwrap();
        std::fs::write(tools.path().join("fake-sbomqs.sh"), SCORER).unwrap();
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("README.md"), "widgets").unwrap();
        Self {
            tools,
            source,
            dtrack: MockServer::start().await,
            github: MockServer::start().await,
        }
    }

    fn tool(&self, name: &str) -> PathBuf {
        self.tools.path().join(name)
    }

    fn settings(&self) -> Settings {
        let mut settings = Settings::default();
        settings.generator.command = format!("sh {}", self.tool("fake-cdxgen.sh").display());
        settings.reporting.sbomqs_command = format!("sh {}", self.tool("fake-sbomqs.sh").display());
        settings.dtrack.url = self.dtrack.uri();
        settings.dtrack.api_key = "key".into();
        settings.github.api_url = self.github.uri();
        settings
    }

    fn orchestrator(&self, settings: Settings) -> Orchestrator {
        self.orchestrator_with(settings, LocalDirCheckout::new(self.source.path()))
    }

    fn orchestrator_with(&self, settings: Settings, checkout: impl Checkout + 'static) -> Orchestrator {
        Orchestrator::builder(settings)
            .checkout(checkout)
            .host_environment(HostEnvironment::from_vars(Vec::<(String, String)>::new()))
            .build()
    }

    /// Orchestrator whose checkouts are recorded in the returned list.
    fn recording_orchestrator(&self, settings: Settings) -> (Orchestrator, Arc<Mutex<Vec<PathBuf>>>) {
        let paths = Arc::new(Mutex::new(vec![]));
        let checkout = RecordingCheckout {
            inner: LocalDirCheckout::new(self.source.path()),
            paths: paths.clone(),
        };
        (self.orchestrator_with(settings, checkout), paths)
    }

    async fn mount_pull_request_comments(&self) {
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/pulls"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&self.github)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/widgets/issues/42/comments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&self.github)
            .await;
        Mock::given(method("POST"))
            .and(path("/repos/acme/widgets/issues/42/comments"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&self.github)
            .await;
    }

    fn mkdir(&self, dir: &str) {
        std::fs::create_dir_all(self.source.path().join(dir)).unwrap();
    }

    async fn mount_dtrack_lifecycle(&self) {
        Mock::given(method("PUT"))
            .and(path("/api/v1/bom"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "t" })))
            .mount(&self.dtrack)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/project"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&self.dtrack)
            .await;
        for name in ["widgets", "widgets-api", "widgets-web"] {
            Mock::given(method("GET"))
                .and(path("/api/v1/project/lookup"))
                .and(query_param("name", name))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "uuid": format!("{name}-id"),
                    "description": "#abc1234# Widgets",
                })))
                .mount(&self.dtrack)
                .await;
        }
        Mock::given(method("PATCH"))
            .and(path_regex(r"^/api/v1/project/[^/]+$"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&self.dtrack)
            .await;
    }

    async fn mount_statuses(&self) {
        Mock::given(method("POST"))
            .and(path_regex(r"^/repos/acme/widgets/statuses/.+$"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&self.github)
            .await;
    }

    async fn requests_to(server: &MockServer, http_method: &str, request_path: &str) -> Vec<Value> {
        server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.method.as_str() == http_method && r.url.path() == request_path)
            .map(|r| serde_json::from_slice(&r.body).unwrap_or(Value::Null))
            .collect()
    }
}

fn repository() -> Repository {
    Repository {
        full_name: "acme/widgets".into(),
        default_branch: "main".into(),
        description: Some("Widgets".into()),
        html_url: "https://github.com/acme/widgets".into(),
        vcs_url: "git://github.com/acme/widgets.git".into(),
        topics: vec!["rust".into()],
    }
}

fn two_modules() -> Option<RepoConfig> {
    RepoConfig::from_yaml(
        r#"
projects:
  - project: { name: api }
    analysis: { location: api }
  - project: { name: web }
    analysis: { location: web }
"#,
    )
    .unwrap()
}

fn push(config: Option<RepoConfig>) -> PushEvent {
    PushEvent {
        repository: repository(),
        git_ref: "refs/heads/main".into(),
        commit_sha: Some("abc1234567".into()),
        config,
    }
}

fn user(login: &str, kind: &str) -> User {
    User {
        login: login.into(),
        name: None,
        kind: kind.into(),
    }
}

fn pull_request(action: PullRequestAction) -> PullRequestEvent {
    PullRequestEvent {
        repository: repository(),
        action,
        number: 42,
        head_ref: "feature".into(),
        head_sha: "fff0000".into(),
        sender: user("octocat", "User"),
        author: user("octocat", "User"),
        config: None,
    }
}

fn project_of(outcome: EventOutcome) -> Project {
    match outcome {
        EventOutcome::Completed {
            completion: Completion::Project { project },
        } => project,
        other => panic!("expected a project, got {other:?}"),
    }
}

#[tokio::test]
async fn push_single_module_uploads_once_and_reports_success() {
    let fixture = Fixture::new(NAMED_GENERATOR).await;
    fixture.mount_dtrack_lifecycle().await;
    fixture.mount_statuses().await;
    let orchestrator = fixture.orchestrator(fixture.settings());

    let outcome = orchestrator.handle_push(&push(None)).await.unwrap();

    let project = project_of(outcome);
    assert_eq!(project.id(), Some("widgets-id"));

    let uploads = Fixture::requests_to(&fixture.dtrack, "PUT", "/api/v1/bom").await;
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0]["projectName"], "widgets");
    assert_eq!(uploads[0]["projectVersion"], "main");
    assert!(Fixture::requests_to(&fixture.dtrack, "PUT", "/api/v1/project").await.is_empty());

    let described = Fixture::requests_to(&fixture.dtrack, "PATCH", "/api/v1/project/widgets-id").await;
    assert_eq!(described.len(), 1);
    assert_eq!(
        described[0]["tags"],
        json!([{ "name": "rust" }, { "name": "sbom-quality-score=7.5" }])
    );

    let statuses = Fixture::requests_to(&fixture.github, "POST", "/repos/acme/widgets/statuses/abc1234567").await;
    let states: Vec<&str> = statuses.iter().map(|s| s["state"].as_str().unwrap()).collect();
    assert_eq!(states, vec!["pending", "success"]);
    assert_eq!(statuses[1]["description"], "SBOM available");
    assert!(orchestrator.tasks().is_empty());
}

#[tokio::test]
async fn push_two_modules_groups_under_parent_and_lists() {
    let fixture = Fixture::new(NAMED_GENERATOR).await;
    fixture.mkdir("api");
    fixture.mkdir("web");
    fixture.mount_dtrack_lifecycle().await;
    fixture.mount_statuses().await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/project"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "uuid": "parent-id" })))
        .expect(1)
        .mount(&fixture.dtrack)
        .await;

    let orchestrator = fixture.orchestrator(fixture.settings());

    let outcome = orchestrator.handle_push(&push(two_modules())).await.unwrap();

    assert_eq!(
        project_of(outcome),
        Project::List {
            search_url: format!("{}/projects?searchText=widgets", fixture.dtrack.uri()),
        }
    );
    let uploads = Fixture::requests_to(&fixture.dtrack, "PUT", "/api/v1/bom").await;
    assert_eq!(uploads.len(), 2);
    assert!(uploads.iter().all(|u| u["parentUUID"] == "parent-id"));
    let mut names: Vec<&str> = uploads.iter().map(|u| u["projectName"].as_str().unwrap()).collect();
    names.sort();
    assert_eq!(names, vec!["widgets-api", "widgets-web"]);

    let statuses = Fixture::requests_to(&fixture.github, "POST", "/repos/acme/widgets/statuses/abc1234567").await;
    assert_eq!(statuses.last().unwrap()["description"], "SBOMs available");
}

#[tokio::test]
async fn push_with_failed_upload_writes_error_status() {
    let fixture = Fixture::new(NAMED_GENERATOR).await;
    fixture.mount_statuses().await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/bom"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&fixture.dtrack)
        .await;
    let orchestrator = fixture.orchestrator(fixture.settings());

    assert!(orchestrator.handle_push(&push(None)).await.is_err());

    let statuses = Fixture::requests_to(&fixture.github, "POST", "/repos/acme/widgets/statuses/abc1234567").await;
    let last = statuses.last().unwrap();
    assert_eq!(last["state"], "error");
    assert_eq!(last["description"], "SBOM creation failed: Dependency-Track returned HTTP 503");
    assert!(orchestrator.tasks().is_empty());
}

#[tokio::test]
async fn pull_request_without_sbom_comments_once_and_skips_tracking() {
    let fixture = Fixture::new("exit 1\n").await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/widgets/pulls"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "number": 42, "head": { "ref": "feature", "sha": "fff0000" } },
        ])))
        .mount(&fixture.github)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/widgets/issues/42/comments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&fixture.github)
        .await;
    Mock::given(method("POST"))
        .and(path("/repos/acme/widgets/issues/42/comments"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&fixture.github)
        .await;
    let orchestrator = fixture.orchestrator(fixture.settings());

    let outcome = orchestrator
        .handle_pull_request(&pull_request(PullRequestAction::Synchronize))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        EventOutcome::Completed {
            completion: Completion::Report {
                report: VulnerabilityReport::None
            }
        }
    );
    let comments = Fixture::requests_to(&fixture.github, "POST", "/repos/acme/widgets/issues/42/comments").await;
    let body = comments[0]["body"].as_str().unwrap();
    assert!(body.contains("No SBOM available"));
    assert!(body.ends_with(MARKER));
    assert!(fixture.dtrack.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn repeated_pull_request_updates_the_same_comment() {
    let fixture = Fixture::new("exit 1\n").await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/widgets/pulls"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&fixture.github)
        .await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/widgets/issues/42/comments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": 7, "body": format!("earlier report\n\n{MARKER}") },
        ])))
        .mount(&fixture.github)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/repos/acme/widgets/issues/comments/7"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&fixture.github)
        .await;
    Mock::given(method("POST"))
        .and(path("/repos/acme/widgets/issues/42/comments"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&fixture.github)
        .await;
    let orchestrator = fixture.orchestrator(fixture.settings());

    for _ in 0..2 {
        orchestrator
            .handle_pull_request(&pull_request(PullRequestAction::Opened))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn concurrent_identical_pushes_run_once() {
    let fixture = Fixture::new(&format!("sleep 1\n{NAMED_GENERATOR}")).await;
    fixture.mount_dtrack_lifecycle().await;
    fixture.mount_statuses().await;
    let orchestrator = Arc::new(fixture.orchestrator(fixture.settings()));

    let event = push(None);
    let (first, second) = tokio::join!(orchestrator.handle_push(&event), orchestrator.handle_push(&event));
    let outcomes = [first.unwrap(), second.unwrap()];

    assert_eq!(
        outcomes.iter().filter(|o| **o == EventOutcome::AlreadyRunning).count(),
        1
    );
    assert_eq!(Fixture::requests_to(&fixture.dtrack, "PUT", "/api/v1/bom").await.len(), 1);
    assert!(orchestrator.tasks().is_empty());
}

#[tokio::test]
async fn gated_events_have_no_side_effects() {
    let fixture = Fixture::new(NAMED_GENERATOR).await;
    let mut settings = fixture.settings();
    settings.app.enabled_repos = vec!["gadgets".into()];
    let orchestrator = fixture.orchestrator(settings);
    assert_eq!(
        orchestrator.handle_push(&push(None)).await.unwrap(),
        EventOutcome::Skipped {
            reason: SkipReason::RepositoryNotEnabled
        }
    );

    let orchestrator = fixture.orchestrator(fixture.settings());
    let mut feature_push = push(None);
    feature_push.git_ref = "refs/heads/feature".into();
    assert!(matches!(
        orchestrator.handle_push(&feature_push).await.unwrap(),
        EventOutcome::Skipped {
            reason: SkipReason::NotDefaultBranch { .. }
        }
    ));

    let disabled = RepoConfig::from_yaml("enable: false\n").unwrap();
    assert_eq!(
        orchestrator.handle_push(&push(disabled)).await.unwrap(),
        EventOutcome::Skipped {
            reason: SkipReason::DisabledByConfig
        }
    );

    let mut bot_pr = pull_request(PullRequestAction::Opened);
    bot_pr.sender = user("dependabot[bot]", "Bot");
    assert!(matches!(
        orchestrator.handle_pull_request(&bot_pr).await.unwrap(),
        EventOutcome::Skipped {
            reason: SkipReason::BotUser { .. }
        }
    ));

    assert!(matches!(
        orchestrator
            .handle_pull_request(&pull_request(PullRequestAction::Other))
            .await
            .unwrap(),
        EventOutcome::Skipped {
            reason: SkipReason::IgnoredAction { .. }
        }
    ));

    assert!(fixture.dtrack.received_requests().await.unwrap().is_empty());
    assert!(fixture.github.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn analysis_timeout_is_reported_as_failure() {
    let fixture = Fixture::new(&format!("sleep 5\n{NAMED_GENERATOR}")).await;
    fixture.mount_statuses().await;
    let mut settings = fixture.settings();
    settings.app.analysis_timeout_secs = 1;
    let orchestrator = fixture.orchestrator(settings);

    let err = orchestrator.handle_push(&push(None)).await.unwrap_err();
    assert!(err.to_string().contains("timed out"));

    let statuses = Fixture::requests_to(&fixture.github, "POST", "/repos/acme/widgets/statuses/abc1234567").await;
    assert_eq!(statuses.last().unwrap()["state"], "failure");
    assert_eq!(statuses.last().unwrap()["description"], "SBOM analysis timed out");
    assert!(orchestrator.tasks().is_empty());
}

#[tokio::test]
async fn parent_project_failure_still_uploads_sub_projects() {
    let fixture = Fixture::new(NAMED_GENERATOR).await;
    fixture.mkdir("api");
    fixture.mkdir("web");
    fixture.mount_dtrack_lifecycle().await;
    fixture.mount_statuses().await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/project"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&fixture.dtrack)
        .await;
    let orchestrator = fixture.orchestrator(fixture.settings());

    let outcome = orchestrator.handle_push(&push(two_modules())).await.unwrap();

    assert!(matches!(project_of(outcome), Project::List { .. }));
    let uploads = Fixture::requests_to(&fixture.dtrack, "PUT", "/api/v1/bom").await;
    assert_eq!(uploads.len(), 2);
    assert!(uploads.iter().all(|u| u["parentUUID"].is_null()));

    let statuses = Fixture::requests_to(&fixture.github, "POST", "/repos/acme/widgets/statuses/abc1234567").await;
    assert_eq!(statuses.last().unwrap()["state"], "success");
}

#[tokio::test]
async fn failing_sub_project_does_not_stop_its_siblings() {
    let fixture = Fixture::new(WEB_FAILING_GENERATOR).await;
    fixture.mkdir("api");
    fixture.mkdir("web");
    fixture.mount_dtrack_lifecycle().await;
    fixture.mount_statuses().await;
    let orchestrator = fixture.orchestrator(fixture.settings());

    let err = orchestrator.handle_push(&push(two_modules())).await.unwrap_err();
    assert!(format!("{err:#}").contains("1 of 2 sub-projects failed"), "unexpected error: {err:#}");

    let uploads = Fixture::requests_to(&fixture.dtrack, "PUT", "/api/v1/bom").await;
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0]["projectName"], "widgets-api");

    let statuses = Fixture::requests_to(&fixture.github, "POST", "/repos/acme/widgets/statuses/abc1234567").await;
    assert_eq!(statuses.last().unwrap()["state"], "error");
    assert!(orchestrator.tasks().is_empty());
}

#[tokio::test]
async fn checkout_is_removed_after_failed_analysis() {
    let fixture = Fixture::new(NAMED_GENERATOR).await;
    fixture.mount_statuses().await;
    let (orchestrator, checkouts) = fixture.recording_orchestrator(fixture.settings());

    let escaping = RepoConfig::from_yaml("analysis:\n  excludes:\n    - ../secrets\n").unwrap();
    assert!(orchestrator.handle_push(&push(escaping)).await.is_err());

    let checkouts = checkouts.lock().unwrap().clone();
    assert_eq!(checkouts.len(), 1);
    assert!(!checkouts[0].exists(), "{} left behind", checkouts[0].display());
}

#[tokio::test]
async fn checkout_is_removed_after_timeout() {
    let fixture = Fixture::new(&format!("sleep 5\n{NAMED_GENERATOR}")).await;
    fixture.mount_statuses().await;
    let mut settings = fixture.settings();
    settings.app.analysis_timeout_secs = 1;
    let (orchestrator, checkouts) = fixture.recording_orchestrator(settings);

    assert!(orchestrator.handle_push(&push(None)).await.is_err());

    let checkouts = checkouts.lock().unwrap().clone();
    assert_eq!(checkouts.len(), 1);
    assert!(!checkouts[0].exists(), "{} left behind", checkouts[0].display());
}

#[tokio::test]
async fn push_runs_while_pull_request_of_same_commit_is_analysed() {
    let fixture = Fixture::new(&format!("sleep 1\n{NAMED_GENERATOR}")).await;
    fixture.mount_dtrack_lifecycle().await;
    fixture.mount_statuses().await;
    fixture.mount_pull_request_comments().await;
    let orchestrator = fixture.orchestrator(fixture.settings());

    let mut pr = pull_request(PullRequestAction::Synchronize);
    pr.head_ref = "main".into();
    pr.head_sha = "abc1234567".into();
    let event = push(None);
    let (pr_outcome, push_outcome) = tokio::join!(orchestrator.handle_pull_request(&pr), async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        orchestrator.handle_push(&event).await
    });

    assert!(matches!(pr_outcome.unwrap(), EventOutcome::Completed { .. }));
    assert_eq!(project_of(push_outcome.unwrap()).id(), Some("widgets-id"));
    assert_eq!(Fixture::requests_to(&fixture.dtrack, "PUT", "/api/v1/bom").await.len(), 1);
    assert!(orchestrator.tasks().is_empty());
    assert!(orchestrator.pull_request_tasks().is_empty());
}
